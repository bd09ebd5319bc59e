/*!
 * gepace Driver
 *
 * This crate provides the command dispatch and batching layer for GE Druck
 * PACE pressure controllers: address registry, command codec, rate limited
 * dispatcher with grouped mode, entity proxies and transports.
 */

#![warn(missing_docs)]

// Re-export core types
pub use gepace_core::prelude;

pub mod blocking;
pub mod codec;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod group;
pub mod limiter;
pub mod protocol;
pub mod registry;
pub mod simulator;
pub mod transports;

pub use codec::{Command, Encoder, Target};
pub use device::{Channel, Device, ErrorStatus, InLimits, Loop, Mode, Pending, RateMode, Reply, StartupMode};
pub use dispatcher::{DispatchOptions, Dispatched, Dispatcher, Group};
pub use error::{DeviceError, Result};
pub use group::{GroupReplies, Placeholder};
pub use protocol::{Blocking, SyncTransport, Transport};
pub use registry::{AddressRegistry, DeviceModel, EntityKind};

use gepace_core::config::Config;
use gepace_core::logging::component_span;
use tracing::{info, Instrument};

use transports::TcpTransport;

/// gepace driver crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build the address registry described by the `[model]` section
///
/// The model document at `model.path` (or the built-in PACE5000 model) is
/// loaded first, then the channel and loop overrides are applied.
pub fn registry_from_config(config: &Config) -> Result<AddressRegistry> {
    let section = &config.model;
    let mut model = match &section.path {
        Some(path) => DeviceModel::from_path(path)?,
        None => DeviceModel::default(),
    };

    if !section.channels.is_empty() {
        let letters = section
            .channels
            .iter()
            .map(|name| {
                let mut chars = name.chars();
                match (chars.next(), chars.next()) {
                    (Some(letter), None) => Ok(letter),
                    _ => Err(DeviceError::registry(format!(
                        "channel {:?} must be a single letter",
                        name
                    ))),
                }
            })
            .collect::<Result<Vec<char>>>()?;
        model = model.with_channels(letters);
    }
    if !section.loops.is_empty() {
        model = model.with_loops(section.loops.iter().copied());
    }

    AddressRegistry::new(model)
}

/// Connect to the instrument described by `config`
pub async fn connect(config: &Config) -> Result<Device> {
    let registry = registry_from_config(config)?;
    let (host, port) = config.transport.host_port()?;
    let transport = TcpTransport::connect(
        &host,
        port,
        config.transport.connect_timeout(),
        config.transport.timeout(),
    )
    .instrument(component_span("transport", Some(&config.transport.address)))
    .await
    .map_err(|e| DeviceError::transport(&config.transport.address, e))?;
    info!("Connected to {} at {}", registry.model().name, config.transport.address);
    Ok(Device::new(transport, registry, DispatchOptions::from(&config.dispatch)))
}

/// Initialize logging from `config` and report the driver version
pub fn init(config: &Config) -> Result<()> {
    gepace_core::logging::init_with_config(&config.logging)?;
    info!("gepace driver {} initialized", VERSION);
    Ok(())
}
