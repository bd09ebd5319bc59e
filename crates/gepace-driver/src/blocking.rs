/*!
 * Blocking facade.
 *
 * [`Device`] wraps the async [`crate::Device`] together with a private
 * current-thread runtime and drives every call to completion. It must not be
 * used from within an async context.
 */
use std::collections::BTreeMap;
use std::future::Future;

use tokio::runtime::Runtime;
use tracing::warn;

use gepace_core::config::Config;
use gepace_core::types::Value;
use gepace_core::utils::blocking_runtime;

use crate::codec::Target;
use crate::device::{self, ErrorStatus, FromValue, InLimits, RateMode, Reply, StartupMode};
use crate::dispatcher::{self, DispatchOptions, DispatchStats};
use crate::error::{DeviceError, Result};
use crate::group::GroupReplies;
use crate::protocol::{Blocking, SyncTransport};
use crate::registry::AddressRegistry;
use crate::transports::StdTcpTransport;

macro_rules! blocking_accessors {
    ($inner:ident; $( $(#[$meta:meta])* fn $name:ident($($arg:ident: $ty:ty),*) -> $ret:ty; )*) => {
        $(
            $(#[$meta])*
            pub fn $name(&self, $($arg: $ty),*) -> $ret {
                self.block_on(self.$inner.$name($($arg),*))
            }
        )*
    };
}

/// Blocking handle on an instrument
#[derive(Debug)]
pub struct Device {
    runtime: Runtime,
    inner: device::Device,
}

impl Device {
    /// Create a device driving a blocking transport
    pub fn new<T>(transport: T, registry: AddressRegistry, options: DispatchOptions) -> Result<Self>
    where
        T: SyncTransport + 'static,
    {
        let runtime = blocking_runtime()?;
        Ok(Self {
            runtime,
            inner: device::Device::new(Blocking::new(transport), registry, options),
        })
    }

    /// Create a device for the default model and dispatch options
    pub fn with_defaults<T>(transport: T) -> Result<Self>
    where
        T: SyncTransport + 'static,
    {
        Self::new(transport, AddressRegistry::default(), DispatchOptions::default())
    }

    /// Connect over blocking TCP as described by `config`
    pub fn connect(config: &Config) -> Result<Self> {
        let registry = crate::registry_from_config(config)?;
        let (host, port) = config.transport.host_port()?;
        let transport = StdTcpTransport::connect(
            &host,
            port,
            config.transport.connect_timeout(),
            config.transport.timeout(),
        )
        .map_err(|e| DeviceError::transport(&config.transport.address, e))?;
        Self::new(transport, registry, DispatchOptions::from(&config.dispatch))
    }

    fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    /// The async device driven by this facade
    pub fn inner(&self) -> &device::Device {
        &self.inner
    }

    /// The address registry
    pub fn registry(&self) -> &AddressRegistry {
        self.inner.registry()
    }

    /// A channel view; fails if `letter` is not defined for the model
    pub fn channel(&self, letter: char) -> Result<Channel<'_>> {
        Ok(Channel {
            runtime: &self.runtime,
            inner: self.inner.channel(letter)?,
        })
    }

    /// A control loop view; fails if `number` is not defined for the model
    pub fn control_loop(&self, number: u32) -> Result<Loop<'_>> {
        Ok(Loop {
            runtime: &self.runtime,
            inner: self.inner.control_loop(number)?,
        })
    }

    /// Open a group
    pub fn begin_group(&self) -> Result<Group<'_>> {
        Ok(Group {
            runtime: &self.runtime,
            inner: self.inner.begin_group()?,
        })
    }

    /// Run `body` inside a group and end it whatever `body` returns
    ///
    /// A failing body's error is returned in preference to a failure of the
    /// group itself.
    pub fn grouped<F>(&self, body: F) -> Result<GroupReplies>
    where
        F: FnOnce(&Device) -> Result<()>,
    {
        let group = self.begin_group()?;
        match body(self) {
            Ok(()) => group.end(),
            Err(e) => {
                if let Err(end) = group.end() {
                    warn!("Group after failed body did not complete: {}", end);
                }
                Err(e)
            }
        }
    }

    /// Read a property of any entity by name
    pub fn read_property<T: FromValue>(&self, target: &Target, property: &str) -> Result<Reply<T>> {
        self.block_on(self.inner.read_property(target, property))
    }

    /// Write a property of any entity by name
    pub fn write_property<V: Into<Value>>(&self, target: &Target, property: &str, value: V) -> Result<Reply<Value>> {
        self.block_on(self.inner.write_property(target, property, value))
    }

    blocking_accessors! { inner;
        /// Transmission counters
        fn stats() -> DispatchStats;
        /// Send an arbitrary command
        fn raw(command: &str) -> Result<Reply<Value>>;
        /// Every readable device level property, in one group
        fn snapshot() -> Result<Vec<(String, Value)>>;
        /// Identification string, cached after the first read
        fn identity() -> Result<Reply<String>>;
        /// Result of the self test
        fn hw_test() -> Result<Reply<bool>>;
        /// Next entry of the error queue
        fn error() -> Result<Reply<ErrorStatus>>;
        /// Firmware version
        fn version() -> Result<Reply<String>>;
        /// Configured world area
        fn world_area() -> Result<Reply<String>>;
        /// MAC address
        fn mac() -> Result<Reply<String>>;
        /// Running task
        fn task() -> Result<Reply<String>>;
        /// Whether the pressure output is controlling
        fn control_state() -> Result<Reply<bool>>;
        /// Switch the pressure output control on or off
        fn set_control_state(on: bool) -> Result<Reply<Value>>;
        /// Start controlling
        fn start() -> Result<Reply<Value>>;
        /// Stop controlling
        fn stop() -> Result<Reply<Value>>;
        /// State of a logic output relay (1 to 3)
        fn relay(number: u8) -> Result<Reply<bool>>;
        /// Switch a logic output relay (1 to 3)
        fn set_relay(number: u8, on: bool) -> Result<Reply<Value>>;
        /// Mode and setpoint applied at power-up
        fn startup_mode() -> Result<Reply<StartupMode>>;
        /// Change the power-up mode and setpoint
        fn set_startup_mode(startup: StartupMode) -> Result<Reply<Value>>;
        /// Serial numbers of the instrument's modules
        fn serial_numbers() -> Result<BTreeMap<String, i64>>;
        /// Discard unread input and stale replies
        fn resync() -> Result<()>;
        /// Drop every cached value
        fn clear_cache() -> ();
    }
}

/// Blocking group guard
#[derive(Debug)]
#[must_use = "a group queues commands until it is ended"]
pub struct Group<'d> {
    runtime: &'d Runtime,
    inner: dispatcher::Group<'d>,
}

impl<'d> Group<'d> {
    /// Close the group, transmit the queue and resolve every placeholder
    pub fn end(self) -> Result<GroupReplies> {
        self.runtime.block_on(self.inner.end())
    }

    /// Close the group without transmitting anything
    pub fn abort(self) {
        self.inner.abort()
    }
}

/// Blocking view on one measurement channel
#[derive(Debug, Clone)]
pub struct Channel<'d> {
    runtime: &'d Runtime,
    inner: device::Channel<'d>,
}

impl<'d> Channel<'d> {
    fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    /// Channel letter
    pub fn letter(&self) -> char {
        self.inner.letter()
    }

    blocking_accessors! { inner;
        /// Sensor temperature
        fn temperature() -> Result<Reply<f64>>;
        /// Measured pressure
        fn pressure() -> Result<Reply<f64>>;
        /// Barometric reference pressure
        fn barometric_pressure() -> Result<Reply<f64>>;
        /// Pressure unit
        fn unit() -> Result<Reply<String>>;
        /// Change the pressure unit
        fn set_unit(unit: &str) -> Result<Reply<Value>>;
        /// Selected range name
        fn range() -> Result<Reply<String>>;
        /// Select a range by name
        fn set_range(range: &str) -> Result<Reply<Value>>;
        /// Displayed resolution in digits
        fn resolution() -> Result<Reply<i64>>;
        /// Change the displayed resolution
        fn set_resolution(digits: i64) -> Result<Reply<Value>>;
        /// Sensor type
        fn sensor_type() -> Result<Reply<String>>;
        /// Measured pressure and whether it is within limits
        fn pressure_in_limits() -> Result<Reply<InLimits>>;
        /// Every readable property of the channel, in one group
        fn snapshot() -> Result<Vec<(String, Value)>>;
    }
}

/// Blocking view on one pressure control loop
#[derive(Debug, Clone)]
pub struct Loop<'d> {
    runtime: &'d Runtime,
    inner: device::Loop<'d>,
}

impl<'d> Loop<'d> {
    fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    /// Loop number
    pub fn number(&self) -> u32 {
        self.inner.number()
    }

    blocking_accessors! { inner;
        /// Channel the loop regulates
        fn source() -> Result<Reply<String>>;
        /// Select the regulated channel
        fn set_source(source: &str) -> Result<Reply<Value>>;
        /// Pressure setpoint
        fn setpoint() -> Result<Reply<f64>>;
        /// Change the pressure setpoint
        fn set_setpoint(setpoint: f64) -> Result<Reply<Value>>;
        /// Whether the loop regulates
        fn enabled() -> Result<Reply<bool>>;
        /// Enable or disable regulation
        fn set_enabled(enabled: bool) -> Result<Reply<Value>>;
        /// Controller effort in percent
        fn effort() -> Result<Reply<f64>>;
        /// Slew rate
        fn slew_rate() -> Result<Reply<f64>>;
        /// Change the slew rate
        fn set_slew_rate(rate: f64) -> Result<Reply<Value>>;
        /// Slew mode
        fn slew_mode() -> Result<Reply<RateMode>>;
        /// Change the slew mode
        fn set_slew_mode(mode: RateMode) -> Result<Reply<Value>>;
        /// Whether overshoot is allowed while slewing
        fn overshoot() -> Result<Reply<bool>>;
        /// Allow or forbid overshoot
        fn set_overshoot(allowed: bool) -> Result<Reply<Value>>;
        /// Positive supply pressure
        fn source_pressure_pos() -> Result<Reply<f64>>;
        /// Negative supply pressure
        fn source_pressure_neg() -> Result<Reply<f64>>;
        /// Enable regulation
        fn start() -> Result<Reply<Value>>;
        /// Disable regulation
        fn stop() -> Result<Reply<Value>>;
        /// Every readable property of the loop, in one group
        fn snapshot() -> Result<Vec<(String, Value)>>;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::{Simulator, DEFAULT_IDENTITY};
    use std::time::Duration;

    fn device() -> Device {
        let registry = AddressRegistry::default();
        let options = DispatchOptions {
            min_interval: Duration::from_millis(1),
            ..DispatchOptions::default()
        };
        Device::new(Simulator::new(&registry).with_value("A:TEMP", "23.5"), registry, options).unwrap()
    }

    #[test]
    fn test_blocking_reads_and_writes() {
        let device = device();
        assert_eq!(device.identity().unwrap().value().unwrap(), DEFAULT_IDENTITY);
        assert_eq!(device.channel('A').unwrap().temperature().unwrap().value().unwrap(), 23.5);

        let lp = device.control_loop(2).unwrap();
        lp.set_setpoint(1000.0).unwrap();
        assert_eq!(lp.setpoint().unwrap().value().unwrap(), 1000.0);
        assert!(matches!(device.channel('Q'), Err(DeviceError::InvalidAddress { .. })));
    }

    #[test]
    fn test_blocking_group() {
        let device = device();
        let mut temperature = None;
        let replies = device
            .grouped(|d| {
                d.hw_test()?;
                temperature = Some(d.channel('A')?.temperature()?);
                Ok(())
            })
            .unwrap();
        assert_eq!(replies.len(), 2);
        assert_eq!(temperature.unwrap().value().unwrap(), 23.5);
        assert_eq!(device.stats().transmissions, 1);

        let group = device.begin_group().unwrap();
        assert!(matches!(device.begin_group(), Err(DeviceError::GroupAlreadyActive)));
        group.abort();
    }

    #[test]
    fn test_blocking_group_sends_queue_when_body_fails() {
        let device = device();
        let mut state = None;
        let result = device.grouped(|d| {
            d.set_relay(3, true)?;
            state = Some(d.relay(3)?);
            d.control_loop(7)?;
            Ok(())
        });
        assert!(matches!(result, Err(DeviceError::InvalidAddress { .. })));
        assert!(state.unwrap().value().unwrap());
        assert_eq!(device.stats().transmissions, 1);
        assert_eq!(device.serial_numbers().unwrap().len(), 7);
    }
}
