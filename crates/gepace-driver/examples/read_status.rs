use std::env;

use gepace_core::config::ConfigBuilder;
use gepace_core::utils::box_future;

use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize the logger
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::DEBUG)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Configuration file first, then GEPACE__* environment variables
    let path = env::args().nth(1).unwrap_or_else(|| "gepace.toml".to_string());
    let config = ConfigBuilder::new()
        .with_config_file(&path)
        .with_environment_prefix("GEPACE")
        .build()?;

    let device = gepace_driver::connect(&config).await?;
    info!("Identity: {}", device.identity().await?.value()?);
    info!("Error queue: {:?}", device.error().await?.value()?);

    // Pressure and barometric reference of channel A in a single transmission
    let replies = device
        .grouped(|d| {
            box_future(async move {
                let channel = d.channel('A')?;
                channel.pressure().await?;
                channel.barometric_pressure().await?;
                Ok(())
            })
        })
        .await?;
    for reading in replies.iter() {
        info!("Reading: {}", reading);
    }

    for (name, value) in device.control_loop(1)?.snapshot().await? {
        info!("loop 1 {} = {}", name, value);
    }
    info!("Transmissions: {}", device.stats().await.transmissions);

    Ok(())
}
