use clap::Parser;
use lanwatch::{Args, DiscoveryEngine, EngineConfig};
use std::error::Error as StdError;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn StdError>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = EngineConfig::from_args(&args);

    let engine = DiscoveryEngine::new(config)?;
    let mut devices = engine.subscribe_devices();
    engine.start().await?;

    tracing::info!("Watching for devices, press Ctrl-C to stop");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            device = devices.recv() => match device {
                Some(device) => println!(
                    "{}  {:<15}  {:?}  {}",
                    device.physical_address,
                    device
                        .ip_address
                        .map(|ip| ip.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    device.device_type,
                    device.host_name.as_deref().unwrap_or("")
                ),
                None => break,
            },
        }
    }

    engine.stop().await?;
    Ok(())
}
