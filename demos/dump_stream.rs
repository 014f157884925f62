use std::path::PathBuf;
use std::sync::Arc;

use anyhow::anyhow;
use clap::Parser;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::select;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn, Level};

use baichuan::camera::CameraEvent;
use baichuan::config::{RegistryConfig, Settings};
use baichuan::registry::SessionRegistry;
use baichuan::transport::UdpTransportFactory;

/// Connects to a camera from the settings file and writes its H.264 stream to a file
#[derive(Parser)]
struct Args {
    settings: PathBuf,
    camera: String,
    output: PathBuf,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let settings = Settings::load(&args.settings)?;
    let registry_config = RegistryConfig::new();
    registry_config.validate()?;

    let registry = Arc::new(SessionRegistry::new(registry_config, settings, Arc::new(UdpTransportFactory {})));
    let session = registry.start(&args.camera).await
        .ok_or_else(|| anyhow!("no camera named {} in {:?}", args.camera, args.settings))?;

    let mut events = session.subscribe();
    let mut output = File::create(&args.output).await?;
    info!("writing stream of {} to {:?}", args.camera, args.output);

    let result = select! {
        result = write_stream(&registry, &args.camera, &mut events, &mut output) => result,
        _ = tokio::signal::ctrl_c() => Ok(()),
    };

    output.flush().await?;
    registry.shut_down().await;
    result
}

async fn write_stream(registry: &SessionRegistry, camera: &str, events: &mut broadcast::Receiver<CameraEvent>, output: &mut File) -> anyhow::Result<()> {
    loop {
        match events.recv().await {
            Ok(CameraEvent::Stream(data)) => {
                output.write_all(&data).await?;
                registry.touch(camera).await;
            }
            Ok(CameraEvent::Battery(percent)) => info!("battery at {}%", percent),
            Ok(CameraEvent::Pong) => info!("pong"),
            Ok(CameraEvent::Unhandled { message_id }) => info!("unhandled message {:#x}", message_id),
            Err(RecvError::Lagged(n)) => warn!("skipped {} events", n),
            Err(RecvError::Closed) => return Err(anyhow!("session terminated")),
        }
    }
}
