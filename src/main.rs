//! Screen recorder: capture, encode and mux into an MP4 until Ctrl-C

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use screencast::pipeline::Controller;
use screencast::Config;
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("screencast=debug"));
    let fmt = tracing_subscriber::fmt::layer().with_timer(tracing_subscriber::fmt::time::uptime());
    let registry = tracing_subscriber::registry().with(filter).with(fmt);

    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());

    registry.init();
}

async fn wait_for_end(max_duration: Option<Duration>) -> Result<()> {
    match max_duration {
        Some(limit) => {
            tokio::select! {
                res = tokio::signal::ctrl_c() => res?,
                _ = tokio::time::sleep(limit) => info!("maximum duration reached"),
            }
        }
        None => tokio::signal::ctrl_c().await?,
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    info!("Screencast Launching...");

    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;
    screencast::CONFIG.store(Arc::new(config.clone()));

    let pipeline = config.pipeline.clone();
    let max_duration = config.output.max_duration_secs.map(Duration::from_secs);
    let mut controller = Controller::with_defaults(config);

    let path = controller.start(pipeline.scale, pipeline.framerate, pipeline.microphone)?;
    info!("Recording to {} (Ctrl-C to stop)", path.display());

    wait_for_end(max_duration).await?;

    // Stopping joins stage threads; keep it off the runtime.
    let saved = tokio::task::spawn_blocking(move || controller.stop())
        .await
        .map_err(|e| eyre!("stop task failed: {e}"))??;

    info!("Saved {}", saved.display());
    println!("{}", saved.display());
    Ok(())
}
