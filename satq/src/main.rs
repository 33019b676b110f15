use anyhow::Context;
use satq::{config, proxy::QuicProxy, telemetry};
use satq_accel::Accelerator;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::info;

/// Interval between statistics dumps in verbose mode.
const STATS_INTERVAL: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = config::load_config()?;
    telemetry::init(config.verbose);

    info!(?config, "configuration loaded");

    let accel = Arc::new(Accelerator::new(&config.device, config.simulation));
    accel
        .initialize()
        .context("failed to initialize accelerator")?;

    let proxy = QuicProxy::new(config.bind.clone(), config.port, accel.clone());
    proxy.set_acceleration_enabled(config.acceleration);
    proxy.set_verbose_logging(config.verbose);

    proxy.start().await.context("failed to start QUIC proxy")?;
    info!(
        bind = %config.bind,
        port = config.port,
        acceleration = config.acceleration,
        "proxy accepting traffic"
    );

    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut stats_tick = tokio::time::interval(STATS_INTERVAL);

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                result.context("failed to install Ctrl+C handler")?;
                break;
            }
            _ = stats_tick.tick() => {
                if config.verbose {
                    proxy.print_stats();
                }
            }
        }
    }

    info!("shutdown signal received");
    proxy.stop().await;
    accel.shutdown();
    info!("proxy shut down cleanly");

    Ok(())
}
