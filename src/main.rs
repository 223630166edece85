use anyhow::Result;
use phoebus::config::Config;
use phoebus::controller::Controller;
use phoebus::echonet::EchonetClient;
use phoebus::logging::init_logging;
use phoebus::metrics::MetricsLogger;
use phoebus::telemetry::TelemetryReader;
use phoebus::token::{RefreshTokenSource, TokenSource};
use phoebus::vehicle::{FleetApi, VehicleClient};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid config: {}", e))?;
    init_logging(&config.logging).map_err(|e| anyhow::anyhow!("Failed to init logging: {}", e))?;

    info!(
        "Phoebus {} solar-surplus charging controller starting up",
        env!("APP_VERSION")
    );

    let timezone: chrono_tz::Tz = config
        .timezone
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid timezone: {}", e))?;

    let transport = EchonetClient::new(&config.telemetry);
    let telemetry = TelemetryReader::new(
        Box::new(transport),
        config.telemetry.read_retries,
        Duration::from_millis(config.telemetry.retry_delay_ms),
    );

    let tokens: Arc<dyn TokenSource> = Arc::new(
        RefreshTokenSource::new(&config.auth)
            .map_err(|e| anyhow::anyhow!("Failed to build token source: {}", e))?,
    );
    let api = FleetApi::new(&config.vehicle, tokens.clone())
        .map_err(|e| anyhow::anyhow!("Failed to build vehicle client: {}", e))?;
    let vehicle = VehicleClient::new(&config.vehicle, Box::new(api));

    let metrics = if config.metrics.enabled {
        Some(
            MetricsLogger::new(&config.metrics, timezone)
                .map_err(|e| anyhow::anyhow!("Failed to open metrics folder: {}", e))?,
        )
    } else {
        None
    };

    let mut controller = Controller::new(&config, telemetry, vehicle, tokens, metrics);

    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received, shutting down");
                let _ = shutdown_tx.send(()).await;
            }
            Err(e) => error!("failed to listen for shutdown signal: {}", e),
        }
    });

    controller.run(shutdown_rx).await;
    info!("Controller shutdown complete");
    Ok(())
}
