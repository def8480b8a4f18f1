use clap::Parser;
use std::path::PathBuf;
use telemetry_export::{config::Config, export::ExportService};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "telemetry-export")]
#[command(about = "Export telemetry from NATS to an MQTT broker", version)]
struct Cli {
    /// Configuration file
    #[arg(short, long, env = "EXPORT_CONFIG_FILE", default_value = telemetry_export::config::DEFAULT_FILE)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config).map_err(|e| {
        eprintln!("Failed to load configuration from {}: {}", cli.config.display(), e);
        e
    })?;

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("telemetry_export={}", config.server.log_level).into());
    let registry = tracing_subscriber::registry().with(filter);
    if config.server.json_logs {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    tracing::info!("Starting telemetry export v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Configuration: {}", config.file.display());

    telemetry_export::metrics::init_metrics();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let service = ExportService::connect(config, shutdown_rx.clone()).await?;
    tracing::info!("✅ Export service initialized");

    let mut service_handle = tokio::spawn(service.run(shutdown_rx));

    tokio::select! {
        result = &mut service_handle => {
            tracing::warn!("Export service stopped");
            return Ok(result??);
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    tracing::info!("Shutting down gracefully...");
    let _ = shutdown_tx.send(true);
    service_handle.await??;
    Ok(())
}
