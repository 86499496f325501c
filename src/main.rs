use anyhow::Context;
use capture_optimizer::{
    setup_logging, CaptureConfig, CaptureError, Cli, CliRunner, ErrorSeverity, PrometheusExporter,
};
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let args = Cli::parse();

    // Setup logging
    setup_logging(args.verbose)?;

    info!("Starting capture-optimizer v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = load_config(&args).await?;

    if let Some(port) = args.metrics_port {
        PrometheusExporter::new(port).start()?;
    }

    let cli_runner = CliRunner::new(config);

    // Setup graceful shutdown
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::broadcast::channel(1);
    let _shutdown_handler = setup_shutdown_handler(shutdown_tx);

    let result = tokio::select! {
        result = cli_runner.run(args.command) => {
            info!("Application completed");
            result
        }
        _ = shutdown_rx.recv() => {
            info!("Received shutdown signal");
            Ok(())
        }
    };

    if let Err(e) = result {
        match e.downcast_ref::<CaptureError>().map(CaptureError::severity) {
            Some(ErrorSeverity::Low) => warn!("Request rejected: {:#}", e),
            _ => error!("Application error: {:#}", e),
        }
        std::process::exit(1);
    }

    Ok(())
}

async fn load_config(args: &Cli) -> anyhow::Result<CaptureConfig> {
    let mut config = if let Some(config_path) = &args.config {
        let config_content = tokio::fs::read_to_string(config_path)
            .await
            .with_context(|| format!("cannot read config {}", config_path.display()))?;
        serde_json::from_str(&config_content)
            .with_context(|| format!("invalid config {}", config_path.display()))?
    } else {
        CaptureConfig::default()
    };

    // Override with CLI arguments
    args.apply_overrides(&mut config);

    config.validate()?;

    info!("Configuration loaded successfully");
    info!(
        "Concurrency: {} global, {} per scope",
        config.global_concurrency, config.scope_concurrency
    );
    info!(
        "Domain throttle: {:?}, daily limit: {}",
        config.throttle(),
        config.daily_limit
    );

    Ok(config)
}

fn setup_shutdown_handler(
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            // Keep the sender alive so the receiver does not see a closed channel
            std::future::pending::<()>().await;
        }
        info!("Received SIGINT");
        let _ = shutdown_tx.send(());
    })
}
