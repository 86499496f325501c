use crate::{
    classify, format_duration, CaptureConfig, CaptureOrchestrator, CaptureRequest, CaptureState,
    FileSnapshotStore, HttpFetcher, Priority, StatusPublisher, TracingStatusSink,
};
use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "capture-optimizer")]
#[command(about = "Rate-limited, resilient competitor snapshot capture")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, help = "Configuration file path (JSON)")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Maximum captures in flight across all scopes")]
    pub global_limit: Option<usize>,

    #[arg(long, help = "Maximum captures in flight per scope")]
    pub scope_limit: Option<usize>,

    #[arg(long, help = "Minimum spacing between requests to one domain, in milliseconds")]
    pub throttle_ms: Option<u64>,

    #[arg(long, help = "Capture attempts allowed per UTC day")]
    pub daily_limit: Option<u64>,

    #[arg(long, help = "Batch deadline in milliseconds")]
    pub deadline_ms: Option<u64>,

    #[arg(long, help = "Serve Prometheus metrics on this port")]
    pub metrics_port: Option<u16>,

    #[arg(long, help = "Enable verbose logging")]
    pub verbose: bool,
}

impl Cli {
    /// Applies command-line overrides on top of `config`.
    pub fn apply_overrides(&self, config: &mut CaptureConfig) {
        if let Some(limit) = self.global_limit {
            config.global_concurrency = limit;
        }
        if let Some(limit) = self.scope_limit {
            config.scope_concurrency = limit;
        }
        if let Some(throttle) = self.throttle_ms {
            config.throttle_ms = throttle;
        }
        if let Some(limit) = self.daily_limit {
            config.daily_limit = limit;
        }
        if let Some(deadline) = self.deadline_ms {
            config.batch_deadline_ms = deadline;
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Capture every target of a request file
    Capture {
        #[arg(short, long, help = "Request file: {\"scope_id\", \"targets\": [{\"id\", \"url\"}], \"priority\"}")]
        input: PathBuf,

        #[arg(short, long, help = "Output directory for snapshots and result.json")]
        output: PathBuf,

        #[arg(long, help = "Request priority (low, normal, high, critical)")]
        priority: Option<String>,
    },

    /// Show the complexity profile for a URL
    Classify {
        #[arg(short, long, help = "URL to classify")]
        url: String,
    },

    /// Print the effective configuration and limits as JSON
    ///
    /// Each invocation is a fresh process, so breaker, quota and throttle
    /// state start idle; the report shows what a capture run would use.
    Status,

    /// Validate configuration
    Validate {
        #[arg(short, long, help = "Configuration file to validate")]
        config: PathBuf,
    },
}

pub struct CliRunner {
    pub config: CaptureConfig,
    pub state: Arc<CaptureState>,
}

impl CliRunner {
    pub fn new(config: CaptureConfig) -> Self {
        let state = Arc::new(CaptureState::with_config(config.clone()));
        Self { config, state }
    }

    pub async fn run(&self, command: Commands) -> anyhow::Result<()> {
        match command {
            Commands::Capture {
                input,
                output,
                priority,
            } => self.run_capture(&input, &output, priority.as_deref()).await,
            Commands::Classify { url } => self.classify_url(&url),
            Commands::Status => self.show_status(),
            Commands::Validate { config } => self.validate_config(&config).await,
        }
    }

    pub async fn run_capture(
        &self,
        input: &Path,
        output: &Path,
        priority: Option<&str>,
    ) -> anyhow::Result<()> {
        let mut request = self.read_request(input).await?;
        if let Some(priority) = priority {
            request.priority = priority.parse::<Priority>()?;
        }
        info!(
            "Loaded {} targets for scope {} from {}",
            request.targets.len(),
            request.scope_id,
            input.display()
        );

        fs::create_dir_all(output)
            .await
            .with_context(|| format!("cannot create {}", output.display()))?;

        let (publisher, status_task) = StatusPublisher::spawn(
            Arc::new(TracingStatusSink),
            self.config.status_channel_capacity,
        );
        let orchestrator = CaptureOrchestrator::new(
            self.state.clone(),
            Arc::new(FileSnapshotStore::new(output.join("snapshots"))),
        )
        .with_status(publisher);

        let fetcher = Arc::new(HttpFetcher::new()?);
        let result = orchestrator.capture_all(request, fetcher).await?;

        // Flush pending progress events before printing the summary
        drop(orchestrator);
        let _ = status_task.await;

        let result_path = output.join("result.json");
        fs::write(&result_path, serde_json::to_vec_pretty(&result)?).await?;

        println!("{}", result.summary());
        println!(
            "  Captured: {}  Skipped: {}  Failed: {}",
            result.captured_count, result.skipped_count, result.failed_count
        );
        println!(
            "  Avg capture: {:.0}ms  Peak concurrency: {}",
            result.resource_usage.average_capture_ms, result.resource_usage.peak_concurrency
        );
        if result.rate_limiting_triggered {
            println!("  Rate limiting was triggered");
        }
        if result.circuit_breaker_activated {
            println!("  Circuit breaker was activated");
        }
        for failure in &result.failures {
            warn!("{} ({}): {} - {}", failure.target_id, failure.url, failure.category, failure.message);
        }
        println!("  Result written to {}", result_path.display());

        Ok(())
    }

    pub fn classify_url(&self, url: &str) -> anyhow::Result<()> {
        crate::validate_url(url)?;
        let summary = serde_json::json!({
            "url": url,
            "domain": crate::extract_domain(url),
            "profile": classify(url),
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
        Ok(())
    }

    pub fn show_status(&self) -> anyhow::Result<()> {
        println!("{}", serde_json::to_string_pretty(&self.status_report())?);
        Ok(())
    }

    /// Status snapshot plus the limits this process would enforce.
    pub fn status_report(&self) -> serde_json::Value {
        let orchestrator = CaptureOrchestrator::new(
            self.state.clone(),
            Arc::new(crate::MemorySnapshotStore::new()),
        );
        let status = orchestrator.get_status();
        let usage = self.state.quota.usage();

        serde_json::json!({
            "status": status,
            "limits": {
                "globalConcurrency": self.config.global_concurrency,
                "scopeConcurrency": self.config.scope_concurrency,
                "domainThrottle": format_duration(self.config.throttle()),
                "batchDeadline": format_duration(self.config.batch_deadline()),
                "dailyRemaining": usage.remaining(),
                "breakerCooldown": format_duration(self.config.breaker_cooldown()),
            },
            "limiter": self.state.limiter.stats(),
            "breaker": self.state.breaker.stats(),
        })
    }

    pub async fn validate_config(&self, config_path: &Path) -> anyhow::Result<()> {
        println!("Validating configuration: {}", config_path.display());

        let config_content = fs::read_to_string(config_path).await?;
        let config: CaptureConfig = serde_json::from_str(&config_content)?;
        config.validate()?;

        println!("Configuration is valid:");
        println!("  Global concurrency: {}", config.global_concurrency);
        println!("  Scope concurrency: {}", config.scope_concurrency);
        println!("  Domain throttle: {:?}", config.throttle());
        println!("  Batch deadline: {:?}", config.batch_deadline());
        println!("  Daily limit: {}", config.daily_limit);
        println!(
            "  Breaker: {:.0}% over {:?}, cooldown {:?}",
            config.breaker_error_threshold * 100.0,
            config.breaker_window(),
            config.breaker_cooldown()
        );

        Ok(())
    }

    pub async fn read_request(&self, path: &Path) -> anyhow::Result<CaptureRequest> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("cannot read {}", path.display()))?;
        let request: CaptureRequest = serde_json::from_str(&content)
            .with_context(|| format!("invalid request file {}", path.display()))?;
        Ok(request)
    }
}

pub fn setup_logging(verbose: bool) -> anyhow::Result<()> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    Ok(())
}
