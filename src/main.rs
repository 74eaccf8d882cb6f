use clap::{Parser, Subcommand};
use estransfer::{
    checkpoint::{CheckpointStorage, FileCheckpointStorage, MemoryCheckpointStorage},
    config::{Config, ConfigLoader, LogFormat, LoggingConfig, TransferStrategy},
    error::{Result, TransferError},
    models::{TaskStatus, TransferReport},
    pipeline::{MemoryMonitor, TransferOrchestrator, TransferTask},
    store::{DocumentStore, ElasticsearchStore},
};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "estransfer",
    version = env!("CARGO_PKG_VERSION"),
    about = "Adaptive, resumable document transfer between search clusters",
    long_about = None
)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "ESTRANSFER_CONFIG")]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long, env = "ESTRANSFER_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a transfer
    Run {
        /// Bypass the strategy selector (scroll, pagination, streaming, hybrid)
        #[arg(long)]
        strategy: Option<TransferStrategy>,

        /// Read and transform without writing to the target
        #[arg(long)]
        dry_run: bool,

        /// Print Prometheus metrics when the transfer ends
        #[arg(long)]
        print_metrics: bool,
    },
    /// Continue an interrupted transfer
    Resume {
        #[arg(long)]
        task_id: String,
    },
    /// Validate configuration
    Validate,
    /// Generate sample configuration
    GenerateSample,
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::GenerateSample => {
            println!("{}", ConfigLoader::generate_sample());
            Ok(())
        }
        Commands::Version => {
            print_version_info();
            Ok(())
        }
        Commands::Validate => {
            let config = load_config(cli.config.as_deref())?;
            init_tracing(&config.logging, cli.log_level.as_deref());
            info!(
                source = %config.transfer.source_index,
                target = %config.transfer.target_index,
                batch_size = config.transfer.batch_size,
                "Configuration is valid"
            );
            Ok(())
        }
        Commands::Run {
            strategy,
            dry_run,
            print_metrics,
        } => {
            let mut config = load_config(cli.config.as_deref())?;
            init_tracing(&config.logging, cli.log_level.as_deref());
            if strategy.is_some() {
                config.transfer.strategy = strategy;
            }

            let orchestrator = Arc::new(build_orchestrator(&config, dry_run).await?);
            spawn_signal_handler(orchestrator.clone());

            let report = orchestrator
                .transfer(TransferTask::new(config.transfer.clone()))
                .await?;
            print_report(&report)?;

            if print_metrics {
                match estransfer::metrics::export_metrics() {
                    Ok(text) => println!("{}", text),
                    Err(e) => warn!(error = %e, "Failed to render metrics"),
                }
            }
            finish(&report)
        }
        Commands::Resume { task_id } => {
            let config = load_config(cli.config.as_deref())?;
            init_tracing(&config.logging, cli.log_level.as_deref());

            let orchestrator = Arc::new(build_orchestrator(&config, false).await?);
            spawn_signal_handler(orchestrator.clone());

            let recovery = orchestrator.resume_stored(&task_id).await?;
            println!("{}", serde_json::to_string_pretty(&recovery)?);
            if recovery.is_success() {
                Ok(())
            } else {
                Err(TransferError::Pipeline(format!(
                    "{} checkpoints could not be recovered",
                    recovery.failed
                )))
            }
        }
    }
}

fn init_tracing(logging: &LoggingConfig, level_override: Option<&str>) {
    use tracing_subscriber::fmt::time::ChronoLocal;

    let level = level_override.unwrap_or(&logging.level);
    let filter = format!("estransfer={},warn", level);
    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    let timer = ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string());

    let registry = tracing_subscriber::registry().with(filter_layer);
    match logging.format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_timer(timer)
                    .with_target(logging.with_target),
            )
            .init(),
        LogFormat::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_timer(timer)
                    .with_ansi(logging.ansi)
                    .with_target(logging.with_target),
            )
            .init(),
        LogFormat::Text => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_timer(timer)
                    .with_ansi(logging.ansi)
                    .with_target(logging.with_target)
                    .with_thread_ids(true),
            )
            .init(),
    }
}

fn load_config(path: Option<&str>) -> Result<Config> {
    match path {
        Some(path) => ConfigLoader::load_from_file(path),
        None => ConfigLoader::load(),
    }
}

async fn build_orchestrator(config: &Config, dry_run: bool) -> Result<TransferOrchestrator> {
    let source: Arc<dyn DocumentStore> = Arc::new(ElasticsearchStore::new("source", &config.source)?);
    let target: Arc<dyn DocumentStore> = Arc::new(ElasticsearchStore::new("target", &config.target)?);

    if !source.is_healthy().await {
        warn!(url = %config.source.url, "Source cluster is not healthy");
    }
    if !dry_run && !target.is_healthy().await {
        warn!(url = %config.target.url, "Target cluster is not healthy");
    }

    let storage: Arc<dyn CheckpointStorage> = match &config.checkpoint.directory {
        Some(directory) => Arc::new(FileCheckpointStorage::open(directory).await?),
        None => Arc::new(MemoryCheckpointStorage::new()),
    };
    let removed = storage.cleanup_expired().await?;
    if removed > 0 {
        debug!(removed, "Dropped expired task checkpoints");
    }

    let mut memory = MemoryMonitor::system(config.memory.budget_mb);
    let mut events = memory.start_monitoring(
        Duration::from_millis(config.memory.monitor_interval_ms),
        config.memory.warn_pressure,
    );
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            debug!(?event, "Memory pressure event");
        }
    });

    Ok(TransferOrchestrator::new(config.clone(), source, target, memory)
        .with_storage(storage)
        .with_dry_run(dry_run))
}

fn spawn_signal_handler(orchestrator: Arc<TransferOrchestrator>) {
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received, finishing in-flight pages");
                orchestrator.cancel();
            }
            Err(e) => error!("Unable to listen for shutdown signal: {}", e),
        }
    });
}

fn print_report(report: &TransferReport) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}

fn finish(report: &TransferReport) -> Result<()> {
    match report.status {
        TaskStatus::Failed => Err(TransferError::Pipeline(
            report.error.clone().unwrap_or_else(|| "transfer failed".to_string()),
        )),
        TaskStatus::Cancelled => Err(TransferError::Cancelled(format!("task {}", report.task_id))),
        _ => Ok(()),
    }
}

fn print_version_info() {
    println!("estransfer v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Adaptive, resumable document transfer between search clusters");
    println!("License: MIT");
}
