use anyhow::{Context, Result};
use clap::Parser;
use dbp_scheduler::agent::{BackgroundAgent, CommandJobRunner};
use dbp_scheduler::config::{AgentConfig, CliConfig, FileConfig};
use dbp_scheduler::queue::{
    create_queue_manager, DefaultJobFactory, OperationDependencies, QueueCollaborators,
    TokioWorkerPool,
};
use dbp_scheduler::telemetry::{metrics, PrometheusTelemetry};
use dbp_scheduler::SqliteJobStore;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    if path_buf.is_absolute() {
        return Ok(path_buf);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(path_buf))
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to a TOML config file. Values in the file override CLI arguments.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Path to the SQLite job store database file.
    #[clap(long, value_parser = parse_path)]
    pub db_path: Option<PathBuf>,

    /// The port for the metrics server (Prometheus scraping). Disabled if not set.
    #[clap(long)]
    pub metrics_port: Option<u16>,

    /// Ask the runner to show its browser window.
    #[clap(long)]
    pub show_web_view: bool,

    /// Program executed for every scan and opt-out.
    #[clap(long)]
    pub runner_command: Option<String>,

    /// Run a manual scan of every broker right after startup.
    #[clap(long)]
    pub scan_now: bool,

    /// Run every opt-out right after startup, bypassing the scheduler.
    #[clap(long)]
    pub opt_out_now: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to initialize logging")?;

    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading config from {:?}", path);
            Some(FileConfig::load(path)?)
        }
        None => None,
    };
    let cli_config = CliConfig {
        db_path: cli_args.db_path.clone(),
        metrics_port: cli_args.metrics_port,
        show_web_view: cli_args.show_web_view,
        runner_command: cli_args.runner_command.clone(),
    };
    let config = AgentConfig::resolve(&cli_config, file_config)?;

    info!("Opening SQLite job store at {:?}...", config.db_path);
    let job_store = Arc::new(SqliteJobStore::new(&config.db_path)?);

    info!("Initializing metrics...");
    metrics::init_metrics();
    if let Some(port) = config.metrics_port {
        info!("Metrics available at port {}!", port);
        tokio::spawn(async move {
            if let Err(e) = metrics::run_metrics_server(port).await {
                error!("Metrics server error: {:#}", e);
            }
        });
    }

    let shutdown_token = CancellationToken::new();
    let pool = Arc::new(TokioWorkerPool::new(
        config.execution.concurrent_operations_different_brokers,
    ));
    let (mut manager, queue) = create_queue_manager(
        pool,
        Arc::new(DefaultJobFactory),
        Arc::new(PrometheusTelemetry),
        QueueCollaborators::default(),
        shutdown_token.clone(),
    );
    let manager_task = tokio::spawn(async move { manager.run().await });

    let deps = OperationDependencies {
        config: config.execution.clone(),
        job_source: job_store,
        runner: Arc::new(CommandJobRunner::new(
            config.runner_command.clone(),
            config.runner_args.clone(),
        )),
    };
    let agent = BackgroundAgent::new(queue, deps, config.show_web_view, shutdown_token.clone());

    agent.agent_finished_launching().await?;
    if cli_args.scan_now {
        agent.profile_saved().await?;
    }
    if cli_args.opt_out_now {
        agent.run_all_opt_outs().await?;
    }

    let metadata = agent.debug_metadata().await?;
    info!(
        "Agent running (queue {}, scheduler running: {})",
        metadata.queue_status, metadata.scheduler_running
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Received shutdown signal, stopping...");
    shutdown_token.cancel();

    if let Err(e) = manager_task.await {
        error!("Queue manager task failed: {}", e);
    }
    info!("Shutdown complete");
    Ok(())
}
