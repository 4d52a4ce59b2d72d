use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use regintel_core::RunReport;
use regintel_storage::PgUpdateStore;
use regintel_sync::{IngestionConfig, IngestionPipeline, IngestionWorker, RunOptions, RunOutcome};
use regintel_web::AppState;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "regintel-cli")]
#[command(about = "Regulatory intelligence ingestion command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion cycle and print its report.
    Sync {
        /// Collect, deduplicate and classify without writing anything.
        #[arg(long)]
        dry_run: bool,
    },
    /// Apply database migrations.
    Migrate,
    /// Serve the status API with the scheduled worker until Ctrl-C.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("regintel=info")))
        .init();

    let cli = Cli::parse();
    let config = IngestionConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync { dry_run: false }) {
        Commands::Sync { dry_run } => sync(&config, dry_run).await,
        Commands::Migrate => {
            connect(&config).await?.migrate().await.context("running migrations")?;
            println!("migrations applied");
            Ok(())
        }
        Commands::Serve => serve(&config).await,
    }
}

async fn connect(config: &IngestionConfig) -> Result<PgUpdateStore> {
    let url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set")?;
    PgUpdateStore::connect(url).await.context("connecting to database")
}

async fn pipeline(config: &IngestionConfig) -> Result<Arc<IngestionPipeline>> {
    let store = connect(config).await?;
    let pipeline = IngestionPipeline::from_config(config, Arc::new(store)).context("configuring ingestion pipeline")?;
    Ok(Arc::new(pipeline))
}

async fn sync(config: &IngestionConfig, dry_run: bool) -> Result<()> {
    let pipeline = pipeline(config).await?;
    match pipeline.run_cycle(RunOptions { dry_run }).await {
        RunOutcome::Completed(report) => print_report(&report),
        RunOutcome::AlreadyRunning => println!("sync skipped: another run is in progress"),
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    println!(
        "sync complete: run_id={} dry_run={} collected={} duplicates={} stored={} duration={:.2}s",
        report.run_id,
        report.dry_run,
        report.total_collected,
        report.total_duplicates,
        report.total_stored,
        report.duration_seconds
    );
    for error in &report.errors {
        println!("  error: {error}");
    }
}

async fn serve(config: &IngestionConfig) -> Result<()> {
    let pipeline = pipeline(config).await?;
    let run_state = pipeline.state();
    let worker = IngestionWorker::start(pipeline, config.worker_config())
        .await
        .context("starting ingestion worker")?;

    let state = AppState::new(run_state).with_worker(worker.handle());
    let listener = TcpListener::bind(("0.0.0.0", config.web_port))
        .await
        .with_context(|| format!("binding port {}", config.web_port))?;

    let served = regintel_web::serve(listener, state, shutdown_signal()).await;
    info!("shutting down ingestion worker");
    worker.shutdown().await?;
    served
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c, serving until killed");
        std::future::pending::<()>().await;
    }
}
