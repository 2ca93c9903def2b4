//! tenderwatch CLI: run the service or operate on analyses by hand.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use tenderwatch::analyzer::{
    AnalyzerSet, AnthropicCompletion, Completion, DocumentAnalyzer, PromptAnalyzer, PromptBook,
    UnavailableCompletion,
};
use tenderwatch::bus::EventBus;
use tenderwatch::config::Config;
use tenderwatch::db::Db;
use tenderwatch::engine::Orchestrator;
use tenderwatch::gateway::StreamGateway;
use tenderwatch::http::{self, AppState};
use tenderwatch::ingest::{Deduplicator, SpoolFeed};
use tenderwatch::phase::PhasePlan;
use tenderwatch::store::AnalysisStore;
use tenderwatch::telemetry::{TelemetryConfig, TelemetryGuard, init_telemetry};
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "tenderwatch", about = "Tender ingestion and analysis service")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the poller, the workers and the HTTP surface
    Serve,
    /// Run a single poll cycle
    Poll {
        /// Wait for the runs it started to finish
        #[arg(long)]
        wait: bool,
    },
    /// Show the analysis for a tender reference
    Status {
        subject: String,
    },
    /// Re-run a finished analysis and wait for the result
    Retry {
        subject: String,
    },
    /// Delete expired results and old ledger entries
    Purge,
}

struct App {
    orchestrator: Orchestrator,
    ingest: Arc<Deduplicator>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;
    let _guard = telemetry(&config)?;

    match cli.command {
        Command::Serve => cmd_serve(&config).await,
        Command::Poll { wait } => cmd_poll(&config, wait).await,
        Command::Status { subject } => cmd_status(&config, &subject).await,
        Command::Retry { subject } => cmd_retry(&config, &subject).await,
        Command::Purge => cmd_purge(&config).await,
    }
}

fn telemetry(config: &Config) -> anyhow::Result<TelemetryGuard> {
    Ok(init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "tenderwatch".to_string(),
        log_level: config.log_level.clone(),
    })?)
}

async fn connect(config: &Config) -> anyhow::Result<Arc<Db>> {
    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;
    Ok(Arc::new(db))
}

fn analyzers(config: &Config) -> anyhow::Result<AnalyzerSet> {
    let book = match &config.prompts_file {
        Some(path) => PromptBook::load(path)?,
        None => PromptBook::defaults(),
    };
    let completion: Arc<dyn Completion> = match &config.anthropic_api_key {
        Some(key) => Arc::new(AnthropicCompletion::new(key, &config.analyzer_model)?),
        None => {
            warn!("ANTHROPIC_API_KEY not set, LLM phases will fail as unavailable");
            Arc::new(UnavailableCompletion)
        }
    };
    Ok(AnalyzerSet::standard(
        DocumentAnalyzer::new(&config.documents_dir),
        PromptAnalyzer::new(completion, book),
    ))
}

async fn build(config: &Config) -> anyhow::Result<App> {
    let db = connect(config).await?;
    let orchestrator = Orchestrator::spawn(
        db.clone(),
        EventBus::new(config.subscriber_buffer),
        PhasePlan::standard(),
        analyzers(config)?,
        config.orchestrator(),
    )?;
    let ingest = Arc::new(Deduplicator::new(
        Arc::new(SpoolFeed::new(&config.feed_spool_dir)),
        db.clone(),
        orchestrator.clone(),
        config.ingest(),
    ));
    Ok(App {
        orchestrator,
        ingest,
    })
}

async fn cmd_serve(config: &Config) -> anyhow::Result<()> {
    let app = build(config).await?;
    app.orchestrator.recover().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown requested, interrupt again to exit immediately");
        shutdown_tx.send_replace(true);
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("second interrupt, exiting without waiting for active runs");
            std::process::exit(130);
        }
    });

    let poller = tokio::spawn(Arc::clone(&app.ingest).run(shutdown_rx.clone()));

    let state = AppState {
        gateway: StreamGateway::new(app.orchestrator.clone(), config.gateway())
            .with_shutdown(shutdown_rx.clone()),
        orchestrator: app.orchestrator.clone(),
        ingest: Arc::clone(&app.ingest),
    };
    let listener = tokio::net::TcpListener::bind(config.http_addr).await?;
    http::serve(listener, state, shutdown_rx).await?;

    poller.await?;
    app.orchestrator.shutdown().await;
    Ok(())
}

async fn cmd_poll(config: &Config, wait: bool) -> anyhow::Result<()> {
    let app = build(config).await?;
    let report = app.ingest.poll_once().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if wait {
        while app.orchestrator.active_runs() > 0 {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        // Finalizers run on their own tasks; settle anything they missed.
        let reconciled = app.ingest.reconcile().await?;
        println!("reconciled {reconciled} ledger entr(ies)");
    }
    app.orchestrator.shutdown().await;
    Ok(())
}

async fn cmd_status(config: &Config, subject: &str) -> anyhow::Result<()> {
    let db = connect(config).await?;
    let Some(record) = db.find_by_subject(subject).await? else {
        anyhow::bail!("no analysis for '{subject}'");
    };

    println!("ID:         {}", record.id);
    println!("Subject:    {}", record.subject);
    println!("Owner:      {}", record.owner);
    println!("Status:     {}", record.status);
    println!("Progress:   {}%", record.progress);
    println!(
        "Phase:      {}",
        record
            .current_phase
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string())
    );
    println!("Attempt:    {}", record.attempt);
    println!("Created:    {}", record.created_at);
    println!("Updated:    {}", record.updated_at);
    if let Some(completed) = record.completed_at {
        println!("Completed:  {completed}");
    }
    if let Some(ref err) = record.error_message {
        println!("Error:      {err}");
    }
    if !record.results.is_empty() {
        println!("---");
        for (phase, result) in &record.results {
            println!("{phase} (confidence {:.2})", result.confidence);
            println!("{}", serde_json::to_string_pretty(&result.output)?);
        }
    }
    Ok(())
}

async fn cmd_retry(config: &Config, subject: &str) -> anyhow::Result<()> {
    let app = build(config).await?;
    let enqueued = app.orchestrator.retry(subject).await?;
    println!("{subject}: {:?}", enqueued.outcome);
    let record = enqueued.handle.wait().await?;
    println!("{subject}: {} at {}%", record.status, record.progress);
    app.orchestrator.shutdown().await;
    Ok(())
}

async fn cmd_purge(config: &Config) -> anyhow::Result<()> {
    let app = build(config).await?;
    let report = app.ingest.purge(chrono::Utc::now()).await?;
    println!(
        "purged {} ledger entr(ies), {} analys(es)",
        report.ledger_entries, report.analyses
    );
    app.orchestrator.shutdown().await;
    Ok(())
}
