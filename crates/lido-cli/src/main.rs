use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use lido_pipeline::{
    Deduplicator, JobRunner, PipelineConfig, RecurringTaskRegistry, TaskQueue, WebhookDispatcher,
    WorkerPool,
};
use lido_sources::{builtin_registry, DuckDuckGoDiscovery, WebsiteEnricher};
use lido_storage::{
    DirectEgress, EgressRotator, HttpGateway, HttpGatewayConfig, PgStore, RoundRobinEgress, Store,
};
use lido_web::AppState;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "lido")]
#[command(about = "Lead Intake & Dedup Orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run API, worker pool and scheduler in one process.
    Serve {
        #[arg(long, default_value_t = 8000)]
        port: u16,
    },
    /// Run only the worker pool.
    Worker,
    /// Run one batch dedup scan and exit.
    Scan,
    /// Apply database migrations.
    Migrate,
}

struct Runtime {
    store: Arc<dyn Store>,
    queue: Arc<TaskQueue>,
    dedup: Arc<Deduplicator>,
    runner: Arc<JobRunner>,
}

async fn build_runtime(config: &PipelineConfig) -> Result<Runtime> {
    let store: Arc<dyn Store> = Arc::new(PgStore::connect(&config.database_url).await?);
    let queue = Arc::new(TaskQueue::new(store.clone()));
    let webhooks = Arc::new(WebhookDispatcher::new(
        store.clone(),
        config.webhook_timeout(),
        config.webhook_max_retries,
    )?);
    let dedup = Arc::new(Deduplicator::new(store.clone(), config.dedup, webhooks.clone()));

    // LIDO_PROXY_URLS="socks5://...,socks5://..." rotates egress
    // identities across that list; without it traffic leaves directly.
    let rotator: Arc<dyn EgressRotator> = match std::env::var("LIDO_PROXY_URLS") {
        Ok(urls) if !urls.trim().is_empty() => Arc::new(RoundRobinEgress::new(
            urls.split(',')
                .map(|u| u.trim().to_string())
                .filter(|u| !u.is_empty())
                .collect(),
        )),
        _ => Arc::new(DirectEgress),
    };
    let http = Arc::new(HttpGateway::new(HttpGatewayConfig::default(), rotator));
    let scrapers = builtin_registry(http.clone());
    let discovery = Arc::new(DuckDuckGoDiscovery::new(http.clone()));
    let enricher = Arc::new(WebsiteEnricher::new(http));
    let runner = Arc::new(JobRunner::new(
        store.clone(),
        scrapers,
        discovery,
        enricher,
        dedup.clone(),
        webhooks,
    ));
    Ok(Runtime {
        store,
        queue,
        dedup,
        runner,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve { port: 8000 }) {
        Commands::Serve { port } => {
            let runtime = build_runtime(&config).await?;
            let _pool = WorkerPool::start(
                runtime.queue.clone(),
                runtime.runner.clone(),
                config.worker_count,
            );
            let scheduler = RecurringTaskRegistry::new(runtime.queue.clone()).await?;
            scheduler
                .register_defaults(&config.scan_cron, &config.cleanup_cron)
                .await?;
            scheduler.start().await?;
            info!(port, workers = config.worker_count, "lido serving");
            lido_web::serve(
                AppState::new(runtime.store, runtime.queue, runtime.dedup),
                port,
            )
            .await?;
        }
        Commands::Worker => {
            let runtime = build_runtime(&config).await?;
            let pool = WorkerPool::start(
                runtime.queue.clone(),
                runtime.runner.clone(),
                config.worker_count,
            );
            info!(workers = config.worker_count, "worker pool running, ctrl-c to stop");
            tokio::signal::ctrl_c().await?;
            pool.shutdown().await;
        }
        Commands::Scan => {
            let runtime = build_runtime(&config).await?;
            let summary = runtime.dedup.scan_all().await?;
            println!(
                "scan complete: scanned={} candidates_created={}",
                summary.scanned_companies, summary.candidates_created
            );
        }
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
