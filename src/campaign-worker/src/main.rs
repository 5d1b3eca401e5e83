//! Campaign worker: runs the job handlers for list generation, campaign
//! sends, inbound events and journey delays.
//!
//! Main entry point that wires the engine context and starts the worker pool.
//! The process only consumes jobs. With the in-memory queue the work comes
//! from `--jobs`, a file of newline-delimited JSON jobs enqueued at startup.

use anyhow::Context;
use campaign_cache::{LocalLock, RedisLock};
use campaign_core::config::{AppConfig, Backend};
use campaign_core::event_bus::log_tracker;
use campaign_delivery::{MemoryThrottle, ProviderRegistry, RedisThrottle};
use campaign_engine::{job_registry, Backends, EngineContext, MemoryStore, Stores};
use campaign_journey::MemoryJourneyStore;
use campaign_queue::{Job, JobQueue, MemoryQueue, RetryPolicy, WorkerPool};
use campaign_rules::{MemoryEvaluationCache, MemoryRuleStore, RedisEvaluationCache};
use clap::Parser;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "campaign-worker")]
#[command(about = "Campaign automation job worker")]
#[command(long_about = "Campaign automation job worker.\n\n\
Consumes list generation, send, event and journey delay jobs. It does not \
produce work of its own: seed the in-memory queue with --jobs.")]
#[command(version)]
struct Cli {
    /// Node identifier (overrides config)
    #[arg(long, env = "CAMPAIGN_WORKER__NODE_ID")]
    node_id: Option<String>,

    /// Number of worker tasks (overrides config)
    #[arg(long, env = "CAMPAIGN_WORKER__WORKERS")]
    workers: Option<usize>,

    /// Lock, cache and throttle backend: `memory` or `redis`
    #[arg(long, env = "CAMPAIGN_WORKER__BACKEND")]
    backend: Option<Backend>,

    /// Newline-delimited JSON jobs to enqueue before the workers start
    #[arg(long, value_name = "FILE")]
    jobs: Option<PathBuf>,

    /// Skip the Prometheus exporter
    #[arg(long, default_value_t = false)]
    no_metrics: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "campaign_worker=info,campaign_engine=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Campaign worker starting up");

    let mut config = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    if let Some(backend) = cli.backend {
        config.backend = backend;
    }

    info!(
        node_id = %config.node_id,
        workers = config.workers,
        backend = ?config.backend,
        "Configuration loaded"
    );

    if !cli.no_metrics {
        if let Err(e) = start_metrics(&config) {
            error!(error = %e, "Failed to start metrics exporter");
        }
    }

    let queue = Arc::new(MemoryQueue::new(Duration::from_millis(config.queue.poll_interval_ms)));
    let backends = match config.backend {
        Backend::Memory => Backends {
            queue: queue.clone(),
            lock: Arc::new(LocalLock::new()),
            cache: Arc::new(MemoryEvaluationCache::new()),
            throttle: Arc::new(MemoryThrottle::new(Duration::from_millis(
                config.dispatch.rate_window_ms,
            ))),
            errors: log_tracker(),
        },
        Backend::Redis => {
            let conn = campaign_cache::connect(&config.redis).await?;
            Backends {
                queue: queue.clone(),
                lock: Arc::new(RedisLock::from_connection(conn.clone())),
                cache: Arc::new(RedisEvaluationCache::new(conn.clone())),
                throttle: Arc::new(RedisThrottle::from_connection(conn, config.dispatch.rate_window_ms)),
                errors: log_tracker(),
            }
        }
    };

    // Persistence stays in-process until a database-backed store is wired in.
    let stores = Stores::memory(
        Arc::new(MemoryStore::new()),
        MemoryRuleStore::new(),
        MemoryJourneyStore::new(),
    );

    if let Some(path) = &cli.jobs {
        let jobs = load_jobs(path)?;
        let count = jobs.len();
        for job in jobs {
            queue.enqueue(job).await?;
        }
        info!(path = %path.display(), count, "Seeded queue from job file");
    }

    let retry = RetryPolicy::from_config(&config.queue);
    let (node_id, workers) = (config.node_id.clone(), config.workers);
    let ctx = EngineContext::new(config, stores, backends, ProviderRegistry::with_defaults());
    let registry = Arc::new(job_registry(&ctx));

    let mut pool = WorkerPool::new(node_id, workers, queue.clone(), registry, retry);
    pool.start();

    info!(workers = pool.worker_count(), "Campaign worker is ready to process jobs");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, draining workers");
    queue.close();
    pool.wait().await;

    info!("Campaign worker stopped");
    Ok(())
}

fn start_metrics(config: &AppConfig) -> anyhow::Result<()> {
    let addr = SocketAddr::new(config.metrics.host.parse()?, config.metrics.port);
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    info!(port = config.metrics.port, "Metrics exporter started");
    Ok(())
}

fn load_jobs(path: &Path) -> anyhow::Result<Vec<Job>> {
    let input = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_jobs(&input)
}

/// One job per line. Blank lines and `#` comments are skipped.
fn parse_jobs(input: &str) -> anyhow::Result<Vec<Job>> {
    input
        .lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .map(|(n, line)| serde_json::from_str(line).with_context(|| format!("job on line {}", n + 1)))
        .collect()
}
