use async_trait::async_trait;
use clap::{Parser, Subcommand};
use hierarch_orchestrator::{
    Coordinator, DecisionContext, DecisionKind, EngineConfig, FnScorer, JsonSnapshotStore,
    MaintenanceLoop, Perspective, PoolOptions, ScorerPanel, Task, TaskHandler, ValidationLedger,
    Verdict, WorkerContext, WorkerPool,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "hierarch", about = "Hierarch: hierarchical multi-agent task orchestration")]
struct Cli {
    /// Path to config file (defaults apply when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a synthetic workload through a worker pool
    Run {
        /// Number of workers in the pool
        #[arg(short, long, default_value_t = 4)]
        workers: usize,
        /// Number of tasks to submit
        #[arg(short, long, default_value_t = 40)]
        tasks: usize,
        /// How long to wait for the queue to drain
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },
    /// Load, validate and print the effective configuration
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => EngineConfig::load(path).await?,
        None => EngineConfig::default(),
    };

    match cli.command {
        Commands::Run {
            workers,
            tasks,
            timeout_secs,
        } => run(config, workers, tasks, Duration::from_secs(timeout_secs)).await?,
        Commands::CheckConfig => {
            config.validate()?;
            print!("{}", config.to_toml_string()?);
        }
    }

    Ok(())
}

async fn run(
    config: EngineConfig,
    workers: usize,
    tasks: usize,
    timeout: Duration,
) -> anyhow::Result<()> {
    let ledger = Arc::new(ValidationLedger::with_jsonl_sink(config.data_dir.join("ledger")).await?);
    let snapshots = JsonSnapshotStore::new(config.data_dir.join("snapshots"));
    let claim_timeout = config.queue.claim_poll();

    let coordinator = Arc::new(
        Coordinator::with_ledger(config, Arc::clone(&ledger))?.with_panel(heuristic_panel()?),
    );

    let submitted = submit_workload(&coordinator, tasks)?;
    info!(tasks = submitted, workers, "Workload submitted");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let maintenance = MaintenanceLoop::from_config(Arc::clone(&coordinator)).start(shutdown_rx);
    let pool = WorkerPool::start(
        Arc::clone(&coordinator),
        Arc::new(SyntheticHandler),
        PoolOptions {
            workers,
            claim_timeout,
            ..PoolOptions::default()
        },
    )
    .await?;

    let drained = tokio::select! {
        drained = pool.wait_until_drained(timeout) => drained,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, shutting down");
            false
        }
    };
    if !drained {
        warn!(timeout_secs = timeout.as_secs(), "Queue did not drain");
    }

    let worker_stats = pool.shutdown().await?;
    let _ = shutdown_tx.send(true);
    maintenance.await?;
    ledger.flush().await;

    let snapshot = coordinator.snapshot();
    let snapshot_path = snapshots.save(&snapshot).await?;
    let escalations = coordinator.mailbox().inbox(None).len();

    let summary = serde_json::json!({
        "drained": drained,
        "queue": coordinator.stats(),
        "workers": worker_stats,
        "dead_letters": coordinator.queue().dead_letters().len(),
        "validations": ledger.len(),
        "ledger_verified": ledger.verify(),
        "coordinator_inbox": escalations,
        "snapshot": snapshot_path,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

/// Tasks of mixed type and priority; some depend on their predecessor,
/// some fail once, some never succeed.
fn submit_workload(coordinator: &Coordinator, count: usize) -> anyhow::Result<usize> {
    const TYPES: [&str; 3] = ["code", "review", "test"];

    let mut previous: Option<Uuid> = None;
    for i in 0..count {
        let mut task = coordinator
            .new_task(TYPES[i % TYPES.len()], format!("synthetic task {i}"))
            .with_priority((i % 10 + 1) as u8)
            .with_payload(serde_json::json!({
                "index": i,
                "flaky": i % 5 == 4,
                "doomed": i % 17 == 16,
            }));
        if let Some(dep) = previous.filter(|_| i % 4 == 3) {
            task = task.with_dependencies(vec![dep]);
        }
        previous = Some(coordinator.submit(task)?);
    }
    Ok(count)
}

struct SyntheticHandler;

#[async_trait]
impl TaskHandler for SyntheticHandler {
    async fn handle(&self, task: &Task, ctx: &WorkerContext) -> Result<serde_json::Value, String> {
        let index = task.payload["index"].as_u64().unwrap_or(0);
        for _ in 0..(index % 4 + 1) {
            tokio::time::sleep(Duration::from_millis(5)).await;
            ctx.checkpoint().map_err(|e| e.to_string())?;
        }

        if task.payload["doomed"].as_bool().unwrap_or(false) {
            return Err(format!("task {index} cannot succeed"));
        }
        if task.payload["flaky"].as_bool().unwrap_or(false) && task.retry_count == 0 {
            return Err(format!("task {index} failed on first attempt"));
        }
        Ok(serde_json::json!({ "index": index, "agent": ctx.agent_id() }))
    }
}

fn attribute(ctx: &DecisionContext, key: &str, default: f64) -> f64 {
    ctx.attributes[key].as_f64().unwrap_or(default)
}

/// Rule-of-thumb scorers standing in for model-backed perspectives.
fn heuristic_panel() -> anyhow::Result<ScorerPanel> {
    let panel = ScorerPanel::new(
        Arc::new(FnScorer::new(
            "retry-evidence",
            Perspective::Plausibility,
            |ctx: &DecisionContext| {
                let retries = attribute(ctx, "retry_count", 0.0);
                Ok(Verdict::new(0.55 + 0.1 * retries, "apply: the failure is reproducible"))
            },
        )),
        Arc::new(FnScorer::new(
            "priority-guard",
            Perspective::IdentityConsistency,
            |ctx: &DecisionContext| {
                let priority = attribute(ctx, "priority", 5.0);
                Ok(Verdict::new(1.0 - priority / 20.0, "apply: low stakes for this priority"))
            },
        )),
        Arc::new(FnScorer::new(
            "critic",
            Perspective::SelfCritique,
            |_: &DecisionContext| Ok(Verdict::new(0.6, "hold: a human may still want a retry")),
        )),
        Arc::new(FnScorer::new(
            "policy",
            Perspective::MetaConsistency,
            |ctx: &DecisionContext| {
                let score = match ctx.kind {
                    DecisionKind::DeadLetter => 0.8,
                    _ => 0.7,
                };
                Ok(Verdict::new(score, "apply: consistent with the retry policy"))
            },
        )),
    )?;
    Ok(panel)
}
