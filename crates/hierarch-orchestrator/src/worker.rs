use crate::coordinator::Coordinator;
use crate::supervisor::SpawnRequest;
use crate::types::{AgentNode, AgentStatus, HealthSample, Task};
use async_trait::async_trait;
use hierarch_core::{HierarchError, HierarchResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Executes the work described by a task.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Produce the task result, or an error message that counts as a failed attempt.
    async fn handle(&self, task: &Task, ctx: &WorkerContext) -> Result<serde_json::Value, String>;
}

/// What a handler can do while it runs a task.
pub struct WorkerContext {
    coordinator: Arc<Coordinator>,
    agent_id: Uuid,
    task_id: Uuid,
}

impl WorkerContext {
    /// Agent running the task.
    pub fn agent_id(&self) -> Uuid {
        self.agent_id
    }

    /// Cooperative cancellation point. `Err` means stop working on this task.
    pub fn checkpoint(&self) -> HierarchResult<()> {
        self.coordinator
            .queue()
            .checkpoint(self.task_id, self.agent_id)
    }

    /// Send a liveness signal during long-running work.
    pub fn heartbeat(&self) -> HierarchResult<()> {
        self.coordinator
            .report(HealthSample::heartbeat(self.agent_id))
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolOptions {
    /// Number of workers spawned under the pool root.
    pub workers: usize,
    /// Agent type the workers are spawned as; drives task routing.
    pub agent_type: String,
    /// How long one claim waits before the worker heartbeats and retries.
    pub claim_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            agent_type: "worker".into(),
            claim_timeout: Duration::from_millis(500),
        }
    }
}

/// Per-worker counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    /// Tasks handed to the handler.
    pub claimed: u64,
    /// Attempts that completed their task.
    pub completed: u64,
    /// Attempts that failed (requeued or dead-lettered).
    pub failed: u64,
    /// Results that arrived after the task was cancelled or reassigned.
    pub discarded: u64,
}

impl WorkerStats {
    fn merge(&mut self, other: &WorkerStats) {
        self.claimed += other.claimed;
        self.completed += other.completed;
        self.failed += other.failed;
        self.discarded += other.discarded;
    }
}

/// N workers, each an agent under a common pool root, pulling from the queue.
///
/// The root does no work itself; the pool heartbeats it while running so
/// liveness scans leave it alone.
pub struct WorkerPool {
    coordinator: Arc<Coordinator>,
    root: AgentNode,
    workers: Vec<(Uuid, JoinHandle<WorkerStats>)>,
    root_heartbeat: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl WorkerPool {
    /// Spawn the pool root and its workers, and start the worker loops.
    ///
    /// If a worker cannot be spawned, the workers already running are stopped,
    /// the root is retired and the spawn error is returned.
    pub async fn start(
        coordinator: Arc<Coordinator>,
        handler: Arc<dyn TaskHandler>,
        options: PoolOptions,
    ) -> HierarchResult<Self> {
        let root = coordinator
            .spawn_agent(
                SpawnRequest::root("pool")
                    .with_max_children(options.workers as u32)
                    .with_metadata(serde_json::json!({ "workers": options.workers })),
            )
            .await?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let root_heartbeat = tokio::spawn(heartbeat_root(
            Arc::clone(&coordinator),
            root.id,
            shutdown_rx.clone(),
        ));
        let mut pool = Self {
            coordinator,
            root,
            workers: Vec::with_capacity(options.workers),
            root_heartbeat,
            shutdown,
        };

        for _ in 0..options.workers {
            let spawned = pool
                .coordinator
                .spawn_agent(SpawnRequest::child(pool.root.id, options.agent_type.clone()))
                .await;
            let agent = match spawned {
                Ok(agent) => agent,
                Err(e) => {
                    warn!(
                        pool_id = %pool.root.id,
                        started = pool.workers.len(),
                        error = %e,
                        "Worker pool failed to start"
                    );
                    if let Err(cleanup) = pool.shutdown().await {
                        debug!(error = %cleanup, "Pool root already retired");
                    }
                    return Err(e);
                }
            };
            let worker = Worker {
                coordinator: Arc::clone(&pool.coordinator),
                handler: Arc::clone(&handler),
                agent_id: agent.id,
                claim_timeout: options.claim_timeout,
                stats: WorkerStats::default(),
            };
            pool.workers
                .push((agent.id, tokio::spawn(worker.run(shutdown_rx.clone()))));
        }

        info!(pool_id = %pool.root.id, workers = pool.workers.len(), "Worker pool started");
        Ok(pool)
    }

    /// Agent ID of the pool root.
    pub fn root_id(&self) -> Uuid {
        self.root.id
    }

    /// Agent IDs of the workers, in spawn order.
    pub fn worker_ids(&self) -> Vec<Uuid> {
        self.workers.iter().map(|(id, _)| *id).collect()
    }

    /// Wait until the queue holds no live task, or `timeout` passes.
    /// Returns whether the queue drained.
    pub async fn wait_until_drained(&self, timeout: Duration) -> bool {
        let give_up = tokio::time::Instant::now() + timeout;
        loop {
            if self.coordinator.queue().is_drained() {
                return true;
            }
            if tokio::time::Instant::now() >= give_up {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Signal every worker to stop, wait for them, and retire the pool root.
    pub async fn shutdown(self) -> HierarchResult<WorkerStats> {
        let _ = self.shutdown.send(true);

        let mut total = WorkerStats::default();
        for (agent_id, handle) in self.workers {
            match handle.await {
                Ok(stats) => total.merge(&stats),
                Err(e) => warn!(agent_id = %agent_id, error = %e, "Worker task panicked"),
            }
        }
        if let Err(e) = self.root_heartbeat.await {
            warn!(pool_id = %self.root.id, error = %e, "Root heartbeat task panicked");
        }

        self.coordinator
            .finish_agent(self.root.id, AgentStatus::Completed, None)?;
        info!(
            pool_id = %self.root.id,
            completed = total.completed,
            failed = total.failed,
            "Worker pool stopped"
        );
        Ok(total)
    }
}

/// Report liveness for the pool root at half the configured heartbeat interval
/// until shutdown.
async fn heartbeat_root(
    coordinator: Arc<Coordinator>,
    root_id: Uuid,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval = Duration::from_secs(coordinator.config().telemetry.heartbeat_interval_secs) / 2;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = coordinator.report(HealthSample::heartbeat(root_id)) {
                    debug!(pool_id = %root_id, error = %e, "Root heartbeat rejected");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

struct Worker {
    coordinator: Arc<Coordinator>,
    handler: Arc<dyn TaskHandler>,
    agent_id: Uuid,
    claim_timeout: Duration,
    stats: WorkerStats,
}

impl Worker {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> WorkerStats {
        debug!(agent_id = %self.agent_id, "Worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.heartbeat(None);

            let claimed = tokio::select! {
                claimed = self.coordinator.assign_wait(self.agent_id, self.claim_timeout) => claimed,
                _ = shutdown.changed() => break,
            };

            match claimed {
                Ok(Some(task)) => self.execute(task).await,
                Ok(None) => {}
                Err(e) if e.is_retryable() => {}
                Err(HierarchError::AgentNotActive(_)) => {
                    if !self.may_come_back() {
                        break;
                    }
                    tokio::time::sleep(self.claim_timeout).await;
                }
                Err(e) => {
                    warn!(agent_id = %self.agent_id, error = %e, "Worker stopping");
                    break;
                }
            }
        }

        if let Err(e) = self
            .coordinator
            .finish_agent(self.agent_id, AgentStatus::Completed, None)
        {
            debug!(agent_id = %self.agent_id, error = %e, "Worker already retired");
        }
        debug!(agent_id = %self.agent_id, completed = self.stats.completed, "Worker stopped");
        self.stats
    }

    /// A terminated worker keeps polling only while the coordinator may restart it.
    fn may_come_back(&self) -> bool {
        self.coordinator
            .supervisor()
            .get(self.agent_id)
            .is_some_and(|a| a.status.is_restartable() && !a.abandoned)
    }

    async fn execute(&mut self, task: Task) {
        self.stats.claimed += 1;
        let ctx = WorkerContext {
            coordinator: Arc::clone(&self.coordinator),
            agent_id: self.agent_id,
            task_id: task.id,
        };

        match self.handler.handle(&task, &ctx).await {
            Ok(result) => match self.coordinator.complete_task_as(task.id, self.agent_id, result) {
                Ok(_) => {
                    self.stats.completed += 1;
                    self.heartbeat(Some(false));
                }
                Err(e) => {
                    self.stats.discarded += 1;
                    debug!(task_id = %task.id, error = %e, "Result discarded");
                }
            },
            Err(message) => match self
                .coordinator
                .fail_task_as(task.id, self.agent_id, message)
                .await
            {
                Ok(_) => {
                    self.stats.failed += 1;
                    self.heartbeat(Some(true));
                }
                Err(e) => {
                    self.stats.discarded += 1;
                    debug!(task_id = %task.id, error = %e, "Failure report discarded");
                }
            },
        }
    }

    /// Report liveness; `Some(failed)` also records the outcome of an attempt.
    fn heartbeat(&self, attempt_failed: Option<bool>) {
        let finished = self.stats.completed + self.stats.failed;
        let success_rate = if finished == 0 {
            1.0
        } else {
            self.stats.completed as f64 / finished as f64
        };
        let error_rate = match attempt_failed {
            Some(true) => 1.0,
            _ => 0.0,
        };
        let sample = HealthSample::heartbeat(self.agent_id).with_rates(success_rate, error_rate);
        if let Err(e) = self.coordinator.report(sample) {
            debug!(agent_id = %self.agent_id, error = %e, "Heartbeat rejected");
        }
    }
}
