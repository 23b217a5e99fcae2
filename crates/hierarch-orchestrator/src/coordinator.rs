use crate::config::EngineConfig;
use crate::consensus::{ConsensusValidator, ScorerPanel};
use crate::ledger::ValidationLedger;
use crate::mailbox::Mailbox;
use crate::store::EngineSnapshot;
use crate::supervisor::{AgentSupervisor, SpawnRequest};
use crate::task_queue::{ClaimFilter, SweepReport, TaskQueue};
use crate::telemetry::{Advisory, TelemetryStore};
use crate::types::{
    AgentNode, AgentStatus, DecisionContext, DecisionKind, FailureOutcome, HealthSample,
    QueueStats, Task, TaskStatus, ValidationRecord,
};
use chrono::{DateTime, Utc};
use hierarch_core::{HierarchError, HierarchResult, Message, MessageType};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Sender/receiver ID the coordinator uses on messages it originates.
pub const COORDINATOR_ID: Uuid = Uuid::nil();

/// What happened to one advisory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum AdvisoryAction {
    /// Agent was terminated and brought back.
    Restarted {
        /// Restarted agent.
        agent_id: Uuid,
        /// Restarts performed so far.
        restart_count: u32,
    },
    /// Restart budget ran out; the subtree was abandoned.
    Abandoned {
        /// Agent whose budget ran out.
        agent_id: Uuid,
        /// Descendants cancelled with it.
        cancelled: Vec<Uuid>,
    },
    /// Agent was terminated but could not be restarted (parent gone or full).
    Terminated {
        /// Terminated agent.
        agent_id: Uuid,
        /// Why it could not come back.
        reason: String,
    },
    /// Agent was no longer active.
    Ignored {
        /// Agent the advisory named.
        agent_id: Uuid,
    },
}

/// Result of one [`Coordinator::maintenance_tick`].
#[derive(Debug, Clone, Default)]
pub struct MaintenanceReport {
    /// Timeout sweep result.
    pub sweep: SweepReport,
    /// One entry per advisory handled.
    pub advisories: Vec<AdvisoryAction>,
    /// Pending tasks cancelled because a dependency can never complete.
    pub orphans_cancelled: Vec<Uuid>,
}

impl MaintenanceReport {
    /// The pass changed nothing.
    pub fn is_quiet(&self) -> bool {
        self.sweep.is_empty() && self.advisories.is_empty() && self.orphans_cancelled.is_empty()
    }
}

/// Composes queue, supervisor, telemetry and validator into one engine.
///
/// Each component guards its own state; the coordinator holds no lock of its
/// own across component calls.
pub struct Coordinator {
    config: EngineConfig,
    queue: Arc<TaskQueue>,
    supervisor: Arc<AgentSupervisor>,
    telemetry: Arc<TelemetryStore>,
    validator: Arc<ConsensusValidator>,
    panel: Option<ScorerPanel>,
    mailbox: Arc<Mailbox>,
    advisories: Mutex<mpsc::UnboundedReceiver<Advisory>>,
}

impl Coordinator {
    /// Build an engine with an in-memory validation ledger.
    pub fn new(config: EngineConfig) -> HierarchResult<Self> {
        Self::with_ledger(config, Arc::new(ValidationLedger::in_memory()))
    }

    /// Build an engine that records validations into `ledger`.
    pub fn with_ledger(config: EngineConfig, ledger: Arc<ValidationLedger>) -> HierarchResult<Self> {
        config.validate()?;

        let mailbox = Arc::new(Mailbox::new());
        let (telemetry, advisories) = TelemetryStore::new(config.telemetry.clone());

        Ok(Self {
            queue: Arc::new(TaskQueue::with_config(&config.queue)),
            supervisor: Arc::new(AgentSupervisor::new(
                config.supervisor.clone(),
                Arc::clone(&mailbox),
            )),
            telemetry: Arc::new(telemetry),
            validator: Arc::new(ConsensusValidator::new(config.consensus.clone(), ledger)),
            panel: None,
            mailbox,
            advisories: Mutex::new(advisories),
            config,
        })
    }

    /// Scorers used for gated decisions and [`Coordinator::validate`].
    pub fn with_panel(mut self, panel: ScorerPanel) -> Self {
        self.panel = Some(panel);
        self
    }

    /// Effective configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Shared task queue.
    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    /// Shared agent supervisor.
    pub fn supervisor(&self) -> &Arc<AgentSupervisor> {
        &self.supervisor
    }

    /// Shared telemetry store.
    pub fn telemetry(&self) -> &Arc<TelemetryStore> {
        &self.telemetry
    }

    /// Shared consensus validator.
    pub fn validator(&self) -> &Arc<ConsensusValidator> {
        &self.validator
    }

    /// Messages posted between agents and to the coordinator.
    pub fn mailbox(&self) -> &Arc<Mailbox> {
        &self.mailbox
    }

    // --- tasks ---

    /// A task carrying the configured default retry budget.
    pub fn new_task(&self, task_type: impl Into<String>, description: impl Into<String>) -> Task {
        Task::new(task_type, description).with_max_retries(self.config.queue.default_max_retries)
    }

    /// Add a task to the queue.
    pub fn submit(&self, task: Task) -> HierarchResult<Uuid> {
        self.queue.submit(task)
    }

    /// Admission check, then a claim restricted to the agent type's routing.
    pub fn assign(&self, agent_id: Uuid) -> HierarchResult<Option<Task>> {
        let agent = self.supervisor.admit(agent_id)?;
        self.queue
            .claim_matching(agent_id, &self.filter_for(&agent.agent_type))
    }

    /// Like [`Coordinator::assign`] but waits up to `timeout` for work.
    pub async fn assign_wait(
        &self,
        agent_id: Uuid,
        timeout: std::time::Duration,
    ) -> HierarchResult<Option<Task>> {
        let agent = self.supervisor.admit(agent_id)?;
        self.queue
            .claim_wait(agent_id, &self.filter_for(&agent.agent_type), timeout)
            .await
    }

    fn filter_for(&self, agent_type: &str) -> ClaimFilter {
        self.config
            .accepted_task_types(agent_type)
            .map(|types| ClaimFilter::task_types(types.iter().cloned()))
            .unwrap_or_default()
    }

    /// Complete a task on behalf of whoever holds it.
    pub fn complete_task(&self, task_id: Uuid, result: serde_json::Value) -> HierarchResult<Task> {
        self.queue.complete(task_id, result)
    }

    /// Complete the attempt `agent_id` holds. Stale holders get `ClaimConflict`.
    pub fn complete_task_as(
        &self,
        task_id: Uuid,
        agent_id: Uuid,
        result: serde_json::Value,
    ) -> HierarchResult<Task> {
        self.queue.complete_as(task_id, agent_id, result)
    }

    /// Report a failed attempt.
    ///
    /// When this failure exhausts the retry budget and dead-letter gating is
    /// on, the decision is validated first. The task is dead-lettered either
    /// way; without consensus a priority-10 `validation_request` is posted to
    /// the coordinator inbox for a human to pick up.
    pub async fn fail_task(
        &self,
        task_id: Uuid,
        error: impl Into<String>,
    ) -> HierarchResult<FailureOutcome> {
        self.fail_attempt(task_id, None, error.into()).await
    }

    /// [`Coordinator::fail_task`] for the attempt `agent_id` holds.
    /// Stale holders get `ClaimConflict` and nothing is validated.
    pub async fn fail_task_as(
        &self,
        task_id: Uuid,
        agent_id: Uuid,
        error: impl Into<String>,
    ) -> HierarchResult<FailureOutcome> {
        self.fail_attempt(task_id, Some(agent_id), error.into()).await
    }

    async fn fail_attempt(
        &self,
        task_id: Uuid,
        owner: Option<Uuid>,
        error: String,
    ) -> HierarchResult<FailureOutcome> {
        if let Some(agent_id) = owner {
            self.queue.checkpoint(task_id, agent_id)?;
        }
        let task = self
            .queue
            .get(task_id)
            .ok_or(HierarchError::TaskNotFound(task_id))?;

        let record = match &self.panel {
            Some(panel)
                if self.config.gating.dead_letters
                    && task.status == TaskStatus::InProgress
                    && self.queue.would_dead_letter(task_id)? =>
            {
                let context = DecisionContext::new(
                    DecisionKind::DeadLetter,
                    format!("dead-letter task '{}' after {} retries", task.description, task.retry_count),
                )
                .about(task_id)
                .with_attributes(serde_json::json!({
                    "task_type": task.task_type,
                    "priority": task.priority,
                    "retry_count": task.retry_count,
                    "max_retries": task.max_retries,
                    "error": error,
                }));
                Some(self.validator.validate(task.assigned_agent, context, panel).await?)
            }
            _ => None,
        };

        let outcome = match owner {
            Some(agent_id) => self.queue.fail_as(task_id, agent_id, error)?,
            None => self.queue.fail(task_id, error)?,
        };

        if let Some(record) = record.filter(ValidationRecord::requires_escalation) {
            self.escalate(&record, task.assigned_agent);
        }
        if outcome.is_dead_lettered() {
            self.report_dead_letter(task_id);
        }
        Ok(outcome)
    }

    /// Cancel a non-terminal task.
    pub fn cancel_task(&self, task_id: Uuid) -> HierarchResult<Task> {
        self.queue.cancel(task_id)
    }

    fn escalate(&self, record: &ValidationRecord, sender: Option<Uuid>) {
        warn!(
            record_id = %record.id,
            confidence = record.confidence,
            "Decision escalated for review"
        );
        self.mailbox.post(
            Message::new(sender.unwrap_or(COORDINATOR_ID), None, MessageType::ValidationRequest)
                .with_priority(10)
                .with_payload(serde_json::json!({
                    "record_id": record.id,
                    "subject": record.decision_context.subject,
                    "kind": record.decision_context.kind,
                    "final_decision": record.final_decision,
                    "confidence": record.confidence,
                })),
        );
    }

    /// Send a dead-lettered task's error upward from the agent that ran it.
    fn report_dead_letter(&self, task_id: Uuid) {
        let Some(task) = self.queue.get(task_id) else {
            return;
        };
        let sender = task.assigned_agent.unwrap_or(COORDINATOR_ID);
        let parent = task
            .assigned_agent
            .and_then(|agent| self.supervisor.get(agent))
            .and_then(|agent| agent.parent_id);

        self.mailbox.post(Message::error_report(
            sender,
            parent,
            serde_json::json!({
                "task_id": task.id,
                "task_type": task.task_type,
                "status": "dead_lettered",
                "retry_count": task.retry_count,
                "error": task.error,
            }),
        ));
    }

    // --- agents ---

    /// Spawn an agent and start tracking its heartbeat.
    ///
    /// With `gating.spawn_roots` and a panel configured, new roots must reach
    /// consensus first; otherwise `ConsensusNotReached` is returned and nothing
    /// is spawned.
    pub async fn spawn_agent(&self, request: SpawnRequest) -> HierarchResult<AgentNode> {
        if request.parent_id.is_none() && self.config.gating.spawn_roots {
            match &self.panel {
                Some(panel) => {
                    let context = DecisionContext::new(
                        DecisionKind::SpawnSubtree,
                        format!("spawn root agent of type '{}'", request.agent_type),
                    )
                    .with_attributes(serde_json::json!({
                        "agent_type": request.agent_type,
                        "max_children": request.max_children,
                        "active_agents": self.supervisor.active_count(),
                    }));
                    let record = self.validator.validate(None, context, panel).await?;
                    if !record.consensus_reached {
                        self.escalate(&record, None);
                        return Err(HierarchError::ConsensusNotReached {
                            decision: record.final_decision,
                            record: record.id,
                            confidence: record.confidence,
                        });
                    }
                }
                None => debug!("Root spawn gating enabled but no scorer panel configured"),
            }
        }

        let node = self.supervisor.spawn(request)?;
        self.telemetry.register(node.id, None, Utc::now());
        Ok(node)
    }

    /// Terminate an agent, release its in-flight tasks and stop tracking it.
    pub fn finish_agent(
        &self,
        agent_id: Uuid,
        status: AgentStatus,
        reason: Option<String>,
    ) -> HierarchResult<bool> {
        let changed = self.supervisor.mark_terminal(agent_id, status, reason)?;
        if changed {
            self.release_tasks_of(agent_id, &format!("agent {agent_id} terminated ({status})"));
            self.telemetry.forget(agent_id);
        }
        Ok(changed)
    }

    /// Give every task held by `agent_id` back to the queue (or dead-letter it).
    fn release_tasks_of(&self, agent_id: Uuid, reason: &str) {
        for task_id in self.queue.in_flight_for(agent_id) {
            match self.queue.abandon(task_id, reason) {
                Ok(outcome) if outcome.is_dead_lettered() => self.report_dead_letter(task_id),
                Ok(_) => {}
                Err(e) => debug!(task_id = %task_id, error = %e, "Task already moved on"),
            }
        }
    }

    /// Accept a health sample from a live agent.
    pub fn report(&self, sample: HealthSample) -> HierarchResult<()> {
        match self.supervisor.get(sample.agent_id) {
            None => return Err(HierarchError::AgentNotFound(sample.agent_id)),
            Some(agent) if agent.status.is_terminal() => {
                return Err(HierarchError::AgentNotActive(sample.agent_id))
            }
            Some(_) => {}
        }
        self.telemetry.report(sample);
        Ok(())
    }

    /// Validate an arbitrary decision with the configured panel.
    pub async fn validate(
        &self,
        agent_id: Option<Uuid>,
        context: DecisionContext,
    ) -> HierarchResult<ValidationRecord> {
        let panel = self
            .panel
            .as_ref()
            .ok_or_else(|| HierarchError::Config("no scorer panel configured".into()))?;
        self.validator.validate(agent_id, context, panel).await
    }

    // --- supervision ---

    /// Act on every advisory telemetry has queued.
    ///
    /// The agent's in-flight tasks are released, the agent is marked
    /// `timeout` (silent) or `failed` (error budget) and restarted while its
    /// restart budget lasts.
    pub fn process_advisories(&self) -> Vec<AdvisoryAction> {
        let pending: Vec<Advisory> = {
            let mut rx = self.advisories.lock();
            std::iter::from_fn(|| rx.try_recv().ok()).collect()
        };

        let mut seen = HashSet::new();
        pending
            .into_iter()
            .filter(|a| seen.insert(a.agent_id()))
            .map(|advisory| self.handle_advisory(&advisory))
            .collect()
    }

    fn handle_advisory(&self, advisory: &Advisory) -> AdvisoryAction {
        let agent_id = advisory.agent_id();
        let (status, reason) = match advisory {
            Advisory::Unresponsive { silent_for_ms, .. } => (
                AgentStatus::Timeout,
                format!("no heartbeat for {silent_for_ms} ms"),
            ),
            Advisory::ErrorBudgetExceeded { mean_error_rate, .. } => (
                AgentStatus::Failed,
                format!("error rate {mean_error_rate:.2} over budget"),
            ),
        };

        match self.supervisor.mark_terminal(agent_id, status, Some(reason.clone())) {
            Ok(true) => {}
            Ok(false) | Err(_) => {
                self.telemetry.forget(agent_id);
                return AdvisoryAction::Ignored { agent_id };
            }
        }
        self.release_tasks_of(agent_id, &reason);

        let max_attempts = self.config.supervisor.max_restart_attempts;
        match self.supervisor.restart(agent_id, max_attempts) {
            Ok(node) => {
                self.telemetry.register(agent_id, None, Utc::now());
                AdvisoryAction::Restarted {
                    agent_id,
                    restart_count: node.restart_count,
                }
            }
            Err(HierarchError::RestartBudgetExhausted { .. }) => {
                let cancelled: Vec<Uuid> = self
                    .supervisor
                    .descendants(agent_id)
                    .into_iter()
                    .filter(|id| {
                        self.supervisor
                            .get(*id)
                            .is_some_and(|a| a.status == AgentStatus::Cancelled)
                    })
                    .collect();
                for id in cancelled.iter().chain(std::iter::once(&agent_id)) {
                    self.release_tasks_of(*id, "subtree abandoned");
                    self.telemetry.forget(*id);
                }
                AdvisoryAction::Abandoned {
                    agent_id,
                    cancelled,
                }
            }
            Err(e) => {
                warn!(agent_id = %agent_id, error = %e, "Agent could not be restarted");
                self.telemetry.forget(agent_id);
                AdvisoryAction::Terminated {
                    agent_id,
                    reason: e.to_string(),
                }
            }
        }
    }

    /// One maintenance pass: timeout sweep, liveness scan, advisory handling,
    /// and cancellation of tasks stuck behind dead dependencies.
    pub fn maintenance_tick(&self, now: DateTime<Utc>) -> MaintenanceReport {
        let sweep = self.queue.sweep_timeouts(now);
        for (task_id, outcome) in &sweep.timed_out {
            if outcome.is_dead_lettered() {
                self.report_dead_letter(*task_id);
            }
        }

        self.telemetry.scan(now);
        let advisories = self.process_advisories();

        // Cancelling one orphan can orphan its own dependents, so repeat.
        let mut orphans_cancelled = Vec::new();
        loop {
            let blocked = self.queue.blocked_by_terminal();
            if blocked.is_empty() {
                break;
            }
            for (task_id, dependency) in blocked {
                let reason = format!("dependency {dependency} will never complete");
                if self.queue.cancel_with_reason(task_id, Some(reason)).is_ok() {
                    orphans_cancelled.push(task_id);
                }
            }
        }

        let report = MaintenanceReport {
            sweep,
            advisories,
            orphans_cancelled,
        };
        if !report.is_quiet() {
            info!(
                timed_out = report.sweep.timed_out.len(),
                expired = report.sweep.expired.len(),
                advisories = report.advisories.len(),
                orphans = report.orphans_cancelled.len(),
                "Maintenance pass"
            );
        }
        report
    }

    // --- views ---

    /// Task counts per status.
    pub fn stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Export the four engine tables.
    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            taken_at: Utc::now(),
            tasks: self.queue.all_tasks(),
            agents: self.supervisor.all_agents(),
            health: self.telemetry.snapshot(),
            validations: self.validator.ledger().records(),
        }
    }
}
