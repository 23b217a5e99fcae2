use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// Default retry budget for a task.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default fan-out limit for an agent.
pub const DEFAULT_MAX_CHILDREN: u32 = 5;
/// Deepest level an agent may occupy in the spawn hierarchy (root = 0).
pub const MAX_DEPTH: u32 = 3;

/// Status of a task in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for its dependencies or a claim.
    Pending,
    /// Reserved by an agent, not started yet.
    Assigned,
    /// Being executed by its assigned agent.
    InProgress,
    /// Finished with a result.
    Completed,
    /// Dead-lettered: the retry budget is exhausted.
    Failed,
    /// Withdrawn; never retried.
    Cancelled,
}

impl TaskStatus {
    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether `self -> next` is an edge of the task state machine.
    ///
    /// `assigned -> pending|failed` only happens through a timeout, and
    /// `in_progress -> pending` is a retry requeue.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Assigned)
                | (Pending, Cancelled)
                | (Assigned, InProgress)
                | (Assigned, Pending)
                | (Assigned, Failed)
                | (Assigned, Cancelled)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Pending)
                | (InProgress, Cancelled)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// A unit of work in the orchestration queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task ID.
    pub id: Uuid,
    /// Routing key matched against agent types.
    pub task_type: String,
    /// Human-readable summary of the work.
    pub description: String,
    /// 1..=10, higher is served first.
    pub priority: u8,
    /// Current lifecycle state.
    pub status: TaskStatus,
    /// Agent holding the current attempt.
    pub assigned_agent: Option<Uuid>,
    /// When the task was built.
    pub created_at: DateTime<Utc>,
    /// FIFO position within a priority level; reset on every requeue.
    pub queued_at: DateTime<Utc>,
    /// Insertion counter assigned by the queue, the final tie-break.
    #[serde(default)]
    pub sequence: u64,
    /// Latest moment the current attempt may still finish.
    pub deadline: Option<DateTime<Utc>>,
    /// Length of one attempt's deadline window, captured at submission.
    #[serde(default)]
    pub deadline_window_ms: Option<i64>,
    /// Failed attempts so far.
    pub retry_count: u32,
    /// Failed attempts allowed before dead-lettering.
    pub max_retries: u32,
    /// Tasks that must complete before this one is ready.
    pub dependencies: Vec<Uuid>,
    /// Opaque input for the worker.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Output of the completing attempt.
    pub result: Option<serde_json::Value>,
    /// Most recent failure or cancellation reason.
    pub error: Option<String>,
    /// Bumped on every mutation; claims commit only against the version they read.
    #[serde(default)]
    pub version: u64,
    /// When the task reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// A pending task with priority 5, the default retry budget and no deadline.
    pub fn new(task_type: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            task_type: task_type.into(),
            description: description.into(),
            priority: 5,
            status: TaskStatus::Pending,
            assigned_agent: None,
            created_at: now,
            queued_at: now,
            sequence: 0,
            deadline: None,
            deadline_window_ms: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            dependencies: Vec::new(),
            payload: serde_json::Value::Null,
            result: None,
            error: None,
            version: 0,
            completed_at: None,
        }
    }

    /// Set the priority (validated on submit).
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Set dependencies; duplicates are dropped.
    pub fn with_dependencies(mut self, deps: Vec<Uuid>) -> Self {
        let mut seen = HashSet::new();
        self.dependencies = deps.into_iter().filter(|d| seen.insert(*d)).collect();
        self
    }

    /// Absolute deadline for the first attempt.
    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Deadline relative to creation time.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(self.created_at + timeout);
        self
    }

    /// Set the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Attach worker input.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Whether the deadline (if any) has passed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|d| now > d)
    }

    /// Claimable: pending, all dependencies completed, deadline not elapsed.
    pub fn is_ready(&self, completed: &HashSet<Uuid>, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending
            && !self.is_expired(now)
            && self.dependencies.iter().all(|dep| completed.contains(dep))
    }

    /// Whether another attempt is allowed after a failure.
    pub fn has_retries_left(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

/// What happened to a task after a failure (explicit or timeout).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum FailureOutcome {
    /// Back in the queue at the same priority.
    Requeued {
        /// Failed attempts so far, this one included.
        retry_count: u32,
    },
    /// Terminal `failed`; needs external intervention.
    DeadLettered {
        /// Failed attempts before the last one.
        retry_count: u32,
    },
}

impl FailureOutcome {
    /// The task ended in the dead-letter state.
    pub fn is_dead_lettered(&self) -> bool {
        matches!(self, FailureOutcome::DeadLettered { .. })
    }
}

/// Lifecycle status of an agent node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Running and holding a slot in its parent.
    Active,
    /// Finished normally.
    Completed,
    /// Crashed or blew its error budget; restartable.
    Failed,
    /// Stopped heartbeating; restartable.
    Timeout,
    /// Stopped because an ancestor was abandoned or cancelled.
    Cancelled,
}

impl AgentStatus {
    /// Anything but `Active`.
    pub fn is_terminal(self) -> bool {
        self != AgentStatus::Active
    }

    /// Only crashed or unresponsive agents may be restarted.
    pub fn is_restartable(self) -> bool {
        matches!(self, AgentStatus::Failed | AgentStatus::Timeout)
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Active => write!(f, "active"),
            AgentStatus::Completed => write!(f, "completed"),
            AgentStatus::Failed => write!(f, "failed"),
            AgentStatus::Timeout => write!(f, "timeout"),
            AgentStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A node in the agent spawn hierarchy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentNode {
    /// Unique agent ID, kept across restarts.
    pub id: Uuid,
    /// `None` for a root agent.
    pub parent_id: Option<Uuid>,
    /// Role of the agent; drives routing and per-type caps.
    pub agent_type: String,
    /// Distance from the root (root = 0).
    pub depth: u32,
    /// Current lifecycle state.
    pub status: AgentStatus,
    /// Fan-out limit for this agent.
    pub max_children: u32,
    /// Active children holding a slot; only the supervisor touches this.
    pub current_children: u32,
    /// Restarts performed so far.
    #[serde(default)]
    pub restart_count: u32,
    /// Set once the restart budget ran out; the subtree is abandoned.
    #[serde(default)]
    pub abandoned: bool,
    /// When the agent was spawned.
    pub created_at: DateTime<Utc>,
    /// When the agent last left `Active`.
    pub terminated_at: Option<DateTime<Utc>>,
    /// Reason for the last termination, if any.
    pub error: Option<String>,
    /// Opaque collaborator data (persona, labels, ...). Never read for control decisions.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl AgentNode {
    /// Whether the agent has no parent.
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Whether another child slot is free.
    pub fn has_capacity(&self) -> bool {
        self.current_children < self.max_children
    }
}

/// One health/heartbeat report from an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSample {
    /// Reporting agent.
    pub agent_id: Uuid,
    /// When the sample was taken.
    pub timestamp: DateTime<Utc>,
    /// CPU usage in percent.
    pub cpu_pct: f64,
    /// Resident memory in MiB.
    pub mem_mb: f64,
    /// Context tokens in use.
    pub context_used: u64,
    /// Context window size; 0 when unknown.
    pub context_max: u64,
    /// Fraction in [0, 1].
    pub success_rate: f64,
    /// Fraction in [0, 1].
    pub error_rate: f64,
    /// Liveness timestamp telemetry compares against.
    pub last_heartbeat: DateTime<Utc>,
}

impl HealthSample {
    /// A bare heartbeat with neutral resource figures.
    pub fn heartbeat(agent_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            agent_id,
            timestamp: now,
            cpu_pct: 0.0,
            mem_mb: 0.0,
            context_used: 0,
            context_max: 0,
            success_rate: 1.0,
            error_rate: 0.0,
            last_heartbeat: now,
        }
    }

    /// Backdate or postdate the sample and its heartbeat.
    pub fn at(mut self, when: DateTime<Utc>) -> Self {
        self.timestamp = when;
        self.last_heartbeat = when;
        self
    }

    /// Set success and error rates, clamped to [0, 1].
    pub fn with_rates(mut self, success_rate: f64, error_rate: f64) -> Self {
        self.success_rate = success_rate.clamp(0.0, 1.0);
        self.error_rate = error_rate.clamp(0.0, 1.0);
        self
    }

    /// Set resource figures.
    pub fn with_resources(mut self, cpu_pct: f64, mem_mb: f64) -> Self {
        self.cpu_pct = cpu_pct;
        self.mem_mb = mem_mb;
        self
    }

    /// Set context window usage.
    pub fn with_context(mut self, used: u64, max: u64) -> Self {
        self.context_used = used;
        self.context_max = max;
        self
    }

    /// Share of the context window in use, if a window is known.
    pub fn context_utilization(&self) -> Option<f64> {
        (self.context_max > 0).then(|| self.context_used as f64 / self.context_max as f64)
    }
}

/// Kind of decision submitted to the consensus validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    /// Spawning a new root subtree.
    SpawnSubtree,
    /// Dead-lettering a task.
    DeadLetter,
    /// Restarting an agent.
    Restart,
    /// Anything submitted by a caller.
    Custom,
}

/// The decision the four scorers evaluate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionContext {
    /// What is being decided.
    pub kind: DecisionKind,
    /// Record the decision is about (task or agent).
    pub subject: Option<Uuid>,
    /// One-line description shown to scorers and reviewers.
    pub summary: String,
    /// Free-form facts the scorers may inspect.
    #[serde(default)]
    pub attributes: serde_json::Value,
}

impl DecisionContext {
    /// A decision with no subject and no attributes.
    pub fn new(kind: DecisionKind, summary: impl Into<String>) -> Self {
        Self {
            kind,
            subject: None,
            summary: summary.into(),
            attributes: serde_json::Value::Null,
        }
    }

    /// Name the task or agent the decision concerns.
    pub fn about(mut self, subject: Uuid) -> Self {
        self.subject = Some(subject);
        self
    }

    /// Attach facts for the scorers.
    pub fn with_attributes(mut self, attributes: serde_json::Value) -> Self {
        self.attributes = attributes;
        self
    }
}

/// The four independent sub-scores, each in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerspectiveScores {
    /// Is the decision likely to be correct.
    pub plausibility: f64,
    /// Does it fit the agent's role.
    pub identity_consistency: f64,
    /// Score after arguing against it.
    pub self_critique: f64,
    /// Does it agree with earlier decisions and policy.
    pub meta_consistency: f64,
}

impl PerspectiveScores {
    /// Scores in panel slot order.
    pub fn as_array(&self) -> [f64; 4] {
        [
            self.plausibility,
            self.identity_consistency,
            self.self_critique,
            self.meta_consistency,
        ]
    }

    /// Arithmetic mean of the four scores.
    pub fn mean(&self) -> f64 {
        self.as_array().iter().sum::<f64>() / 4.0
    }

    /// `max - min` across the four scores.
    pub fn spread(&self) -> f64 {
        let scores = self.as_array();
        let max = scores.iter().copied().fold(f64::MIN, f64::max);
        let min = scores.iter().copied().fold(f64::MAX, f64::min);
        max - min
    }
}

/// Immutable outcome of one consensus validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationRecord {
    /// Unique record ID.
    pub id: Uuid,
    /// Agent the decision concerns; `None` for coordinator-level decisions.
    pub agent_id: Option<Uuid>,
    /// The decision that was scored.
    pub decision_context: DecisionContext,
    /// The four sub-scores.
    pub scores: PerspectiveScores,
    /// Mean of the sub-scores.
    pub combined_score: f64,
    /// Highest minus lowest sub-score.
    pub spread: f64,
    /// Combined score met the threshold and the spread stayed within bounds.
    pub consensus_reached: bool,
    /// Position of the highest-scoring perspective.
    pub advocate_position: String,
    /// Position of the lowest-scoring perspective.
    pub challenger_position: String,
    /// Advocate position on consensus, challenger position otherwise.
    pub final_decision: String,
    /// How strongly the final decision is backed.
    pub confidence: f64,
    /// When the validation ran.
    pub created_at: DateTime<Utc>,
    /// Hash of the preceding record in the ledger (empty for the first).
    #[serde(default)]
    pub prev_hash: String,
    /// SHA-256 over `prev_hash` and this record's body.
    #[serde(default)]
    pub hash: String,
}

impl ValidationRecord {
    /// Decisions without consensus must be escalated, not auto-applied.
    pub fn requires_escalation(&self) -> bool {
        !self.consensus_reached
    }
}

/// Counts per task status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Tasks in `pending`.
    pub pending: usize,
    /// Tasks in `assigned`.
    pub assigned: usize,
    /// Tasks in `in_progress`.
    pub in_progress: usize,
    /// Tasks in `completed`.
    pub completed: usize,
    /// Dead-lettered tasks.
    pub failed: usize,
    /// Tasks in `cancelled`.
    pub cancelled: usize,
}

impl QueueStats {
    /// Tally a set of task statuses.
    pub fn from_statuses(statuses: impl IntoIterator<Item = TaskStatus>) -> Self {
        let mut stats = Self::default();
        for status in statuses {
            match status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Assigned => stats.assigned += 1,
                TaskStatus::InProgress => stats.in_progress += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// Sum over every status.
    pub fn total(&self) -> usize {
        self.pending + self.assigned + self.in_progress + self.completed + self.failed + self.cancelled
    }

    /// Nothing left to run or running.
    pub fn is_drained(&self) -> bool {
        self.pending + self.assigned + self.in_progress == 0
    }
}
