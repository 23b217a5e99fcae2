use thiserror::Error;
use uuid::Uuid;

/// A convenience `Result` alias using [`HierarchError`].
pub type HierarchResult<T> = Result<T, HierarchError>;

/// Top-level error type for the Hierarch engine.
///
/// Variants fall into three groups:
/// - transient conflicts the caller retries with its own backoff ([`HierarchError::ClaimConflict`]),
/// - structural violations surfaced immediately and never retried by the engine
///   (hierarchy limits, illegal transitions, bad input),
/// - infrastructure errors (config, JSON, I/O).
#[derive(Error, Debug)]
pub enum HierarchError {
    /// A submitted task lists a dependency that does not exist.
    #[error("Invalid dependency: task {task} depends on unknown task {dependency}")]
    InvalidDependency {
        /// The task being submitted.
        task: Uuid,
        /// The dependency that could not be resolved.
        dependency: Uuid,
    },

    /// Another caller claimed the task first.
    #[error("Claim conflict: task {0} was claimed by another agent")]
    ClaimConflict(Uuid),

    /// A state transition between non-adjacent states was requested.
    #[error("Invalid transition for {entity} {id}: {from} -> {to}")]
    InvalidTransition {
        /// Kind of record ("task" or "agent").
        entity: &'static str,
        /// Record ID.
        id: Uuid,
        /// Current state.
        from: String,
        /// Requested state.
        to: String,
    },

    /// The parent agent is already at the maximum hierarchy depth.
    #[error("Depth exceeded: parent {parent} is at depth {depth} (max {max})")]
    DepthExceeded {
        /// Parent agent ID.
        parent: Uuid,
        /// Depth of the parent.
        depth: u32,
        /// Configured maximum depth.
        max: u32,
    },

    /// The parent agent already has its maximum number of children.
    #[error("Capacity exceeded: parent {parent} already has {current} children (max {max})")]
    CapacityExceeded {
        /// Parent agent ID.
        parent: Uuid,
        /// Current child count.
        current: u32,
        /// The parent's fan-out limit.
        max: u32,
    },

    /// Too many agents of this type are active at once.
    #[error("Type concurrency exceeded: {agent_type} has {active} active agents (max {max})")]
    TypeConcurrencyExceeded {
        /// Agent type being spawned.
        agent_type: String,
        /// Number of currently active agents of that type.
        active: usize,
        /// Configured cap.
        max: usize,
    },

    /// A task ran past its deadline.
    #[error("Timeout: task {0} exceeded its deadline")]
    Timeout(Uuid),

    /// A scorer produced a non-numeric score.
    #[error("Invalid score from scorer '{scorer}': {reason}")]
    InvalidScore {
        /// Name of the offending scorer.
        scorer: String,
        /// What was wrong with its output.
        reason: String,
    },

    /// Task priority outside the accepted 1..=10 range.
    #[error("Invalid priority {0}: must be between 1 and 10")]
    InvalidPriority(u8),

    /// A record with this ID is already registered.
    #[error("{entity} {id} already exists")]
    AlreadyExists {
        /// Kind of record.
        entity: &'static str,
        /// Record ID.
        id: Uuid,
    },

    /// No task with this ID is known.
    #[error("Task {0} not found")]
    TaskNotFound(Uuid),

    /// No agent with this ID is known.
    #[error("Agent {0} not found")]
    AgentNotFound(Uuid),

    /// The agent is in a terminal state and cannot act.
    #[error("Agent {0} is not active")]
    AgentNotActive(Uuid),

    /// The task was cancelled; the worker must abort at its checkpoint.
    #[error("Task {0} was cancelled")]
    Cancelled(Uuid),

    /// The agent used up its restart budget; its subtree has been abandoned.
    #[error("Restart budget exhausted for agent {agent} after {attempts} attempts")]
    RestartBudgetExhausted {
        /// Agent ID.
        agent: Uuid,
        /// Restarts already performed.
        attempts: u32,
    },

    /// A gated decision did not reach consensus and must be escalated.
    #[error("Consensus not reached for {decision} (record {record}, confidence {confidence:.2})")]
    ConsensusNotReached {
        /// Short description of the gated decision.
        decision: String,
        /// ID of the validation record explaining the outcome.
        record: Uuid,
        /// Confidence of the escalated decision.
        confidence: f64,
    },

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl HierarchError {
    /// Whether the caller should retry the operation after a backoff.
    ///
    /// Only claim conflicts are transient; hierarchy violations, illegal
    /// transitions and exhausted budgets are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HierarchError::ClaimConflict(_))
    }

    /// Whether the error is a spawn-hierarchy limit violation.
    pub fn is_hierarchy_violation(&self) -> bool {
        matches!(
            self,
            HierarchError::DepthExceeded { .. }
                | HierarchError::CapacityExceeded { .. }
                | HierarchError::TypeConcurrencyExceeded { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_claim_conflict_is_retryable() {
        assert!(HierarchError::ClaimConflict(Uuid::new_v4()).is_retryable());
        assert!(!HierarchError::Timeout(Uuid::new_v4()).is_retryable());
        assert!(!HierarchError::DepthExceeded {
            parent: Uuid::new_v4(),
            depth: 3,
            max: 3,
        }
        .is_retryable());
    }

    #[test]
    fn test_hierarchy_violations() {
        let err = HierarchError::TypeConcurrencyExceeded {
            agent_type: "coder".into(),
            active: 4,
            max: 4,
        };
        assert!(err.is_hierarchy_violation());
        assert!(!HierarchError::TaskNotFound(Uuid::new_v4()).is_hierarchy_violation());
    }

    #[test]
    fn test_error_messages() {
        let parent = Uuid::new_v4();
        let err = HierarchError::CapacityExceeded {
            parent,
            current: 5,
            max: 5,
        };
        assert!(err.to_string().contains("already has 5 children"));
        assert_eq!(
            HierarchError::InvalidPriority(11).to_string(),
            "Invalid priority 11: must be between 1 and 10"
        );
    }
}
