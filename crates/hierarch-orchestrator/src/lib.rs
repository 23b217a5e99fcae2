//! Hierarchical multi-agent task orchestration.
//!
//! A [`Coordinator`] owns four shared components and keeps them consistent:
//!
//! - [`TaskQueue`]: Priority queue with dependencies, exclusive claims, retries and dead-lettering.
//! - [`AgentSupervisor`]: Bounded spawn tree (depth, fan-out, per-type concurrency) with restarts.
//! - [`TelemetryStore`]: Heartbeat and error-rate tracking that raises advisories.
//! - [`ConsensusValidator`]: Four-perspective scoring of decisions into a hash-chained ledger.
//!
//! [`MaintenanceLoop`] drives timeout sweeps and liveness scans; [`WorkerPool`]
//! runs tokio workers that pull from the queue.

/// Engine configuration (TOML).
pub mod config;
/// Four-perspective consensus validation.
pub mod consensus;
/// Component wiring and cross-component policies.
pub mod coordinator;
/// Hash-chained validation ledger.
pub mod ledger;
/// In-memory message log between agents.
pub mod mailbox;
/// Periodic sweep/scan driver.
pub mod maintenance;
/// JSON snapshot persistence.
pub mod store;
/// Agent spawn hierarchy.
pub mod supervisor;
/// Priority task queue.
pub mod task_queue;
/// Heartbeat and health telemetry.
pub mod telemetry;
/// Shared orchestration types (Task, AgentNode, HealthSample, ValidationRecord, etc.).
pub mod types;
/// Tokio worker pool.
pub mod worker;

pub use config::EngineConfig;
pub use consensus::{ConsensusValidator, FnScorer, Perspective, Scorer, ScorerPanel, StaticScorer, Verdict};
pub use coordinator::{AdvisoryAction, Coordinator, MaintenanceReport, COORDINATOR_ID};
pub use ledger::ValidationLedger;
pub use mailbox::Mailbox;
pub use maintenance::MaintenanceLoop;
pub use store::{EngineSnapshot, JsonSnapshotStore};
pub use supervisor::{AgentSupervisor, SpawnRequest};
pub use task_queue::{ClaimFilter, SweepReport, TaskQueue};
pub use telemetry::{Advisory, TelemetryStore};
pub use types::{
    AgentNode, AgentStatus, DecisionContext, DecisionKind, FailureOutcome, HealthSample,
    PerspectiveScores, QueueStats, Task, TaskStatus, ValidationRecord,
};
pub use worker::{PoolOptions, TaskHandler, WorkerContext, WorkerPool, WorkerStats};
