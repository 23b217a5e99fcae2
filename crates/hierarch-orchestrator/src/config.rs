//! Engine configuration loaded from TOML.
//!
//! Every section and field has a default, so an empty document is a valid
//! configuration:
//!
//! ```toml
//! data_dir = "./data"
//!
//! [queue]
//! default_max_retries = 3
//! sweep_interval_secs = 5
//!
//! [supervisor]
//! max_depth = 3
//! default_max_children = 5
//! type_limits = { coder = 4 }
//!
//! [telemetry]
//! heartbeat_interval_secs = 30
//! error_rate_threshold = 0.3
//!
//! [consensus]
//! consensus_threshold = 0.6
//! divergence_threshold = 0.3
//!
//! [routing]
//! coder = ["code", "refactor"]
//! ```

use crate::types::{DEFAULT_MAX_CHILDREN, DEFAULT_MAX_RETRIES, MAX_DEPTH};
use hierarch_core::{HierarchError, HierarchResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound for `telemetry.heartbeat_interval_secs` and `queue.sweep_interval_secs`.
pub const MAX_INTERVAL_SECS: u64 = 86_400;
/// Upper bound for `telemetry.staleness_multiplier`.
pub const MAX_STALENESS_MULTIPLIER: u32 = 1_000;
/// Upper bound for `queue.claim_poll_ms` and `queue.claim_backoff_ms`.
pub const MAX_CLAIM_WAIT_MS: u64 = 3_600_000;

/// Top-level configuration for a coordinator and its components.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Where snapshots and the validation ledger are written.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Task queue settings.
    #[serde(default)]
    pub queue: QueueConfig,
    /// Spawn hierarchy limits.
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    /// Liveness and error-budget settings.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    /// Consensus thresholds.
    #[serde(default)]
    pub consensus: ConsensusConfig,
    /// Which transitions need consensus.
    #[serde(default)]
    pub gating: GatingConfig,
    /// Agent type -> task types it may claim. Types without an entry claim anything.
    #[serde(default)]
    pub routing: HashMap<String, Vec<String>>,
}

/// Task queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Retry budget for tasks submitted without an explicit one.
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    /// Upper bound on how long a waiting claim sleeps before re-polling.
    #[serde(default = "default_claim_poll_ms")]
    pub claim_poll_ms: u64,
    /// Backoff after losing a claim race.
    #[serde(default = "default_claim_backoff_ms")]
    pub claim_backoff_ms: u64,
    /// Period of the timeout sweep.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

/// Spawn hierarchy limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Deepest level an agent may be spawned at (root = 0).
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
    /// Fan-out limit for agents spawned without one.
    #[serde(default = "default_max_children")]
    pub default_max_children: u32,
    /// Per-type cap on simultaneously active agents.
    #[serde(default)]
    pub type_limits: HashMap<String, usize>,
    /// Cap for types without an entry in `type_limits`; `None` means unlimited.
    #[serde(default)]
    pub default_type_limit: Option<usize>,
    /// Restarts allowed per agent before its subtree is abandoned.
    #[serde(default = "default_max_restart_attempts")]
    pub max_restart_attempts: u32,
}

/// Liveness and error-budget settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Expected heartbeat interval for agents without their own.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// An agent is unresponsive after `multiplier x interval` of silence.
    #[serde(default = "default_staleness_multiplier")]
    pub staleness_multiplier: u32,
    /// Mean error rate above which an agent is over budget.
    #[serde(default = "default_error_rate_threshold")]
    pub error_rate_threshold: f64,
    /// Number of most recent samples the error budget is computed over.
    #[serde(default = "default_error_window")]
    pub error_window: usize,
    /// Samples kept per agent in the audit history.
    #[serde(default = "default_history_retention")]
    pub history_retention: usize,
}

/// Consensus thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// Minimum combined score for consensus.
    #[serde(default = "default_consensus_threshold")]
    pub consensus_threshold: f64,
    /// Maximum spread between sub-scores for consensus.
    #[serde(default = "default_divergence_threshold")]
    pub divergence_threshold: f64,
}

/// Which risky transitions are routed through the consensus validator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatingConfig {
    /// Validate before spawning a new root subtree.
    #[serde(default)]
    pub spawn_roots: bool,
    /// Validate before dead-lettering a task.
    #[serde(default = "default_true")]
    pub dead_letters: bool,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}
fn default_claim_poll_ms() -> u64 {
    250
}
fn default_claim_backoff_ms() -> u64 {
    10
}
fn default_sweep_interval_secs() -> u64 {
    5
}
fn default_max_depth() -> u32 {
    MAX_DEPTH
}
fn default_max_children() -> u32 {
    DEFAULT_MAX_CHILDREN
}
fn default_max_restart_attempts() -> u32 {
    3
}
fn default_heartbeat_interval_secs() -> u64 {
    30
}
fn default_staleness_multiplier() -> u32 {
    3
}
fn default_error_rate_threshold() -> f64 {
    0.3
}
fn default_error_window() -> usize {
    10
}
fn default_history_retention() -> usize {
    1000
}
fn default_consensus_threshold() -> f64 {
    0.6
}
fn default_divergence_threshold() -> f64 {
    0.3
}
fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            queue: QueueConfig::default(),
            supervisor: SupervisorConfig::default(),
            telemetry: TelemetryConfig::default(),
            consensus: ConsensusConfig::default(),
            gating: GatingConfig::default(),
            routing: HashMap::new(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_max_retries: default_max_retries(),
            claim_poll_ms: default_claim_poll_ms(),
            claim_backoff_ms: default_claim_backoff_ms(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            default_max_children: default_max_children(),
            type_limits: HashMap::new(),
            default_type_limit: None,
            max_restart_attempts: default_max_restart_attempts(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            staleness_multiplier: default_staleness_multiplier(),
            error_rate_threshold: default_error_rate_threshold(),
            error_window: default_error_window(),
            history_retention: default_history_retention(),
        }
    }
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            consensus_threshold: default_consensus_threshold(),
            divergence_threshold: default_divergence_threshold(),
        }
    }
}

impl Default for GatingConfig {
    fn default() -> Self {
        Self {
            spawn_roots: false,
            dead_letters: default_true(),
        }
    }
}

impl QueueConfig {
    /// Claim poll interval.
    pub fn claim_poll(&self) -> Duration {
        Duration::from_millis(self.claim_poll_ms)
    }

    /// Backoff after a lost claim race.
    pub fn claim_backoff(&self) -> Duration {
        Duration::from_millis(self.claim_backoff_ms)
    }

    /// Period of the timeout sweep.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl SupervisorConfig {
    /// Active-agent cap for a type, if any.
    pub fn type_limit(&self, agent_type: &str) -> Option<usize> {
        self.type_limits
            .get(agent_type)
            .copied()
            .or(self.default_type_limit)
    }
}

impl TelemetryConfig {
    /// Default expected heartbeat interval, saturating on overflow.
    pub fn heartbeat_interval(&self) -> chrono::Duration {
        i64::try_from(self.heartbeat_interval_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX)
    }
}

impl EngineConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> HierarchResult<Self> {
        let config: EngineConfig = toml::from_str(content)
            .map_err(|e| HierarchError::Config(format!("Invalid engine config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub async fn load(path: impl AsRef<Path>) -> HierarchResult<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            HierarchError::Config(format!(
                "Failed to read config file '{}': {e}",
                path.display()
            ))
        })?;
        Self::from_toml_str(&content)
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml_string(&self) -> HierarchResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| HierarchError::Config(format!("Cannot serialize config: {e}")))
    }

    /// Agent type -> accepted task types, if routing restricts it.
    pub fn accepted_task_types(&self, agent_type: &str) -> Option<&[String]> {
        self.routing.get(agent_type).map(Vec::as_slice)
    }

    /// Reject values that would make the engine misbehave.
    pub fn validate(&self) -> HierarchResult<()> {
        let c = &self.consensus;
        for (name, value) in [
            ("consensus.consensus_threshold", c.consensus_threshold),
            ("consensus.divergence_threshold", c.divergence_threshold),
            ("telemetry.error_rate_threshold", self.telemetry.error_rate_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(HierarchError::Config(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }
        if self.supervisor.max_depth > MAX_DEPTH {
            return Err(HierarchError::Config(format!(
                "supervisor.max_depth must be at most {MAX_DEPTH}, got {}",
                self.supervisor.max_depth
            )));
        }
        if self.supervisor.default_max_children == 0 {
            return Err(HierarchError::Config(
                "supervisor.default_max_children must be positive".into(),
            ));
        }
        if self.telemetry.heartbeat_interval_secs == 0 || self.telemetry.staleness_multiplier == 0 {
            return Err(HierarchError::Config(
                "telemetry heartbeat interval and staleness multiplier must be positive".into(),
            ));
        }
        if self.telemetry.heartbeat_interval_secs > MAX_INTERVAL_SECS
            || self.telemetry.staleness_multiplier > MAX_STALENESS_MULTIPLIER
        {
            return Err(HierarchError::Config(format!(
                "telemetry heartbeat interval must be at most {MAX_INTERVAL_SECS}s and \
                 staleness multiplier at most {MAX_STALENESS_MULTIPLIER}"
            )));
        }
        if self.telemetry.error_window == 0 {
            return Err(HierarchError::Config(
                "telemetry.error_window must be positive".into(),
            ));
        }
        if self.queue.sweep_interval_secs == 0 || self.queue.claim_poll_ms == 0 {
            return Err(HierarchError::Config(
                "queue sweep interval and claim poll must be positive".into(),
            ));
        }
        if self.queue.sweep_interval_secs > MAX_INTERVAL_SECS
            || self.queue.claim_poll_ms > MAX_CLAIM_WAIT_MS
            || self.queue.claim_backoff_ms > MAX_CLAIM_WAIT_MS
        {
            return Err(HierarchError::Config(format!(
                "queue sweep interval must be at most {MAX_INTERVAL_SECS}s and \
                 claim poll/backoff at most {MAX_CLAIM_WAIT_MS}ms"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config.queue.default_max_retries, 3);
        assert_eq!(config.supervisor.max_depth, 3);
        assert_eq!(config.supervisor.default_max_children, 5);
        assert_eq!(config.telemetry.heartbeat_interval_secs, 30);
        assert_eq!(config.telemetry.staleness_multiplier, 3);
        assert_eq!(config.telemetry.error_window, 10);
        assert!((config.telemetry.error_rate_threshold - 0.3).abs() < f64::EPSILON);
        assert!((config.consensus.consensus_threshold - 0.6).abs() < f64::EPSILON);
        assert!((config.consensus.divergence_threshold - 0.3).abs() < f64::EPSILON);
        assert!(config.gating.dead_letters);
        assert!(!config.gating.spawn_roots);
    }

    #[test]
    fn test_partial_sections() {
        let config = EngineConfig::from_toml_str(
            r#"
            data_dir = "/tmp/hierarch"

            [supervisor]
            type_limits = { coder = 2 }
            default_type_limit = 8

            [routing]
            coder = ["code", "refactor"]
            "#,
        )
        .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/hierarch"));
        assert_eq!(config.supervisor.type_limit("coder"), Some(2));
        assert_eq!(config.supervisor.type_limit("tester"), Some(8));
        assert_eq!(config.supervisor.default_max_children, 5);
        assert_eq!(
            config.accepted_task_types("coder"),
            Some(&["code".to_string(), "refactor".to_string()][..])
        );
        assert!(config.accepted_task_types("tester").is_none());
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let err = EngineConfig::from_toml_str("[consensus]\nconsensus_threshold = 1.5\n")
            .unwrap_err()
            .to_string();
        assert!(err.contains("consensus.consensus_threshold"), "{err}");
    }

    #[test]
    fn test_depth_above_cap_rejected() {
        let err = EngineConfig::from_toml_str("[supervisor]\nmax_depth = 7\n").unwrap_err();
        assert!(matches!(err, HierarchError::Config(_)));
    }

    #[test]
    fn test_oversized_intervals_rejected() {
        for doc in [
            "[telemetry]\nheartbeat_interval_secs = 100000000000000000\n",
            "[telemetry]\nstaleness_multiplier = 4000000000\n",
            "[queue]\nsweep_interval_secs = 18446744073709551615\n",
            "[queue]\nclaim_poll_ms = 100000000000\n",
        ] {
            let err = EngineConfig::from_toml_str(doc).unwrap_err();
            assert!(matches!(err, HierarchError::Config(_)), "{doc}: {err}");
        }
        let at_cap = format!("[telemetry]\nheartbeat_interval_secs = {MAX_INTERVAL_SECS}\n");
        assert!(EngineConfig::from_toml_str(&at_cap).is_ok());
    }

    #[test]
    fn test_heartbeat_interval_saturates() {
        let config = TelemetryConfig {
            heartbeat_interval_secs: u64::MAX,
            ..TelemetryConfig::default()
        };
        assert_eq!(config.heartbeat_interval(), chrono::Duration::MAX);
    }

    #[test]
    fn test_unparseable_document() {
        let err = EngineConfig::from_toml_str("[queue\n").unwrap_err();
        assert!(err.to_string().contains("Invalid engine config"));
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut config = EngineConfig::default();
        config.supervisor.type_limits.insert("coder".into(), 4);
        let rendered = config.to_toml_string().unwrap();
        let parsed = EngineConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(parsed.supervisor.type_limit("coder"), Some(4));
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let err = EngineConfig::load("/nonexistent/hierarch.toml")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
