use crate::config::TelemetryConfig;
use crate::types::HealthSample;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Observation handed to the coordinator. Telemetry never acts on it itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Advisory {
    /// No heartbeat for longer than `multiplier x expected_interval`.
    Unresponsive {
        /// Silent agent.
        agent_id: Uuid,
        /// Time since its last heartbeat.
        silent_for_ms: i64,
    },
    /// Mean error rate over the rolling window is above the threshold.
    ErrorBudgetExceeded {
        /// Failing agent.
        agent_id: Uuid,
        /// Mean error rate over the window.
        mean_error_rate: f64,
    },
}

impl Advisory {
    /// Agent the advisory is about.
    pub fn agent_id(&self) -> Uuid {
        match self {
            Advisory::Unresponsive { agent_id, .. }
            | Advisory::ErrorBudgetExceeded { agent_id, .. } => *agent_id,
        }
    }
}

struct AgentTelemetry {
    expected_interval: Duration,
    last_heartbeat: DateTime<Utc>,
    current: Option<HealthSample>,
    history: VecDeque<HealthSample>,
    flagged_unresponsive: bool,
    flagged_errors: bool,
}

impl AgentTelemetry {
    fn new(expected_interval: Duration, now: DateTime<Utc>) -> Self {
        Self {
            expected_interval,
            last_heartbeat: now,
            current: None,
            history: VecDeque::new(),
            flagged_unresponsive: false,
            flagged_errors: false,
        }
    }

    fn silence(&self, now: DateTime<Utc>) -> Duration {
        now - self.last_heartbeat
    }

    /// Silence beyond this marks the agent unresponsive.
    fn stale_after(&self, multiplier: u32) -> Duration {
        i32::try_from(multiplier)
            .ok()
            .and_then(|m| self.expected_interval.checked_mul(m))
            .unwrap_or(Duration::MAX)
    }

    fn mean_error_rate(&self, window: usize) -> Option<f64> {
        let n = self.history.len().min(window);
        if n == 0 {
            return None;
        }
        let sum: f64 = self.history.iter().rev().take(n).map(|s| s.error_rate).sum();
        Some(sum / n as f64)
    }
}

/// Per-agent health samples and liveness checks.
///
/// Holds exactly one current sample per agent plus a bounded audit history.
/// When an agent goes silent or blows its error budget an [`Advisory`] is
/// sent to the coordinator; each condition is reported once until a healthy
/// sample clears it.
pub struct TelemetryStore {
    agents: RwLock<HashMap<Uuid, AgentTelemetry>>,
    config: TelemetryConfig,
    advisories: mpsc::UnboundedSender<Advisory>,
}

impl TelemetryStore {
    /// Create the store and the receiving end of its advisory channel.
    pub fn new(config: TelemetryConfig) -> (Self, mpsc::UnboundedReceiver<Advisory>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                agents: RwLock::new(HashMap::new()),
                config,
                advisories: tx,
            },
            rx,
        )
    }

    /// Start tracking an agent. `now` is its baseline heartbeat.
    pub fn register(&self, agent_id: Uuid, expected_interval: Option<Duration>, now: DateTime<Utc>) {
        let interval = expected_interval.unwrap_or_else(|| self.config.heartbeat_interval());
        self.agents
            .write()
            .insert(agent_id, AgentTelemetry::new(interval, now));
        debug!(agent_id = %agent_id, interval_secs = interval.num_seconds(), "Telemetry registered");
    }

    /// Record a sample: it replaces the current one and is appended to history.
    /// Unknown agents are tracked from this sample on with the default interval.
    pub fn report(&self, sample: HealthSample) {
        let agent_id = sample.agent_id;
        let advisory = {
            let mut agents = self.agents.write();
            let entry = agents.entry(agent_id).or_insert_with(|| {
                AgentTelemetry::new(self.config.heartbeat_interval(), sample.last_heartbeat)
            });

            entry.last_heartbeat = entry.last_heartbeat.max(sample.last_heartbeat);
            entry.flagged_unresponsive = false;
            entry.history.push_back(sample.clone());
            while entry.history.len() > self.config.history_retention {
                entry.history.pop_front();
            }
            entry.current = Some(sample);

            match entry.mean_error_rate(self.config.error_window) {
                Some(mean) if mean > self.config.error_rate_threshold => {
                    if entry.flagged_errors {
                        None
                    } else {
                        entry.flagged_errors = true;
                        Some(Advisory::ErrorBudgetExceeded {
                            agent_id,
                            mean_error_rate: mean,
                        })
                    }
                }
                _ => {
                    entry.flagged_errors = false;
                    None
                }
            }
        };

        if let Some(advisory) = advisory {
            warn!(agent_id = %agent_id, "Error budget exceeded");
            self.emit(advisory);
        }
    }

    /// Silence longer than `staleness_multiplier x expected_interval`.
    /// Untracked agents are never unresponsive.
    pub fn is_unresponsive(&self, agent_id: Uuid, now: DateTime<Utc>) -> bool {
        self.agents
            .read()
            .get(&agent_id)
            .is_some_and(|a| a.silence(now) > a.stale_after(self.config.staleness_multiplier))
    }

    /// Mean `error_rate` of the last `error_window` samples above the threshold.
    pub fn error_budget_exceeded(&self, agent_id: Uuid) -> bool {
        self.agents
            .read()
            .get(&agent_id)
            .and_then(|a| a.mean_error_rate(self.config.error_window))
            .is_some_and(|mean| mean > self.config.error_rate_threshold)
    }

    /// Check every tracked agent for staleness and emit advisories for newly
    /// unresponsive ones. Returns what was emitted.
    pub fn scan(&self, now: DateTime<Utc>) -> Vec<Advisory> {
        let multiplier = self.config.staleness_multiplier;
        let emitted: Vec<Advisory> = {
            let mut agents = self.agents.write();
            agents
                .iter_mut()
                .filter_map(|(id, a)| {
                    let silence = a.silence(now);
                    if a.flagged_unresponsive || silence <= a.stale_after(multiplier) {
                        return None;
                    }
                    a.flagged_unresponsive = true;
                    Some(Advisory::Unresponsive {
                        agent_id: *id,
                        silent_for_ms: silence.num_milliseconds(),
                    })
                })
                .collect()
        };

        for advisory in &emitted {
            warn!(agent_id = %advisory.agent_id(), "Agent unresponsive");
            self.emit(advisory.clone());
        }
        emitted
    }

    fn emit(&self, advisory: Advisory) {
        if self.advisories.send(advisory).is_err() {
            debug!("Advisory receiver dropped");
        }
    }

    /// Stop tracking an agent.
    pub fn forget(&self, agent_id: Uuid) -> bool {
        self.agents.write().remove(&agent_id).is_some()
    }

    /// Latest sample of an agent.
    pub fn current(&self, agent_id: Uuid) -> Option<HealthSample> {
        self.agents
            .read()
            .get(&agent_id)
            .and_then(|a| a.current.clone())
    }

    /// Retained samples for an agent, oldest first.
    pub fn history(&self, agent_id: Uuid) -> Vec<HealthSample> {
        self.agents
            .read()
            .get(&agent_id)
            .map(|a| a.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Current sample of every agent that has reported.
    pub fn snapshot(&self) -> Vec<HealthSample> {
        let mut samples: Vec<HealthSample> = self
            .agents
            .read()
            .values()
            .filter_map(|a| a.current.clone())
            .collect();
        samples.sort_by_key(|s| s.timestamp);
        samples
    }

    /// Agents currently tracked.
    pub fn tracked_count(&self) -> usize {
        self.agents.read().len()
    }
}
