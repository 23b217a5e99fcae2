//! Four-perspective consensus validation.
//!
//! A decision is scored by four independent [`Scorer`]s, one per
//! [`Perspective`]. The decision passes only when the mean score clears the
//! consensus threshold *and* the scorers agree closely enough (spread within
//! the divergence threshold). Every outcome, passing or not, is sealed into
//! the [`ValidationLedger`].

use crate::config::ConsensusConfig;
use crate::ledger::ValidationLedger;
use crate::types::{DecisionContext, PerspectiveScores, ValidationRecord};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::join_all;
use hierarch_core::{HierarchError, HierarchResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Confidence ceiling for a decision reached without consensus.
const ESCALATION_CONFIDENCE_CAP: f64 = 0.49;

/// The four independent viewpoints a decision is judged from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Perspective {
    /// Is the decision likely to be correct.
    Plausibility,
    /// Does it fit the agent's role.
    IdentityConsistency,
    /// Does it survive an argument against it.
    SelfCritique,
    /// Does it agree with earlier decisions and policy.
    MetaConsistency,
}

impl Perspective {
    /// Panel slot order.
    pub const ALL: [Perspective; 4] = [
        Perspective::Plausibility,
        Perspective::IdentityConsistency,
        Perspective::SelfCritique,
        Perspective::MetaConsistency,
    ];
}

impl std::fmt::Display for Perspective {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Perspective::Plausibility => "plausibility",
            Perspective::IdentityConsistency => "identity_consistency",
            Perspective::SelfCritique => "self_critique",
            Perspective::MetaConsistency => "meta_consistency",
        };
        write!(f, "{s}")
    }
}

/// One scorer's judgement: a score in [0, 1] and the position it argues for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    /// Score in [0, 1].
    pub score: f64,
    /// The course of action this scorer argues for.
    pub position: String,
}

impl Verdict {
    /// Verdict with an unchecked score; the validator rejects values outside [0, 1].
    pub fn new(score: f64, position: impl Into<String>) -> Self {
        Self {
            score,
            position: position.into(),
        }
    }

    /// Parse scorer output given as a bare number or `{"score": n, "position": "..."}`.
    /// Anything without a numeric score is `InvalidScore`.
    pub fn from_json(scorer: &str, value: &serde_json::Value) -> HierarchResult<Self> {
        let invalid = |reason: String| HierarchError::InvalidScore {
            scorer: scorer.to_string(),
            reason,
        };
        match value {
            serde_json::Value::Number(n) => n
                .as_f64()
                .map(|score| Verdict::new(score, ""))
                .ok_or_else(|| invalid(format!("unrepresentable number {n}"))),
            serde_json::Value::Object(map) => {
                let score = map
                    .get("score")
                    .and_then(serde_json::Value::as_f64)
                    .ok_or_else(|| invalid(format!("missing numeric score in {value}")))?;
                let position = map
                    .get("position")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default();
                Ok(Verdict::new(score, position))
            }
            other => Err(invalid(format!("non-numeric output {other}"))),
        }
    }
}

/// A pluggable scoring function for one perspective.
#[async_trait]
pub trait Scorer: Send + Sync {
    /// Label used in logs and errors.
    fn name(&self) -> &str;

    /// Panel slot this scorer fills.
    fn perspective(&self) -> Perspective;

    /// Judge a decision.
    async fn score(&self, context: &DecisionContext) -> HierarchResult<Verdict>;
}

/// Scorer backed by a synchronous closure.
pub struct FnScorer<F> {
    name: String,
    perspective: Perspective,
    func: F,
}

impl<F> FnScorer<F>
where
    F: Fn(&DecisionContext) -> HierarchResult<Verdict> + Send + Sync,
{
    /// Wrap a closure as the scorer `name` for one perspective.
    pub fn new(name: impl Into<String>, perspective: Perspective, func: F) -> Self {
        Self {
            name: name.into(),
            perspective,
            func,
        }
    }
}

#[async_trait]
impl<F> Scorer for FnScorer<F>
where
    F: Fn(&DecisionContext) -> HierarchResult<Verdict> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn perspective(&self) -> Perspective {
        self.perspective
    }

    async fn score(&self, context: &DecisionContext) -> HierarchResult<Verdict> {
        (self.func)(context)
    }
}

/// Scorer that always returns the same verdict.
pub struct StaticScorer {
    perspective: Perspective,
    verdict: Verdict,
}

impl StaticScorer {
    /// Always answer `score` with `position`.
    pub fn new(perspective: Perspective, score: f64, position: impl Into<String>) -> Self {
        Self {
            perspective,
            verdict: Verdict::new(score, position),
        }
    }
}

#[async_trait]
impl Scorer for StaticScorer {
    fn name(&self) -> &str {
        "static"
    }

    fn perspective(&self) -> Perspective {
        self.perspective
    }

    async fn score(&self, _context: &DecisionContext) -> HierarchResult<Verdict> {
        Ok(self.verdict.clone())
    }
}

/// Exactly four scorers, one per [`Perspective`], in [`Perspective::ALL`] order.
#[derive(Clone)]
pub struct ScorerPanel {
    scorers: [Arc<dyn Scorer>; 4],
}

impl ScorerPanel {
    /// Build a panel; each scorer must serve the perspective of its slot.
    pub fn new(
        plausibility: Arc<dyn Scorer>,
        identity_consistency: Arc<dyn Scorer>,
        self_critique: Arc<dyn Scorer>,
        meta_consistency: Arc<dyn Scorer>,
    ) -> HierarchResult<Self> {
        let scorers = [
            plausibility,
            identity_consistency,
            self_critique,
            meta_consistency,
        ];
        for (scorer, expected) in scorers.iter().zip(Perspective::ALL) {
            if scorer.perspective() != expected {
                return Err(HierarchError::InvalidScore {
                    scorer: scorer.name().to_string(),
                    reason: format!(
                        "scores {} but was placed in the {expected} slot",
                        scorer.perspective()
                    ),
                });
            }
        }
        Ok(Self { scorers })
    }

    /// Panel of static scorers, mostly for tests and demos.
    pub fn fixed(scores: [f64; 4], position: &str) -> Self {
        let [a, b, c, d] = scores;
        Self {
            scorers: [
                Arc::new(StaticScorer::new(Perspective::Plausibility, a, position)),
                Arc::new(StaticScorer::new(Perspective::IdentityConsistency, b, position)),
                Arc::new(StaticScorer::new(Perspective::SelfCritique, c, position)),
                Arc::new(StaticScorer::new(Perspective::MetaConsistency, d, position)),
            ],
        }
    }

    /// Scorers in slot order.
    pub fn scorers(&self) -> &[Arc<dyn Scorer>; 4] {
        &self.scorers
    }
}

/// Scores decisions with a [`ScorerPanel`] and records every outcome.
pub struct ConsensusValidator {
    config: ConsensusConfig,
    ledger: Arc<ValidationLedger>,
}

impl ConsensusValidator {
    /// Validator recording into `ledger`.
    pub fn new(config: ConsensusConfig, ledger: Arc<ValidationLedger>) -> Self {
        Self { config, ledger }
    }

    /// Ledger every validation is appended to.
    pub fn ledger(&self) -> &Arc<ValidationLedger> {
        &self.ledger
    }

    /// Run the four scorers concurrently over `context` and record the outcome.
    pub async fn validate(
        &self,
        agent_id: Option<Uuid>,
        context: DecisionContext,
        panel: &ScorerPanel,
    ) -> HierarchResult<ValidationRecord> {
        let results = join_all(panel.scorers().iter().map(|s| s.score(&context))).await;

        let mut verdicts = Vec::with_capacity(4);
        for (scorer, result) in panel.scorers().iter().zip(results) {
            let verdict = result?;
            if verdict.score.is_nan() {
                return Err(HierarchError::InvalidScore {
                    scorer: scorer.name().to_string(),
                    reason: "score is NaN".into(),
                });
            }
            verdicts.push(verdict);
        }
        let verdicts: [Verdict; 4] = verdicts.try_into().map_err(|_| HierarchError::InvalidScore {
            scorer: "panel".into(),
            reason: "expected four verdicts".into(),
        })?;

        self.evaluate(agent_id, context, verdicts)
    }

    /// Combine four verdicts (in [`Perspective::ALL`] order) into a sealed record.
    ///
    /// Scores are clamped into [0, 1]; NaN is `InvalidScore`.
    pub fn evaluate(
        &self,
        agent_id: Option<Uuid>,
        context: DecisionContext,
        verdicts: [Verdict; 4],
    ) -> HierarchResult<ValidationRecord> {
        let mut clamped = [0.0; 4];
        for ((slot, verdict), perspective) in clamped.iter_mut().zip(&verdicts).zip(Perspective::ALL) {
            if verdict.score.is_nan() {
                return Err(HierarchError::InvalidScore {
                    scorer: perspective.to_string(),
                    reason: "score is NaN".into(),
                });
            }
            *slot = verdict.score.clamp(0.0, 1.0);
        }

        let scores = PerspectiveScores {
            plausibility: clamped[0],
            identity_consistency: clamped[1],
            self_critique: clamped[2],
            meta_consistency: clamped[3],
        };
        let combined = scores.mean();
        let spread = scores.spread();
        let consensus_reached = combined >= self.config.consensus_threshold
            && spread <= self.config.divergence_threshold;

        // First index wins ties, so the order is deterministic.
        let (mut hi, mut lo) = (0, 0);
        for (i, score) in clamped.iter().enumerate() {
            if *score > clamped[hi] {
                hi = i;
            }
            if *score < clamped[lo] {
                lo = i;
            }
        }
        let advocate = verdicts[hi].position.clone();
        let challenger = verdicts[lo].position.clone();

        let (final_decision, confidence) = if consensus_reached {
            (advocate.clone(), combined)
        } else {
            let synthesis = format!(
                "escalate: no consensus on '{}' (combined {combined:.3}, spread {spread:.3}); \
                 strongest case [{}]: {advocate}; weakest case [{}]: {challenger}",
                context.summary,
                Perspective::ALL[hi],
                Perspective::ALL[lo],
            );
            (synthesis, (clamped[lo] * 0.5).min(ESCALATION_CONFIDENCE_CAP))
        };

        let record = ValidationRecord {
            id: Uuid::new_v4(),
            agent_id,
            decision_context: context,
            scores,
            combined_score: combined,
            spread,
            consensus_reached,
            advocate_position: advocate,
            challenger_position: challenger,
            final_decision,
            confidence,
            created_at: Utc::now(),
            prev_hash: String::new(),
            hash: String::new(),
        };

        if consensus_reached {
            info!(
                kind = ?record.decision_context.kind,
                combined_score = combined,
                spread,
                "Consensus reached"
            );
        } else {
            warn!(
                kind = ?record.decision_context.kind,
                combined_score = combined,
                spread,
                "Consensus not reached, decision needs escalation"
            );
        }
        self.ledger.append(record)
    }
}
