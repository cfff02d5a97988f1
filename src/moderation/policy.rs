//! Threshold policy table — maps an AI assessment to a moderation outcome.
//!
//! Pure function, no I/O. Rules are checked in order and the first match wins:
//! 1. High score, confident, animals present, nothing medical or racy → auto-approve
//! 2. Low score, adult or violent content → auto-reject
//! 3. No animals, medical content, middling score or low confidence → human review
//! 4. Anything else → human review

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::moderation::model::{AiAssessment, ModerationStatus};

/// Score and confidence thresholds used by [`evaluate`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PolicyThresholds {
    /// Minimum score for auto-approval.
    pub auto_approve: f32,
    /// Scores at or below this are auto-rejected.
    pub auto_reject: f32,
    /// Scores below this always go to a human.
    pub human_review: f32,
    /// Minimum confidence for auto-approval.
    pub approve_min_confidence: f32,
    /// Confidence below this always goes to a human.
    pub review_min_confidence: f32,
}

impl Default for PolicyThresholds {
    fn default() -> Self {
        Self {
            auto_approve: 0.85,
            auto_reject: 0.30,
            human_review: 0.60,
            approve_min_confidence: 0.80,
            review_min_confidence: 0.70,
        }
    }
}

impl PolicyThresholds {
    /// Check that every threshold is in 0..1 and that
    /// `auto_reject < human_review <= auto_approve`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fields = [
            ("auto_approve", self.auto_approve),
            ("auto_reject", self.auto_reject),
            ("human_review", self.human_review),
            ("approve_min_confidence", self.approve_min_confidence),
            ("review_min_confidence", self.review_min_confidence),
        ];
        for (key, value) in fields {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidValue {
                    key: key.into(),
                    message: format!("{value} is outside 0.0..=1.0"),
                });
            }
        }
        if self.auto_reject >= self.human_review {
            return Err(ConfigError::InvalidValue {
                key: "auto_reject".into(),
                message: format!(
                    "must be below human_review ({} >= {})",
                    self.auto_reject, self.human_review
                ),
            });
        }
        if self.human_review > self.auto_approve {
            return Err(ConfigError::InvalidValue {
                key: "human_review".into(),
                message: format!(
                    "must not exceed auto_approve ({} > {})",
                    self.human_review, self.auto_approve
                ),
            });
        }
        Ok(())
    }
}

/// What the policy wants done with a photo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyOutcome {
    AutoApproved,
    AutoRejected,
    HumanReview,
}

impl PolicyOutcome {
    /// Status the queue records for this outcome.
    pub fn status(self) -> ModerationStatus {
        match self {
            Self::AutoApproved => ModerationStatus::AiApproved,
            Self::AutoRejected => ModerationStatus::AiRejected,
            Self::HumanReview => ModerationStatus::HumanReview,
        }
    }
}

/// Outcome plus the rule that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub outcome: PolicyOutcome,
    pub reason: String,
}

impl PolicyDecision {
    fn new(outcome: PolicyOutcome, reason: impl Into<String>) -> Self {
        Self {
            outcome,
            reason: reason.into(),
        }
    }
}

/// Apply the threshold table to an assessment.
pub fn evaluate(assessment: &AiAssessment, thresholds: &PolicyThresholds) -> PolicyDecision {
    let a = assessment.clone().clamped();
    let flags = a.flags;

    // Adult or violent content never auto-approves, whatever the score.
    if a.score >= thresholds.auto_approve
        && a.confidence >= thresholds.approve_min_confidence
        && a.animals_detected
        && !flags.medical
        && !flags.racy
        && !flags.adult
        && !flags.violence
    {
        return PolicyDecision::new(
            PolicyOutcome::AutoApproved,
            format!(
                "score {:.2} >= {:.2} with confidence {:.2}",
                a.score, thresholds.auto_approve, a.confidence
            ),
        );
    }

    if flags.adult {
        return PolicyDecision::new(PolicyOutcome::AutoRejected, "adult content flagged");
    }
    if flags.violence {
        return PolicyDecision::new(PolicyOutcome::AutoRejected, "violent content flagged");
    }
    if a.score <= thresholds.auto_reject {
        return PolicyDecision::new(
            PolicyOutcome::AutoRejected,
            format!("score {:.2} <= {:.2}", a.score, thresholds.auto_reject),
        );
    }

    if !a.animals_detected {
        return PolicyDecision::new(PolicyOutcome::HumanReview, "no animals detected");
    }
    if flags.medical {
        return PolicyDecision::new(PolicyOutcome::HumanReview, "medical content flagged");
    }
    if a.score < thresholds.human_review {
        return PolicyDecision::new(
            PolicyOutcome::HumanReview,
            format!("score {:.2} < {:.2}", a.score, thresholds.human_review),
        );
    }
    if a.confidence < thresholds.review_min_confidence {
        return PolicyDecision::new(
            PolicyOutcome::HumanReview,
            format!(
                "confidence {:.2} < {:.2}",
                a.confidence, thresholds.review_min_confidence
            ),
        );
    }

    PolicyDecision::new(PolicyOutcome::HumanReview, "no automatic rule matched")
}
