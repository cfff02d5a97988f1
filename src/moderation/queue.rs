//! Moderation queue — persistent photo state machine with broadcast to WebSocket clients.
//!
//! Every status change goes through `Database::apply_transition`, which checks
//! the current status and writes the audit row in one transaction. Successful
//! changes are broadcast as `QueueEvent`s.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::model::{
    Actor, AiAssessment, AuditEntry, ModerationStatus, NewPhoto, PhotoSubmission, QueueEvent,
    Transition,
};
use super::policy::PolicyDecision;
use crate::error::ModerationError;
use crate::store::{Database, LlmCostSummary, PhotoTransition, StatusCounts, TransitionOutcome};

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Photos sent in a `QueueSync` message.
pub const SYNC_LIMIT: usize = 200;

/// Dashboard numbers.
#[derive(Debug, Clone, Serialize)]
pub struct ModerationStats {
    pub counts: StatusCounts,
    pub total: u64,
    pub ai_spend: LlmCostSummary,
}

/// Optional column updates carried alongside a transition.
#[derive(Default)]
struct Changes {
    assessment: Option<AiAssessment>,
    decision_reason: Option<String>,
    rejection_reason: Option<String>,
    reviewed_by: Option<String>,
    last_error: Option<String>,
    increment_attempts: bool,
    expected_attempts: Option<u32>,
}

/// Photo moderation queue backed by the database and a broadcast channel.
pub struct ModerationQueue {
    db: Arc<dyn Database>,
    tx: broadcast::Sender<QueueEvent>,
}

impl ModerationQueue {
    pub fn new(db: Arc<dyn Database>) -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Arc::new(Self { db, tx })
    }

    /// Subscribe to real-time queue events. Each WS client calls this.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.tx.subscribe()
    }

    /// Accept a new submission in `Pending`.
    pub async fn submit(&self, new: NewPhoto) -> Result<PhotoSubmission, ModerationError> {
        new.validate().map_err(ModerationError::InvalidSubmission)?;

        let photo = PhotoSubmission::new(new.uploader.trim(), new.image_ref.trim(), new.caption);
        let audit = AuditEntry::new(
            photo.id,
            None,
            ModerationStatus::Pending,
            &Actor::human(&photo.uploader),
            Some("submitted".into()),
        );
        self.db.insert_photo(&photo, &audit).await?;

        info!(
            photo_id = %photo.id,
            uploader = %photo.uploader,
            image_ref = %photo.image_ref,
            "Photo submitted"
        );

        // Ok if no receivers are listening yet
        let _ = self.tx.send(QueueEvent::PhotoSubmitted {
            photo: photo.clone(),
        });
        Ok(photo)
    }

    /// Claim a pending photo for analysis. Counts as one attempt.
    pub async fn begin_analysis(&self, id: Uuid) -> Result<PhotoSubmission, ModerationError> {
        self.transition(
            id,
            Transition::BeginAnalysis,
            &Actor::system(),
            None,
            Changes {
                increment_attempts: true,
                ..Default::default()
            },
        )
        .await
    }

    /// Store a policy decision for a photo that is still being analysed by
    /// `attempt` (the photo's `analysis_attempts` when it was claimed).
    ///
    /// Fails with `InvalidTransition` if a reviewer acted in the meantime, or
    /// `SupersededAttempt` if the attempt was reset and the photo reclaimed.
    /// The AI result is then discarded.
    pub async fn record_ai_decision(
        &self,
        id: Uuid,
        attempt: u32,
        assessment: Option<AiAssessment>,
        decision: &PolicyDecision,
        actor: &Actor,
    ) -> Result<PhotoSubmission, ModerationError> {
        let to = decision.outcome.status();
        let rejection_reason =
            (to == ModerationStatus::AiRejected).then(|| decision.reason.clone());
        self.transition(
            id,
            Transition::AiDecision(to),
            actor,
            Some(decision.reason.clone()),
            Changes {
                assessment,
                decision_reason: Some(decision.reason.clone()),
                rejection_reason,
                expected_attempts: Some(attempt),
                ..Default::default()
            },
        )
        .await
    }

    /// Put a photo whose analysis `attempt` failed back in `Pending`, keeping the error.
    pub async fn analysis_failed(
        &self,
        id: Uuid,
        attempt: u32,
        error: &str,
    ) -> Result<PhotoSubmission, ModerationError> {
        self.transition(
            id,
            Transition::AnalysisFailed,
            &Actor::system(),
            Some(format!("analysis failed: {error}")),
            Changes {
                last_error: Some(error.to_string()),
                expected_attempts: Some(attempt),
                ..Default::default()
            },
        )
        .await
    }

    /// Send a photo to human review.
    pub async fn escalate(
        &self,
        id: Uuid,
        actor: &Actor,
        note: Option<String>,
    ) -> Result<PhotoSubmission, ModerationError> {
        let note = clean(note);
        self.transition(
            id,
            Transition::Escalate,
            actor,
            note.clone(),
            Changes {
                decision_reason: Some(
                    note.unwrap_or_else(|| format!("escalated by {}", actor.name)),
                ),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn approve(
        &self,
        id: Uuid,
        reviewer: &str,
        note: Option<String>,
    ) -> Result<PhotoSubmission, ModerationError> {
        self.human_decision(id, Transition::Approve, reviewer, clean(note), None)
            .await
    }

    /// Reject a photo. The reason is mandatory.
    pub async fn reject(
        &self,
        id: Uuid,
        reviewer: &str,
        reason: &str,
    ) -> Result<PhotoSubmission, ModerationError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(ModerationError::MissingReason);
        }
        self.human_decision(
            id,
            Transition::Reject,
            reviewer,
            Some(reason.to_string()),
            Some(reason.to_string()),
        )
        .await
    }

    pub async fn feature(
        &self,
        id: Uuid,
        reviewer: &str,
        note: Option<String>,
    ) -> Result<PhotoSubmission, ModerationError> {
        self.human_decision(id, Transition::Feature, reviewer, clean(note), None)
            .await
    }

    /// Send a photo back for another AI pass.
    pub async fn requeue(
        &self,
        id: Uuid,
        actor: &Actor,
        note: Option<String>,
    ) -> Result<PhotoSubmission, ModerationError> {
        self.transition(id, Transition::Requeue, actor, clean(note), Changes::default())
            .await
    }

    /// Reset photos stuck in `Analyzing` for longer than `stale_after`.
    /// Returns how many were reset.
    pub async fn reset_stale(&self, stale_after: Duration) -> Result<usize, ModerationError> {
        let cutoff = chrono::Utc::now()
            - chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::zero());
        let stale = self.db.find_stale_analyzing(cutoff).await?;

        let mut reset = 0;
        for (id, attempt) in stale {
            match self
                .analysis_failed(id, attempt, "analysis did not finish in time")
                .await
            {
                Ok(_) => reset += 1,
                // Finished, reclaimed or taken over by a reviewer since the scan.
                Err(
                    ModerationError::InvalidTransition { .. }
                    | ModerationError::SupersededAttempt { .. }
                    | ModerationError::NotFound { .. },
                ) => {}
                Err(e) => warn!(photo_id = %id, error = %e, "Failed to reset stale analysis"),
            }
        }

        if reset > 0 {
            info!(count = reset, "Reset stale analyses");
        }
        Ok(reset)
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub async fn get(&self, id: Uuid) -> Result<PhotoSubmission, ModerationError> {
        self.db
            .get_photo(id)
            .await?
            .ok_or(ModerationError::NotFound { id })
    }

    /// Photos waiting for a human, oldest first.
    pub async fn review_queue(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<PhotoSubmission>, ModerationError> {
        self.list(Some(ModerationStatus::HumanReview), limit, offset)
            .await
    }

    pub async fn list(
        &self,
        status: Option<ModerationStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<PhotoSubmission>, ModerationError> {
        Ok(self.db.list_photos(status, limit, offset).await?)
    }

    pub async fn stats(&self) -> Result<ModerationStats, ModerationError> {
        let counts = self.db.status_counts().await?;
        let total = counts.values().sum();
        let ai_spend = self.db.get_total_spend().await?;
        Ok(ModerationStats {
            counts,
            total,
            ai_spend,
        })
    }

    /// Audit history for one photo, oldest first.
    pub async fn audit(&self, id: Uuid) -> Result<Vec<AuditEntry>, ModerationError> {
        // Distinguish "no such photo" from "no history".
        self.get(id).await?;
        Ok(self.db.audit_for_photo(id).await?)
    }

    /// Latest audit entries across all photos, newest first.
    pub async fn recent_audit(&self, limit: usize) -> Result<Vec<AuditEntry>, ModerationError> {
        Ok(self.db.recent_audit(limit).await?)
    }

    // ── Internals ───────────────────────────────────────────────────

    async fn human_decision(
        &self,
        id: Uuid,
        transition: Transition,
        reviewer: &str,
        note: Option<String>,
        rejection_reason: Option<String>,
    ) -> Result<PhotoSubmission, ModerationError> {
        let decision_reason = note
            .clone()
            .unwrap_or_else(|| format!("{} by {reviewer}", transition.target()));
        self.transition(
            id,
            transition,
            &Actor::human(reviewer),
            note,
            Changes {
                decision_reason: Some(decision_reason),
                rejection_reason,
                reviewed_by: Some(reviewer.to_string()),
                ..Default::default()
            },
        )
        .await
    }

    async fn transition(
        &self,
        id: Uuid,
        transition: Transition,
        actor: &Actor,
        note: Option<String>,
        changes: Changes,
    ) -> Result<PhotoSubmission, ModerationError> {
        let to = transition.target();
        let request = PhotoTransition {
            photo_id: id,
            allowed_from: transition.allowed_from().to_vec(),
            to,
            assessment: changes.assessment,
            decision_reason: changes.decision_reason,
            rejection_reason: changes.rejection_reason,
            reviewed_by: changes.reviewed_by,
            last_error: changes.last_error,
            increment_attempts: changes.increment_attempts,
            expected_attempts: changes.expected_attempts,
            // `from_status` is filled in by the store.
            audit: AuditEntry::new(id, None, to, actor, note.clone()),
        };

        match self.db.apply_transition(&request).await? {
            TransitionOutcome::Applied { from, photo } => {
                info!(
                    photo_id = %id,
                    from = %from,
                    to = %to,
                    actor = %actor.name,
                    actor_kind = actor.kind.as_str(),
                    note = note.as_deref().unwrap_or(""),
                    "Photo status changed"
                );
                let _ = self.tx.send(QueueEvent::StatusChanged {
                    id,
                    from,
                    to,
                    actor: actor.name.clone(),
                });
                Ok(photo)
            }
            TransitionOutcome::NotFound => Err(ModerationError::NotFound { id }),
            TransitionOutcome::Superseded { current_attempts } => {
                debug!(photo_id = %id, current_attempts, to = %to, "Stale attempt refused");
                Err(ModerationError::SupersededAttempt {
                    id,
                    attempt: request.expected_attempts.unwrap_or_default(),
                    current: current_attempts,
                })
            }
            TransitionOutcome::Conflict { current } => {
                debug!(photo_id = %id, current = %current, to = %to, "Transition refused");
                Err(ModerationError::InvalidTransition {
                    id,
                    from: current,
                    to,
                })
            }
        }
    }
}

fn clean(note: Option<String>) -> Option<String> {
    note.map(|n| n.trim().to_string()).filter(|n| !n.is_empty())
}

/// Spawn a background task that periodically resets stale analyses.
pub fn spawn_stale_sweep_task(
    queue: Arc<ModerationQueue>,
    every: Duration,
    stale_after: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            if let Err(e) = queue.reset_stale(stale_after).await {
                warn!(error = %e, "Stale analysis sweep failed");
            }
        }
    })
}
