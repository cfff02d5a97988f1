//! Moderation processor — drives a pending photo to a decision.
//!
//! **Core invariant: a reviewer's decision is never overwritten.**
//! AI results are only recorded while the photo is still `Analyzing`.
//!
//! Flow:
//! 1. Claim the photo (`Pending → Analyzing`)
//! 2. Pre-screen rules (fast, no LLM) → may short-circuit
//! 3. Vision analysis → `AiAssessment`
//! 4. Policy table → `AiApproved | AiRejected | HumanReview`
//!
//! Failed analyses go back to `Pending`; once the attempt budget is spent the
//! photo is escalated to human review instead. Results are tagged with the
//! attempt that produced them, so an attempt reset by the stale sweep cannot
//! overwrite the one that replaced it.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::analyzer::{Analysis, VisionAnalyzer};
use super::model::{Actor, AiAssessment, ModerationStatus, PhotoSubmission};
use super::policy::{self, PolicyDecision, PolicyOutcome, PolicyThresholds};
use super::prescreen::PrescreenRules;
use super::queue::ModerationQueue;
use crate::error::{LlmError, ModerationError};

/// Processor tuning.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub thresholds: PolicyThresholds,
    /// Failed analyses tolerated before escalating to a human.
    pub max_analysis_attempts: u32,
    /// Photos analysed at once by `process_batch`.
    pub analysis_concurrency: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            thresholds: PolicyThresholds::default(),
            max_analysis_attempts: 3,
            analysis_concurrency: 4,
        }
    }
}

/// Result of one `process_batch` run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub attempted: usize,
    pub decided: usize,
    pub failed: usize,
}

pub struct ModerationProcessor {
    queue: Arc<ModerationQueue>,
    analyzer: VisionAnalyzer,
    rules: PrescreenRules,
    config: ProcessorConfig,
}

impl ModerationProcessor {
    pub fn new(
        queue: Arc<ModerationQueue>,
        analyzer: VisionAnalyzer,
        rules: PrescreenRules,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            queue,
            analyzer,
            rules,
            config,
        }
    }

    /// Analyse one pending photo and record the decision.
    ///
    /// Returns the photo as stored afterwards. If a reviewer acted while the
    /// analysis ran, the AI result is dropped and the reviewer's state returned.
    pub async fn process(&self, id: Uuid) -> Result<PhotoSubmission, ModerationError> {
        let photo = self.queue.begin_analysis(id).await?;
        info!(
            photo_id = %id,
            attempt = photo.analysis_attempts,
            "Analysing photo"
        );

        // Earlier attempts stalled and were reset by the stale sweep.
        if photo.analysis_attempts > self.config.max_analysis_attempts {
            let decision = PolicyDecision {
                outcome: PolicyOutcome::HumanReview,
                reason: format!(
                    "analysis attempts exhausted ({})",
                    photo.analysis_attempts - 1
                ),
            };
            return self.record(&photo, None, &decision, &Actor::system()).await;
        }

        // Step 1: Pre-screen rules (fast, no LLM)
        if let Some(decision) = self.rules.evaluate(&photo) {
            info!(
                photo_id = %id,
                outcome = ?decision.outcome,
                "Pre-screen matched, skipping AI analysis"
            );
            return self
                .record(&photo, None, &decision, &Actor::system())
                .await;
        }

        // Step 2: Vision analysis
        let actor = Actor::ai(self.analyzer.model_name());
        let assessment = match self.analyzer.analyze(&photo).await {
            Ok(Analysis::Assessed(assessment)) => assessment,
            Ok(Analysis::Refused { reason }) => {
                let decision = PolicyDecision {
                    outcome: PolicyOutcome::HumanReview,
                    reason,
                };
                return self.record(&photo, None, &decision, &actor).await;
            }
            Err(e) => return Err(self.handle_failure(&photo, e).await),
        };

        // Step 3: Policy
        let decision = policy::evaluate(&assessment, &self.config.thresholds);
        self.record(&photo, Some(assessment), &decision, &actor).await
    }

    /// Analyse up to `limit` pending photos concurrently.
    ///
    /// Failures on individual photos are logged but don't fail the batch.
    pub async fn process_batch(&self, limit: usize) -> Result<BatchSummary, ModerationError> {
        let pending = self
            .queue
            .list(Some(ModerationStatus::Pending), limit, 0)
            .await?;
        if pending.is_empty() {
            return Ok(BatchSummary::default());
        }

        let count = pending.len();
        info!(count, "Processing pending photos");

        let results: Vec<_> = futures::stream::iter(pending)
            .map(|photo| async move { (photo.id, self.process(photo.id).await) })
            .buffer_unordered(self.config.analysis_concurrency.max(1))
            .collect()
            .await;

        let mut summary = BatchSummary {
            attempted: count,
            ..Default::default()
        };
        for (id, result) in results {
            match result {
                Ok(_) => summary.decided += 1,
                // Claimed elsewhere between the listing and the claim.
                Err(ModerationError::InvalidTransition { .. }) => {}
                Err(e) => {
                    summary.failed += 1;
                    error!(photo_id = %id, error = %e, "Failed to process photo in batch");
                }
            }
        }

        info!(
            decided = summary.decided,
            failed = summary.failed,
            total = count,
            "Batch processing complete"
        );
        Ok(summary)
    }

    /// Record a decision for the attempt that claimed `photo`.
    async fn record(
        &self,
        photo: &PhotoSubmission,
        assessment: Option<AiAssessment>,
        decision: &PolicyDecision,
        actor: &Actor,
    ) -> Result<PhotoSubmission, ModerationError> {
        let id = photo.id;
        match self
            .queue
            .record_ai_decision(id, photo.analysis_attempts, assessment, decision, actor)
            .await
        {
            Err(ModerationError::InvalidTransition { from, .. }) => {
                info!(
                    photo_id = %id,
                    status = %from,
                    "Reviewer acted during analysis, discarding AI result"
                );
                self.queue.get(id).await
            }
            Err(ModerationError::SupersededAttempt { attempt, current, .. }) => {
                info!(
                    photo_id = %id,
                    attempt,
                    current,
                    "Analysis attempt was superseded, discarding AI result"
                );
                self.queue.get(id).await
            }
            other => other,
        }
    }

    /// Reset or escalate after a failed analysis. Returns the error to report.
    async fn handle_failure(&self, photo: &PhotoSubmission, err: LlmError) -> ModerationError {
        let message = err.to_string();
        warn!(
            photo_id = %photo.id,
            attempt = photo.analysis_attempts,
            error = %message,
            "Photo analysis failed"
        );

        match self
            .queue
            .analysis_failed(photo.id, photo.analysis_attempts, &message)
            .await
        {
            Ok(_) => {}
            // A reviewer or a newer attempt owns the photo now.
            Err(
                ModerationError::InvalidTransition { .. }
                | ModerationError::SupersededAttempt { .. },
            ) => return ModerationError::Analysis(err),
            Err(e) => return e,
        }

        if photo.analysis_attempts >= self.config.max_analysis_attempts {
            let note = format!(
                "analysis failed {} times, last error: {}",
                photo.analysis_attempts, message
            );
            if let Err(e) = self
                .queue
                .escalate(photo.id, &Actor::system(), Some(note))
                .await
            {
                warn!(photo_id = %photo.id, error = %e, "Failed to escalate photo");
            } else {
                warn!(
                    photo_id = %photo.id,
                    attempts = photo.analysis_attempts,
                    "Analysis attempts exhausted, escalated to human review"
                );
            }
        }

        ModerationError::Analysis(err)
    }
}

/// Spawn a background task that periodically analyses pending photos.
pub fn spawn_pending_sweep_task(
    processor: Arc<ModerationProcessor>,
    every: Duration,
    batch_size: usize,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            if let Err(e) = processor.process_batch(batch_size).await {
                warn!(error = %e, "Pending photo sweep failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use rust_decimal::Decimal;

    use crate::llm::{CompletionRequest, CompletionResponse, FinishReason, LlmProvider};
    use crate::moderation::model::NewPhoto;
    use crate::store::LibSqlBackend;

    const APPROVE: &str = r#"{"score": 0.95, "confidence": 0.92, "animals_detected": true, "animal_types": ["cat"]}"#;
    const REVIEW: &str = r#"{"score": 0.7, "confidence": 0.9, "animals_detected": true, "flags": {"medical": true}}"#;
    const ADULT: &str = r#"{"score": 0.95, "confidence": 0.95, "animals_detected": true, "flags": {"adult": true}}"#;
    /// Empty content stands in for an answer stopped by the content filter.
    const FILTERED: &str = "";

    /// Mock LLM that returns scripted results in order.
    struct ScriptedLlm {
        script: Mutex<VecDeque<Result<String, ()>>>,
        calls: AtomicUsize,
    }

    impl ScriptedLlm {
        fn new(script: Vec<Result<&str, ()>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into_iter().map(|r| r.map(String::from)).collect()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedLlm {
        fn model_name(&self) -> &str {
            "scripted"
        }
        fn cost_per_token(&self) -> (Decimal, Decimal) {
            (Decimal::ZERO, Decimal::ZERO)
        }
        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(Ok(content)) => Ok(CompletionResponse {
                    finish_reason: if content.is_empty() {
                        FinishReason::ContentFilter
                    } else {
                        FinishReason::Stop
                    },
                    content,
                    input_tokens: 10,
                    output_tokens: 10,
                }),
                _ => Err(LlmError::RequestFailed {
                    provider: "scripted".into(),
                    reason: "HTTP 503: unavailable".into(),
                }),
            }
        }
    }

    enum Interruption {
        ReviewerRejects,
        AttemptReset,
    }

    /// Mock LLM that changes the photo's state while the call is in flight.
    struct InterruptingLlm {
        queue: Arc<ModerationQueue>,
        photo: Mutex<Option<Uuid>>,
        interruption: Interruption,
    }

    #[async_trait]
    impl LlmProvider for InterruptingLlm {
        fn model_name(&self) -> &str {
            "interrupted"
        }
        fn cost_per_token(&self) -> (Decimal, Decimal) {
            (Decimal::ZERO, Decimal::ZERO)
        }
        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            let id = self.photo.lock().unwrap().unwrap();
            match self.interruption {
                Interruption::ReviewerRejects => {
                    self.queue.reject(id, "sam", "not suitable").await.unwrap();
                }
                Interruption::AttemptReset => {
                    self.queue.reset_stale(Duration::ZERO).await.unwrap();
                    self.queue.begin_analysis(id).await.unwrap();
                }
            }
            Ok(CompletionResponse {
                content: APPROVE.into(),
                input_tokens: 10,
                output_tokens: 10,
                finish_reason: FinishReason::Stop,
            })
        }
    }

    async fn interrupted(interruption: Interruption) -> (Arc<ModerationQueue>, PhotoSubmission) {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let queue = ModerationQueue::new(db);
        let llm = Arc::new(InterruptingLlm {
            queue: Arc::clone(&queue),
            photo: Mutex::new(None),
            interruption,
        });
        let processor = ModerationProcessor::new(
            Arc::clone(&queue),
            VisionAnalyzer::new(llm.clone(), "/tmp", 1024),
            PrescreenRules::empty(),
            ProcessorConfig::default(),
        );
        let id = submit(&queue, None).await;
        *llm.photo.lock().unwrap() = Some(id);

        let photo = processor.process(id).await.unwrap();
        (queue, photo)
    }

    async fn setup(
        llm: Arc<ScriptedLlm>,
        rules: PrescreenRules,
    ) -> (Arc<ModerationQueue>, ModerationProcessor) {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let queue = ModerationQueue::new(db);
        let analyzer = VisionAnalyzer::new(llm, "/tmp", 1024);
        let processor = ModerationProcessor::new(
            Arc::clone(&queue),
            analyzer,
            rules,
            ProcessorConfig::default(),
        );
        (queue, processor)
    }

    async fn submit(queue: &ModerationQueue, caption: Option<&str>) -> Uuid {
        queue
            .submit(NewPhoto {
                uploader: "dana".into(),
                image_ref: "https://cdn.example.org/p.jpg".into(),
                caption: caption.map(String::from),
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn confident_animal_photo_auto_approved() {
        let (queue, processor) =
            setup(ScriptedLlm::new(vec![Ok(APPROVE)]), PrescreenRules::empty()).await;
        let id = submit(&queue, None).await;

        let photo = processor.process(id).await.unwrap();
        assert_eq!(photo.status, ModerationStatus::AiApproved);
        assert_eq!(photo.assessment.unwrap().model, "scripted");

        let audit = queue.audit(id).await.unwrap();
        assert_eq!(audit.last().unwrap().actor, "scripted");
    }

    #[tokio::test]
    async fn medical_flag_goes_to_human_review() {
        let (queue, processor) =
            setup(ScriptedLlm::new(vec![Ok(REVIEW)]), PrescreenRules::empty()).await;
        let id = submit(&queue, None).await;
        let photo = processor.process(id).await.unwrap();
        assert_eq!(photo.status, ModerationStatus::HumanReview);
    }

    #[tokio::test]
    async fn adult_flag_never_auto_approved() {
        let (queue, processor) =
            setup(ScriptedLlm::new(vec![Ok(ADULT)]), PrescreenRules::empty()).await;
        let id = submit(&queue, None).await;
        let photo = processor.process(id).await.unwrap();
        assert_eq!(photo.status, ModerationStatus::AiRejected);
        assert!(photo.rejection_reason.is_some());
    }

    #[tokio::test]
    async fn reviewer_decision_during_analysis_wins() {
        let (queue, photo) = interrupted(Interruption::ReviewerRejects).await;
        assert_eq!(photo.status, ModerationStatus::Rejected);
        assert!(photo.assessment.is_none());
        assert_eq!(photo.rejection_reason.as_deref(), Some("not suitable"));

        let audit = queue.audit(photo.id).await.unwrap();
        assert!(audit.iter().all(|a| a.actor != "interrupted"));
    }

    #[tokio::test]
    async fn result_from_reset_attempt_discarded() {
        let (queue, photo) = interrupted(Interruption::AttemptReset).await;
        assert_eq!(photo.status, ModerationStatus::Analyzing);
        assert_eq!(photo.analysis_attempts, 2);
        assert!(photo.assessment.is_none());
        assert_eq!(queue.audit(photo.id).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn filtered_answer_goes_to_human_review() {
        let (queue, processor) =
            setup(ScriptedLlm::new(vec![Ok(FILTERED)]), PrescreenRules::empty()).await;
        let id = submit(&queue, None).await;

        let photo = processor.process(id).await.unwrap();
        assert_eq!(photo.status, ModerationStatus::HumanReview);
        assert!(photo.decision_reason.unwrap().contains("declined"));
        assert_eq!(photo.analysis_attempts, 1);
    }

    #[tokio::test]
    async fn prescreen_skips_llm() {
        let llm = ScriptedLlm::new(vec![Ok(APPROVE)]);
        let (queue, processor) = setup(llm.clone(), PrescreenRules::default_rules()).await;
        let id = submit(&queue, Some("Max two days after surgery")).await;

        let photo = processor.process(id).await.unwrap();
        assert_eq!(photo.status, ModerationStatus::HumanReview);
        assert!(photo.decision_reason.unwrap().starts_with("pre-screen"));
        assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failure_resets_to_pending() {
        let (queue, processor) =
            setup(ScriptedLlm::new(vec![Err(())]), PrescreenRules::empty()).await;
        let id = submit(&queue, None).await;

        let err = processor.process(id).await.unwrap_err();
        assert!(matches!(err, ModerationError::Analysis(_)));

        let photo = queue.get(id).await.unwrap();
        assert_eq!(photo.status, ModerationStatus::Pending);
        assert!(photo.last_error.unwrap().contains("503"));
    }

    #[tokio::test]
    async fn exhausted_attempts_escalate() {
        let (queue, processor) =
            setup(ScriptedLlm::new(vec![Err(()), Err(()), Err(())]), PrescreenRules::empty()).await;
        let id = submit(&queue, None).await;

        for _ in 0..2 {
            assert!(processor.process(id).await.is_err());
            assert_eq!(queue.get(id).await.unwrap().status, ModerationStatus::Pending);
        }
        assert!(processor.process(id).await.is_err());

        let photo = queue.get(id).await.unwrap();
        assert_eq!(photo.status, ModerationStatus::HumanReview);
        assert_eq!(photo.analysis_attempts, 3);
        assert!(photo.decision_reason.unwrap().contains("failed 3 times"));
    }

    #[tokio::test]
    async fn stalled_attempts_escalate_without_llm() {
        let llm = ScriptedLlm::new(vec![Ok(APPROVE)]);
        let (queue, processor) = setup(llm.clone(), PrescreenRules::empty()).await;
        let id = submit(&queue, None).await;

        for _ in 0..3 {
            queue.begin_analysis(id).await.unwrap();
            queue.reset_stale(Duration::ZERO).await.unwrap();
        }

        let photo = processor.process(id).await.unwrap();
        assert_eq!(photo.status, ModerationStatus::HumanReview);
        assert!(photo.decision_reason.unwrap().contains("exhausted"));
        assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn non_pending_photo_not_processed() {
        let (queue, processor) =
            setup(ScriptedLlm::new(vec![Ok(APPROVE)]), PrescreenRules::empty()).await;
        let id = submit(&queue, None).await;
        queue.approve(id, "sam", None).await.unwrap();

        assert!(matches!(
            processor.process(id).await,
            Err(ModerationError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn batch_survives_individual_failures() {
        let llm = ScriptedLlm::new(vec![Ok(APPROVE), Err(()), Ok(REVIEW)]);
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let queue = ModerationQueue::new(db);
        let processor = ModerationProcessor::new(
            Arc::clone(&queue),
            VisionAnalyzer::new(llm, "/tmp", 1024),
            PrescreenRules::empty(),
            ProcessorConfig {
                analysis_concurrency: 1,
                ..Default::default()
            },
        );
        for _ in 0..3 {
            submit(&queue, None).await;
        }

        let summary = processor.process_batch(10).await.unwrap();
        assert_eq!(
            summary,
            BatchSummary {
                attempted: 3,
                decided: 2,
                failed: 1
            }
        );
        assert_eq!(
            queue.list(Some(ModerationStatus::Pending), 10, 0).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn concurrent_batch_decides_every_photo() {
        let llm = ScriptedLlm::new(vec![Ok(APPROVE); 12]);
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let queue = ModerationQueue::new(db);
        let processor = ModerationProcessor::new(
            Arc::clone(&queue),
            VisionAnalyzer::new(llm.clone(), "/tmp", 1024),
            PrescreenRules::empty(),
            ProcessorConfig {
                analysis_concurrency: 4,
                ..Default::default()
            },
        );
        let mut ids = Vec::new();
        for _ in 0..12 {
            ids.push(submit(&queue, None).await);
        }

        let summary = processor.process_batch(20).await.unwrap();
        assert_eq!(
            summary,
            BatchSummary {
                attempted: 12,
                decided: 12,
                failed: 0
            }
        );
        assert_eq!(llm.calls.load(Ordering::SeqCst), 12);
        for id in ids {
            assert_eq!(queue.get(id).await.unwrap().status, ModerationStatus::AiApproved);
            assert_eq!(queue.audit(id).await.unwrap().len(), 3);
        }
    }

    #[tokio::test]
    async fn empty_batch() {
        let (_queue, processor) = setup(ScriptedLlm::new(vec![]), PrescreenRules::empty()).await;
        assert_eq!(processor.process_batch(10).await.unwrap(), BatchSummary::default());
    }
}
