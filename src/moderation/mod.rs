//! Photo moderation — AI pre-screening, threshold policy, and the human review queue.

pub mod analyzer;
pub mod model;
pub mod policy;
pub mod prescreen;
pub mod processor;
pub mod queue;
pub mod routes;

pub use analyzer::VisionAnalyzer;
pub use model::{
    Actor, ActorKind, AiAssessment, AuditEntry, ContentFlags, ModerationStatus, NewPhoto,
    PhotoSubmission, QueueEvent, Transition,
};
pub use policy::{PolicyDecision, PolicyOutcome, PolicyThresholds, evaluate};
pub use prescreen::{PrescreenRules, RuleField};
pub use processor::{BatchSummary, ModerationProcessor, ProcessorConfig, spawn_pending_sweep_task};
pub use queue::{ModerationQueue, ModerationStats, spawn_stale_sweep_task};
pub use routes::{AppState, moderation_routes};
