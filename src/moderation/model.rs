//! Moderation data model — photo submissions, statuses, assessments, audit entries
//! and WebSocket event types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where a photo sits in the moderation pipeline.
///
/// `Pending → Analyzing → {AiApproved | AiRejected | HumanReview} → {Approved | Rejected | Featured}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModerationStatus {
    /// Waiting for AI analysis.
    Pending,
    /// An AI analysis is in flight.
    Analyzing,
    /// AI pre-screen passed the policy table.
    AiApproved,
    /// AI pre-screen failed the policy table.
    AiRejected,
    /// Needs a human decision.
    HumanReview,
    /// Human approved.
    Approved,
    /// Human rejected (always with a reason).
    Rejected,
    /// Human approved and promoted to the featured gallery.
    Featured,
}

impl ModerationStatus {
    pub const ALL: [ModerationStatus; 8] = [
        Self::Pending,
        Self::Analyzing,
        Self::AiApproved,
        Self::AiRejected,
        Self::HumanReview,
        Self::Approved,
        Self::Rejected,
        Self::Featured,
    ];

    /// Decided by a human. AI results never overwrite these.
    pub fn is_human_final(self) -> bool {
        matches!(self, Self::Approved | Self::Rejected | Self::Featured)
    }

    /// The DB/wire string for this status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Analyzing => "analyzing",
            Self::AiApproved => "ai_approved",
            Self::AiRejected => "ai_rejected",
            Self::HumanReview => "human_review",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Featured => "featured",
        }
    }
}

impl std::fmt::Display for ModerationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ModerationStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("Unknown moderation status: {}", s))
    }
}

/// A status change the queue knows how to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    BeginAnalysis,
    AiDecision(ModerationStatus),
    AnalysisFailed,
    Escalate,
    Approve,
    Reject,
    Feature,
    Requeue,
}

impl Transition {
    /// Target status of this transition.
    pub fn target(self) -> ModerationStatus {
        match self {
            Self::BeginAnalysis => ModerationStatus::Analyzing,
            Self::AiDecision(status) => status,
            Self::AnalysisFailed | Self::Requeue => ModerationStatus::Pending,
            Self::Escalate => ModerationStatus::HumanReview,
            Self::Approve => ModerationStatus::Approved,
            Self::Reject => ModerationStatus::Rejected,
            Self::Feature => ModerationStatus::Featured,
        }
    }

    /// States this transition may start from.
    ///
    /// Human decisions are accepted from every state so a reviewer always wins,
    /// including over an analysis still in flight.
    pub fn allowed_from(self) -> &'static [ModerationStatus] {
        use ModerationStatus::*;
        match self {
            Self::BeginAnalysis => &[Pending],
            Self::AiDecision(_) | Self::AnalysisFailed => &[Analyzing],
            Self::Escalate => &[
                Pending,
                AiApproved,
                AiRejected,
                HumanReview,
                Approved,
                Rejected,
                Featured,
            ],
            Self::Approve | Self::Reject | Self::Feature => &ModerationStatus::ALL,
            Self::Requeue => &[Pending, AiApproved, AiRejected, HumanReview],
        }
    }

    pub fn is_allowed_from(self, status: ModerationStatus) -> bool {
        self.allowed_from().contains(&status)
    }
}

/// Content flags reported by the vision model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentFlags {
    #[serde(default)]
    pub adult: bool,
    #[serde(default)]
    pub violence: bool,
    #[serde(default)]
    pub racy: bool,
    #[serde(default)]
    pub medical: bool,
}

/// Parsed AI assessment of one photo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiAssessment {
    /// Suitability for the public gallery (0.0–1.0).
    pub score: f32,
    /// Model's confidence in its own assessment (0.0–1.0).
    pub confidence: f32,
    pub animals_detected: bool,
    #[serde(default)]
    pub animal_types: Vec<String>,
    #[serde(default)]
    pub flags: ContentFlags,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Model that produced the assessment.
    #[serde(default)]
    pub model: String,
}

impl AiAssessment {
    /// Clamp numeric fields into 0.0–1.0. NaN becomes 0.0.
    pub fn clamped(mut self) -> Self {
        self.score = clamp_unit(self.score);
        self.confidence = clamp_unit(self.confidence);
        self
    }
}

fn clamp_unit(v: f32) -> f32 {
    if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) }
}

/// A photo submitted to the gallery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhotoSubmission {
    pub id: Uuid,
    /// Account that uploaded the photo.
    pub uploader: String,
    /// Remote URL or local upload path of the image.
    pub image_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    pub status: ModerationStatus,
    /// Latest AI assessment, if one completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assessment: Option<AiAssessment>,
    /// Why the current status was reached (policy rule or reviewer note).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewed_by: Option<String>,
    pub analysis_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PhotoSubmission {
    /// Create a new pending submission.
    pub fn new(
        uploader: impl Into<String>,
        image_ref: impl Into<String>,
        caption: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            uploader: uploader.into(),
            image_ref: image_ref.into(),
            caption: caption.filter(|c| !c.trim().is_empty()),
            status: ModerationStatus::Pending,
            assessment: None,
            decision_reason: None,
            rejection_reason: None,
            reviewed_by: None,
            analysis_attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Body of a submission request.
#[derive(Debug, Clone, Deserialize)]
pub struct NewPhoto {
    pub uploader: String,
    pub image_ref: String,
    #[serde(default)]
    pub caption: Option<String>,
}

impl NewPhoto {
    /// Reject blank uploaders and image references that are neither http(s) URLs
    /// nor plain upload paths.
    pub fn validate(&self) -> Result<(), String> {
        if self.uploader.trim().is_empty() {
            return Err("uploader must not be empty".into());
        }
        let image_ref = self.image_ref.trim();
        if image_ref.is_empty() {
            return Err("image_ref must not be empty".into());
        }
        if image_ref.contains("://")
            && !(image_ref.starts_with("https://") || image_ref.starts_with("http://"))
        {
            return Err(format!("unsupported image scheme: {}", image_ref));
        }
        Ok(())
    }
}

/// Who performed a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorKind {
    System,
    Ai,
    Human,
}

impl ActorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Ai => "ai",
            Self::Human => "human",
        }
    }
}

impl std::str::FromStr for ActorKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Self::System),
            "ai" => Ok(Self::Ai),
            "human" => Ok(Self::Human),
            _ => Err(format!("Unknown actor kind: {}", s)),
        }
    }
}

/// The party performing a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub kind: ActorKind,
    pub name: String,
}

impl Actor {
    pub fn system() -> Self {
        Self {
            kind: ActorKind::System,
            name: "system".into(),
        }
    }

    pub fn ai(model: impl Into<String>) -> Self {
        Self {
            kind: ActorKind::Ai,
            name: model.into(),
        }
    }

    pub fn human(reviewer: impl Into<String>) -> Self {
        Self {
            kind: ActorKind::Human,
            name: reviewer.into(),
        }
    }
}

/// One row of the moderation audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub photo_id: Uuid,
    /// `None` for the initial submission.
    pub from_status: Option<ModerationStatus>,
    pub to_status: ModerationStatus,
    pub actor: String,
    pub actor_kind: ActorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        photo_id: Uuid,
        from_status: Option<ModerationStatus>,
        to_status: ModerationStatus,
        actor: &Actor,
        note: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            photo_id,
            from_status,
            to_status,
            actor: actor.name.clone(),
            actor_kind: actor.kind,
            note,
            created_at: Utc::now(),
        }
    }
}

/// Messages pushed to WebSocket subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    /// Full human-review queue, sent on connect and after lag.
    QueueSync { photos: Vec<PhotoSubmission> },
    /// A new photo was submitted.
    PhotoSubmitted { photo: PhotoSubmission },
    /// A photo changed status.
    StatusChanged {
        id: Uuid,
        from: ModerationStatus,
        to: ModerationStatus,
        actor: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_string_round_trip() {
        for status in ModerationStatus::ALL {
            assert_eq!(status.as_str().parse::<ModerationStatus>().unwrap(), status);
        }
        assert!("deleted".parse::<ModerationStatus>().is_err());
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&ModerationStatus::HumanReview).unwrap();
        assert_eq!(json, "\"human_review\"");
    }

    #[test]
    fn human_decisions_allowed_from_everywhere() {
        for status in ModerationStatus::ALL {
            assert!(Transition::Approve.is_allowed_from(status));
            assert!(Transition::Reject.is_allowed_from(status));
            assert!(Transition::Feature.is_allowed_from(status));
        }
    }

    #[test]
    fn human_review_reachable_from_every_settled_state() {
        for status in ModerationStatus::ALL {
            if status != ModerationStatus::Analyzing {
                assert!(Transition::Escalate.is_allowed_from(status), "{status}");
            }
        }
    }

    #[test]
    fn ai_decisions_only_apply_while_analyzing() {
        let t = Transition::AiDecision(ModerationStatus::AiApproved);
        assert!(t.is_allowed_from(ModerationStatus::Analyzing));
        assert!(!t.is_allowed_from(ModerationStatus::Approved));
        assert!(!t.is_allowed_from(ModerationStatus::Pending));
    }

    #[test]
    fn requeue_never_undoes_a_human_decision() {
        for status in ModerationStatus::ALL {
            if status.is_human_final() {
                assert!(!Transition::Requeue.is_allowed_from(status));
            }
        }
    }

    #[test]
    fn assessment_clamps_scores() {
        let a = AiAssessment {
            score: 1.7,
            confidence: f32::NAN,
            animals_detected: true,
            animal_types: vec![],
            flags: ContentFlags::default(),
            summary: String::new(),
            tags: vec![],
            model: String::new(),
        }
        .clamped();
        assert_eq!(a.score, 1.0);
        assert_eq!(a.confidence, 0.0);
    }

    #[test]
    fn new_photo_validation() {
        let ok = NewPhoto {
            uploader: "dana".into(),
            image_ref: "https://cdn.example.org/p/1.jpg".into(),
            caption: None,
        };
        assert!(ok.validate().is_ok());

        let local = NewPhoto {
            image_ref: "uploads/2026/rex.png".into(),
            ..ok.clone()
        };
        assert!(local.validate().is_ok());

        let blank = NewPhoto {
            uploader: "  ".into(),
            ..ok.clone()
        };
        assert!(blank.validate().is_err());

        let ftp = NewPhoto {
            image_ref: "ftp://host/x.jpg".into(),
            ..ok
        };
        assert!(ftp.validate().is_err());
    }

    #[test]
    fn blank_caption_dropped() {
        let photo = PhotoSubmission::new("dana", "a.jpg", Some("   ".into()));
        assert!(photo.caption.is_none());
        assert_eq!(photo.status, ModerationStatus::Pending);
    }

    #[test]
    fn queue_event_tagged() {
        let ev = QueueEvent::StatusChanged {
            id: Uuid::nil(),
            from: ModerationStatus::Analyzing,
            to: ModerationStatus::HumanReview,
            actor: "mock".into(),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "status_changed");
        assert_eq!(json["to"], "human_review");
    }
}
