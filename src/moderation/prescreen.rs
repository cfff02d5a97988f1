//! Pre-AI rules engine for fast pattern matching.
//!
//! Runs before the vision call to short-circuit obvious cases:
//! - Blocked image hosts → auto-reject
//! - Injury/surgery/medical wording in the caption → human review
//!
//! If the engine returns a `PolicyDecision`, the AI call is skipped entirely.

use regex::Regex;
use tracing::debug;

use crate::moderation::model::PhotoSubmission;
use crate::moderation::policy::{PolicyDecision, PolicyOutcome};

/// Which field a rule matches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleField {
    Caption,
    ImageRef,
}

/// A single pre-screen rule with a compiled regex.
#[derive(Debug, Clone)]
pub struct PrescreenRule {
    /// Human-readable pattern description.
    pub pattern: String,
    pub regex: Regex,
    pub field: RuleField,
    pub outcome: PolicyOutcome,
    /// Why this rule triggers.
    pub reason: String,
}

/// Pre-AI rules engine.
pub struct PrescreenRules {
    rules: Vec<PrescreenRule>,
}

impl PrescreenRules {
    /// Create a rules engine with the default patterns.
    pub fn default_rules() -> Self {
        let mut engine = Self::empty();
        // Patterns are literals; compilation cannot fail.
        let defaults: [(&str, &str, RuleField, PolicyOutcome, &str); 3] = [
            (
                "medical wording",
                r"(?i)\b(surgery|surgical|stitches|sutures|wound|injur(y|ed|ies)|bleeding|blood|amputat\w*|x-?ray|vet(erinary)? (visit|clinic|hospital))\b",
                RuleField::Caption,
                PolicyOutcome::HumanReview,
                "caption mentions medical content",
            ),
            (
                "graphic wording",
                r"(?i)\b(graphic|gore|abuse|cruelty|dead|carcass|roadkill)\b",
                RuleField::Caption,
                PolicyOutcome::HumanReview,
                "caption mentions distressing content",
            ),
            (
                "data or javascript URI",
                r"(?i)^(data|javascript|file):",
                RuleField::ImageRef,
                PolicyOutcome::AutoRejected,
                "unsupported image reference",
            ),
        ];
        for (pattern, regex, field, outcome, reason) in defaults {
            if let Ok(regex) = Regex::new(regex) {
                engine.rules.push(PrescreenRule {
                    pattern: pattern.into(),
                    regex,
                    field,
                    outcome,
                    reason: reason.into(),
                });
            }
        }
        engine
    }

    /// Create an empty rules engine (for testing).
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Add a custom rule.
    pub fn add_rule(
        &mut self,
        pattern: &str,
        field: RuleField,
        outcome: PolicyOutcome,
        reason: &str,
    ) -> Result<(), regex::Error> {
        self.rules.push(PrescreenRule {
            pattern: pattern.into(),
            regex: Regex::new(pattern)?,
            field,
            outcome,
            reason: reason.into(),
        });
        Ok(())
    }

    /// Reject images served from `host` (and its subdomains).
    pub fn block_host(&mut self, host: &str) -> Result<(), regex::Error> {
        let pattern = format!(r"(?i)^https?://([^/]+\.)?{}(:\d+)?(/|$)", regex::escape(host));
        self.add_rule(
            &pattern,
            RuleField::ImageRef,
            PolicyOutcome::AutoRejected,
            &format!("image host {host} is blocked"),
        )
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Evaluate a photo against all rules, first match wins.
    ///
    /// Returns `None` if no rules match (fall through to AI analysis).
    pub fn evaluate(&self, photo: &PhotoSubmission) -> Option<PolicyDecision> {
        for rule in &self.rules {
            let value = match rule.field {
                RuleField::Caption => match photo.caption {
                    Some(ref caption) => caption.as_str(),
                    None => continue,
                },
                RuleField::ImageRef => photo.image_ref.as_str(),
            };

            if rule.regex.is_match(value) {
                debug!(
                    photo_id = %photo.id,
                    rule = %rule.pattern,
                    reason = %rule.reason,
                    "Photo matched pre-screen rule"
                );
                return Some(PolicyDecision {
                    outcome: rule.outcome,
                    reason: format!("pre-screen: {}", rule.reason),
                });
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn photo(image_ref: &str, caption: Option<&str>) -> PhotoSubmission {
        PhotoSubmission::new("dana", image_ref, caption.map(String::from))
    }

    #[test]
    fn default_rules_compile() {
        assert_eq!(PrescreenRules::default_rules().len(), 3);
    }

    #[test]
    fn medical_caption_goes_to_human() {
        let rules = PrescreenRules::default_rules();
        let d = rules
            .evaluate(&photo("https://cdn/x.jpg", Some("Buddy recovering after surgery")))
            .unwrap();
        assert_eq!(d.outcome, PolicyOutcome::HumanReview);
        assert!(d.reason.starts_with("pre-screen"));
    }

    #[test]
    fn plain_caption_passes_through() {
        let rules = PrescreenRules::default_rules();
        assert!(rules
            .evaluate(&photo("https://cdn/x.jpg", Some("Luna napping in the sun")))
            .is_none());
        assert!(rules.evaluate(&photo("https://cdn/x.jpg", None)).is_none());
    }

    #[test]
    fn data_uri_rejected() {
        let rules = PrescreenRules::default_rules();
        let d = rules.evaluate(&photo("data:image/png;base64,AAAA", None)).unwrap();
        assert_eq!(d.outcome, PolicyOutcome::AutoRejected);
    }

    #[test]
    fn blocked_host_and_subdomains() {
        let mut rules = PrescreenRules::empty();
        rules.block_host("badpics.example").unwrap();

        let hit = rules.evaluate(&photo("https://img.badpics.example/a.jpg", None));
        assert_eq!(hit.unwrap().outcome, PolicyOutcome::AutoRejected);
        assert!(rules
            .evaluate(&photo("https://goodpics.example/badpics.example.jpg", None))
            .is_none());
    }

    #[test]
    fn first_matching_rule_wins() {
        let mut rules = PrescreenRules::empty();
        rules
            .add_rule(r"(?i)puppy", RuleField::Caption, PolicyOutcome::AutoApproved, "trusted")
            .unwrap();
        rules
            .add_rule(r"(?i)surgery", RuleField::Caption, PolicyOutcome::HumanReview, "medical")
            .unwrap();
        let d = rules.evaluate(&photo("a.jpg", Some("puppy after surgery"))).unwrap();
        assert_eq!(d.outcome, PolicyOutcome::AutoApproved);
    }

    #[test]
    fn empty_rules_pass_everything() {
        let rules = PrescreenRules::empty();
        assert!(rules.is_empty());
        assert!(rules.evaluate(&photo("data:x", Some("surgery"))).is_none());
    }
}
