// src/models/resolution.rs

use std::fmt;

use serde::{Deserialize, Serialize};

/// Terminal action for one resolved event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionAction {
    Matched,
    Merged,
    Created,
    QueuedForReview,
}

impl ResolutionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionAction::Matched => "matched",
            ResolutionAction::Merged => "merged",
            ResolutionAction::Created => "created",
            ResolutionAction::QueuedForReview => "queued_for_review",
        }
    }
}

impl fmt::Display for ResolutionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the caller gets back: the canonical profile the event belongs to,
/// how that was decided, and the pair involved when two profiles were.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionOutcome {
    pub profile_id: String,
    pub action: ResolutionAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_profiles: Option<(String, String)>,
}

impl ResolutionOutcome {
    pub fn matched(profile_id: String, confidence_score: Option<f64>) -> Self {
        ResolutionOutcome {
            profile_id,
            action: ResolutionAction::Matched,
            confidence_score,
            matched_profiles: None,
        }
    }

    pub fn created(profile_id: String) -> Self {
        ResolutionOutcome {
            profile_id,
            action: ResolutionAction::Created,
            confidence_score: None,
            matched_profiles: None,
        }
    }
}
