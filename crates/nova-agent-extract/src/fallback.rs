//! Deterministic, schema-valid substitutes for untrustworthy oracle output.

use crate::{AssistantAction, DependencySet, EstimateScore, TaskCandidate};
use nova_agent_core::EffortTag;

pub const TASK_MARKERS: [&str; 5] = ["i will", "i'll", "action:", "todo:", "task:"];

pub const FALLBACK_SUMMARY: &str =
    "Summary unavailable: the meeting transcript could not be summarized automatically.";

const FALLBACK_ASSISTANT_EXPLANATION: &str =
    "I couldn't parse that request. Please try rephrasing.";

/// One low-confidence candidate per line carrying a commitment marker.
#[must_use]
pub fn fallback_task_candidates(transcript: &str) -> Vec<TaskCandidate> {
    transcript
        .lines()
        .filter(|line| {
            let lowered = line.to_lowercase();
            TASK_MARKERS.iter().any(|marker| lowered.contains(marker))
        })
        .map(|line| TaskCandidate {
            assignee: None,
            description: line.trim().to_string(),
            due_date: None,
            priority: Some(5),
            effort_tag: Some(EffortTag::Medium),
            confidence: 0.5,
            is_blocked: false,
            blocker_reason: None,
        })
        .collect()
}

#[must_use]
pub fn fallback_dependencies() -> DependencySet {
    DependencySet {
        dependencies: Vec::new(),
    }
}

#[must_use]
pub fn fallback_estimate() -> EstimateScore {
    EstimateScore {
        reach: 100,
        impact: 5,
        confidence: 0.5,
        effort: 8,
    }
}

#[must_use]
pub fn fallback_assistant_action() -> AssistantAction {
    AssistantAction {
        action: "none".to_string(),
        payload: None,
        confidence: None,
        explanation: FALLBACK_ASSISTANT_EXPLANATION.to_string(),
    }
}
