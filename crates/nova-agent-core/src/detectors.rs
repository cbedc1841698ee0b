//! Detectors scan a workspace's tasks and propose suggestions.
//!
//! Every detector is a pure function of `(tasks, now)`: it never mutates a
//! task and can run alone or in any order with the others.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::{
    floor_days_between, AddDependencyPayload, EffortTag, FlagRiskPayload, NewSuggestion,
    OptimizeAssignmentPayload, RebalanceTaskPayload, SetFocusTimePayload, SetPriorityPayload,
    SplitTaskPayload, SubtaskDraft, SuggestionPayload, Task, TaskStatus, UserId, WorkspaceId,
};

pub const MISSING_ESTIMATE_LIMIT: usize = 5;
pub const OVERSIZED_TASK_LIMIT: usize = 3;
pub const REBALANCE_PER_ASSIGNEE: usize = 2;

pub const DEPENDENCY_KEYWORDS: [&str; 6] = [
    "after",
    "depends on",
    "requires",
    "needs",
    "blocked by",
    "waiting for",
];

const RISK_DEADLINE_REASON: &str = "High priority task with low progress and approaching deadline";
const RISK_NOT_STARTED_REASON: &str = "Large task not started after 3 days";
const RISK_STALLED_REASON: &str = "No progress update in 3+ days";

/// A detector's output before it is bound to a workspace.
#[derive(Debug, Clone, PartialEq)]
pub struct Proposal {
    pub payload: SuggestionPayload,
    pub confidence: f32,
}

impl Proposal {
    #[must_use]
    pub fn into_new_suggestion(self, workspace_id: WorkspaceId) -> NewSuggestion {
        NewSuggestion::new(workspace_id, self.payload, self.confidence)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Detector {
    MissingEstimate,
    OversizedTask,
    Risk,
    Rebalance,
    DependencyKeyword,
    PriorityInference,
    AssignmentOptimizer,
}

impl Detector {
    pub const ALL: [Self; 7] = [
        Self::MissingEstimate,
        Self::OversizedTask,
        Self::Risk,
        Self::Rebalance,
        Self::DependencyKeyword,
        Self::PriorityInference,
        Self::AssignmentOptimizer,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingEstimate => "missing_estimate",
            Self::OversizedTask => "oversized_task",
            Self::Risk => "risk",
            Self::Rebalance => "rebalance",
            Self::DependencyKeyword => "dependency_keyword",
            Self::PriorityInference => "priority_inference",
            Self::AssignmentOptimizer => "assignment_optimizer",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|detector| detector.as_str() == value)
    }

    #[must_use]
    pub fn detect(self, tasks: &[Task], now: OffsetDateTime) -> Vec<Proposal> {
        match self {
            Self::MissingEstimate => detect_missing_estimates(tasks),
            Self::OversizedTask => detect_oversized_tasks(tasks),
            Self::Risk => detect_risks(tasks, now),
            Self::Rebalance => detect_rebalance(tasks),
            Self::DependencyKeyword => detect_dependency_keywords(tasks),
            Self::PriorityInference => detect_priorities(tasks, now),
            Self::AssignmentOptimizer => detect_assignment_matches(tasks),
        }
    }
}

/// Focus hours by effort; untagged work is treated as large.
#[must_use]
pub fn focus_time_for(effort: Option<EffortTag>) -> u32 {
    match effort {
        Some(EffortTag::Small) => 2,
        Some(EffortTag::Medium) => 4,
        Some(EffortTag::Large) | None => 8,
    }
}

#[must_use]
pub fn detect_missing_estimates(tasks: &[Task]) -> Vec<Proposal> {
    tasks
        .iter()
        .filter(|task| task.status.is_active() && task.suggested_focus_time.is_none())
        .take(MISSING_ESTIMATE_LIMIT)
        .map(|task| Proposal {
            payload: SuggestionPayload::SetFocusTime(SetFocusTimePayload {
                task_id: task.task_id,
                focus_time: focus_time_for(task.effort_tag),
            }),
            confidence: 0.75,
        })
        .collect()
}

#[must_use]
pub fn detect_oversized_tasks(tasks: &[Task]) -> Vec<Proposal> {
    tasks
        .iter()
        .filter(|task| task.status.is_active() && task.effort_tag == Some(EffortTag::Large))
        .take(OVERSIZED_TASK_LIMIT)
        .map(|task| Proposal {
            payload: SuggestionPayload::SplitTask(SplitTaskPayload {
                parent_task_id: task.task_id,
                subtasks: vec![
                    SubtaskDraft {
                        title: format!("{} - Part 1", task.title),
                        description: Some("First phase".to_string()),
                        effort_tag: Some(EffortTag::Medium),
                    },
                    SubtaskDraft {
                        title: format!("{} - Part 2", task.title),
                        description: Some("Second phase".to_string()),
                        effort_tag: Some(EffortTag::Medium),
                    },
                ],
            }),
            confidence: 0.70,
        })
        .collect()
}

/// First matching risk rule for `task`, if any.
#[must_use]
pub fn risk_reason(task: &Task, now: OffsetDateTime) -> Option<&'static str> {
    let high_priority = task.priority.is_some_and(|priority| priority >= 8);
    let deadline_close = task
        .due_date
        .is_some_and(|due| due < now + Duration::days(2));
    if high_priority && task.progress < 30 && deadline_close {
        return Some(RISK_DEADLINE_REASON);
    }

    if task.effort_tag == Some(EffortTag::Large)
        && task.progress == 0
        && floor_days_between(task.created_at, now) > 3
    {
        return Some(RISK_NOT_STARTED_REASON);
    }

    if task.progress > 0 && task.progress < 100 && floor_days_between(task.updated_at, now) > 3 {
        return Some(RISK_STALLED_REASON);
    }

    None
}

#[must_use]
pub fn detect_risks(tasks: &[Task], now: OffsetDateTime) -> Vec<Proposal> {
    tasks
        .iter()
        .filter(|task| task.status.is_active() && !task.is_potential_risk)
        .filter_map(|task| {
            risk_reason(task, now).map(|reason| Proposal {
                payload: SuggestionPayload::FlagRisk(FlagRiskPayload {
                    task_id: task.task_id,
                    reason: reason.to_string(),
                    action: "escalate_or_split".to_string(),
                }),
                confidence: 0.82,
            })
        })
        .collect()
}

#[must_use]
pub fn detect_rebalance(tasks: &[Task]) -> Vec<Proposal> {
    let mut load: BTreeMap<UserId, (usize, u32)> = BTreeMap::new();
    for task in tasks.iter().filter(|task| task.status.is_active()) {
        if let Some(assignee) = task.assignee_id {
            let entry = load.entry(assignee).or_insert((0, 0));
            entry.0 += 1;
            entry.1 = entry.1.saturating_add(task.story_points.unwrap_or(0));
        }
    }

    let mut proposals = Vec::new();
    for (assignee, (count, points)) in load {
        if count <= 5 && points <= 20 {
            continue;
        }

        let mut movable: Vec<&Task> = tasks
            .iter()
            .filter(|task| {
                task.assignee_id == Some(assignee)
                    && task.status == TaskStatus::Todo
                    && task.priority.is_some_and(|priority| priority < 8)
            })
            .collect();
        movable.sort_by_key(|task| task.priority);

        let reason = format!("User has {count} tasks ({points} points)");
        proposals.extend(movable.into_iter().take(REBALANCE_PER_ASSIGNEE).map(|task| {
            Proposal {
                payload: SuggestionPayload::RebalanceTask(RebalanceTaskPayload {
                    task_id: task.task_id,
                    current_assignee: assignee,
                    reason: reason.clone(),
                    action: "reassign_to_available_member".to_string(),
                }),
                confidence: 0.75,
            }
        }));
    }
    proposals
}

#[must_use]
pub fn detect_dependency_keywords(tasks: &[Task]) -> Vec<Proposal> {
    let active: Vec<&Task> = tasks.iter().filter(|task| task.status.is_active()).collect();

    active
        .iter()
        .filter_map(|task| {
            let text = task.searchable_text();
            let keyword = DEPENDENCY_KEYWORDS
                .into_iter()
                .find(|keyword| text.contains(keyword))?;
            let prerequisite = active.iter().find(|other| {
                let title = other.title.trim().to_lowercase();
                other.task_id != task.task_id && !title.is_empty() && text.contains(&title)
            });

            Some(Proposal {
                payload: SuggestionPayload::AddDependency(AddDependencyPayload {
                    task_id: task.task_id,
                    detected_keyword: keyword.to_string(),
                    note: "Review task description to identify dependency".to_string(),
                    action: "manual_review_recommended".to_string(),
                    depends_on_task_id: prerequisite.map(|other| other.task_id),
                }),
                confidence: 0.65,
            })
        })
        .collect()
}

/// Priority implied by the due date and effort of an unprioritized task.
#[must_use]
pub fn infer_priority(task: &Task, now: OffsetDateTime) -> u8 {
    let base = match task.due_date.map(|due| floor_days_between(now, due)) {
        Some(days) if days <= 1 => 10,
        Some(days) if days <= 3 => 8,
        Some(days) if days <= 7 => 6,
        _ => 5,
    };
    let bump = if task.effort_tag == Some(EffortTag::Large) {
        2
    } else {
        0
    };
    (base + bump).min(10)
}

#[must_use]
pub fn detect_priorities(tasks: &[Task], now: OffsetDateTime) -> Vec<Proposal> {
    tasks
        .iter()
        .filter(|task| task.status == TaskStatus::Todo && task.priority.is_none())
        .filter_map(|task| {
            let suggested_priority = infer_priority(task, now);
            (suggested_priority >= 6).then(|| Proposal {
                payload: SuggestionPayload::SetPriority(SetPriorityPayload {
                    task_id: task.task_id,
                    suggested_priority,
                }),
                confidence: 0.80,
            })
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Default)]
struct TrackRecord {
    progress_sum: u32,
    completed: u32,
}

impl TrackRecord {
    #[allow(clippy::cast_precision_loss)]
    fn avg_progress(self) -> f32 {
        if self.completed == 0 {
            return 0.0;
        }
        self.progress_sum as f32 / self.completed as f32
    }

    #[allow(clippy::cast_precision_loss)]
    fn score(self) -> f32 {
        let experience = (self.completed as f32 / 10.0).min(1.0);
        self.avg_progress() * (1.0 + experience)
    }
}

/// Matches unassigned todo work with the user who finished the most
/// comparable tasks best.
#[must_use]
pub fn detect_assignment_matches(tasks: &[Task]) -> Vec<Proposal> {
    let mut records: BTreeMap<(EffortTag, UserId), TrackRecord> = BTreeMap::new();
    for task in tasks.iter().filter(|task| task.status == TaskStatus::Done) {
        if let (Some(assignee), Some(effort)) = (task.assignee_id, task.effort_tag) {
            let record = records.entry((effort, assignee)).or_default();
            record.progress_sum += u32::from(task.progress);
            record.completed += 1;
        }
    }

    tasks
        .iter()
        .filter(|task| task.status == TaskStatus::Todo && task.assignee_id.is_none())
        .filter_map(|task| {
            let effort = task.effort_tag?;
            let mut best: Option<(UserId, TrackRecord, f32)> = None;
            for ((_, user_id), record) in records.iter().filter(|((tag, _), _)| *tag == effort) {
                let score = record.score();
                if score > best.map_or(0.0, |(_, _, best_score)| best_score) {
                    best = Some((*user_id, *record, score));
                }
            }
            let (user_id, record, score) = best?;

            Some(Proposal {
                payload: SuggestionPayload::OptimizeAssignment(OptimizeAssignmentPayload {
                    task_id: task.task_id,
                    suggested_assignee: user_id,
                    reason: format!("Strong track record with {} tasks", effort.as_str()),
                    avg_progress: record.avg_progress(),
                    experience: record.completed,
                }),
                confidence: (score / 100.0).min(0.85),
            })
        })
        .collect()
}
