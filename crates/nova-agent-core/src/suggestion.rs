use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::task::validate_priority;
use crate::{
    validate_unit_interval, AgentError, EffortTag, SuggestionId, TaskId, UserId, WorkspaceId,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionKind {
    CreateTask,
    SetFocusTime,
    FlagRisk,
    SetPriority,
    SplitTask,
    RebalanceTask,
    AddDependency,
    OptimizeAssignment,
    AutoMappedTask,
}

impl SuggestionKind {
    pub const ALL: [Self; 9] = [
        Self::CreateTask,
        Self::SetFocusTime,
        Self::FlagRisk,
        Self::SetPriority,
        Self::SplitTask,
        Self::RebalanceTask,
        Self::AddDependency,
        Self::OptimizeAssignment,
        Self::AutoMappedTask,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CreateTask => "create_task",
            Self::SetFocusTime => "set_focus_time",
            Self::FlagRisk => "flag_risk",
            Self::SetPriority => "set_priority",
            Self::SplitTask => "split_task",
            Self::RebalanceTask => "rebalance_task",
            Self::AddDependency => "add_dependency",
            Self::OptimizeAssignment => "optimize_assignment",
            Self::AutoMappedTask => "auto_mapped_task",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value.trim())
    }

    /// Kinds whose application records an audit entry but leaves tasks as-is.
    #[must_use]
    pub fn is_advisory(self) -> bool {
        matches!(
            self,
            Self::RebalanceTask | Self::AddDependency | Self::OptimizeAssignment
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateTaskPayload {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Free-text assignee as spoken in a meeting; resolved against usernames.
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub assignee_id: Option<UserId>,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub effort_tag: Option<EffortTag>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub due_date: Option<OffsetDateTime>,
    #[serde(default)]
    pub is_blocked: bool,
    #[serde(default)]
    pub blocker_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SetFocusTimePayload {
    pub task_id: TaskId,
    pub focus_time: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FlagRiskPayload {
    pub task_id: TaskId,
    pub reason: String,
    #[serde(default = "default_risk_action")]
    pub action: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SetPriorityPayload {
    pub task_id: TaskId,
    pub suggested_priority: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubtaskDraft {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub effort_tag: Option<EffortTag>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SplitTaskPayload {
    pub parent_task_id: TaskId,
    pub subtasks: Vec<SubtaskDraft>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RebalanceTaskPayload {
    pub task_id: TaskId,
    pub current_assignee: UserId,
    pub reason: String,
    pub action: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddDependencyPayload {
    pub task_id: TaskId,
    pub detected_keyword: String,
    pub note: String,
    pub action: String,
    #[serde(default)]
    pub depends_on_task_id: Option<TaskId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OptimizeAssignmentPayload {
    pub task_id: TaskId,
    pub suggested_assignee: UserId,
    pub reason: String,
    pub avg_progress: f32,
    pub experience: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AutoMappedTaskPayload {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub owner_id: Option<UserId>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub deadline: Option<OffsetDateTime>,
    #[serde(default)]
    pub blockers: Option<String>,
    pub priority: u8,
}

/// One typed payload per [`SuggestionKind`].
///
/// Serializes as the bare payload object; the kind travels beside it.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum SuggestionPayload {
    CreateTask(CreateTaskPayload),
    SetFocusTime(SetFocusTimePayload),
    FlagRisk(FlagRiskPayload),
    SetPriority(SetPriorityPayload),
    SplitTask(SplitTaskPayload),
    RebalanceTask(RebalanceTaskPayload),
    AddDependency(AddDependencyPayload),
    OptimizeAssignment(OptimizeAssignmentPayload),
    AutoMappedTask(AutoMappedTaskPayload),
}

impl SuggestionPayload {
    #[must_use]
    pub fn kind(&self) -> SuggestionKind {
        match self {
            Self::CreateTask(_) => SuggestionKind::CreateTask,
            Self::SetFocusTime(_) => SuggestionKind::SetFocusTime,
            Self::FlagRisk(_) => SuggestionKind::FlagRisk,
            Self::SetPriority(_) => SuggestionKind::SetPriority,
            Self::SplitTask(_) => SuggestionKind::SplitTask,
            Self::RebalanceTask(_) => SuggestionKind::RebalanceTask,
            Self::AddDependency(_) => SuggestionKind::AddDependency,
            Self::OptimizeAssignment(_) => SuggestionKind::OptimizeAssignment,
            Self::AutoMappedTask(_) => SuggestionKind::AutoMappedTask,
        }
    }

    /// The existing task this suggestion acts on, if any.
    #[must_use]
    pub fn target_task(&self) -> Option<TaskId> {
        match self {
            Self::CreateTask(_) | Self::AutoMappedTask(_) => None,
            Self::SetFocusTime(payload) => Some(payload.task_id),
            Self::FlagRisk(payload) => Some(payload.task_id),
            Self::SetPriority(payload) => Some(payload.task_id),
            Self::SplitTask(payload) => Some(payload.parent_task_id),
            Self::RebalanceTask(payload) => Some(payload.task_id),
            Self::AddDependency(payload) => Some(payload.task_id),
            Self::OptimizeAssignment(payload) => Some(payload.task_id),
        }
    }

    /// Decodes a stored or user-supplied payload map for `kind`.
    ///
    /// # Errors
    /// Returns [`AgentError::Payload`] when the map does not match the
    /// kind's payload structure.
    pub fn from_json(kind: SuggestionKind, value: &Value) -> Result<Self, AgentError> {
        Ok(match kind {
            SuggestionKind::CreateTask => Self::CreateTask(decode(kind, value)?),
            SuggestionKind::SetFocusTime => Self::SetFocusTime(decode(kind, value)?),
            SuggestionKind::FlagRisk => Self::FlagRisk(decode(kind, value)?),
            SuggestionKind::SetPriority => Self::SetPriority(decode(kind, value)?),
            SuggestionKind::SplitTask => Self::SplitTask(decode(kind, value)?),
            SuggestionKind::RebalanceTask => Self::RebalanceTask(decode(kind, value)?),
            SuggestionKind::AddDependency => Self::AddDependency(decode(kind, value)?),
            SuggestionKind::OptimizeAssignment => Self::OptimizeAssignment(decode(kind, value)?),
            SuggestionKind::AutoMappedTask => Self::AutoMappedTask(decode(kind, value)?),
        })
    }

    /// # Errors
    /// Returns [`AgentError::Payload`] when serialization fails.
    pub fn to_json(&self) -> Result<Value, AgentError> {
        serde_json::to_value(self).map_err(|err| {
            AgentError::Payload(format!(
                "failed to encode {} payload: {err}",
                self.kind().as_str()
            ))
        })
    }

    /// # Errors
    /// Returns [`AgentError::Validation`] when a field is empty or out of range.
    pub fn validate(&self) -> Result<(), AgentError> {
        match self {
            Self::CreateTask(payload) => {
                require_text("create_task.title", &payload.title)?;
                if let Some(priority) = payload.priority {
                    validate_priority(priority)?;
                }
            }
            Self::SetFocusTime(payload) => {
                if payload.focus_time == 0 {
                    return Err(AgentError::Validation(
                        "set_focus_time.focus_time MUST be > 0".to_string(),
                    ));
                }
            }
            Self::FlagRisk(payload) => require_text("flag_risk.reason", &payload.reason)?,
            Self::SetPriority(payload) => validate_priority(payload.suggested_priority)?,
            Self::SplitTask(payload) => {
                if payload.subtasks.is_empty() {
                    return Err(AgentError::Validation(
                        "split_task.subtasks MUST contain at least one subtask".to_string(),
                    ));
                }
                for subtask in &payload.subtasks {
                    require_text("split_task.subtasks[].title", &subtask.title)?;
                }
            }
            Self::RebalanceTask(payload) => {
                require_text("rebalance_task.reason", &payload.reason)?;
            }
            Self::AddDependency(payload) => {
                require_text("add_dependency.detected_keyword", &payload.detected_keyword)?;
                if payload.depends_on_task_id == Some(payload.task_id) {
                    return Err(AgentError::Validation(
                        "add_dependency cannot make a task depend on itself".to_string(),
                    ));
                }
            }
            Self::OptimizeAssignment(payload) => {
                require_text("optimize_assignment.reason", &payload.reason)?;
            }
            Self::AutoMappedTask(payload) => {
                require_text("auto_mapped_task.title", &payload.title)?;
                validate_priority(payload.priority)?;
            }
        }
        Ok(())
    }

    /// Human-readable recommendation recorded for advisory kinds.
    #[must_use]
    pub fn recommendation(&self) -> Option<String> {
        match self {
            Self::RebalanceTask(payload) => Some(format!("{}: {}", payload.action, payload.reason)),
            Self::AddDependency(payload) => Some(match payload.depends_on_task_id {
                Some(prerequisite) => format!(
                    "{} (keyword `{}`, probable prerequisite {prerequisite})",
                    payload.note, payload.detected_keyword
                ),
                None => format!("{} (keyword `{}`)", payload.note, payload.detected_keyword),
            }),
            Self::OptimizeAssignment(payload) => Some(format!(
                "assign to {}: {}",
                payload.suggested_assignee, payload.reason
            )),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Suggestion {
    pub suggestion_seq: i64,
    pub suggestion_id: SuggestionId,
    pub workspace_id: WorkspaceId,
    pub kind: SuggestionKind,
    pub payload: SuggestionPayload,
    pub confidence: f32,
    pub applied: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewSuggestion {
    pub workspace_id: WorkspaceId,
    pub payload: SuggestionPayload,
    pub confidence: f32,
}

impl NewSuggestion {
    #[must_use]
    pub fn new(workspace_id: WorkspaceId, payload: SuggestionPayload, confidence: f32) -> Self {
        Self {
            workspace_id,
            payload,
            confidence,
        }
    }

    /// Builds a suggestion from a kind string and an untyped payload map, as
    /// received from CLI or HTTP callers.
    ///
    /// # Errors
    /// Returns [`AgentError::Validation`] for unknown kinds and
    /// [`AgentError::Payload`] for payloads that do not match the kind.
    pub fn from_untyped(
        workspace_id: WorkspaceId,
        kind: &str,
        payload: &Value,
        confidence: f32,
    ) -> Result<Self, AgentError> {
        let kind = SuggestionKind::parse(kind)
            .ok_or_else(|| AgentError::Validation(format!("unknown suggestion kind: {kind}")))?;
        let payload = SuggestionPayload::from_json(kind, payload)?;
        Ok(Self::new(workspace_id, payload, confidence))
    }

    /// # Errors
    /// Returns [`AgentError::Validation`] when confidence is outside
    /// `[0.0, 1.0]` or the payload is invalid.
    pub fn validate(&self) -> Result<(), AgentError> {
        validate_unit_interval("confidence", self.confidence)?;
        self.payload.validate()
    }

    #[must_use]
    pub fn kind(&self) -> SuggestionKind {
        self.payload.kind()
    }
}

fn decode<T: DeserializeOwned>(kind: SuggestionKind, value: &Value) -> Result<T, AgentError> {
    T::deserialize(value)
        .map_err(|err| AgentError::Payload(format!("invalid {} payload: {err}", kind.as_str())))
}

fn require_text(field: &str, value: &str) -> Result<(), AgentError> {
    if value.trim().is_empty() {
        return Err(AgentError::Validation(format!("{field} MUST be provided")));
    }
    Ok(())
}

fn default_risk_action() -> String {
    "escalate_or_split".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    #[test]
    fn kind_strings_round_trip_and_reject_unknown() {
        for kind in SuggestionKind::ALL {
            assert_eq!(SuggestionKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(SuggestionKind::parse("delete_everything"), None);
    }

    #[test]
    fn payload_decodes_by_kind_and_reports_mismatches() {
        let task_id = TaskId::new();
        let value = json!({"task_id": task_id.to_string(), "focus_time": 4});
        let payload = must_ok(SuggestionPayload::from_json(
            SuggestionKind::SetFocusTime,
            &value,
        ));
        assert_eq!(payload.kind(), SuggestionKind::SetFocusTime);
        assert_eq!(payload.target_task(), Some(task_id));
        assert_eq!(must_ok(payload.to_json()), value);

        let err = match SuggestionPayload::from_json(SuggestionKind::SplitTask, &value) {
            Ok(_) => panic!("focus payload must not decode as split_task"),
            Err(err) => err,
        };
        assert!(matches!(err, AgentError::Payload(_)));
    }

    #[test]
    fn confidence_outside_unit_interval_is_rejected() {
        let payload = SuggestionPayload::SetFocusTime(SetFocusTimePayload {
            task_id: TaskId::new(),
            focus_time: 4,
        });
        let workspace_id = WorkspaceId::new();
        for bad in [-0.01_f32, 1.01, f32::NAN, f32::INFINITY] {
            let suggestion = NewSuggestion::new(workspace_id, payload.clone(), bad);
            assert!(suggestion.validate().is_err(), "accepted confidence {bad}");
        }
        for good in [0.0_f32, 0.5, 1.0] {
            let suggestion = NewSuggestion::new(workspace_id, payload.clone(), good);
            assert!(suggestion.validate().is_ok(), "rejected confidence {good}");
        }
    }

    #[test]
    fn payload_validation_catches_structural_problems() {
        let empty_split = SuggestionPayload::SplitTask(SplitTaskPayload {
            parent_task_id: TaskId::new(),
            subtasks: Vec::new(),
        });
        assert!(empty_split.validate().is_err());

        let bad_priority = SuggestionPayload::SetPriority(SetPriorityPayload {
            task_id: TaskId::new(),
            suggested_priority: 0,
        });
        assert!(bad_priority.validate().is_err());

        let task_id = TaskId::new();
        let self_dependency = SuggestionPayload::AddDependency(AddDependencyPayload {
            task_id,
            detected_keyword: "after".to_string(),
            note: "review".to_string(),
            action: "manual_review_recommended".to_string(),
            depends_on_task_id: Some(task_id),
        });
        assert!(self_dependency.validate().is_err());
    }

    #[test]
    fn untyped_construction_rejects_unknown_kind() {
        let result = NewSuggestion::from_untyped(WorkspaceId::new(), "teleport", &json!({}), 0.5);
        assert!(matches!(result, Err(AgentError::Validation(_))));
    }

    #[test]
    fn flag_risk_action_defaults_when_missing() {
        let task_id = TaskId::new();
        let payload = must_ok(SuggestionPayload::from_json(
            SuggestionKind::FlagRisk,
            &json!({"task_id": task_id.to_string(), "reason": "late"}),
        ));
        match payload {
            SuggestionPayload::FlagRisk(inner) => assert_eq!(inner.action, "escalate_or_split"),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn only_advisory_kinds_carry_recommendations() {
        for kind in SuggestionKind::ALL {
            assert_eq!(
                kind.is_advisory(),
                matches!(
                    kind,
                    SuggestionKind::RebalanceTask
                        | SuggestionKind::AddDependency
                        | SuggestionKind::OptimizeAssignment
                )
            );
        }
        let payload = SuggestionPayload::RebalanceTask(RebalanceTaskPayload {
            task_id: TaskId::new(),
            current_assignee: UserId::new(),
            reason: "User has 6 tasks (12 points)".to_string(),
            action: "reassign_to_available_member".to_string(),
        });
        assert!(payload
            .recommendation()
            .is_some_and(|text| text.contains("User has 6 tasks")));
    }
}
