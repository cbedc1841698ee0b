use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use time::OffsetDateTime;
use ulid::Ulid;

use crate::{AuditId, SuggestionId, SuggestionKind, TaskId, UserId, WorkspaceId};

/// Ledger action tag: `agent_<kind>`, `agent_suggestion_rejected`, or
/// `agent_undo`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum AuditAction {
    Applied(SuggestionKind),
    SuggestionRejected,
    Undo,
}

impl AuditAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Applied(kind) => match kind {
                SuggestionKind::CreateTask => "agent_create_task",
                SuggestionKind::SetFocusTime => "agent_set_focus_time",
                SuggestionKind::FlagRisk => "agent_flag_risk",
                SuggestionKind::SetPriority => "agent_set_priority",
                SuggestionKind::SplitTask => "agent_split_task",
                SuggestionKind::RebalanceTask => "agent_rebalance_task",
                SuggestionKind::AddDependency => "agent_add_dependency",
                SuggestionKind::OptimizeAssignment => "agent_optimize_assignment",
                SuggestionKind::AutoMappedTask => "agent_auto_mapped_task",
            },
            Self::SuggestionRejected => "agent_suggestion_rejected",
            Self::Undo => "agent_undo",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "agent_suggestion_rejected" => Some(Self::SuggestionRejected),
            "agent_undo" => Some(Self::Undo),
            other => other
                .strip_prefix("agent_")
                .and_then(SuggestionKind::parse)
                .map(Self::Applied),
        }
    }

    /// Action types the undo dispatch knows how to reverse.
    #[must_use]
    pub fn is_reversible(self) -> bool {
        matches!(
            self,
            Self::Applied(
                SuggestionKind::SetFocusTime | SuggestionKind::SetPriority | SuggestionKind::FlagRisk
            )
        )
    }
}

impl Serialize for AuditAction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for AuditAction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown audit action: {raw}")))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    Task,
    Suggestion,
}

impl TargetType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Suggestion => "suggestion",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "task" => Some(Self::Task),
            "suggestion" => Some(Self::Suggestion),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AuditRecord {
    pub audit_seq: i64,
    pub audit_id: AuditId,
    pub workspace_id: WorkspaceId,
    /// `None` marks an autonomous action.
    pub actor_id: Option<UserId>,
    pub action_type: AuditAction,
    pub target_type: TargetType,
    pub target_id: Ulid,
    pub before: Option<Value>,
    pub after: Option<Value>,
    pub suggestion_id: Option<SuggestionId>,
    pub reverts_audit_id: Option<AuditId>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl AuditRecord {
    /// Decides how this record would be reversed, without touching state.
    ///
    /// # Errors
    /// Returns the [`OperationFailure`] an undo request must report: no
    /// `before` snapshot, an action type outside the reversal dispatch, or
    /// a snapshot that does not decode.
    pub fn reversal(&self) -> OperationResult<Reversal> {
        let Some(before) = self.before.as_ref() else {
            return Err(OperationFailure::NothingToRestore {
                audit_id: self.audit_id,
            });
        };

        if !self.action_type.is_reversible() || self.target_type != TargetType::Task {
            return Err(OperationFailure::NotUndoable {
                audit_id: self.audit_id,
                action_type: self.action_type.as_str().to_string(),
            });
        }

        let task_id = TaskId(self.target_id);
        let snapshot_error = |err: serde_json::Error| OperationFailure::InvalidSnapshot {
            audit_id: self.audit_id,
            message: err.to_string(),
        };

        match self.action_type {
            AuditAction::Applied(SuggestionKind::SetFocusTime) => Ok(Reversal::FocusTime {
                task_id,
                snapshot: FocusTimeSnapshot::deserialize(before).map_err(snapshot_error)?,
            }),
            AuditAction::Applied(SuggestionKind::SetPriority) => Ok(Reversal::Priority {
                task_id,
                snapshot: PrioritySnapshot::deserialize(before).map_err(snapshot_error)?,
            }),
            AuditAction::Applied(SuggestionKind::FlagRisk) => Ok(Reversal::Risk {
                task_id,
                snapshot: RiskSnapshot::deserialize(before).map_err(snapshot_error)?,
            }),
            other => Err(OperationFailure::NotUndoable {
                audit_id: self.audit_id,
                action_type: other.as_str().to_string(),
            }),
        }
    }
}

/// The field write an undo performs on a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reversal {
    FocusTime {
        task_id: TaskId,
        snapshot: FocusTimeSnapshot,
    },
    Priority {
        task_id: TaskId,
        snapshot: PrioritySnapshot,
    },
    Risk {
        task_id: TaskId,
        snapshot: RiskSnapshot,
    },
}

impl Reversal {
    #[must_use]
    pub fn task_id(&self) -> TaskId {
        match self {
            Self::FocusTime { task_id, .. }
            | Self::Priority { task_id, .. }
            | Self::Risk { task_id, .. } => *task_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FocusTimeSnapshot {
    pub suggested_focus_time: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PrioritySnapshot {
    pub priority: Option<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RiskSnapshot {
    pub is_potential_risk: bool,
    pub risk_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreatedTaskSnapshot {
    pub task_id: TaskId,
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SplitSnapshot {
    pub subtasks_created: usize,
    pub subtask_ids: Vec<TaskId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdvisorySnapshot {
    pub advisory: bool,
    pub recommendation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RejectionBefore {
    pub kind: SuggestionKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RejectionAfter {
    pub rejected: bool,
}

/// A refused apply/reject/undo. The caller decides whether it is an error.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq, Serialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum OperationFailure {
    #[error("suggestion {suggestion_id} not found")]
    SuggestionNotFound { suggestion_id: SuggestionId },
    #[error("suggestion {suggestion_id} was already applied or rejected")]
    AlreadyDisposed { suggestion_id: SuggestionId },
    #[error("workspace {workspace_id} not found")]
    WorkspaceNotFound { workspace_id: WorkspaceId },
    #[error("task {task_id} not found")]
    TaskNotFound { task_id: TaskId },
    #[error("assignee {user_id} not found")]
    AssigneeNotFound { user_id: UserId },
    #[error("suggestion {suggestion_id} carries an invalid payload: {message}")]
    InvalidPayload {
        suggestion_id: SuggestionId,
        message: String,
    },
    #[error("audit record {audit_id} not found")]
    AuditNotFound { audit_id: AuditId },
    #[error("audit record {audit_id} has no before snapshot to restore")]
    NothingToRestore { audit_id: AuditId },
    #[error("action {action_type} is not undoable")]
    NotUndoable {
        audit_id: AuditId,
        action_type: String,
    },
    #[error("audit record {audit_id} was already undone")]
    AlreadyUndone { audit_id: AuditId },
    #[error("audit record {audit_id} has an unreadable snapshot: {message}")]
    InvalidSnapshot { audit_id: AuditId, message: String },
}

impl OperationFailure {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::SuggestionNotFound { .. } => "suggestion_not_found",
            Self::AlreadyDisposed { .. } => "already_disposed",
            Self::WorkspaceNotFound { .. } => "workspace_not_found",
            Self::TaskNotFound { .. } => "task_not_found",
            Self::AssigneeNotFound { .. } => "assignee_not_found",
            Self::InvalidPayload { .. } => "invalid_payload",
            Self::AuditNotFound { .. } => "audit_not_found",
            Self::NothingToRestore { .. } => "nothing_to_restore",
            Self::NotUndoable { .. } => "not_undoable",
            Self::AlreadyUndone { .. } => "already_undone",
            Self::InvalidSnapshot { .. } => "invalid_snapshot",
        }
    }

    /// Missing-entity failures, as opposed to state conflicts.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::SuggestionNotFound { .. }
                | Self::WorkspaceNotFound { .. }
                | Self::TaskNotFound { .. }
                | Self::AssigneeNotFound { .. }
                | Self::AuditNotFound { .. }
        )
    }
}

pub type OperationResult<T> = Result<T, OperationFailure>;
