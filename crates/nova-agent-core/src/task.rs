use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    validate_unit_interval, AgentError, AutonomyConfig, MeetingId, TaskId, UserId, WorkspaceId,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Todo,
    InProgress,
    Qa,
    Done,
    Released,
}

impl TaskStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::InProgress => "in_progress",
            Self::Qa => "qa",
            Self::Done => "done",
            Self::Released => "released",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "todo" => Some(Self::Todo),
            "in_progress" => Some(Self::InProgress),
            "qa" => Some(Self::Qa),
            "done" => Some(Self::Done),
            "released" => Some(Self::Released),
            _ => None,
        }
    }

    /// Work that is still open for the detectors: `todo` or `in_progress`.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Todo | Self::InProgress)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EffortTag {
    Small,
    Medium,
    Large,
}

impl EffortTag {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "small" => Some(Self::Small),
            "medium" => Some(Self::Medium),
            "large" => Some(Self::Large),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub task_id: TaskId,
    pub workspace_id: WorkspaceId,
    pub title: String,
    pub description: Option<String>,
    pub assignee_id: Option<UserId>,
    pub status: TaskStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub due_date: Option<OffsetDateTime>,
    pub priority: Option<u8>,
    pub effort_tag: Option<EffortTag>,
    pub story_points: Option<u32>,
    pub progress: u8,
    pub suggested_focus_time: Option<u32>,
    pub is_potential_risk: bool,
    pub risk_reason: Option<String>,
    pub needs_priority_review: bool,
    pub is_blocked: bool,
    pub blocker_reason: Option<String>,
    pub parent_task_id: Option<TaskId>,
    pub confidence: Option<f32>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Task {
    /// Title and description joined and lowercased, for keyword matching.
    #[must_use]
    pub fn searchable_text(&self) -> String {
        format!(
            "{} {}",
            self.title,
            self.description.as_deref().unwrap_or_default()
        )
        .to_lowercase()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewTask {
    pub workspace_id: WorkspaceId,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub assignee_id: Option<UserId>,
    pub status: TaskStatus,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub due_date: Option<OffsetDateTime>,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub effort_tag: Option<EffortTag>,
    #[serde(default)]
    pub story_points: Option<u32>,
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub is_blocked: bool,
    #[serde(default)]
    pub blocker_reason: Option<String>,
    #[serde(default)]
    pub parent_task_id: Option<TaskId>,
    #[serde(default)]
    pub confidence: Option<f32>,
    #[serde(default)]
    pub needs_priority_review: bool,
}

impl NewTask {
    /// A `todo` task with only a title; callers fill in the rest.
    #[must_use]
    pub fn draft(workspace_id: WorkspaceId, title: impl Into<String>) -> Self {
        Self {
            workspace_id,
            title: title.into(),
            description: None,
            assignee_id: None,
            status: TaskStatus::Todo,
            due_date: None,
            priority: None,
            effort_tag: None,
            story_points: None,
            progress: 0,
            is_blocked: false,
            blocker_reason: None,
            parent_task_id: None,
            confidence: None,
            needs_priority_review: false,
        }
    }

    /// # Errors
    /// Returns [`AgentError::Validation`] for an empty title, a priority
    /// outside 1..=10, progress above 100, or confidence outside [0, 1].
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.title.trim().is_empty() {
            return Err(AgentError::Validation(
                "task title MUST be provided".to_string(),
            ));
        }
        if let Some(priority) = self.priority {
            validate_priority(priority)?;
        }
        validate_progress(self.progress)?;
        if let Some(confidence) = self.confidence {
            validate_unit_interval("task confidence", confidence)?;
        }
        Ok(())
    }
}

/// Partial update of the fields people edit by hand.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskUpdate {
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub progress: Option<u8>,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub assignee_id: Option<UserId>,
    #[serde(default)]
    pub story_points: Option<u32>,
    #[serde(default)]
    pub effort_tag: Option<EffortTag>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub due_date: Option<OffsetDateTime>,
}

impl TaskUpdate {
    /// # Errors
    /// Returns [`AgentError::Validation`] for out-of-range priority or progress.
    pub fn validate(&self) -> Result<(), AgentError> {
        if let Some(priority) = self.priority {
            validate_priority(priority)?;
        }
        if let Some(progress) = self.progress {
            validate_progress(progress)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub user_id: UserId,
    pub username: String,
    pub display_name: String,
    pub role: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Workspace {
    pub workspace_id: WorkspaceId,
    pub name: String,
    pub autonomy: AutonomyConfig,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Meeting {
    pub meeting_id: MeetingId,
    pub workspace_id: WorkspaceId,
    pub title: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub meeting_date: Option<OffsetDateTime>,
    pub transcript: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewMeeting {
    pub workspace_id: WorkspaceId,
    pub title: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub meeting_date: Option<OffsetDateTime>,
    pub transcript: String,
}

impl NewMeeting {
    /// # Errors
    /// Returns [`AgentError::Validation`] for an empty title or transcript.
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.title.trim().is_empty() {
            return Err(AgentError::Validation(
                "meeting title MUST be provided".to_string(),
            ));
        }
        if self.transcript.trim().is_empty() {
            return Err(AgentError::Validation(
                "meeting transcript MUST be provided".to_string(),
            ));
        }
        Ok(())
    }
}

pub(crate) fn validate_priority(priority: u8) -> Result<(), AgentError> {
    if (1..=10).contains(&priority) {
        Ok(())
    } else {
        Err(AgentError::Validation(format!(
            "priority MUST be in [1, 10], got {priority}"
        )))
    }
}

fn validate_progress(progress: u8) -> Result<(), AgentError> {
    if progress <= 100 {
        Ok(())
    } else {
        Err(AgentError::Validation(format!(
            "progress MUST be in [0, 100], got {progress}"
        )))
    }
}
