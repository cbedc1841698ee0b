//! Domain model and pure decision logic for the Nova suggestion/audit engine.
//!
//! Nothing in this crate touches storage or the network. The store crate
//! persists these types and the extraction crate produces them.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::{Date, Duration, OffsetDateTime, Time, UtcOffset};
use ulid::Ulid;

pub mod audit;
pub mod autonomy;
pub mod detectors;
pub mod suggestion;
pub mod task;

pub use audit::{
    AdvisorySnapshot, AuditAction, AuditRecord, CreatedTaskSnapshot, FocusTimeSnapshot,
    OperationFailure, OperationResult, PrioritySnapshot, RejectionAfter, RejectionBefore,
    Reversal, RiskSnapshot, SplitSnapshot, TargetType,
};
pub use autonomy::{
    AutonomyConfig, AutonomyMode, Disposition, PolicyDecision, DEFAULT_AUTO_CONFIDENCE_THRESHOLD,
};
pub use detectors::{Detector, Proposal};
pub use suggestion::{
    AddDependencyPayload, AutoMappedTaskPayload, CreateTaskPayload, FlagRiskPayload,
    NewSuggestion, OptimizeAssignmentPayload, RebalanceTaskPayload, SetFocusTimePayload,
    SetPriorityPayload, SplitTaskPayload, SubtaskDraft, Suggestion, SuggestionKind,
    SuggestionPayload,
};
pub use task::{
    EffortTag, Meeting, NewMeeting, NewTask, Task, TaskStatus, TaskUpdate, User, Workspace,
};

/// Version of the JSON shapes exchanged by the CLI and the HTTP service.
pub const API_CONTRACT_VERSION: &str = "agent.v1";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum AgentError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("payload error: {0}")]
    Payload(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
        #[serde(transparent)]
        pub struct $name(pub Ulid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            /// Parses a ULID string into this identifier.
            ///
            /// # Errors
            /// Returns [`AgentError::Validation`] when `value` is not a ULID.
            pub fn parse(value: &str) -> Result<Self, AgentError> {
                Ulid::from_string(value.trim()).map(Self).map_err(|_| {
                    AgentError::Validation(format!(concat!("invalid ", $label, " ULID: {}"), value))
                })
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = AgentError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                Self::parse(value)
            }
        }
    };
}

ulid_id!(WorkspaceId, "workspace_id");
ulid_id!(TaskId, "task_id");
ulid_id!(UserId, "user_id");
ulid_id!(MeetingId, "meeting_id");
ulid_id!(
    /// Identity of a staged suggestion. Stable across apply/reject.
    SuggestionId,
    "suggestion_id"
);
ulid_id!(AuditId, "audit_id");

/// Parses an RFC3339 timestamp and enforces a UTC offset.
///
/// # Errors
/// Returns [`AgentError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, AgentError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| AgentError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(AgentError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`AgentError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, AgentError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| AgentError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

/// Accepts either a full RFC3339 UTC timestamp or a bare `YYYY-MM-DD` date,
/// which is read as midnight UTC.
///
/// # Errors
/// Returns [`AgentError::Validation`] when neither form parses.
pub fn parse_due_date(value: &str) -> Result<OffsetDateTime, AgentError> {
    let trimmed = value.trim();
    if let Ok(parsed) = parse_rfc3339_utc(trimmed) {
        return Ok(parsed);
    }

    let date = Date::parse(trimmed, time::macros::format_description!("[year]-[month]-[day]"))
        .map_err(|err| AgentError::Validation(format!("invalid due date `{trimmed}`: {err}")))?;
    Ok(date.with_time(Time::MIDNIGHT).assume_utc())
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

/// Whole days from `from` to `to`, rounded toward negative infinity.
#[must_use]
pub fn floor_days_between(from: OffsetDateTime, to: OffsetDateTime) -> i64 {
    (to - from)
        .whole_seconds()
        .div_euclid(Duration::DAY.whole_seconds())
}

/// Rejects NaN and values outside `[0.0, 1.0]`.
///
/// # Errors
/// Returns [`AgentError::Validation`] naming `field` when out of range.
pub fn validate_unit_interval(field: &str, value: f32) -> Result<(), AgentError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(AgentError::Validation(format!(
            "{field} MUST be in [0.0, 1.0], got {value}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    #[test]
    fn ids_round_trip_through_display_and_parse() {
        let id = TaskId::new();
        let parsed = must_ok(TaskId::parse(&id.to_string()));
        assert_eq!(parsed, id);
        assert!(TaskId::parse("not-a-ulid").is_err());
    }

    #[test]
    fn parse_rfc3339_rejects_non_utc_offsets() {
        assert!(parse_rfc3339_utc("2026-02-07T12:00:00+02:00").is_err());
        assert!(parse_rfc3339_utc("2026-02-07T12:00:00Z").is_ok());
    }

    #[test]
    fn due_date_accepts_bare_calendar_dates() {
        let parsed = must_ok(parse_due_date("2025-02-15"));
        assert_eq!(must_ok(format_rfc3339(parsed)), "2025-02-15T00:00:00Z");
        assert!(parse_due_date("next tuesday").is_err());
    }

    #[test]
    fn floor_days_rounds_toward_negative_infinity() {
        let now = must_ok(parse_rfc3339_utc("2026-03-10T12:00:00Z"));
        let half_day_ago = now - Duration::hours(12);
        let in_thirty_hours = now + Duration::hours(30);
        assert_eq!(floor_days_between(now, half_day_ago), -1);
        assert_eq!(floor_days_between(now, in_thirty_hours), 1);
    }

    #[test]
    fn unit_interval_rejects_nan_and_out_of_range() {
        assert!(validate_unit_interval("confidence", 0.0).is_ok());
        assert!(validate_unit_interval("confidence", 1.0).is_ok());
        assert!(validate_unit_interval("confidence", 1.01).is_err());
        assert!(validate_unit_interval("confidence", -0.1).is_err());
        assert!(validate_unit_interval("confidence", f32::NAN).is_err());
    }
}
