//! Structured extraction from untrusted oracle text.
//!
//! Every public extraction returns an [`Extraction`]: either the oracle's
//! output parsed and schema-checked, or a deterministic fallback with the
//! reason the oracle output was discarded. Nothing here returns an error to
//! the caller for bad oracle output.
//!
//! Entry points:
//! - [`Extractor::extract_tasks`]
//! - [`Extractor::detect_dependencies`]
//! - [`Extractor::score_estimate`]
//! - [`Extractor::assistant_action`]
//! - [`Extractor::summarize`]
//! - [`automap::auto_map_transcript`] (oracle-free)

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use nova_agent_core::{CreateTaskPayload, EffortTag, Proposal, SuggestionPayload};

pub mod automap;
pub mod fallback;
pub mod oracle;
mod prompts;
pub mod schema;

pub use automap::{auto_map_transcript, MappedTask};
pub use oracle::{
    DisabledOracle, HttpJsonOracle, HttpOracleSettings, MockOracle, OracleAdapter, OracleConfig,
    OracleMode, OraclePurpose, OracleRequest, DEFAULT_ORACLE_TIMEOUT_MS,
};

const TASK_TITLE_MAX_CHARS: usize = 100;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionKind {
    Tasks,
    Dependencies,
    Estimate,
    Assistant,
}

impl ExtractionKind {
    pub const ALL: [Self; 4] = [
        Self::Tasks,
        Self::Dependencies,
        Self::Estimate,
        Self::Assistant,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tasks => "tasks",
            Self::Dependencies => "dependencies",
            Self::Estimate => "estimate",
            Self::Assistant => "assistant",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value.trim())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskCandidate {
    #[serde(default)]
    pub assignee: Option<String>,
    pub description: String,
    #[serde(default)]
    pub due_date: Option<String>,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub effort_tag: Option<EffortTag>,
    pub confidence: f32,
    pub is_blocked: bool,
    #[serde(default)]
    pub blocker_reason: Option<String>,
}

impl TaskCandidate {
    /// A `create_task` proposal titled with the first 100 characters of the
    /// trimmed description.
    ///
    /// Unparseable due dates are dropped rather than failing the candidate.
    #[must_use]
    pub fn into_proposal(self) -> Proposal {
        let title: String = self
            .description
            .trim()
            .chars()
            .take(TASK_TITLE_MAX_CHARS)
            .collect();
        let due_date = self
            .due_date
            .as_deref()
            .and_then(|raw| nova_agent_core::parse_due_date(raw).ok());
        let confidence = self.confidence;
        Proposal {
            payload: SuggestionPayload::CreateTask(CreateTaskPayload {
                title,
                description: Some(self.description),
                assignee: self.assignee,
                assignee_id: None,
                priority: self.priority,
                effort_tag: self.effort_tag,
                due_date,
                is_blocked: self.is_blocked,
                blocker_reason: self.blocker_reason,
            }),
            confidence,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DependencyEdge {
    pub from: String,
    pub depends_on: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DependencySet {
    pub dependencies: Vec<DependencyEdge>,
}

/// Reach/impact/confidence/effort prioritization estimate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EstimateScore {
    pub reach: u32,
    pub impact: u8,
    pub confidence: f32,
    pub effort: u32,
}

impl EstimateScore {
    #[must_use]
    pub fn score(&self) -> f64 {
        if self.effort == 0 {
            return 0.0;
        }
        f64::from(self.reach) * f64::from(self.impact) * f64::from(self.confidence)
            / f64::from(self.effort)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssistantAction {
    pub action: String,
    #[serde(default)]
    pub payload: Option<Map<String, Value>>,
    #[serde(default)]
    pub confidence: Option<f32>,
    pub explanation: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum ExtractionPayload {
    Tasks(Vec<TaskCandidate>),
    Dependencies(DependencySet),
    Estimate(EstimateScore),
    Assistant(AssistantAction),
}

/// Why oracle output was replaced by a fallback.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FallbackReason {
    OracleUnavailable { message: String },
    MalformedOutput { message: String },
    SchemaViolation { errors: Vec<String> },
}

impl FallbackReason {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::OracleUnavailable { .. } => "oracle_unavailable",
            Self::MalformedOutput { .. } => "malformed_output",
            Self::SchemaViolation { .. } => "schema_violation",
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Extraction<T> {
    Parsed { payload: T },
    Fallback { payload: T, reason: FallbackReason },
}

impl<T> Extraction<T> {
    #[must_use]
    pub fn payload(&self) -> &T {
        match self {
            Self::Parsed { payload } | Self::Fallback { payload, .. } => payload,
        }
    }

    #[must_use]
    pub fn into_payload(self) -> T {
        match self {
            Self::Parsed { payload } | Self::Fallback { payload, .. } => payload,
        }
    }

    #[must_use]
    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback { .. })
    }

    #[must_use]
    pub fn fallback_reason(&self) -> Option<&FallbackReason> {
        match self {
            Self::Parsed { .. } => None,
            Self::Fallback { reason, .. } => Some(reason),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Extraction<U> {
        match self {
            Self::Parsed { payload } => Extraction::Parsed {
                payload: f(payload),
            },
            Self::Fallback { payload, reason } => Extraction::Fallback {
                payload: f(payload),
                reason,
            },
        }
    }
}

/// Runs oracle prompts and guards their output.
#[derive(Clone)]
pub struct Extractor {
    oracle: Arc<dyn OracleAdapter>,
}

impl std::fmt::Debug for Extractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extractor")
            .field("oracle", &self.oracle.oracle_name())
            .finish()
    }
}

impl Extractor {
    #[must_use]
    pub fn new(oracle: Arc<dyn OracleAdapter>) -> Self {
        Self { oracle }
    }

    #[must_use]
    pub fn mock() -> Self {
        Self::new(Arc::new(MockOracle::new()))
    }

    #[must_use]
    pub fn oracle_name(&self) -> &'static str {
        self.oracle.oracle_name()
    }

    #[must_use]
    pub fn extract_tasks(&self, transcript: &str) -> Extraction<Vec<TaskCandidate>> {
        self.guarded(
            OraclePurpose::TaskExtraction,
            prompts::task_extraction(transcript),
            &schema::task_candidates_schema(),
            || fallback::fallback_task_candidates(transcript),
        )
    }

    #[must_use]
    pub fn detect_dependencies(&self, transcript: &str) -> Extraction<DependencySet> {
        self.guarded(
            OraclePurpose::DependencyDetection,
            prompts::dependency_detection(transcript),
            &schema::dependencies_schema(),
            fallback::fallback_dependencies,
        )
    }

    #[must_use]
    pub fn score_estimate(&self, description: &str) -> Extraction<EstimateScore> {
        self.guarded(
            OraclePurpose::EstimateScoring,
            prompts::estimate_scoring(description),
            &schema::estimate_schema(),
            fallback::fallback_estimate,
        )
    }

    #[must_use]
    pub fn assistant_action(&self, message: &str, context: &str) -> Extraction<AssistantAction> {
        self.guarded(
            OraclePurpose::AssistantAction,
            prompts::assistant_action(message, context),
            &schema::assistant_action_schema(),
            fallback::fallback_assistant_action,
        )
    }

    /// Dispatches on `kind`; `context` is only read by the assistant kind.
    #[must_use]
    pub fn extract(
        &self,
        kind: ExtractionKind,
        input: &str,
        context: &str,
    ) -> Extraction<ExtractionPayload> {
        match kind {
            ExtractionKind::Tasks => self.extract_tasks(input).map(ExtractionPayload::Tasks),
            ExtractionKind::Dependencies => self
                .detect_dependencies(input)
                .map(ExtractionPayload::Dependencies),
            ExtractionKind::Estimate => self.score_estimate(input).map(ExtractionPayload::Estimate),
            ExtractionKind::Assistant => self
                .assistant_action(input, context)
                .map(ExtractionPayload::Assistant),
        }
    }

    /// Free-text summary. Empty or failed oracle output yields a fixed notice.
    #[must_use]
    pub fn summarize(&self, transcript: &str) -> String {
        let request = OracleRequest {
            purpose: OraclePurpose::MeetingSummary,
            prompt: prompts::meeting_summary(transcript),
        };
        match self.oracle.generate(&request) {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => fallback::FALLBACK_SUMMARY.to_string(),
            Err(err) => {
                warn!(oracle = self.oracle_name(), error = %err, "meeting summary unavailable");
                fallback::FALLBACK_SUMMARY.to_string()
            }
        }
    }

    fn guarded<T: DeserializeOwned>(
        &self,
        purpose: OraclePurpose,
        prompt: String,
        contract: &Value,
        fallback: impl FnOnce() -> T,
    ) -> Extraction<T> {
        let request = OracleRequest { purpose, prompt };
        let reason = match self.oracle.generate(&request) {
            Ok(raw) => match schema::parse_and_validate::<T>(&raw, contract) {
                Ok(payload) => {
                    debug!(
                        oracle = self.oracle_name(),
                        purpose = purpose.as_str(),
                        "oracle output accepted"
                    );
                    return Extraction::Parsed { payload };
                }
                Err(reason) => reason,
            },
            Err(err) => FallbackReason::OracleUnavailable {
                message: err.to_string(),
            },
        };

        warn!(
            oracle = self.oracle_name(),
            purpose = purpose.as_str(),
            reason = reason.code(),
            "oracle output discarded; using fallback"
        );
        Extraction::Fallback {
            payload: fallback(),
            reason,
        }
    }
}
