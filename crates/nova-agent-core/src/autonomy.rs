use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{validate_unit_interval, AgentError, SuggestionKind};

pub const DEFAULT_AUTO_CONFIDENCE_THRESHOLD: f32 = 0.85;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AutonomyMode {
    Off,
    Suggest,
    Auto,
}

impl AutonomyMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Suggest => "suggest",
            Self::Auto => "auto",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "off" => Some(Self::Off),
            "suggest" | "suggest_only" | "suggest-only" => Some(Self::Suggest),
            "auto" => Some(Self::Auto),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Do not create the suggestion at all.
    Suppressed,
    Pending,
    AutoApply,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyDecision {
    pub kind: SuggestionKind,
    pub disposition: Disposition,
    pub reason_code: String,
}

/// Per-workspace autonomy policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AutonomyConfig {
    pub mode: AutonomyMode,
    pub auto_confidence_threshold: f32,
    pub allowed_auto_kinds: BTreeSet<SuggestionKind>,
}

impl Default for AutonomyConfig {
    fn default() -> Self {
        Self {
            mode: AutonomyMode::Suggest,
            auto_confidence_threshold: DEFAULT_AUTO_CONFIDENCE_THRESHOLD,
            allowed_auto_kinds: BTreeSet::from([SuggestionKind::SetFocusTime]),
        }
    }
}

impl AutonomyConfig {
    /// Builds a configuration from raw admin input.
    ///
    /// # Errors
    /// Returns [`AgentError::Validation`] for an unknown mode or kind, or a
    /// threshold outside `[0.0, 1.0]`.
    pub fn from_parts<'a>(
        mode: &str,
        allowed_kinds: impl IntoIterator<Item = &'a str>,
        threshold: f32,
    ) -> Result<Self, AgentError> {
        let mode = AutonomyMode::parse(mode)
            .ok_or_else(|| AgentError::Validation(format!("invalid autonomy mode: {mode}")))?;
        let allowed_auto_kinds = allowed_kinds
            .into_iter()
            .map(|raw| {
                SuggestionKind::parse(raw).ok_or_else(|| {
                    AgentError::Validation(format!("unknown suggestion kind: {raw}"))
                })
            })
            .collect::<Result<BTreeSet<_>, _>>()?;

        let config = Self {
            mode,
            auto_confidence_threshold: threshold,
            allowed_auto_kinds,
        };
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns [`AgentError::Validation`] when the threshold is outside
    /// `[0.0, 1.0]`.
    pub fn validate(&self) -> Result<(), AgentError> {
        validate_unit_interval("auto_confidence_threshold", self.auto_confidence_threshold)
    }

    /// Resolves what happens to a newly generated suggestion.
    #[must_use]
    pub fn decide(&self, kind: SuggestionKind, confidence: f32) -> PolicyDecision {
        let (disposition, reason_code) = match self.mode {
            AutonomyMode::Off => (Disposition::Suppressed, "excluded.mode_off"),
            AutonomyMode::Suggest => (Disposition::Pending, "pending.suggest_only"),
            AutonomyMode::Auto if !self.allowed_auto_kinds.contains(&kind) => {
                (Disposition::Pending, "pending.kind_not_allowed")
            }
            AutonomyMode::Auto if confidence < self.auto_confidence_threshold => {
                (Disposition::Pending, "pending.below_threshold")
            }
            AutonomyMode::Auto => (Disposition::AutoApply, "auto.allowed"),
        };

        PolicyDecision {
            kind,
            disposition,
            reason_code: reason_code.to_string(),
        }
    }

    #[must_use]
    pub fn generates_suggestions(&self) -> bool {
        self.mode != AutonomyMode::Off
    }
}
