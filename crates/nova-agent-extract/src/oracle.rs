use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use nova_agent_core::AgentError;

pub const DEFAULT_ORACLE_TIMEOUT_MS: u64 = 30_000;

/// What the caller wants the oracle to produce.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OraclePurpose {
    TaskExtraction,
    DependencyDetection,
    EstimateScoring,
    AssistantAction,
    MeetingSummary,
}

impl OraclePurpose {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TaskExtraction => "task_extraction",
            Self::DependencyDetection => "dependency_detection",
            Self::EstimateScoring => "estimate_scoring",
            Self::AssistantAction => "assistant_action",
            Self::MeetingSummary => "meeting_summary",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleRequest {
    pub purpose: OraclePurpose,
    pub prompt: String,
}

/// A text-generation backend. Output is untrusted.
pub trait OracleAdapter: Send + Sync {
    fn oracle_name(&self) -> &'static str;

    #[allow(clippy::missing_errors_doc)]
    fn generate(&self, request: &OracleRequest) -> Result<String>;
}

/// Canned responses keyed on purpose, for offline use and tests.
#[derive(Debug, Clone, Default)]
pub struct MockOracle;

impl MockOracle {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn canned(purpose: OraclePurpose) -> Value {
        match purpose {
            OraclePurpose::TaskExtraction => json!([
                {
                    "assignee": "dev1",
                    "description": "Implement user authentication",
                    "due_date": "2025-02-15",
                    "priority": 9,
                    "effort_tag": "large",
                    "confidence": 0.92,
                    "is_blocked": false,
                    "blocker_reason": null
                },
                {
                    "assignee": "qa1",
                    "description": "Write test cases for login flow",
                    "due_date": "2025-02-20",
                    "priority": 7,
                    "effort_tag": "medium",
                    "confidence": 0.85,
                    "is_blocked": false,
                    "blocker_reason": null
                }
            ]),
            OraclePurpose::DependencyDetection => json!({
                "dependencies": [
                    {
                        "from": "Write test cases for login flow",
                        "depends_on": "Implement user authentication"
                    }
                ]
            }),
            OraclePurpose::EstimateScoring => json!({
                "reach": 500,
                "impact": 8,
                "confidence": 0.8,
                "effort": 40
            }),
            OraclePurpose::AssistantAction => json!({
                "action": "none",
                "payload": {},
                "confidence": 0.9,
                "explanation": "I can help you with tasks, sprints, and project queries."
            }),
            OraclePurpose::MeetingSummary => Value::String(
                "Team discussed authentication implementation and testing strategy. \
                 Dev1 will implement OAuth2 login by Feb 15. QA1 will prepare test cases."
                    .to_string(),
            ),
        }
    }
}

impl OracleAdapter for MockOracle {
    fn oracle_name(&self) -> &'static str {
        "mock"
    }

    fn generate(&self, request: &OracleRequest) -> Result<String> {
        match Self::canned(request.purpose) {
            Value::String(text) => Ok(text),
            other => Ok(serde_json::to_string_pretty(&other)?),
        }
    }
}

/// Always unavailable; every extraction takes its fallback path.
#[derive(Debug, Clone, Default)]
pub struct DisabledOracle;

impl OracleAdapter for DisabledOracle {
    fn oracle_name(&self) -> &'static str {
        "disabled"
    }

    fn generate(&self, request: &OracleRequest) -> Result<String> {
        Err(anyhow!(
            "oracle disabled; no output for {}",
            request.purpose.as_str()
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpOracleSettings {
    pub url: String,
    pub timeout_ms: u64,
    pub headers: BTreeMap<String, String>,
    pub auth_bearer_token: Option<String>,
}

/// POSTs `{"kind", "prompt"}` and reads the `text` field of the reply.
#[derive(Debug, Clone)]
pub struct HttpJsonOracle {
    settings: HttpOracleSettings,
}

impl HttpJsonOracle {
    #[must_use]
    pub fn new(settings: HttpOracleSettings) -> Self {
        Self { settings }
    }
}

impl OracleAdapter for HttpJsonOracle {
    fn oracle_name(&self) -> &'static str {
        "http_json"
    }

    fn generate(&self, request: &OracleRequest) -> Result<String> {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(self.settings.timeout_ms))
            .build();

        let mut req = agent
            .request("POST", &self.settings.url)
            .set("content-type", "application/json");
        for (header, value) in &self.settings.headers {
            req = req.set(header, value);
        }
        if let Some(token) = &self.settings.auth_bearer_token {
            req = req.set("authorization", &format!("Bearer {token}"));
        }

        let outbound = json!({
            "kind": request.purpose.as_str(),
            "prompt": request.prompt,
        });

        let body: Value = match req.send_json(&outbound) {
            Ok(response) => response.into_json()?,
            Err(ureq::Error::Status(code, _response)) => {
                return Err(anyhow!("oracle http status {code}"));
            }
            Err(ureq::Error::Transport(err)) => {
                return Err(anyhow!("oracle http transport failure: {err}"));
            }
        };

        match body.get("text") {
            Some(Value::String(text)) => Ok(text.clone()),
            _ => Err(anyhow!("oracle response missing string field `text`")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum OracleMode {
    Mock,
    Http,
    Disabled,
}

impl OracleMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mock => "mock",
            Self::Http => "http",
            Self::Disabled => "disabled",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "mock" => Some(Self::Mock),
            "http" | "http_json" => Some(Self::Http),
            "disabled" | "off" => Some(Self::Disabled),
            _ => None,
        }
    }
}

/// Oracle selection as read from flags and environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleConfig {
    pub mode: OracleMode,
    pub url: Option<String>,
    pub timeout_ms: u64,
    /// Name of the environment variable holding a bearer token.
    pub auth_bearer_env: Option<String>,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            mode: OracleMode::Mock,
            url: None,
            timeout_ms: DEFAULT_ORACLE_TIMEOUT_MS,
            auth_bearer_env: None,
        }
    }
}

impl OracleConfig {
    /// # Errors
    /// Returns [`AgentError::Configuration`] when http mode has no URL or the
    /// timeout is zero.
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.timeout_ms == 0 {
            return Err(AgentError::Configuration(
                "oracle timeout_ms MUST be > 0".to_string(),
            ));
        }
        if self.mode == OracleMode::Http {
            match self.url.as_deref().map(str::trim) {
                Some(url) if !url.is_empty() => {}
                _ => {
                    return Err(AgentError::Configuration(
                        "oracle url MUST be set when mode is http".to_string(),
                    ))
                }
            }
        }
        Ok(())
    }

    /// Validates the configuration and constructs the selected adapter.
    ///
    /// # Errors
    /// Returns an error when validation fails or the configured bearer token
    /// variable is unset.
    pub fn build(&self) -> Result<Arc<dyn OracleAdapter>> {
        self.validate()?;
        let oracle: Arc<dyn OracleAdapter> = match self.mode {
            OracleMode::Mock => Arc::new(MockOracle::new()),
            OracleMode::Disabled => Arc::new(DisabledOracle),
            OracleMode::Http => {
                let auth_bearer_token = match &self.auth_bearer_env {
                    Some(env_name) => Some(std::env::var(env_name).map_err(|_| {
                        anyhow!("oracle auth env var `{env_name}` is not set")
                    })?),
                    None => None,
                };
                Arc::new(HttpJsonOracle::new(HttpOracleSettings {
                    url: self.url.clone().unwrap_or_default(),
                    timeout_ms: self.timeout_ms,
                    headers: BTreeMap::new(),
                    auth_bearer_token,
                }))
            }
        };
        tracing::debug!(oracle = oracle.oracle_name(), "oracle adapter ready");
        Ok(oracle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_validation_rejects_http_without_url_and_zero_timeout() {
        let http = OracleConfig {
            mode: OracleMode::Http,
            ..OracleConfig::default()
        };
        assert!(http.validate().is_err());

        let blank = OracleConfig {
            mode: OracleMode::Http,
            url: Some("   ".to_string()),
            ..OracleConfig::default()
        };
        assert!(blank.validate().is_err());

        let zero = OracleConfig {
            timeout_ms: 0,
            ..OracleConfig::default()
        };
        assert!(zero.validate().is_err());

        assert!(OracleConfig::default().validate().is_ok());
    }

    #[test]
    fn build_selects_requested_adapter() {
        let mock = match OracleConfig::default().build() {
            Ok(oracle) => oracle,
            Err(err) => panic!("expected mock oracle: {err}"),
        };
        assert_eq!(mock.oracle_name(), "mock");

        let disabled = match (OracleConfig {
            mode: OracleMode::Disabled,
            ..OracleConfig::default()
        })
        .build()
        {
            Ok(oracle) => oracle,
            Err(err) => panic!("expected disabled oracle: {err}"),
        };
        assert_eq!(disabled.oracle_name(), "disabled");
    }

    #[test]
    fn http_oracle_reports_transport_failure() {
        let oracle = HttpJsonOracle::new(HttpOracleSettings {
            url: "http://127.0.0.1:9/oracle".to_string(),
            timeout_ms: 200,
            headers: BTreeMap::new(),
            auth_bearer_token: None,
        });
        let result = oracle.generate(&OracleRequest {
            purpose: OraclePurpose::MeetingSummary,
            prompt: "hello".to_string(),
        });
        assert!(result.is_err());
    }

    #[test]
    fn disabled_oracle_always_fails() {
        let result = DisabledOracle.generate(&OracleRequest {
            purpose: OraclePurpose::TaskExtraction,
            prompt: String::new(),
        });
        assert!(result.is_err());
    }

    #[test]
    fn mode_parse_accepts_aliases() {
        assert_eq!(OracleMode::parse("http_json"), Some(OracleMode::Http));
        assert_eq!(OracleMode::parse("off"), Some(OracleMode::Disabled));
        assert_eq!(OracleMode::parse("gpt"), None);
    }
}
