use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use nova_agent_core::{
    now_utc, parse_rfc3339_utc, AuditId, AuditRecord, AutonomyConfig, NewMeeting, NewSuggestion,
    NewTask, OperationFailure, OperationResult, Proposal, Suggestion, SuggestionId, Task, TaskId,
    TaskUpdate, User, UserId, Workspace, WorkspaceId, API_CONTRACT_VERSION,
    DEFAULT_AUTO_CONFIDENCE_THRESHOLD,
};
use nova_agent_extract::{
    Extraction, ExtractionKind, ExtractionPayload, Extractor, OracleConfig, OracleMode,
};
use nova_agent_store_sqlite::{
    AutoMapReport, MeetingReport, ProposalOutcome, ScanReport, SqliteAgentStore,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "nova.service.v1";

/// Handle passed into blocking operations. Each call opens its own connection.
#[derive(Debug, Clone)]
struct AgentApi {
    db: PathBuf,
    extractor: Extractor,
    default_auto_confidence: f32,
}

impl AgentApi {
    fn store(&self) -> Result<SqliteAgentStore> {
        SqliteAgentStore::open(&self.db)
    }
}

#[derive(Debug, Clone)]
struct ServiceState {
    api: AgentApi,
    operation_timeout: Duration,
    telemetry: Arc<ServiceTelemetry>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: ServiceErrorPayload,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceErrorPayload {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
struct ServiceFailure {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct ExtractRequest {
    input: String,
    #[serde(default)]
    context: String,
}

#[derive(Debug, Clone, Deserialize)]
struct CreateWorkspaceRequest {
    name: String,
    #[serde(default)]
    autonomy: Option<AutonomyConfig>,
}

#[derive(Debug, Clone, Deserialize)]
struct AddUserRequest {
    username: String,
    display_name: String,
    #[serde(default = "default_role")]
    role: String,
}

#[derive(Debug, Clone, Deserialize)]
struct CreateSuggestionRequest {
    workspace_id: WorkspaceId,
    kind: String,
    payload: serde_json::Value,
    confidence: f32,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ActorRequest {
    #[serde(default)]
    actor_id: Option<UserId>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ScanRequest {
    #[serde(default)]
    as_of: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct AutoMapRequest {
    workspace_id: WorkspaceId,
    transcript: String,
    #[serde(default)]
    as_of: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct AuditListQuery {
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    timeout_ms: u64,
    oracle: &'static str,
    telemetry: ServiceTelemetrySnapshot,
}

#[derive(Debug, Default)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetry {
    requests_total: AtomicU64,
    requests_success_total: AtomicU64,
    requests_failure_total: AtomicU64,
    timeout_total: AtomicU64,
    invalid_json_total: AtomicU64,
    validation_error_total: AtomicU64,
    not_found_total: AtomicU64,
    conflict_total: AtomicU64,
    unprocessable_total: AtomicU64,
    schema_unavailable_total: AtomicU64,
    internal_error_total: AtomicU64,
    other_error_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetrySnapshot {
    requests_total: u64,
    requests_success_total: u64,
    requests_failure_total: u64,
    timeout_total: u64,
    invalid_json_total: u64,
    validation_error_total: u64,
    not_found_total: u64,
    conflict_total: u64,
    unprocessable_total: u64,
    schema_unavailable_total: u64,
    internal_error_total: u64,
    other_error_total: u64,
}

#[derive(Debug, Parser)]
#[command(name = "nova-agent-service")]
#[command(about = "Local HTTP service for the Nova suggestion and audit engine")]
struct Args {
    #[arg(long, env = "NOVA_DB", default_value = "./nova.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4010")]
    bind: SocketAddr,
    #[arg(long, default_value_t = 10_000)]
    operation_timeout_ms: u64,
    /// mock | http | disabled
    #[arg(long, env = "NOVA_ORACLE", default_value = "mock")]
    oracle: String,
    #[arg(long, env = "NOVA_ORACLE_URL")]
    oracle_url: Option<String>,
    #[arg(long, default_value_t = 2_000)]
    oracle_timeout_ms: u64,
    #[arg(long)]
    oracle_auth_env: Option<String>,
    #[arg(long, env = "NOVA_AUTO_CONFIDENCE", default_value_t = DEFAULT_AUTO_CONFIDENCE_THRESHOLD)]
    default_auto_confidence: f32,
}

impl Args {
    fn extractor(&self) -> Result<Extractor> {
        let mode = OracleMode::parse(&self.oracle)
            .ok_or_else(|| anyhow!("unknown oracle mode: {}", self.oracle))?;
        let config = OracleConfig {
            mode,
            url: self.oracle_url.clone(),
            timeout_ms: self.oracle_timeout_ms,
            auth_bearer_env: self.oracle_auth_env.clone(),
        };
        Ok(Extractor::new(config.build()?))
    }
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        let payload = ServiceError {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: ServiceErrorPayload {
                code: self.code,
                message: self.message.clone(),
                details: self.details,
            },
        };
        (self.status, Json(payload)).into_response()
    }
}

impl ServiceState {
    fn failure(
        status: StatusCode,
        code: &'static str,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> ServiceFailure {
        ServiceFailure { status, code, message: message.into(), details }
    }

    fn invalid_json(rejection: &JsonRejection) -> ServiceFailure {
        Self::failure(
            rejection.status(),
            "invalid_json",
            rejection.body_text(),
            Some(json!({"rejection": rejection.to_string()})),
        )
    }

    fn invalid_json_with_telemetry(&self, rejection: &JsonRejection) -> ServiceFailure {
        self.telemetry.record_failure("invalid_json", false);
        Self::invalid_json(rejection)
    }

    fn invalid_query_with_telemetry(&self, rejection: &QueryRejection) -> ServiceFailure {
        self.telemetry.record_failure("validation_error", false);
        Self::failure(StatusCode::BAD_REQUEST, "validation_error", rejection.body_text(), None)
    }

    fn invalid_id(&self, err: &nova_agent_core::AgentError) -> ServiceFailure {
        self.telemetry.record_failure("validation_error", false);
        Self::failure(StatusCode::BAD_REQUEST, "validation_error", err.to_string(), None)
    }

    fn missing(&self, code: &'static str, message: String) -> ServiceFailure {
        self.telemetry.record_failure(code, false);
        Self::failure(StatusCode::NOT_FOUND, code, message, None)
    }

    /// Maps a refused apply/reject/undo onto an HTTP status; the failure body
    /// is echoed in `details`.
    fn refused(&self, failure: &OperationFailure) -> ServiceFailure {
        let status = if failure.is_not_found() {
            StatusCode::NOT_FOUND
        } else {
            match failure {
                OperationFailure::InvalidPayload { .. } | OperationFailure::InvalidSnapshot { .. } => {
                    StatusCode::UNPROCESSABLE_ENTITY
                }
                _ => StatusCode::CONFLICT,
            }
        };
        warn!(code = failure.code(), %failure, "operation refused");
        self.telemetry.record_failure(failure.code(), false);
        Self::failure(
            status,
            failure.code(),
            failure.to_string(),
            serde_json::to_value(failure).ok(),
        )
    }

    fn classify_api_error(
        err: &anyhow::Error,
        default_status: StatusCode,
        default_code: &'static str,
    ) -> ServiceFailure {
        let message = err.to_string();
        let diagnostic = format!("{err:#}");
        let normalized = diagnostic.to_ascii_lowercase();

        if normalized.contains("not found") {
            return Self::failure(StatusCode::NOT_FOUND, "not_found", message, None);
        }

        if normalized.contains("unique constraint failed")
            || normalized.contains("foreign key constraint failed")
            || normalized.contains("already exists")
        {
            return Self::failure(StatusCode::CONFLICT, "write_conflict", message, None);
        }

        if normalized.contains("validation error")
            || normalized.contains("payload error")
            || normalized.contains("must be provided")
            || normalized.contains("unknown suggestion kind")
            || normalized.contains("invalid timestamp")
        {
            return Self::failure(StatusCode::BAD_REQUEST, "validation_error", message, None);
        }

        if normalized.contains("schema")
            || normalized.contains("sqlite")
            || normalized.contains("database")
        {
            return Self::failure(
                StatusCode::SERVICE_UNAVAILABLE,
                "schema_unavailable",
                message,
                None,
            );
        }

        Self::failure(default_status, default_code, message, None)
    }

    async fn execute<T, F>(
        &self,
        default_status: StatusCode,
        default_code: &'static str,
        operation_label: &'static str,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(AgentApi) -> anyhow::Result<T> + Send + 'static,
    {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        let api = self.api.clone();
        // Dropping the join handle on timeout does not stop the blocking
        // call; a mutation can still commit after the client gets the error.
        let handle = tokio::task::spawn_blocking(move || op(api));
        let join_result =
            tokio::time::timeout(self.operation_timeout, handle).await.map_err(|_| {
                self.telemetry.record_failure(default_code, true);
                Self::failure(
                    default_status,
                    default_code,
                    format!(
                        "{operation_label} timed out after {} ms; the store call was not cancelled and may still commit",
                        self.operation_timeout.as_millis()
                    ),
                    Some(json!({
                        "timeout_ms": self.operation_timeout.as_millis(),
                        "may_still_commit": true,
                    })),
                )
            })?;

        let op_result = join_result.map_err(|err| {
            self.telemetry.record_failure("internal_error", false);
            Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                format!("{operation_label} join failure: {err}"),
                None,
            )
        })?;

        op_result.map_err(|err| {
            let failure = Self::classify_api_error(&err, default_status, default_code);
            self.telemetry.record_failure(failure.code, false);
            failure
        })
    }

    async fn run_blocking<T, F>(
        &self,
        default_status: StatusCode,
        default_code: &'static str,
        operation_label: &'static str,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(AgentApi) -> anyhow::Result<T> + Send + 'static,
    {
        let value = self.execute(default_status, default_code, operation_label, op).await?;
        self.telemetry.requests_success_total.fetch_add(1, Ordering::Relaxed);
        Ok(value)
    }

    /// Like [`Self::run_blocking`], for operations whose refusals are typed.
    async fn run_operation<T, F>(
        &self,
        operation_label: &'static str,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(AgentApi) -> anyhow::Result<OperationResult<T>> + Send + 'static,
    {
        let outcome = self
            .execute(
                StatusCode::INTERNAL_SERVER_ERROR,
                "operation_failed",
                operation_label,
                op,
            )
            .await?;
        match outcome {
            Ok(value) => {
                self.telemetry.requests_success_total.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(failure) => Err(self.refused(&failure)),
        }
    }
}

impl ServiceTelemetry {
    fn record_failure(&self, code: &str, timeout: bool) {
        self.requests_failure_total.fetch_add(1, Ordering::Relaxed);
        if timeout {
            self.timeout_total.fetch_add(1, Ordering::Relaxed);
        }
        match code {
            "invalid_json" => {
                self.invalid_json_total.fetch_add(1, Ordering::Relaxed);
            }
            "validation_error" => {
                self.validation_error_total.fetch_add(1, Ordering::Relaxed);
            }
            "already_disposed" | "already_undone" | "nothing_to_restore" | "not_undoable"
            | "write_conflict" => {
                self.conflict_total.fetch_add(1, Ordering::Relaxed);
            }
            "invalid_payload" | "invalid_snapshot" => {
                self.unprocessable_total.fetch_add(1, Ordering::Relaxed);
            }
            "schema_unavailable" => {
                self.schema_unavailable_total.fetch_add(1, Ordering::Relaxed);
            }
            "internal_error" => {
                self.internal_error_total.fetch_add(1, Ordering::Relaxed);
            }
            other if other.ends_with("not_found") => {
                self.not_found_total.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.other_error_total.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn snapshot(&self) -> ServiceTelemetrySnapshot {
        ServiceTelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success_total: self.requests_success_total.load(Ordering::Relaxed),
            requests_failure_total: self.requests_failure_total.load(Ordering::Relaxed),
            timeout_total: self.timeout_total.load(Ordering::Relaxed),
            invalid_json_total: self.invalid_json_total.load(Ordering::Relaxed),
            validation_error_total: self.validation_error_total.load(Ordering::Relaxed),
            not_found_total: self.not_found_total.load(Ordering::Relaxed),
            conflict_total: self.conflict_total.load(Ordering::Relaxed),
            unprocessable_total: self.unprocessable_total.load(Ordering::Relaxed),
            schema_unavailable_total: self.schema_unavailable_total.load(Ordering::Relaxed),
            internal_error_total: self.internal_error_total.load(Ordering::Relaxed),
            other_error_total: self.other_error_total.load(Ordering::Relaxed),
        }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn default_role() -> String {
    "dev".to_string()
}

fn parse_as_of(raw: Option<&str>) -> Result<OffsetDateTime> {
    match raw {
        Some(value) => parse_rfc3339_utc(value).map_err(|err| anyhow!("invalid timestamp: {err}")),
        None => Ok(now_utc()),
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/extract/:kind", post(extract))
        .route("/v1/users", get(user_list).post(user_add))
        .route("/v1/workspaces", post(workspace_create))
        .route("/v1/workspaces/:workspace_id", get(workspace_show))
        .route(
            "/v1/workspaces/:workspace_id/autonomy",
            get(autonomy_show).put(autonomy_set),
        )
        .route("/v1/workspaces/:workspace_id/tasks", get(task_list))
        .route(
            "/v1/workspaces/:workspace_id/suggestions/pending",
            get(suggestion_pending),
        )
        .route("/v1/workspaces/:workspace_id/audits", get(audit_list))
        .route("/v1/workspaces/:workspace_id/scan", post(engine_scan))
        .route("/v1/tasks", post(task_create))
        .route("/v1/tasks/:task_id", get(task_show).patch(task_update))
        .route("/v1/suggestions", post(suggestion_create))
        .route("/v1/suggestions/:suggestion_id", get(suggestion_show))
        .route("/v1/suggestions/:suggestion_id/apply", post(suggestion_apply))
        .route("/v1/suggestions/:suggestion_id/reject", post(suggestion_reject))
        .route("/v1/audits/:audit_id", get(audit_show))
        .route("/v1/audits/:audit_id/undo", post(audit_undo))
        .route("/v1/meetings/process", post(meeting_process))
        .route("/v1/meetings/auto-map", post(meeting_auto_map))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let extractor = args.extractor()?;
    SqliteAgentStore::open(&args.db)?.migrate()?;

    let state = ServiceState {
        api: AgentApi {
            db: args.db.clone(),
            extractor,
            default_auto_confidence: args.default_auto_confidence,
        },
        operation_timeout: Duration::from_millis(args.operation_timeout_ms),
        telemetry: Arc::new(ServiceTelemetry::default()),
    };
    info!(
        bind = %args.bind,
        db = %args.db.display(),
        oracle = state.api.extractor.oracle_name(),
        "nova agent service listening"
    );
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health(State(state): State<ServiceState>) -> Json<ServiceEnvelope<HealthResponse>> {
    let timeout_ms = u64::try_from(state.operation_timeout.as_millis()).unwrap_or(u64::MAX);
    Json(envelope(HealthResponse {
        status: "ok",
        timeout_ms,
        oracle: state.api.extractor.oracle_name(),
        telemetry: state.telemetry.snapshot(),
    }))
}

async fn extract(
    State(state): State<ServiceState>,
    Path(kind): Path<String>,
    payload: Result<Json<ExtractRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<Extraction<ExtractionPayload>>>, ServiceFailure> {
    let Some(kind) = ExtractionKind::parse(&kind) else {
        state.telemetry.record_failure("validation_error", false);
        return Err(ServiceState::failure(
            StatusCode::BAD_REQUEST,
            "validation_error",
            format!("unknown extraction kind: {kind}"),
            Some(json!({"expected": ["tasks", "dependencies", "estimate", "assistant"]})),
        ));
    };
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let extraction = state
        .run_blocking(StatusCode::GATEWAY_TIMEOUT, "extraction_failed", "extract", move |api| {
            Ok(api.extractor.extract(kind, &request.input, &request.context))
        })
        .await?;
    Ok(Json(envelope(extraction)))
}

async fn user_add(
    State(state): State<ServiceState>,
    payload: Result<Json<AddUserRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<User>>, ServiceFailure> {
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let user = state
        .run_blocking(StatusCode::INTERNAL_SERVER_ERROR, "write_failed", "user_add", move |api| {
            api.store()?.add_user(&request.username, &request.display_name, &request.role)
        })
        .await?;
    Ok(Json(envelope(user)))
}

async fn user_list(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<Vec<User>>>, ServiceFailure> {
    let users = state
        .run_blocking(StatusCode::INTERNAL_SERVER_ERROR, "query_failed", "user_list", |api| {
            api.store()?.list_users()
        })
        .await?;
    Ok(Json(envelope(users)))
}

async fn workspace_create(
    State(state): State<ServiceState>,
    payload: Result<Json<CreateWorkspaceRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<Workspace>>, ServiceFailure> {
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let workspace = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "write_failed",
            "workspace_create",
            move |api| {
                let autonomy = request.autonomy.unwrap_or_else(|| AutonomyConfig {
                    auto_confidence_threshold: api.default_auto_confidence,
                    ..AutonomyConfig::default()
                });
                autonomy.validate()?;
                api.store()?.create_workspace(&request.name, &autonomy)
            },
        )
        .await?;
    Ok(Json(envelope(workspace)))
}

async fn workspace_show(
    State(state): State<ServiceState>,
    Path(raw_id): Path<String>,
) -> Result<Json<ServiceEnvelope<Workspace>>, ServiceFailure> {
    let workspace_id = WorkspaceId::parse(&raw_id).map_err(|err| state.invalid_id(&err))?;
    let workspace = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "query_failed",
            "workspace_show",
            move |api| api.store()?.get_workspace(workspace_id),
        )
        .await?;
    workspace
        .map(|value| Json(envelope(value)))
        .ok_or_else(|| state.missing("workspace_not_found", format!("workspace {workspace_id} not found")))
}

async fn autonomy_show(
    State(state): State<ServiceState>,
    Path(raw_id): Path<String>,
) -> Result<Json<ServiceEnvelope<AutonomyConfig>>, ServiceFailure> {
    let workspace_id = WorkspaceId::parse(&raw_id).map_err(|err| state.invalid_id(&err))?;
    let config = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "query_failed",
            "autonomy_show",
            move |api| api.store()?.get_autonomy_config(workspace_id),
        )
        .await?;
    config
        .map(|value| Json(envelope(value)))
        .ok_or_else(|| state.missing("workspace_not_found", format!("workspace {workspace_id} not found")))
}

async fn autonomy_set(
    State(state): State<ServiceState>,
    Path(raw_id): Path<String>,
    payload: Result<Json<AutonomyConfig>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<AutonomyConfig>>, ServiceFailure> {
    let workspace_id = WorkspaceId::parse(&raw_id).map_err(|err| state.invalid_id(&err))?;
    let Json(config) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let updated = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "write_failed",
            "autonomy_set",
            move |api| {
                config.validate()?;
                api.store()?.set_autonomy_config(workspace_id, &config)
            },
        )
        .await?;
    updated
        .map(|value| Json(envelope(value)))
        .ok_or_else(|| state.missing("workspace_not_found", format!("workspace {workspace_id} not found")))
}

async fn task_create(
    State(state): State<ServiceState>,
    payload: Result<Json<NewTask>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<Task>>, ServiceFailure> {
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let task = state
        .run_blocking(StatusCode::INTERNAL_SERVER_ERROR, "write_failed", "task_create", move |api| {
            api.store()?.create_task(&request)
        })
        .await?;
    Ok(Json(envelope(task)))
}

async fn task_list(
    State(state): State<ServiceState>,
    Path(raw_id): Path<String>,
) -> Result<Json<ServiceEnvelope<Vec<Task>>>, ServiceFailure> {
    let workspace_id = WorkspaceId::parse(&raw_id).map_err(|err| state.invalid_id(&err))?;
    let tasks = state
        .run_blocking(StatusCode::INTERNAL_SERVER_ERROR, "query_failed", "task_list", move |api| {
            api.store()?.list_tasks(workspace_id)
        })
        .await?;
    Ok(Json(envelope(tasks)))
}

async fn task_show(
    State(state): State<ServiceState>,
    Path(raw_id): Path<String>,
) -> Result<Json<ServiceEnvelope<Task>>, ServiceFailure> {
    let task_id = TaskId::parse(&raw_id).map_err(|err| state.invalid_id(&err))?;
    let task = state
        .run_blocking(StatusCode::INTERNAL_SERVER_ERROR, "query_failed", "task_show", move |api| {
            api.store()?.get_task(task_id)
        })
        .await?;
    task.map(|value| Json(envelope(value)))
        .ok_or_else(|| state.missing("task_not_found", format!("task {task_id} not found")))
}

async fn task_update(
    State(state): State<ServiceState>,
    Path(raw_id): Path<String>,
    payload: Result<Json<TaskUpdate>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<Task>>, ServiceFailure> {
    let task_id = TaskId::parse(&raw_id).map_err(|err| state.invalid_id(&err))?;
    let Json(update) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let task = state
        .run_blocking(StatusCode::INTERNAL_SERVER_ERROR, "write_failed", "task_update", move |api| {
            api.store()?.update_task(task_id, &update)
        })
        .await?;
    task.map(|value| Json(envelope(value)))
        .ok_or_else(|| state.missing("task_not_found", format!("task {task_id} not found")))
}

async fn suggestion_create(
    State(state): State<ServiceState>,
    payload: Result<Json<CreateSuggestionRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<ProposalOutcome>>, ServiceFailure> {
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let outcome = state
        .run_blocking(StatusCode::INTERNAL_SERVER_ERROR, "write_failed", "propose", move |api| {
            let input = NewSuggestion::from_untyped(
                request.workspace_id,
                &request.kind,
                &request.payload,
                request.confidence,
            )?;
            api.store()?.propose(
                request.workspace_id,
                Proposal {
                    payload: input.payload,
                    confidence: input.confidence,
                },
            )
        })
        .await?;
    Ok(Json(envelope(outcome)))
}

async fn suggestion_show(
    State(state): State<ServiceState>,
    Path(raw_id): Path<String>,
) -> Result<Json<ServiceEnvelope<Suggestion>>, ServiceFailure> {
    let suggestion_id = SuggestionId::parse(&raw_id).map_err(|err| state.invalid_id(&err))?;
    let suggestion = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "query_failed",
            "suggestion_show",
            move |api| api.store()?.get_suggestion(suggestion_id),
        )
        .await?;
    suggestion.map(|value| Json(envelope(value))).ok_or_else(|| {
        state.missing(
            "suggestion_not_found",
            format!("suggestion {suggestion_id} not found"),
        )
    })
}

async fn suggestion_pending(
    State(state): State<ServiceState>,
    Path(raw_id): Path<String>,
) -> Result<Json<ServiceEnvelope<Vec<Suggestion>>>, ServiceFailure> {
    let workspace_id = WorkspaceId::parse(&raw_id).map_err(|err| state.invalid_id(&err))?;
    let pending = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "query_failed",
            "suggestion_pending",
            move |api| api.store()?.list_pending(workspace_id),
        )
        .await?;
    Ok(Json(envelope(pending)))
}

async fn suggestion_apply(
    State(state): State<ServiceState>,
    Path(raw_id): Path<String>,
    payload: Result<Json<ActorRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<AuditRecord>>, ServiceFailure> {
    let suggestion_id = SuggestionId::parse(&raw_id).map_err(|err| state.invalid_id(&err))?;
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let audit = state
        .run_operation("suggestion_apply", move |api| {
            api.store()?.apply_suggestion(suggestion_id, request.actor_id)
        })
        .await?;
    Ok(Json(envelope(audit)))
}

async fn suggestion_reject(
    State(state): State<ServiceState>,
    Path(raw_id): Path<String>,
    payload: Result<Json<ActorRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<AuditRecord>>, ServiceFailure> {
    let suggestion_id = SuggestionId::parse(&raw_id).map_err(|err| state.invalid_id(&err))?;
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let audit = state
        .run_operation("suggestion_reject", move |api| {
            api.store()?.reject_suggestion(suggestion_id, request.actor_id)
        })
        .await?;
    Ok(Json(envelope(audit)))
}

async fn audit_list(
    State(state): State<ServiceState>,
    Path(raw_id): Path<String>,
    query: Result<Query<AuditListQuery>, QueryRejection>,
) -> Result<Json<ServiceEnvelope<Vec<AuditRecord>>>, ServiceFailure> {
    let workspace_id = WorkspaceId::parse(&raw_id).map_err(|err| state.invalid_id(&err))?;
    let Query(query) = query.map_err(|rejection| state.invalid_query_with_telemetry(&rejection))?;
    let audits = state
        .run_blocking(StatusCode::INTERNAL_SERVER_ERROR, "query_failed", "audit_list", move |api| {
            api.store()?.list_audits(workspace_id, query.limit)
        })
        .await?;
    Ok(Json(envelope(audits)))
}

async fn audit_show(
    State(state): State<ServiceState>,
    Path(raw_id): Path<String>,
) -> Result<Json<ServiceEnvelope<AuditRecord>>, ServiceFailure> {
    let audit_id = AuditId::parse(&raw_id).map_err(|err| state.invalid_id(&err))?;
    let audit = state
        .run_blocking(StatusCode::INTERNAL_SERVER_ERROR, "query_failed", "audit_show", move |api| {
            api.store()?.get_audit(audit_id)
        })
        .await?;
    audit
        .map(|value| Json(envelope(value)))
        .ok_or_else(|| state.missing("audit_not_found", format!("audit {audit_id} not found")))
}

async fn audit_undo(
    State(state): State<ServiceState>,
    Path(raw_id): Path<String>,
    payload: Result<Json<ActorRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<AuditRecord>>, ServiceFailure> {
    let audit_id = AuditId::parse(&raw_id).map_err(|err| state.invalid_id(&err))?;
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let audit = state
        .run_operation("audit_undo", move |api| {
            api.store()?.undo_audit(audit_id, request.actor_id)
        })
        .await?;
    Ok(Json(envelope(audit)))
}

async fn engine_scan(
    State(state): State<ServiceState>,
    Path(raw_id): Path<String>,
    payload: Result<Json<ScanRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<ScanReport>>, ServiceFailure> {
    let workspace_id = WorkspaceId::parse(&raw_id).map_err(|err| state.invalid_id(&err))?;
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let report = state
        .run_blocking(StatusCode::INTERNAL_SERVER_ERROR, "scan_failed", "engine_scan", move |api| {
            let now = parse_as_of(request.as_of.as_deref())?;
            api.store()?.scan(workspace_id, now)
        })
        .await?;
    Ok(Json(envelope(report)))
}

async fn meeting_process(
    State(state): State<ServiceState>,
    payload: Result<Json<NewMeeting>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<MeetingReport>>, ServiceFailure> {
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let report = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "meeting_failed",
            "meeting_process",
            move |api| api.store()?.ingest_meeting(&api.extractor, &request),
        )
        .await?;
    Ok(Json(envelope(report)))
}

async fn meeting_auto_map(
    State(state): State<ServiceState>,
    payload: Result<Json<AutoMapRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<AutoMapReport>>, ServiceFailure> {
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let report = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "meeting_failed",
            "meeting_auto_map",
            move |api| {
                let now = parse_as_of(request.as_of.as_deref())?;
                api.store()?.auto_map_meeting(request.workspace_id, &request.transcript, now)
            },
        )
        .await?;
    Ok(Json(envelope(report)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    use axum::body::to_bytes;
    use http::Request;
    use nova_agent_core::{EffortTag, TaskStatus};
    use serde_json::Value;
    use tower::ServiceExt;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("nova-service-{}.sqlite3", ulid::Ulid::new()))
    }

    fn migrated_api(extractor: Extractor) -> AgentApi {
        let db = unique_temp_db_path();
        let store = match SqliteAgentStore::open(&db) {
            Ok(store) => store,
            Err(err) => panic!("failed to open store: {err:#}"),
        };
        if let Err(err) = store.migrate() {
            panic!("failed to migrate store: {err:#}");
        }
        AgentApi {
            db,
            extractor,
            default_auto_confidence: DEFAULT_AUTO_CONFIDENCE_THRESHOLD,
        }
    }

    fn test_state(api: AgentApi, timeout_ms: u64) -> ServiceState {
        ServiceState {
            api,
            operation_timeout: Duration::from_millis(timeout_ms),
            telemetry: Arc::new(ServiceTelemetry::default()),
        }
    }

    async fn response_json(response: Response) -> Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    async fn send(
        state: &ServiceState,
        method: &str,
        uri: &str,
        body: Option<&Value>,
    ) -> (StatusCode, Value) {
        let builder = Request::builder().uri(uri).method(method);
        let request = match body {
            Some(value) => builder
                .header("content-type", "application/json")
                .body(axum::body::Body::from(value.to_string())),
            None => builder.body(axum::body::Body::empty()),
        }
        .unwrap_or_else(|err| panic!("failed to build request: {err}"));

        let response = match app(state.clone()).oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        };
        let status = response.status();
        (status, response_json(response).await)
    }

    fn error_code(value: &Value) -> Option<&str> {
        value.get("error").and_then(|error| error.get("code")).and_then(Value::as_str)
    }

    fn data_str<'a>(value: &'a Value, field: &str) -> &'a str {
        match value.get("data").and_then(|data| data.get(field)).and_then(Value::as_str) {
            Some(raw) => raw,
            None => panic!("missing data.{field} in {value:#}"),
        }
    }

    async fn seed_workspace_and_task(state: &ServiceState) -> (String, String) {
        let (status, workspace) =
            send(state, "POST", "/v1/workspaces", Some(&json!({"name": "Service"}))).await;
        assert_eq!(status, StatusCode::OK, "{workspace:#}");
        let workspace_id = data_str(&workspace, "workspace_id").to_string();

        let mut task = NewTask::draft(WorkspaceId::parse(&workspace_id).unwrap_or_else(|err| {
            panic!("workspace id did not parse: {err}")
        }), "Ship onboarding flow");
        task.effort_tag = Some(EffortTag::Medium);
        task.status = TaskStatus::Todo;
        let body = serde_json::to_value(&task)
            .unwrap_or_else(|err| panic!("failed to encode task: {err}"));
        let (status, created) = send(state, "POST", "/v1/tasks", Some(&body)).await;
        assert_eq!(status, StatusCode::OK, "{created:#}");
        (workspace_id, data_str(&created, "task_id").to_string())
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let state = test_state(migrated_api(Extractor::mock()), 2500);
        let (status, value) = send(&state, "GET", "/v1/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            value.get("service_contract_version").and_then(Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
        assert_eq!(
            value.get("api_contract_version").and_then(Value::as_str),
            Some(API_CONTRACT_VERSION)
        );
        assert_eq!(value["data"]["oracle"], json!("mock"));
    }

    #[tokio::test]
    async fn scan_apply_and_undo_flow_over_http() {
        let state = test_state(migrated_api(Extractor::mock()), 2500);
        let (workspace_id, task_id) = seed_workspace_and_task(&state).await;

        let (status, report) = send(
            &state,
            "POST",
            &format!("/v1/workspaces/{workspace_id}/scan"),
            Some(&json!({"as_of": "2026-02-07T12:00:00Z"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{report:#}");
        assert_eq!(report["data"]["counts"]["pending"], json!(1));

        let (status, pending) = send(
            &state,
            "GET",
            &format!("/v1/workspaces/{workspace_id}/suggestions/pending"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let suggestion_id = match pending["data"][0]["suggestion_id"].as_str() {
            Some(raw) => raw.to_string(),
            None => panic!("no pending suggestion: {pending:#}"),
        };

        let apply_uri = format!("/v1/suggestions/{suggestion_id}/apply");
        let (status, audit) = send(&state, "POST", &apply_uri, Some(&json!({}))).await;
        assert_eq!(status, StatusCode::OK, "{audit:#}");
        assert_eq!(audit["data"]["action_type"], json!("agent_set_focus_time"));
        assert_eq!(audit["data"]["after"]["suggested_focus_time"], json!(4));

        let (status, again) = send(&state, "POST", &apply_uri, Some(&json!({}))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(error_code(&again), Some("already_disposed"));

        let audit_id = data_str(&audit, "audit_id").to_string();
        let undo_uri = format!("/v1/audits/{audit_id}/undo");
        let (status, undo) = send(&state, "POST", &undo_uri, Some(&json!({}))).await;
        assert_eq!(status, StatusCode::OK, "{undo:#}");
        assert_eq!(undo["data"]["reverts_audit_id"], json!(audit_id));

        let (status, repeat) = send(&state, "POST", &undo_uri, Some(&json!({}))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(error_code(&repeat), Some("already_undone"));

        let (status, task) = send(&state, "GET", &format!("/v1/tasks/{task_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(task["data"]["suggested_focus_time"].is_null());

        let (status, audits) = send(
            &state,
            "GET",
            &format!("/v1/workspaces/{workspace_id}/audits?limit=1"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(audits["data"].as_array().map(Vec::len), Some(1));
        assert_eq!(audits["data"][0]["action_type"], json!("agent_undo"));

        let health = state.telemetry.snapshot();
        assert_eq!(health.conflict_total, 2);
    }

    #[tokio::test]
    async fn unknown_suggestion_maps_to_not_found() {
        let state = test_state(migrated_api(Extractor::mock()), 2500);
        let (status, value) = send(
            &state,
            "POST",
            &format!("/v1/suggestions/{}/apply", SuggestionId::new()),
            Some(&json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(error_code(&value), Some("suggestion_not_found"));
        assert_eq!(value["error"]["details"]["code"], json!("suggestion_not_found"));
    }

    #[tokio::test]
    async fn malformed_ids_and_json_are_rejected() {
        let state = test_state(migrated_api(Extractor::mock()), 2500);

        let (status, value) =
            send(&state, "POST", "/v1/suggestions/not-a-ulid/reject", Some(&json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error_code(&value), Some("validation_error"));

        let response = match app(state.clone())
            .oneshot(
                Request::builder()
                    .uri("/v1/workspaces")
                    .method("POST")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from("{\"name\":"))
                    .unwrap_or_else(|err| panic!("failed to build request: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        };
        assert!(response.status().is_client_error());
        let value = response_json(response).await;
        assert_eq!(error_code(&value), Some("invalid_json"));
        assert_eq!(state.telemetry.snapshot().invalid_json_total, 1);
    }

    #[tokio::test]
    async fn proposal_under_auto_policy_is_applied_immediately() {
        let state = test_state(migrated_api(Extractor::mock()), 2500);
        let (status, workspace) = send(
            &state,
            "POST",
            "/v1/workspaces",
            Some(&json!({
                "name": "Auto",
                "autonomy": {
                    "mode": "auto",
                    "auto_confidence_threshold": 0.7,
                    "allowed_auto_kinds": ["set_priority"]
                }
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{workspace:#}");
        let workspace_id = data_str(&workspace, "workspace_id").to_string();

        let parsed_workspace = WorkspaceId::parse(&workspace_id)
            .unwrap_or_else(|err| panic!("workspace id did not parse: {err}"));
        let body = serde_json::to_value(NewTask::draft(parsed_workspace, "Renew certificates"))
            .unwrap_or_else(|err| panic!("failed to encode task: {err}"));
        let (_, task) = send(&state, "POST", "/v1/tasks", Some(&body)).await;
        let task_id = data_str(&task, "task_id").to_string();

        let (status, outcome) = send(
            &state,
            "POST",
            "/v1/suggestions",
            Some(&json!({
                "workspace_id": workspace_id,
                "kind": "set_priority",
                "payload": {"task_id": task_id, "suggested_priority": 9},
                "confidence": 0.8
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{outcome:#}");
        assert_eq!(outcome["data"]["outcome"], json!("auto_applied"));
        assert!(outcome["data"]["audit"]["actor_id"].is_null());

        let (_, shown) = send(&state, "GET", &format!("/v1/tasks/{task_id}"), None).await;
        assert_eq!(shown["data"]["priority"], json!(9));

        let (status, bad_kind) = send(
            &state,
            "POST",
            "/v1/suggestions",
            Some(&json!({
                "workspace_id": workspace_id,
                "kind": "delete_task",
                "payload": {},
                "confidence": 0.8
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error_code(&bad_kind), Some("validation_error"));
    }

    #[tokio::test]
    async fn autonomy_endpoints_round_trip_and_validate() {
        let state = test_state(migrated_api(Extractor::mock()), 2500);
        let (workspace_id, _) = seed_workspace_and_task(&state).await;
        let uri = format!("/v1/workspaces/{workspace_id}/autonomy");

        let (status, current) = send(&state, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(current["data"]["mode"], json!("suggest"));

        let (status, updated) = send(
            &state,
            "PUT",
            &uri,
            Some(&json!({
                "mode": "off",
                "auto_confidence_threshold": 0.9,
                "allowed_auto_kinds": []
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{updated:#}");
        assert_eq!(updated["data"]["mode"], json!("off"));

        let (status, invalid) = send(
            &state,
            "PUT",
            &uri,
            Some(&json!({
                "mode": "auto",
                "auto_confidence_threshold": 1.5,
                "allowed_auto_kinds": []
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{invalid:#}");

        let (status, missing) = send(
            &state,
            "GET",
            &format!("/v1/workspaces/{}/autonomy", WorkspaceId::new()),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(error_code(&missing), Some("workspace_not_found"));
    }

    #[tokio::test]
    async fn extract_endpoint_reports_fallback_for_disabled_oracle() {
        let extractor = match (OracleConfig {
            mode: OracleMode::Disabled,
            ..OracleConfig::default()
        })
        .build()
        {
            Ok(oracle) => Extractor::new(oracle),
            Err(err) => panic!("failed to build disabled oracle: {err:#}"),
        };
        let state = test_state(migrated_api(extractor), 2500);

        let (status, value) = send(
            &state,
            "POST",
            "/v1/extract/tasks",
            Some(&json!({"input": "Fix login.\nUpdate the docs."})),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{value:#}");
        assert_eq!(value["data"]["outcome"], json!("fallback"));
        assert_eq!(value["data"]["reason"]["reason"], json!("oracle_unavailable"));

        let (status, unknown) =
            send(&state, "POST", "/v1/extract/sprints", Some(&json!({"input": "x"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error_code(&unknown), Some("validation_error"));
    }

    #[tokio::test]
    async fn run_blocking_times_out_with_default_code() {
        let state = test_state(migrated_api(Extractor::mock()), 1);
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        let result = state
            .run_blocking(
                StatusCode::SERVICE_UNAVAILABLE,
                "scan_failed",
                "slow_operation",
                move |_api| {
                    std::thread::sleep(Duration::from_millis(25));
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                },
            )
            .await;
        let Err(failure) = result else {
            panic!("expected a timeout failure");
        };
        assert_eq!(failure.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(failure.code, "scan_failed");
        assert!(failure.message.contains("timed out"));
        assert!(failure.message.contains("may still commit"));
        assert_eq!(
            failure.details.as_ref().map(|details| &details["may_still_commit"]),
            Some(&json!(true))
        );
        assert_eq!(state.telemetry.snapshot().timeout_total, 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(finished.load(Ordering::SeqCst));
    }
}
