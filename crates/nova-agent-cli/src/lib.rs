//! Embeddable command surface for the Nova suggestion/audit engine.
//!
//! Hosts embed the CLI through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_agent_with_db`] for direct [`AgentCommand`] execution against a DB path.
//! - [`run_agent`] for execution against an existing [`SqliteAgentStore`].
//!
//! Every command prints one pretty JSON document to stdout. Refused
//! operations exit non-zero with `<code>: <message>` on stderr.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use nova_agent_core::{
    now_utc, parse_due_date, parse_rfc3339_utc, AuditId, AutonomyConfig, AutonomyMode, EffortTag,
    NewMeeting, NewSuggestion, NewTask, OperationResult, Proposal, SuggestionId, TaskId,
    TaskStatus, TaskUpdate, UserId, WorkspaceId, DEFAULT_AUTO_CONFIDENCE_THRESHOLD,
};
use nova_agent_extract::{
    ExtractionKind, Extractor, OracleConfig, OracleMode, DEFAULT_ORACLE_TIMEOUT_MS,
};
use nova_agent_store_sqlite::SqliteAgentStore;
use serde::Serialize;
use time::OffsetDateTime;
use tracing::debug;

#[derive(Debug, Parser)]
#[command(name = "nova")]
#[command(about = "Nova agent suggestion and audit CLI")]
pub struct Cli {
    #[arg(long, env = "NOVA_DB", default_value = "./nova.sqlite3")]
    db: PathBuf,

    #[command(flatten)]
    runtime: RuntimeArgs,

    #[command(subcommand)]
    command: AgentCommand,
}

/// Oracle selection and workspace defaults shared by every command.
#[derive(Debug, Clone, Args)]
pub struct RuntimeArgs {
    #[arg(long = "oracle", env = "NOVA_ORACLE", value_enum, default_value_t = OracleModeArg::Mock)]
    oracle_mode: OracleModeArg,
    #[arg(long, env = "NOVA_ORACLE_URL")]
    oracle_url: Option<String>,
    #[arg(long, default_value_t = DEFAULT_ORACLE_TIMEOUT_MS)]
    oracle_timeout_ms: u64,
    /// Name of the environment variable holding the oracle bearer token.
    #[arg(long)]
    oracle_auth_env: Option<String>,
    #[arg(long, env = "NOVA_AUTO_CONFIDENCE", default_value_t = DEFAULT_AUTO_CONFIDENCE_THRESHOLD)]
    default_auto_confidence: f32,
}

impl Default for RuntimeArgs {
    fn default() -> Self {
        Self {
            oracle_mode: OracleModeArg::Mock,
            oracle_url: None,
            oracle_timeout_ms: DEFAULT_ORACLE_TIMEOUT_MS,
            oracle_auth_env: None,
            default_auto_confidence: DEFAULT_AUTO_CONFIDENCE_THRESHOLD,
        }
    }
}

impl RuntimeArgs {
    #[must_use]
    pub fn oracle_config(&self) -> OracleConfig {
        OracleConfig {
            mode: match self.oracle_mode {
                OracleModeArg::Mock => OracleMode::Mock,
                OracleModeArg::Http => OracleMode::Http,
                OracleModeArg::Disabled => OracleMode::Disabled,
            },
            url: self.oracle_url.clone(),
            timeout_ms: self.oracle_timeout_ms,
            auth_bearer_env: self.oracle_auth_env.clone(),
        }
    }

    /// # Errors
    /// Returns an error when the oracle configuration is invalid.
    pub fn extractor(&self) -> Result<Extractor> {
        Ok(Extractor::new(self.oracle_config().build()?))
    }
}

#[derive(Debug, Subcommand)]
pub enum AgentCommand {
    Workspace {
        #[command(subcommand)]
        command: WorkspaceCommand,
    },
    User {
        #[command(subcommand)]
        command: UserCommand,
    },
    Task {
        #[command(subcommand)]
        command: Box<TaskCommand>,
    },
    Suggestion {
        #[command(subcommand)]
        command: SuggestionCommand,
    },
    Audit {
        #[command(subcommand)]
        command: AuditCommand,
    },
    Autonomy {
        #[command(subcommand)]
        command: AutonomyCommand,
    },
    Engine {
        #[command(subcommand)]
        command: EngineCommand,
    },
    Meeting {
        #[command(subcommand)]
        command: MeetingCommand,
    },
    /// Runs one structured extraction without touching the database.
    Extract(ExtractArgs),
}

#[derive(Debug, Subcommand)]
pub enum WorkspaceCommand {
    Create(WorkspaceCreateArgs),
    Show {
        #[arg(long)]
        workspace_id: WorkspaceId,
    },
}

#[derive(Debug, Args)]
pub struct WorkspaceCreateArgs {
    #[arg(long)]
    name: String,
    #[arg(long, value_enum, default_value_t = AutonomyModeArg::Suggest)]
    mode: AutonomyModeArg,
    /// Suggestion kind allowed to auto-apply; repeatable.
    #[arg(long = "allow-kind")]
    allowed_kinds: Vec<String>,
    /// Defaults to `--default-auto-confidence`.
    #[arg(long)]
    threshold: Option<f32>,
}

#[derive(Debug, Subcommand)]
pub enum UserCommand {
    Add {
        #[arg(long)]
        username: String,
        #[arg(long)]
        display_name: String,
        #[arg(long, default_value = "dev")]
        role: String,
    },
    List,
}

#[derive(Debug, Subcommand)]
pub enum TaskCommand {
    Add(TaskAddArgs),
    List {
        #[arg(long)]
        workspace_id: WorkspaceId,
    },
    Show {
        #[arg(long)]
        task_id: TaskId,
    },
    Update(TaskUpdateArgs),
}

#[derive(Debug, Args)]
pub struct TaskAddArgs {
    #[arg(long)]
    workspace_id: WorkspaceId,
    #[arg(long)]
    title: String,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    assignee_id: Option<UserId>,
    #[arg(long, value_enum, default_value_t = TaskStatusArg::Todo)]
    status: TaskStatusArg,
    /// `YYYY-MM-DD` or RFC3339 UTC.
    #[arg(long)]
    due: Option<String>,
    #[arg(long)]
    priority: Option<u8>,
    #[arg(long, value_enum)]
    effort: Option<EffortArg>,
    #[arg(long)]
    story_points: Option<u32>,
    #[arg(long, default_value_t = 0)]
    progress: u8,
}

#[derive(Debug, Args)]
pub struct TaskUpdateArgs {
    #[arg(long)]
    task_id: TaskId,
    #[arg(long, value_enum)]
    status: Option<TaskStatusArg>,
    #[arg(long)]
    progress: Option<u8>,
    #[arg(long)]
    priority: Option<u8>,
    #[arg(long)]
    assignee_id: Option<UserId>,
    #[arg(long)]
    story_points: Option<u32>,
    #[arg(long, value_enum)]
    effort: Option<EffortArg>,
    #[arg(long)]
    due: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum SuggestionCommand {
    /// Stages a suggestion under the workspace autonomy policy.
    Create(SuggestionCreateArgs),
    Pending {
        #[arg(long)]
        workspace_id: WorkspaceId,
    },
    Show {
        #[arg(long)]
        suggestion_id: SuggestionId,
    },
    Apply(DisposeArgs),
    Reject(DisposeArgs),
}

#[derive(Debug, Args)]
pub struct SuggestionCreateArgs {
    #[arg(long)]
    workspace_id: WorkspaceId,
    #[arg(long)]
    kind: String,
    #[arg(long, default_value = "{}")]
    payload_json: String,
    #[arg(long)]
    confidence: f32,
}

#[derive(Debug, Args)]
pub struct DisposeArgs {
    #[arg(long)]
    suggestion_id: SuggestionId,
    /// Omit for a system action.
    #[arg(long)]
    actor_id: Option<UserId>,
}

#[derive(Debug, Subcommand)]
pub enum AuditCommand {
    List {
        #[arg(long)]
        workspace_id: WorkspaceId,
        #[arg(long)]
        limit: Option<usize>,
    },
    Show {
        #[arg(long)]
        audit_id: AuditId,
    },
    Undo {
        #[arg(long)]
        audit_id: AuditId,
        #[arg(long)]
        actor_id: Option<UserId>,
    },
}

#[derive(Debug, Subcommand)]
pub enum AutonomyCommand {
    Show {
        #[arg(long)]
        workspace_id: WorkspaceId,
    },
    Set(AutonomySetArgs),
}

#[derive(Debug, Args)]
pub struct AutonomySetArgs {
    #[arg(long)]
    workspace_id: WorkspaceId,
    #[arg(long)]
    mode: String,
    #[arg(long = "allow-kind")]
    allowed_kinds: Vec<String>,
    #[arg(long)]
    threshold: Option<f32>,
}

#[derive(Debug, Subcommand)]
pub enum EngineCommand {
    Scan {
        #[arg(long)]
        workspace_id: WorkspaceId,
        /// Evaluation time, RFC3339 UTC. Defaults to now.
        #[arg(long)]
        as_of: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
pub enum MeetingCommand {
    Process(MeetingProcessArgs),
    AutoMap(MeetingAutoMapArgs),
}

#[derive(Debug, Args)]
pub struct MeetingProcessArgs {
    #[arg(long)]
    workspace_id: WorkspaceId,
    #[arg(long)]
    title: String,
    #[arg(long)]
    meeting_date: Option<String>,
    #[command(flatten)]
    transcript: TranscriptArgs,
}

#[derive(Debug, Args)]
pub struct MeetingAutoMapArgs {
    #[arg(long)]
    workspace_id: WorkspaceId,
    #[arg(long)]
    as_of: Option<String>,
    #[command(flatten)]
    transcript: TranscriptArgs,
}

#[derive(Debug, Args)]
#[group(required = true, multiple = false)]
pub struct TranscriptArgs {
    #[arg(long)]
    transcript: Option<String>,
    #[arg(long)]
    transcript_file: Option<PathBuf>,
}

impl TranscriptArgs {
    fn read(&self) -> Result<String> {
        match (&self.transcript, &self.transcript_file) {
            (Some(text), _) => Ok(text.clone()),
            (None, Some(path)) => std::fs::read_to_string(path)
                .with_context(|| format!("failed to read transcript {}", path.display())),
            (None, None) => Err(anyhow!("--transcript or --transcript-file is required")),
        }
    }
}

#[derive(Debug, Args)]
pub struct ExtractArgs {
    /// tasks | dependencies | estimate | assistant
    kind: String,
    #[arg(long)]
    input: String,
    /// Extra context for the assistant kind.
    #[arg(long, default_value = "")]
    context: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OracleModeArg {
    Mock,
    Http,
    Disabled,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum AutonomyModeArg {
    Off,
    Suggest,
    Auto,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum TaskStatusArg {
    Todo,
    InProgress,
    Qa,
    Done,
    Released,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum EffortArg {
    Small,
    Medium,
    Large,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when store open/migrate fails, the command is invalid,
/// or the requested operation is refused.
pub fn run_cli(cli: Cli) -> Result<()> {
    match cli.command {
        AgentCommand::Extract(args) => run_extract(&args, &cli.runtime),
        command => {
            debug!(db = %cli.db.display(), "opening agent store");
            let mut store = SqliteAgentStore::open(&cli.db)?;
            store.migrate()?;
            run_agent(command, &mut store, &cli.runtime)
        }
    }
}

/// Executes a parsed command using the provided `SQLite` DB path.
///
/// # Errors
/// Returns an error when store open/migrate fails or the requested command fails.
pub fn run_agent_with_db(db_path: &Path, command: AgentCommand, runtime: &RuntimeArgs) -> Result<()> {
    match command {
        AgentCommand::Extract(args) => run_extract(&args, runtime),
        command => {
            let mut store = SqliteAgentStore::open(db_path)?;
            store.migrate()?;
            run_agent(command, &mut store, runtime)
        }
    }
}

/// Executes a parsed command against an existing store handle.
///
/// # Errors
/// Returns an error when validation or persistence fails, or when an
/// apply/reject/undo request is refused.
pub fn run_agent(
    command: AgentCommand,
    store: &mut SqliteAgentStore,
    runtime: &RuntimeArgs,
) -> Result<()> {
    match command {
        AgentCommand::Workspace { command } => run_workspace(command, store, runtime),
        AgentCommand::User { command } => run_user(command, store),
        AgentCommand::Task { command } => run_task(*command, store),
        AgentCommand::Suggestion { command } => run_suggestion(command, store),
        AgentCommand::Audit { command } => run_audit(command, store),
        AgentCommand::Autonomy { command } => run_autonomy(command, store, runtime),
        AgentCommand::Engine { command } => run_engine(command, store),
        AgentCommand::Meeting { command } => run_meeting(command, store, runtime),
        AgentCommand::Extract(args) => run_extract(&args, runtime),
    }
}

fn run_workspace(
    command: WorkspaceCommand,
    store: &SqliteAgentStore,
    runtime: &RuntimeArgs,
) -> Result<()> {
    match command {
        WorkspaceCommand::Create(args) => {
            let mode = map_autonomy_mode(args.mode);
            let autonomy = autonomy_from_args(
                mode.as_str(),
                &args.allowed_kinds,
                args.threshold.unwrap_or(runtime.default_auto_confidence),
            )?;
            let workspace = store.create_workspace(&args.name, &autonomy)?;
            print_json(&workspace)
        }
        WorkspaceCommand::Show { workspace_id } => {
            let workspace = store
                .get_workspace(workspace_id)?
                .ok_or_else(|| anyhow!("workspace {workspace_id} not found"))?;
            print_json(&workspace)
        }
    }
}

fn run_user(command: UserCommand, store: &SqliteAgentStore) -> Result<()> {
    match command {
        UserCommand::Add {
            username,
            display_name,
            role,
        } => print_json(&store.add_user(&username, &display_name, &role)?),
        UserCommand::List => print_json(&store.list_users()?),
    }
}

fn run_task(command: TaskCommand, store: &SqliteAgentStore) -> Result<()> {
    match command {
        TaskCommand::Add(args) => {
            let mut input = NewTask::draft(args.workspace_id, args.title);
            input.description = args.description;
            input.assignee_id = args.assignee_id;
            input.status = map_task_status(args.status);
            input.due_date = parse_optional_due(args.due.as_deref())?;
            input.priority = args.priority;
            input.effort_tag = args.effort.map(map_effort);
            input.story_points = args.story_points;
            input.progress = args.progress;
            print_json(&store.create_task(&input)?)
        }
        TaskCommand::List { workspace_id } => print_json(&store.list_tasks(workspace_id)?),
        TaskCommand::Show { task_id } => {
            let task = store
                .get_task(task_id)?
                .ok_or_else(|| anyhow!("task {task_id} not found"))?;
            print_json(&task)
        }
        TaskCommand::Update(args) => {
            let update = TaskUpdate {
                status: args.status.map(map_task_status),
                progress: args.progress,
                priority: args.priority,
                assignee_id: args.assignee_id,
                story_points: args.story_points,
                effort_tag: args.effort.map(map_effort),
                due_date: parse_optional_due(args.due.as_deref())?,
            };
            let task = store
                .update_task(args.task_id, &update)?
                .ok_or_else(|| anyhow!("task {} not found", args.task_id))?;
            print_json(&task)
        }
    }
}

fn run_suggestion(command: SuggestionCommand, store: &mut SqliteAgentStore) -> Result<()> {
    match command {
        SuggestionCommand::Create(args) => {
            let payload = parse_payload_json(&args.payload_json)?;
            let input =
                NewSuggestion::from_untyped(args.workspace_id, &args.kind, &payload, args.confidence)
                    .map_err(|err| anyhow!(err.to_string()))?;
            let outcome = store.propose(
                args.workspace_id,
                Proposal {
                    payload: input.payload,
                    confidence: input.confidence,
                },
            )?;
            print_json(&outcome)
        }
        SuggestionCommand::Pending { workspace_id } => {
            print_json(&store.list_pending(workspace_id)?)
        }
        SuggestionCommand::Show { suggestion_id } => {
            let suggestion = store
                .get_suggestion(suggestion_id)?
                .ok_or_else(|| anyhow!("suggestion {suggestion_id} not found"))?;
            print_json(&suggestion)
        }
        SuggestionCommand::Apply(args) => {
            let audit = require_success(store.apply_suggestion(args.suggestion_id, args.actor_id)?)?;
            print_json(&audit)
        }
        SuggestionCommand::Reject(args) => {
            let audit =
                require_success(store.reject_suggestion(args.suggestion_id, args.actor_id)?)?;
            print_json(&audit)
        }
    }
}

fn run_audit(command: AuditCommand, store: &mut SqliteAgentStore) -> Result<()> {
    match command {
        AuditCommand::List {
            workspace_id,
            limit,
        } => print_json(&store.list_audits(workspace_id, limit)?),
        AuditCommand::Show { audit_id } => {
            let audit = store
                .get_audit(audit_id)?
                .ok_or_else(|| anyhow!("audit {audit_id} not found"))?;
            print_json(&audit)
        }
        AuditCommand::Undo { audit_id, actor_id } => {
            let audit = require_success(store.undo_audit(audit_id, actor_id)?)?;
            print_json(&audit)
        }
    }
}

fn run_autonomy(
    command: AutonomyCommand,
    store: &SqliteAgentStore,
    runtime: &RuntimeArgs,
) -> Result<()> {
    match command {
        AutonomyCommand::Show { workspace_id } => {
            let config = store
                .get_autonomy_config(workspace_id)?
                .ok_or_else(|| anyhow!("workspace {workspace_id} not found"))?;
            print_json(&config)
        }
        AutonomyCommand::Set(args) => {
            let config = autonomy_from_args(
                &args.mode,
                &args.allowed_kinds,
                args.threshold.unwrap_or(runtime.default_auto_confidence),
            )?;
            let updated = store
                .set_autonomy_config(args.workspace_id, &config)?
                .ok_or_else(|| anyhow!("workspace {} not found", args.workspace_id))?;
            print_json(&updated)
        }
    }
}

fn run_engine(command: EngineCommand, store: &mut SqliteAgentStore) -> Result<()> {
    match command {
        EngineCommand::Scan {
            workspace_id,
            as_of,
        } => {
            let now = parse_optional_utc(as_of.as_deref())?;
            print_json(&store.scan(workspace_id, now)?)
        }
    }
}

fn run_meeting(
    command: MeetingCommand,
    store: &mut SqliteAgentStore,
    runtime: &RuntimeArgs,
) -> Result<()> {
    match command {
        MeetingCommand::Process(args) => {
            let extractor = runtime.extractor()?;
            let meeting_date = match args.meeting_date.as_deref() {
                Some(raw) => Some(parse_due_date(raw).map_err(|err| anyhow!(err.to_string()))?),
                None => None,
            };
            let input = NewMeeting {
                workspace_id: args.workspace_id,
                title: args.title,
                meeting_date,
                transcript: args.transcript.read()?,
            };
            print_json(&store.ingest_meeting(&extractor, &input)?)
        }
        MeetingCommand::AutoMap(args) => {
            let now = parse_optional_utc(args.as_of.as_deref())?;
            let transcript = args.transcript.read()?;
            print_json(&store.auto_map_meeting(args.workspace_id, &transcript, now)?)
        }
    }
}

fn run_extract(args: &ExtractArgs, runtime: &RuntimeArgs) -> Result<()> {
    let kind = ExtractionKind::parse(&args.kind).ok_or_else(|| {
        anyhow!(
            "unknown extraction kind: {} (expected tasks, dependencies, estimate or assistant)",
            args.kind
        )
    })?;
    let extractor = runtime.extractor()?;
    print_json(&extractor.extract(kind, &args.input, &args.context))
}

fn autonomy_from_args(mode: &str, allowed_kinds: &[String], threshold: f32) -> Result<AutonomyConfig> {
    let config = if allowed_kinds.is_empty() {
        let mode = AutonomyMode::parse(mode).ok_or_else(|| anyhow!("invalid autonomy mode: {mode}"))?;
        AutonomyConfig {
            mode,
            auto_confidence_threshold: threshold,
            ..AutonomyConfig::default()
        }
    } else {
        AutonomyConfig::from_parts(mode, allowed_kinds.iter().map(String::as_str), threshold)
            .map_err(|err| anyhow!(err.to_string()))?
    };
    config.validate().map_err(|err| anyhow!(err.to_string()))?;
    Ok(config)
}

fn require_success<T>(result: OperationResult<T>) -> Result<T> {
    result.map_err(|failure| anyhow!("{}: {failure}", failure.code()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_payload_json(raw: &str) -> Result<serde_json::Value> {
    serde_json::from_str(raw).with_context(|| format!("payload_json must be valid JSON: {raw}"))
}

fn parse_optional_utc(raw: Option<&str>) -> Result<OffsetDateTime> {
    match raw {
        Some(value) => parse_rfc3339_utc(value).map_err(|err| anyhow!("invalid timestamp: {err}")),
        None => Ok(now_utc()),
    }
}

fn parse_optional_due(raw: Option<&str>) -> Result<Option<OffsetDateTime>> {
    raw.map(|value| parse_due_date(value).map_err(|err| anyhow!("invalid due date: {err}")))
        .transpose()
}

fn map_autonomy_mode(value: AutonomyModeArg) -> AutonomyMode {
    match value {
        AutonomyModeArg::Off => AutonomyMode::Off,
        AutonomyModeArg::Suggest => AutonomyMode::Suggest,
        AutonomyModeArg::Auto => AutonomyMode::Auto,
    }
}

fn map_task_status(value: TaskStatusArg) -> TaskStatus {
    match value {
        TaskStatusArg::Todo => TaskStatus::Todo,
        TaskStatusArg::InProgress => TaskStatus::InProgress,
        TaskStatusArg::Qa => TaskStatus::Qa,
        TaskStatusArg::Done => TaskStatus::Done,
        TaskStatusArg::Released => TaskStatus::Released,
    }
}

fn map_effort(value: EffortArg) -> EffortTag {
    match value {
        EffortArg::Small => EffortTag::Small,
        EffortArg::Medium => EffortTag::Medium,
        EffortArg::Large => EffortTag::Large,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines)]

    use super::*;
    use nova_agent_core::SuggestionKind;
    use serde_json::json;
    use ulid::Ulid;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn execute_cli(args: &[&str]) -> Result<()> {
        let cli = Cli::try_parse_from(args)?;
        run_cli(cli)
    }

    #[test]
    fn parse_payload_accepts_valid_json() {
        let value = must(parse_payload_json(r#"{"task_id":"01J0SQQP7M70P6Y3R4T8D8G8M2"}"#));
        assert_eq!(value["task_id"], json!("01J0SQQP7M70P6Y3R4T8D8G8M2"));
        assert!(parse_payload_json("{").is_err());
    }

    #[test]
    fn parse_optional_utc_rejects_non_utc() {
        assert!(parse_optional_utc(Some("2026-02-07T12:00:00+02:00")).is_err());
        assert!(parse_optional_utc(Some("2026-02-07T12:00:00Z")).is_ok());
    }

    #[test]
    fn autonomy_args_keep_default_kinds_unless_overridden() {
        let config = must(autonomy_from_args("auto", &[], 0.9));
        assert_eq!(config.mode, AutonomyMode::Auto);
        assert!(config.allowed_auto_kinds.contains(&SuggestionKind::SetFocusTime));

        let custom = must(autonomy_from_args(
            "auto",
            &["set_priority".to_string(), "flag_risk".to_string()],
            0.8,
        ));
        assert_eq!(custom.allowed_auto_kinds.len(), 2);
        assert!(!custom.allowed_auto_kinds.contains(&SuggestionKind::SetFocusTime));

        assert!(autonomy_from_args("yolo", &[], 0.8).is_err());
        assert!(autonomy_from_args("auto", &["delete_task".to_string()], 0.8).is_err());
        assert!(autonomy_from_args("auto", &[], 1.5).is_err());
    }

    #[test]
    fn refused_operations_surface_failure_code() {
        let failure = require_success::<()>(Err(
            nova_agent_core::OperationFailure::AlreadyDisposed {
                suggestion_id: SuggestionId::new(),
            },
        ));
        match failure {
            Ok(()) => panic!("expected an error"),
            Err(err) => assert!(err.to_string().starts_with("already_disposed: ")),
        }
    }

    #[test]
    fn embed_api_runs_against_existing_store() {
        let db_path = std::env::temp_dir().join(format!("nova-cli-embed-{}.sqlite3", Ulid::new()));
        let runtime = RuntimeArgs::default();

        let mut store = must(SqliteAgentStore::open(&db_path));
        must(store.migrate());
        let workspace = must(store.create_workspace("Embed", &AutonomyConfig::default()));

        must(run_agent(
            AgentCommand::Engine {
                command: EngineCommand::Scan {
                    workspace_id: workspace.workspace_id,
                    as_of: Some("2026-02-07T12:00:00Z".to_string()),
                },
            },
            &mut store,
            &runtime,
        ));
        drop(store);

        must(run_agent_with_db(
            &db_path,
            AgentCommand::Autonomy {
                command: AutonomyCommand::Show {
                    workspace_id: workspace.workspace_id,
                },
            },
            &runtime,
        ));

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn cli_end_to_end_workspace_task_scan_apply_and_undo() {
        let db_path = std::env::temp_dir().join(format!("nova-cli-e2e-{}.sqlite3", Ulid::new()));
        let db = db_path.to_string_lossy().to_string();

        let mut store = must(SqliteAgentStore::open(&db_path));
        must(store.migrate());
        let workspace = must(store.create_workspace("E2E", &AutonomyConfig::default()));
        let workspace_id = workspace.workspace_id.to_string();
        drop(store);

        must(execute_cli(&[
            "nova",
            "--db",
            &db,
            "task",
            "add",
            "--workspace-id",
            &workspace_id,
            "--title",
            "Profile cold start",
            "--effort",
            "medium",
        ]));
        must(execute_cli(&[
            "nova", "--db", &db, "engine", "scan", "--workspace-id", &workspace_id,
        ]));

        let mut store = must(SqliteAgentStore::open(&db_path));
        let pending = must(store.list_pending(workspace.workspace_id));
        assert_eq!(pending.len(), 1);
        let suggestion_id = pending[0].suggestion_id.to_string();
        drop(store);

        must(execute_cli(&[
            "nova",
            "--db",
            &db,
            "suggestion",
            "apply",
            "--suggestion-id",
            &suggestion_id,
        ]));
        assert!(execute_cli(&[
            "nova",
            "--db",
            &db,
            "suggestion",
            "apply",
            "--suggestion-id",
            &suggestion_id,
        ])
        .is_err());

        store = must(SqliteAgentStore::open(&db_path));
        let audits = must(store.list_audits(workspace.workspace_id, None));
        assert_eq!(audits.len(), 1);
        let audit_id = audits[0].audit_id.to_string();
        drop(store);

        must(execute_cli(&[
            "nova", "--db", &db, "audit", "undo", "--audit-id", &audit_id,
        ]));

        let store = must(SqliteAgentStore::open(&db_path));
        let tasks = must(store.list_tasks(workspace.workspace_id));
        assert_eq!(tasks[0].suggested_focus_time, None);
        assert_eq!(must(store.list_audits(workspace.workspace_id, None)).len(), 2);
        drop(store);

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn extract_rejects_unknown_kind() {
        let args = ExtractArgs {
            kind: "sprints".to_string(),
            input: "anything".to_string(),
            context: String::new(),
        };
        assert!(run_extract(&args, &RuntimeArgs::default()).is_err());
    }
}
