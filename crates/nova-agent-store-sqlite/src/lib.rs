#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

//! SQLite persistence for the Nova suggestion/audit engine.
//!
//! Besides plain storage this crate owns every state transition that must be
//! atomic: application, rejection and undo (see `ledger`) and the engine
//! entry points that create suggestions (see `engine`).

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use nova_agent_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, AgentError, AutonomyConfig, AutonomyMode,
    EffortTag, Meeting, MeetingId, NewMeeting, NewTask, SuggestionKind, Task, TaskId, TaskStatus,
    TaskUpdate, User, UserId, Workspace, WorkspaceId,
};
use rusqlite::{params, Connection, OptionalExtension};
use time::OffsetDateTime;
use ulid::Ulid;

mod engine;
mod ledger;
mod suggestions;

pub use engine::{
    AutoMapReport, DetectorSummary, MeetingReport, ProposalCounts, ProposalOutcome, ScanReport,
};
pub use ledger::DEFAULT_AUDIT_LIMIT;

const AGENT_MIGRATION_VERSION: i64 = 1;

const SCHEMA_AGENT_V1: &str = r"
CREATE TABLE IF NOT EXISTS workspaces (
  workspace_id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  autonomy_mode TEXT NOT NULL CHECK (autonomy_mode IN ('off', 'suggest', 'auto')),
  auto_confidence_threshold REAL NOT NULL CHECK (auto_confidence_threshold BETWEEN 0.0 AND 1.0),
  allowed_auto_kinds_json TEXT NOT NULL DEFAULT '[]',
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS users (
  user_id TEXT PRIMARY KEY,
  username TEXT NOT NULL UNIQUE,
  display_name TEXT NOT NULL,
  role TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tasks (
  task_id TEXT PRIMARY KEY,
  workspace_id TEXT NOT NULL,
  title TEXT NOT NULL,
  description TEXT,
  assignee_id TEXT,
  status TEXT NOT NULL CHECK (status IN ('todo', 'in_progress', 'qa', 'done', 'released')),
  due_date TEXT,
  priority INTEGER CHECK (priority BETWEEN 1 AND 10 OR priority IS NULL),
  effort_tag TEXT CHECK (effort_tag IN ('small', 'medium', 'large') OR effort_tag IS NULL),
  story_points INTEGER CHECK (story_points >= 0 OR story_points IS NULL),
  progress INTEGER NOT NULL DEFAULT 0 CHECK (progress BETWEEN 0 AND 100),
  suggested_focus_time INTEGER CHECK (suggested_focus_time > 0 OR suggested_focus_time IS NULL),
  is_potential_risk INTEGER NOT NULL DEFAULT 0 CHECK (is_potential_risk IN (0, 1)),
  risk_reason TEXT,
  needs_priority_review INTEGER NOT NULL DEFAULT 0 CHECK (needs_priority_review IN (0, 1)),
  is_blocked INTEGER NOT NULL DEFAULT 0 CHECK (is_blocked IN (0, 1)),
  blocker_reason TEXT,
  parent_task_id TEXT,
  confidence REAL CHECK (confidence BETWEEN 0.0 AND 1.0 OR confidence IS NULL),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  FOREIGN KEY (workspace_id) REFERENCES workspaces(workspace_id),
  FOREIGN KEY (assignee_id) REFERENCES users(user_id),
  FOREIGN KEY (parent_task_id) REFERENCES tasks(task_id)
);

CREATE INDEX IF NOT EXISTS idx_tasks_workspace_status
  ON tasks(workspace_id, status);

CREATE TABLE IF NOT EXISTS meetings (
  meeting_id TEXT PRIMARY KEY,
  workspace_id TEXT NOT NULL,
  title TEXT NOT NULL,
  meeting_date TEXT,
  transcript TEXT NOT NULL,
  created_at TEXT NOT NULL,
  FOREIGN KEY (workspace_id) REFERENCES workspaces(workspace_id)
);

CREATE TABLE IF NOT EXISTS agent_suggestions (
  suggestion_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  suggestion_id TEXT NOT NULL UNIQUE,
  workspace_id TEXT NOT NULL,
  kind TEXT NOT NULL CHECK (
    kind IN (
      'create_task',
      'set_focus_time',
      'flag_risk',
      'set_priority',
      'split_task',
      'rebalance_task',
      'add_dependency',
      'optimize_assignment',
      'auto_mapped_task'
    )
  ),
  target_task_id TEXT,
  payload_json TEXT NOT NULL,
  confidence REAL NOT NULL CHECK (confidence BETWEEN 0.0 AND 1.0),
  applied INTEGER NOT NULL DEFAULT 0 CHECK (applied IN (0, 1)),
  created_at TEXT NOT NULL,
  FOREIGN KEY (workspace_id) REFERENCES workspaces(workspace_id)
);

CREATE TRIGGER IF NOT EXISTS trg_agent_suggestions_applied_immutable
BEFORE UPDATE ON agent_suggestions
WHEN OLD.applied = 1
BEGIN
  SELECT RAISE(FAIL, 'agent_suggestions rows are immutable once applied');
END;

CREATE TRIGGER IF NOT EXISTS trg_agent_suggestions_no_delete
BEFORE DELETE ON agent_suggestions
BEGIN
  SELECT RAISE(FAIL, 'agent_suggestions rows are never deleted');
END;

CREATE INDEX IF NOT EXISTS idx_agent_suggestions_pending
  ON agent_suggestions(workspace_id, applied, suggestion_seq);
CREATE INDEX IF NOT EXISTS idx_agent_suggestions_target
  ON agent_suggestions(workspace_id, kind, target_task_id, applied);

CREATE TABLE IF NOT EXISTS agent_audits (
  audit_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  audit_id TEXT NOT NULL UNIQUE,
  workspace_id TEXT NOT NULL,
  actor_id TEXT,
  action_type TEXT NOT NULL,
  target_type TEXT NOT NULL CHECK (target_type IN ('task', 'suggestion')),
  target_id TEXT NOT NULL,
  before_json TEXT,
  after_json TEXT,
  suggestion_id TEXT,
  reverts_audit_id TEXT UNIQUE,
  created_at TEXT NOT NULL,
  FOREIGN KEY (workspace_id) REFERENCES workspaces(workspace_id),
  FOREIGN KEY (suggestion_id) REFERENCES agent_suggestions(suggestion_id),
  FOREIGN KEY (reverts_audit_id) REFERENCES agent_audits(audit_id)
);

CREATE TRIGGER IF NOT EXISTS trg_agent_audits_no_update
BEFORE UPDATE ON agent_audits
BEGIN
  SELECT RAISE(FAIL, 'agent_audits is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_agent_audits_no_delete
BEFORE DELETE ON agent_audits
BEGIN
  SELECT RAISE(FAIL, 'agent_audits is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_agent_audits_workspace_seq
  ON agent_audits(workspace_id, audit_seq);
";

const TASK_COLUMNS: &str = "task_id, workspace_id, title, description, assignee_id, status,
    due_date, priority, effort_tag, story_points, progress, suggested_focus_time,
    is_potential_risk, risk_reason, needs_priority_review, is_blocked, blocker_reason,
    parent_task_id, confidence, created_at, updated_at";

pub struct SqliteAgentStore {
    conn: Connection,
}

impl SqliteAgentStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_AGENT_V1)
            .context("failed to apply agent schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![AGENT_MIGRATION_VERSION, now],
            )
            .context("failed to register agent schema migration")?;

        Ok(())
    }

    pub fn create_workspace(&self, name: &str, autonomy: &AutonomyConfig) -> Result<Workspace> {
        if name.trim().is_empty() {
            return Err(anyhow!("workspace name MUST be provided"));
        }
        autonomy
            .validate()
            .map_err(|err| anyhow!("invalid autonomy configuration: {err}"))?;

        let workspace = Workspace {
            workspace_id: WorkspaceId::new(),
            name: name.trim().to_string(),
            autonomy: autonomy.clone(),
            created_at: now_utc(),
        };

        self.conn
            .execute(
                "INSERT INTO workspaces(
                    workspace_id, name, autonomy_mode, auto_confidence_threshold,
                    allowed_auto_kinds_json, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    workspace.workspace_id.to_string(),
                    workspace.name,
                    autonomy.mode.as_str(),
                    autonomy.auto_confidence_threshold,
                    allowed_kinds_json(autonomy)?,
                    to_rfc3339(workspace.created_at)?,
                ],
            )
            .context("failed to insert workspace")?;

        tracing::info!(workspace_id = %workspace.workspace_id, "workspace created");
        Ok(workspace)
    }

    pub fn get_workspace(&self, workspace_id: WorkspaceId) -> Result<Option<Workspace>> {
        load_workspace(&self.conn, workspace_id)
    }

    pub fn add_user(&self, username: &str, display_name: &str, role: &str) -> Result<User> {
        if username.trim().is_empty() {
            return Err(anyhow!("username MUST be provided"));
        }
        let user = User {
            user_id: UserId::new(),
            username: username.trim().to_string(),
            display_name: if display_name.trim().is_empty() {
                username.trim().to_string()
            } else {
                display_name.trim().to_string()
            },
            role: role.trim().to_string(),
        };

        self.conn
            .execute(
                "INSERT INTO users(user_id, username, display_name, role) VALUES (?1, ?2, ?3, ?4)",
                params![
                    user.user_id.to_string(),
                    user.username,
                    user.display_name,
                    user.role
                ],
            )
            .with_context(|| format!("failed to insert user {}", user.username))?;

        Ok(user)
    }

    pub fn list_users(&self) -> Result<Vec<User>> {
        list_users(&self.conn)
    }

    pub fn create_task(&self, input: &NewTask) -> Result<Task> {
        if load_workspace(&self.conn, input.workspace_id)?.is_none() {
            return Err(anyhow!("workspace {} not found", input.workspace_id));
        }
        insert_task(&self.conn, input, now_utc())
    }

    pub fn get_task(&self, task_id: TaskId) -> Result<Option<Task>> {
        load_task(&self.conn, task_id)
    }

    pub fn list_tasks(&self, workspace_id: WorkspaceId) -> Result<Vec<Task>> {
        list_tasks(&self.conn, workspace_id)
    }

    /// Applies a manual edit. Returns `None` when the task does not exist.
    pub fn update_task(&self, task_id: TaskId, update: &TaskUpdate) -> Result<Option<Task>> {
        update
            .validate()
            .map_err(|err| anyhow!("task update validation failed: {err}"))?;

        let Some(mut task) = load_task(&self.conn, task_id)? else {
            return Ok(None);
        };
        if let Some(status) = update.status {
            task.status = status;
        }
        if let Some(progress) = update.progress {
            task.progress = progress;
        }
        if let Some(priority) = update.priority {
            task.priority = Some(priority);
        }
        if let Some(assignee_id) = update.assignee_id {
            task.assignee_id = Some(assignee_id);
        }
        if let Some(story_points) = update.story_points {
            task.story_points = Some(story_points);
        }
        if let Some(effort_tag) = update.effort_tag {
            task.effort_tag = Some(effort_tag);
        }
        if let Some(due_date) = update.due_date {
            task.due_date = Some(due_date);
        }
        task.updated_at = now_utc();

        self.conn
            .execute(
                "UPDATE tasks SET
                    status = ?2, progress = ?3, priority = ?4, assignee_id = ?5,
                    story_points = ?6, effort_tag = ?7, due_date = ?8, updated_at = ?9
                 WHERE task_id = ?1",
                params![
                    task.task_id.to_string(),
                    task.status.as_str(),
                    i64::from(task.progress),
                    task.priority.map(i64::from),
                    task.assignee_id.map(|id| id.to_string()),
                    task.story_points.map(i64::from),
                    task.effort_tag.map(EffortTag::as_str),
                    task.due_date.map(to_rfc3339).transpose()?,
                    to_rfc3339(task.updated_at)?,
                ],
            )
            .context("failed to update task")?;

        Ok(Some(task))
    }

    pub fn insert_meeting(&self, input: &NewMeeting) -> Result<Meeting> {
        input
            .validate()
            .map_err(|err| anyhow!("meeting validation failed: {err}"))?;
        if load_workspace(&self.conn, input.workspace_id)?.is_none() {
            return Err(anyhow!("workspace {} not found", input.workspace_id));
        }

        let meeting = Meeting {
            meeting_id: MeetingId::new(),
            workspace_id: input.workspace_id,
            title: input.title.trim().to_string(),
            meeting_date: input.meeting_date,
            transcript: input.transcript.clone(),
            created_at: now_utc(),
        };

        self.conn
            .execute(
                "INSERT INTO meetings(meeting_id, workspace_id, title, meeting_date, transcript, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    meeting.meeting_id.to_string(),
                    meeting.workspace_id.to_string(),
                    meeting.title,
                    meeting.meeting_date.map(to_rfc3339).transpose()?,
                    meeting.transcript,
                    to_rfc3339(meeting.created_at)?,
                ],
            )
            .context("failed to insert meeting")?;

        Ok(meeting)
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn load_workspace(conn: &Connection, workspace_id: WorkspaceId) -> Result<Option<Workspace>> {
    conn.query_row(
        "SELECT workspace_id, name, autonomy_mode, auto_confidence_threshold,
                allowed_auto_kinds_json, created_at
         FROM workspaces WHERE workspace_id = ?1",
        params![workspace_id.to_string()],
        parse_workspace_row,
    )
    .optional()
    .context("failed to load workspace")
}

fn workspace_exists(conn: &Connection, workspace_id: WorkspaceId) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM workspaces WHERE workspace_id = ?1",
            params![workspace_id.to_string()],
            |row| row.get(0),
        )
        .optional()
        .context("failed to check workspace existence")?;
    Ok(found.is_some())
}

fn list_users(conn: &Connection) -> Result<Vec<User>> {
    let mut stmt = conn.prepare(
        "SELECT user_id, username, display_name, role FROM users ORDER BY username ASC",
    )?;
    let rows = stmt.query_map([], parse_user_row)?;
    collect_rows(rows)
}

fn user_exists(conn: &Connection, user_id: UserId) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM users WHERE user_id = ?1",
            params![user_id.to_string()],
            |row| row.get(0),
        )
        .optional()
        .context("failed to check user existence")?;
    Ok(found.is_some())
}

fn find_user_by_username(conn: &Connection, username: &str) -> Result<Option<User>> {
    conn.query_row(
        "SELECT user_id, username, display_name, role FROM users
         WHERE lower(username) = lower(?1)",
        params![username.trim()],
        parse_user_row,
    )
    .optional()
    .context("failed to look up user by username")
}

fn load_task(conn: &Connection, task_id: TaskId) -> Result<Option<Task>> {
    conn.query_row(
        &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = ?1"),
        params![task_id.to_string()],
        parse_task_row,
    )
    .optional()
    .context("failed to load task")
}

fn list_tasks(conn: &Connection, workspace_id: WorkspaceId) -> Result<Vec<Task>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {TASK_COLUMNS} FROM tasks WHERE workspace_id = ?1 ORDER BY created_at ASC, task_id ASC"
    ))?;
    let rows = stmt.query_map(params![workspace_id.to_string()], parse_task_row)?;
    collect_rows(rows)
}

fn insert_task(conn: &Connection, input: &NewTask, now: OffsetDateTime) -> Result<Task> {
    input
        .validate()
        .map_err(|err| anyhow!("task validation failed: {err}"))?;

    let task = Task {
        task_id: TaskId::new(),
        workspace_id: input.workspace_id,
        title: input.title.trim().to_string(),
        description: input.description.clone(),
        assignee_id: input.assignee_id,
        status: input.status,
        due_date: input.due_date,
        priority: input.priority,
        effort_tag: input.effort_tag,
        story_points: input.story_points,
        progress: input.progress,
        suggested_focus_time: None,
        is_potential_risk: false,
        risk_reason: None,
        needs_priority_review: input.needs_priority_review,
        is_blocked: input.is_blocked,
        blocker_reason: input.blocker_reason.clone(),
        parent_task_id: input.parent_task_id,
        confidence: input.confidence,
        created_at: now,
        updated_at: now,
    };

    conn.execute(
        &format!(
            "INSERT INTO tasks({TASK_COLUMNS}) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11,
                ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21
             )"
        ),
        params![
            task.task_id.to_string(),
            task.workspace_id.to_string(),
            task.title,
            task.description,
            task.assignee_id.map(|id| id.to_string()),
            task.status.as_str(),
            task.due_date.map(to_rfc3339).transpose()?,
            task.priority.map(i64::from),
            task.effort_tag.map(EffortTag::as_str),
            task.story_points.map(i64::from),
            i64::from(task.progress),
            task.suggested_focus_time.map(i64::from),
            bool_to_sql(task.is_potential_risk),
            task.risk_reason,
            bool_to_sql(task.needs_priority_review),
            bool_to_sql(task.is_blocked),
            task.blocker_reason,
            task.parent_task_id.map(|id| id.to_string()),
            task.confidence,
            to_rfc3339(task.created_at)?,
            to_rfc3339(task.updated_at)?,
        ],
    )
    .context("failed to insert task")?;

    Ok(task)
}

fn allowed_kinds_json(autonomy: &AutonomyConfig) -> Result<String> {
    let kinds: Vec<&str> = autonomy
        .allowed_auto_kinds
        .iter()
        .map(|kind| kind.as_str())
        .collect();
    serde_json::to_string(&kinds).context("failed to serialize allowed_auto_kinds")
}

fn parse_workspace_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Workspace> {
    let mode_raw: String = row.get(2)?;
    let threshold: f64 = row.get(3)?;
    let kinds_raw: String = row.get(4)?;

    let mode = AutonomyMode::parse(&mode_raw)
        .ok_or_else(|| invalid_text(2, format!("invalid autonomy_mode: {mode_raw}")))?;
    let kind_names: Vec<String> = serde_json::from_str(&kinds_raw)
        .map_err(|err| invalid_text(4, format!("invalid allowed_auto_kinds_json: {err}")))?;
    let allowed_auto_kinds: BTreeSet<SuggestionKind> = kind_names
        .iter()
        .map(|name| {
            SuggestionKind::parse(name)
                .ok_or_else(|| invalid_text(4, format!("invalid allowed kind: {name}")))
        })
        .collect::<rusqlite::Result<_>>()?;

    #[allow(clippy::cast_possible_truncation)]
    let auto_confidence_threshold = threshold as f32;

    Ok(Workspace {
        workspace_id: WorkspaceId(parse_ulid(0, &row.get::<_, String>(0)?)?),
        name: row.get(1)?,
        autonomy: AutonomyConfig {
            mode,
            auto_confidence_threshold,
            allowed_auto_kinds,
        },
        created_at: parse_time(&row.get::<_, String>(5)?)?,
    })
}

fn parse_user_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        user_id: UserId(parse_ulid(0, &row.get::<_, String>(0)?)?),
        username: row.get(1)?,
        display_name: row.get(2)?,
        role: row.get(3)?,
    })
}

fn parse_task_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let status_raw: String = row.get(5)?;
    let status = TaskStatus::parse(&status_raw)
        .ok_or_else(|| invalid_text(5, format!("invalid status: {status_raw}")))?;
    let effort_tag = row
        .get::<_, Option<String>>(8)?
        .map(|raw| {
            EffortTag::parse(&raw).ok_or_else(|| invalid_text(8, format!("invalid effort_tag: {raw}")))
        })
        .transpose()?;

    Ok(Task {
        task_id: TaskId(parse_ulid(0, &row.get::<_, String>(0)?)?),
        workspace_id: WorkspaceId(parse_ulid(1, &row.get::<_, String>(1)?)?),
        title: row.get(2)?,
        description: row.get(3)?,
        assignee_id: row
            .get::<_, Option<String>>(4)?
            .map(|raw| parse_ulid(4, &raw).map(UserId))
            .transpose()?,
        status,
        due_date: row
            .get::<_, Option<String>>(6)?
            .map(|raw| parse_time(&raw))
            .transpose()?,
        priority: optional_int(row, 7)?,
        effort_tag,
        story_points: optional_int(row, 9)?,
        progress: required_int(row, 10)?,
        suggested_focus_time: optional_int(row, 11)?,
        is_potential_risk: row.get::<_, i64>(12)? == 1,
        risk_reason: row.get(13)?,
        needs_priority_review: row.get::<_, i64>(14)? == 1,
        is_blocked: row.get::<_, i64>(15)? == 1,
        blocker_reason: row.get(16)?,
        parent_task_id: row
            .get::<_, Option<String>>(17)?
            .map(|raw| parse_ulid(17, &raw).map(TaskId))
            .transpose()?,
        confidence: row.get::<_, Option<f64>>(18)?.map(narrow_f64),
        created_at: parse_time(&row.get::<_, String>(19)?)?,
        updated_at: parse_time(&row.get::<_, String>(20)?)?,
    })
}

fn optional_int<T: TryFrom<i64>>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<T>> {
    row.get::<_, Option<i64>>(idx)?
        .map(|raw| {
            T::try_from(raw).map_err(|_| invalid_integer(idx, format!("integer out of range: {raw}")))
        })
        .transpose()
}

fn required_int<T: TryFrom<i64>>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: i64 = row.get(idx)?;
    T::try_from(raw).map_err(|_| invalid_integer(idx, format!("integer out of range: {raw}")))
}

#[allow(clippy::cast_possible_truncation)]
fn narrow_f64(value: f64) -> f32 {
    value as f32
}

fn parse_ulid(idx: usize, raw: &str) -> rusqlite::Result<Ulid> {
    Ulid::from_string(raw).map_err(|_| invalid_text(idx, format!("invalid ULID: {raw}")))
}

fn parse_time(raw: &str) -> rusqlite::Result<OffsetDateTime> {
    parse_rfc3339_utc(raw).map_err(to_sql_error)
}

fn to_rfc3339(value: OffsetDateTime) -> Result<String> {
    format_rfc3339(value).map_err(|err| anyhow!(err.to_string()))
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

fn invalid_text(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn invalid_integer(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Integer,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

#[allow(clippy::needless_pass_by_value)]
fn to_sql_error(err: AgentError) -> rusqlite::Error {
    invalid_text(0, err.to_string())
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    pub fn fixture_store() -> SqliteAgentStore {
        let store = must(SqliteAgentStore::open(Path::new(":memory:")));
        must(store.migrate());
        store
    }

    pub fn fixture_workspace(store: &SqliteAgentStore, autonomy: &AutonomyConfig) -> Workspace {
        must(store.create_workspace("Platform", autonomy))
    }

    pub fn fixture_task(store: &SqliteAgentStore, workspace_id: WorkspaceId, title: &str) -> Task {
        must(store.create_task(&NewTask::draft(workspace_id, title)))
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{fixture_store, fixture_task, fixture_workspace, must};
    use super::*;

    #[test]
    fn migrate_is_idempotent() {
        let store = fixture_store();
        must(store.migrate());
        let versions: i64 = match store.connection().query_row(
            "SELECT COUNT(*) FROM schema_migrations",
            [],
            |row| row.get(0),
        ) {
            Ok(value) => value,
            Err(err) => panic!("failed to count migrations: {err}"),
        };
        assert_eq!(versions, 1);
    }

    #[test]
    fn workspace_round_trips_autonomy_config() {
        let store = fixture_store();
        let autonomy = match AutonomyConfig::from_parts("auto", ["set_focus_time", "flag_risk"], 0.9)
        {
            Ok(value) => value,
            Err(err) => panic!("invalid autonomy: {err}"),
        };
        let workspace = fixture_workspace(&store, &autonomy);
        let loaded = match must(store.get_workspace(workspace.workspace_id)) {
            Some(value) => value,
            None => panic!("workspace should exist"),
        };
        assert_eq!(loaded.autonomy, autonomy);
        assert_eq!(loaded.name, "Platform");
        assert!(must(store.get_workspace(WorkspaceId::new())).is_none());
    }

    #[test]
    fn task_create_update_and_list() {
        let store = fixture_store();
        let workspace = fixture_workspace(&store, &AutonomyConfig::default());
        let user = must(store.add_user("dev1", "Dana Dev", "dev"));

        let task = fixture_task(&store, workspace.workspace_id, "Wire up OAuth");
        assert_eq!(task.status, TaskStatus::Todo);
        assert_eq!(must(store.get_task(task.task_id)), Some(task.clone()));

        let update = TaskUpdate {
            status: Some(TaskStatus::InProgress),
            progress: Some(40),
            assignee_id: Some(user.user_id),
            effort_tag: Some(EffortTag::Large),
            ..TaskUpdate::default()
        };
        let updated = match must(store.update_task(task.task_id, &update)) {
            Some(value) => value,
            None => panic!("task should exist"),
        };
        assert_eq!(updated.progress, 40);
        assert_eq!(updated.assignee_id, Some(user.user_id));
        assert_eq!(must(store.get_task(task.task_id)), Some(updated));

        assert!(must(store.update_task(TaskId::new(), &update)).is_none());
        assert_eq!(must(store.list_tasks(workspace.workspace_id)).len(), 1);
    }

    #[test]
    fn task_creation_requires_existing_workspace_and_valid_fields() {
        let store = fixture_store();
        assert!(store
            .create_task(&NewTask::draft(WorkspaceId::new(), "orphan"))
            .is_err());

        let workspace = fixture_workspace(&store, &AutonomyConfig::default());
        let mut input = NewTask::draft(workspace.workspace_id, "bad priority");
        input.priority = Some(11);
        assert!(store.create_task(&input).is_err());
    }

    #[test]
    fn usernames_are_unique() {
        let store = fixture_store();
        must(store.add_user("qa1", "Quinn", "qa"));
        assert!(store.add_user("qa1", "Other", "qa").is_err());
        assert_eq!(must(store.list_users()).len(), 1);
    }

    #[test]
    fn meeting_requires_transcript() {
        let store = fixture_store();
        let workspace = fixture_workspace(&store, &AutonomyConfig::default());
        let input = NewMeeting {
            workspace_id: workspace.workspace_id,
            title: "Standup".to_string(),
            meeting_date: None,
            transcript: "   ".to_string(),
        };
        assert!(store.insert_meeting(&input).is_err());
    }
}
