//! Application executor, rejection path and the undo/audit ledger.
//!
//! Every operation here runs inside one `BEGIN IMMEDIATE` transaction. A
//! returned [`OperationFailure`] or an infrastructure error drops the
//! transaction, which rolls back every write made so far.

use anyhow::{anyhow, Context, Result};
use nova_agent_core::{
    now_utc, AdvisorySnapshot, AuditAction, AuditId, AuditRecord, AutoMappedTaskPayload,
    CreateTaskPayload, CreatedTaskSnapshot, FlagRiskPayload, FocusTimeSnapshot, NewTask,
    OperationFailure, OperationResult, PrioritySnapshot, RejectionAfter, RejectionBefore,
    Reversal, RiskSnapshot, SetFocusTimePayload, SetPriorityPayload, SplitSnapshot,
    SplitTaskPayload, Suggestion, SuggestionId, SuggestionPayload, TargetType, Task, TaskId,
    UserId, WorkspaceId,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use ulid::Ulid;

use crate::suggestions::{claim_suggestion, load_stored_suggestion};
use crate::{
    bool_to_sql, collect_rows, find_user_by_username, insert_task, invalid_text, load_task,
    parse_time, parse_ulid, to_rfc3339, user_exists, workspace_exists, SqliteAgentStore,
};

pub const DEFAULT_AUDIT_LIMIT: usize = 50;

/// Confidence below which a created task is queued for priority review.
const PRIORITY_REVIEW_CONFIDENCE: f32 = 0.7;

const AUDIT_COLUMNS: &str = "audit_seq, audit_id, workspace_id, actor_id, action_type,
    target_type, target_id, before_json, after_json, suggestion_id, reverts_audit_id, created_at";

/// What a dispatched application changed, before it is written to the ledger.
struct Effect {
    target_type: TargetType,
    target_id: Ulid,
    before: Option<Value>,
    after: Option<Value>,
}

struct NewAudit {
    workspace_id: WorkspaceId,
    actor_id: Option<UserId>,
    action_type: AuditAction,
    effect: Effect,
    suggestion_id: Option<SuggestionId>,
    reverts_audit_id: Option<AuditId>,
}

impl SqliteAgentStore {
    /// Applies a pending suggestion exactly once.
    ///
    /// `actor_id` is `None` for autonomous application.
    pub fn apply_suggestion(
        &mut self,
        suggestion_id: SuggestionId,
        actor_id: Option<UserId>,
    ) -> Result<OperationResult<AuditRecord>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start apply transaction")?;

        let Some(stored) = load_stored_suggestion(&tx, suggestion_id)? else {
            return Ok(Err(OperationFailure::SuggestionNotFound { suggestion_id }));
        };
        if stored.applied {
            return Ok(Err(OperationFailure::AlreadyDisposed { suggestion_id }));
        }
        if !workspace_exists(&tx, stored.workspace_id)? {
            return Ok(Err(OperationFailure::WorkspaceNotFound {
                workspace_id: stored.workspace_id,
            }));
        }
        let suggestion = match stored.decode() {
            Ok(value) => value,
            Err(err) => {
                return Ok(Err(OperationFailure::InvalidPayload {
                    suggestion_id,
                    message: err.to_string(),
                }))
            }
        };

        let now = now_utc();
        let effect = match dispatch(&tx, &suggestion, now)? {
            Ok(effect) => effect,
            Err(failure) => return Ok(Err(failure)),
        };

        if !claim_suggestion(&tx, suggestion_id)? {
            return Ok(Err(OperationFailure::AlreadyDisposed { suggestion_id }));
        }

        let audit = insert_audit(
            &tx,
            NewAudit {
                workspace_id: suggestion.workspace_id,
                actor_id,
                action_type: AuditAction::Applied(suggestion.kind),
                effect,
                suggestion_id: Some(suggestion_id),
                reverts_audit_id: None,
            },
            now,
        )?;
        tx.commit().context("failed to commit apply transaction")?;

        tracing::info!(
            suggestion_id = %suggestion_id,
            audit_id = %audit.audit_id,
            kind = suggestion.kind.as_str(),
            autonomous = actor_id.is_none(),
            "suggestion applied"
        );
        Ok(Ok(audit))
    }

    /// Marks a pending suggestion as disposed without touching domain state.
    pub fn reject_suggestion(
        &mut self,
        suggestion_id: SuggestionId,
        actor_id: Option<UserId>,
    ) -> Result<OperationResult<AuditRecord>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start reject transaction")?;

        let Some(stored) = load_stored_suggestion(&tx, suggestion_id)? else {
            return Ok(Err(OperationFailure::SuggestionNotFound { suggestion_id }));
        };
        if stored.applied || !claim_suggestion(&tx, suggestion_id)? {
            return Ok(Err(OperationFailure::AlreadyDisposed { suggestion_id }));
        }

        let now = now_utc();
        let audit = insert_audit(
            &tx,
            NewAudit {
                workspace_id: stored.workspace_id,
                actor_id,
                action_type: AuditAction::SuggestionRejected,
                effect: Effect {
                    target_type: TargetType::Suggestion,
                    target_id: suggestion_id.0,
                    before: Some(to_json(&RejectionBefore { kind: stored.kind })?),
                    after: Some(to_json(&RejectionAfter { rejected: true })?),
                },
                suggestion_id: Some(suggestion_id),
                reverts_audit_id: None,
            },
            now,
        )?;
        tx.commit().context("failed to commit reject transaction")?;

        tracing::info!(
            suggestion_id = %suggestion_id,
            audit_id = %audit.audit_id,
            "suggestion rejected"
        );
        Ok(Ok(audit))
    }

    /// Restores the `before` snapshot of a reversible audit record and
    /// appends an `agent_undo` record pointing back at it.
    pub fn undo_audit(
        &mut self,
        audit_id: AuditId,
        actor_id: Option<UserId>,
    ) -> Result<OperationResult<AuditRecord>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start undo transaction")?;

        let Some(original) = load_audit(&tx, audit_id)? else {
            return Ok(Err(OperationFailure::AuditNotFound { audit_id }));
        };
        let reversal = match original.reversal() {
            Ok(value) => value,
            Err(failure) => return Ok(Err(failure)),
        };
        if undo_exists_for(&tx, audit_id)? {
            return Ok(Err(OperationFailure::AlreadyUndone { audit_id }));
        }
        let task_id = reversal.task_id();
        if load_task(&tx, task_id)?.is_none() {
            return Ok(Err(OperationFailure::TaskNotFound { task_id }));
        }

        let now = now_utc();
        write_reversal(&tx, &reversal, now)?;

        let audit = insert_audit(
            &tx,
            NewAudit {
                workspace_id: original.workspace_id,
                actor_id,
                action_type: AuditAction::Undo,
                effect: Effect {
                    target_type: TargetType::Task,
                    target_id: task_id.0,
                    before: original.after.clone(),
                    after: original.before.clone(),
                },
                suggestion_id: original.suggestion_id,
                reverts_audit_id: Some(audit_id),
            },
            now,
        )?;
        tx.commit().context("failed to commit undo transaction")?;

        tracing::info!(
            audit_id = %audit_id,
            undo_audit_id = %audit.audit_id,
            action_type = original.action_type.as_str(),
            "audit record undone"
        );
        Ok(Ok(audit))
    }

    /// Audit records for a workspace, newest first.
    pub fn list_audits(
        &self,
        workspace_id: WorkspaceId,
        limit: Option<usize>,
    ) -> Result<Vec<AuditRecord>> {
        let limit = i64::try_from(limit.unwrap_or(DEFAULT_AUDIT_LIMIT))
            .context("audit limit out of range")?;
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {AUDIT_COLUMNS} FROM agent_audits
             WHERE workspace_id = ?1
             ORDER BY audit_seq DESC
             LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![workspace_id.to_string(), limit], parse_audit_row)?;
        collect_rows(rows)
    }

    pub fn get_audit(&self, audit_id: AuditId) -> Result<Option<AuditRecord>> {
        load_audit(&self.conn, audit_id)
    }
}

fn dispatch(
    conn: &Connection,
    suggestion: &Suggestion,
    now: OffsetDateTime,
) -> Result<OperationResult<Effect>> {
    match &suggestion.payload {
        SuggestionPayload::SetFocusTime(payload) => apply_focus_time(conn, suggestion, payload, now),
        SuggestionPayload::CreateTask(payload) => apply_create_task(conn, suggestion, payload, now),
        SuggestionPayload::AutoMappedTask(payload) => {
            apply_auto_mapped_task(conn, suggestion, payload, now)
        }
        SuggestionPayload::FlagRisk(payload) => apply_flag_risk(conn, suggestion, payload, now),
        SuggestionPayload::SetPriority(payload) => apply_priority(conn, suggestion, payload, now),
        SuggestionPayload::SplitTask(payload) => apply_split(conn, suggestion, payload, now),
        SuggestionPayload::RebalanceTask(_)
        | SuggestionPayload::AddDependency(_)
        | SuggestionPayload::OptimizeAssignment(_) => apply_advisory(conn, suggestion),
    }
}

/// Loads the target task, treating a task from another workspace as missing.
fn target_task(
    conn: &Connection,
    suggestion: &Suggestion,
    task_id: TaskId,
) -> Result<OperationResult<Task>> {
    match load_task(conn, task_id)? {
        Some(task) if task.workspace_id == suggestion.workspace_id => Ok(Ok(task)),
        _ => Ok(Err(OperationFailure::TaskNotFound { task_id })),
    }
}

fn apply_focus_time(
    conn: &Connection,
    suggestion: &Suggestion,
    payload: &SetFocusTimePayload,
    now: OffsetDateTime,
) -> Result<OperationResult<Effect>> {
    let task = match target_task(conn, suggestion, payload.task_id)? {
        Ok(task) => task,
        Err(failure) => return Ok(Err(failure)),
    };
    let before = FocusTimeSnapshot {
        suggested_focus_time: task.suggested_focus_time,
    };
    let after = FocusTimeSnapshot {
        suggested_focus_time: Some(payload.focus_time),
    };
    write_focus_time(conn, task.task_id, &after, now)?;
    Ok(Ok(task_effect(task.task_id, Some(to_json(&before)?), to_json(&after)?)))
}

fn apply_flag_risk(
    conn: &Connection,
    suggestion: &Suggestion,
    payload: &FlagRiskPayload,
    now: OffsetDateTime,
) -> Result<OperationResult<Effect>> {
    let task = match target_task(conn, suggestion, payload.task_id)? {
        Ok(task) => task,
        Err(failure) => return Ok(Err(failure)),
    };
    let before = RiskSnapshot {
        is_potential_risk: task.is_potential_risk,
        risk_reason: task.risk_reason.clone(),
    };
    let after = RiskSnapshot {
        is_potential_risk: true,
        risk_reason: Some(payload.reason.clone()),
    };
    write_risk(conn, task.task_id, &after, now)?;
    Ok(Ok(task_effect(task.task_id, Some(to_json(&before)?), to_json(&after)?)))
}

fn apply_priority(
    conn: &Connection,
    suggestion: &Suggestion,
    payload: &SetPriorityPayload,
    now: OffsetDateTime,
) -> Result<OperationResult<Effect>> {
    let task = match target_task(conn, suggestion, payload.task_id)? {
        Ok(task) => task,
        Err(failure) => return Ok(Err(failure)),
    };
    let before = PrioritySnapshot {
        priority: task.priority,
    };
    let after = PrioritySnapshot {
        priority: Some(payload.suggested_priority),
    };
    write_priority(conn, task.task_id, &after, now)?;
    Ok(Ok(task_effect(task.task_id, Some(to_json(&before)?), to_json(&after)?)))
}

fn apply_create_task(
    conn: &Connection,
    suggestion: &Suggestion,
    payload: &CreateTaskPayload,
    now: OffsetDateTime,
) -> Result<OperationResult<Effect>> {
    let assignee_id = match payload.assignee_id {
        Some(user_id) if user_exists(conn, user_id)? => Some(user_id),
        Some(user_id) => return Ok(Err(OperationFailure::AssigneeNotFound { user_id })),
        None => match payload.assignee.as_deref() {
            Some(username) => {
                let resolved = find_user_by_username(conn, username)?;
                if resolved.is_none() {
                    tracing::debug!(username, "assignee not found; task left unassigned");
                }
                resolved.map(|user| user.user_id)
            }
            None => None,
        },
    };

    let mut input = NewTask::draft(suggestion.workspace_id, payload.title.clone());
    input.description.clone_from(&payload.description);
    input.assignee_id = assignee_id;
    input.priority = payload.priority;
    input.effort_tag = payload.effort_tag;
    input.due_date = payload.due_date;
    input.is_blocked = payload.is_blocked;
    input.blocker_reason.clone_from(&payload.blocker_reason);
    created_task_effect(conn, suggestion, input, now)
}

fn apply_auto_mapped_task(
    conn: &Connection,
    suggestion: &Suggestion,
    payload: &AutoMappedTaskPayload,
    now: OffsetDateTime,
) -> Result<OperationResult<Effect>> {
    if let Some(user_id) = payload.owner_id {
        if !user_exists(conn, user_id)? {
            return Ok(Err(OperationFailure::AssigneeNotFound { user_id }));
        }
    }

    let mut input = NewTask::draft(suggestion.workspace_id, payload.title.clone());
    input.description = Some(payload.description.clone());
    input.assignee_id = payload.owner_id;
    input.priority = Some(payload.priority);
    input.due_date = payload.deadline;
    input.is_blocked = payload.blockers.is_some();
    input.blocker_reason.clone_from(&payload.blockers);
    created_task_effect(conn, suggestion, input, now)
}

fn created_task_effect(
    conn: &Connection,
    suggestion: &Suggestion,
    mut input: NewTask,
    now: OffsetDateTime,
) -> Result<OperationResult<Effect>> {
    input.confidence = Some(suggestion.confidence);
    input.needs_priority_review = suggestion.confidence < PRIORITY_REVIEW_CONFIDENCE;

    let task = insert_task(conn, &input, now)?;
    let after = CreatedTaskSnapshot {
        task_id: task.task_id,
        title: task.title,
    };
    Ok(Ok(task_effect(task.task_id, None, to_json(&after)?)))
}

fn apply_split(
    conn: &Connection,
    suggestion: &Suggestion,
    payload: &SplitTaskPayload,
    now: OffsetDateTime,
) -> Result<OperationResult<Effect>> {
    let parent = match target_task(conn, suggestion, payload.parent_task_id)? {
        Ok(task) => task,
        Err(failure) => return Ok(Err(failure)),
    };

    let mut subtask_ids = Vec::with_capacity(payload.subtasks.len());
    for draft in &payload.subtasks {
        let mut input = NewTask::draft(suggestion.workspace_id, draft.title.clone());
        input.description.clone_from(&draft.description);
        input.effort_tag = draft.effort_tag;
        input.parent_task_id = Some(parent.task_id);
        input.confidence = Some(suggestion.confidence);
        subtask_ids.push(insert_task(conn, &input, now)?.task_id);
    }

    let after = SplitSnapshot {
        subtasks_created: subtask_ids.len(),
        subtask_ids,
    };
    Ok(Ok(task_effect(parent.task_id, None, to_json(&after)?)))
}

fn apply_advisory(conn: &Connection, suggestion: &Suggestion) -> Result<OperationResult<Effect>> {
    let Some(task_id) = suggestion.payload.target_task() else {
        return Err(anyhow!(
            "advisory suggestion {} has no target task",
            suggestion.suggestion_id
        ));
    };
    let task = match target_task(conn, suggestion, task_id)? {
        Ok(task) => task,
        Err(failure) => return Ok(Err(failure)),
    };
    let after = AdvisorySnapshot {
        advisory: true,
        recommendation: suggestion.payload.recommendation().unwrap_or_default(),
    };
    Ok(Ok(task_effect(task.task_id, None, to_json(&after)?)))
}

fn task_effect(task_id: TaskId, before: Option<Value>, after: Value) -> Effect {
    Effect {
        target_type: TargetType::Task,
        target_id: task_id.0,
        before,
        after: Some(after),
    }
}

fn write_reversal(conn: &Connection, reversal: &Reversal, now: OffsetDateTime) -> Result<()> {
    match reversal {
        Reversal::FocusTime { task_id, snapshot } => write_focus_time(conn, *task_id, snapshot, now),
        Reversal::Priority { task_id, snapshot } => write_priority(conn, *task_id, snapshot, now),
        Reversal::Risk { task_id, snapshot } => write_risk(conn, *task_id, snapshot, now),
    }
}

fn write_focus_time(
    conn: &Connection,
    task_id: TaskId,
    snapshot: &FocusTimeSnapshot,
    now: OffsetDateTime,
) -> Result<()> {
    conn.execute(
        "UPDATE tasks SET suggested_focus_time = ?2, updated_at = ?3 WHERE task_id = ?1",
        params![
            task_id.to_string(),
            snapshot.suggested_focus_time.map(i64::from),
            to_rfc3339(now)?,
        ],
    )
    .context("failed to write suggested_focus_time")?;
    Ok(())
}

fn write_priority(
    conn: &Connection,
    task_id: TaskId,
    snapshot: &PrioritySnapshot,
    now: OffsetDateTime,
) -> Result<()> {
    conn.execute(
        "UPDATE tasks SET priority = ?2, updated_at = ?3 WHERE task_id = ?1",
        params![
            task_id.to_string(),
            snapshot.priority.map(i64::from),
            to_rfc3339(now)?,
        ],
    )
    .context("failed to write priority")?;
    Ok(())
}

fn write_risk(
    conn: &Connection,
    task_id: TaskId,
    snapshot: &RiskSnapshot,
    now: OffsetDateTime,
) -> Result<()> {
    conn.execute(
        "UPDATE tasks SET is_potential_risk = ?2, risk_reason = ?3, updated_at = ?4
         WHERE task_id = ?1",
        params![
            task_id.to_string(),
            bool_to_sql(snapshot.is_potential_risk),
            snapshot.risk_reason,
            to_rfc3339(now)?,
        ],
    )
    .context("failed to write risk flag")?;
    Ok(())
}

fn insert_audit(conn: &Connection, input: NewAudit, now: OffsetDateTime) -> Result<AuditRecord> {
    let audit_id = AuditId::new();
    let before_json = input
        .effect
        .before
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .context("failed to serialize before snapshot")?;
    let after_json = input
        .effect
        .after
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .context("failed to serialize after snapshot")?;

    conn.execute(
        "INSERT INTO agent_audits(
            audit_id, workspace_id, actor_id, action_type, target_type, target_id,
            before_json, after_json, suggestion_id, reverts_audit_id, created_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            audit_id.to_string(),
            input.workspace_id.to_string(),
            input.actor_id.map(|id| id.to_string()),
            input.action_type.as_str(),
            input.effect.target_type.as_str(),
            input.effect.target_id.to_string(),
            before_json,
            after_json,
            input.suggestion_id.map(|id| id.to_string()),
            input.reverts_audit_id.map(|id| id.to_string()),
            to_rfc3339(now)?,
        ],
    )
    .context("failed to append audit record")?;

    Ok(AuditRecord {
        audit_seq: conn.last_insert_rowid(),
        audit_id,
        workspace_id: input.workspace_id,
        actor_id: input.actor_id,
        action_type: input.action_type,
        target_type: input.effect.target_type,
        target_id: input.effect.target_id,
        before: input.effect.before,
        after: input.effect.after,
        suggestion_id: input.suggestion_id,
        reverts_audit_id: input.reverts_audit_id,
        created_at: now,
    })
}

fn load_audit(conn: &Connection, audit_id: AuditId) -> Result<Option<AuditRecord>> {
    conn.query_row(
        &format!("SELECT {AUDIT_COLUMNS} FROM agent_audits WHERE audit_id = ?1"),
        params![audit_id.to_string()],
        parse_audit_row,
    )
    .optional()
    .context("failed to load audit record")
}

fn undo_exists_for(conn: &Connection, audit_id: AuditId) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM agent_audits WHERE reverts_audit_id = ?1",
            params![audit_id.to_string()],
            |row| row.get(0),
        )
        .optional()
        .context("failed to check for an existing undo")?;
    Ok(found.is_some())
}

fn to_json<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).context("failed to encode audit snapshot")
}

fn parse_json_column(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<Value>> {
    raw.map(|text| {
        serde_json::from_str(&text)
            .map_err(|err| invalid_text(idx, format!("invalid snapshot JSON: {err}")))
    })
    .transpose()
}

fn parse_audit_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditRecord> {
    let action_raw: String = row.get(4)?;
    let action_type = AuditAction::parse(&action_raw)
        .ok_or_else(|| invalid_text(4, format!("invalid action_type: {action_raw}")))?;
    let target_raw: String = row.get(5)?;
    let target_type = TargetType::parse(&target_raw)
        .ok_or_else(|| invalid_text(5, format!("invalid target_type: {target_raw}")))?;

    Ok(AuditRecord {
        audit_seq: row.get(0)?,
        audit_id: AuditId(parse_ulid(1, &row.get::<_, String>(1)?)?),
        workspace_id: WorkspaceId(parse_ulid(2, &row.get::<_, String>(2)?)?),
        actor_id: row
            .get::<_, Option<String>>(3)?
            .map(|raw| parse_ulid(3, &raw).map(UserId))
            .transpose()?,
        action_type,
        target_type,
        target_id: parse_ulid(6, &row.get::<_, String>(6)?)?,
        before: parse_json_column(7, row.get(7)?)?,
        after: parse_json_column(8, row.get(8)?)?,
        suggestion_id: row
            .get::<_, Option<String>>(9)?
            .map(|raw| parse_ulid(9, &raw).map(SuggestionId))
            .transpose()?,
        reverts_audit_id: row
            .get::<_, Option<String>>(10)?
            .map(|raw| parse_ulid(10, &raw).map(AuditId))
            .transpose()?,
        created_at: parse_time(&row.get::<_, String>(11)?)?,
    })
}
