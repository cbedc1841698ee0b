use anyhow::{anyhow, Context, Result};
use nova_agent_core::{
    now_utc, AgentError, AutonomyConfig, NewSuggestion, Suggestion, SuggestionId, SuggestionKind,
    SuggestionPayload, TaskId, WorkspaceId,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use time::OffsetDateTime;

use crate::{
    allowed_kinds_json, collect_rows, invalid_text, load_workspace, narrow_f64, parse_time,
    parse_ulid, to_rfc3339, workspace_exists, SqliteAgentStore,
};

const SUGGESTION_COLUMNS: &str = "suggestion_seq, suggestion_id, workspace_id, kind,
    payload_json, confidence, applied, created_at";

/// A suggestion row before its payload is decoded.
///
/// The executor needs to tell a missing row apart from an undecodable one.
#[derive(Debug, Clone)]
pub(crate) struct StoredSuggestion {
    pub suggestion_seq: i64,
    pub suggestion_id: SuggestionId,
    pub workspace_id: WorkspaceId,
    pub kind: SuggestionKind,
    pub payload_json: String,
    pub confidence: f32,
    pub applied: bool,
    pub created_at: OffsetDateTime,
}

impl StoredSuggestion {
    pub(crate) fn decode(&self) -> Result<Suggestion, AgentError> {
        let value: Value = serde_json::from_str(&self.payload_json)
            .map_err(|err| AgentError::Payload(format!("payload_json is not JSON: {err}")))?;
        let payload = SuggestionPayload::from_json(self.kind, &value)?;
        payload.validate()?;
        Ok(Suggestion {
            suggestion_seq: self.suggestion_seq,
            suggestion_id: self.suggestion_id,
            workspace_id: self.workspace_id,
            kind: self.kind,
            payload,
            confidence: self.confidence,
            applied: self.applied,
            created_at: self.created_at,
        })
    }
}

impl SqliteAgentStore {
    /// Validates and persists a pending suggestion.
    pub fn create_suggestion(&self, input: &NewSuggestion) -> Result<Suggestion> {
        input
            .validate()
            .map_err(|err| anyhow!("suggestion validation failed: {err}"))?;
        if !workspace_exists(&self.conn, input.workspace_id)? {
            return Err(anyhow!("workspace {} not found", input.workspace_id));
        }
        insert_suggestion(&self.conn, input, now_utc())
    }

    pub fn get_suggestion(&self, suggestion_id: SuggestionId) -> Result<Option<Suggestion>> {
        load_stored_suggestion(&self.conn, suggestion_id)?
            .map(|stored| {
                stored
                    .decode()
                    .map_err(|err| anyhow!("stored suggestion {suggestion_id} is corrupt: {err}"))
            })
            .transpose()
    }

    /// Pending suggestions for a workspace, newest first.
    pub fn list_pending(&self, workspace_id: WorkspaceId) -> Result<Vec<Suggestion>> {
        self.list_suggestions(workspace_id, Some(false))
    }

    /// Suggestions newest first, optionally filtered by the `applied` flag.
    pub fn list_suggestions(
        &self,
        workspace_id: WorkspaceId,
        applied: Option<bool>,
    ) -> Result<Vec<Suggestion>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SUGGESTION_COLUMNS} FROM agent_suggestions
             WHERE workspace_id = ?1 AND (?2 IS NULL OR applied = ?2)
             ORDER BY suggestion_seq DESC"
        ))?;
        let rows = stmt.query_map(
            params![workspace_id.to_string(), applied.map(i64::from)],
            parse_stored_suggestion_row,
        )?;
        collect_rows(rows)?
            .into_iter()
            .map(|stored| {
                stored.decode().map_err(|err| {
                    anyhow!(
                        "stored suggestion {} is corrupt: {err}",
                        stored.suggestion_id
                    )
                })
            })
            .collect()
    }

    pub fn get_autonomy_config(&self, workspace_id: WorkspaceId) -> Result<Option<AutonomyConfig>> {
        Ok(load_workspace(&self.conn, workspace_id)?.map(|workspace| workspace.autonomy))
    }

    /// Replaces the workspace's autonomy policy. Returns `None` when the
    /// workspace does not exist.
    pub fn set_autonomy_config(
        &self,
        workspace_id: WorkspaceId,
        config: &AutonomyConfig,
    ) -> Result<Option<AutonomyConfig>> {
        config
            .validate()
            .map_err(|err| anyhow!("invalid autonomy configuration: {err}"))?;

        let updated = self
            .conn
            .execute(
                "UPDATE workspaces SET
                    autonomy_mode = ?2,
                    auto_confidence_threshold = ?3,
                    allowed_auto_kinds_json = ?4
                 WHERE workspace_id = ?1",
                params![
                    workspace_id.to_string(),
                    config.mode.as_str(),
                    config.auto_confidence_threshold,
                    allowed_kinds_json(config)?,
                ],
            )
            .context("failed to update autonomy configuration")?;

        if updated == 0 {
            return Ok(None);
        }
        tracing::info!(
            workspace_id = %workspace_id,
            mode = config.mode.as_str(),
            threshold = config.auto_confidence_threshold,
            "autonomy configuration updated"
        );
        Ok(Some(config.clone()))
    }
}

pub(crate) fn insert_suggestion(
    conn: &Connection,
    input: &NewSuggestion,
    now: OffsetDateTime,
) -> Result<Suggestion> {
    let suggestion_id = SuggestionId::new();
    let payload_json = input
        .payload
        .to_json()
        .map_err(|err| anyhow!(err.to_string()))?;

    conn.execute(
        "INSERT INTO agent_suggestions(
            suggestion_id, workspace_id, kind, target_task_id, payload_json,
            confidence, applied, created_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)",
        params![
            suggestion_id.to_string(),
            input.workspace_id.to_string(),
            input.kind().as_str(),
            input.payload.target_task().map(|id| id.to_string()),
            serde_json::to_string(&payload_json).context("failed to serialize payload_json")?,
            input.confidence,
            to_rfc3339(now)?,
        ],
    )
    .context("failed to insert suggestion")?;

    Ok(Suggestion {
        suggestion_seq: conn.last_insert_rowid(),
        suggestion_id,
        workspace_id: input.workspace_id,
        kind: input.kind(),
        payload: input.payload.clone(),
        confidence: input.confidence,
        applied: false,
        created_at: now,
    })
}

pub(crate) fn load_stored_suggestion(
    conn: &Connection,
    suggestion_id: SuggestionId,
) -> Result<Option<StoredSuggestion>> {
    conn.query_row(
        &format!("SELECT {SUGGESTION_COLUMNS} FROM agent_suggestions WHERE suggestion_id = ?1"),
        params![suggestion_id.to_string()],
        parse_stored_suggestion_row,
    )
    .optional()
    .context("failed to load suggestion")
}

/// The pending suggestion of `kind` already aimed at `task_id`, if any.
pub(crate) fn pending_for_target(
    conn: &Connection,
    workspace_id: WorkspaceId,
    kind: SuggestionKind,
    task_id: TaskId,
) -> Result<Option<SuggestionId>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT suggestion_id FROM agent_suggestions
             WHERE workspace_id = ?1 AND kind = ?2 AND target_task_id = ?3 AND applied = 0
             ORDER BY suggestion_seq ASC
             LIMIT 1",
            params![workspace_id.to_string(), kind.as_str(), task_id.to_string()],
            |row| row.get(0),
        )
        .optional()
        .context("failed to check for duplicate suggestion")?;
    raw.map(|value| SuggestionId::parse(&value).map_err(|err| anyhow!(err.to_string())))
        .transpose()
}

/// Flips `applied` from 0 to 1. Returns false when another writer got there
/// first.
pub(crate) fn claim_suggestion(conn: &Connection, suggestion_id: SuggestionId) -> Result<bool> {
    let updated = conn
        .execute(
            "UPDATE agent_suggestions SET applied = 1 WHERE suggestion_id = ?1 AND applied = 0",
            params![suggestion_id.to_string()],
        )
        .context("failed to mark suggestion as applied")?;
    Ok(updated == 1)
}

fn parse_stored_suggestion_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredSuggestion> {
    let kind_raw: String = row.get(3)?;
    let kind = SuggestionKind::parse(&kind_raw)
        .ok_or_else(|| invalid_text(3, format!("invalid kind: {kind_raw}")))?;

    Ok(StoredSuggestion {
        suggestion_seq: row.get(0)?,
        suggestion_id: SuggestionId(parse_ulid(1, &row.get::<_, String>(1)?)?),
        workspace_id: WorkspaceId(parse_ulid(2, &row.get::<_, String>(2)?)?),
        kind,
        payload_json: row.get(4)?,
        confidence: narrow_f64(row.get(5)?),
        applied: row.get::<_, i64>(6)? == 1,
        created_at: parse_time(&row.get::<_, String>(7)?)?,
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp)]

    use super::*;
    use crate::test_support::{fixture_store, fixture_task, fixture_workspace, must};
    use nova_agent_core::{AutonomyMode, SetFocusTimePayload};
    use proptest::prelude::*;
    use serde_json::json;

    fn focus_suggestion(workspace_id: WorkspaceId, task_id: TaskId, confidence: f32) -> NewSuggestion {
        NewSuggestion::new(
            workspace_id,
            SuggestionPayload::SetFocusTime(SetFocusTimePayload {
                task_id,
                focus_time: 4,
            }),
            confidence,
        )
    }

    #[test]
    fn created_suggestion_is_pending_and_listed_newest_first() {
        let store = fixture_store();
        let workspace = fixture_workspace(&store, &AutonomyConfig::default());
        let task = fixture_task(&store, workspace.workspace_id, "Write runbook");

        let first = must(store.create_suggestion(&focus_suggestion(
            workspace.workspace_id,
            task.task_id,
            0.75,
        )));
        let second = must(store.create_suggestion(&focus_suggestion(
            workspace.workspace_id,
            task.task_id,
            0.9,
        )));
        assert!(!first.applied);

        let pending = must(store.list_pending(workspace.workspace_id));
        let ids: Vec<SuggestionId> = pending.iter().map(|s| s.suggestion_id).collect();
        assert_eq!(ids, vec![second.suggestion_id, first.suggestion_id]);

        let loaded = match must(store.get_suggestion(first.suggestion_id)) {
            Some(value) => value,
            None => panic!("suggestion should exist"),
        };
        assert_eq!(loaded, first);
        assert!(must(store.get_suggestion(SuggestionId::new())).is_none());
    }

    #[test]
    fn untyped_input_with_unknown_kind_or_bad_payload_is_rejected() {
        let store = fixture_store();
        let workspace = fixture_workspace(&store, &AutonomyConfig::default());

        assert!(NewSuggestion::from_untyped(
            workspace.workspace_id,
            "delete_everything",
            &json!({}),
            0.5
        )
        .is_err());
        assert!(NewSuggestion::from_untyped(
            workspace.workspace_id,
            "set_focus_time",
            &json!({"focus_time": 3}),
            0.5
        )
        .is_err());

        let valid = match NewSuggestion::from_untyped(
            workspace.workspace_id,
            "create_task",
            &json!({"title": "Draft release notes"}),
            0.6,
        ) {
            Ok(value) => value,
            Err(err) => panic!("expected valid suggestion: {err}"),
        };
        let created = must(store.create_suggestion(&valid));
        assert_eq!(created.kind, SuggestionKind::CreateTask);
    }

    #[test]
    fn unknown_workspace_is_rejected() {
        let store = fixture_store();
        let input = focus_suggestion(WorkspaceId::new(), TaskId::new(), 0.5);
        assert!(store.create_suggestion(&input).is_err());
    }

    #[test]
    fn autonomy_config_round_trips_and_rejects_bad_threshold() {
        let store = fixture_store();
        let workspace = fixture_workspace(&store, &AutonomyConfig::default());

        let config = match AutonomyConfig::from_parts("auto", ["set_focus_time", "set_priority"], 0.8)
        {
            Ok(value) => value,
            Err(err) => panic!("invalid config: {err}"),
        };
        let saved = must(store.set_autonomy_config(workspace.workspace_id, &config));
        assert_eq!(saved.as_ref(), Some(&config));
        assert_eq!(
            must(store.get_autonomy_config(workspace.workspace_id)),
            Some(config.clone())
        );

        let mut bad = config;
        bad.auto_confidence_threshold = 1.5;
        assert!(store.set_autonomy_config(workspace.workspace_id, &bad).is_err());

        let missing = must(store.set_autonomy_config(WorkspaceId::new(), &AutonomyConfig::default()));
        assert!(missing.is_none());
        let stored = must(store.get_autonomy_config(workspace.workspace_id));
        assert_eq!(stored.map(|c| c.mode), Some(AutonomyMode::Auto));
    }

    proptest! {
        #[test]
        fn prop_confidence_outside_unit_interval_is_rejected(confidence in prop_oneof![
            -10.0f32..10.0f32,
            Just(f32::NAN),
            Just(f32::INFINITY),
        ]) {
            let store = fixture_store();
            let workspace = fixture_workspace(&store, &AutonomyConfig::default());
            let task = fixture_task(&store, workspace.workspace_id, "Bounded");
            let result = store.create_suggestion(&focus_suggestion(
                workspace.workspace_id,
                task.task_id,
                confidence,
            ));
            let in_range = confidence.is_finite() && (0.0..=1.0).contains(&confidence);
            prop_assert_eq!(result.is_ok(), in_range);
            if let Ok(created) = result {
                prop_assert_eq!(created.confidence, confidence);
            }
        }
    }
}
