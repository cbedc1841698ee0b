#![allow(clippy::single_match_else, clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use jsonschema::JSONSchema;
use serde_json::Value;
use ulid::Ulid;

fn nova_binary_path() -> PathBuf {
    match std::env::var("CARGO_BIN_EXE_nova") {
        Ok(value) => PathBuf::from(value),
        Err(_) => {
            let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../target/debug/nova");
            if !path.exists() {
                let status = Command::new("cargo")
                    .args(["build", "-p", "nova-agent-cli", "--bin", "nova"])
                    .status();
                match status {
                    Ok(value) if value.success() => {}
                    Ok(value) => panic!("failed to build nova binary (status={value})"),
                    Err(err) => panic!("failed to invoke cargo build: {err}"),
                }
            }
            path
        }
    }
}

fn temp_db_path(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!("nova-cli-{label}-{}.sqlite3", Ulid::new()))
}

fn nova_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(nova_binary_path());
    command.arg("--db").arg(db_path);
    command.env_remove("NOVA_ORACLE").env_remove("NOVA_AUTO_CONFIDENCE");
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run nova command {:?}: {err}", args),
    }
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn success_json(output: &Output) -> Value {
    assert!(
        output.status.success(),
        "command failed\nstderr={}",
        String::from_utf8_lossy(&output.stderr)
    );
    stdout_json(output)
}

fn schema_errors(schema_file: &str, value: &Value) -> Option<Vec<String>> {
    let path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../contracts/v1/schemas")
        .join(schema_file);
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) => panic!("failed to read schema {}: {err}", path.display()),
    };
    let mut schema: Value = match serde_json::from_str(&raw) {
        Ok(schema) => schema,
        Err(err) => panic!("schema {schema_file} is not JSON: {err}"),
    };
    // jsonschema 0.18 cannot resolve a relative root `$id` without a base URL;
    // the contract schemas have no `$ref`, so the id does not affect validation.
    if let Some(object) = schema.as_object_mut() {
        object.remove("$id");
    }
    let compiled = JSONSchema::compile(&schema)
        .unwrap_or_else(|err| panic!("schema {schema_file} failed to compile: {err}"));
    compiled
        .validate(value)
        .err()
        .map(|iter| iter.map(|err| err.to_string()).collect::<Vec<_>>())
}

fn assert_schema(schema_file: &str, value: &Value) {
    if let Some(errors) = schema_errors(schema_file, value) {
        panic!("{schema_file} violations: {errors:?}\nvalue={value:#}");
    }
}

fn string_field(value: &Value, field: &str) -> String {
    match value.get(field).and_then(Value::as_str) {
        Some(raw) => raw.to_string(),
        None => panic!("missing string field `{field}` in {value:#}"),
    }
}

#[test]
fn help_contract_lists_expected_subcommands() {
    let output = match Command::new(nova_binary_path()).arg("--help").output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in [
        "workspace",
        "user",
        "task",
        "suggestion",
        "audit",
        "autonomy",
        "engine",
        "meeting",
        "extract",
    ] {
        assert!(
            stdout.contains(required),
            "help output missing `{required}`:\n{stdout}"
        );
    }
}

#[test]
fn scan_apply_and_undo_match_contract_schemas() {
    let db = temp_db_path("contracts");

    let workspace = success_json(&nova_output(&db, &["workspace", "create", "--name", "Contracts"]));
    let workspace_id = string_field(&workspace, "workspace_id");

    success_json(&nova_output(
        &db,
        &[
            "task",
            "add",
            "--workspace-id",
            &workspace_id,
            "--title",
            "Wire the billing export",
            "--effort",
            "medium",
        ],
    ));

    let report = success_json(&nova_output(
        &db,
        &[
            "engine",
            "scan",
            "--workspace-id",
            &workspace_id,
            "--as-of",
            "2026-02-07T12:00:00Z",
        ],
    ));
    assert_schema("scan-report.schema.json", &report);
    assert_eq!(report["counts"]["pending"], Value::from(1));

    let pending = success_json(&nova_output(
        &db,
        &["suggestion", "pending", "--workspace-id", &workspace_id],
    ));
    let Some(items) = pending.as_array() else {
        panic!("pending output is not an array: {pending:#}");
    };
    assert_eq!(items.len(), 1);
    assert_schema("suggestion.schema.json", &items[0]);
    assert_eq!(items[0]["kind"], Value::from("set_focus_time"));
    let suggestion_id = string_field(&items[0], "suggestion_id");

    let audit = success_json(&nova_output(
        &db,
        &["suggestion", "apply", "--suggestion-id", &suggestion_id],
    ));
    assert_schema("audit-record.schema.json", &audit);
    assert_eq!(audit["action_type"], Value::from("agent_set_focus_time"));
    assert!(audit["before"].is_object());
    assert!(audit["after"].is_object());

    let again = nova_output(&db, &["suggestion", "apply", "--suggestion-id", &suggestion_id]);
    assert!(!again.status.success());
    let stderr = String::from_utf8_lossy(&again.stderr);
    assert!(
        stderr.contains("already_disposed"),
        "unexpected stderr: {stderr}"
    );

    let audit_id = string_field(&audit, "audit_id");
    let undo = success_json(&nova_output(&db, &["audit", "undo", "--audit-id", &audit_id]));
    assert_schema("audit-record.schema.json", &undo);
    assert_eq!(undo["action_type"], Value::from("agent_undo"));
    assert_eq!(undo["reverts_audit_id"], Value::from(audit_id.as_str()));

    let repeat = nova_output(&db, &["audit", "undo", "--audit-id", &audit_id]);
    assert!(!repeat.status.success());
    assert!(String::from_utf8_lossy(&repeat.stderr).contains("already_undone"));

    let audits = success_json(&nova_output(
        &db,
        &["audit", "list", "--workspace-id", &workspace_id],
    ));
    let Some(entries) = audits.as_array() else {
        panic!("audit list is not an array: {audits:#}");
    };
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["action_type"], Value::from("agent_undo"));

    let _ = std::fs::remove_file(&db);
}

#[test]
fn reject_is_terminal_through_the_cli() {
    let db = temp_db_path("reject");

    let workspace = success_json(&nova_output(&db, &["workspace", "create", "--name", "Reject"]));
    let workspace_id = string_field(&workspace, "workspace_id");
    let task = success_json(&nova_output(
        &db,
        &[
            "task",
            "add",
            "--workspace-id",
            &workspace_id,
            "--title",
            "Rotate the signing keys",
        ],
    ));
    let task_id = string_field(&task, "task_id");
    let payload = format!(r#"{{"task_id":"{task_id}","suggested_priority":8}}"#);

    let outcome = success_json(&nova_output(
        &db,
        &[
            "suggestion",
            "create",
            "--workspace-id",
            &workspace_id,
            "--kind",
            "set_priority",
            "--payload-json",
            &payload,
            "--confidence",
            "0.9",
        ],
    ));
    assert_eq!(outcome["outcome"], Value::from("pending"));
    let suggestion_id = string_field(&outcome["suggestion"], "suggestion_id");

    let audit = success_json(&nova_output(
        &db,
        &["suggestion", "reject", "--suggestion-id", &suggestion_id],
    ));
    assert_schema("audit-record.schema.json", &audit);
    assert_eq!(audit["action_type"], Value::from("agent_suggestion_rejected"));

    let apply = nova_output(&db, &["suggestion", "apply", "--suggestion-id", &suggestion_id]);
    assert!(!apply.status.success());
    assert!(String::from_utf8_lossy(&apply.stderr).contains("already_disposed"));

    let shown = success_json(&nova_output(&db, &["task", "show", "--task-id", &task_id]));
    assert!(shown["priority"].is_null());

    let _ = std::fs::remove_file(&db);
}

#[test]
fn extract_with_disabled_oracle_reports_fallback() {
    let db = temp_db_path("extract");
    let output = nova_output(
        &db,
        &[
            "--oracle",
            "disabled",
            "extract",
            "tasks",
            "--input",
            "We need to fix login.\nAlice will update the docs.",
        ],
    );
    let value = success_json(&output);
    assert_schema("extraction.schema.json", &value);
    assert_eq!(value["outcome"], Value::from("fallback"));
    assert_eq!(value["reason"]["reason"], Value::from("oracle_unavailable"));
    assert!(!db.exists());
}

#[test]
fn unknown_suggestion_exits_with_not_found_code() {
    let db = temp_db_path("missing");
    let output = nova_output(
        &db,
        &[
            "suggestion",
            "apply",
            "--suggestion-id",
            "01J0SQQP7M70P6Y3R4T8D8G8M2",
        ],
    );
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("suggestion_not_found"));
    let _ = std::fs::remove_file(&db);
}
