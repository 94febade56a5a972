#![allow(clippy::single_match_else)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::Arc;

use jsonschema::JSONSchema;
use rusqlite::Connection;
use serde_json::{json, Value};
use temporal_history_core::{HistoryConfig, LogFailureSink, RecordValues};
use temporal_history_store_sqlite::SqliteHost;
use tempfile::TempDir;

fn repo_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap_or_else(|err| panic!("failed to canonicalize repo root: {err}"))
}

fn assert_schema(schema_name: &str, value: &Value) {
    let schema_path = repo_root().join("contracts/v1/schemas").join(schema_name);
    let body = fs::read_to_string(&schema_path)
        .unwrap_or_else(|err| panic!("failed to read {}: {err}", schema_path.display()));
    let schema: Value = serde_json::from_str(&body)
        .unwrap_or_else(|err| panic!("failed to parse {}: {err}", schema_path.display()));
    let compiled = JSONSchema::compile(&schema)
        .unwrap_or_else(|err| panic!("failed to compile {}: {err}", schema_path.display()));
    if let Some(errors) = compiled
        .validate(value)
        .err()
        .map(|iter| iter.map(|err| err.to_string()).collect::<Vec<_>>())
    {
        panic!(
            "schema validation failed for {}:\n{}",
            schema_path.display(),
            errors.join("\n")
        );
    }
}

fn fixture_db() -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap_or_else(|err| panic!("failed to create temp dir: {err}"));
    let db_path = dir.path().join("live.sqlite3");
    let conn = Connection::open(&db_path)
        .unwrap_or_else(|err| panic!("failed to open setup db: {err}"));
    if let Err(err) = conn.execute_batch(
        "CREATE TABLE users (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT UNIQUE,
            createdAt DATETIME,
            updatedAt DATETIME
         );
         CREATE INDEX idx_users_name ON users(name);
         INSERT INTO users (name, email) VALUES ('A', 'a@example.com');",
    ) {
        panic!("failed to seed live table: {err}");
    }
    (dir, db_path)
}

fn th_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(env!("CARGO_BIN_EXE_th"));
    command.arg("--db").arg(db_path);
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run th command {args:?}: {err}"),
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

#[test]
fn help_lists_expected_subcommands() {
    let output = match Command::new(env!("CARGO_BIN_EXE_th")).arg("--help").output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in ["schema", "history", "--db", "--log-level"] {
        assert!(
            stdout.contains(required),
            "expected help output to contain {required}; output={stdout}"
        );
    }
}

#[test]
fn schema_derive_emits_history_schema_json() {
    let (_dir, db_path) = fixture_db();

    let output = th_output(&db_path, &["schema", "derive", "--table", "users"]);
    assert!(output.status.success());
    let schema = stdout_json(&output);

    assert_eq!(schema["live_entity"], json!("users"));
    assert_eq!(schema["options"]["table_name"], json!("usersHistory"));
    assert_eq!(schema["archived_at"], json!("archivedAt"));
    let names: Vec<_> = schema["attributes"]
        .as_array()
        .map(|attributes| attributes.iter().map(|a| a["name"].clone()).collect())
        .unwrap_or_default();
    assert_eq!(
        names,
        vec![
            json!("id"),
            json!("name"),
            json!("email"),
            json!("createdAt"),
            json!("updatedAt"),
            json!("hid"),
            json!("archivedAt")
        ]
    );
    assert_eq!(schema["attributes"][2]["unique"], json!(false));
    assert_eq!(schema["options"]["indexes"].as_array().map(Vec::len), Some(1));
}

#[test]
fn schema_derive_underscored_switches_names() {
    let (_dir, db_path) = fixture_db();

    let output = th_output(&db_path, &["schema", "derive", "--table", "users", "--underscored"]);
    assert!(output.status.success());
    let schema = stdout_json(&output);
    assert_eq!(schema["options"]["table_name"], json!("users_histories"));
    assert_eq!(schema["archived_at"], json!("archived_at"));
}

#[test]
fn install_output_matches_contract_and_is_idempotent() {
    let (_dir, db_path) = fixture_db();

    let first = th_output(&db_path, &["history", "install", "--table", "users", "--full"]);
    assert!(
        first.status.success(),
        "stderr={}",
        String::from_utf8_lossy(&first.stderr)
    );
    let report = stdout_json(&first);
    assert_schema("history-install.schema.json", &report);
    assert_eq!(report["history_table"], json!("usersHistory"));
    assert_eq!(report["config"]["full"], json!(true));
    assert!(report["captured_events"]
        .as_array()
        .is_some_and(|events| events.contains(&json!("afterCreate"))));

    let second = th_output(&db_path, &["history", "install", "--table", "users", "--full"]);
    assert!(second.status.success());
    assert_eq!(stdout_json(&second), report);

    let conn = Connection::open(&db_path).unwrap_or_else(|err| panic!("failed to open db: {err}"));
    let update = conn.execute("UPDATE \"usersHistory\" SET name = 'X'", []);
    assert!(update.is_ok(), "empty table update touches no rows");
    let insert = conn.execute("INSERT INTO \"usersHistory\" (id, name) VALUES (1, 'A')", []);
    assert!(insert.is_ok());
    let update = conn.execute("UPDATE \"usersHistory\" SET name = 'X'", []);
    assert!(update.is_err());
}

#[test]
fn list_prints_snapshots_captured_by_the_host() {
    let (_dir, db_path) = fixture_db();

    {
        let mut host =
            SqliteHost::open(&db_path).unwrap_or_else(|err| panic!("failed to open host: {err}"));
        let live = host
            .introspect("users")
            .unwrap_or_else(|err| panic!("failed to introspect users: {err}"));
        if let Err(err) = host.bind_history(&live, HistoryConfig::default(), Arc::new(LogFailureSink)) {
            panic!("failed to bind history: {err}");
        }
        let changes = RecordValues::from([("name".to_string(), json!("B"))]);
        if let Err(err) = host.update("users", &json!(1), changes) {
            panic!("failed to update user: {err}");
        }
    }

    let output = th_output(&db_path, &["history", "list", "--table", "users", "--id", "1"]);
    assert!(
        output.status.success(),
        "stderr={}",
        String::from_utf8_lossy(&output.stderr)
    );
    let listed = stdout_json(&output);
    assert_schema("history-list.schema.json", &listed);
    assert_eq!(listed["rows"].as_array().map(Vec::len), Some(1));
    assert_eq!(listed["rows"][0]["name"], json!("A"));
    assert_eq!(listed["rows"][0]["email"], json!("a@example.com"));
    assert!(listed["rows"][0]["archivedAt"].is_string());

    let other = th_output(&db_path, &["history", "list", "--table", "users", "--id", "2"]);
    assert!(other.status.success());
    assert_eq!(stdout_json(&other)["rows"], json!([]));
}

#[test]
fn list_before_install_fails_with_stable_message() {
    let (_dir, db_path) = fixture_db();

    let output = th_output(&db_path, &["history", "list", "--table", "users"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("history table usersHistory is not installed"),
        "unexpected stderr={stderr}"
    );
}

#[test]
fn install_rejects_unknown_config_keys() {
    let (dir, db_path) = fixture_db();
    let config_path = dir.path().join("history.json");
    if let Err(err) = fs::write(&config_path, r#"{"blocking": false, "async": true}"#) {
        panic!("failed to write config: {err}");
    }

    let config_arg = config_path.to_string_lossy().to_string();
    let output = th_output(
        &db_path,
        &["history", "install", "--table", "users", "--config", &config_arg],
    );
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unknown field"), "unexpected stderr={stderr}");

    let conn = Connection::open(&db_path).unwrap_or_else(|err| panic!("failed to open db: {err}"));
    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'usersHistory'",
            [],
            |row| row.get(0),
        )
        .ok();
    assert_eq!(exists, None);
}
