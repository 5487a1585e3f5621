use std::ffi::OsStr;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

use jsonschema::JSONSchema;
use rusqlite::Connection;
use serde_json::Value;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_rk<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_rk"))
        .args(args)
        .stdin(Stdio::null())
        .output()
        .unwrap_or_else(|err| panic!("failed to execute rk binary: {err}"))
}

fn run_rk_with_stdin<I, S>(args: I, stdin: &str) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut child = Command::new(env!("CARGO_BIN_EXE_rk"))
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap_or_else(|err| panic!("failed to spawn rk binary: {err}"));
    if let Some(mut input) = child.stdin.take() {
        input
            .write_all(stdin.as_bytes())
            .unwrap_or_else(|err| panic!("failed to write rk stdin: {err}"));
    }
    child.wait_with_output().unwrap_or_else(|err| panic!("failed to wait for rk binary: {err}"))
}

fn stdout_json(output: &Output) -> Value {
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout).unwrap_or_else(|err| {
        panic!(
            "stdout is not valid JSON: {err}\nstdout:\n{stdout}\nstderr:\n{}",
            String::from_utf8_lossy(&output.stderr)
        )
    })
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_rk(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "rk command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }
    stdout_json(&output)
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn repo_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap_or_else(|err| panic!("failed to canonicalize repo root: {err}"))
}

fn read_json_file(path: &Path) -> Value {
    let body = fs::read_to_string(path)
        .unwrap_or_else(|err| panic!("failed to read JSON file {}: {err}", path.display()));
    serde_json::from_str(&body)
        .unwrap_or_else(|err| panic!("failed to parse JSON file {}: {err}", path.display()))
}

fn validate_schema(schema_file: &str, instance: &Value) {
    let schema_path = repo_root().join("contracts/v1/schemas").join(schema_file);
    let schema_json = read_json_file(&schema_path);
    let compiled = JSONSchema::compile(&schema_json)
        .unwrap_or_else(|err| panic!("failed to compile schema {}: {err}", schema_path.display()));

    let errors = compiled
        .validate(instance)
        .err()
        .map(|iter| iter.map(|err| err.to_string()).collect::<Vec<_>>());
    if let Some(errors) = errors {
        panic!("schema validation failed for {}:\n{}", schema_file, errors.join("\n"));
    }
}

fn seed_quotes(db: &Path) {
    let conn = Connection::open(db)
        .unwrap_or_else(|err| panic!("failed to open {}: {err}", db.display()));
    conn.execute_batch(
        "CREATE TABLE quotes (
             quote_no TEXT PRIMARY KEY,
             date TEXT,
             name TEXT,
             country TEXT
         );
         CREATE INDEX quotes_by_country ON quotes(country);
         INSERT INTO quotes(rowid, quote_no, date, name, country)
         VALUES (1, 'Q-1', '2025-01-05', 'Alice', 'US'),
                (2, 'Q-2', '2025-01-05', 'Bob', 'US'),
                (3, 'Q-3', NULL, 'Carol', 'CN');",
    )
    .unwrap_or_else(|err| panic!("failed to seed quotes table: {err}"));
}

fn column_names(db: &Path) -> Vec<String> {
    let conn = Connection::open(db)
        .unwrap_or_else(|err| panic!("failed to open {}: {err}", db.display()));
    let mut stmt = conn
        .prepare("SELECT name FROM pragma_table_info('quotes') ORDER BY cid")
        .unwrap_or_else(|err| panic!("failed to prepare table_info: {err}"));
    let names = stmt
        .query_map([], |row| row.get(0))
        .and_then(Iterator::collect)
        .unwrap_or_else(|err| panic!("failed to read table_info: {err}"));
    names
}

fn identifiers(db: &Path) -> Vec<(i64, String)> {
    let conn = Connection::open(db)
        .unwrap_or_else(|err| panic!("failed to open {}: {err}", db.display()));
    let mut stmt = conn
        .prepare("SELECT rowid, Id FROM quotes ORDER BY rowid")
        .unwrap_or_else(|err| panic!("failed to prepare identifier query: {err}"));
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
        .and_then(Iterator::collect)
        .unwrap_or_else(|err| panic!("failed to read identifiers: {err}"));
    rows
}

fn assign_args<'a>(db: &'a Path, extra: &[&'a str]) -> Vec<&'a str> {
    let mut args = vec!["--db", path_str(db), "--quiet", "assign", "--table", "quotes"];
    args.extend_from_slice(extra);
    args
}

// Test IDs: TCLI-001
#[test]
fn assign_promotes_identifier_and_report_matches_schema() {
    let sandbox = unique_temp_dir("retrokey-cli-assign");
    let db = sandbox.join("quotes.sqlite3");
    seed_quotes(&db);

    let report =
        run_json(assign_args(&db, &["--yes", "--today", "2025-06-01", "--format", "json"]));

    validate_schema("run-report.schema.json", &report);
    assert_eq!(as_str(&report, "contract_version"), "rk.v1");
    assert_eq!(as_str(&report, "final_state"), "primary_key_promoted");
    assert_eq!(as_str(&report, "run_date"), "20250601");
    assert_eq!(report["final_schema"]["primary_key"], serde_json::json!(["Id"]));
    assert_eq!(column_names(&db), ["Id", "quote_no", "date", "name", "country"]);
    assert_eq!(
        identifiers(&db),
        [
            (1, "KZ20250105001".to_string()),
            (2, "KZ20250105002".to_string()),
            (3, "KZ20250601900".to_string()),
        ]
    );

    let inspect = run_json(["--db", path_str(&db), "inspect", "--table", "quotes"]);
    validate_schema("inspect.schema.json", &inspect);
    assert_eq!(inspect["indexes"][0]["name"], "quotes_by_country");
    assert_eq!(inspect["unique_constraints"], serde_json::json!([["quote_no"]]));
}

// Test IDs: TCLI-002
#[test]
fn rerun_reports_the_same_digest() {
    let sandbox = unique_temp_dir("retrokey-cli-rerun");
    let db = sandbox.join("quotes.sqlite3");
    seed_quotes(&db);
    let args = assign_args(&db, &["--yes", "--today", "2025-06-01", "--format", "json"]);

    let first = run_json(&args);
    let second = run_json(&args);

    assert_eq!(first["assignment_digest"], second["assignment_digest"]);
    assert_eq!(second["dropped_existing_column"], Value::Bool(true));
    assert_eq!(as_str(&second, "final_state"), "primary_key_promoted");
}

// Test IDs: TCLI-003
#[test]
fn dry_run_verifies_without_touching_the_table() {
    let sandbox = unique_temp_dir("retrokey-cli-dry-run");
    let db = sandbox.join("quotes.sqlite3");
    seed_quotes(&db);

    let report = run_json(assign_args(
        &db,
        &["--dry-run", "--today", "2025-06-01", "--format", "json"],
    ));

    validate_schema("run-report.schema.json", &report);
    assert_eq!(report["dry_run"], Value::Bool(true));
    assert_eq!(as_str(&report, "final_state"), "verified");
    assert_eq!(as_str(&report, "sample_identifier"), "KZ20250105001");
    assert_eq!(column_names(&db), ["quote_no", "date", "name", "country"]);
}

// Test IDs: TCLI-004
#[test]
fn declined_confirmation_exits_without_changes() {
    let sandbox = unique_temp_dir("retrokey-cli-declined");
    let db = sandbox.join("quotes.sqlite3");
    seed_quotes(&db);

    let output = run_rk_with_stdin(assign_args(&db, &["--today", "2025-06-01"]), "n\n");

    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Continue? [y/N]"), "stderr:\n{stderr}");
    assert_eq!(column_names(&db), ["quote_no", "date", "name", "country"]);

    let output = run_rk_with_stdin(assign_args(&db, &["--today", "2025-06-01"]), "yes\n");
    assert!(output.status.success(), "stderr:\n{}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(column_names(&db)[0], "Id");
}

// Test IDs: TCLI-005
#[test]
fn yaml_config_supplies_settings_and_flags_override_it() {
    let sandbox = unique_temp_dir("retrokey-cli-config");
    let db = sandbox.join("quotes.sqlite3");
    seed_quotes(&db);
    let config = sandbox.join("retrokey.yaml");
    fs::write(&config, "table: quotes\nid_column: ref\nprefix: AB\ntoday: 2025-06-01\n")
        .unwrap_or_else(|err| panic!("failed to write config: {err}"));

    let report = run_json([
        "--db",
        path_str(&db),
        "--quiet",
        "assign",
        "--config",
        path_str(&config),
        "--prefix",
        "QT",
        "--yes",
        "--format",
        "json",
    ]);

    assert_eq!(as_str(&report, "sample_identifier"), "QT20250105001");
    assert_eq!(report["final_schema"]["primary_key"], serde_json::json!(["ref"]));
    assert_eq!(column_names(&db)[0], "ref");
}

// Test IDs: TCLI-006
#[test]
fn unknown_config_keys_are_rejected() {
    let sandbox = unique_temp_dir("retrokey-cli-bad-config");
    let db = sandbox.join("quotes.sqlite3");
    seed_quotes(&db);
    let config = sandbox.join("retrokey.yaml");
    fs::write(&config, "table: quotes\nprefx: AB\n")
        .unwrap_or_else(|err| panic!("failed to write config: {err}"));

    let output = run_rk(["--db", path_str(&db), "assign", "--config", path_str(&config), "--yes"]);

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("failed to parse config file"), "stderr:\n{stderr}");
    assert_eq!(column_names(&db), ["quote_no", "date", "name", "country"]);
}

// Test IDs: TCLI-007
#[test]
fn malformed_date_aborts_before_promotion() {
    let sandbox = unique_temp_dir("retrokey-cli-abort");
    let db = sandbox.join("quotes.sqlite3");
    seed_quotes(&db);
    Connection::open(&db)
        .and_then(|conn| conn.execute("UPDATE quotes SET date = 'soon' WHERE rowid = 2", []))
        .unwrap_or_else(|err| panic!("failed to corrupt fixture: {err}"));

    let output = run_rk(assign_args(&db, &["--yes", "--today", "2025-06-01", "--format", "json"]));

    assert_eq!(output.status.code(), Some(1));
    let report = stdout_json(&output);
    validate_schema("run-report.schema.json", &report);
    assert_eq!(as_str(&report, "final_state"), "aborted");
    assert_eq!(as_str(&report["failure"], "kind"), "verification");
    assert_eq!(report["row_errors"][0]["token"], 2);
    assert_eq!(column_names(&db), ["quote_no", "date", "name", "country"]);
}

// Test IDs: TCLI-008
#[test]
fn backup_is_written_before_the_run() {
    let sandbox = unique_temp_dir("retrokey-cli-backup");
    let db = sandbox.join("quotes.sqlite3");
    let backup = sandbox.join("backups/before.sqlite3");
    seed_quotes(&db);

    let output = run_rk(assign_args(
        &db,
        &["--yes", "--today", "2025-06-01", "--backup", path_str(&backup)],
    ));

    assert!(output.status.success(), "stderr:\n{}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("result:       promoted"), "stdout:\n{stdout}");
    assert_eq!(column_names(&backup), ["quote_no", "date", "name", "country"]);
    assert_eq!(column_names(&db)[0], "Id");
}

// Test IDs: TCLI-009
#[test]
fn inspect_of_missing_table_fails() {
    let sandbox = unique_temp_dir("retrokey-cli-missing");
    let db = sandbox.join("quotes.sqlite3");
    seed_quotes(&db);

    let output = run_rk(["--db", path_str(&db), "inspect", "--table", "invoices"]);

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("invoices"));
}

// Test IDs: TCLI-010
#[test]
fn mistyped_database_path_is_not_created() {
    let sandbox = unique_temp_dir("retrokey-cli-no-db");
    let db = sandbox.join("quotse.sqlite3");

    let inspect = run_rk(["--db", path_str(&db), "inspect", "--table", "quotes"]);
    let assign = run_rk(assign_args(&db, &["--yes", "--today", "2025-06-01"]));

    for output in [inspect, assign] {
        assert!(!output.status.success());
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(stderr.contains("does not exist"), "stderr:\n{stderr}");
    }
    assert!(!db.exists());
}
