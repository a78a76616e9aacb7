use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use jsonschema::JSONSchema;
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

fn run_zk<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_zk"))
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute zk binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_zk(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "zk command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn as_i64(value: &Value, key: &str) -> i64 {
    value
        .get(key)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
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

fn validate_schema(schema_file: &str, instance: &Value) {
    let schema_path = repo_root().join("contracts/v1/schemas").join(schema_file);
    let body = fs::read_to_string(&schema_path)
        .unwrap_or_else(|err| panic!("failed to read schema {}: {err}", schema_path.display()));
    let schema_json: Value = serde_json::from_str(&body)
        .unwrap_or_else(|err| panic!("failed to parse schema {}: {err}", schema_path.display()));
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

#[test]
fn db_commands_cover_migrate_integrity_backup_restore_and_export() {
    let sandbox = unique_temp_dir("zakatkernel-cli-db");
    let db = sandbox.join("kernel.sqlite3");
    let export_dir = sandbox.join("export");
    let backup_file = sandbox.join("backup.sqlite3");

    let schema_before = run_json(["--db", path_str(&db), "db", "schema-version"]);
    assert_eq!(as_i64(&schema_before, "current_version"), 0);
    validate_schema("db-schema-version.response.schema.json", &schema_before);

    let dry_run = run_json(["--db", path_str(&db), "db", "migrate", "--dry-run"]);
    assert_eq!(as_i64(&dry_run, "current_version"), 0);
    assert_eq!(
        dry_run
            .get("would_apply_versions")
            .and_then(Value::as_array)
            .map(std::vec::Vec::len)
            .unwrap_or_default(),
        1
    );
    validate_schema("db-migrate.response.schema.json", &dry_run);

    let schema_after_dry_run = run_json(["--db", path_str(&db), "db", "schema-version"]);
    assert_eq!(as_i64(&schema_after_dry_run, "current_version"), 0);

    let migrate = run_json(["--db", path_str(&db), "db", "migrate"]);
    assert_eq!(as_i64(&migrate, "after_version"), 1);
    validate_schema("db-migrate.response.schema.json", &migrate);

    let _item = run_json([
        "--db",
        path_str(&db),
        "item",
        "add",
        "--user",
        "amira",
        "--category",
        "cash",
        "--value-minor",
        "250000",
        "--currency",
        "USD",
    ]);

    let integrity = run_json(["--db", path_str(&db), "db", "integrity-check"]);
    assert!(integrity.get("quick_check_ok").and_then(Value::as_bool).unwrap_or(false));

    let backup =
        run_json(["--db", path_str(&db), "db", "backup", "--out", path_str(&backup_file)]);
    assert_eq!(as_str(&backup, "status"), "ok");
    assert!(Path::new(as_str(&backup, "backup_path")).exists());

    let export = run_json(["--db", path_str(&db), "db", "export", "--out", path_str(&export_dir)]);
    let manifest = export
        .get("manifest")
        .unwrap_or_else(|| panic!("export should include manifest: {export}"));
    let files = manifest
        .get("files")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("manifest.files should be an array: {manifest}"));
    assert_eq!(files.len(), 4);
    assert!(export_dir.join("manifest.json").exists());
    assert!(export_dir.join("items.ndjson").exists());

    let restore = run_json(["--db", path_str(&db), "db", "restore", "--in", path_str(&backup_file)]);
    assert_eq!(as_i64(&restore, "current_version"), 1);

    let _ = fs::remove_dir_all(&sandbox);
}

#[test]
fn valuation_flags_shape_aggregated_wealth() {
    let sandbox = unique_temp_dir("zakatkernel-cli-wealth");
    let db = sandbox.join("kernel.sqlite3");

    let security = run_json([
        "--db",
        path_str(&db),
        "item",
        "add",
        "--user",
        "amira",
        "--category",
        "security",
        "--value-minor",
        "1000000",
        "--currency",
        "USD",
        "--passive",
        "true",
    ]);
    assert_eq!(security.get("is_passive_holding").and_then(Value::as_bool), Some(true));

    // Restricted access is the category's suggested default.
    let retirement = run_json([
        "--db",
        path_str(&db),
        "item",
        "add",
        "--user",
        "amira",
        "--category",
        "retirement-account",
        "--value-minor",
        "100000",
        "--currency",
        "USD",
    ]);
    assert_eq!(retirement.get("is_restricted_access").and_then(Value::as_bool), Some(true));

    // Passive security contributes at 30%, restricted retirement at zero.
    let summary = run_json(["--db", path_str(&db), "wealth", "aggregate", "--user", "amira"]);
    assert_eq!(as_i64(&summary, "total_minor"), 300_000);
    assert_eq!(as_i64(&summary, "zakatable_minor"), 300_000);

    let breakdown = summary
        .get("breakdown")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("summary should include a breakdown: {summary}"));
    assert_eq!(breakdown.len(), 2);

    let _ = fs::remove_dir_all(&sandbox);
}

#[test]
fn interruption_discards_the_open_draft() {
    let sandbox = unique_temp_dir("zakatkernel-cli-interrupt");
    let db = sandbox.join("kernel.sqlite3");
    let start = "2026-01-01T00:00:00Z";
    let later = "2026-04-11T00:00:00Z";

    let _quote = run_json([
        "--db",
        path_str(&db),
        "price",
        "set",
        "--commodity",
        "silver",
        "--price-minor-per-gram",
        "800",
        "--currency",
        "USD",
        "--as-of",
        start,
    ]);

    let cash = run_json([
        "--db",
        path_str(&db),
        "item",
        "add",
        "--user",
        "amira",
        "--category",
        "cash",
        "--value-minor",
        "600000",
        "--currency",
        "USD",
        "--as-of",
        start,
    ]);
    let item_id = as_str(&cash, "item_id").to_string();

    let started = run_json(["--db", path_str(&db), "cycle", "detect", "--user", "amira", "--as-of", start]);
    assert_eq!(as_str(&started, "event"), "started");
    validate_schema("cycle-detect.response.schema.json", &started);

    let _update = run_json([
        "--db",
        path_str(&db),
        "item",
        "update",
        "--item-id",
        &item_id,
        "--value-minor",
        "400000",
        "--as-of",
        later,
    ]);

    let interrupted =
        run_json(["--db", path_str(&db), "cycle", "detect", "--user", "amira", "--as-of", later]);
    assert_eq!(as_str(&interrupted, "event"), "interrupted");
    assert!(interrupted.get("record").map(Value::is_null).unwrap_or(false));
    validate_schema("cycle-detect.response.schema.json", &interrupted);

    // With the draft gone and wealth still below the threshold, nothing restarts.
    let idle = run_json(["--db", path_str(&db), "cycle", "detect", "--user", "amira", "--as-of", later]);
    assert_eq!(as_str(&idle, "event"), "idle");

    let _ = fs::remove_dir_all(&sandbox);
}

#[test]
fn correction_loop_yields_the_five_entry_ledger() {
    let sandbox = unique_temp_dir("zakatkernel-cli-lifecycle");
    let db = sandbox.join("kernel.sqlite3");
    let start = "2026-01-01T00:00:00Z";
    let completion = "2027-01-05T00:00:00Z";

    let _quote = run_json([
        "--db",
        path_str(&db),
        "price",
        "set",
        "--commodity",
        "silver",
        "--price-minor-per-gram",
        "800",
        "--currency",
        "USD",
        "--as-of",
        start,
    ]);

    let _cash = run_json([
        "--db",
        path_str(&db),
        "item",
        "add",
        "--user",
        "amira",
        "--category",
        "cash",
        "--value-minor",
        "600000",
        "--currency",
        "USD",
        "--as-of",
        start,
    ]);

    let started =
        run_json(["--db", path_str(&db), "cycle", "detect", "--user", "amira", "--as-of", start]);
    assert_eq!(as_str(&started, "event"), "started");
    let record = started
        .get("record")
        .unwrap_or_else(|| panic!("started detection should carry a record: {started}"));
    let record_id = as_str(record, "record_id").to_string();

    // Premature finalize without the acknowledgement is refused.
    let premature = run_zk([
        "--db",
        path_str(&db),
        "record",
        "finalize",
        "--record-id",
        &record_id,
        "--actor",
        "amira",
        "--as-of",
        start,
    ]);
    assert!(!premature.status.success());

    let finalized = run_json([
        "--db",
        path_str(&db),
        "record",
        "finalize",
        "--record-id",
        &record_id,
        "--actor",
        "amira",
        "--as-of",
        completion,
    ]);
    assert_eq!(as_str(&finalized, "status"), "finalized");
    assert_eq!(as_i64(&finalized, "obligation_minor"), 15_000);

    // A finalized record is no longer deletable.
    let delete = run_zk(["--db", path_str(&db), "record", "delete", "--record-id", &record_id]);
    assert!(!delete.status.success());

    let unlocked = run_json([
        "--db",
        path_str(&db),
        "record",
        "unlock",
        "--record-id",
        &record_id,
        "--actor",
        "amira",
        "--justification",
        "corrected clerical entry error",
        "--as-of",
        completion,
    ]);
    assert_eq!(as_str(&unlocked, "status"), "unlocked");

    let edited = run_json([
        "--db",
        path_str(&db),
        "record",
        "edit",
        "--record-id",
        &record_id,
        "--actor",
        "amira",
        "--aggregate-minor",
        "640000",
        "--as-of",
        completion,
    ]);
    assert_eq!(as_i64(&edited, "aggregate_minor"), 640_000);
    assert_eq!(as_i64(&edited, "obligation_minor"), 16_000);

    let refinalized = run_json([
        "--db",
        path_str(&db),
        "record",
        "refinalize",
        "--record-id",
        &record_id,
        "--actor",
        "amira",
        "--as-of",
        completion,
    ]);
    assert_eq!(as_str(&refinalized, "status"), "finalized");

    let audit = run_json(["--db", path_str(&db), "record", "audit", "--record-id", &record_id]);
    validate_schema("record-audit.response.schema.json", &audit);
    let entries = audit
        .get("entries")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("audit payload should carry entries: {audit}"));
    let kinds = entries
        .iter()
        .map(|entry| as_str(entry, "kind").to_string())
        .collect::<Vec<_>>();
    assert_eq!(kinds, ["created", "finalized", "unlocked", "edited", "refinalized"]);

    let edited_entry = &entries[3];
    assert!(edited_entry.get("before").map(|v| !v.is_null()).unwrap_or(false));
    assert!(edited_entry.get("after").map(|v| !v.is_null()).unwrap_or(false));

    let _ = fs::remove_dir_all(&sandbox);
}

#[test]
fn methodology_selection_changes_the_threshold_basis() {
    let sandbox = unique_temp_dir("zakatkernel-cli-methodology");
    let db = sandbox.join("kernel.sqlite3");
    let as_of = "2026-01-01T00:00:00Z";

    for (commodity, price) in [("gold", "6500"), ("silver", "800")] {
        let _ = run_json([
            "--db",
            path_str(&db),
            "price",
            "set",
            "--commodity",
            commodity,
            "--price-minor-per-gram",
            price,
            "--currency",
            "USD",
            "--as-of",
            as_of,
        ]);
    }

    // Default methodology derives the threshold from silver.
    let silver_threshold =
        run_json(["--db", path_str(&db), "threshold", "compute", "--user", "amira", "--as-of", as_of]);
    assert_eq!(as_i64(&silver_threshold, "value_minor"), 489_888);

    let settings = run_json([
        "--db",
        path_str(&db),
        "methodology",
        "set",
        "--user",
        "amira",
        "--name",
        "shafii",
        "--base-currency",
        "USD",
    ]);
    assert_eq!(
        settings.get("methodology").and_then(|m| m.get("methodology")).and_then(Value::as_str),
        Some("shafii")
    );

    let gold_threshold =
        run_json(["--db", path_str(&db), "threshold", "compute", "--user", "amira", "--as-of", as_of]);
    assert_eq!(as_i64(&gold_threshold, "value_minor"), 568_620);

    let shown = run_json(["--db", path_str(&db), "methodology", "show", "--user", "amira"]);
    assert_eq!(
        shown
            .get("config")
            .and_then(|c| c.get("rate_bp"))
            .and_then(Value::as_i64),
        Some(250)
    );

    let quotes = run_json(["--db", path_str(&db), "price", "show"]);
    assert!(quotes.get("gold").map(|v| !v.is_null()).unwrap_or(false));
    assert!(quotes.get("silver").map(|v| !v.is_null()).unwrap_or(false));

    let _ = fs::remove_dir_all(&sandbox);
}

#[test]
fn record_commands_reject_non_ulid_identifiers() {
    let sandbox = unique_temp_dir("zakatkernel-cli-ulid");
    let db = sandbox.join("kernel.sqlite3");

    let output =
        run_zk(["--db", path_str(&db), "record", "audit", "--record-id", "not-a-ulid"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("invalid ULID"), "unexpected stderr: {stderr}");

    let _ = fs::remove_dir_all(&sandbox);
}
