use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, params};

use crate::models::{CoreError, CoreErrorKind, RunReport, StatusCounts, TaskName, VerdictStatus};
use crate::persistence::{
    MigrationStore, PersistenceResult, RunId, RunStore, RunSummary, StoredVerdict,
};
use crate::sqlite::migrations::{SqliteMigration, current_schema_version, migration, migrations};

const MIGRATIONS_TABLE: &str = "vetpool_schema_migrations";

pub struct SqliteRunStore {
    database_path: PathBuf,
}

impl SqliteRunStore {
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
        }
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    pub fn planned_migrations(&self, from_version: i64) -> Vec<&'static SqliteMigration> {
        migrations()
            .iter()
            .filter(|entry| entry.version > from_version)
            .collect()
    }

    pub fn migrate_to_latest(&self) -> PersistenceResult<()> {
        self.apply_migration(current_schema_version())
    }

    fn with_connection<T>(
        &self,
        operation_name: &str,
        operation: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> PersistenceResult<T> {
        let mut connection = open_connection(&self.database_path)
            .map_err(|error| storage_error(operation_name, error))?;
        operation(&mut connection).map_err(|error| storage_error(operation_name, error))
    }
}

impl MigrationStore for SqliteRunStore {
    fn current_version(&self) -> PersistenceResult<i64> {
        self.with_connection("current_version", |connection| {
            ensure_migrations_table(connection)?;
            read_current_version(connection)
        })
    }

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()> {
        if target_version < 0 || target_version > current_schema_version() {
            return Err(storage_error_text(
                "apply_migration",
                format!("invalid migration target version '{target_version}'"),
            ));
        }

        self.with_connection("apply_migration", |connection| {
            ensure_migrations_table(connection)?;
            let current_version = read_current_version(connection)?;

            if target_version == current_version {
                // Tables may be missing even though the version is recorded;
                // every statement is idempotent or tolerated on replay.
                for version in 1..=target_version {
                    execute_batch_tolerant(connection, defined_migration(version)?.up_sql)?;
                }
                return Ok(());
            }

            if target_version > current_version {
                for version in (current_version + 1)..=target_version {
                    apply_up_migration(connection, defined_migration(version)?)?;
                }
            } else {
                for version in ((target_version + 1)..=current_version).rev() {
                    apply_down_migration(connection, defined_migration(version)?)?;
                }
            }

            Ok(())
        })
    }
}

impl RunStore for SqliteRunStore {
    fn save_run(&self, report: &RunReport) -> PersistenceResult<RunId> {
        let counts = report.counts();

        self.with_connection("save_run", |connection| {
            ensure_schema_ready(connection)?;
            let transaction = connection.transaction()?;

            transaction.execute(
                "
INSERT INTO runs (
    started_at_unix, finished_at_unix, overall_passed, passed_count, failed_count,
    skipped_count, has_cleanup_errors
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
",
                params![
                    to_unix_seconds(report.started_at)?,
                    to_unix_seconds(report.finished_at)?,
                    bool_to_sqlite(report.overall_passed()),
                    to_i64(counts.passed)?,
                    to_i64(counts.failed)?,
                    to_i64(counts.skipped)?,
                    bool_to_sqlite(report.has_cleanup_errors()),
                ],
            )?;
            let run_id = transaction.last_insert_rowid();

            {
                let mut statement = transaction.prepare(
                    "
INSERT INTO task_verdicts (
    run_id, position, task_name, status, failures_json, cleanup_errors_json, attempts,
    duration_ms
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
",
                )?;

                for (position, entry) in report.entries.iter().enumerate() {
                    let verdict = &entry.verdict;
                    let duration_ms = verdict
                        .duration()
                        .map(|duration| to_i64_u128(duration.as_millis()))
                        .transpose()?;

                    statement.execute(params![
                        run_id,
                        to_i64(position)?,
                        entry.task.as_str(),
                        verdict.status.as_str(),
                        to_json(&verdict.failures)?,
                        to_json(&verdict.cleanup_errors)?,
                        i64::from(verdict.attempts),
                        duration_ms,
                    ])?;
                }
            }

            transaction.commit()?;
            Ok(RunId(i64_to_u64(run_id)?))
        })
    }

    fn list_recent_runs(&self, limit: usize) -> PersistenceResult<Vec<RunSummary>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        self.with_connection("list_recent_runs", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(
                "
SELECT run_id, started_at_unix, finished_at_unix, overall_passed, passed_count,
       failed_count, skipped_count, has_cleanup_errors
FROM runs
ORDER BY started_at_unix DESC, run_id DESC
LIMIT ?1
",
            )?;
            let rows = statement.query_map(params![to_i64(limit)?], |row| {
                let run_id_raw: i64 = row.get(0)?;
                let started_at_unix: i64 = row.get(1)?;
                let finished_at_unix: i64 = row.get(2)?;
                let overall_passed: i64 = row.get(3)?;
                let passed: i64 = row.get(4)?;
                let failed: i64 = row.get(5)?;
                let skipped: i64 = row.get(6)?;
                let has_cleanup_errors: i64 = row.get(7)?;

                Ok(RunSummary {
                    id: RunId(i64_to_u64(run_id_raw)?),
                    started_at: from_unix_seconds(started_at_unix)?,
                    finished_at: from_unix_seconds(finished_at_unix)?,
                    overall_passed: sqlite_to_bool(overall_passed),
                    has_cleanup_errors: sqlite_to_bool(has_cleanup_errors),
                    counts: StatusCounts {
                        passed: i64_to_usize(passed)?,
                        failed: i64_to_usize(failed)?,
                        skipped: i64_to_usize(skipped)?,
                    },
                })
            })?;

            rows.collect()
        })
    }

    fn task_verdicts(&self, run: RunId) -> PersistenceResult<Vec<StoredVerdict>> {
        self.with_connection("task_verdicts", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(
                "
SELECT task_name, status, failures_json, cleanup_errors_json, attempts, duration_ms
FROM task_verdicts
WHERE run_id = ?1
ORDER BY position ASC
",
            )?;
            let rows = statement.query_map(params![run_id_to_i64(run)?], |row| {
                let task_raw: String = row.get(0)?;
                let status_raw: String = row.get(1)?;
                let failures_raw: String = row.get(2)?;
                let cleanup_raw: String = row.get(3)?;
                let attempts_raw: i64 = row.get(4)?;
                let duration_ms: Option<i64> = row.get(5)?;

                Ok(StoredVerdict {
                    task: TaskName::new(task_raw),
                    status: parse_verdict_status(&status_raw)?,
                    failures: from_json(&failures_raw)?,
                    cleanup_errors: from_json(&cleanup_raw)?,
                    attempts: u32::try_from(attempts_raw).map_err(|_| {
                        storage_error_sqlite("attempt count out of range in sqlite record")
                    })?,
                    duration: duration_ms
                        .map(|value| i64_to_u64(value).map(Duration::from_millis))
                        .transpose()?,
                })
            })?;

            rows.collect()
        })
    }

    fn prune_runs_older_than(&self, max_age: Duration) -> PersistenceResult<usize> {
        self.with_connection("prune_runs_older_than", |connection| {
            ensure_schema_ready(connection)?;
            let cutoff = SystemTime::now()
                .checked_sub(max_age)
                .unwrap_or(UNIX_EPOCH);
            let cutoff = to_unix_seconds(cutoff)?;

            let transaction = connection.transaction()?;
            transaction.execute(
                "
DELETE FROM task_verdicts
WHERE run_id IN (SELECT run_id FROM runs WHERE started_at_unix < ?1)
",
                params![cutoff],
            )?;
            let deleted = transaction.execute(
                "DELETE FROM runs WHERE started_at_unix < ?1",
                params![cutoff],
            )?;
            transaction.commit()?;
            Ok(deleted)
        })
    }
}

fn open_connection(database_path: &Path) -> rusqlite::Result<Connection> {
    if let Some(parent) = database_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|error| rusqlite::Error::ToSqlConversionFailure(Box::new(error)))?;
    }
    Connection::open(database_path)
}

fn ensure_migrations_table(connection: &Connection) -> rusqlite::Result<()> {
    connection.execute_batch(&format!(
        "
CREATE TABLE IF NOT EXISTS {MIGRATIONS_TABLE} (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at_unix INTEGER NOT NULL
);
"
    ))?;
    Ok(())
}

fn ensure_schema_ready(connection: &Connection) -> rusqlite::Result<()> {
    ensure_migrations_table(connection)?;
    let version = read_current_version(connection)?;
    if version <= 0 {
        return Err(storage_error_sqlite(
            "database schema is not initialized; apply migrations before recording runs",
        ));
    }
    Ok(())
}

fn read_current_version(connection: &Connection) -> rusqlite::Result<i64> {
    connection.query_row(
        &format!("SELECT COALESCE(MAX(version), 0) FROM {MIGRATIONS_TABLE}"),
        [],
        |row| row.get(0),
    )
}

fn defined_migration(version: i64) -> rusqlite::Result<&'static SqliteMigration> {
    migration(version).ok_or_else(|| {
        storage_error_sqlite(&format!("migration version '{version}' is not defined"))
    })
}

fn apply_up_migration(
    connection: &mut Connection,
    migration: &SqliteMigration,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    execute_batch_tolerant(&transaction, migration.up_sql)?;
    transaction.execute(
        &format!(
            "INSERT INTO {MIGRATIONS_TABLE} (version, name, applied_at_unix)
             VALUES (?1, ?2, strftime('%s', 'now'))"
        ),
        (migration.version, migration.name),
    )?;
    transaction.commit()?;
    Ok(())
}

/// Execute a SQL batch, tolerating "duplicate column name" errors from
/// `ALTER TABLE ADD COLUMN`, which is not idempotent in SQLite.
fn execute_batch_tolerant(connection: &Connection, sql: &str) -> rusqlite::Result<()> {
    match connection.execute_batch(sql) {
        Ok(()) => Ok(()),
        Err(e) if e.to_string().contains("duplicate column name") => Ok(()),
        Err(e) => Err(e),
    }
}

fn apply_down_migration(
    connection: &mut Connection,
    migration: &SqliteMigration,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    transaction.execute_batch(migration.down_sql)?;
    transaction.execute(
        &format!("DELETE FROM {MIGRATIONS_TABLE} WHERE version = ?1"),
        [migration.version],
    )?;
    transaction.commit()?;
    Ok(())
}

fn storage_error(operation: &str, error: rusqlite::Error) -> CoreError {
    storage_error_text(operation, error.to_string())
}

fn storage_error_sqlite(message: &str) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(std::io::Error::other(message.to_string())))
}

fn parse_verdict_status(raw: &str) -> rusqlite::Result<VerdictStatus> {
    raw.parse::<VerdictStatus>().map_err(|_| {
        storage_error_sqlite(&format!("unknown verdict status '{raw}' in sqlite record"))
    })
}

fn to_json<T: serde::Serialize>(value: &T) -> rusqlite::Result<String> {
    serde_json::to_string(value)
        .map_err(|error| storage_error_sqlite(&format!("failed to encode json column: {error}")))
}

fn from_json<T: serde::de::DeserializeOwned>(raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw)
        .map_err(|error| storage_error_sqlite(&format!("failed to decode json column: {error}")))
}

fn bool_to_sqlite(value: bool) -> i64 {
    if value { 1 } else { 0 }
}

fn sqlite_to_bool(value: i64) -> bool {
    value != 0
}

fn to_unix_seconds(value: SystemTime) -> rusqlite::Result<i64> {
    let duration = value.duration_since(UNIX_EPOCH).map_err(|error| {
        storage_error_sqlite(&format!("time before unix epoch is not supported: {error}"))
    })?;
    let seconds = i64::try_from(duration.as_secs())
        .map_err(|_| storage_error_sqlite("unix timestamp seconds exceed i64 range"))?;
    Ok(seconds)
}

fn from_unix_seconds(value: i64) -> rusqlite::Result<SystemTime> {
    if value < 0 {
        return Err(storage_error_sqlite(
            "negative unix timestamps are not supported",
        ));
    }
    let seconds = u64::try_from(value)
        .map_err(|_| storage_error_sqlite("failed to convert unix timestamp to u64"))?;
    Ok(UNIX_EPOCH + Duration::from_secs(seconds))
}

fn run_id_to_i64(value: RunId) -> rusqlite::Result<i64> {
    i64::try_from(value.0).map_err(|_| storage_error_sqlite("run id exceeds i64 range"))
}

fn i64_to_u64(value: i64) -> rusqlite::Result<u64> {
    u64::try_from(value).map_err(|_| storage_error_sqlite("negative value in sqlite record"))
}

fn i64_to_usize(value: i64) -> rusqlite::Result<usize> {
    usize::try_from(value).map_err(|_| storage_error_sqlite("count out of range in sqlite record"))
}

fn to_i64(value: usize) -> rusqlite::Result<i64> {
    i64::try_from(value).map_err(|_| storage_error_sqlite("value exceeds i64 range"))
}

fn to_i64_u128(value: u128) -> rusqlite::Result<i64> {
    i64::try_from(value).map_err(|_| storage_error_sqlite("duration exceeds i64 range"))
}

fn storage_error_text(operation: &str, message: impl AsRef<str>) -> CoreError {
    CoreError::new(
        CoreErrorKind::StorageFailure,
        format!("sqlite store '{operation}' failed: {}", message.as_ref()),
    )
}
