#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SqliteMigration {
    pub version: i64,
    pub name: &'static str,
    pub up_sql: &'static str,
    pub down_sql: &'static str,
}

const MIGRATION_0001: SqliteMigration = SqliteMigration {
    version: 1,
    name: "initial_run_history",
    up_sql: r#"
CREATE TABLE IF NOT EXISTS runs (
    run_id INTEGER PRIMARY KEY AUTOINCREMENT,
    started_at_unix INTEGER NOT NULL,
    finished_at_unix INTEGER NOT NULL,
    overall_passed INTEGER NOT NULL,
    passed_count INTEGER NOT NULL,
    failed_count INTEGER NOT NULL,
    skipped_count INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS task_verdicts (
    run_id INTEGER NOT NULL REFERENCES runs (run_id) ON DELETE CASCADE,
    position INTEGER NOT NULL,
    task_name TEXT NOT NULL,
    status TEXT NOT NULL,
    failures_json TEXT NOT NULL,
    cleanup_errors_json TEXT NOT NULL,
    attempts INTEGER NOT NULL,
    duration_ms INTEGER,
    PRIMARY KEY (run_id, task_name)
);
"#,
    down_sql: r#"
DROP TABLE IF EXISTS task_verdicts;
DROP TABLE IF EXISTS runs;
"#,
};

const MIGRATION_0002: SqliteMigration = SqliteMigration {
    version: 2,
    name: "add_cleanup_flag_and_run_index",
    up_sql: r#"
ALTER TABLE runs ADD COLUMN has_cleanup_errors INTEGER NOT NULL DEFAULT 0;

CREATE INDEX IF NOT EXISTS idx_runs_started_at
    ON runs (started_at_unix DESC);
"#,
    down_sql: r#"
DROP INDEX IF EXISTS idx_runs_started_at;
ALTER TABLE runs DROP COLUMN has_cleanup_errors;
"#,
};

const MIGRATIONS: [SqliteMigration; 2] = [MIGRATION_0001, MIGRATION_0002];

pub fn migrations() -> &'static [SqliteMigration] {
    &MIGRATIONS
}

pub fn migration(version: i64) -> Option<&'static SqliteMigration> {
    MIGRATIONS.iter().find(|entry| entry.version == version)
}

pub fn current_schema_version() -> i64 {
    MIGRATIONS.last().map_or(0, |entry| entry.version)
}
