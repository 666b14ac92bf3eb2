//! SQL migration definitions for the burnwatch results database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: predictions",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Latest classifier output, one row per index raster
CREATE TABLE IF NOT EXISTS predictions (
    path TEXT NOT NULL,
    prob REAL NOT NULL,
    pred INTEGER NOT NULL
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Inference run history",
            sql: r#"
CREATE TABLE IF NOT EXISTS inference_runs (
    id          TEXT PRIMARY KEY,
    started_at  TEXT NOT NULL,
    model_path  TEXT NOT NULL,
    row_count   INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_inference_runs_started ON inference_runs(started_at);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
