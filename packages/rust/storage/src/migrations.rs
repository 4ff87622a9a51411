//! SQL migration definitions for the Markwise cache database.
//!
//! Migrations are applied in order on database open. Each migration carries
//! its own `schema_migrations` insert so a partially applied batch is retried.

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
            description: "Initial schema: cache_entries keyed by (stage, url) hash",
            sql: r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One live row per (url, stage); `key` is the sha256 of both
CREATE TABLE IF NOT EXISTS cache_entries (
    key        TEXT PRIMARY KEY,
    url        TEXT NOT NULL,
    stage      TEXT NOT NULL CHECK (stage IN ('scrape', 'metadata')),
    payload    TEXT NOT NULL,
    created_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_url ON cache_entries(url);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Index expires_at for purge and stats",
            sql: r#"
CREATE INDEX IF NOT EXISTS idx_cache_entries_expires ON cache_entries(expires_at);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
