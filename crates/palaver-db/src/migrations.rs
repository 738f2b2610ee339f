use rusqlite::{Connection, params};
use tracing::info;

use palaver_common::{Error, Result};

/// Migration system for tracking and applying database schema changes.
///
/// Each migration has a version number and a SQL statement.
/// Migrations are applied in order and tracked in a `_migrations` table.
pub struct Migration {
    pub version: u32,
    pub name: &'static str,
    pub sql: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "message_history",
        sql: "CREATE TABLE IF NOT EXISTS message_history (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                author_id INTEGER NOT NULL,
                content TEXT NOT NULL,
                message_id INTEGER NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_message_history_message_id
                ON message_history(message_id);",
    },
    Migration {
        version: 2,
        name: "embeddings",
        sql: "CREATE TABLE IF NOT EXISTS embeddings (
                message_id INTEGER PRIMARY KEY,
                author_id INTEGER NOT NULL,
                content TEXT NOT NULL,
                embedding BLOB NOT NULL,
                dimensions INTEGER NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );",
    },
    Migration {
        version: 3,
        name: "user_identities",
        sql: "CREATE TABLE IF NOT EXISTS user_identities (
                user_id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );",
    },
];

/// Apply every migration newer than the recorded schema version.
pub fn run(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| Error::Database(format!("failed to create migrations table: {e}")))?;

    let current: u32 = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM _migrations", [], |row| {
            row.get(0)
        })
        .map_err(|e| Error::Database(format!("failed to read schema version: {e}")))?;

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        let tx = conn
            .transaction()
            .map_err(|e| Error::Database(format!("failed to begin migration: {e}")))?;
        tx.execute_batch(migration.sql).map_err(|e| {
            Error::Database(format!("migration {} failed: {e}", migration.name))
        })?;
        tx.execute(
            "INSERT INTO _migrations (version, name) VALUES (?, ?)",
            params![migration.version, migration.name],
        )
        .map_err(|e| Error::Database(format!("failed to record migration: {e}")))?;
        tx.commit()
            .map_err(|e| Error::Database(format!("failed to commit migration: {e}")))?;
        info!("applied migration {} ({})", migration.version, migration.name);
    }

    Ok(())
}
