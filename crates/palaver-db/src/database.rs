use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use palaver_common::{Error, Result};
use rusqlite::Connection;
use tracing::info;

use crate::embedding_index::EmbeddingIndex;
use crate::identity_store::IdentityStore;
use crate::message_store::MessageStore;
use crate::migrations;

/// A SQLite connection shared by the stores of one conversation database.
#[derive(Clone)]
pub struct SharedConnection {
    conn: Arc<Mutex<Connection>>,
}

impl SharedConnection {
    fn new(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Database("conversation database lock poisoned".into()))
    }
}

/// Persistent storage for one conversation: its turn log, the embeddings of
/// those turns, and per-user identities.
#[derive(Clone)]
pub struct MemoryDb {
    conn: SharedConnection,
}

impl MemoryDb {
    pub fn open(db_path: &Path) -> Result<Self> {
        info!("opening conversation database at {}", db_path.display());
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Database(format!("failed to open database: {e}")))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("failed to open in-memory database: {e}")))?;

        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: SharedConnection::new(conn),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> Result<()> {
        let mut conn = self.conn.lock()?;
        migrations::run(&mut conn)
    }

    pub fn messages(&self) -> MessageStore {
        MessageStore::new(self.conn.clone())
    }

    pub fn embeddings(&self) -> EmbeddingIndex {
        EmbeddingIndex::new(self.conn.clone())
    }

    pub fn identities(&self) -> IdentityStore {
        IdentityStore::new(self.conn.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryDb;
    use palaver_common::{AuthorId, MessageId};

    #[test]
    fn in_memory_creates_all_tables() {
        let db = MemoryDb::in_memory().expect("failed to create in-memory database");
        let conn = db.conn.lock().expect("lock should not be poisoned");

        for table in ["message_history", "embeddings", "user_identities"] {
            let exists: i64 = conn
                .query_row(
                    "SELECT count(*) FROM sqlite_master WHERE type='table' AND name=?",
                    [table],
                    |row| row.get(0),
                )
                .expect("failed to query sqlite_master");
            assert_eq!(exists, 1, "missing table {table}");
        }
    }

    #[test]
    fn open_persists_across_handles() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let path = dir.path().join("conversation.db");

        {
            let db = MemoryDb::open(&path).expect("open should succeed");
            db.messages()
                .append(AuthorId::new(5), "persist me", MessageId::new(1))
                .expect("append should succeed");
        }

        let reopened = MemoryDb::open(&path).expect("reopen should succeed");
        let last = reopened
            .messages()
            .last()
            .expect("last should load")
            .expect("log should not be empty");
        assert_eq!(last.content, "persist me");
    }
}
