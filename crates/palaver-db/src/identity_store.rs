use palaver_common::{AuthorId, Error, Result};
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::database::SharedConnection;

/// A user's self-chosen persona: the name and description the model should
/// use for them instead of their platform display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: AuthorId,
    pub name: String,
    pub description: String,
}

#[derive(Clone)]
pub struct IdentityStore {
    conn: SharedConnection,
}

impl IdentityStore {
    pub(crate) fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }

    /// Insert or replace both fields of a user's identity.
    pub fn set(&self, user_id: AuthorId, name: &str, description: &str) -> Result<()> {
        let conn = self.conn.lock()?;
        conn.execute(
            "INSERT INTO user_identities (user_id, name, description) VALUES (?, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                updated_at = datetime('now')",
            params![user_id.get(), name, description],
        )
        .map_err(|e| Error::Database(format!("failed to set identity: {e}")))?;

        debug!("identity for user {} set to {:?}", user_id, name);
        Ok(())
    }

    pub fn get(&self, user_id: AuthorId) -> Result<Option<Identity>> {
        let conn = self.conn.lock()?;
        conn.query_row(
            "SELECT name, description FROM user_identities WHERE user_id = ?",
            params![user_id.get()],
            |row| {
                Ok(Identity {
                    user_id,
                    name: row.get(0)?,
                    description: row.get(1)?,
                })
            },
        )
        .optional()
        .map_err(|e| Error::Database(format!("failed to read identity: {e}")))
    }
}
