use palaver_common::{AuthorId, Error, MessageId, Result, Turn};
use rusqlite::{OptionalExtension, params};
use tracing::debug;

use crate::database::SharedConnection;

/// Append-only log of conversation turns, ordered by insertion.
///
/// Removing or editing a turn also drops its embedding in the same
/// transaction, so the embedding index never describes text the model no
/// longer sees.
#[derive(Clone)]
pub struct MessageStore {
    conn: SharedConnection,
}

impl MessageStore {
    pub(crate) fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }

    /// Insert a turn at the end of the log. No uniqueness check is performed.
    pub fn append(
        &self,
        author_id: AuthorId,
        content: &str,
        message_id: MessageId,
    ) -> Result<()> {
        let conn = self.conn.lock()?;
        conn.execute(
            "INSERT INTO message_history (author_id, content, message_id) VALUES (?, ?, ?)",
            params![author_id.get(), content, message_id.get()],
        )
        .map_err(|e| Error::Database(format!("failed to append turn: {e}")))?;

        debug!("appended turn {} by {}", message_id, author_id);
        Ok(())
    }

    pub fn append_turn(&self, turn: &Turn) -> Result<()> {
        self.append(turn.author_id, &turn.content, turn.message_id)
    }

    /// Replace a turn's content and invalidate its embedding. Returns whether a
    /// turn was changed.
    pub fn edit(&self, message_id: MessageId, new_content: &str) -> Result<bool> {
        if message_id.is_ephemeral() {
            debug!("ignoring edit of ephemeral turn");
            return Ok(false);
        }

        let mut conn = self.conn.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| Error::Database(format!("failed to begin edit: {e}")))?;
        let updated = tx
            .execute(
                "UPDATE message_history SET content = ? WHERE message_id = ?",
                params![new_content, message_id.get()],
            )
            .map_err(|e| Error::Database(format!("failed to edit turn: {e}")))?;
        tx.execute(
            "DELETE FROM embeddings WHERE message_id = ?",
            params![message_id.get()],
        )
        .map_err(|e| Error::Database(format!("failed to invalidate embedding: {e}")))?;
        tx.commit()
            .map_err(|e| Error::Database(format!("failed to commit edit: {e}")))?;

        Ok(updated > 0)
    }

    /// Delete a turn together with its embedding. Returns the number of turns
    /// removed.
    pub fn remove(&self, message_id: MessageId) -> Result<usize> {
        if message_id.is_ephemeral() {
            debug!("ignoring removal of ephemeral turn");
            return Ok(0);
        }

        let mut conn = self.conn.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| Error::Database(format!("failed to begin removal: {e}")))?;
        let removed = tx
            .execute(
                "DELETE FROM message_history WHERE message_id = ?",
                params![message_id.get()],
            )
            .map_err(|e| Error::Database(format!("failed to remove turn: {e}")))?;
        tx.execute(
            "DELETE FROM embeddings WHERE message_id = ?",
            params![message_id.get()],
        )
        .map_err(|e| Error::Database(format!("failed to remove embedding: {e}")))?;
        tx.commit()
            .map_err(|e| Error::Database(format!("failed to commit removal: {e}")))?;

        debug!("removed {} turn(s) with id {}", removed, message_id);
        Ok(removed)
    }

    /// Most recently appended turn.
    pub fn last(&self) -> Result<Option<Turn>> {
        let conn = self.conn.lock()?;
        conn.query_row(
            "SELECT author_id, content, message_id FROM message_history
             ORDER BY seq DESC LIMIT 1",
            [],
            row_to_turn,
        )
        .optional()
        .map_err(|e| Error::Database(format!("failed to read last turn: {e}")))
    }

    /// Point lookup of a turn by its platform message id.
    pub fn get(&self, message_id: MessageId) -> Result<Option<Turn>> {
        if message_id.is_ephemeral() {
            return Ok(None);
        }

        let conn = self.conn.lock()?;
        conn.query_row(
            "SELECT author_id, content, message_id FROM message_history
             WHERE message_id = ? ORDER BY seq DESC LIMIT 1",
            params![message_id.get()],
            row_to_turn,
        )
        .optional()
        .map_err(|e| Error::Database(format!("failed to read turn: {e}")))
    }

    /// The last `limit` turns, oldest first. A `limit` of 0 means no limit.
    pub fn recent(&self, limit: usize) -> Result<Vec<Turn>> {
        let sql_limit = if limit == 0 { -1 } else { limit as i64 };
        let conn = self.conn.lock()?;

        let mut stmt = conn
            .prepare(
                "SELECT author_id, content, message_id FROM message_history
                 ORDER BY seq DESC LIMIT ?",
            )
            .map_err(|e| Error::Database(format!("failed to prepare recent query: {e}")))?;

        let mut turns = stmt
            .query_map(params![sql_limit], row_to_turn)
            .map_err(|e| Error::Database(format!("failed to execute recent query: {e}")))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Database(format!("failed to collect recent rows: {e}")))?;

        turns.reverse();
        Ok(turns)
    }

    /// The whole log, oldest first.
    pub fn all(&self) -> Result<Vec<Turn>> {
        self.recent(0)
    }

    pub fn len(&self) -> Result<usize> {
        let conn = self.conn.lock()?;
        let count: i64 = conn
            .query_row("SELECT count(*) FROM message_history", [], |row| row.get(0))
            .map_err(|e| Error::Database(format!("failed to count turns: {e}")))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Delete every turn and every embedding.
    pub fn clear(&self) -> Result<()> {
        let mut conn = self.conn.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| Error::Database(format!("failed to begin clear: {e}")))?;
        tx.execute_batch("DELETE FROM message_history; DELETE FROM embeddings;")
            .map_err(|e| Error::Database(format!("failed to clear history: {e}")))?;
        tx.commit()
            .map_err(|e| Error::Database(format!("failed to commit clear: {e}")))
    }
}

fn row_to_turn(row: &rusqlite::Row<'_>) -> rusqlite::Result<Turn> {
    Ok(Turn {
        author_id: AuthorId::new(row.get(0)?),
        content: row.get(1)?,
        message_id: MessageId::new(row.get(2)?),
    })
}

#[cfg(test)]
mod tests {
    use crate::MemoryDb;
    use palaver_common::{AuthorId, MessageId, Turn};

    fn seeded(count: i64) -> MemoryDb {
        let db = MemoryDb::in_memory().expect("failed to create in-memory database");
        let messages = db.messages();
        for i in 1..=count {
            messages
                .append(AuthorId::new(100 + i), &format!("turn {i}"), MessageId::new(i))
                .expect("append should succeed");
        }
        db
    }

    fn ids(turns: &[Turn]) -> Vec<i64> {
        turns.iter().map(|t| t.message_id.get()).collect()
    }

    #[test]
    fn recent_returns_tail_in_chronological_order() {
        let db = seeded(5);
        let messages = db.messages();

        assert_eq!(ids(&messages.recent(3).unwrap()), vec![3, 4, 5]);
        assert_eq!(ids(&messages.recent(1).unwrap()), vec![5]);
        assert_eq!(ids(&messages.recent(50).unwrap()), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn recent_zero_means_no_limit() {
        let db = seeded(4);
        assert_eq!(ids(&db.messages().recent(0).unwrap()), vec![1, 2, 3, 4]);
        assert_eq!(db.messages().all().unwrap().len(), 4);
    }

    #[test]
    fn last_tracks_most_recent_append() {
        let db = MemoryDb::in_memory().unwrap();
        let messages = db.messages();
        assert!(messages.last().unwrap().is_none());

        messages
            .append(AuthorId::new(1), "first", MessageId::new(10))
            .unwrap();
        messages
            .append_turn(&Turn::ephemeral(AuthorId::new(2), "spoken"))
            .unwrap();

        let last = messages.last().unwrap().expect("log should not be empty");
        assert_eq!(last.content, "spoken");
        assert!(last.message_id.is_ephemeral());
    }

    #[test]
    fn insertion_order_wins_over_id_order() {
        let db = MemoryDb::in_memory().unwrap();
        let messages = db.messages();
        messages
            .append(AuthorId::new(1), "late id", MessageId::new(900))
            .unwrap();
        messages
            .append(AuthorId::new(1), "early id", MessageId::new(3))
            .unwrap();

        assert_eq!(ids(&messages.all().unwrap()), vec![900, 3]);
    }

    #[test]
    fn edit_replaces_content_and_drops_embedding() {
        let db = seeded(2);
        let messages = db.messages();
        let embeddings = db.embeddings();
        embeddings
            .insert(MessageId::new(2), AuthorId::new(102), "turn 2", &[1.0, 0.0])
            .unwrap();

        assert!(messages.edit(MessageId::new(2), "turn 2 (edited)").unwrap());
        assert_eq!(
            messages.get(MessageId::new(2)).unwrap().unwrap().content,
            "turn 2 (edited)"
        );
        assert!(embeddings.lookup(MessageId::new(2)).unwrap().is_none());
    }

    #[test]
    fn edit_of_missing_turn_is_noop() {
        let db = seeded(1);
        assert!(!db.messages().edit(MessageId::new(77), "nothing").unwrap());
        assert_eq!(db.messages().last().unwrap().unwrap().content, "turn 1");
    }

    #[test]
    fn remove_cascades_to_embedding() {
        let db = seeded(3);
        let embeddings = db.embeddings();
        embeddings
            .insert(MessageId::new(2), AuthorId::new(102), "turn 2", &[0.3, 0.4])
            .unwrap();

        assert_eq!(db.messages().remove(MessageId::new(2)).unwrap(), 1);
        assert!(embeddings.lookup(MessageId::new(2)).unwrap().is_none());
        assert_eq!(ids(&db.messages().all().unwrap()), vec![1, 3]);
    }

    #[test]
    fn sentinel_ids_are_not_addressable() {
        let db = MemoryDb::in_memory().unwrap();
        let messages = db.messages();
        messages
            .append_turn(&Turn::ephemeral(AuthorId::new(1), "one"))
            .unwrap();
        messages
            .append_turn(&Turn::ephemeral(AuthorId::new(1), "two"))
            .unwrap();

        assert_eq!(messages.remove(MessageId::EPHEMERAL).unwrap(), 0);
        assert!(!messages.edit(MessageId::EPHEMERAL, "x").unwrap());
        assert!(messages.get(MessageId::EPHEMERAL).unwrap().is_none());
        assert_eq!(messages.len().unwrap(), 2);
    }

    #[test]
    fn clear_empties_turns_and_embeddings() {
        let db = seeded(3);
        db.embeddings()
            .insert(MessageId::new(1), AuthorId::new(101), "turn 1", &[1.0])
            .unwrap();

        db.messages().clear().unwrap();

        assert!(db.messages().is_empty().unwrap());
        assert_eq!(db.embeddings().len().unwrap(), 0);
    }
}
