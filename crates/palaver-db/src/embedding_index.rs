use std::cmp::Ordering;
use std::collections::HashSet;

use palaver_common::{AuthorId, Error, MessageId, Result, Turn};
use rusqlite::{ErrorCode, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::database::SharedConnection;

/// Cosine scores this close to 1.0 are treated as the query matching itself.
const SELF_MATCH_EPSILON: f32 = 1e-6;

/// A turn returned by similarity ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredTurn {
    pub turn: Turn,
    pub similarity: f32,
}

/// Embedding vectors keyed by the message id of the turn they describe.
#[derive(Clone)]
pub struct EmbeddingIndex {
    conn: SharedConnection,
}

impl EmbeddingIndex {
    pub(crate) fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }

    /// Store the embedding of one turn. Ephemeral turns cannot be addressed
    /// later and are skipped; the return value reports whether a row was stored.
    /// A second insert for the same id fails with [`Error::DuplicateEmbedding`].
    pub fn insert(
        &self,
        message_id: MessageId,
        author_id: AuthorId,
        content: &str,
        vector: &[f32],
    ) -> Result<bool> {
        if message_id.is_ephemeral() {
            debug!("not indexing ephemeral turn");
            return Ok(false);
        }
        if vector.is_empty() {
            return Err(Error::Database("embedding vector cannot be empty".into()));
        }

        let conn = self.conn.lock()?;
        conn.execute(
            "INSERT INTO embeddings (message_id, author_id, content, embedding, dimensions)
             VALUES (?, ?, ?, ?, ?)",
            params![
                message_id.get(),
                author_id.get(),
                content,
                embedding_to_blob(vector),
                vector.len() as i64,
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == ErrorCode::ConstraintViolation =>
            {
                Error::DuplicateEmbedding(message_id)
            }
            other => Error::Database(format!("failed to insert embedding: {other}")),
        })?;

        debug!("indexed embedding for message {}", message_id);
        Ok(true)
    }

    /// Delete the embedding for `message_id`. Returns whether one existed.
    pub fn remove(&self, message_id: MessageId) -> Result<bool> {
        let conn = self.conn.lock()?;
        let removed = conn
            .execute(
                "DELETE FROM embeddings WHERE message_id = ?",
                params![message_id.get()],
            )
            .map_err(|e| Error::Database(format!("failed to remove embedding: {e}")))?;
        Ok(removed > 0)
    }

    pub fn lookup(&self, message_id: MessageId) -> Result<Option<Vec<f32>>> {
        if message_id.is_ephemeral() {
            return Ok(None);
        }

        let conn = self.conn.lock()?;
        let blob: Option<Vec<u8>> = conn
            .query_row(
                "SELECT embedding FROM embeddings WHERE message_id = ?",
                params![message_id.get()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::Database(format!("failed to read embedding: {e}")))?;

        blob.as_deref().map(blob_to_embedding).transpose()
    }

    /// Like [`lookup`](Self::lookup), but absence is an [`Error::MissingEmbedding`].
    pub fn require(&self, message_id: MessageId) -> Result<Vec<f32>> {
        self.lookup(message_id)?
            .ok_or(Error::MissingEmbedding(message_id))
    }

    pub fn len(&self) -> Result<usize> {
        let conn = self.conn.lock()?;
        let count: i64 = conn
            .query_row("SELECT count(*) FROM embeddings", [], |row| row.get(0))
            .map_err(|e| Error::Database(format!("failed to count embeddings: {e}")))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Rank `candidates` by cosine similarity to `query`.
    ///
    /// Candidates without a stored embedding (or with a different
    /// dimensionality) are skipped. Exact self-matches and scores below
    /// `threshold` are dropped. Ties keep the order of `candidates`.
    pub fn most_similar(
        &self,
        query: &[f32],
        candidates: &[MessageId],
        threshold: f32,
        limit: usize,
    ) -> Result<Vec<ScoredTurn>> {
        let conn = self.conn.lock()?;
        let mut stmt = conn
            .prepare_cached(
                "SELECT author_id, content, embedding FROM embeddings WHERE message_id = ?",
            )
            .map_err(|e| Error::Database(format!("failed to prepare similarity query: {e}")))?;

        let mut seen = HashSet::new();
        let mut scored = Vec::new();

        for &message_id in candidates {
            if message_id.is_ephemeral() || !seen.insert(message_id) {
                continue;
            }

            let row = stmt
                .query_row(params![message_id.get()], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                    ))
                })
                .optional()
                .map_err(|e| Error::Database(format!("failed to read embedding: {e}")))?;

            let Some((author_id, content, blob)) = row else {
                continue;
            };

            let vector = blob_to_embedding(&blob)?;
            if vector.len() != query.len() {
                debug!(
                    "skipping message {}: dimension {} != {}",
                    message_id,
                    vector.len(),
                    query.len()
                );
                continue;
            }

            let similarity = cosine_similarity(query, &vector);
            if similarity >= 1.0 - SELF_MATCH_EPSILON || similarity < threshold {
                continue;
            }

            scored.push(ScoredTurn {
                turn: Turn::new(AuthorId::new(author_id), content, message_id),
                similarity,
            });
        }

        // sort_by is stable, so equal scores keep candidate order
        scored.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(Ordering::Equal)
        });
        scored.truncate(limit);

        Ok(scored)
    }
}

fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for v in embedding {
        bytes.extend(v.to_le_bytes());
    }
    bytes
}

fn blob_to_embedding(blob: &[u8]) -> Result<Vec<f32>> {
    if !blob.len().is_multiple_of(4) {
        return Err(Error::Database("invalid embedding blob length".into()));
    }

    let mut out = Vec::with_capacity(blob.len() / 4);
    for chunk in blob.chunks_exact(4) {
        out.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }
    Ok(out)
}

/// Cosine similarity in [-1, 1]; 0.0 for mismatched or zero-length vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0;
    let mut norm_a = 0.0;
    let mut norm_b = 0.0;

    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::{blob_to_embedding, cosine_similarity, embedding_to_blob};
    use crate::MemoryDb;
    use palaver_common::{AuthorId, Error, MessageId};

    fn index_with(vectors: &[(i64, Vec<f32>)]) -> MemoryDb {
        let db = MemoryDb::in_memory().expect("failed to create in-memory database");
        let messages = db.messages();
        let embeddings = db.embeddings();
        for (id, vector) in vectors {
            let content = format!("message {id}");
            messages
                .append(AuthorId::new(1), &content, MessageId::new(*id))
                .unwrap();
            embeddings
                .insert(MessageId::new(*id), AuthorId::new(1), &content, vector)
                .unwrap();
        }
        db
    }

    fn all_ids(db: &MemoryDb) -> Vec<MessageId> {
        db.messages()
            .all()
            .unwrap()
            .into_iter()
            .map(|t| t.message_id)
            .collect()
    }

    #[test]
    fn lookup_returns_inserted_vector() {
        let db = index_with(&[(1, vec![0.25, -0.5, 0.125])]);
        let stored = db.embeddings().lookup(MessageId::new(1)).unwrap().unwrap();
        assert_eq!(stored, vec![0.25, -0.5, 0.125]);
    }

    #[test]
    fn second_insert_for_same_id_is_rejected() {
        let db = index_with(&[(1, vec![1.0, 0.0])]);
        let err = db
            .embeddings()
            .insert(MessageId::new(1), AuthorId::new(1), "again", &[0.0, 1.0])
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateEmbedding(id) if id == MessageId::new(1)));
    }

    #[test]
    fn ephemeral_and_empty_vectors_are_not_stored() {
        let db = MemoryDb::in_memory().unwrap();
        let embeddings = db.embeddings();
        assert!(
            !embeddings
                .insert(MessageId::EPHEMERAL, AuthorId::new(1), "spoken", &[1.0])
                .unwrap()
        );
        assert!(
            embeddings
                .insert(MessageId::new(3), AuthorId::new(1), "empty", &[])
                .is_err()
        );
        assert!(embeddings.is_empty().unwrap());
    }

    #[test]
    fn require_reports_missing_embedding() {
        let db = MemoryDb::in_memory().unwrap();
        let err = db.embeddings().require(MessageId::new(9)).unwrap_err();
        assert!(matches!(err, Error::MissingEmbedding(id) if id == MessageId::new(9)));
    }

    #[test]
    fn remove_is_noop_when_absent() {
        let db = index_with(&[(1, vec![1.0])]);
        assert!(db.embeddings().remove(MessageId::new(1)).unwrap());
        assert!(!db.embeddings().remove(MessageId::new(1)).unwrap());
    }

    #[test]
    fn most_similar_excludes_self_and_sorts_descending() {
        let db = index_with(&[
            (1, vec![1.0, 0.0, 0.0]),
            (2, vec![0.9, 0.1, 0.0]),
            (3, vec![0.0, 1.0, 0.0]),
            (4, vec![0.7, 0.7, 0.0]),
        ]);
        let query = db.embeddings().lookup(MessageId::new(1)).unwrap().unwrap();

        let results = db
            .embeddings()
            .most_similar(&query, &all_ids(&db), -1.0, 10)
            .unwrap();

        let ids: Vec<i64> = results.iter().map(|r| r.turn.message_id.get()).collect();
        assert_eq!(ids, vec![2, 4, 3]);
        for pair in results.windows(2) {
            assert!(pair[0].similarity >= pair[1].similarity);
        }
    }

    #[test]
    fn most_similar_applies_threshold_inclusively_and_limit() {
        let db = index_with(&[
            (1, vec![1.0, 0.0]),
            (2, vec![0.0, 1.0]),
            (3, vec![1.0, 1.0]),
        ]);
        let query = vec![1.0, 0.0];
        let expected = cosine_similarity(&query, &[1.0, 1.0]);

        let results = db
            .embeddings()
            .most_similar(&query, &all_ids(&db), expected, 10)
            .unwrap();
        // id 1 is an exact self-match and id 2 is below the threshold
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].turn.message_id, MessageId::new(3));

        let limited = db
            .embeddings()
            .most_similar(&[0.5, 0.5], &all_ids(&db), -1.0, 2)
            .unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn most_similar_skips_candidates_without_embeddings() {
        let db = index_with(&[(1, vec![1.0, 0.2])]);
        db.messages()
            .append(AuthorId::new(2), "never embedded", MessageId::new(2))
            .unwrap();
        db.embeddings()
            .insert(MessageId::new(5), AuthorId::new(2), "wrong dims", &[1.0, 0.0, 0.0])
            .unwrap();

        let results = db
            .embeddings()
            .most_similar(
                &[1.0, 0.0],
                &[MessageId::new(1), MessageId::new(2), MessageId::new(5)],
                0.0,
                10,
            )
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].turn.content, "message 1");
    }

    #[test]
    fn ties_keep_candidate_order() {
        let db = index_with(&[(7, vec![0.0, 1.0]), (3, vec![0.0, 1.0])]);
        let results = db
            .embeddings()
            .most_similar(&[1.0, 1.0], &[MessageId::new(7), MessageId::new(3)], 0.0, 10)
            .unwrap();
        let ids: Vec<i64> = results.iter().map(|r| r.turn.message_id.get()).collect();
        assert_eq!(ids, vec![7, 3]);
    }

    #[test]
    fn blob_rejects_truncated_input() {
        let blob = embedding_to_blob(&[1.5, -2.0]);
        assert_eq!(blob_to_embedding(&blob).unwrap(), vec![1.5, -2.0]);
        assert!(blob_to_embedding(&blob[..5]).is_err());
    }

    #[test]
    fn cosine_handles_degenerate_vectors() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
    }
}
