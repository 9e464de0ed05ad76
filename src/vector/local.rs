//! Brute-force vector index stored in a local SQLite file.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rayon::prelude::*;
use rusqlite::Connection;

use super::{IndexStats, MetadataFilter, VectorIndex};
use crate::analysis::similarity::match_score;
use crate::error::{Error, Result};
use crate::types::{EmbeddingVector, Row, SimilarityMatch, EMBEDDING_DIM};

const COLLABORATOR: &str = "local index";

pub struct LocalIndex {
    conn: Arc<Mutex<Connection>>,
    name: String,
}

struct StoredVector {
    id: String,
    values: Vec<f32>,
    metadata: Row,
}

impl LocalIndex {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| {
            Error::unavailable(COLLABORATOR, format!("failed to open {}: {e}", path.display()))
        })?;
        let name = path
            .file_stem()
            .map_or_else(|| "vectors".to_string(), |s| s.to_string_lossy().into_owned());
        Self::with_connection(conn, name)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, "memory".into())
    }

    fn with_connection(conn: Connection, name: String) -> Result<Self> {
        conn.execute_batch(
            r#"
            -- Little-endian f32 values
            CREATE TABLE IF NOT EXISTS vectors (
                id TEXT PRIMARY KEY,
                vector BLOB NOT NULL,
                metadata TEXT NOT NULL
            );
        "#,
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            name,
        })
    }
}

fn encode(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn load_all(conn: &Connection) -> Result<Vec<StoredVector>> {
    let mut stmt = conn.prepare("SELECT id, vector, metadata FROM vectors ORDER BY rowid")?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut stored = Vec::with_capacity(rows.len());
    for (id, blob, metadata) in rows {
        let values = decode(&blob);
        if values.len() != EMBEDDING_DIM {
            tracing::warn!("Skipping vector {id} with {} dimensions", values.len());
            continue;
        }
        let metadata = serde_json::from_str::<Row>(&metadata).unwrap_or_default();
        stored.push(StoredVector { id, values, metadata });
    }
    Ok(stored)
}

#[async_trait]
impl VectorIndex for LocalIndex {
    async fn upsert(&self, id: &str, vector: &EmbeddingVector, metadata: Row) -> Result<()> {
        let metadata =
            serde_json::to_string(&metadata).map_err(|e| Error::invalid(e.to_string()))?;
        let conn = self
            .conn
            .lock()
            .map_err(|_| Error::unavailable(COLLABORATOR, "connection lock poisoned"))?;
        conn.execute(
            r#"INSERT INTO vectors (id, vector, metadata) VALUES (?1, ?2, ?3)
               ON CONFLICT(id) DO UPDATE SET
                   vector = excluded.vector,
                   metadata = excluded.metadata"#,
            (id, encode(vector.as_slice()), metadata),
        )?;
        Ok(())
    }

    async fn search(
        &self,
        vector: &EmbeddingVector,
        top_k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<SimilarityMatch>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let conn = Arc::clone(&self.conn);
        let query = vector.clone();
        let filter = filter.clone();

        tokio::task::spawn_blocking(move || {
            let stored = {
                let conn = conn
                    .lock()
                    .map_err(|_| Error::unavailable(COLLABORATOR, "connection lock poisoned"))?;
                load_all(&conn)?
            };

            let mut matches: Vec<SimilarityMatch> = stored
                .into_par_iter()
                .filter(|s| filter.matches(&s.metadata))
                .map(|s| SimilarityMatch {
                    score: match_score(query.as_slice(), &s.values),
                    id: s.id,
                    metadata: s.metadata,
                })
                .collect();
            // Stable: equal scores keep insertion order
            matches.sort_by(|a, b| b.score.total_cmp(&a.score));
            matches.truncate(top_k);
            Ok(matches)
        })
        .await
        .map_err(|e| Error::unavailable(COLLABORATOR, format!("search task failed: {e}")))?
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| Error::unavailable(COLLABORATOR, "connection lock poisoned"))?;
        let tx = conn.transaction()?;
        for id in ids {
            tx.execute("DELETE FROM vectors WHERE id = ?1", [id])?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn stats(&self) -> Result<IndexStats> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| Error::unavailable(COLLABORATOR, "connection lock poisoned"))?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM vectors", [], |row| row.get(0))?;
        Ok(IndexStats {
            backend: "local".into(),
            name: self.name.clone(),
            total_vectors: Some(count.max(0) as u64),
            dimension: Some(EMBEDDING_DIM),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn axis(i: usize, tilt: f32) -> EmbeddingVector {
        let mut v = vec![0.0; EMBEDDING_DIM];
        v[i] = 1.0;
        v[(i + 1) % EMBEDDING_DIM] = tilt;
        EmbeddingVector::new(v).unwrap()
    }

    fn meta(status: &str) -> Row {
        json!({"status": status}).as_object().cloned().unwrap()
    }

    #[test]
    fn test_blob_round_trip() {
        let values = vec![0.5f32, -1.25, 3.0];
        assert_eq!(decode(&encode(&values)), values);
    }

    #[tokio::test]
    async fn test_search_orders_by_score() {
        let index = LocalIndex::open_in_memory().unwrap();
        index.upsert("far", &axis(5, 0.0), meta("Open")).await.unwrap();
        index.upsert("near", &axis(0, 0.1), meta("Open")).await.unwrap();
        index.upsert("exact", &axis(0, 0.0), meta("Open")).await.unwrap();

        let hits = index
            .search(&axis(0, 0.0), 2, &MetadataFilter::new())
            .await
            .unwrap();
        let ids: Vec<_> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["exact", "near"]);
        assert!((hits[0].score - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_search_applies_filter() {
        let index = LocalIndex::open_in_memory().unwrap();
        index.upsert("open", &axis(0, 0.0), meta("Open")).await.unwrap();
        index.upsert("solved", &axis(0, 0.2), meta("Solved")).await.unwrap();

        let hits = index
            .search(&axis(0, 0.0), 5, &MetadataFilter::new().eq("status", "Solved"))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "solved");
        assert_eq!(hits[0].metadata["status"], json!("Solved"));
    }

    #[tokio::test]
    async fn test_upsert_replaces_and_delete_removes() {
        let index = LocalIndex::open_in_memory().unwrap();
        index.upsert("a", &axis(0, 0.0), meta("Open")).await.unwrap();
        index.upsert("a", &axis(0, 0.0), meta("Solved")).await.unwrap();
        assert_eq!(index.stats().await.unwrap().total_vectors, Some(1));

        let hits = index
            .search(&axis(0, 0.0), 1, &MetadataFilter::new().eq("status", "Solved"))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);

        index.delete(&["a".to_string()]).await.unwrap();
        assert_eq!(index.stats().await.unwrap().total_vectors, Some(0));
    }

    #[tokio::test]
    async fn test_negative_similarity_clamped() {
        let index = LocalIndex::open_in_memory().unwrap();
        let mut opposite = vec![0.0; EMBEDDING_DIM];
        opposite[0] = -1.0;
        index
            .upsert("opposite", &EmbeddingVector::new(opposite).unwrap(), meta("Open"))
            .await
            .unwrap();
        let hits = index
            .search(&axis(0, 0.0), 1, &MetadataFilter::new())
            .await
            .unwrap();
        assert_eq!(hits[0].score, 0.0);
    }
}
