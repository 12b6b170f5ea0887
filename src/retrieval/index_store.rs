use chrono::{DateTime, Utc};
use duckdb::{Connection, params};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

use super::RetrievalError;
use super::vector::{IndexEntry, VectorIndex};

/// Keeps the table-description index in its own DuckDB file so it survives restarts.
pub struct DuckDbIndexStore {
    conn: Mutex<Connection>,
}

impl DuckDbIndexStore {
    pub fn open(path: &str) -> Result<Self, RetrievalError> {
        let conn = if path.is_empty() || path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        RetrievalError::Store(format!("cannot create {}: {}", parent.display(), e))
                    })?;
                }
            }
            Connection::open(path)?
        };

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_index_meta (key VARCHAR PRIMARY KEY, value VARCHAR);
             CREATE TABLE IF NOT EXISTS schema_index (
                 position INTEGER,
                 table_name VARCHAR,
                 description VARCHAR,
                 embedding VARCHAR
             );",
        )?;
        info!("Opened schema index store at {}", if path.is_empty() { ":memory:" } else { path });

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reads the stored index; `None` when nothing has been saved yet.
    pub fn load(&self) -> Result<Option<VectorIndex>, RetrievalError> {
        let conn = self.lock();

        let mut stmt = conn.prepare("SELECT key, value FROM schema_index_meta")?;
        let meta: Vec<(String, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<_, _>>()?;

        let lookup = |key: &str| {
            meta.iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        };
        let Some(embedder_id) = lookup("embedder_id") else {
            return Ok(None);
        };
        let built_at = lookup("built_at")
            .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        let mut stmt = conn.prepare(
            "SELECT table_name, description, embedding FROM schema_index ORDER BY position",
        )?;
        let rows: Vec<(String, String, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<Result<_, _>>()?;

        let mut entries = Vec::with_capacity(rows.len());
        for (table, document, embedding) in rows {
            let vector: Vec<f32> = serde_json::from_str(&embedding).map_err(|e| {
                RetrievalError::Store(format!("corrupt embedding for {}: {}", table, e))
            })?;
            entries.push(IndexEntry {
                table,
                document,
                vector,
            });
        }

        debug!("Loaded {} index entries built by {}", entries.len(), embedder_id);
        Ok(Some(VectorIndex {
            embedder_id,
            entries,
            built_at,
        }))
    }

    /// Replaces whatever was stored with `index`.
    pub fn save(&self, index: &VectorIndex) -> Result<(), RetrievalError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM schema_index", [])?;
        tx.execute("DELETE FROM schema_index_meta", [])?;
        tx.execute(
            "INSERT INTO schema_index_meta VALUES ('embedder_id', ?), ('built_at', ?)",
            params![index.embedder_id, index.built_at.to_rfc3339()],
        )?;

        for (position, entry) in index.entries.iter().enumerate() {
            let embedding = serde_json::to_string(&entry.vector)
                .map_err(|e| RetrievalError::Store(e.to_string()))?;
            tx.execute(
                "INSERT INTO schema_index VALUES (?, ?, ?, ?)",
                params![position as i64, entry.table, entry.document, embedding],
            )?;
        }

        tx.commit()?;
        info!("Saved {} index entries", index.entries.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> VectorIndex {
        VectorIndex {
            embedder_id: "hashing-4".to_string(),
            entries: vec![
                IndexEntry {
                    table: "orders".to_string(),
                    document: "Table: orders".to_string(),
                    vector: vec![1.0, 0.0, 0.0, 0.0],
                },
                IndexEntry {
                    table: "customers".to_string(),
                    document: "Table: customers".to_string(),
                    vector: vec![0.0, 0.5, 0.5, 0.0],
                },
            ],
            built_at: Utc::now(),
        }
    }

    #[test]
    fn empty_store_loads_nothing() {
        let store = DuckDbIndexStore::open(":memory:").unwrap();
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn reopened_file_keeps_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("index.duckdb");
        let path = path.to_str().unwrap();

        {
            let store = DuckDbIndexStore::open(path).unwrap();
            store.save(&index()).unwrap();
            // Saving twice replaces rather than appends
            store.save(&index()).unwrap();
        }

        let loaded = DuckDbIndexStore::open(path).unwrap().load().unwrap().unwrap();
        assert_eq!(loaded.embedder_id, "hashing-4");
        assert_eq!(loaded.entries.len(), 2);
        assert_eq!(loaded.entries[0].table, "orders");
        assert_eq!(loaded.entries[1].vector, vec![0.0, 0.5, 0.5, 0.0]);
    }
}
