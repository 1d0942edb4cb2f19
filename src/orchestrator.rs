//! Process-wide asset index: content hash → owning topic.
//!
//! This is the sole dedup authority. Upload paths consult `lookup` before
//! touching any topic store, and the download path resolves ownership here
//! rather than scanning topics. Backed by `.internal/orchestrator.db` with
//! an in-memory map in front so lookups never hit SQLite.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, RwLock};

use rusqlite::{params, Connection};

use crate::util::{lock, read_lock, write_lock};

#[derive(Debug, Clone)]
pub(crate) struct IndexedAsset {
    pub(crate) topic: String,
    pub(crate) size: u64,
    pub(crate) first_seen: i64,
}

#[derive(Debug)]
pub(crate) struct Orchestrator {
    db: Mutex<Connection>,
    index: RwLock<HashMap<String, IndexedAsset>>,
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS asset_index (
    hash TEXT PRIMARY KEY,
    topic TEXT NOT NULL,
    size INTEGER NOT NULL,
    first_seen INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_asset_index_topic ON asset_index(topic);
";

impl Orchestrator {
    /// Open or create the index under `<working_dir>/.internal/`.
    pub(crate) fn open(working_dir: &Path) -> Result<Self, String> {
        let internal = working_dir.join(".internal");
        std::fs::create_dir_all(&internal)
            .map_err(|e| format!("create {}: {e}", internal.display()))?;
        let path = internal.join("orchestrator.db");
        let conn = Connection::open(&path).map_err(|e| format!("open {}: {e}", path.display()))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|e| format!("pragmas: {e}"))?;
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| format!("schema: {e}"))?;

        let orchestrator = Self {
            db: Mutex::new(conn),
            index: RwLock::new(HashMap::new()),
        };
        orchestrator.reload_map()?;
        Ok(orchestrator)
    }

    fn reload_map(&self) -> Result<(), String> {
        let conn = lock(&self.db);
        let mut stmt = conn
            .prepare("SELECT hash, topic, size, first_seen FROM asset_index")
            .map_err(|e| format!("index load: {e}"))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    IndexedAsset {
                        topic: row.get(1)?,
                        size: row.get::<_, i64>(2)? as u64,
                        first_seen: row.get(3)?,
                    },
                ))
            })
            .map_err(|e| format!("index query: {e}"))?;
        let mut map = HashMap::new();
        for row in rows {
            let (hash, asset) = row.map_err(|e| format!("index row: {e}"))?;
            map.insert(hash, asset);
        }
        *write_lock(&self.index) = map;
        Ok(())
    }

    pub(crate) fn lookup(&self, hash: &str) -> Option<IndexedAsset> {
        read_lock(&self.index).get(hash).cloned()
    }

    pub(crate) fn len(&self) -> usize {
        read_lock(&self.index).len()
    }

    /// `(count, total bytes, earliest first_seen)` across the whole index.
    pub(crate) fn stats(&self) -> (usize, u64, Option<i64>) {
        let index = read_lock(&self.index);
        let total: u64 = index.values().map(|a| a.size).sum();
        let earliest = index.values().map(|a| a.first_seen).min();
        (index.len(), total, earliest)
    }

    /// Record ownership of `hash`. A second publish for the same hash is a
    /// no-op regardless of topic: the first owner wins.
    pub(crate) fn publish(
        &self,
        hash: &str,
        topic: &str,
        size: u64,
        first_seen: i64,
    ) -> Result<bool, String> {
        let mut map = write_lock(&self.index);
        if map.contains_key(hash) {
            return Ok(false);
        }
        let conn = lock(&self.db);
        conn.execute(
            "INSERT OR IGNORE INTO asset_index (hash, topic, size, first_seen)
             VALUES (?1, ?2, ?3, ?4)",
            params![hash, topic, size as i64, first_seen],
        )
        .map_err(|e| format!("publish {hash}: {e}"))?;
        map.insert(
            hash.to_string(),
            IndexedAsset {
                topic: topic.to_string(),
                size,
                first_seen,
            },
        );
        Ok(true)
    }

    /// Rebuild the whole index from healthy topics at startup. Assets owned
    /// by unhealthy topics are deliberately left unindexed, so re-uploading
    /// their content to a healthy topic stores it again.
    pub(crate) fn rebuild(
        &self,
        topics: impl IntoIterator<Item = (String, Vec<(String, u64, i64)>)>,
    ) -> Result<(), String> {
        let mut map = write_lock(&self.index);
        let mut conn = lock(&self.db);
        let tx = conn
            .transaction()
            .map_err(|e| format!("rebuild begin: {e}"))?;
        tx.execute("DELETE FROM asset_index", [])
            .map_err(|e| format!("rebuild clear: {e}"))?;
        map.clear();
        for (topic, assets) in topics {
            for (hash, size, first_seen) in assets {
                if map.contains_key(&hash) {
                    continue;
                }
                tx.execute(
                    "INSERT OR IGNORE INTO asset_index (hash, topic, size, first_seen)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![hash, topic, size as i64, first_seen],
                )
                .map_err(|e| format!("rebuild insert {hash}: {e}"))?;
                map.insert(
                    hash,
                    IndexedAsset {
                        topic: topic.clone(),
                        size,
                        first_seen,
                    },
                );
            }
        }
        tx.commit().map_err(|e| format!("rebuild commit: {e}"))?;
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────────
