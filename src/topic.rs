//! Per-topic store: segment files plus the topic's relational index.
//!
//! A topic directory holds `NNN.dat` segments and an `index.db` with the
//! `assets`, `dat_hashes`, and metadata tables. The store is the
//! serialization point for ingestion: the whole dedup-consult → append →
//! record → publish sequence runs under one per-topic lock, which is what
//! keeps the hash chain linear under concurrent uploads.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock};

use chrono::Utc;
use log::{info, warn};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::errors::{ApiError, ApiResult};
use crate::orchestrator::Orchestrator;
use crate::segment::{
    read_blob, segment_file_name, verify_dir, ChainReport, SegmentWriter,
};
use crate::util::{lock, read_lock, sha256_hex, write_lock};

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS assets (
    asset_id TEXT PRIMARY KEY,
    size INTEGER NOT NULL,
    parent_id TEXT,
    dat_ordinal INTEGER NOT NULL,
    dat_offset INTEGER NOT NULL,
    dat_length INTEGER NOT NULL,
    filename TEXT,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_assets_parent ON assets(parent_id) WHERE parent_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS dat_hashes (
    ordinal INTEGER PRIMARY KEY,
    chain_hash TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS metadata_raw (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    asset_id TEXT NOT NULL,
    processor TEXT NOT NULL,
    processor_version TEXT NOT NULL,
    op TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT,
    ts INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_metadata_raw_asset ON metadata_raw(asset_id);

CREATE TABLE IF NOT EXISTS metadata_computed (
    asset_id TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    value_type TEXT NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (asset_id, key)
);
";

#[derive(Debug, Clone, Serialize)]
pub(crate) struct TopicStats {
    pub(crate) file_count: u64,
    pub(crate) total_size: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct AssetLocation {
    pub(crate) ordinal: u64,
    pub(crate) offset: u64,
    pub(crate) length: u64,
}

#[derive(Debug)]
pub(crate) enum PutOutcome {
    Stored {
        content_hash: String,
        segment_file: String,
    },
    /// The content already exists somewhere; nothing was written here.
    Skipped {
        content_hash: String,
        owner_topic: String,
    },
}

#[derive(Debug)]
pub(crate) struct TopicStore {
    name: String,
    dir: PathBuf,
    healthy: AtomicBool,
    error: RwLock<Option<String>>,
    db: Mutex<Connection>,
    writer: Mutex<Option<SegmentWriter>>,
}

fn open_index_db(dir: &Path) -> Result<Connection, String> {
    let path = dir.join("index.db");
    let conn = Connection::open(&path).map_err(|e| format!("open {}: {e}", path.display()))?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA busy_timeout = 5000;",
    )
    .map_err(|e| format!("pragmas: {e}"))?;
    conn.execute_batch(SCHEMA_SQL)
        .map_err(|e| format!("schema: {e}"))?;
    Ok(conn)
}

impl TopicStore {
    /// Brand-new topic: empty directory, empty index, first segment open.
    pub(crate) fn create(name: &str, parent: &Path, max_dat_size: u64) -> Result<Self, String> {
        let dir = parent.join(name);
        std::fs::create_dir_all(&dir).map_err(|e| format!("create {}: {e}", dir.display()))?;
        let conn = open_index_db(&dir)?;
        let writer = SegmentWriter::create(&dir, max_dat_size)?;
        info!("created topic {name}");
        Ok(Self {
            name: name.to_string(),
            dir,
            healthy: AtomicBool::new(true),
            error: RwLock::new(None),
            db: Mutex::new(conn),
            writer: Mutex::new(Some(writer)),
        })
    }

    /// Startup path: open the index, verify the hash chain, reconcile rows
    /// for entries that committed to a segment but never reached `assets`,
    /// and resume the writer at the verified tail. A failed verification
    /// produces a store that reports unhealthy and refuses mutations. `Err`
    /// only when not even a placeholder store can be constructed.
    pub(crate) fn discover(name: &str, dir: &Path, max_dat_size: u64) -> Result<Self, String> {
        let conn = match open_index_db(dir) {
            Ok(c) => c,
            Err(e) => {
                // Placeholder connection so reads and listings still answer.
                let placeholder = Connection::open_in_memory()
                    .map_err(|mem| format!("topic {name}: index unavailable ({e}); {mem}"))?;
                let _ = placeholder.execute_batch(SCHEMA_SQL);
                return Ok(Self::broken_with(
                    name,
                    dir,
                    placeholder,
                    format!("index unavailable: {e}"),
                ));
            }
        };

        let recorded = match load_recorded_hashes(&conn) {
            Ok(r) => r,
            Err(e) => return Ok(Self::broken_with(name, dir, conn, e)),
        };

        let report = match verify_dir(dir, &recorded, true) {
            Ok(r) => r,
            Err(e) => return Ok(Self::broken_with(name, dir, conn, e)),
        };
        if !report.is_healthy() {
            let reason = report
                .error_string()
                .unwrap_or_else(|| "verification failed".to_string());
            return Ok(Self::broken_with(name, dir, conn, reason));
        }
        if report.repaired_bytes > 0 {
            info!(
                "topic {name}: truncated {} bytes of torn tail entry",
                report.repaired_bytes
            );
        }

        if let Err(e) = reconcile(&conn, &report) {
            return Ok(Self::broken_with(name, dir, conn, e));
        }

        let writer = match SegmentWriter::resume(dir, max_dat_size, &report.tail) {
            Ok(w) => w,
            Err(e) => return Ok(Self::broken_with(name, dir, conn, e)),
        };

        Ok(Self {
            name: name.to_string(),
            dir: dir.to_path_buf(),
            healthy: AtomicBool::new(true),
            error: RwLock::new(None),
            db: Mutex::new(conn),
            writer: Mutex::new(Some(writer)),
        })
    }

    fn broken_with(name: &str, dir: &Path, conn: Connection, reason: String) -> Self {
        warn!("topic {name} marked unhealthy: {reason}");
        Self {
            name: name.to_string(),
            dir: dir.to_path_buf(),
            healthy: AtomicBool::new(false),
            error: RwLock::new(Some(reason)),
            db: Mutex::new(conn),
            writer: Mutex::new(None),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub(crate) fn error(&self) -> Option<String> {
        read_lock(&self.error).clone()
    }

    pub(crate) fn mark_unhealthy(&self, reason: String) {
        warn!("topic {} marked unhealthy: {reason}", self.name);
        *write_lock(&self.error) = Some(reason);
        self.healthy.store(false, Ordering::Release);
    }

    pub(crate) fn ensure_healthy(&self) -> ApiResult<()> {
        if self.is_healthy() {
            return Ok(());
        }
        Err(ApiError::TopicUnhealthy {
            topic: self.name.clone(),
            detail: self.error().unwrap_or_else(|| "verification failed".to_string()),
        })
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        lock(&self.db)
    }

    // ── Ingestion ────────────────────────────────────────────────────

    /// Store a blob, or skip it when the orchestrator already knows the
    /// hash. The whole sequence runs under the topic's ingest lock so the
    /// chain-hash computation, the write, and the publish serialize.
    pub(crate) fn put_blob(
        &self,
        orchestrator: &Orchestrator,
        blob: &[u8],
        filename: Option<&str>,
        parent_id: Option<&str>,
    ) -> ApiResult<PutOutcome> {
        self.ensure_healthy()?;

        let mut writer_guard = lock(&self.writer);
        let Some(writer) = writer_guard.as_mut() else {
            return Err(ApiError::TopicUnhealthy {
                topic: self.name.clone(),
                detail: self.error().unwrap_or_else(|| "writer unavailable".to_string()),
            });
        };

        let content_hash = sha256_hex(blob);

        // Dedup decisions consult only the orchestrator index; whether the
        // owner is this topic or another one, the bytes are not stored twice.
        if let Some(owner) = orchestrator.lookup(&content_hash) {
            return Ok(PutOutcome::Skipped {
                content_hash,
                owner_topic: owner.topic,
            });
        }

        let now = Utc::now().timestamp();
        let record = {
            let conn = lock(&self.db);
            if let Some(parent) = parent_id {
                validate_parent(&conn, parent, &content_hash)?;
            }

            let record = writer.append(blob).map_err(ApiError::internal)?;
            if let Some(sealed) = &record.sealed {
                info!(
                    "topic {}: sealed {} at chain {}",
                    self.name,
                    segment_file_name(sealed.ordinal),
                    sealed.chain_hash
                );
            }
            // The open segment's row tracks its running trailing hash; once
            // the segment seals, the last value written is its final hash.
            conn.execute(
                "INSERT OR REPLACE INTO dat_hashes (ordinal, chain_hash, updated_at)
                 VALUES (?1, ?2, ?3)",
                params![record.ordinal as i64, record.chain_hash, now],
            )?;
            conn.execute(
                "INSERT INTO assets (asset_id, size, parent_id, dat_ordinal, dat_offset,
                 dat_length, filename, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.content_hash,
                    record.length as i64,
                    parent_id,
                    record.ordinal as i64,
                    record.offset as i64,
                    record.length as i64,
                    filename,
                    now
                ],
            )?;
            record
        };

        orchestrator
            .publish(&record.content_hash, &self.name, record.length, now)
            .map_err(ApiError::internal)?;

        Ok(PutOutcome::Stored {
            content_hash: record.content_hash,
            segment_file: segment_file_name(record.ordinal),
        })
    }

    // ── Reads ────────────────────────────────────────────────────────

    pub(crate) fn asset_location(&self, hash: &str) -> ApiResult<Option<AssetLocation>> {
        let conn = lock(&self.db);
        let row = conn
            .query_row(
                "SELECT dat_ordinal, dat_offset, dat_length FROM assets WHERE asset_id = ?1",
                params![hash],
                |row| {
                    Ok(AssetLocation {
                        ordinal: row.get::<_, i64>(0)? as u64,
                        offset: row.get::<_, i64>(1)? as u64,
                        length: row.get::<_, i64>(2)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub(crate) fn asset_exists(&self, hash: &str) -> ApiResult<bool> {
        Ok(self.asset_location(hash)?.is_some())
    }

    /// Segment file name for an asset this topic owns.
    pub(crate) fn asset_segment_file(&self, hash: &str) -> ApiResult<Option<String>> {
        Ok(self
            .asset_location(hash)?
            .map(|loc| segment_file_name(loc.ordinal)))
    }

    pub(crate) fn get_blob(&self, hash: &str) -> ApiResult<Vec<u8>> {
        let Some(location) = self.asset_location(hash)? else {
            return Err(ApiError::NotFound(format!("asset {hash}")));
        };
        read_blob(&self.dir, location.ordinal, location.offset, location.length)
            .map_err(ApiError::internal)
    }

    pub(crate) fn stats(&self) -> TopicStats {
        let conn = lock(&self.db);
        conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(size), 0) FROM assets",
            [],
            |row| {
                Ok(TopicStats {
                    file_count: row.get::<_, i64>(0)? as u64,
                    total_size: row.get::<_, i64>(1)? as u64,
                })
            },
        )
        .unwrap_or(TopicStats {
            file_count: 0,
            total_size: 0,
        })
    }

    /// `(hash, size, created_at)` for every asset, for the orchestrator
    /// rebuild at startup.
    pub(crate) fn assets_for_rebuild(&self) -> Result<Vec<(String, u64, i64)>, String> {
        let conn = lock(&self.db);
        let mut stmt = conn
            .prepare("SELECT asset_id, size, created_at FROM assets ORDER BY created_at, asset_id")
            .map_err(|e| format!("assets query: {e}"))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)? as u64,
                    row.get::<_, i64>(2)?,
                ))
            })
            .map_err(|e| format!("assets rows: {e}"))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| format!("assets row: {e}"))?);
        }
        Ok(out)
    }
}

fn load_recorded_hashes(
    conn: &Connection,
) -> Result<std::collections::HashMap<u64, String>, String> {
    let mut stmt = conn
        .prepare("SELECT ordinal, chain_hash FROM dat_hashes")
        .map_err(|e| format!("dat_hashes query: {e}"))?;
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, i64>(0)? as u64, row.get::<_, String>(1)?))
        })
        .map_err(|e| format!("dat_hashes rows: {e}"))?;
    let mut out = std::collections::HashMap::new();
    for row in rows {
        let (ordinal, hash) = row.map_err(|e| format!("dat_hashes row: {e}"))?;
        out.insert(ordinal, hash);
    }
    Ok(out)
}

/// Re-index entries the verification walk saw in segments but the relational
/// store never recorded (a crash between append and insert), and backfill
/// any `dat_hashes` row lost the same way.
fn reconcile(conn: &Connection, report: &ChainReport) -> Result<(), String> {
    let now = Utc::now().timestamp();
    for entry in &report.entries {
        conn.execute(
            "INSERT OR IGNORE INTO assets (asset_id, size, parent_id, dat_ordinal,
             dat_offset, dat_length, filename, created_at)
             VALUES (?1, ?2, NULL, ?3, ?4, ?5, NULL, ?6)",
            params![
                entry.content_hash,
                entry.length as i64,
                entry.ordinal as i64,
                entry.offset as i64,
                entry.length as i64,
                now
            ],
        )
        .map_err(|e| format!("reconcile asset {}: {e}", entry.content_hash))?;
    }
    for segment in &report.segment_hashes {
        conn.execute(
            "INSERT OR REPLACE INTO dat_hashes (ordinal, chain_hash, updated_at)
             VALUES (?1, ?2, ?3)",
            params![segment.ordinal as i64, segment.chain_hash, now],
        )
        .map_err(|e| format!("reconcile dat_hashes {}: {e}", segment.ordinal))?;
    }
    Ok(())
}

/// The parent must already exist here, and following its ancestor chain must
/// not reach the asset being inserted.
fn validate_parent(conn: &Connection, parent: &str, new_asset: &str) -> ApiResult<()> {
    let exists: Option<String> = conn
        .query_row(
            "SELECT asset_id FROM assets WHERE asset_id = ?1",
            params![parent],
            |row| row.get(0),
        )
        .optional()?;
    if exists.is_none() {
        return Err(ApiError::InvalidRequest(format!(
            "parent asset {parent} does not exist in this topic"
        )));
    }

    let mut current = parent.to_string();
    let mut hops = 0u32;
    loop {
        if current == new_asset {
            return Err(ApiError::InvalidRequest(
                "parent chain would form a cycle".to_string(),
            ));
        }
        let next: Option<Option<String>> = conn
            .query_row(
                "SELECT parent_id FROM assets WHERE asset_id = ?1",
                params![current],
                |row| row.get(0),
            )
            .optional()?;
        match next.flatten() {
            Some(p) => current = p,
            None => return Ok(()),
        }
        hops += 1;
        if hops > 10_000 {
            return Err(ApiError::internal("parent chain too deep"));
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────
