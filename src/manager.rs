//! Topic lifecycle and process-wide runtime state.
//!
//! `StorageRuntime` is everything that exists only after a working directory
//! is configured: the topic map, the orchestrator index, and the disk quota.
//! `AppState` wraps it with the configure-once lifecycle the HTTP layer
//! exposes. No globals; the state is threaded explicitly.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use log::{error, info};
use rayon::prelude::*;
use serde::Serialize;

use crate::config::ServerConfig;
use crate::errors::{ApiError, ApiResult};
use crate::orchestrator::Orchestrator;
use crate::quota::{check_blob_size, DiskQuota, LoginGuard};
use crate::topic::{PutOutcome, TopicStats, TopicStore};
use crate::util::{read_lock, sha256_hex, validate_topic_name, write_lock};

#[derive(Debug, Clone, Serialize)]
pub(crate) struct TopicSummary {
    pub(crate) name: String,
    pub(crate) healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) error: Option<String>,
    pub(crate) stats: TopicStats,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct UploadResponse {
    pub(crate) hash: String,
    pub(crate) blob: String,
    pub(crate) skipped: bool,
}

#[derive(Debug)]
pub(crate) struct StorageRuntime {
    working_dir: PathBuf,
    config: ServerConfig,
    topics: RwLock<HashMap<String, Arc<TopicStore>>>,
    orchestrator: Orchestrator,
    disk: DiskQuota,
}

impl StorageRuntime {
    /// Bring up storage under `working_dir`: discover topic directories,
    /// verify every hash chain in parallel, then rebuild the orchestrator
    /// index from the topics that came up healthy.
    pub(crate) fn configure(working_dir: &Path, config: &ServerConfig) -> Result<Arc<Self>, String> {
        std::fs::create_dir_all(working_dir)
            .map_err(|e| format!("create {}: {e}", working_dir.display()))?;
        let orchestrator = Orchestrator::open(working_dir)?;

        let mut candidates = Vec::new();
        let entries = std::fs::read_dir(working_dir)
            .map_err(|e| format!("scan {}: {e}", working_dir.display()))?;
        for entry in entries {
            let entry = entry.map_err(|e| format!("scan {}: {e}", working_dir.display()))?;
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if validate_topic_name(name).is_err() {
                continue;
            }
            candidates.push((name.to_string(), entry.path()));
        }

        let max_dat_size = config.max_dat_size;
        let stores: Vec<Arc<TopicStore>> = candidates
            .par_iter()
            .filter_map(|(name, dir)| match TopicStore::discover(name, dir, max_dat_size) {
                Ok(store) => Some(Arc::new(store)),
                Err(e) => {
                    error!("topic {name}: {e}");
                    None
                }
            })
            .collect();

        let mut topics = HashMap::new();
        let mut rebuild_input = Vec::new();
        for store in stores {
            if store.is_healthy() {
                match store.assets_for_rebuild() {
                    Ok(assets) => rebuild_input.push((store.name().to_string(), assets)),
                    Err(e) => store.mark_unhealthy(e),
                }
            }
            topics.insert(store.name().to_string(), store);
        }
        orchestrator.rebuild(rebuild_input)?;

        let healthy = topics.values().filter(|t| t.is_healthy()).count();
        info!(
            "configured working directory {} ({} topics, {healthy} healthy, {} indexed assets)",
            working_dir.display(),
            topics.len(),
            orchestrator.len()
        );

        Ok(Arc::new(Self {
            working_dir: working_dir.to_path_buf(),
            config: config.clone(),
            topics: RwLock::new(topics),
            orchestrator,
            disk: DiskQuota::new(config.max_disk_usage),
        }))
    }

    pub(crate) fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub(crate) fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub(crate) fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub(crate) fn disk_usage(&self) -> u64 {
        self.disk.usage(&self.working_dir)
    }

    pub(crate) fn check_disk_quota(&self, incoming: u64) -> ApiResult<()> {
        self.disk.charge(&self.working_dir, incoming)
    }

    pub(crate) fn invalidate_disk(&self) {
        self.disk.invalidate();
    }

    // ── Topic lifecycle ──────────────────────────────────────────────

    pub(crate) fn create_topic(&self, name: &str) -> ApiResult<TopicSummary> {
        validate_topic_name(name).map_err(ApiError::InvalidTopicName)?;

        let mut topics = write_lock(&self.topics);
        if topics.contains_key(name) {
            return Err(ApiError::InvalidRequest(format!(
                "topic {name} already exists"
            )));
        }
        self.check_disk_quota(0)?;
        let store = TopicStore::create(name, &self.working_dir, self.config.max_dat_size)
            .map_err(ApiError::internal)?;
        let store = Arc::new(store);
        topics.insert(name.to_string(), store.clone());
        drop(topics);

        self.disk.invalidate();
        Ok(summarize(&store))
    }

    pub(crate) fn topic(&self, name: &str) -> Option<Arc<TopicStore>> {
        read_lock(&self.topics).get(name).cloned()
    }

    pub(crate) fn topics_snapshot(&self) -> Vec<Arc<TopicStore>> {
        let mut stores: Vec<_> = read_lock(&self.topics).values().cloned().collect();
        stores.sort_by(|a, b| a.name().cmp(b.name()));
        stores
    }

    pub(crate) fn list_topics(&self) -> Vec<TopicSummary> {
        self.topics_snapshot().iter().map(|s| summarize(s)).collect()
    }

    /// Resolve a query/apply topic selection. An empty selection fans out
    /// across all healthy topics; naming a missing or unhealthy topic is a
    /// client error.
    pub(crate) fn select_topics(&self, names: &[String]) -> ApiResult<Vec<Arc<TopicStore>>> {
        if names.is_empty() {
            return Ok(self
                .topics_snapshot()
                .into_iter()
                .filter(|t| t.is_healthy())
                .collect());
        }
        let mut seen = HashSet::new();
        let mut selected = Vec::new();
        for name in names {
            if !seen.insert(name.clone()) {
                continue;
            }
            let Some(store) = self.topic(name) else {
                return Err(ApiError::TopicNotFound(name.clone()));
            };
            if !store.is_healthy() {
                return Err(ApiError::UnhealthyTopicSelected(name.clone()));
            }
            selected.push(store);
        }
        Ok(selected)
    }

    // ── Asset flows ──────────────────────────────────────────────────

    /// The full upload path: dedup via the orchestrator, admission, append,
    /// publish. Returns the wire-shaped response. A duplicate stores no
    /// bytes, so it skips ahead of the quota checks.
    pub(crate) fn upload(
        &self,
        topic_name: &str,
        blob: &[u8],
        filename: Option<&str>,
        parent_id: Option<&str>,
    ) -> ApiResult<UploadResponse> {
        let Some(topic) = self.topic(topic_name) else {
            return Err(ApiError::NotFound(format!("topic {topic_name}")));
        };
        topic.ensure_healthy()?;

        let content_hash = sha256_hex(blob);
        if let Some(indexed) = self.orchestrator.lookup(&content_hash) {
            return self.skipped_response(content_hash, &indexed.topic);
        }
        check_blob_size(blob.len() as u64, self.config.max_dat_size)?;
        self.check_disk_quota(blob.len() as u64)?;

        let outcome = topic.put_blob(&self.orchestrator, blob, filename, parent_id)?;
        self.disk.invalidate();

        match outcome {
            PutOutcome::Stored {
                content_hash,
                segment_file,
            } => Ok(UploadResponse {
                hash: content_hash,
                blob: segment_file,
                skipped: false,
            }),
            // Lost a race: someone indexed the hash between the consult
            // above and the topic's locked re-check.
            PutOutcome::Skipped {
                content_hash,
                owner_topic,
            } => self.skipped_response(content_hash, &owner_topic),
        }
    }

    fn skipped_response(&self, hash: String, owner_topic: &str) -> ApiResult<UploadResponse> {
        let owner = self.topic(owner_topic).ok_or_else(|| {
            ApiError::internal(format!("indexed owner topic {owner_topic} is not loaded"))
        })?;
        let segment_file = owner.asset_segment_file(&hash)?.ok_or_else(|| {
            ApiError::internal(format!(
                "asset {hash} indexed to {owner_topic} but has no row"
            ))
        })?;
        Ok(UploadResponse {
            hash,
            blob: segment_file,
            skipped: true,
        })
    }

    /// Owning topic for an indexed hash, for download and metadata paths.
    pub(crate) fn resolve_owner(&self, hash: &str) -> ApiResult<Arc<TopicStore>> {
        let Some(indexed) = self.orchestrator.lookup(hash) else {
            return Err(ApiError::NotFound(format!("asset {hash}")));
        };
        self.topic(&indexed.topic).ok_or_else(|| {
            ApiError::internal(format!("indexed owner topic {} is not loaded", indexed.topic))
        })
    }

    /// Downloads traverse orchestrator → owning topic → segment, so content
    /// deduplicated away from the requested topic still resolves.
    pub(crate) fn download(&self, hash: &str) -> ApiResult<Vec<u8>> {
        self.resolve_owner(hash)?.get_blob(hash)
    }
}

fn summarize(store: &Arc<TopicStore>) -> TopicSummary {
    TopicSummary {
        name: store.name().to_string(),
        healthy: store.is_healthy(),
        error: store.error(),
        stats: store.stats(),
    }
}

// ── AppState ─────────────────────────────────────────────────────────────

/// Configure-once application state shared by every worker thread.
pub(crate) struct AppState {
    pub(crate) config: ServerConfig,
    runtime: RwLock<Option<Arc<StorageRuntime>>>,
    pub(crate) logins: LoginGuard,
    pub(crate) sessions: Mutex<HashSet<String>>,
}

impl AppState {
    pub(crate) fn new(config: ServerConfig) -> Self {
        let logins = LoginGuard::new(config.max_login_attempts);
        Self {
            config,
            runtime: RwLock::new(None),
            logins,
            sessions: Mutex::new(HashSet::new()),
        }
    }

    pub(crate) fn runtime(&self) -> Option<Arc<StorageRuntime>> {
        read_lock(&self.runtime).clone()
    }

    pub(crate) fn require_runtime(&self) -> ApiResult<Arc<StorageRuntime>> {
        self.runtime()
            .ok_or_else(|| ApiError::InvalidRequest("working directory is not configured".into()))
    }

    /// Install the working directory. A repeat with the same path is a
    /// no-op; pointing somewhere else is refused.
    pub(crate) fn configure_working_dir(&self, path: &Path) -> ApiResult<Arc<StorageRuntime>> {
        {
            let current = read_lock(&self.runtime);
            if let Some(runtime) = current.as_ref() {
                if runtime.working_dir() == path {
                    return Ok(runtime.clone());
                }
                return Err(ApiError::InvalidRequest(format!(
                    "working directory already configured as {}",
                    runtime.working_dir().display()
                )));
            }
        }
        let runtime = StorageRuntime::configure(path, &self.config).map_err(ApiError::internal)?;
        let mut slot = write_lock(&self.runtime);
        if let Some(existing) = slot.as_ref() {
            // Lost a configure race; keep the winner.
            return Ok(existing.clone());
        }
        *slot = Some(runtime.clone());
        Ok(runtime)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::{segment_path, CHAIN_HASH_OFFSET};
    use crate::util::sha256_hex;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "datvault_mgr_{}_{name}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn runtime(dir: &Path, config: &ServerConfig) -> Arc<StorageRuntime> {
        StorageRuntime::configure(dir, config).unwrap()
    }

    #[test]
    fn test_create_topic_and_list() {
        let dir = temp_dir("create");
        let rt = runtime(&dir, &ServerConfig::default());

        let summary = rt.create_topic("topic-1").unwrap();
        assert!(summary.healthy);
        assert_eq!(summary.stats.file_count, 0);

        assert_eq!(rt.create_topic("topic-1").unwrap_err().status(), 400);
        assert_eq!(
            rt.create_topic("Bad Name").unwrap_err().code(),
            "INVALID_TOPIC_NAME"
        );

        rt.create_topic("topic-2").unwrap();
        let names: Vec<String> = rt.list_topics().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["topic-1", "topic-2"]);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_upload_dedup_and_download_across_topics() {
        let dir = temp_dir("dedup");
        let rt = runtime(&dir, &ServerConfig::default());
        rt.create_topic("topic-1").unwrap();
        rt.create_topic("topic-2").unwrap();

        let first = rt.upload("topic-1", b"identical bytes", Some("f.bin"), None).unwrap();
        assert!(!first.skipped);
        assert_eq!(first.hash, sha256_hex(b"identical bytes"));
        assert_eq!(first.blob, "001.dat");

        let second = rt.upload("topic-2", b"identical bytes", Some("g.bin"), None).unwrap();
        assert!(second.skipped);
        assert_eq!(second.hash, first.hash);
        assert_eq!(second.blob, "001.dat");

        // topic-2 stored nothing, yet the hash downloads through the index.
        assert_eq!(rt.topic("topic-2").unwrap().stats().file_count, 0);
        assert_eq!(rt.download(&first.hash).unwrap(), b"identical bytes");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_discovery_after_restart() {
        let dir = temp_dir("restart");
        let hash;
        {
            let rt = runtime(&dir, &ServerConfig::default());
            rt.create_topic("topic-1").unwrap();
            hash = rt.upload("topic-1", b"persisted", None, None).unwrap().hash;
        }

        let rt = runtime(&dir, &ServerConfig::default());
        let topics = rt.list_topics();
        assert_eq!(topics.len(), 1);
        assert!(topics[0].healthy);
        assert_eq!(topics[0].stats.file_count, 1);
        assert_eq!(rt.download(&hash).unwrap(), b"persisted");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_corrupted_topic_skipped_by_orchestrator_rebuild() {
        let dir = temp_dir("corrupt");
        let hash;
        {
            let rt = runtime(&dir, &ServerConfig::default());
            rt.create_topic("topic-1").unwrap();
            rt.create_topic("topic-2").unwrap();
            hash = rt.upload("topic-1", b"soon corrupted", None, None).unwrap().hash;
        }

        let path = segment_path(&dir.join("topic-1"), 1);
        let mut bytes = std::fs::read(&path).unwrap();
        for b in &mut bytes[CHAIN_HASH_OFFSET as usize..(CHAIN_HASH_OFFSET as usize + 64)] {
            *b = 0;
        }
        std::fs::write(&path, &bytes).unwrap();

        let rt = runtime(&dir, &ServerConfig::default());
        let summary: HashMap<String, TopicSummary> = rt
            .list_topics()
            .into_iter()
            .map(|t| (t.name.clone(), t))
            .collect();
        assert!(!summary["topic-1"].healthy);
        assert!(summary["topic-1"].error.as_deref().unwrap().contains("001.dat"));
        assert!(summary["topic-2"].healthy);

        // Unindexed: download 404s, and uploads to the broken topic 503.
        assert_eq!(rt.download(&hash).unwrap_err().status(), 404);
        assert_eq!(
            rt.upload("topic-1", b"refused", None, None).unwrap_err().status(),
            503
        );

        // The content can be re-stored in a healthy topic.
        let again = rt.upload("topic-2", b"soon corrupted", None, None).unwrap();
        assert!(!again.skipped);
        assert_eq!(again.hash, hash);
        assert_eq!(rt.download(&hash).unwrap(), b"soon corrupted");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_disk_limit_blocks_upload() {
        let dir = temp_dir("disklimit");
        let mut config = ServerConfig::default();
        config.max_disk_usage = 1;
        let rt = runtime(&dir, &config);

        // Topic creation itself is blocked once anything exists on disk.
        let err = rt.create_topic("topic-1").unwrap_err();
        assert_eq!(err.code(), "DISK_LIMIT_EXCEEDED");

        let mut config = ServerConfig::default();
        config.max_disk_usage = 0;
        let dir2 = temp_dir("disklimit_off");
        let rt = runtime(&dir2, &config);
        rt.create_topic("topic-1").unwrap();
        assert!(rt.upload("topic-1", b"fine", None, None).is_ok());
        std::fs::remove_dir_all(&dir).ok();
        std::fs::remove_dir_all(&dir2).ok();
    }

    #[test]
    fn test_blob_larger_than_segment_cap_rejected() {
        let dir = temp_dir("blobcap");
        let mut config = ServerConfig::default();
        config.max_dat_size = 1024;
        let rt = runtime(&dir, &config);
        rt.create_topic("topic-1").unwrap();

        let err = rt.upload("topic-1", &vec![0u8; 2048], None, None).unwrap_err();
        assert_eq!(err.status(), 413);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_select_topics() {
        let dir = temp_dir("select");
        let rt = runtime(&dir, &ServerConfig::default());
        rt.create_topic("topic-1").unwrap();
        rt.create_topic("topic-2").unwrap();
        rt.topic("topic-2").unwrap().mark_unhealthy("test".into());

        // Empty selection: healthy topics only.
        let all = rt.select_topics(&[]).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name(), "topic-1");

        let err = rt.select_topics(&["missing".to_string()]).unwrap_err();
        assert_eq!(err.code(), "TOPIC_NOT_FOUND");
        assert_eq!(err.status(), 400);

        let err = rt.select_topics(&["topic-2".to_string()]).unwrap_err();
        assert_eq!(err.code(), "TOPIC_UNHEALTHY");
        assert_eq!(err.status(), 400);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_configure_once() {
        let dir = temp_dir("appstate");
        let other = temp_dir("appstate_other");
        let state = AppState::new(ServerConfig::default());
        assert!(state.require_runtime().is_err());

        state.configure_working_dir(&dir).unwrap();
        assert!(state.require_runtime().is_ok());

        // Same path: fine. Different path: refused.
        assert!(state.configure_working_dir(&dir).is_ok());
        assert_eq!(state.configure_working_dir(&other).unwrap_err().status(), 400);
        std::fs::remove_dir_all(&dir).ok();
        std::fs::remove_dir_all(&other).ok();
    }

    #[test]
    fn test_parallel_uploads_across_topics() {
        let dir = temp_dir("parallel");
        let rt = runtime(&dir, &ServerConfig::default());
        rt.create_topic("topic-1").unwrap();
        rt.create_topic("topic-2").unwrap();
        rt.create_topic("topic-3").unwrap();

        std::thread::scope(|scope| {
            for i in 0..15u8 {
                let rt = &rt;
                scope.spawn(move || {
                    let topic = format!("topic-{}", (i % 3) + 1);
                    let blob = vec![i; 4096];
                    rt.upload(&topic, &blob, None, None).unwrap();
                });
            }
        });

        let total: u64 = rt.list_topics().iter().map(|t| t.stats.file_count).sum();
        assert_eq!(total, 15);
        assert_eq!(rt.orchestrator().len(), 15);
        std::fs::remove_dir_all(&dir).ok();
    }
}
