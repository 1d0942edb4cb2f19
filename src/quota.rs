//! Admission gate: every limit is checked before any mutation commits.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use crate::errors::{ApiError, ApiResult};
use crate::util::{dir_size_bytes, lock};

/// Disk usage is aggregate bytes of everything under the working directory
/// (segments plus relational stores). Computing that walks the tree, so the
/// value is cached and only refreshed after a mutation invalidated it.
#[derive(Debug)]
pub(crate) struct DiskQuota {
    limit: u64,
    cache: Mutex<DiskCache>,
}

#[derive(Debug)]
struct DiskCache {
    usage: u64,
    dirty: bool,
}

impl DiskQuota {
    pub(crate) fn new(limit: u64) -> Self {
        Self {
            limit,
            cache: Mutex::new(DiskCache {
                usage: 0,
                dirty: true,
            }),
        }
    }

    pub(crate) fn usage(&self, root: &Path) -> u64 {
        let mut cache = lock(&self.cache);
        if cache.dirty {
            cache.usage = dir_size_bytes(root);
            cache.dirty = false;
        }
        cache.usage
    }

    /// Admit `incoming` more bytes, or fail with 507. A limit of 0 disables
    /// the check without touching the filesystem.
    pub(crate) fn charge(&self, root: &Path, incoming: u64) -> ApiResult<()> {
        if self.limit == 0 {
            return Ok(());
        }
        let usage = self.usage(root);
        if usage + incoming > self.limit {
            return Err(ApiError::DiskLimitExceeded {
                usage: usage + incoming,
                limit: self.limit,
            });
        }
        Ok(())
    }

    pub(crate) fn invalidate(&self) {
        lock(&self.cache).dirty = true;
    }
}

pub(crate) fn check_blob_size(size: u64, max_dat_size: u64) -> ApiResult<()> {
    if size > max_dat_size {
        return Err(ApiError::BlobTooLarge {
            size,
            max: max_dat_size,
        });
    }
    Ok(())
}

pub(crate) fn check_batch_len(count: usize, max: usize) -> ApiResult<()> {
    if count > max {
        return Err(ApiError::BatchTooManyOperations { count, max });
    }
    Ok(())
}

pub(crate) fn check_metadata_key(key: &str, max: usize) -> ApiResult<()> {
    if key.len() > max {
        return Err(ApiError::MetadataKeyTooLong {
            len: key.len(),
            max,
        });
    }
    Ok(())
}

pub(crate) fn check_metadata_value(value: &str, max: usize) -> ApiResult<()> {
    if value.len() > max {
        return Err(ApiError::MetadataValueTooLong {
            len: value.len(),
            max,
        });
    }
    Ok(())
}

/// Per-username failed-login counter. Locked out usernames stay locked
/// until a successful login resets them.
pub(crate) struct LoginGuard {
    max_attempts: u32,
    attempts: Mutex<HashMap<String, u32>>,
}

impl LoginGuard {
    pub(crate) fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn check(&self, username: &str) -> ApiResult<()> {
        let attempts = lock(&self.attempts);
        if self.max_attempts > 0
            && attempts.get(username).copied().unwrap_or(0) >= self.max_attempts
        {
            return Err(ApiError::LoginLocked);
        }
        Ok(())
    }

    pub(crate) fn record_failure(&self, username: &str) {
        let mut attempts = lock(&self.attempts);
        *attempts.entry(username.to_string()).or_insert(0) += 1;
    }

    pub(crate) fn reset(&self, username: &str) {
        lock(&self.attempts).remove(username);
    }
}

// ── Tests ────────────────────────────────────────────────────────────────
