//! Asset metadata: an append-only raw audit log plus a computed
//! latest-writer-wins projection with type inference.
//!
//! Raw rows keep the value exactly as submitted. The computed projection is
//! recomputed from the raw log after every mutation, so it is always a pure
//! function of that log: replaying raw from empty reproduces it.

use std::collections::HashMap;

use chrono::Utc;
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::errors::{ApiError, ApiResult};
use crate::manager::StorageRuntime;
use crate::query::execute_query;
use crate::quota::{check_batch_len, check_metadata_key, check_metadata_value};
use crate::topic::TopicStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum MetadataOp {
    Set,
    Delete,
}

impl MetadataOp {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Self::Set => "set",
            Self::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct MetadataRequest {
    pub(crate) op: MetadataOp,
    pub(crate) key: String,
    #[serde(default)]
    pub(crate) value: Option<String>,
    pub(crate) processor: String,
    pub(crate) processor_version: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct BatchRequest {
    pub(crate) operations: Vec<BatchOperation>,
    pub(crate) processor: String,
    pub(crate) processor_version: String,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct BatchOperation {
    pub(crate) hash: String,
    pub(crate) op: MetadataOp,
    pub(crate) key: String,
    #[serde(default)]
    pub(crate) value: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ApplyRequest {
    pub(crate) query_preset: String,
    #[serde(default)]
    pub(crate) topics: Vec<String>,
    #[serde(default)]
    pub(crate) params: HashMap<String, String>,
    pub(crate) op: MetadataOp,
    pub(crate) key: String,
    #[serde(default)]
    pub(crate) value: Option<String>,
    pub(crate) processor: String,
    pub(crate) processor_version: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct OperationResult {
    pub(crate) hash: String,
    pub(crate) key: String,
    pub(crate) op: &'static str,
    pub(crate) success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) error: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct BatchResponse {
    pub(crate) success: bool,
    pub(crate) succeeded: usize,
    pub(crate) failed: usize,
    pub(crate) results: Vec<OperationResult>,
}

impl BatchResponse {
    fn from_results(results: Vec<OperationResult>) -> Self {
        let succeeded = results.iter().filter(|r| r.success).count();
        let failed = results.len() - succeeded;
        Self {
            success: failed == 0,
            succeeded,
            failed,
            results,
        }
    }
}

// ── Type inference ───────────────────────────────────────────────────────

/// `-?[1-9][0-9]*`, or exactly `0`. Anything with a redundant leading zero
/// (including `-0`) stays a string.
fn is_integer_literal(s: &str) -> bool {
    if s == "0" {
        return true;
    }
    let digits = s.strip_prefix('-').unwrap_or(s);
    let bytes = digits.as_bytes();
    !bytes.is_empty()
        && (b'1'..=b'9').contains(&bytes[0])
        && bytes.iter().all(u8::is_ascii_digit)
}

/// `-?(0|[1-9][0-9]*)\.[0-9]*[1-9]`: no redundant leading zeros and the
/// fraction must not end in zero, so `1.0` and `1.50` stay strings.
fn is_float_literal(s: &str) -> bool {
    let unsigned = s.strip_prefix('-').unwrap_or(s);
    let Some((int_part, frac_part)) = unsigned.split_once('.') else {
        return false;
    };
    let int_ok = int_part == "0"
        || (!int_part.is_empty()
            && (b'1'..=b'9').contains(&int_part.as_bytes()[0])
            && int_part.bytes().all(|b| b.is_ascii_digit()));
    let frac_ok = !frac_part.is_empty()
        && frac_part.bytes().all(|b| b.is_ascii_digit())
        && (b'1'..=b'9').contains(&frac_part.as_bytes()[frac_part.len() - 1]);
    int_ok && frac_ok
}

/// Typed value for the computed projection. Raw always keeps the original
/// string; only the projection narrows numeric-looking values.
pub(crate) fn infer_value(raw: &str) -> serde_json::Value {
    if is_integer_literal(raw) {
        if let Ok(n) = raw.parse::<i64>() {
            return serde_json::Value::from(n);
        }
    } else if is_float_literal(raw) {
        if let Ok(f) = raw.parse::<f64>() {
            if let Some(n) = serde_json::Number::from_f64(f) {
                return serde_json::Value::Number(n);
            }
        }
    }
    serde_json::Value::String(raw.to_string())
}

// ── Store-level operations ───────────────────────────────────────────────

/// Append one raw row and rebuild the asset's computed projection. Runs on
/// the topic's connection lock, which serializes metadata writers per topic.
pub(crate) fn write_metadata(
    topic: &TopicStore,
    asset: &str,
    op: MetadataOp,
    key: &str,
    value: Option<&str>,
    processor: &str,
    processor_version: &str,
) -> ApiResult<()> {
    let now = Utc::now().timestamp();
    let conn = topic.conn();
    conn.execute(
        "INSERT INTO metadata_raw (asset_id, processor, processor_version, op, key, value, ts)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![asset, processor, processor_version, op.as_str(), key, value, now],
    )?;

    // Replay the raw log for this asset, latest writer wins per key.
    let mut stmt = conn.prepare(
        "SELECT op, key, value FROM metadata_raw WHERE asset_id = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![asset], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, Option<String>>(2)?,
        ))
    })?;
    let mut live: Vec<(String, String)> = Vec::new();
    for row in rows {
        let (row_op, row_key, row_value) = row?;
        live.retain(|(k, _)| k != &row_key);
        if row_op == "set" {
            if let Some(v) = row_value {
                live.push((row_key, v));
            }
        }
    }
    drop(stmt);

    conn.execute(
        "DELETE FROM metadata_computed WHERE asset_id = ?1",
        params![asset],
    )?;
    for (k, v) in live {
        let value_type = if infer_value(&v).is_number() {
            "number"
        } else {
            "string"
        };
        conn.execute(
            "INSERT INTO metadata_computed (asset_id, key, value, value_type, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![asset, k, v, value_type, now],
        )?;
    }
    Ok(())
}

/// The computed projection as a JSON object, keys sorted.
pub(crate) fn computed_metadata(
    topic: &TopicStore,
    asset: &str,
) -> ApiResult<serde_json::Map<String, serde_json::Value>> {
    let conn = topic.conn();
    let mut stmt = conn.prepare(
        "SELECT key, value, value_type FROM metadata_computed
         WHERE asset_id = ?1 ORDER BY key",
    )?;
    let rows = stmt.query_map(params![asset], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
        ))
    })?;
    let mut out = serde_json::Map::new();
    for row in rows {
        let (key, value, value_type) = row?;
        let typed = if value_type == "number" {
            infer_value(&value)
        } else {
            serde_json::Value::String(value)
        };
        out.insert(key, typed);
    }
    Ok(out)
}

// ── Request flows ────────────────────────────────────────────────────────

fn validate_sizes(runtime: &StorageRuntime, key: &str, value: Option<&str>) -> ApiResult<()> {
    let config = runtime.config();
    check_metadata_key(key, config.max_metadata_key_length)?;
    if let Some(value) = value {
        check_metadata_value(value, config.max_metadata_value_bytes)?;
    }
    Ok(())
}

fn apply_to_owned_asset(
    runtime: &StorageRuntime,
    hash: &str,
    op: MetadataOp,
    key: &str,
    value: Option<&str>,
    processor: &str,
    processor_version: &str,
    check_disk: bool,
) -> ApiResult<()> {
    validate_sizes(runtime, key, value)?;
    let topic = runtime.resolve_owner(hash)?;
    topic.ensure_healthy()?;
    if !topic.asset_exists(hash)? {
        return Err(ApiError::NotFound(format!("asset {hash}")));
    }
    match op {
        MetadataOp::Set => {
            let Some(value) = value else {
                return Err(ApiError::InvalidRequest(
                    "set operation requires a value".to_string(),
                ));
            };
            // Deletes free space and are always admitted; only sets pay the
            // disk quota.
            if check_disk {
                runtime.check_disk_quota(value.len() as u64)?;
            }
            write_metadata(
                &topic,
                hash,
                op,
                key,
                Some(value),
                processor,
                processor_version,
            )?;
        }
        MetadataOp::Delete => {
            write_metadata(&topic, hash, op, key, None, processor, processor_version)?;
        }
    }
    runtime.invalidate_disk();
    Ok(())
}

/// `POST /api/assets/{hash}/metadata`.
pub(crate) fn apply_single(
    runtime: &StorageRuntime,
    hash: &str,
    request: &MetadataRequest,
) -> ApiResult<()> {
    apply_to_owned_asset(
        runtime,
        hash,
        request.op,
        &request.key,
        request.value.as_deref(),
        &request.processor,
        &request.processor_version,
        true,
    )
}

/// `POST /api/assets/metadata/batch`. The operation count and the disk
/// quota are request-level gates: exceeding either fails the whole request
/// before any operation runs. Everything else is per-operation, and a
/// failed operation never short-circuits the rest.
pub(crate) fn apply_batch(
    runtime: &StorageRuntime,
    request: &BatchRequest,
) -> ApiResult<BatchResponse> {
    check_batch_len(request.operations.len(), runtime.config().max_operations)?;
    if request.operations.iter().any(|op| op.op == MetadataOp::Set) {
        runtime.check_disk_quota(0)?;
    }

    let mut results = Vec::with_capacity(request.operations.len());
    for op in &request.operations {
        let outcome = apply_to_owned_asset(
            runtime,
            &op.hash,
            op.op,
            &op.key,
            op.value.as_deref(),
            &request.processor,
            &request.processor_version,
            false,
        );
        results.push(match outcome {
            Ok(()) => OperationResult {
                hash: op.hash.clone(),
                key: op.key.clone(),
                op: op.op.as_str(),
                success: true,
                code: None,
                error: None,
            },
            Err(e) => OperationResult {
                hash: op.hash.clone(),
                key: op.key.clone(),
                op: op.op.as_str(),
                success: false,
                code: Some(e.code()),
                error: Some(e.to_string()),
            },
        });
    }
    Ok(BatchResponse::from_results(results))
}

/// `POST /api/metadata/apply`: run a preset, then apply the operation to
/// every asset it returned. Key and value sizes are rejected before the
/// query executes; per-asset failures are collected like a batch.
pub(crate) fn apply_by_query(
    runtime: &StorageRuntime,
    request: &ApplyRequest,
) -> ApiResult<BatchResponse> {
    validate_sizes(runtime, &request.key, request.value.as_deref())?;
    if request.op == MetadataOp::Set {
        runtime.check_disk_quota(0)?;
    }

    let envelope = execute_query(
        runtime,
        &request.query_preset,
        &request.topics,
        &request.params,
    )?;
    let Some(asset_col) = envelope.columns.iter().position(|c| c == "asset_id") else {
        return Err(ApiError::InvalidRequest(format!(
            "preset {} does not return an asset_id column",
            request.query_preset
        )));
    };

    let mut results = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for row in &envelope.rows {
        let Some(hash) = row.get(asset_col).and_then(|v| v.as_str()) else {
            continue;
        };
        if !seen.insert(hash.to_string()) {
            continue;
        }
        let outcome = apply_to_owned_asset(
            runtime,
            hash,
            request.op,
            &request.key,
            request.value.as_deref(),
            &request.processor,
            &request.processor_version,
            false,
        );
        results.push(match outcome {
            Ok(()) => OperationResult {
                hash: hash.to_string(),
                key: request.key.clone(),
                op: request.op.as_str(),
                success: true,
                code: None,
                error: None,
            },
            Err(e) => OperationResult {
                hash: hash.to_string(),
                key: request.key.clone(),
                op: request.op.as_str(),
                success: false,
                code: Some(e.code()),
                error: Some(e.to_string()),
            },
        });
    }
    Ok(BatchResponse::from_results(results))
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::manager::StorageRuntime;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "datvault_meta_{}_{name}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn runtime_with_asset(dir: &PathBuf, config: &ServerConfig) -> (Arc<StorageRuntime>, String) {
        let rt = StorageRuntime::configure(dir, config).unwrap();
        rt.create_topic("topic-1").unwrap();
        let hash = rt.upload("topic-1", b"metadata target", None, None).unwrap().hash;
        (rt, hash)
    }

    fn set_req(key: &str, value: &str) -> MetadataRequest {
        MetadataRequest {
            op: MetadataOp::Set,
            key: key.to_string(),
            value: Some(value.to_string()),
            processor: "tester".to_string(),
            processor_version: "1.0".to_string(),
        }
    }

    #[test]
    fn test_integer_literal_grammar() {
        assert!(is_integer_literal("0"));
        assert!(is_integer_literal("123"));
        assert!(is_integer_literal("-123"));
        assert!(!is_integer_literal("00123"));
        assert!(!is_integer_literal("-0"));
        assert!(!is_integer_literal("12a"));
        assert!(!is_integer_literal(""));
        assert!(!is_integer_literal("-"));
    }

    #[test]
    fn test_float_literal_grammar() {
        assert!(is_float_literal("123.45"));
        assert!(is_float_literal("0.5"));
        assert!(is_float_literal("-3.25"));
        assert!(!is_float_literal("1.0"));
        assert!(!is_float_literal("1.50"));
        assert!(!is_float_literal("01.5"));
        assert!(!is_float_literal(".5"));
        assert!(!is_float_literal("1."));
        assert!(!is_float_literal("1"));
    }

    #[test]
    fn test_infer_value_table() {
        assert_eq!(infer_value("123"), serde_json::json!(123));
        assert_eq!(infer_value("123.45"), serde_json::json!(123.45));
        assert_eq!(infer_value("00123"), serde_json::json!("00123"));
        assert_eq!(infer_value("1.0"), serde_json::json!("1.0"));
        assert_eq!(infer_value("hello"), serde_json::json!("hello"));
        assert_eq!(infer_value("0"), serde_json::json!(0));
        // Integer overflow falls back to the original string.
        let huge = "9".repeat(40);
        assert_eq!(infer_value(&huge), serde_json::json!(huge));
    }

    #[test]
    fn test_set_and_read_computed() {
        let dir = temp_dir("setread");
        let (rt, hash) = runtime_with_asset(&dir, &ServerConfig::default());

        apply_single(&rt, &hash, &set_req("count", "123")).unwrap();
        apply_single(&rt, &hash, &set_req("label", "00123")).unwrap();

        let topic = rt.topic("topic-1").unwrap();
        let computed = computed_metadata(&topic, &hash).unwrap();
        assert_eq!(computed["count"], serde_json::json!(123));
        assert_eq!(computed["label"], serde_json::json!("00123"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_latest_writer_wins_and_delete() {
        let dir = temp_dir("lww");
        let (rt, hash) = runtime_with_asset(&dir, &ServerConfig::default());
        let topic = rt.topic("topic-1").unwrap();

        apply_single(&rt, &hash, &set_req("k", "first")).unwrap();
        apply_single(&rt, &hash, &set_req("k", "second")).unwrap();
        assert_eq!(
            computed_metadata(&topic, &hash).unwrap()["k"],
            serde_json::json!("second")
        );

        let delete = MetadataRequest {
            op: MetadataOp::Delete,
            key: "k".to_string(),
            value: None,
            processor: "tester".to_string(),
            processor_version: "1.0".to_string(),
        };
        apply_single(&rt, &hash, &delete).unwrap();
        assert!(computed_metadata(&topic, &hash).unwrap().is_empty());

        // The raw audit keeps all three operations.
        let raw_count: i64 = topic
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM metadata_raw WHERE asset_id = ?1",
                rusqlite::params![hash],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(raw_count, 3);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_key_and_value_size_limits() {
        let dir = temp_dir("limits");
        let mut config = ServerConfig::default();
        config.max_metadata_value_bytes = 16;
        let (rt, hash) = runtime_with_asset(&dir, &config);

        let err = apply_single(&rt, &hash, &set_req(&"k".repeat(257), "v")).unwrap_err();
        assert_eq!(err.code(), "METADATA_KEY_TOO_LONG");

        let err = apply_single(&rt, &hash, &set_req("k", &"v".repeat(17))).unwrap_err();
        assert_eq!(err.code(), "METADATA_VALUE_TOO_LONG");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_unknown_asset_404() {
        let dir = temp_dir("unknown");
        let (rt, _hash) = runtime_with_asset(&dir, &ServerConfig::default());
        let err = apply_single(&rt, &"0".repeat(64), &set_req("k", "v")).unwrap_err();
        assert_eq!(err.status(), 404);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_delete_allowed_under_disk_limit() {
        let dir = temp_dir("deletequota");
        let (rt, hash) = {
            // Populate without a limit, then reopen with limit = 1.
            let (rt, hash) = runtime_with_asset(&dir, &ServerConfig::default());
            apply_single(&rt, &hash, &set_req("k", "v")).unwrap();
            drop(rt);
            let mut config = ServerConfig::default();
            config.max_disk_usage = 1;
            (StorageRuntime::configure(&dir, &config).unwrap(), hash)
        };

        let err = apply_single(&rt, &hash, &set_req("k", "v2")).unwrap_err();
        assert_eq!(err.code(), "DISK_LIMIT_EXCEEDED");

        let delete = MetadataRequest {
            op: MetadataOp::Delete,
            key: "k".to_string(),
            value: None,
            processor: "tester".to_string(),
            processor_version: "1.0".to_string(),
        };
        apply_single(&rt, &hash, &delete).unwrap();
        let topic = rt.topic("topic-1").unwrap();
        assert!(computed_metadata(&topic, &hash).unwrap().is_empty());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_batch_over_limit_has_no_side_effects() {
        let dir = temp_dir("batchlimit");
        let mut config = ServerConfig::default();
        config.max_operations = 3;
        let (rt, hash) = runtime_with_asset(&dir, &config);

        let ops: Vec<BatchOperation> = (0..4)
            .map(|i| BatchOperation {
                hash: hash.clone(),
                op: MetadataOp::Set,
                key: format!("k{i}"),
                value: Some("v".to_string()),
            })
            .collect();
        let request = BatchRequest {
            operations: ops,
            processor: "tester".to_string(),
            processor_version: "1.0".to_string(),
        };
        let err = apply_batch(&rt, &request).unwrap_err();
        assert_eq!(err.code(), "BATCH_TOO_MANY_OPERATIONS");

        let topic = rt.topic("topic-1").unwrap();
        assert!(computed_metadata(&topic, &hash).unwrap().is_empty());

        // Exactly at the limit succeeds in full.
        let ops: Vec<BatchOperation> = (0..3)
            .map(|i| BatchOperation {
                hash: hash.clone(),
                op: MetadataOp::Set,
                key: format!("k{i}"),
                value: Some("v".to_string()),
            })
            .collect();
        let request = BatchRequest {
            operations: ops,
            processor: "tester".to_string(),
            processor_version: "1.0".to_string(),
        };
        let response = apply_batch(&rt, &request).unwrap();
        assert!(response.success);
        assert_eq!(response.succeeded, 3);
        assert_eq!(response.failed, 0);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_batch_partial_failure_does_not_short_circuit() {
        let dir = temp_dir("partial");
        let (rt, hash) = runtime_with_asset(&dir, &ServerConfig::default());

        let request = BatchRequest {
            operations: vec![
                BatchOperation {
                    hash: hash.clone(),
                    op: MetadataOp::Set,
                    key: "good".to_string(),
                    value: Some("1".to_string()),
                },
                BatchOperation {
                    hash: hash.clone(),
                    op: MetadataOp::Set,
                    key: "k".repeat(300),
                    value: Some("1".to_string()),
                },
                BatchOperation {
                    hash: hash.clone(),
                    op: MetadataOp::Set,
                    key: "also-good".to_string(),
                    value: Some("2".to_string()),
                },
            ],
            processor: "tester".to_string(),
            processor_version: "1.0".to_string(),
        };
        let response = apply_batch(&rt, &request).unwrap();
        assert!(!response.success);
        assert_eq!(response.succeeded, 2);
        assert_eq!(response.failed, 1);
        assert_eq!(response.results.len(), 3);
        assert!(!response.results[1].success);
        assert_eq!(response.results[1].code, Some("METADATA_KEY_TOO_LONG"));
        assert!(response.results[2].success);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_batch_rejected_when_disk_limit_exceeded() {
        let dir = temp_dir("batchdisk");
        let hash = {
            let (rt, hash) = runtime_with_asset(&dir, &ServerConfig::default());
            drop(rt);
            hash
        };
        let mut config = ServerConfig::default();
        config.max_disk_usage = 1;
        let rt = StorageRuntime::configure(&dir, &config).unwrap();

        let request = BatchRequest {
            operations: vec![BatchOperation {
                hash: hash.clone(),
                op: MetadataOp::Set,
                key: "k".to_string(),
                value: Some("v".to_string()),
            }],
            processor: "tester".to_string(),
            processor_version: "1.0".to_string(),
        };
        let err = apply_batch(&rt, &request).unwrap_err();
        assert_eq!(err.status(), 507);

        // A delete-only batch is not gated on the disk limit.
        let request = BatchRequest {
            operations: vec![BatchOperation {
                hash,
                op: MetadataOp::Delete,
                key: "k".to_string(),
                value: None,
            }],
            processor: "tester".to_string(),
            processor_version: "1.0".to_string(),
        };
        assert!(apply_batch(&rt, &request).unwrap().success);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_apply_by_query_validates_sizes_first() {
        let dir = temp_dir("applyfast");
        let (rt, _hash) = runtime_with_asset(&dir, &ServerConfig::default());

        let request = ApplyRequest {
            query_preset: "definitely-not-a-preset".to_string(),
            topics: Vec::new(),
            params: HashMap::new(),
            op: MetadataOp::Set,
            key: "k".repeat(300),
            value: Some("v".to_string()),
            processor: "tester".to_string(),
            processor_version: "1.0".to_string(),
        };
        // Size validation fires before the preset is even resolved.
        let err = apply_by_query(&rt, &request).unwrap_err();
        assert_eq!(err.code(), "METADATA_KEY_TOO_LONG");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_apply_by_query_fans_out() {
        let dir = temp_dir("applyfan");
        let (rt, hash) = runtime_with_asset(&dir, &ServerConfig::default());
        let second = rt.upload("topic-1", b"second target", None, None).unwrap().hash;

        let request = ApplyRequest {
            query_preset: "assets".to_string(),
            topics: vec!["topic-1".to_string()],
            params: HashMap::new(),
            op: MetadataOp::Set,
            key: "reviewed".to_string(),
            value: Some("true".to_string()),
            processor: "tester".to_string(),
            processor_version: "1.0".to_string(),
        };
        let response = apply_by_query(&rt, &request).unwrap();
        assert!(response.success);
        assert_eq!(response.succeeded, 2);

        let topic = rt.topic("topic-1").unwrap();
        for h in [&hash, &second] {
            assert_eq!(
                computed_metadata(&topic, h).unwrap()["reviewed"],
                serde_json::json!("true")
            );
        }
        std::fs::remove_dir_all(&dir).ok();
    }
}
