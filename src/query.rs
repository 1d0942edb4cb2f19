//! Named query presets fanned out across topic stores.
//!
//! A preset is a server-defined parameterized SQL statement executed against
//! each selected topic's `index.db`. Results from all topics are merged into
//! one `{preset, columns, rows}` envelope; when more than one topic is
//! selected a `_topic` column is prepended so rows stay attributable.

use std::collections::HashMap;

use rusqlite::types::ValueRef;
use rusqlite::ToSql;
use serde::Serialize;

use crate::errors::{ApiError, ApiResult};
use crate::manager::StorageRuntime;
use crate::util::to_hex;

pub(crate) struct QueryPreset {
    pub(crate) name: &'static str,
    pub(crate) description: &'static str,
    /// Required parameters; missing or empty values are rejected.
    pub(crate) params: &'static [&'static str],
    sql: &'static str,
}

pub(crate) const PRESETS: &[QueryPreset] = &[
    QueryPreset {
        name: "assets",
        description: "All assets in the topic, oldest first",
        params: &[],
        sql: "SELECT asset_id, size, parent_id, filename, created_at
              FROM assets ORDER BY created_at, asset_id",
    },
    QueryPreset {
        name: "lineage",
        description: "The asset and its ancestor chain, root first",
        params: &["hash"],
        sql: "WITH RECURSIVE chain(asset_id, parent_id, size, depth) AS (
                  SELECT asset_id, parent_id, size, 0 FROM assets WHERE asset_id = :hash
                  UNION ALL
                  SELECT a.asset_id, a.parent_id, a.size, chain.depth + 1
                  FROM assets a JOIN chain ON a.asset_id = chain.parent_id
              )
              SELECT asset_id, parent_id, size, depth FROM chain ORDER BY depth DESC",
    },
    QueryPreset {
        name: "derived",
        description: "Every asset transitively derived from the given one",
        params: &["hash"],
        sql: "WITH RECURSIVE descendants(asset_id, parent_id, size, depth) AS (
                  SELECT asset_id, parent_id, size, 1 FROM assets WHERE parent_id = :hash
                  UNION ALL
                  SELECT a.asset_id, a.parent_id, a.size, d.depth + 1
                  FROM assets a JOIN descendants d ON a.parent_id = d.asset_id
              )
              SELECT asset_id, parent_id, size, depth FROM descendants
              ORDER BY depth, asset_id",
    },
    QueryPreset {
        name: "metadata",
        description: "Computed metadata rows for an asset",
        params: &["hash"],
        sql: "SELECT asset_id, key, value, value_type, updated_at
              FROM metadata_computed WHERE asset_id = :hash ORDER BY key",
    },
];

pub(crate) fn find_preset(name: &str) -> Option<&'static QueryPreset> {
    PRESETS.iter().find(|p| p.name == name)
}

#[derive(Debug, Serialize)]
pub(crate) struct QueryEnvelope {
    pub(crate) preset: String,
    pub(crate) columns: Vec<String>,
    pub(crate) rows: Vec<Vec<serde_json::Value>>,
}

fn value_to_json(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        ValueRef::Text(t) => {
            serde_json::Value::String(String::from_utf8_lossy(t).into_owned())
        }
        ValueRef::Blob(b) => serde_json::Value::String(to_hex(b)),
    }
}

/// Execute `preset_name` against the selected topics and merge the results.
pub(crate) fn execute_query(
    runtime: &StorageRuntime,
    preset_name: &str,
    topics: &[String],
    params: &HashMap<String, String>,
) -> ApiResult<QueryEnvelope> {
    let Some(preset) = find_preset(preset_name) else {
        return Err(ApiError::PresetNotFound(preset_name.to_string()));
    };

    let mut bound: Vec<(String, String)> = Vec::with_capacity(preset.params.len());
    for name in preset.params {
        match params.get(*name) {
            Some(value) if !value.is_empty() => {
                bound.push((format!(":{name}"), value.clone()));
            }
            _ => return Err(ApiError::MissingParam((*name).to_string())),
        }
    }

    let selected = runtime.select_topics(topics)?;
    let tag_topic = selected.len() > 1;

    let mut columns: Vec<String> = Vec::new();
    let mut rows: Vec<Vec<serde_json::Value>> = Vec::new();

    for store in &selected {
        let conn = store.conn();
        let mut stmt = conn.prepare(preset.sql)?;
        if columns.is_empty() {
            if tag_topic {
                columns.push("_topic".to_string());
            }
            columns.extend(stmt.column_names().iter().map(|c| c.to_string()));
        }
        let width = stmt.column_count();

        let binds: Vec<(&str, &dyn ToSql)> = bound
            .iter()
            .map(|(name, value)| (name.as_str(), value as &dyn ToSql))
            .collect();
        let mut result = stmt.query(binds.as_slice())?;
        while let Some(row) = result.next()? {
            let mut out = Vec::with_capacity(width + usize::from(tag_topic));
            if tag_topic {
                out.push(serde_json::Value::String(store.name().to_string()));
            }
            for i in 0..width {
                out.push(value_to_json(row.get_ref(i)?));
            }
            rows.push(out);
        }
    }

    Ok(QueryEnvelope {
        preset: preset_name.to_string(),
        columns,
        rows,
    })
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
            "datvault_query_{}_{name}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn runtime(dir: &PathBuf) -> Arc<StorageRuntime> {
        StorageRuntime::configure(dir, &ServerConfig::default()).unwrap()
    }

    fn params(hash: &str) -> HashMap<String, String> {
        HashMap::from([("hash".to_string(), hash.to_string())])
    }

    fn column_values(envelope: &QueryEnvelope, column: &str) -> Vec<String> {
        let idx = envelope
            .columns
            .iter()
            .position(|c| c == column)
            .expect("column present");
        envelope
            .rows
            .iter()
            .filter_map(|row| row[idx].as_str().map(|s| s.to_string()))
            .collect()
    }

    #[test]
    fn test_unknown_preset_and_missing_param() {
        let dir = temp_dir("errors");
        let rt = runtime(&dir);
        rt.create_topic("topic-1").unwrap();

        let err = execute_query(&rt, "nope", &[], &HashMap::new()).unwrap_err();
        assert_eq!(err.code(), "PRESET_NOT_FOUND");
        assert_eq!(err.status(), 404);

        let err = execute_query(&rt, "lineage", &[], &HashMap::new()).unwrap_err();
        assert_eq!(err.code(), "MISSING_PARAM");

        // Present but empty counts as missing.
        let err = execute_query(&rt, "lineage", &[], &params("")).unwrap_err();
        assert_eq!(err.code(), "MISSING_PARAM");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_lineage_and_derived() {
        let dir = temp_dir("lineage");
        let rt = runtime(&dir);
        rt.create_topic("topic-1").unwrap();

        let a = rt.upload("topic-1", b"generation a", None, None).unwrap().hash;
        let b = rt.upload("topic-1", b"generation b", None, Some(&a)).unwrap().hash;
        let c = rt.upload("topic-1", b"generation c", None, Some(&b)).unwrap().hash;

        let envelope =
            execute_query(&rt, "lineage", &["topic-1".to_string()], &params(&c)).unwrap();
        let ids = column_values(&envelope, "asset_id");
        assert_eq!(ids, vec![a.clone(), b.clone(), c.clone()]);

        let envelope =
            execute_query(&rt, "derived", &["topic-1".to_string()], &params(&a)).unwrap();
        let ids = column_values(&envelope, "asset_id");
        assert_eq!(ids, vec![b.clone(), c.clone()]);

        // A leaf has no derived assets.
        let envelope =
            execute_query(&rt, "derived", &["topic-1".to_string()], &params(&c)).unwrap();
        assert!(envelope.rows.is_empty());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_multi_topic_rows_are_tagged() {
        let dir = temp_dir("fanout");
        let rt = runtime(&dir);
        rt.create_topic("topic-1").unwrap();
        rt.create_topic("topic-2").unwrap();
        rt.upload("topic-1", b"first topic asset", None, None).unwrap();
        rt.upload("topic-2", b"second topic asset", None, None).unwrap();

        // Empty selection fans out over all healthy topics.
        let envelope = execute_query(&rt, "assets", &[], &HashMap::new()).unwrap();
        assert_eq!(envelope.columns[0], "_topic");
        let topics = column_values(&envelope, "_topic");
        assert_eq!(topics, vec!["topic-1", "topic-2"]);

        // Single-topic selection carries no _topic column.
        let envelope =
            execute_query(&rt, "assets", &["topic-1".to_string()], &HashMap::new()).unwrap();
        assert!(!envelope.columns.iter().any(|c| c == "_topic"));
        assert_eq!(envelope.rows.len(), 1);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_query_rejects_bad_selection() {
        let dir = temp_dir("badsel");
        let rt = runtime(&dir);
        rt.create_topic("topic-1").unwrap();
        rt.topic("topic-1").unwrap().mark_unhealthy("broken".into());

        let err = execute_query(
            &rt,
            "assets",
            &["topic-1".to_string()],
            &HashMap::new(),
        )
        .unwrap_err();
        assert_eq!(err.code(), "TOPIC_UNHEALTHY");
        assert_eq!(err.status(), 400);

        let err = execute_query(
            &rt,
            "assets",
            &["ghost".to_string()],
            &HashMap::new(),
        )
        .unwrap_err();
        assert_eq!(err.code(), "TOPIC_NOT_FOUND");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_metadata_preset_returns_typed_rows() {
        let dir = temp_dir("metapreset");
        let rt = runtime(&dir);
        rt.create_topic("topic-1").unwrap();
        let hash = rt.upload("topic-1", b"asset", None, None).unwrap().hash;
        let topic = rt.topic("topic-1").unwrap();
        crate::metadata::write_metadata(
            &topic,
            &hash,
            crate::metadata::MetadataOp::Set,
            "rating",
            Some("5"),
            "tester",
            "1.0",
        )
        .unwrap();

        let envelope =
            execute_query(&rt, "metadata", &["topic-1".to_string()], &params(&hash)).unwrap();
        assert_eq!(envelope.rows.len(), 1);
        let key_idx = envelope.columns.iter().position(|c| c == "key").unwrap();
        assert_eq!(envelope.rows[0][key_idx], serde_json::json!("rating"));
        std::fs::remove_dir_all(&dir).ok();
    }
}
