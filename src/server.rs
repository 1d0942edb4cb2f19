//! HTTP API over tiny_http.
//!
//! One accept loop shared by a fixed pool of worker threads; routing is a
//! match over `(method, path segments)`. All request and response bodies
//! are JSON except blob downloads, the multipart upload, and served log
//! files. Errors cross the wire as `{code, message}` envelopes.

use std::collections::HashMap;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use chrono::Utc;
use log::{debug, error, info};
use serde::Deserialize;
use tiny_http::{Header, Method, Request, Response, Server, StatusCode};
use url::form_urlencoded;

use crate::errors::{ApiError, ApiResult};
use crate::logging::log_file_path;
use crate::manager::AppState;
use crate::metadata::{
    apply_batch, apply_by_query, apply_single, computed_metadata, ApplyRequest, BatchRequest,
    MetadataRequest,
};
use crate::query::{execute_query, PRESETS};
use crate::util::{lock, sha256_hex};

/// Parsed response ready to be written back.
enum Handled {
    Json(u16, serde_json::Value),
    Raw(u16, Vec<u8>, &'static str),
}

pub(crate) fn run_server(state: Arc<AppState>) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", state.config.bind, state.config.port);
    let server = Server::http(&addr)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("server: {e}")))?;
    info!("listening on http://{addr}");

    let server = Arc::new(server);
    let workers = thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .clamp(2, 16);
    let mut handles = Vec::new();
    for _ in 0..workers {
        let server = server.clone();
        let state = state.clone();
        handles.push(thread::spawn(move || loop {
            match server.recv() {
                Ok(request) => handle_request(&state, request),
                Err(e) => {
                    error!("accept: {e}");
                    break;
                }
            }
        }));
    }
    for handle in handles {
        let _ = handle.join();
    }
    Ok(())
}

fn handle_request(state: &AppState, mut request: Request) {
    let method = request.method().clone();
    let url = request.url().to_string();
    debug!("{method} {url}");

    let (path, query) = match url.split_once('?') {
        Some((p, q)) => (p, q),
        None => (url.as_str(), ""),
    };
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    let outcome = route(state, &mut request, &method, &segments, query);
    let response = match outcome {
        Ok(Handled::Json(status, body)) => json_response(status, &body),
        Ok(Handled::Raw(status, bytes, content_type)) => raw_response(status, bytes, content_type),
        Err(e) => {
            if e.status() >= 500 {
                error!("{method} {path}: {e}");
            }
            json_response(e.status(), &e.envelope())
        }
    };
    let _ = request.respond(response);
}

fn route(
    state: &AppState,
    request: &mut Request,
    method: &Method,
    segments: &[&str],
    query: &str,
) -> ApiResult<Handled> {
    match (method, segments) {
        (Method::Get, ["api", "config"]) => get_config(state),
        (Method::Post, ["api", "config"]) => post_config(state, request),
        (Method::Get, ["api", "topics"]) => get_topics(state),
        (Method::Post, ["api", "topics"]) => post_topics(state, request),
        (Method::Post, ["api", "topics", name, "upload"]) => upload(state, request, name, query),
        (Method::Get, ["api", "assets", hash, "download"]) => download(state, hash),
        (Method::Get, ["api", "assets", hash, "metadata"]) => get_metadata(state, hash),
        (Method::Post, ["api", "assets", hash, "metadata"]) => post_metadata(state, request, hash),
        (Method::Post, ["api", "assets", "metadata", "batch"]) => post_batch(state, request),
        (Method::Post, ["api", "metadata", "apply"]) => post_apply(state, request),
        (Method::Get, ["api", "query"]) => list_presets(),
        (Method::Post, ["api", "query", preset]) => post_query(state, request, preset),
        (Method::Get, ["api", "monitoring"]) => monitoring(state),
        (Method::Get, ["api", "monitoring", "logs", category, file]) => {
            read_log(state, category, file)
        }
        (Method::Post, ["api", "auth", "login"]) => login(state, request),
        _ => Err(ApiError::NotFound(format!(
            "{} /{}",
            method,
            segments.join("/")
        ))),
    }
}

// ── Body helpers ─────────────────────────────────────────────────────────

fn read_body(request: &mut Request, cap: u64) -> ApiResult<Vec<u8>> {
    let mut body = Vec::new();
    request
        .as_reader()
        .take(cap + 1)
        .read_to_end(&mut body)
        .map_err(|e| ApiError::internal(format!("read body: {e}")))?;
    if body.len() as u64 > cap {
        return Err(ApiError::BlobTooLarge {
            size: body.len() as u64,
            max: cap,
        });
    }
    Ok(body)
}

fn json_body_cap(state: &AppState) -> u64 {
    // Room for a full batch of maximum-size values plus envelope overhead.
    (state.config.max_metadata_value_bytes as u64)
        .saturating_mul(state.config.max_operations as u64)
        .saturating_add(1 << 20)
}

fn parse_json_body(state: &AppState, request: &mut Request) -> ApiResult<serde_json::Value> {
    let body = read_body(request, json_body_cap(state))?;
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(serde_json::json!({}));
    }
    serde_json::from_slice(&body)
        .map_err(|e| ApiError::InvalidRequest(format!("invalid json body: {e}")))
}

fn parse_typed<T: serde::de::DeserializeOwned>(
    state: &AppState,
    request: &mut Request,
) -> ApiResult<T> {
    let value = parse_json_body(state, request)?;
    serde_json::from_value(value)
        .map_err(|e| ApiError::InvalidRequest(format!("invalid request body: {e}")))
}

fn json_response(status: u16, body: &serde_json::Value) -> Response<io::Cursor<Vec<u8>>> {
    let data = serde_json::to_vec(body).unwrap_or_default();
    let mut response = Response::from_data(data).with_status_code(StatusCode(status));
    if let Ok(header) = Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]) {
        response.add_header(header);
    }
    response
}

fn raw_response(
    status: u16,
    bytes: Vec<u8>,
    content_type: &str,
) -> Response<io::Cursor<Vec<u8>>> {
    let mut response = Response::from_data(bytes).with_status_code(StatusCode(status));
    if let Ok(header) = Header::from_bytes(&b"Content-Type"[..], content_type.as_bytes()) {
        response.add_header(header);
    }
    response
}

// ── Multipart ────────────────────────────────────────────────────────────

pub(crate) struct MultipartPart {
    pub(crate) name: String,
    pub(crate) filename: Option<String>,
    pub(crate) data: Vec<u8>,
}

fn find_subslice(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || haystack.len() < from + needle.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

fn header_param(header_line: &str, param: &str) -> Option<String> {
    for piece in header_line.split(';') {
        let piece = piece.trim();
        if let Some(rest) = piece.strip_prefix(param) {
            let rest = rest.trim_start_matches('=').trim();
            return Some(rest.trim_matches('"').to_string());
        }
    }
    None
}

/// Minimal `multipart/form-data` parser: enough for a file part plus small
/// text fields, which is all the upload endpoint accepts.
pub(crate) fn parse_multipart(body: &[u8], boundary: &str) -> Result<Vec<MultipartPart>, String> {
    let delimiter = format!("--{boundary}");
    let delimiter = delimiter.as_bytes();
    let mut parts = Vec::new();

    let mut pos = find_subslice(body, delimiter, 0).ok_or("missing opening boundary")?;
    loop {
        pos += delimiter.len();
        if body[pos..].starts_with(b"--") {
            break; // closing delimiter
        }
        if body[pos..].starts_with(b"\r\n") {
            pos += 2;
        }
        let head_end =
            find_subslice(body, b"\r\n\r\n", pos).ok_or("part headers not terminated")?;
        let headers = String::from_utf8_lossy(&body[pos..head_end]);
        let data_start = head_end + 4;
        let next = find_subslice(body, delimiter, data_start)
            .ok_or("part data not terminated by boundary")?;
        let mut data_end = next;
        if data_end >= 2 && &body[data_end - 2..data_end] == b"\r\n" {
            data_end -= 2;
        }

        let mut name = None;
        let mut filename = None;
        for line in headers.lines() {
            let lower = line.to_ascii_lowercase();
            if lower.starts_with("content-disposition:") {
                name = header_param(line, "name");
                filename = header_param(line, "filename");
            }
        }
        parts.push(MultipartPart {
            name: name.unwrap_or_default(),
            filename,
            data: body[data_start..data_end].to_vec(),
        });
        pos = next;
    }
    Ok(parts)
}

fn multipart_boundary(request: &Request) -> ApiResult<String> {
    let header = request
        .headers()
        .iter()
        .find(|h| h.field.equiv("Content-Type"))
        .ok_or_else(|| ApiError::InvalidRequest("missing content-type".to_string()))?;
    let value = header.value.as_str();
    if !value
        .to_ascii_lowercase()
        .starts_with("multipart/form-data")
    {
        return Err(ApiError::InvalidRequest(
            "upload requires multipart/form-data".to_string(),
        ));
    }
    let boundary = value
        .split(';')
        .map(str::trim)
        .find_map(|piece| piece.strip_prefix("boundary="))
        .map(|b| b.trim_matches('"').to_string())
        .filter(|b| !b.is_empty())
        .ok_or_else(|| ApiError::InvalidRequest("missing multipart boundary".to_string()))?;
    Ok(boundary)
}

// ── Handlers ─────────────────────────────────────────────────────────────

fn get_config(state: &AppState) -> ApiResult<Handled> {
    let body = match state.runtime() {
        Some(runtime) => serde_json::json!({
            "configured": true,
            "working_directory": runtime.working_dir().display().to_string(),
        }),
        None => serde_json::json!({ "configured": false }),
    };
    Ok(Handled::Json(200, body))
}

#[derive(Deserialize)]
struct ConfigBody {
    working_directory: String,
}

fn post_config(state: &AppState, request: &mut Request) -> ApiResult<Handled> {
    let body: ConfigBody = parse_typed(state, request)?;
    if body.working_directory.trim().is_empty() {
        return Err(ApiError::InvalidRequest(
            "working_directory must not be empty".to_string(),
        ));
    }
    let path = PathBuf::from(&body.working_directory);
    let runtime = state.configure_working_dir(&path)?;
    if let Err(e) = crate::logging::set_log_root(runtime.working_dir()) {
        error!("log root: {e}");
    }
    Ok(Handled::Json(
        200,
        serde_json::json!({
            "configured": true,
            "working_directory": runtime.working_dir().display().to_string(),
        }),
    ))
}

fn get_topics(state: &AppState) -> ApiResult<Handled> {
    let runtime = state.require_runtime()?;
    let topics = runtime.list_topics();
    Ok(Handled::Json(
        200,
        serde_json::json!({ "topics": topics }),
    ))
}

#[derive(Deserialize)]
struct CreateTopicBody {
    name: String,
}

fn post_topics(state: &AppState, request: &mut Request) -> ApiResult<Handled> {
    let runtime = state.require_runtime()?;
    let body: CreateTopicBody = parse_typed(state, request)?;
    let summary = runtime.create_topic(&body.name)?;
    Ok(Handled::Json(201, serde_json::to_value(summary)?))
}

fn upload(
    state: &AppState,
    request: &mut Request,
    topic: &str,
    query: &str,
) -> ApiResult<Handled> {
    let runtime = state.require_runtime()?;
    let boundary = multipart_boundary(request)?;
    // Multipart framing overhead on top of the largest admissible blob.
    let body = read_body(request, state.config.max_dat_size.saturating_add(1 << 20))?;
    let parts = parse_multipart(&body, &boundary).map_err(ApiError::InvalidRequest)?;

    let file = parts
        .iter()
        .find(|p| p.name == "file")
        .or_else(|| parts.iter().find(|p| p.filename.is_some()))
        .ok_or_else(|| ApiError::InvalidRequest("missing file part".to_string()))?;

    let mut parent_id = parts
        .iter()
        .find(|p| p.name == "parent_id")
        .and_then(|p| String::from_utf8(p.data.clone()).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    if parent_id.is_none() {
        parent_id = form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == "parent_id")
            .map(|(_, v)| v.into_owned())
            .filter(|s| !s.is_empty());
    }

    let response = runtime.upload(
        topic,
        &file.data,
        file.filename.as_deref(),
        parent_id.as_deref(),
    )?;
    Ok(Handled::Json(200, serde_json::to_value(response)?))
}

fn download(state: &AppState, hash: &str) -> ApiResult<Handled> {
    let runtime = state.require_runtime()?;
    let bytes = runtime.download(hash)?;
    Ok(Handled::Raw(200, bytes, "application/octet-stream"))
}

fn get_metadata(state: &AppState, hash: &str) -> ApiResult<Handled> {
    let runtime = state.require_runtime()?;
    let topic = runtime.resolve_owner(hash)?;
    if !topic.asset_exists(hash)? {
        return Err(ApiError::NotFound(format!("asset {hash}")));
    }
    let computed = computed_metadata(&topic, hash)?;
    Ok(Handled::Json(
        200,
        serde_json::json!({ "computed_metadata": computed }),
    ))
}

fn post_metadata(state: &AppState, request: &mut Request, hash: &str) -> ApiResult<Handled> {
    let runtime = state.require_runtime()?;
    let body: MetadataRequest = parse_typed(state, request)?;
    apply_single(&runtime, hash, &body)?;
    Ok(Handled::Json(200, serde_json::json!({ "success": true })))
}

fn post_batch(state: &AppState, request: &mut Request) -> ApiResult<Handled> {
    let runtime = state.require_runtime()?;
    let body: BatchRequest = parse_typed(state, request)?;
    let response = apply_batch(&runtime, &body)?;
    Ok(Handled::Json(200, serde_json::to_value(response)?))
}

fn post_apply(state: &AppState, request: &mut Request) -> ApiResult<Handled> {
    let runtime = state.require_runtime()?;
    let body: ApplyRequest = parse_typed(state, request)?;
    let response = apply_by_query(&runtime, &body)?;
    Ok(Handled::Json(200, serde_json::to_value(response)?))
}

fn list_presets() -> ApiResult<Handled> {
    let presets: Vec<serde_json::Value> = PRESETS
        .iter()
        .map(|p| {
            serde_json::json!({
                "name": p.name,
                "description": p.description,
                "params": p.params,
            })
        })
        .collect();
    Ok(Handled::Json(200, serde_json::json!({ "presets": presets })))
}

#[derive(Deserialize, Default)]
struct QueryBody {
    #[serde(default)]
    topics: Vec<String>,
    #[serde(default)]
    params: HashMap<String, String>,
}

fn post_query(state: &AppState, request: &mut Request, preset: &str) -> ApiResult<Handled> {
    let runtime = state.require_runtime()?;
    let body: QueryBody = parse_typed(state, request)?;
    let envelope = execute_query(&runtime, preset, &body.topics, &body.params)?;
    Ok(Handled::Json(200, serde_json::to_value(envelope)?))
}

fn monitoring(state: &AppState) -> ApiResult<Handled> {
    let mut application = serde_json::json!({
        "configured": false,
        "max_disk_usage_bytes": state.config.max_disk_usage,
        "max_dat_size_bytes": state.config.max_dat_size,
        "max_operations": state.config.max_operations,
        "max_metadata_key_length": state.config.max_metadata_key_length,
        "max_metadata_value_bytes": state.config.max_metadata_value_bytes,
        "log_file_max_read_bytes": state.config.log_file_max_read_bytes,
        "max_login_attempts": state.config.max_login_attempts,
    });
    let mut topics = serde_json::Value::Array(Vec::new());
    let mut index = serde_json::json!({ "assets": 0 });

    if let Some(runtime) = state.runtime() {
        application["configured"] = serde_json::json!(true);
        application["working_directory"] =
            serde_json::json!(runtime.working_dir().display().to_string());
        application["disk_usage_bytes"] = serde_json::json!(runtime.disk_usage());
        topics = serde_json::to_value(runtime.list_topics())?;
        let (assets, total_size, earliest) = runtime.orchestrator().stats();
        index = serde_json::json!({
            "assets": assets,
            "total_size": total_size,
            "earliest_first_seen": earliest,
        });
    }

    Ok(Handled::Json(
        200,
        serde_json::json!({
            "application": application,
            "topics": topics,
            "index": index,
        }),
    ))
}

fn read_log(state: &AppState, category: &str, file: &str) -> ApiResult<Handled> {
    let runtime = state.require_runtime()?;
    let Some(path) = log_file_path(runtime.working_dir(), category, file) else {
        return Err(ApiError::NotFound(format!("log {category}/{file}")));
    };
    if !path.is_file() {
        return Err(ApiError::NotFound(format!("log {category}/{file}")));
    }
    let bytes = crate::logging::read_log_capped(&path, state.config.log_file_max_read_bytes)?;
    Ok(Handled::Raw(200, bytes, "text/plain"))
}

#[derive(Deserialize)]
struct LoginBody {
    username: String,
    password: String,
}

fn login(state: &AppState, request: &mut Request) -> ApiResult<Handled> {
    let body: LoginBody = parse_typed(state, request)?;
    state.logins.check(&body.username)?;

    let valid = match (&state.config.admin_username, &state.config.admin_password) {
        (Some(user), Some(pass)) => &body.username == user && &body.password == pass,
        _ => false,
    };
    if !valid {
        state.logins.record_failure(&body.username);
        return Err(ApiError::LoginFailed);
    }

    state.logins.reset(&body.username);
    let token = sha256_hex(
        format!(
            "{}:{}",
            body.username,
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        )
        .as_bytes(),
    );
    lock(&state.sessions).insert(token.clone());
    Ok(Handled::Json(200, serde_json::json!({ "token": token })))
}

// ── Tests ────────────────────────────────────────────────────────────────
