//! Per-request trace records and the daily append-only log.
//!
//! Every request that reaches the forwarding engine produces exactly one
//! trace: the captured inbound request, the routing decision, each upstream
//! attempt, and the final outcome, written as a single JSON line to
//! `<log_dir>/<YYYY-MM-DD>.log`.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use axum::http::HeaderMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{error, warn};

use crate::health::now_millis;

/// Replacement for captured values that represent live stream or socket
/// handles; those must never reach the log.
pub const STREAM_SENTINEL: &str = "[Stream/Socket Data]";

const SLOW_APPEND_MS: u128 = 50;

static TRACE_ID_SEQ: AtomicU64 = AtomicU64::new(0);

fn generate_trace_id() -> String {
    let seq = TRACE_ID_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("req-{}-{seq}", now_millis())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedRequest {
    pub method: String,
    pub path: String,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub provider: String,
    pub weight: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingDecision {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    pub candidates: Vec<Candidate>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceAttempt {
    pub provider: String,
    pub weight: f64,
    pub streaming: bool,
    pub request_headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_headers: Option<BTreeMap<String, String>>,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Trace {
    pub id: String,
    pub started_at: u64,
    pub key_name: String,
    pub request: CapturedRequest,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routing: Option<RoutingDecision>,
    pub attempts: Vec<TraceAttempt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    pub status: u16,
    pub duration_ms: u64,
}

impl Trace {
    pub fn begin(
        key_name: impl Into<String>,
        method: &axum::http::Method,
        path: impl Into<String>,
        headers: &HeaderMap,
        body: Value,
    ) -> Self {
        Self {
            id: generate_trace_id(),
            started_at: now_millis(),
            key_name: key_name.into(),
            request: CapturedRequest {
                method: method.as_str().to_string(),
                path: path.into(),
                headers: headers_to_map(headers),
                body,
            },
            routing: None,
            attempts: Vec::new(),
            response: None,
            status: 0,
            duration_ms: 0,
        }
    }

    /// Seals the trace with its terminal status and total duration.
    pub fn finish(&mut self, status: u16) {
        self.status = status;
        self.duration_ms = now_millis().saturating_sub(self.started_at);
    }
}

pub fn headers_to_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).to_string(),
            )
        })
        .collect()
}

fn looks_like_handle(object: &serde_json::Map<String, Value>) -> bool {
    object.contains_key("pipe")
        || object.contains_key("_handle")
        || object.contains_key("_readableState")
}

/// Recursively replaces captured values that represent live stream or
/// socket handles with [`STREAM_SENTINEL`].
pub fn sanitize_value(value: &mut Value) {
    match value {
        Value::Object(object) => {
            if looks_like_handle(object) {
                *value = Value::String(STREAM_SENTINEL.to_string());
                return;
            }
            for child in object.values_mut() {
                sanitize_value(child);
            }
        }
        Value::Array(items) => {
            for item in items {
                sanitize_value(item);
            }
        }
        _ => {}
    }
}

/// Owns the daily log file. Appends are serialized; failures are logged
/// and swallowed so recording never breaks a client response.
#[derive(Debug)]
pub struct TraceRecorder {
    log_dir: PathBuf,
    append_lock: Mutex<()>,
}

impl TraceRecorder {
    pub fn new(log_dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let log_dir = log_dir.into();
        fs::create_dir_all(&log_dir)?;
        Ok(Self {
            log_dir,
            append_lock: Mutex::new(()),
        })
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Path of today's log, computed from the wall clock at call time.
    pub fn today_path(&self) -> PathBuf {
        let date = chrono::Utc::now().format("%Y-%m-%d");
        self.log_dir.join(format!("{date}.log"))
    }

    pub async fn append(&self, trace: &Trace) {
        let mut value = match serde_json::to_value(trace) {
            Ok(value) => value,
            Err(err) => {
                error!(trace_id = %trace.id, "failed to serialize trace: {err}");
                return;
            }
        };
        sanitize_value(&mut value);

        let path = self.today_path();
        let _guard = self.append_lock.lock().await;
        let started = Instant::now();
        if let Err(err) = append_line(&path, &value) {
            error!(trace_id = %trace.id, path = %path.display(), "trace append failed: {err}");
            return;
        }
        let elapsed = started.elapsed().as_millis();
        if elapsed > SLOW_APPEND_MS {
            warn!(trace_id = %trace.id, elapsed_ms = elapsed as u64, "slow trace append");
        }
    }

    /// Parses today's log into JSON entries, skipping malformed lines.
    pub fn load_today(&self) -> Vec<Value> {
        let raw = match fs::read_to_string(self.today_path()) {
            Ok(raw) => raw,
            Err(_) => return Vec::new(),
        };
        raw.lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    /// Deletes today's log, or every `*.log` in the dir. Returns the
    /// number of files removed.
    pub fn clear(&self, all: bool) -> std::io::Result<usize> {
        if !all {
            let path = self.today_path();
            return match fs::remove_file(&path) {
                Ok(()) => Ok(1),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(0),
                Err(err) => Err(err),
            };
        }

        let mut removed = 0;
        for entry in fs::read_dir(&self.log_dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "log") {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn append_line(path: &Path, value: &Value) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{value}")
}
