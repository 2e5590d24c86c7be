//! Admin surface: CRUD over providers, groups and access keys, stats and
//! health inspection, trace-log queries and the upstream model probe.
//! Everything sits behind HTTP Basic auth with built-in default
//! credentials; deployments are expected to front this with something
//! stronger.

use std::collections::BTreeMap;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::Engine as _;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::health::{now_millis, HealthEvent};
use crate::http::{error_response, internal_error, relay_error_response, GatewayState};
use crate::store::{AccessKey, GroupConfig, ProviderConfig, ProviderStats, StoreError};
use crate::upstream::ProviderClient;

const ADMIN_USER: &str = "admin";
const ADMIN_PASS: &str = "admin123";

const BASE_WEIGHT: f64 = 1000.0;

fn ensure_admin(headers: &HeaderMap) -> Result<(), Response> {
    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Basic "))
        .and_then(|raw| {
            base64::engine::general_purpose::STANDARD
                .decode(raw.trim())
                .ok()
        })
        .and_then(|bytes| String::from_utf8(bytes).ok());

    match provided {
        Some(credentials) if credentials == format!("{ADMIN_USER}:{ADMIN_PASS}") => Ok(()),
        _ => {
            let mut response = error_response(
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "admin authentication required",
            )
            .into_response();
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Basic realm=\"relay-admin\""),
            );
            Err(response)
        }
    }
}

fn store_error(err: StoreError) -> Response {
    internal_error(err.to_string())
}

/// Keeps oversized/malformed admin bodies in the same error envelope as
/// every other failure path.
fn json_rejection(rejection: JsonRejection) -> Response {
    error_response(rejection.status(), "invalid_request", rejection.body_text()).into_response()
}

fn random_alphanumeric(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| rng.sample(rand::distributions::Alphanumeric) as char)
        .collect()
}

// --- providers ---

pub(crate) async fn list_providers(
    State(state): State<GatewayState>,
    headers: HeaderMap,
) -> Result<Json<Vec<ProviderConfig>>, Response> {
    ensure_admin(&headers)?;
    let providers = state.store.providers().map_err(store_error)?;
    Ok(Json(providers.into_values().collect()))
}

pub(crate) async fn upsert_provider(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    payload: Result<Json<ProviderConfig>, JsonRejection>,
) -> Result<Response, Response> {
    ensure_admin(&headers)?;
    let Json(provider) = payload.map_err(json_rejection)?;
    if provider.name.trim().is_empty() {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "provider name must not be empty",
        )
        .into_response());
    }
    let mut providers = state.store.providers().map_err(store_error)?;
    let inserted = providers
        .insert(provider.name.clone(), provider.clone())
        .is_none();
    state.store.save_providers(&providers).map_err(store_error)?;

    let status = if inserted {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(provider)).into_response())
}

pub(crate) async fn delete_provider(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<Json<Value>, Response> {
    ensure_admin(&headers)?;
    let mut providers = state.store.providers().map_err(store_error)?;
    if providers.remove(&name).is_none() {
        return Err(error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("provider not found: {name}"),
        )
        .into_response());
    }
    state.store.save_providers(&providers).map_err(store_error)?;
    Ok(Json(json!({"ok": true})))
}

// --- groups ---

pub(crate) async fn list_groups(
    State(state): State<GatewayState>,
    headers: HeaderMap,
) -> Result<Json<Vec<GroupConfig>>, Response> {
    ensure_admin(&headers)?;
    let groups = state.store.groups().map_err(store_error)?;
    Ok(Json(groups.into_values().collect()))
}

pub(crate) async fn upsert_group(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    payload: Result<Json<GroupConfig>, JsonRejection>,
) -> Result<Response, Response> {
    ensure_admin(&headers)?;
    let Json(group) = payload.map_err(json_rejection)?;
    if group.name.trim().is_empty() {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "group name must not be empty",
        )
        .into_response());
    }
    let mut groups = state.store.groups().map_err(store_error)?;
    let inserted = groups.insert(group.name.clone(), group.clone()).is_none();
    state.store.save_groups(&groups).map_err(store_error)?;

    let status = if inserted {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(group)).into_response())
}

pub(crate) async fn delete_group(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<Json<Value>, Response> {
    ensure_admin(&headers)?;
    let mut groups = state.store.groups().map_err(store_error)?;
    if groups.remove(&name).is_none() {
        return Err(error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("group not found: {name}"),
        )
        .into_response());
    }
    state.store.save_groups(&groups).map_err(store_error)?;
    Ok(Json(json!({"ok": true})))
}

// --- access keys ---

#[derive(Debug, Deserialize)]
pub(crate) struct CreateKeyRequest {
    #[serde(default)]
    id: Option<String>,
    name: String,
    #[serde(default)]
    token: Option<String>,
}

pub(crate) async fn list_keys(
    State(state): State<GatewayState>,
    headers: HeaderMap,
) -> Result<Json<Vec<AccessKey>>, Response> {
    ensure_admin(&headers)?;
    let keys = state.store.keys().map_err(store_error)?;
    Ok(Json(keys.into_values().collect()))
}

pub(crate) async fn create_key(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    payload: Result<Json<CreateKeyRequest>, JsonRejection>,
) -> Result<Response, Response> {
    ensure_admin(&headers)?;
    let Json(request) = payload.map_err(json_rejection)?;
    let key = AccessKey {
        id: request
            .id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("key-{}", random_alphanumeric(12))),
        name: request.name,
        token: request
            .token
            .filter(|token| !token.trim().is_empty())
            .unwrap_or_else(|| format!("sk-{}", random_alphanumeric(9))),
    };

    let mut keys = state.store.keys().map_err(store_error)?;
    let inserted = keys.insert(key.id.clone(), key.clone()).is_none();
    state.store.save_keys(&keys).map_err(store_error)?;

    let status = if inserted {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(key)).into_response())
}

pub(crate) async fn delete_key(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, Response> {
    ensure_admin(&headers)?;
    let mut keys = state.store.keys().map_err(store_error)?;
    if keys.remove(&id).is_none() {
        return Err(error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("key not found: {id}"),
        )
        .into_response());
    }
    state.store.save_keys(&keys).map_err(store_error)?;
    Ok(Json(json!({"ok": true})))
}

// --- stats and health ---

pub(crate) async fn get_stats(
    State(state): State<GatewayState>,
    headers: HeaderMap,
) -> Result<Json<BTreeMap<String, ProviderStats>>, Response> {
    ensure_admin(&headers)?;
    Ok(Json(state.store.stats().map_err(store_error)?))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ProviderHealthView {
    base: f64,
    current: f64,
    ratio: f64,
    recent_error_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_error: Option<HealthEvent>,
    total_failures: u64,
    window_ms: u64,
}

pub(crate) async fn health_status(
    State(state): State<GatewayState>,
    headers: HeaderMap,
) -> Result<Json<BTreeMap<String, ProviderHealthView>>, Response> {
    ensure_admin(&headers)?;
    let providers = state.store.providers().map_err(store_error)?;
    let stats = state.store.stats().map_err(store_error)?;

    let mut health = state.health.lock().await;
    let mut out = BTreeMap::new();
    for name in providers.keys() {
        let current = health.weight(name, BASE_WEIGHT);
        let snapshot = health.stats(name);
        out.insert(
            name.clone(),
            ProviderHealthView {
                base: BASE_WEIGHT,
                current,
                ratio: current / BASE_WEIGHT,
                recent_error_count: snapshot.recent_error_count,
                last_error: snapshot.last_error,
                total_failures: stats.get(name).map(|s| s.failures).unwrap_or(0),
                window_ms: snapshot.window_ms,
            },
        );
    }
    Ok(Json(out))
}

#[derive(Debug, Deserialize)]
pub(crate) struct ResetHealthRequest {
    #[serde(default)]
    provider: Option<String>,
}

pub(crate) async fn reset_health(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    payload: Result<Json<ResetHealthRequest>, JsonRejection>,
) -> Result<Json<Value>, Response> {
    ensure_admin(&headers)?;
    let Json(request) = payload.map_err(json_rejection)?;
    let mut health = state.health.lock().await;
    match request.provider.as_deref() {
        Some(provider) => {
            health.reset(provider);
            Ok(Json(json!({"ok": true, "reset": provider})))
        }
        None => {
            health.reset_all();
            Ok(Json(json!({"ok": true, "reset": "all"})))
        }
    }
}

// --- trace logs ---

fn default_log_limit() -> usize {
    50
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LogQuery {
    #[serde(default)]
    keyword: Option<String>,
    #[serde(default)]
    error_only: bool,
    #[serde(default)]
    offset: usize,
    #[serde(default = "default_log_limit")]
    limit: usize,
    #[serde(default)]
    refresh: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LogQueryResponse {
    logs: Vec<Value>,
    has_more: bool,
    total: usize,
    loaded: usize,
    filtered: usize,
}

pub(crate) async fn query_logs(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Query(query): Query<LogQuery>,
) -> Result<Json<LogQueryResponse>, Response> {
    ensure_admin(&headers)?;
    let entries = state.recorder.load_today();
    Ok(Json(filter_and_page(entries, &query)))
}

fn filter_and_page(entries: Vec<Value>, query: &LogQuery) -> LogQueryResponse {
    let total = entries.len();
    let keyword = query
        .keyword
        .as_deref()
        .map(str::trim)
        .filter(|keyword| !keyword.is_empty())
        .map(str::to_lowercase);

    let filtered: Vec<Value> = entries
        .into_iter()
        .filter(|entry| {
            if query.error_only && is_success_entry(entry) {
                return false;
            }
            match keyword.as_deref() {
                Some(keyword) => matches_keyword(entry, keyword),
                None => true,
            }
        })
        .collect();
    let filtered_len = filtered.len();

    // Entries sit oldest-first in the file; pages walk from newest toward
    // oldest and come back newest-first.
    let (start, end) = if query.refresh {
        (filtered_len.saturating_sub(query.limit), filtered_len)
    } else {
        let end = filtered_len.saturating_sub(query.offset);
        (end.saturating_sub(query.limit), end)
    };
    let mut logs: Vec<Value> = filtered[start..end].to_vec();
    logs.reverse();

    let loaded = if query.refresh {
        logs.len()
    } else {
        query.offset + logs.len()
    };

    LogQueryResponse {
        has_more: start > 0,
        total,
        loaded,
        filtered: filtered_len,
        logs,
    }
}

fn is_success_entry(entry: &Value) -> bool {
    entry
        .get("status")
        .and_then(Value::as_u64)
        .is_some_and(|status| (200..300).contains(&status))
}

fn matches_keyword(entry: &Value, keyword_lower: &str) -> bool {
    let mut haystacks: Vec<String> = Vec::new();

    for path in [
        &["keyName"][..],
        &["request", "path"][..],
        &["request", "body", "model"][..],
        &["routing", "model"][..],
    ] {
        let mut cursor = entry;
        let mut found = true;
        for segment in path {
            match cursor.get(segment) {
                Some(next) => cursor = next,
                None => {
                    found = false;
                    break;
                }
            }
        }
        if found {
            if let Some(text) = cursor.as_str() {
                haystacks.push(text.to_string());
            }
        }
    }

    if let Some(status) = entry.get("status").and_then(Value::as_u64) {
        haystacks.push(status.to_string());
    }
    if let Some(response) = entry.get("response") {
        haystacks.push(response.to_string());
    }
    if let Some(attempts) = entry.get("attempts").and_then(Value::as_array) {
        for attempt in attempts {
            if let Some(provider) = attempt.get("provider").and_then(Value::as_str) {
                haystacks.push(provider.to_string());
            }
            if let Some(error) = attempt.get("error").and_then(Value::as_str) {
                haystacks.push(error.to_string());
            }
        }
    }

    haystacks
        .iter()
        .any(|haystack| haystack.to_lowercase().contains(keyword_lower))
}

#[derive(Debug, Deserialize)]
pub(crate) struct ClearLogsRequest {
    #[serde(default)]
    all: bool,
}

pub(crate) async fn clear_logs(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    payload: Result<Json<ClearLogsRequest>, JsonRejection>,
) -> Result<Json<Value>, Response> {
    ensure_admin(&headers)?;
    let Json(request) = payload.map_err(json_rejection)?;
    let removed = state
        .recorder
        .clear(request.all)
        .map_err(|err| internal_error(err.to_string()))?;
    Ok(Json(json!({"ok": true, "removed": removed})))
}

// --- upstream model probe ---

pub(crate) async fn probe_provider_models(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<Json<Value>, Response> {
    ensure_admin(&headers)?;
    let providers = state.store.providers().map_err(store_error)?;
    let Some(provider) = providers.get(&name) else {
        return Err(error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("provider not found: {name}"),
        )
        .into_response());
    };

    let client = ProviderClient::new(provider).map_err(|err| relay_error_response(&err))?;
    let payload = client
        .fetch_models(provider)
        .await
        .map_err(|err| relay_error_response(&err))?;
    Ok(Json(normalize_model_list(&provider.name, &payload)))
}

fn normalize_model_list(provider: &str, payload: &Value) -> Value {
    let items = payload
        .get("data")
        .or_else(|| payload.get("models"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let created_default = now_millis() / 1000;

    let data: Vec<Value> = items
        .iter()
        .filter_map(|item| {
            let id = item
                .get("id")
                .or_else(|| item.get("name"))
                .and_then(Value::as_str)?;
            let created = item
                .get("created")
                .and_then(Value::as_u64)
                .unwrap_or(created_default);
            let owned_by = item
                .get("owned_by")
                .and_then(Value::as_str)
                .unwrap_or(provider);
            Some(json!({
                "id": id,
                "object": "model",
                "created": created,
                "owned_by": owned_by,
            }))
        })
        .collect();

    json!({"object": "list", "data": data})
}
