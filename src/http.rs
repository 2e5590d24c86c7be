//! Front controller: gateway state, route table, CORS policy, static
//! admin assets and the shared error-response helpers.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;

use crate::error::RelayError;
use crate::health::{now_millis, HealthTracker};
use crate::store::ConfigStore;
use crate::trace::TraceRecorder;
use crate::{admin, proxy};

/// Everything a request handler needs, passed explicitly; there is no
/// ambient process state.
#[derive(Clone)]
pub struct GatewayState {
    pub store: Arc<ConfigStore>,
    pub health: Arc<Mutex<HealthTracker>>,
    pub recorder: Arc<TraceRecorder>,
    cors_enabled: bool,
    static_dir: PathBuf,
}

impl GatewayState {
    pub fn new(store: ConfigStore, recorder: TraceRecorder) -> Self {
        Self {
            store: Arc::new(store),
            health: Arc::new(Mutex::new(HealthTracker::new())),
            recorder: Arc::new(recorder),
            cors_enabled: true,
            static_dir: PathBuf::from("public"),
        }
    }

    pub fn with_cors(mut self, enabled: bool) -> Self {
        self.cors_enabled = enabled;
        self
    }

    pub fn with_static_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.static_dir = dir.into();
        self
    }
}

pub fn router(state: GatewayState) -> Router {
    let serve_ui = ServeDir::new(&state.static_dir);
    let cors_enabled = state.cors_enabled;

    let router = Router::new()
        .route("/v1/chat/completions", post(proxy::handle_chat_completions))
        .route("/v1/messages", post(proxy::handle_messages))
        .route("/v1/models", get(list_models))
        .route(
            "/admin/api/providers",
            get(admin::list_providers).post(admin::upsert_provider),
        )
        .route("/admin/api/providers/:name", delete(admin::delete_provider))
        .route(
            "/admin/api/providers/:name/models",
            get(admin::probe_provider_models),
        )
        .route(
            "/admin/api/groups",
            get(admin::list_groups).post(admin::upsert_group),
        )
        .route("/admin/api/groups/:name", delete(admin::delete_group))
        .route(
            "/admin/api/keys",
            get(admin::list_keys).post(admin::create_key),
        )
        .route("/admin/api/keys/:id", delete(admin::delete_key))
        .route("/admin/api/stats", get(admin::get_stats))
        .route("/admin/api/health", get(admin::health_status))
        .route("/admin/api/health/reset", post(admin::reset_health))
        .route("/admin/api/logs", get(admin::query_logs))
        .route("/admin/api/logs/clear", post(admin::clear_logs))
        .fallback_service(serve_ui)
        // One body ceiling for the whole surface, admin included.
        .layer(DefaultBodyLimit::max(proxy::MAX_BODY_BYTES))
        .with_state(state);

    if cors_enabled {
        router.layer(cors_layer())
    } else {
        router
    }
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Groups double as the model catalog clients can ask for.
async fn list_models(State(state): State<GatewayState>) -> Response {
    let groups = match state.store.groups() {
        Ok(groups) => groups,
        Err(err) => return internal_error(err.to_string()),
    };
    let created = now_millis();
    let data: Vec<Value> = groups
        .keys()
        .map(|name| {
            json!({
                "id": name,
                "object": "model",
                "created": created,
                "owned_by": "gateway",
            })
        })
        .collect();
    Json(json!({"object": "list", "data": data})).into_response()
}

#[derive(Debug, Serialize)]
pub(crate) struct ErrorDetail {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct ErrorResponse {
    pub error: ErrorDetail,
}

pub(crate) fn error_response(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error: ErrorDetail {
                code,
                message: message.into(),
            },
        }),
    )
}

pub(crate) fn relay_error_response(err: &RelayError) -> Response {
    error_response(err.status(), err.code(), err.to_string()).into_response()
}

/// Terminal shape for failures nothing else handled. CORS headers go on
/// unconditionally so a browser shows the message instead of an opaque
/// network error.
pub(crate) fn internal_error(message: impl Into<String>) -> Response {
    let mut response = (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({"error": message.into()})),
    )
        .into_response();
    let headers = response.headers_mut();
    headers.insert("access-control-allow-origin", HeaderValue::from_static("*"));
    headers.insert("access-control-allow-methods", HeaderValue::from_static("*"));
    headers.insert("access-control-allow-headers", HeaderValue::from_static("*"));
    response
}

pub(crate) fn extract_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub(crate) fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let auth = extract_header(headers, "authorization")?;
    let rest = auth
        .strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))?;
    let token = rest.trim();
    (!token.is_empty()).then(|| token.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_bearer_accepts_both_prefixes() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer sk-a"));
        assert_eq!(extract_bearer(&headers).as_deref(), Some("sk-a"));

        headers.insert("authorization", HeaderValue::from_static("bearer sk-b"));
        assert_eq!(extract_bearer(&headers).as_deref(), Some("sk-b"));

        headers.insert("authorization", HeaderValue::from_static("Basic abc"));
        assert_eq!(extract_bearer(&headers), None);

        headers.insert("authorization", HeaderValue::from_static("Bearer "));
        assert_eq!(extract_bearer(&headers), None);
    }

    #[test]
    fn internal_error_always_carries_cors_headers() {
        let response = internal_error("boom");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()["access-control-allow-origin"], "*");
        assert_eq!(response.headers()["access-control-allow-methods"], "*");
    }
}
