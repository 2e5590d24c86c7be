//! The forwarding engine. Routes an inbound chat request to a group,
//! orders the group's providers by health-weighted preference, then walks
//! them in order until one answers. Streaming responses are piped through
//! to the client while every byte is also buffered for the trace.

use std::collections::BTreeMap;
use std::time::Instant;

use axum::body::{to_bytes, Body};
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde_json::{json, Value};
use tracing::warn;

use crate::error::RelayError;
use crate::health::HealthTracker;
use crate::http::{extract_bearer, internal_error, relay_error_response, GatewayState};
use crate::store::{AccessKey, GroupConfig, Protocol, ProviderConfig};
use crate::trace::{headers_to_map, Candidate, RoutingDecision, Trace, TraceAttempt};
use crate::upstream::{apply_credentials, ProviderClient};

/// Inbound body ceiling; larger requests are rejected with 413.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

const BASE_WEIGHT_TOP: f64 = 1000.0;
const BASE_WEIGHT_STEP: f64 = 100.0;

const HOP_BY_HOP_HEADERS: [&str; 4] = ["host", "content-length", "connection", "transfer-encoding"];
const INBOUND_CREDENTIAL_HEADERS: [&str; 3] = ["authorization", "x-api-key", "anthropic-version"];
const UPSTREAM_CORS_HEADERS: [&str; 3] = [
    "access-control-allow-origin",
    "access-control-allow-methods",
    "access-control-allow-headers",
];

pub async fn handle_chat_completions(
    State(state): State<GatewayState>,
    req: Request<Body>,
) -> Response {
    forward(state, Protocol::Openai, req).await
}

pub async fn handle_messages(State(state): State<GatewayState>, req: Request<Body>) -> Response {
    forward(state, Protocol::Anthropic, req).await
}

async fn forward(state: GatewayState, protocol: Protocol, req: Request<Body>) -> Response {
    let (parts, body) = req.into_parts();
    let path = parts.uri.path().to_string();

    let body = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(_) => {
            return relay_error_response(&RelayError::BodyTooLarge {
                limit: MAX_BODY_BYTES,
            });
        }
    };

    let key = match authenticate(&state, &parts.headers) {
        Ok(key) => key,
        Err(response) => return response,
    };

    let body_json: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(err) => {
            return crate::http::error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                format!("invalid json body: {err}"),
            )
            .into_response();
        }
    };

    let model = body_json
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let stream_requested = body_json
        .get("stream")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let mut trace = Trace::begin(key.name, &parts.method, path, &parts.headers, body_json.clone());

    let groups = match state.store.groups() {
        Ok(groups) => groups,
        Err(err) => return fail_internal(&state, trace, err.to_string()).await,
    };
    let Some(group) = groups.get(&model).cloned() else {
        let err = RelayError::ModelNotFound {
            model: model.clone(),
        };
        trace.routing = Some(RoutingDecision {
            model,
            group: None,
            candidates: Vec::new(),
        });
        trace.finish(err.status().as_u16());
        state.recorder.append(&trace).await;
        return relay_error_response(&err);
    };
    if group.protocol != protocol {
        let err = RelayError::ProtocolMismatch {
            group: group.name.clone(),
            requested: protocol.to_string(),
        };
        trace.routing = Some(RoutingDecision {
            model,
            group: Some(group.name.clone()),
            candidates: Vec::new(),
        });
        trace.finish(err.status().as_u16());
        state.recorder.append(&trace).await;
        return relay_error_response(&err);
    }

    let providers = match state.store.providers() {
        Ok(providers) => providers,
        Err(err) => return fail_internal(&state, trace, err.to_string()).await,
    };
    let candidates = {
        let mut health = state.health.lock().await;
        order_candidates(&group, &providers, &mut health)
    };
    trace.routing = Some(RoutingDecision {
        model,
        group: Some(group.name.clone()),
        candidates: candidates
            .iter()
            .map(|(provider, weight)| Candidate {
                provider: provider.name.clone(),
                weight: *weight,
            })
            .collect(),
    });

    let mut last_error = String::from("no providers available");
    for (provider, weight) in candidates {
        let outgoing_headers = build_upstream_headers(&parts.headers, &provider);
        let outgoing_body = rewrite_model(&body, &body_json, &provider);
        let started = Instant::now();

        let client = match ProviderClient::new(&provider) {
            Ok(client) => client,
            Err(err) => {
                let message = err.to_string();
                record_failed_attempt(FailedAttempt {
                    state: &state,
                    trace: &mut trace,
                    provider: &provider,
                    weight,
                    request_headers: &outgoing_headers,
                    streaming: stream_requested,
                    response_headers: None,
                    status: 0,
                    response_body: None,
                    error: message.clone(),
                    started,
                })
                .await;
                last_error = message;
                continue;
            }
        };

        let response = match client
            .post(&provider.endpoint, outgoing_headers.clone(), outgoing_body)
            .await
        {
            Ok(response) => response,
            Err(err) => {
                let status = err.status().map(|status| status.as_u16()).unwrap_or(0);
                let message = transport_error_message(&err);
                record_failed_attempt(FailedAttempt {
                    state: &state,
                    trace: &mut trace,
                    provider: &provider,
                    weight,
                    request_headers: &outgoing_headers,
                    streaming: stream_requested,
                    response_headers: None,
                    status,
                    response_body: None,
                    error: message.clone(),
                    started,
                })
                .await;
                last_error = message;
                continue;
            }
        };

        let status = response.status();
        if !status.is_success() {
            // Drain the error body fully (streamed or not) so the trace
            // keeps the provider's own diagnostics.
            let response_headers = headers_to_map(response.headers());
            let text = response.text().await.unwrap_or_default();
            let body_value = serde_json::from_str::<Value>(&text)
                .unwrap_or_else(|_| Value::String(text.clone()));
            let message = format!("{} responded {}: {text}", provider.name, status.as_u16());
            record_failed_attempt(FailedAttempt {
                state: &state,
                trace: &mut trace,
                provider: &provider,
                weight,
                request_headers: &outgoing_headers,
                streaming: stream_requested,
                response_headers: Some(response_headers),
                status: status.as_u16(),
                response_body: Some(body_value),
                error: message.clone(),
                started,
            })
            .await;
            last_error = message;
            continue;
        }

        if stream_requested {
            return stream_through(state, trace, &provider, weight, &outgoing_headers, response, started);
        }

        let upstream_headers = response.headers().clone();
        match response.bytes().await {
            Ok(bytes) => {
                let decoded = serde_json::from_slice::<Value>(&bytes)
                    .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).to_string()));
                trace.attempts.push(TraceAttempt {
                    provider: provider.name.clone(),
                    weight,
                    streaming: false,
                    request_headers: headers_to_map(&outgoing_headers),
                    response_headers: Some(headers_to_map(&upstream_headers)),
                    status: status.as_u16(),
                    response_body: Some(decoded.clone()),
                    error: None,
                    duration_ms: started.elapsed().as_millis() as u64,
                });
                trace.response = Some(decoded);
                trace.finish(status.as_u16());

                let mut client_response = Response::new(Body::from(bytes));
                *client_response.status_mut() = status;
                *client_response.headers_mut() = filter_response_headers(&upstream_headers);
                // Recording must not delay delivery; the append runs after
                // the response is handed off.
                let recorder = state.recorder.clone();
                tokio::spawn(async move {
                    recorder.append(&trace).await;
                });
                return client_response;
            }
            Err(err) => {
                let message = transport_error_message(&err);
                record_failed_attempt(FailedAttempt {
                    state: &state,
                    trace: &mut trace,
                    provider: &provider,
                    weight,
                    request_headers: &outgoing_headers,
                    streaming: false,
                    response_headers: Some(headers_to_map(&upstream_headers)),
                    status: 0,
                    response_body: None,
                    error: message.clone(),
                    started,
                })
                .await;
                last_error = message;
                continue;
            }
        }
    }

    let err = RelayError::AllProvidersFailed {
        last_error: last_error.clone(),
    };
    warn!(trace_id = %trace.id, "{err}");
    let body = json!({"error": "All providers failed", "last_error": last_error});
    trace.response = Some(body.clone());
    trace.finish(err.status().as_u16());
    state.recorder.append(&trace).await;
    (StatusCode::BAD_GATEWAY, Json(body)).into_response()
}

fn authenticate(
    state: &GatewayState,
    headers: &HeaderMap,
) -> std::result::Result<AccessKey, Response> {
    let Some(token) = extract_bearer(headers) else {
        return Err(relay_error_response(&RelayError::AuthMissing));
    };
    let keys = state
        .store
        .keys()
        .map_err(|err| internal_error(err.to_string()))?;
    keys.into_values()
        .find(|key| key.token == token)
        .ok_or_else(|| relay_error_response(&RelayError::AuthInvalid))
}

/// Positions in the group list set the base weight; recent errors divide
/// it. The sort is stable, so equal weights keep their list order.
fn order_candidates(
    group: &GroupConfig,
    providers: &BTreeMap<String, ProviderConfig>,
    health: &mut HealthTracker,
) -> Vec<(ProviderConfig, f64)> {
    let mut candidates: Vec<(ProviderConfig, f64)> = Vec::new();
    for (position, name) in group.providers.iter().enumerate() {
        let Some(provider) = providers.get(name) else {
            continue;
        };
        let base = BASE_WEIGHT_TOP - BASE_WEIGHT_STEP * position as f64;
        let weight = health.weight(name, base);
        candidates.push((provider.clone(), weight));
    }
    candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    candidates
}

fn build_upstream_headers(inbound: &HeaderMap, provider: &ProviderConfig) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in inbound.iter() {
        let lower = name.as_str();
        if HOP_BY_HOP_HEADERS.contains(&lower) || INBOUND_CREDENTIAL_HEADERS.contains(&lower) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    apply_credentials(&mut out, provider);
    out
}

fn filter_response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in upstream.iter() {
        let lower = name.as_str();
        if HOP_BY_HOP_HEADERS.contains(&lower) || UPSTREAM_CORS_HEADERS.contains(&lower) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Forwards the raw body untouched unless the provider maps the public
/// model name onto a real upstream model id.
fn rewrite_model(raw: &Bytes, parsed: &Value, provider: &ProviderConfig) -> Bytes {
    let Some(real_model) = provider.real_model.as_deref() else {
        return raw.clone();
    };
    let mut body = parsed.clone();
    if let Some(object) = body.as_object_mut() {
        object.insert("model".to_string(), Value::String(real_model.to_string()));
    }
    Bytes::from(body.to_string())
}

fn transport_error_message(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        format!("timeout: {err}")
    } else if err.is_connect() {
        format!("connect error: {err}")
    } else {
        err.to_string()
    }
}

struct FailedAttempt<'a> {
    state: &'a GatewayState,
    trace: &'a mut Trace,
    provider: &'a ProviderConfig,
    weight: f64,
    request_headers: &'a HeaderMap,
    streaming: bool,
    response_headers: Option<BTreeMap<String, String>>,
    status: u16,
    response_body: Option<Value>,
    error: String,
    started: Instant,
}

async fn record_failed_attempt(failed: FailedAttempt<'_>) {
    if let Err(err) = failed.state.store.record_failure(&failed.provider.name) {
        warn!(provider = %failed.provider.name, "failed to bump failure counter: {err}");
    }
    if failed.status == 429 || (500..600).contains(&failed.status) {
        failed
            .state
            .health
            .lock()
            .await
            .record_error(&failed.provider.name, failed.status);
    }
    failed.trace.attempts.push(TraceAttempt {
        provider: failed.provider.name.clone(),
        weight: failed.weight,
        streaming: failed.streaming,
        request_headers: headers_to_map(failed.request_headers),
        response_headers: failed.response_headers,
        status: failed.status,
        response_body: failed.response_body,
        error: Some(failed.error),
        duration_ms: failed.started.elapsed().as_millis() as u64,
    });
}

async fn fail_internal(state: &GatewayState, mut trace: Trace, message: String) -> Response {
    warn!(trace_id = %trace.id, "config store failure: {message}");
    trace.finish(StatusCode::SERVICE_UNAVAILABLE.as_u16());
    state.recorder.append(&trace).await;
    internal_error(message)
}

enum StreamEnd {
    Completed,
    Failed(String),
    Aborted,
}

struct StreamFinalizer {
    state: GatewayState,
    trace: Trace,
    provider_name: String,
    weight: f64,
    request_headers: BTreeMap<String, String>,
    response_headers: BTreeMap<String, String>,
    upstream_status: u16,
    started: Instant,
}

impl StreamFinalizer {
    async fn finalize(mut self, end: StreamEnd, collected: Vec<u8>) {
        let captured = String::from_utf8_lossy(&collected).to_string();
        let (status, error) = match end {
            StreamEnd::Completed => (self.upstream_status, None),
            StreamEnd::Failed(message) => (500, Some(message)),
            StreamEnd::Aborted => (
                self.upstream_status,
                Some("client disconnected before stream end".to_string()),
            ),
        };
        self.trace.attempts.push(TraceAttempt {
            provider: self.provider_name,
            weight: self.weight,
            streaming: true,
            request_headers: std::mem::take(&mut self.request_headers),
            response_headers: Some(std::mem::take(&mut self.response_headers)),
            status,
            response_body: Some(Value::String(captured.clone())),
            error,
            duration_ms: self.started.elapsed().as_millis() as u64,
        });
        self.trace.response = Some(Value::String(captured));
        self.trace.finish(status);
        self.state.recorder.append(&self.trace).await;
    }
}

struct StreamCapture {
    upstream: BoxStream<'static, reqwest::Result<Bytes>>,
    collected: Vec<u8>,
    finalizer: Option<StreamFinalizer>,
}

impl StreamCapture {
    async fn finalize(&mut self, end: StreamEnd) {
        let Some(finalizer) = self.finalizer.take() else {
            return;
        };
        let collected = std::mem::take(&mut self.collected);
        finalizer.finalize(end, collected).await;
    }
}

impl Drop for StreamCapture {
    fn drop(&mut self) {
        // Reached only when the client went away mid-stream; the trace is
        // still owed its single append.
        let Some(finalizer) = self.finalizer.take() else {
            return;
        };
        let collected = std::mem::take(&mut self.collected);
        tokio::spawn(async move {
            finalizer.finalize(StreamEnd::Aborted, collected).await;
        });
    }
}

/// Pipes upstream chunks to the client in arrival order while buffering
/// them; the trace is appended after the final chunk (or error) and a
/// streamed upstream is never retried.
fn stream_through(
    state: GatewayState,
    trace: Trace,
    provider: &ProviderConfig,
    weight: f64,
    outgoing_headers: &HeaderMap,
    response: reqwest::Response,
    started: Instant,
) -> Response {
    let status = response.status();
    let upstream_headers = response.headers().clone();

    let finalizer = StreamFinalizer {
        state,
        trace,
        provider_name: provider.name.clone(),
        weight,
        request_headers: headers_to_map(outgoing_headers),
        response_headers: headers_to_map(&upstream_headers),
        upstream_status: status.as_u16(),
        started,
    };
    let capture = StreamCapture {
        upstream: response.bytes_stream().boxed(),
        collected: Vec::new(),
        finalizer: Some(finalizer),
    };

    let body_stream = stream::try_unfold(capture, |mut capture| async move {
        match capture.upstream.next().await {
            Some(Ok(chunk)) => {
                capture.collected.extend_from_slice(&chunk);
                Ok(Some((chunk, capture)))
            }
            Some(Err(err)) => {
                capture.finalize(StreamEnd::Failed(err.to_string())).await;
                Err(std::io::Error::other(err))
            }
            None => {
                capture.finalize(StreamEnd::Completed).await;
                Ok(None)
            }
        }
    });

    let mut client_response = Response::new(Body::from_stream(body_stream));
    *client_response.status_mut() = status;
    *client_response.headers_mut() = filter_response_headers(&upstream_headers);
    client_response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(name: &str, protocol: Protocol) -> ProviderConfig {
        ProviderConfig {
            name: name.to_string(),
            protocol,
            endpoint: format!("http://localhost:9000/{name}"),
            api_key: "sk-upstream".to_string(),
            proxy: None,
            real_model: None,
        }
    }

    fn group(names: &[&str]) -> GroupConfig {
        GroupConfig {
            name: "g".to_string(),
            protocol: Protocol::Openai,
            providers: names.iter().map(|name| name.to_string()).collect(),
        }
    }

    fn provider_map(names: &[&str]) -> BTreeMap<String, ProviderConfig> {
        names
            .iter()
            .map(|name| (name.to_string(), provider(name, Protocol::Openai)))
            .collect()
    }

    #[test]
    fn candidates_keep_list_order_without_penalties() {
        let mut health = HealthTracker::new();
        let out = order_candidates(&group(&["a", "b", "c"]), &provider_map(&["a", "b", "c"]), &mut health);
        let names: Vec<&str> = out.iter().map(|(p, _)| p.name.as_str()).collect();
        assert_eq!(names, ["a", "b", "c"]);
        assert_eq!(out[0].1, 1000.0);
        assert_eq!(out[1].1, 900.0);
        assert_eq!(out[2].1, 800.0);
    }

    #[test]
    fn penalized_leader_drops_behind_clean_backup() {
        let mut health = HealthTracker::new();
        health.record_error("a", 429);
        health.record_error("a", 429);
        // 1000 / 25 = 40 < 900
        let out = order_candidates(&group(&["a", "b"]), &provider_map(&["a", "b"]), &mut health);
        let names: Vec<&str> = out.iter().map(|(p, _)| p.name.as_str()).collect();
        assert_eq!(names, ["b", "a"]);
        assert_eq!(out[1].1, 40.0);
    }

    #[test]
    fn equal_weights_tie_break_by_list_position() {
        let mut health = HealthTracker::new();
        // a: 1000 / 5 = 200 and e: 600 / 3 = 200; a sits earlier in the
        // list so it must stay ahead of e among the equals.
        health.record_error("a", 429);
        health.record_error("e", 503);
        let out = order_candidates(
            &group(&["a", "b", "c", "d", "e"]),
            &provider_map(&["a", "b", "c", "d", "e"]),
            &mut health,
        );
        let names: Vec<&str> = out.iter().map(|(p, _)| p.name.as_str()).collect();
        assert_eq!(names, ["b", "c", "d", "a", "e"]);
        assert_eq!(out[3].1, out[4].1);
    }

    #[test]
    fn unknown_group_members_are_skipped() {
        let mut health = HealthTracker::new();
        let out = order_candidates(&group(&["a", "ghost", "b"]), &provider_map(&["a", "b"]), &mut health);
        let names: Vec<&str> = out.iter().map(|(p, _)| p.name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
        // "b" keeps the base weight of its list position, not a compacted one.
        assert_eq!(out[1].1, 800.0);
    }

    #[test]
    fn upstream_headers_scrub_credentials_and_hop_by_hop() {
        let mut inbound = HeaderMap::new();
        inbound.insert("authorization", HeaderValue::from_static("Bearer client"));
        inbound.insert("x-api-key", HeaderValue::from_static("client-key"));
        inbound.insert("anthropic-version", HeaderValue::from_static("2020-01-01"));
        inbound.insert("host", HeaderValue::from_static("gateway.local"));
        inbound.insert("content-length", HeaderValue::from_static("42"));
        inbound.insert("x-custom", HeaderValue::from_static("kept"));

        let out = build_upstream_headers(&inbound, &provider("p", Protocol::Openai));
        assert_eq!(out["authorization"], "Bearer sk-upstream");
        assert_eq!(out["x-custom"], "kept");
        assert_eq!(out["content-type"], "application/json");
        assert!(out.get("host").is_none());
        assert!(out.get("content-length").is_none());
        assert!(out.get("x-api-key").is_none());
    }

    #[test]
    fn anthropic_provider_gets_both_credential_headers() {
        let inbound = HeaderMap::new();
        let out = build_upstream_headers(&inbound, &provider("p", Protocol::Anthropic));
        assert_eq!(out["authorization"], "Bearer sk-upstream");
        assert_eq!(out["x-api-key"], "sk-upstream");
        assert_eq!(out["anthropic-version"], "2023-06-01");
    }

    #[test]
    fn response_headers_drop_upstream_cors_and_hop_by_hop() {
        let mut upstream = HeaderMap::new();
        upstream.insert("content-type", HeaderValue::from_static("application/json"));
        upstream.insert("access-control-allow-origin", HeaderValue::from_static("*"));
        upstream.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        upstream.insert("x-request-id", HeaderValue::from_static("abc"));

        let out = filter_response_headers(&upstream);
        assert_eq!(out["content-type"], "application/json");
        assert_eq!(out["x-request-id"], "abc");
        assert!(out.get("access-control-allow-origin").is_none());
        assert!(out.get("transfer-encoding").is_none());
    }

    #[test]
    fn body_is_forwarded_verbatim_without_real_model() {
        let raw = Bytes::from_static(b"{\"model\":\"gpt\",  \"stream\":false}");
        let parsed: Value = serde_json::from_slice(&raw).expect("json");
        let out = rewrite_model(&raw, &parsed, &provider("p", Protocol::Openai));
        assert_eq!(out, raw);
    }

    #[test]
    fn real_model_replaces_public_name_only() {
        let raw = Bytes::from_static(b"{\"model\":\"gpt\",\"temperature\":0.5}");
        let parsed: Value = serde_json::from_slice(&raw).expect("json");
        let mut provider = provider("p", Protocol::Openai);
        provider.real_model = Some("gpt-4o-mini".to_string());

        let out = rewrite_model(&raw, &parsed, &provider);
        let rewritten: Value = serde_json::from_slice(&out).expect("json");
        assert_eq!(rewritten["model"], "gpt-4o-mini");
        assert_eq!(rewritten["temperature"], 0.5);
    }
}
