//! Per-provider HTTP client. Each attempt gets a fresh client because
//! providers are runtime-mutable through the admin surface; the client
//! carries the hard attempt timeout and the provider's outbound proxy.

use std::time::Duration;

use axum::http::{header, HeaderMap, HeaderValue};
use bytes::Bytes;
use serde_json::Value;

use crate::error::{RelayError, Result};
use crate::store::{Protocol, ProviderConfig};

const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(60);
const MODEL_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Clone)]
pub struct ProviderClient {
    client: reqwest::Client,
}

impl ProviderClient {
    pub fn new(provider: &ProviderConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(ATTEMPT_TIMEOUT);
        if let Some(proxy) = provider.proxy.as_deref() {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        Ok(Self {
            client: builder.build()?,
        })
    }

    pub async fn post(
        &self,
        endpoint: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> std::result::Result<reqwest::Response, reqwest::Error> {
        self.client
            .post(endpoint)
            .headers(headers)
            .body(body)
            .send()
            .await
    }

    /// Fetches `<origin>/v1/models` from the provider's endpoint with the
    /// provider's own credentials.
    pub async fn fetch_models(&self, provider: &ProviderConfig) -> Result<Value> {
        let origin = endpoint_origin(&provider.endpoint)?;
        let mut headers = HeaderMap::new();
        apply_credentials(&mut headers, provider);

        let response = self
            .client
            .get(format!("{origin}/v1/models"))
            .headers(headers)
            .timeout(MODEL_PROBE_TIMEOUT)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::Api { status, body });
        }
        Ok(response.json().await?)
    }
}

/// Injects the provider credential headers for its wire protocol. Both
/// families get a bearer header; Anthropic-style providers additionally
/// get `x-api-key` and the pinned `anthropic-version`.
pub fn apply_credentials(headers: &mut HeaderMap, provider: &ProviderConfig) {
    if let Ok(bearer) = HeaderValue::from_str(&format!("Bearer {}", provider.api_key)) {
        headers.insert(header::AUTHORIZATION, bearer);
    }
    if provider.protocol == Protocol::Anthropic {
        if let Ok(api_key) = HeaderValue::from_str(&provider.api_key) {
            headers.insert("x-api-key", api_key);
        }
        headers.insert(
            "anthropic-version",
            HeaderValue::from_static(ANTHROPIC_VERSION),
        );
    }
}

fn endpoint_origin(endpoint: &str) -> Result<String> {
    let url: reqwest::Url = endpoint
        .parse()
        .map_err(|_| RelayError::InvalidEndpoint(endpoint.to_string()))?;
    Ok(url.origin().ascii_serialization())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(protocol: Protocol) -> ProviderConfig {
        ProviderConfig {
            name: "p".to_string(),
            protocol,
            endpoint: "https://api.example.com/v1/chat/completions".to_string(),
            api_key: "sk-upstream".to_string(),
            proxy: None,
            real_model: None,
        }
    }

    #[test]
    fn openai_credentials_are_bearer_only() {
        let mut headers = HeaderMap::new();
        apply_credentials(&mut headers, &provider(Protocol::Openai));
        assert_eq!(headers["authorization"], "Bearer sk-upstream");
        assert!(headers.get("x-api-key").is_none());
        assert!(headers.get("anthropic-version").is_none());
    }

    #[test]
    fn anthropic_credentials_carry_api_key_and_version() {
        let mut headers = HeaderMap::new();
        apply_credentials(&mut headers, &provider(Protocol::Anthropic));
        assert_eq!(headers["authorization"], "Bearer sk-upstream");
        assert_eq!(headers["x-api-key"], "sk-upstream");
        assert_eq!(headers["anthropic-version"], ANTHROPIC_VERSION);
    }

    #[test]
    fn endpoint_origin_strips_path_and_keeps_port() {
        assert_eq!(
            endpoint_origin("http://localhost:9001/v1/chat/completions").expect("origin"),
            "http://localhost:9001"
        );
        assert!(endpoint_origin("not a url").is_err());
    }
}
