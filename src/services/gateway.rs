// src/services/gateway.rs
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{header, Client, Method};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::config::{MpesaConfig, TokenFallbackPolicy};
use crate::errors::{AppError, Result};
use crate::services::token_cache::TokenCache;

/// Provider error code that accompanies an invalid/expired bearer token on
/// an otherwise well-formed response.
const AUTH_ERROR_CODE: &str = "403.011.01";

/// Total attempt budget per logical call, covering both the auth-retry and
/// the timeout-retry paths.
const MAX_ATTEMPTS: u32 = 2;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// The gateway's edge proxy blocks the default client UA.
const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36";

#[derive(Debug)]
pub enum TransportError {
    Timeout,
    Other(String),
}

impl From<TransportError> for AppError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout => AppError::Timeout,
            TransportError::Other(msg) => AppError::Gateway(msg),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub status: u16,
    pub body: Value,
}

/// Wire-level seam between the request pipeline and the network, so the
/// retry behaviour is testable with scripted responses.
#[async_trait]
pub trait GatewayTransport: Send + Sync {
    async fn fetch_token(
        &self,
        url: &str,
        consumer_key: &str,
        consumer_secret: &str,
    ) -> std::result::Result<GatewayResponse, TransportError>;

    async fn execute(
        &self,
        method: Method,
        url: &str,
        bearer_token: &str,
        payload: Option<&Value>,
    ) -> std::result::Result<GatewayResponse, TransportError>;
}

pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .expect("Failed to create HTTP client");
        HttpTransport { client }
    }

    async fn into_gateway_response(
        response: reqwest::Response,
    ) -> std::result::Result<GatewayResponse, TransportError> {
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| TransportError::Other(e.to_string()))?;
        // Non-JSON bodies (edge-proxy block pages) are preserved verbatim.
        let body = serde_json::from_str(&text).unwrap_or_else(|_| json!({ "raw": text }));
        Ok(GatewayResponse { status, body })
    }

    fn map_error(err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout
        } else {
            TransportError::Other(err.to_string())
        }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GatewayTransport for HttpTransport {
    async fn fetch_token(
        &self,
        url: &str,
        consumer_key: &str,
        consumer_secret: &str,
    ) -> std::result::Result<GatewayResponse, TransportError> {
        let response = self
            .client
            .get(url)
            .basic_auth(consumer_key, Some(consumer_secret))
            .header(header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(Self::map_error)?;
        Self::into_gateway_response(response).await
    }

    async fn execute(
        &self,
        method: Method,
        url: &str,
        bearer_token: &str,
        payload: Option<&Value>,
    ) -> std::result::Result<GatewayResponse, TransportError> {
        let mut builder = self
            .client
            .request(method, url)
            .bearer_auth(bearer_token)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(payload) = payload {
            builder = builder.json(payload);
        }
        let response = builder.send().await.map_err(Self::map_error)?;
        Self::into_gateway_response(response).await
    }
}

/// Daraja client: token acquisition with caching plus the retry-protected
/// request pipeline every outbound call goes through.
pub struct MpesaGateway {
    pub(crate) config: MpesaConfig,
    cache: TokenCache,
    transport: Arc<dyn GatewayTransport>,
}

impl MpesaGateway {
    pub fn new(config: MpesaConfig) -> Self {
        Self::with_transport(config, Arc::new(HttpTransport::new()))
    }

    pub fn with_transport(config: MpesaConfig, transport: Arc<dyn GatewayTransport>) -> Self {
        MpesaGateway {
            config,
            cache: TokenCache::new(),
            transport,
        }
    }

    pub fn config(&self) -> &MpesaConfig {
        &self.config
    }

    /// Returns a usable bearer token, refreshing through OAuth when the
    /// cache misses. The per-tenant refresh lock collapses concurrent
    /// refreshes into one outbound call.
    pub async fn access_token(&self, force_refresh: bool) -> Result<String> {
        self.config.require_credentials()?;

        let tenant_id = self.config.tenant_id.clone();
        let lock = self.cache.refresh_lock(&tenant_id);
        let _guard = lock.lock().await;

        if !force_refresh {
            if let Some(token) = self.cache.get(&tenant_id, Utc::now()) {
                return Ok(token);
            }
        }

        match self.fetch_fresh_token().await {
            Ok(token) => Ok(token),
            Err(err) => {
                if self.config.token_fallback == TokenFallbackPolicy::ReuseCached {
                    if let Some(stale) = self.cache.get_stale(&tenant_id) {
                        warn!(
                            tenant_id,
                            error = %err,
                            "token refresh failed, reusing cached token"
                        );
                        return Ok(stale);
                    }
                }
                Err(err)
            }
        }
    }

    async fn fetch_fresh_token(&self) -> Result<String> {
        info!(tenant_id = %self.config.tenant_id, "requesting new access token");
        let endpoints = self.config.endpoints();
        let response = self
            .transport
            .fetch_token(
                &endpoints.oauth,
                &self.config.consumer_key,
                &self.config.consumer_secret,
            )
            .await
            .map_err(AppError::from)?;

        if response.status != 200 {
            return Err(AppError::Auth(format!(
                "token request failed with status {}",
                response.status
            )));
        }

        let token = response
            .body
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::gateway("token response missing access_token"))?
            .to_string();
        let expires_in = parse_expires_in(response.body.get("expires_in"));

        self.cache
            .put(&self.config.tenant_id, &token, expires_in, Utc::now());
        Ok(token)
    }

    /// Executes a gateway call with automatic token refresh on auth failure
    /// and a shared retry budget for timeouts. Business-level failures in
    /// the response body are returned as-is for the caller to interpret.
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        payload: Option<&Value>,
    ) -> Result<Value> {
        for attempt in 0..MAX_ATTEMPTS {
            let last_attempt = attempt + 1 == MAX_ATTEMPTS;
            let force_refresh = attempt > 0;

            let token = match self.access_token(force_refresh).await {
                Ok(token) => token,
                Err(err) => {
                    // Missing configuration cannot be fixed by retrying.
                    if last_attempt || matches!(err, AppError::Configuration(_)) {
                        return Err(err);
                    }
                    warn!(attempt, error = %err, "token acquisition failed, retrying");
                    continue;
                }
            };

            match self
                .transport
                .execute(method.clone(), url, &token, payload)
                .await
            {
                Ok(response) => {
                    if is_auth_failure(&response) {
                        warn!(attempt, "gateway rejected access token");
                        self.cache.invalidate(&self.config.tenant_id);
                        if last_attempt {
                            return Err(AppError::Auth(
                                "access token rejected by gateway".to_string(),
                            ));
                        }
                        continue;
                    }
                    return Ok(response.body);
                }
                Err(TransportError::Timeout) => {
                    warn!(attempt, url, "gateway request timed out");
                    if last_attempt {
                        return Err(AppError::Timeout);
                    }
                }
                Err(TransportError::Other(msg)) => {
                    warn!(attempt, url, error = %msg, "gateway request failed");
                    if last_attempt {
                        return Err(AppError::Gateway(msg));
                    }
                }
            }
        }

        Err(AppError::gateway("max retries exceeded"))
    }
}

fn is_auth_failure(response: &GatewayResponse) -> bool {
    response.status == 401
        || response.body.get("errorCode").and_then(Value::as_str) == Some(AUTH_ERROR_CODE)
}

/// Daraja returns `expires_in` as a string; tolerate a number too.
fn parse_expires_in(value: Option<&Value>) -> i64 {
    match value {
        Some(Value::String(s)) => s.parse().unwrap_or(3599),
        Some(Value::Number(n)) => n.as_i64().unwrap_or(3599),
        _ => 3599,
    }
}
