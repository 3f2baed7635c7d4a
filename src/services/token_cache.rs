// src/services/token_cache.rs
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use tracing::info;

/// Tokens are treated as expired this many seconds before the
/// provider-declared lifetime so no in-flight request observes expiry
/// mid-call.
pub const EXPIRY_BUFFER_SECS: i64 = 600;

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct TenantEntry {
    token: Option<CachedToken>,
    refresh_lock: Arc<tokio::sync::Mutex<()>>,
}

/// Process-wide bearer-token cache keyed by tenant. Cold start always forces
/// an OAuth fetch; nothing is persisted across restarts.
///
/// Expired entries are kept until invalidated or replaced so the gateway's
/// availability fallback can reuse them when the OAuth endpoint is down.
#[derive(Default)]
pub struct TokenCache {
    tenants: Mutex<HashMap<String, TenantEntry>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached token if it is still usable at `now`.
    pub fn get(&self, tenant_id: &str, now: DateTime<Utc>) -> Option<String> {
        let tenants = self.tenants.lock().expect("token cache mutex poisoned");
        tenants
            .get(tenant_id)
            .and_then(|entry| entry.token.as_ref())
            .filter(|cached| cached.expires_at > now)
            .map(|cached| cached.token.clone())
    }

    /// Returns the cached token even past expiry. Only used by the
    /// `reuse_cached` fallback policy.
    pub fn get_stale(&self, tenant_id: &str) -> Option<String> {
        let tenants = self.tenants.lock().expect("token cache mutex poisoned");
        tenants
            .get(tenant_id)
            .and_then(|entry| entry.token.as_ref())
            .map(|cached| cached.token.clone())
    }

    pub fn put(&self, tenant_id: &str, token: &str, expires_in_secs: i64, now: DateTime<Utc>) {
        let expires_at = now + Duration::seconds(expires_in_secs - EXPIRY_BUFFER_SECS);
        let mut tenants = self.tenants.lock().expect("token cache mutex poisoned");
        tenants.entry(tenant_id.to_string()).or_default().token = Some(CachedToken {
            token: token.to_string(),
            expires_at,
        });
        info!(
            tenant_id,
            minutes = (expires_in_secs - EXPIRY_BUFFER_SECS) / 60,
            "access token cached"
        );
    }

    pub fn invalidate(&self, tenant_id: &str) {
        let mut tenants = self.tenants.lock().expect("token cache mutex poisoned");
        if let Some(entry) = tenants.get_mut(tenant_id) {
            entry.token = None;
        }
    }

    /// Per-tenant mutex held across the check-then-refresh sequence so
    /// concurrent refreshes for one tenant collapse into a single OAuth call
    /// without serializing unrelated tenants.
    pub fn refresh_lock(&self, tenant_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut tenants = self.tenants.lock().expect("token cache mutex poisoned");
        tenants
            .entry(tenant_id.to_string())
            .or_default()
            .refresh_lock
            .clone()
    }
}
