use axum::http::HeaderMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::error::StoreError;
use crate::store::CounterStore;

// Rate limit partition key, derived from the caller's address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientIdentity(String);

impl ClientIdentity {
    pub fn new(identity: impl Into<String>) -> Self {
        Self(identity.into())
    }

    // first X-Forwarded-For entry when trusted, otherwise the peer ip
    pub fn from_request(remote: SocketAddr, headers: &HeaderMap, trust_forwarded_for: bool) -> Self {
        if trust_forwarded_for {
            let forwarded = headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.split(',').next())
                .map(str::trim)
                .filter(|s| !s.is_empty());

            if let Some(ip) = forwarded {
                return Self(ip.to_string());
            }
        }
        Self(remote.ip().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug)]
pub enum RateLimitDecision {
    Allow { count: u64, limit: u64 },
    Deny {
        count: u64,
        limit: u64,
        retry_after_secs: u64,
    },
    // store couldn't answer, the fail policy decides
    Unknown(StoreError),
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allow { .. })
    }
}

/// Fixed-window limiter. Each check increments `{prefix}:{identity}` and
/// re-arms its expiry, so a steady client keeps its window open.
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    limit: u64,
    window_secs: u64,
    key_prefix: String,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, limit: u64, window_secs: u64) -> Self {
        Self {
            store,
            limit,
            window_secs,
            key_prefix: "rate_limit".to_string(),
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn window_secs(&self) -> u64 {
        self.window_secs
    }

    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    pub fn key_for(&self, identity: &ClientIdentity) -> String {
        format!("{}:{}", self.key_prefix, identity)
    }

    // admits exactly `limit` per window, limit + 1 is the first denial
    pub async fn check(&self, identity: &ClientIdentity) -> RateLimitDecision {
        let key = self.key_for(identity);

        let window = match self.store.increment_and_bound(&key, self.window_secs).await {
            Ok(window) => window,
            Err(e) => return RateLimitDecision::Unknown(e),
        };

        trace!(key = %key, count = window.count, limit = self.limit, "Rate limit counted");

        if window.count > self.limit {
            debug!(client = %identity, count = window.count, "Rate limit exceeded");
            RateLimitDecision::Deny {
                count: window.count,
                limit: self.limit,
                retry_after_secs: window.ttl_secs.min(self.window_secs).max(1),
            }
        } else {
            RateLimitDecision::Allow {
                count: window.count,
                limit: self.limit,
            }
        }
    }
}
