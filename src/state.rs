use std::time::Duration;

use crate::concurrency::ConcurrencyLimiter;
use crate::config::FailPolicy;
use crate::forward::Forwarder;
use crate::metrics::GatewayMetrics;
use crate::rate_limit::RateLimiter;

// app's shared state, one per process behind an Arc

pub struct AppState {
    pub rate_limiter: RateLimiter,
    pub concurrency: ConcurrencyLimiter,
    pub forwarder: Forwarder,
    pub metrics: GatewayMetrics,
    pub fail_policy: FailPolicy,
    pub trust_forwarded_for: bool,
    pub health_timeout: Duration, // bound on the backend health probe
}
