use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};
use serde::Serialize;

use crate::error::ConfigError;

// Terminal outcome of one proxied request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Forwarded,
    RateLimited,
    ConcurrencyRejected,
    StoreRejected,
    BackendError,
    PayloadRejected,
}

// Snapshot served by /health
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub total_requests_processed: u64,
    pub total_requests_blocked: u64,
    pub total_rate_limited: u64,
    pub total_concurrency_rejected: u64,
    pub total_backend_errors: u64,
}

// Per-process counters, each instance reports only its own
pub struct GatewayMetrics {
    registry: Registry,
    processed: IntCounter,
    forwarded: IntCounter,
    rate_limited: IntCounter,
    concurrency_rejected: IntCounter,
    store_rejected: IntCounter,
    backend_errors: IntCounter,
    payload_rejected: IntCounter,
    store_errors: IntCounter,
    in_flight: IntGauge,
    latency: Histogram,
}

impl GatewayMetrics {
    pub fn new() -> Result<Self, ConfigError> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> Result<IntCounter, ConfigError> {
            let c = IntCounter::new(name, help)?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };

        let processed = counter("gateway_requests_processed_total", "Requests that reached a terminal outcome")?;
        let forwarded = counter("gateway_requests_forwarded_total", "Requests answered by the backend")?;
        let rate_limited = counter("gateway_requests_rate_limited_total", "Requests denied by the rate limiter")?;
        let concurrency_rejected = counter(
            "gateway_requests_concurrency_rejected_total",
            "Requests rejected because every concurrency slot was taken",
        )?;
        let store_rejected = counter(
            "gateway_requests_store_rejected_total",
            "Requests denied because the counter store failed under fail-closed",
        )?;
        let backend_errors = counter("gateway_backend_errors_total", "Backend timeouts and connection failures")?;
        let payload_rejected = counter(
            "gateway_requests_rejected_payload_total",
            "Requests rejected for oversized or unreadable bodies",
        )?;
        let store_errors = counter("gateway_store_errors_total", "Counter store calls that failed")?;

        let in_flight = IntGauge::new("gateway_in_flight", "Requests currently forwarded to the backend")?;
        registry.register(Box::new(in_flight.clone()))?;

        let latency = Histogram::with_opts(HistogramOpts::new(
            "gateway_request_latency_seconds",
            "Latency of forwarded requests in seconds",
        ))?;
        registry.register(Box::new(latency.clone()))?;

        Ok(Self {
            registry,
            processed,
            forwarded,
            rate_limited,
            concurrency_rejected,
            store_rejected,
            backend_errors,
            payload_rejected,
            store_errors,
            in_flight,
            latency,
        })
    }

    // The only write path for terminal outcomes
    pub fn record(&self, outcome: Outcome) {
        self.processed.inc();
        match outcome {
            Outcome::Forwarded => self.forwarded.inc(),
            Outcome::RateLimited => self.rate_limited.inc(),
            Outcome::ConcurrencyRejected => self.concurrency_rejected.inc(),
            Outcome::StoreRejected => self.store_rejected.inc(),
            Outcome::BackendError => self.backend_errors.inc(),
            Outcome::PayloadRejected => self.payload_rejected.inc(),
        }
    }

    pub fn store_error(&self) {
        self.store_errors.inc();
    }

    pub fn observe_latency(&self, seconds: f64) {
        self.latency.observe(seconds);
    }

    pub fn set_in_flight(&self, n: usize) {
        self.in_flight.set(n as i64);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let rate_limited = self.rate_limited.get();
        let concurrency_rejected = self.concurrency_rejected.get();
        MetricsSnapshot {
            total_requests_processed: self.processed.get(),
            total_requests_blocked: rate_limited + concurrency_rejected + self.store_rejected.get(),
            total_rate_limited: rate_limited,
            total_concurrency_rejected: concurrency_rejected,
            total_backend_errors: self.backend_errors.get(),
        }
    }

    pub fn store_errors(&self) -> u64 {
        self.store_errors.get()
    }

    // Prometheus text exposition
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
