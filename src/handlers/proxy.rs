use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderName, HeaderValue},
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::FailPolicy;
use crate::error::{ForwardError, GatewayError};
use crate::forward::InboundRequest;
use crate::metrics::Outcome;
use crate::rate_limit::{ClientIdentity, RateLimitDecision};
use crate::state::AppState;

// Catch-all handler: identify -> rate limit -> concurrency -> forward -> release
pub async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let identity = ClientIdentity::from_request(remote, &parts.headers, state.trust_forwarded_for);

    // Rate limit check
    let quota = match state.rate_limiter.check(&identity).await {
        RateLimitDecision::Allow { count, limit } => Some((limit, limit.saturating_sub(count))),
        RateLimitDecision::Deny {
            limit,
            retry_after_secs,
            ..
        } => {
            debug!(client = %identity, "Request rate limited");
            state.metrics.record(Outcome::RateLimited);
            return GatewayError::RateLimited {
                limit,
                retry_after_secs,
            }
            .into_response();
        }
        RateLimitDecision::Unknown(e) => {
            state.metrics.store_error();
            match state.fail_policy {
                FailPolicy::Open => {
                    warn!(client = %identity, error = %e, "Counter store unavailable, failing open");
                    None
                }
                FailPolicy::Closed => {
                    warn!(client = %identity, error = %e, "Counter store unavailable, failing closed");
                    state.metrics.record(Outcome::StoreRejected);
                    return GatewayError::StoreUnavailable {
                        retry_after_secs: state.rate_limiter.window_secs(),
                    }
                    .into_response();
                }
            }
        }
    };

    // Concurrency admission, no queueing
    let Some(slot) = state.concurrency.try_acquire() else {
        debug!(client = %identity, "All concurrency slots taken");
        state.metrics.record(Outcome::ConcurrencyRejected);
        return GatewayError::Overloaded.into_response();
    };
    state.metrics.set_in_flight(state.concurrency.in_flight());

    let method = parts.method.clone();
    let path = parts.uri.path().to_string();
    let start = Instant::now();

    let result = match state.forwarder.read_body(&parts.headers, body).await {
        Ok(body) => {
            let inbound = InboundRequest {
                method: parts.method,
                path: path.clone(),
                query: parts.uri.query().map(str::to_string),
                headers: parts.headers,
                body,
                client_addr: remote.ip(),
            };
            state.forwarder.forward(inbound).await
        }
        Err(e) => Err(e),
    };

    // Slot goes back before the response is written out
    drop(slot);
    state.metrics.set_in_flight(state.concurrency.in_flight());

    match result {
        Ok(forwarded) => {
            state.metrics.record(Outcome::Forwarded);
            state.metrics.observe_latency(start.elapsed().as_secs_f64());
            info!(
                client = %identity,
                method = %method,
                path = %path,
                status = forwarded.status.as_u16(),
                "Proxied request"
            );

            let mut response = forwarded.into_response();
            if let Some((limit, remaining)) = quota {
                let headers = response.headers_mut();
                headers.insert(HeaderName::from_static("x-ratelimit-limit"), HeaderValue::from(limit));
                headers.insert(HeaderName::from_static("x-ratelimit-remaining"), HeaderValue::from(remaining));
            }
            response
        }
        Err(e) => {
            let outcome = match e {
                ForwardError::RequestTooLarge(_)
                | ForwardError::RequestBody(_)
                | ForwardError::RequestBodyTimeout(_) => Outcome::PayloadRejected,
                _ => Outcome::BackendError,
            };
            state.metrics.record(outcome);
            GatewayError::from(e).into_response()
        }
    }
}
