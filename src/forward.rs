use axum::{
    body::{Body, Bytes},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use std::net::IpAddr;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, warn};

use crate::error::{ConfigError, ForwardError};

// Headers that describe a single connection, not the message
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

// Inbound request, body already buffered
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_addr: IpAddr,
}

#[derive(Debug, Clone)]
pub struct ForwardedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl IntoResponse for ForwardedResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

pub struct Forwarder {
    client: reqwest::Client,
    backend: reqwest::Url,
    max_body_bytes: usize,
    body_timeout: Duration,
}

impl Forwarder {
    pub fn new(backend: &str, request_timeout: Duration, max_body_bytes: usize) -> Result<Self, ConfigError> {
        let backend = reqwest::Url::parse(backend)
            .map_err(|e| ConfigError::InvalidBackend(format!("{}: {}", backend, e)))?;

        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            client,
            backend,
            max_body_bytes,
            body_timeout: request_timeout,
        })
    }

    /// Buffer an inbound body. Refuses anything past the cap, and gives up on
    /// clients that don't finish sending within the request timeout.
    pub async fn read_body(&self, headers: &HeaderMap, body: Body) -> Result<Bytes, ForwardError> {
        let declared = headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok());
        if declared.is_some_and(|len| len > self.max_body_bytes) {
            return Err(ForwardError::RequestTooLarge(self.max_body_bytes));
        }

        let collected = timeout(self.body_timeout, Limited::new(body, self.max_body_bytes).collect())
            .await
            .map_err(|_| {
                warn!(timeout = ?self.body_timeout, "Client did not finish sending the request body");
                ForwardError::RequestBodyTimeout(self.body_timeout)
            })?;

        match collected {
            Ok(collected) => Ok(collected.to_bytes()),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                Err(ForwardError::RequestTooLarge(self.max_body_bytes))
            }
            Err(e) => Err(ForwardError::RequestBody(e.to_string())),
        }
    }

    // backend base + inbound path and query, verbatim
    pub fn outbound_url(&self, path: &str, query: Option<&str>) -> Result<reqwest::Url, ForwardError> {
        let base = self.backend.as_str().trim_end_matches('/');
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };

        let raw = match query {
            Some(q) if !q.is_empty() => format!("{}{}?{}", base, path, q),
            _ => format!("{}{}", base, path),
        };
        reqwest::Url::parse(&raw).map_err(|e| ForwardError::InvalidUri(format!("{}: {}", raw, e)))
    }

    pub async fn forward(&self, request: InboundRequest) -> Result<ForwardedResponse, ForwardError> {
        let url = self.outbound_url(&request.path, request.query.as_deref())?;
        let headers = outbound_headers(&request.headers, request.client_addr);
        let is_head = request.method == Method::HEAD;

        debug!(
            method = %request.method,
            url = %url,
            client = %request.client_addr,
            "Forwarding request to backend"
        );

        let mut builder = self.client.request(request.method, url).headers(headers);
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        let response = builder.send().await.map_err(classify)?;

        // HEAD has no body, its length describes the GET it stands in for
        if !is_head
            && response
                .content_length()
                .is_some_and(|len| len as usize > self.max_body_bytes)
        {
            return Err(ForwardError::ResponseTooLarge(self.max_body_bytes));
        }

        let status = response.status();
        let mut headers = strip_hop_by_hop(response.headers());
        if is_head {
            if let Some(len) = response.headers().get(header::CONTENT_LENGTH) {
                headers.insert(header::CONTENT_LENGTH, len.clone());
            }
        }
        let body = read_limited(response, self.max_body_bytes).await?;

        Ok(ForwardedResponse { status, headers, body })
    }

    // GET {backend}/health
    pub async fn probe_health(&self, probe_timeout: Duration) -> Result<StatusCode, ForwardError> {
        let url = self.outbound_url("/health", None)?;
        let response = self
            .client
            .get(url)
            .timeout(probe_timeout)
            .send()
            .await
            .map_err(classify)?;
        Ok(response.status())
    }
}

// Copy of the inbound headers as the backend should see them
pub fn outbound_headers(inbound: &HeaderMap, client_addr: IpAddr) -> HeaderMap {
    let mut headers = strip_hop_by_hop(inbound);
    headers.remove(header::HOST);

    let client = client_addr.to_string();
    let forwarded_for = match inbound.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.trim().is_empty() => format!("{}, {}", existing.trim(), client),
        _ => client,
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(HeaderName::from_static("x-forwarded-for"), value);
    }
    headers.insert(
        HeaderName::from_static("x-forwarded-proto"),
        HeaderValue::from_static("http"),
    );
    headers
}

// Drop hop-by-hop headers, including any named in `Connection`
pub fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let named: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let lower = name.as_str();
        if HOP_BY_HOP.contains(&lower) || lower == "content-length" || named.iter().any(|n| n == lower) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

async fn read_limited(mut response: reqwest::Response, max: usize) -> Result<Bytes, ForwardError> {
    let mut buf = Vec::new();
    while let Some(chunk) = response.chunk().await.map_err(classify)? {
        if buf.len() + chunk.len() > max {
            return Err(ForwardError::ResponseTooLarge(max));
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(Bytes::from(buf))
}

// Never hand raw transport errors to the caller
fn classify(e: reqwest::Error) -> ForwardError {
    if e.is_timeout() {
        error!(error = %e, "Backend request timed out");
        ForwardError::Timeout
    } else {
        error!(error = %e, "Backend request failed");
        ForwardError::Unavailable(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forwarder(base: &str) -> Forwarder {
        Forwarder::new(base, Duration::from_secs(1), 16).unwrap()
    }

    fn client_ip() -> IpAddr {
        "10.1.2.3".parse().unwrap()
    }

    #[test]
    fn url_preserves_path_and_query() {
        let f = forwarder("http://127.0.0.1:8001/");
        let url = f.outbound_url("/users/7", Some("expand=orders&x=1")).unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:8001/users/7?expand=orders&x=1");
    }

    #[test]
    fn url_keeps_backend_base_path() {
        let f = forwarder("http://backend:9000/api/");
        let url = f.outbound_url("/products", None).unwrap();
        assert_eq!(url.as_str(), "http://backend:9000/api/products");
    }

    #[test]
    fn host_dropped_and_forwarded_for_added() {
        let mut inbound = HeaderMap::new();
        inbound.insert(header::HOST, HeaderValue::from_static("gateway.local"));
        inbound.insert("x-custom", HeaderValue::from_static("kept"));

        let out = outbound_headers(&inbound, client_ip());
        assert!(out.get(header::HOST).is_none());
        assert_eq!(out.get("x-custom").unwrap(), "kept");
        assert_eq!(out.get("x-forwarded-for").unwrap(), "10.1.2.3");
        assert_eq!(out.get("x-forwarded-proto").unwrap(), "http");
    }

    #[test]
    fn forwarded_for_chain_is_appended() {
        let mut inbound = HeaderMap::new();
        inbound.insert("x-forwarded-for", HeaderValue::from_static("1.1.1.1"));

        let out = outbound_headers(&inbound, client_ip());
        assert_eq!(out.get("x-forwarded-for").unwrap(), "1.1.1.1, 10.1.2.3");
    }

    #[test]
    fn hop_by_hop_headers_are_stripped() {
        let mut inbound = HeaderMap::new();
        inbound.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-session-hop"));
        inbound.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        inbound.insert("x-session-hop", HeaderValue::from_static("1"));
        inbound.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        inbound.insert(header::CONTENT_LENGTH, HeaderValue::from_static("3"));
        inbound.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let out = strip_hop_by_hop(&inbound);
        assert_eq!(out.len(), 1);
        assert_eq!(out.get(header::CONTENT_TYPE).unwrap(), "application/json");
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let f = forwarder("http://127.0.0.1:8001/");

        let small = f.read_body(&HeaderMap::new(), Body::from("tiny")).await.unwrap();
        assert_eq!(&small[..], b"tiny");

        let err = f
            .read_body(&HeaderMap::new(), Body::from(vec![0u8; 64]))
            .await
            .unwrap_err();
        assert!(matches!(err, ForwardError::RequestTooLarge(16)));
    }

    #[tokio::test]
    async fn declared_length_over_cap_is_rejected_early() {
        let f = forwarder("http://127.0.0.1:8001/");
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("1000"));

        let err = f.read_body(&headers, Body::empty()).await.unwrap_err();
        assert!(matches!(err, ForwardError::RequestTooLarge(_)));
    }

    #[tokio::test]
    async fn stalled_body_times_out() {
        let f = Forwarder::new("http://127.0.0.1:8001/", Duration::from_millis(100), 16).unwrap();
        let stalled = Body::from_stream(futures::stream::pending::<Result<Bytes, std::io::Error>>());

        let err = f.read_body(&HeaderMap::new(), stalled).await.unwrap_err();
        assert!(matches!(err, ForwardError::RequestBodyTimeout(_)));
    }

    #[tokio::test]
    async fn unreachable_backend_is_unavailable() {
        let f = forwarder("http://127.0.0.1:1/");
        let request = InboundRequest {
            method: Method::GET,
            path: "/".to_string(),
            query: None,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            client_addr: client_ip(),
        };

        let err = f.forward(request).await.unwrap_err();
        assert!(matches!(err, ForwardError::Unavailable(_)));
    }
}
