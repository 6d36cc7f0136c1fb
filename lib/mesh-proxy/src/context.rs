//! Request-scoped state carried through middleware, routing and forwarding

use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, HOST};
use hyper::{Method, Request, Uri};
use mesh_core::{CoreError, InstanceRecord};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const ATTEMPT_HEADER: &str = "x-gateway-attempt";

/// Per-request context: identity, deadline and the attempt counter
#[derive(Debug)]
pub struct RequestContext {
    pub request_id: Uuid,
    deadline: Instant,
    attempt: AtomicU32,
}

impl RequestContext {
    /// Context whose deadline is `timeout` from now
    pub fn new(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            deadline,
            attempt: AtomicU32::new(0),
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the deadline, zero once it passed
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Number of upstream attempts made so far
    pub fn attempt(&self) -> u32 {
        self.attempt.load(Ordering::SeqCst)
    }

    /// Record a new upstream attempt and return its 1-based number
    pub(crate) fn begin_attempt(&self) -> u32 {
        self.attempt.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// A fully buffered inbound request, replayable across retries
#[derive(Clone, Debug)]
pub struct GatewayRequest {
    pub method: Method,
    pub uri: Uri,
    /// Lowercased host without port
    pub host: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl GatewayRequest {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Self {
        let host = headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| uri.authority().map(|a| a.to_string()))
            .map(|h| normalize_host(&h))
            .unwrap_or_default();

        Self {
            method,
            uri,
            host,
            headers,
            body,
        }
    }

    /// Buffer an inbound request, refusing bodies larger than `max_body_bytes`.
    ///
    /// The limit is enforced while streaming, so an oversized body is never
    /// held in memory. Callers bound the wait with the request deadline.
    pub async fn from_incoming<B>(request: Request<B>, max_body_bytes: usize) -> mesh_core::Result<Self>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let (parts, body) = request.into_parts();
        let body = match Limited::new(body, max_body_bytes).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                return Err(CoreError::PayloadTooLarge { limit: max_body_bytes });
            }
            Err(e) => return Err(CoreError::InvalidRequest(format!("failed to read request body: {}", e))),
        };
        Ok(Self::new(parts.method, parts.uri, parts.headers, body))
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn path_and_query(&self) -> &str {
        self.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
    }

    /// Build the request sent to `target` for the current attempt
    pub fn to_upstream(&self, target: &InstanceRecord, context: &RequestContext) -> anyhow::Result<Request<Full<Bytes>>> {
        let uri: Uri = format!("http://{}{}", target.authority(), self.path_and_query()).parse()?;

        let mut headers = HeaderMap::with_capacity(self.headers.len() + 2);
        for (name, value) in self.headers.iter() {
            if !is_hop_by_hop_header(name.as_str()) {
                headers.append(name.clone(), value.clone());
            }
        }
        headers.insert(
            HeaderName::from_static(REQUEST_ID_HEADER),
            HeaderValue::from_str(&context.request_id.to_string())?,
        );
        headers.insert(
            HeaderName::from_static(ATTEMPT_HEADER),
            HeaderValue::from(context.attempt()),
        );

        let mut request = Request::new(Full::new(self.body.clone()));
        *request.method_mut() = self.method.clone();
        *request.uri_mut() = uri;
        *request.headers_mut() = headers;
        Ok(request)
    }
}

/// Strip the port and lowercase a host
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let without_port = if host.starts_with('[') {
        // IPv6 literal
        host.split_once(']').map(|(h, _)| format!("{}]", h)).unwrap_or_else(|| host.to_string())
    } else {
        host.split(':').next().unwrap_or(host).to_string()
    };
    without_port.to_ascii_lowercase()
}

/// Check if header is hop-by-hop (should not be forwarded)
pub fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_core::{InstanceId, InstanceStatus};
    use std::collections::BTreeMap;

    fn target() -> InstanceRecord {
        InstanceRecord {
            id: InstanceId::from(3),
            service: "orders".to_string(),
            address: "10.0.0.3".to_string(),
            port: 9000,
            metadata: BTreeMap::new(),
            status: InstanceStatus::Healthy,
            last_heartbeat: chrono::Utc::now(),
            registered_at: chrono::Utc::now(),
            probe_failures: 0,
        }
    }

    #[test]
    fn test_host_from_header() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("API.Example.com:8443"));
        let req = GatewayRequest::new(Method::GET, "/orders/1".parse().unwrap(), headers, Bytes::new());
        assert_eq!(req.host, "api.example.com");
        assert_eq!(req.path(), "/orders/1");
    }

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("localhost:3000"), "localhost");
        assert_eq!(normalize_host("[::1]:8080"), "[::1]");
        assert_eq!(normalize_host("Example.COM"), "example.com");
    }

    #[test]
    fn test_to_upstream_rewrites_uri_and_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        let req = GatewayRequest::new(
            Method::POST,
            "/orders?limit=5".parse().unwrap(),
            headers,
            Bytes::from_static(b"{}"),
        );
        let ctx = RequestContext::new(Duration::from_secs(1));
        ctx.begin_attempt();

        let upstream = req.to_upstream(&target(), &ctx).unwrap();
        assert_eq!(upstream.uri().to_string(), "http://10.0.0.3:9000/orders?limit=5");
        assert_eq!(upstream.method(), &Method::POST);
        assert!(upstream.headers().get("connection").is_none());
        assert_eq!(upstream.headers()["content-type"], "application/json");
        assert_eq!(upstream.headers()[ATTEMPT_HEADER], "1");
        assert_eq!(
            upstream.headers()[REQUEST_ID_HEADER].to_str().unwrap(),
            ctx.request_id.to_string()
        );
    }

    #[tokio::test]
    async fn test_from_incoming_buffers_body() {
        let mut inbound = Request::new(Full::new(Bytes::from_static(b"hello")));
        *inbound.uri_mut() = "/orders".parse().unwrap();
        inbound.headers_mut().insert(HOST, HeaderValue::from_static("gateway.local"));

        let req = GatewayRequest::from_incoming(inbound, 5).await.unwrap();
        assert_eq!(req.body, Bytes::from_static(b"hello"));
        assert_eq!(req.host, "gateway.local");
    }

    #[tokio::test]
    async fn test_from_incoming_rejects_oversized_body() {
        let inbound = Request::new(Full::new(Bytes::from(vec![0u8; 64])));
        let err = GatewayRequest::from_incoming(inbound, 16).await.unwrap_err();
        assert_eq!(err, CoreError::PayloadTooLarge { limit: 16 });
        assert_eq!(err.status_code(), 413);
    }

    #[test]
    fn test_attempt_counter() {
        let ctx = RequestContext::new(Duration::from_secs(1));
        assert_eq!(ctx.attempt(), 0);
        assert_eq!(ctx.begin_attempt(), 1);
        assert_eq!(ctx.begin_attempt(), 2);
        assert_eq!(ctx.attempt(), 2);
    }

    #[test]
    fn test_hop_by_hop_headers() {
        assert!(is_hop_by_hop_header("connection"));
        assert!(is_hop_by_hop_header("Keep-Alive"));
        assert!(is_hop_by_hop_header("transfer-encoding"));
        assert!(!is_hop_by_hop_header("content-type"));
        assert!(!is_hop_by_hop_header("authorization"));
    }
}
