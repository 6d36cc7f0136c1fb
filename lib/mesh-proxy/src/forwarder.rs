//! HTTP request forwarding to upstream instances

use anyhow::Result;
use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::tokio::TokioExecutor;
use mesh_core::InstanceRecord;
use std::time::Duration;
use tracing::debug;

/// Transport used by the gateway router to reach an instance.
///
/// An `Err` is a transport failure; any HTTP response, including 5xx, is `Ok`.
/// Callers bound each call with their own timeout.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn send(&self, target: &InstanceRecord, request: Request<Full<Bytes>>) -> Result<Response<Bytes>>;
}

/// HTTP request forwarder with connection pooling
pub struct RequestForwarder {
    client: Client<HttpConnector, Full<Bytes>>,
    connect_timeout: Duration,
}

impl RequestForwarder {
    /// Create a new HTTP request forwarder with connection pooling
    pub fn new(connect_timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(connect_timeout));
        connector.set_keepalive(Some(Duration::from_secs(30)));

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .build::<_, Full<Bytes>>(connector);

        Self {
            client,
            connect_timeout,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }
}

#[async_trait]
impl Upstream for RequestForwarder {
    async fn send(&self, target: &InstanceRecord, request: Request<Full<Bytes>>) -> Result<Response<Bytes>> {
        debug!(
            "Forwarding {} {} to instance {} of {}",
            request.method(),
            request.uri(),
            target.id,
            target.service
        );

        let response = self.client.request(request).await?;
        debug!("Backend responded with status: {}", response.status());

        let (parts, body) = response.into_parts();
        let bytes = body.collect().await?.to_bytes();
        debug!("Response body size: {} bytes", bytes.len());

        Ok(Response::from_parts(parts, bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{GatewayRequest, RequestContext};
    use hyper::header::HeaderMap;
    use hyper::Method;
    use mesh_core::{InstanceId, InstanceStatus};
    use std::collections::BTreeMap;

    #[test]
    fn test_forwarder_creation() {
        let forwarder = RequestForwarder::new(Duration::from_secs(3));
        assert_eq!(forwarder.connect_timeout(), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport_error() {
        // Bind then drop a listener to get a port nothing listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let target = InstanceRecord {
            id: InstanceId::from(1),
            service: "orders".to_string(),
            address: "127.0.0.1".to_string(),
            port,
            metadata: BTreeMap::new(),
            status: InstanceStatus::Healthy,
            last_heartbeat: chrono::Utc::now(),
            registered_at: chrono::Utc::now(),
            probe_failures: 0,
        };
        let request = GatewayRequest::new(Method::GET, "/".parse().unwrap(), HeaderMap::new(), Bytes::new());
        let ctx = RequestContext::new(Duration::from_secs(1));

        let forwarder = RequestForwarder::new(Duration::from_millis(500));
        let result = forwarder
            .send(&target, request.to_upstream(&target, &ctx).unwrap())
            .await;
        assert!(result.is_err());
    }
}
