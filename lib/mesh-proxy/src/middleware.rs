//! Middleware run before routing; any middleware may short-circuit a request

use crate::context::{GatewayRequest, RequestContext};
use async_trait::async_trait;
use hyper::StatusCode;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, span, Instrument, Level};

/// Reason a middleware refused a request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rejection {
    pub status: StatusCode,
    pub reason: String,
}

impl Rejection {
    pub fn new(status: StatusCode, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.reason, self.status)
    }
}

/// Middleware trait for processing requests and responses
#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &'static str {
        "UnnamedMiddleware"
    }

    /// Called before the request is routed
    async fn on_request(&self, _context: &RequestContext, _request: &GatewayRequest) -> Result<(), Rejection> {
        Ok(())
    }

    /// Called once the response status is known
    async fn on_response(&self, _context: &RequestContext, _status: u16) {}
}

/// Chain of middleware to execute in order
#[derive(Default)]
pub struct MiddlewareChain {
    middleware: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add middleware to the chain
    pub fn add<M: Middleware + 'static>(mut self, middleware: M) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    pub fn len(&self) -> usize {
        self.middleware.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middleware.is_empty()
    }

    /// Run every middleware in order; stops at the first rejection
    pub async fn on_request(&self, context: &RequestContext, request: &GatewayRequest) -> Result<(), Rejection> {
        for mw in &self.middleware {
            let span = span!(Level::DEBUG, "middleware", name = mw.name());
            if let Err(rejection) = mw.on_request(context, request).instrument(span).await {
                debug!("Request {} rejected: {}", context.request_id, rejection);
                return Err(rejection);
            }
        }
        Ok(())
    }

    /// Process response through all middleware (in reverse order)
    pub async fn on_response(&self, context: &RequestContext, status: u16) {
        for mw in self.middleware.iter().rev() {
            mw.on_response(context, status).await;
        }
    }
}

/// Logs each request and its final status
pub struct RequestLoggingMiddleware;

#[async_trait]
impl Middleware for RequestLoggingMiddleware {
    fn name(&self) -> &'static str {
        "RequestLoggingMiddleware"
    }

    async fn on_request(&self, context: &RequestContext, request: &GatewayRequest) -> Result<(), Rejection> {
        debug!(
            "Request {}: {} {}{} (headers: {})",
            context.request_id,
            request.method,
            request.host,
            request.path_and_query(),
            request.headers.len()
        );
        Ok(())
    }

    async fn on_response(&self, context: &RequestContext, status: u16) {
        debug!(
            "Response {}: {} after {} attempts",
            context.request_id,
            status,
            context.attempt()
        );
    }
}

/// Rejects requests whose buffered body exceeds a limit
pub struct BodySizeLimit {
    pub max_bytes: usize,
}

impl BodySizeLimit {
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }
}

#[async_trait]
impl Middleware for BodySizeLimit {
    fn name(&self) -> &'static str {
        "BodySizeLimit"
    }

    async fn on_request(&self, _context: &RequestContext, request: &GatewayRequest) -> Result<(), Rejection> {
        if request.body.len() > self.max_bytes {
            return Err(Rejection::new(
                StatusCode::PAYLOAD_TOO_LARGE,
                format!("request body exceeds {} bytes", self.max_bytes),
            ));
        }
        Ok(())
    }
}
