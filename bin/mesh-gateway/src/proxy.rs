//! Proxy listener: middleware, then the gateway router

use hyper::body::Body;
use hyper::Request;
use mesh_core::CoreError;
use mesh_proxy::http::{self, HttpResponse};
use mesh_proxy::{GatewayRequest, GatewayRouter, MiddlewareChain, RequestContext};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{debug, warn};

pub struct ProxyService {
    router: Arc<GatewayRouter>,
    middleware: Arc<MiddlewareChain>,
    request_timeout: Duration,
    max_body_bytes: usize,
}

impl ProxyService {
    pub fn new(
        router: Arc<GatewayRouter>,
        middleware: Arc<MiddlewareChain>,
        request_timeout: Duration,
        max_body_bytes: usize,
    ) -> Self {
        Self {
            router,
            middleware,
            request_timeout,
            max_body_bytes,
        }
    }

    pub async fn handle<B>(&self, req: Request<B>) -> HttpResponse
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        // The deadline covers reading the body too
        let context = RequestContext::new(self.request_timeout);
        let read = GatewayRequest::from_incoming(req, self.max_body_bytes);
        let request = match time::timeout_at(context.deadline(), read).await {
            Ok(Ok(request)) => request,
            Ok(Err(err)) => {
                debug!("Failed to read request {}: {}", context.request_id, err);
                return http::error_response(&err);
            }
            Err(_) => {
                warn!(
                    "Request {} body not received within {:?}",
                    context.request_id, self.request_timeout
                );
                return http::error_response(&CoreError::Timeout { attempts: 0 });
            }
        };
        self.serve(&context, request).await
    }

    async fn serve(&self, context: &RequestContext, request: GatewayRequest) -> HttpResponse {
        let response = match self.middleware.on_request(context, &request).await {
            Err(rejection) => http::rejection_response(&rejection),
            Ok(()) => match self.router.route(context, &request).await {
                Ok(response) => http::full(response),
                Err(err) => {
                    debug!(
                        "Request {} for {}{} failed: {}",
                        context.request_id,
                        request.host,
                        request.path(),
                        err
                    );
                    http::error_response(&err)
                }
            },
        };

        self.middleware
            .on_response(context, response.status().as_u16())
            .await;
        response
    }
}
