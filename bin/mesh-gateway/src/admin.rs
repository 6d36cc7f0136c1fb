//! Admin listener: registration, heartbeats, drain, snapshots and metrics

use http_body_util::{BodyExt, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::{Method, Request, StatusCode};
use mesh_api::{ErrorBody, HeartbeatResponse, InstanceView, RegisterInstanceRequest, RegisterInstanceResponse, ServiceSummary};
use mesh_core::{CoreError, HealthMonitor, InstanceId, InstanceRecord, RegistryStore};
use mesh_proxy::http::{self, HttpResponse};
use mesh_proxy::{EventBus, MetricsCollector};
use std::sync::Arc;
use tracing::{debug, info};

/// Operations exposed on the admin listener
#[derive(Debug, PartialEq, Eq)]
enum AdminRoute<'a> {
    Healthz,
    Metrics,
    ListServices,
    ListInstances(&'a str),
    Register(&'a str),
    Heartbeat(&'a str, &'a str),
    Deregister(&'a str, &'a str),
    Drain(&'a str, &'a str),
}

fn parse_route<'a>(method: &Method, path: &'a str) -> Option<AdminRoute<'a>> {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    let get = method == Method::GET;
    let post = method == Method::POST;

    match segments[..] {
        ["healthz"] if get => Some(AdminRoute::Healthz),
        ["metrics"] if get => Some(AdminRoute::Metrics),
        ["v1", "services"] if get => Some(AdminRoute::ListServices),
        ["v1", "services", service, "instances"] if get => Some(AdminRoute::ListInstances(service)),
        ["v1", "services", service, "instances"] if post => Some(AdminRoute::Register(service)),
        ["v1", "services", service, "instances", id, "heartbeat"] if method == Method::PUT => {
            Some(AdminRoute::Heartbeat(service, id))
        }
        ["v1", "services", service, "instances", id] if method == Method::DELETE => {
            Some(AdminRoute::Deregister(service, id))
        }
        ["v1", "services", service, "instances", id, "drain"] if post => Some(AdminRoute::Drain(service, id)),
        _ => None,
    }
}

fn error(err: &CoreError) -> HttpResponse {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    http::json(
        status,
        &ErrorBody {
            kind: err.kind().to_string(),
            message: err.to_string(),
        },
    )
}

/// Registration payloads are small; anything larger is refused
const MAX_ADMIN_BODY_BYTES: usize = 64 * 1024;

fn bad_request(message: impl Into<String>) -> HttpResponse {
    error(&CoreError::InvalidRequest(message.into()))
}

fn parse_id(service: &str, raw: &str) -> Result<InstanceId, CoreError> {
    raw.parse().map_err(|_| CoreError::UnknownInstance {
        service: service.to_string(),
        instance_id: raw.to_string(),
    })
}

fn view(record: &InstanceRecord) -> InstanceView {
    InstanceView {
        id: record.id.get(),
        address: record.address.clone(),
        port: record.port,
        metadata: record.metadata.clone(),
        status: record.status.as_str().to_string(),
        last_heartbeat: record.last_heartbeat,
        registered_at: record.registered_at,
    }
}

pub struct AdminService {
    store: Arc<RegistryStore>,
    monitor: Arc<HealthMonitor>,
    metrics: MetricsCollector,
    events: EventBus,
}

impl AdminService {
    pub fn new(
        store: Arc<RegistryStore>,
        monitor: Arc<HealthMonitor>,
        metrics: MetricsCollector,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            monitor,
            metrics,
            events,
        }
    }

    pub async fn handle(&self, req: Request<Incoming>) -> HttpResponse {
        let (parts, body) = req.into_parts();
        let body = match Limited::new(body, MAX_ADMIN_BODY_BYTES).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => return bad_request(format!("failed to read request body: {}", e)),
        };
        self.dispatch(&parts.method, parts.uri.path(), body).await
    }

    async fn dispatch(&self, method: &Method, path: &str, body: Bytes) -> HttpResponse {
        debug!("Admin {} {}", method, path);
        let Some(route) = parse_route(method, path) else {
            return http::not_found();
        };

        match route {
            AdminRoute::Healthz => http::text(StatusCode::OK, "OK\n"),
            AdminRoute::Metrics => {
                self.metrics.observe_registry(&self.store).await;
                self.metrics.observe_event_bus(&self.events);
                match self.metrics.gather() {
                    Ok(text) => {
                        let mut response = http::text(StatusCode::OK, text);
                        response.headers_mut().insert(
                            hyper::header::CONTENT_TYPE,
                            hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
                        );
                        response
                    }
                    Err(e) => error(&CoreError::Internal(format!("failed to gather metrics: {}", e))),
                }
            }
            AdminRoute::ListServices => {
                let mut summaries = Vec::new();
                for name in self.store.service_names().await {
                    let instances = self.store.snapshot(&name).await.len();
                    summaries.push(ServiceSummary { name, instances });
                }
                http::json(StatusCode::OK, &summaries)
            }
            AdminRoute::ListInstances(service) => {
                let views: Vec<InstanceView> = self.store.snapshot(service).await.iter().map(view).collect();
                http::json(StatusCode::OK, &views)
            }
            AdminRoute::Register(service) => {
                let request: RegisterInstanceRequest = match serde_json::from_slice(&body) {
                    Ok(request) => request,
                    Err(e) => return bad_request(format!("invalid registration body: {}", e)),
                };
                match self
                    .store
                    .register(service, request.address, request.port, request.metadata)
                    .await
                {
                    Ok(id) => http::json(
                        StatusCode::CREATED,
                        &RegisterInstanceResponse {
                            service: service.to_string(),
                            instance_id: id.get(),
                        },
                    ),
                    Err(err) => error(&err),
                }
            }
            AdminRoute::Heartbeat(service, raw_id) => {
                let result = match parse_id(service, raw_id) {
                    Ok(id) => self.store.heartbeat(service, id).await,
                    Err(err) => Err(err),
                };
                match result {
                    Ok(status) => http::json(
                        StatusCode::OK,
                        &HeartbeatResponse {
                            status: status.as_str().to_string(),
                        },
                    ),
                    Err(err) => error(&err),
                }
            }
            AdminRoute::Deregister(service, raw_id) => {
                if let Ok(id) = parse_id(service, raw_id) {
                    if self.store.deregister(service, id).await {
                        info!("Instance {} of {} deregistered via admin API", id, service);
                    }
                }
                http::empty(StatusCode::NO_CONTENT)
            }
            AdminRoute::Drain(service, raw_id) => {
                let result = match parse_id(service, raw_id) {
                    Ok(id) => self.monitor.drain(service, id).await,
                    Err(err) => Err(err),
                };
                match result {
                    Ok(()) => http::empty(StatusCode::NO_CONTENT),
                    Err(err) => error(&err),
                }
            }
        }
    }
}
