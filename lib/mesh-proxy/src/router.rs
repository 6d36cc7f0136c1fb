//! Gateway router: matches requests to routes and dispatches them to healthy instances

use crate::context::{GatewayRequest, RequestContext};
use crate::events::{EventBus, RouteEvent, RouteOutcome};
use crate::forwarder::Upstream;
use crate::load_balancer::LoadBalancer;
use crate::policy::RoutePolicy;
use hyper::body::Bytes;
use hyper::Response;
use mesh_core::{CoreError, InstanceId, InstanceRecord, Result};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time;
use tracing::{debug, warn};

/// Maps an inbound host/path pattern to a service
#[derive(Clone, Debug, PartialEq)]
pub struct RouteEntry {
    pub name: String,
    /// Exact host, `*.suffix` wildcard, or any host when unset
    pub host: Option<String>,
    pub path_prefix: String,
    pub service: String,
    /// Metadata every selected instance must carry
    pub tags: BTreeMap<String, String>,
    pub policy: RoutePolicy,
}

impl RouteEntry {
    pub fn new(name: impl Into<String>, path_prefix: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: None,
            path_prefix: path_prefix.into(),
            service: service.into(),
            tags: BTreeMap::new(),
            policy: RoutePolicy::default(),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into().to_ascii_lowercase());
        self
    }

    pub fn with_tags(mut self, tags: BTreeMap<String, String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_policy(mut self, policy: RoutePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Specificity of this entry for a request, `None` when it does not match.
    /// Longer path prefixes win; at equal length exact hosts beat wildcards,
    /// which beat host-less entries.
    fn specificity(&self, host: &str, path: &str) -> Option<(usize, u8)> {
        let host_rank = match &self.host {
            None => 0,
            Some(pattern) => {
                if !match_host(host, pattern) {
                    return None;
                }
                if pattern.starts_with("*.") {
                    1
                } else {
                    2
                }
            }
        };
        if !match_path(path, &self.path_prefix) {
            return None;
        }
        Some((prefix_len(&self.path_prefix), host_rank))
    }
}

/// Match a request path against a route prefix
pub fn match_path(path: &str, pattern: &str) -> bool {
    if pattern == "/" || pattern == "/*" {
        return true;
    }

    // Exact match
    if pattern == path {
        return true;
    }

    // Prefix match with wildcard
    if let Some(prefix) = pattern.strip_suffix("/*") {
        return path == prefix || path.starts_with(&format!("{}/", prefix));
    }

    // Prefix match (pattern ends with /)
    if pattern.ends_with('/') {
        return path.starts_with(pattern) || path == pattern.trim_end_matches('/');
    }

    // Segment-aligned prefix
    path.starts_with(&format!("{}/", pattern))
}

/// Match a normalized request host against an exact or `*.suffix` pattern
pub fn match_host(host: &str, pattern: &str) -> bool {
    match pattern.strip_prefix('*') {
        Some(suffix) if suffix.starts_with('.') => host.len() > suffix.len() && host.ends_with(suffix),
        _ => host.eq_ignore_ascii_case(pattern),
    }
}

fn prefix_len(pattern: &str) -> usize {
    pattern.strip_suffix("/*").unwrap_or(pattern).trim_end_matches('/').len()
}

/// Immutable routing table loaded at startup
#[derive(Clone, Debug, Default)]
pub struct RouteTable {
    routes: Vec<RouteEntry>,
}

impl RouteTable {
    pub fn new(routes: Vec<RouteEntry>) -> Self {
        Self { routes }
    }

    pub fn routes(&self) -> &[RouteEntry] {
        &self.routes
    }

    /// Longest-prefix match on host and path; declaration order breaks ties
    pub fn resolve(&self, host: &str, path: &str) -> Result<&RouteEntry> {
        let mut best: Option<(&RouteEntry, (usize, u8))> = None;
        for route in &self.routes {
            if let Some(score) = route.specificity(host, path) {
                if best.map(|(_, s)| score > s).unwrap_or(true) {
                    best = Some((route, score));
                }
            }
        }

        best.map(|(route, _)| route).ok_or_else(|| CoreError::NoRouteMatched {
            host: host.to_string(),
            path: path.to_string(),
        })
    }
}

/// Routes requests to upstream instances with retry and failover
pub struct GatewayRouter {
    table: RouteTable,
    balancer: Arc<LoadBalancer>,
    upstream: Arc<dyn Upstream>,
    events: Option<EventBus>,
}

impl GatewayRouter {
    pub fn new(table: RouteTable, balancer: Arc<LoadBalancer>, upstream: Arc<dyn Upstream>) -> Self {
        Self {
            table,
            balancer,
            upstream,
            events: None,
        }
    }

    /// Publish a route event for every attempt and final outcome
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn table(&self) -> &RouteTable {
        &self.table
    }

    /// Route a request, returning before the context deadline in every case
    pub async fn route(&self, context: &RequestContext, request: &GatewayRequest) -> Result<Response<Bytes>> {
        let route = match self.table.resolve(&request.host, request.path()) {
            Ok(route) => route,
            Err(err) => {
                debug!("Request {} matched no route: {}", context.request_id, err);
                self.emit(RouteEvent {
                    request_id: context.request_id,
                    route: String::new(),
                    service: String::new(),
                    instance_id: None,
                    outcome: RouteOutcome::NoRouteMatched,
                    status: None,
                    latency: Duration::ZERO,
                    attempt: context.attempt(),
                    terminal: true,
                })
                .await;
                return Err(err);
            }
        };
        debug!(
            "Request {} matched route {} -> {}",
            context.request_id, route.name, route.service
        );

        let started = Instant::now();
        match time::timeout_at(context.deadline(), self.dispatch(context, route, request, started)).await {
            Ok(result) => result,
            Err(_) => Err(self.deadline_exceeded(context, route, started)),
        }
    }

    fn deadline_exceeded(&self, context: &RequestContext, route: &RouteEntry, started: Instant) -> CoreError {
        let attempts = context.attempt();
        warn!(
            "Request {} to {} exceeded its deadline after {} attempts",
            context.request_id, route.service, attempts
        );
        let event = self.event(
            context,
            route,
            None,
            RouteOutcome::DeadlineExceeded,
            None,
            started.elapsed(),
            true,
        );
        if let Some(events) = self.events.clone() {
            // Publishing must not extend the caller's wait
            tokio::spawn(async move {
                events.publish(event).await;
            });
        }
        CoreError::Timeout { attempts }
    }

    async fn dispatch(
        &self,
        context: &RequestContext,
        route: &RouteEntry,
        request: &GatewayRequest,
        started: Instant,
    ) -> Result<Response<Bytes>> {
        let policy = &route.policy;
        let mut tried: HashSet<InstanceId> = HashSet::new();

        for retry in 0..policy.retry.max_attempts() {
            if retry > 0 {
                let backoff = policy.retry.backoff_duration(retry - 1).min(context.remaining());
                if !backoff.is_zero() {
                    time::sleep(backoff).await;
                }
            }
            if context.is_expired() {
                return Err(self.deadline_exceeded(context, route, started));
            }

            let instance = match self.pick_fresh(route, &tried).await {
                Ok(instance) => instance,
                Err(err @ CoreError::NoHealthyInstance(_)) if tried.is_empty() => {
                    warn!("No healthy instance of {} for request {}", route.service, context.request_id);
                    self.emit(self.event(
                        context,
                        route,
                        None,
                        RouteOutcome::NoHealthyInstance,
                        None,
                        started.elapsed(),
                        true,
                    ))
                    .await;
                    return Err(err);
                }
                // Every instance disappeared between attempts
                Err(CoreError::NoHealthyInstance(_)) => break,
                Err(err) => return Err(err),
            };
            tried.insert(instance.id);

            let attempt = context.begin_attempt();
            let upstream_request = request
                .to_upstream(&instance, context)
                .map_err(|e| CoreError::Internal(e.to_string()))?;
            let attempt_timeout = policy.attempt_timeout.min(context.remaining());

            let attempt_started = Instant::now();
            let result = time::timeout(attempt_timeout, self.upstream.send(&instance, upstream_request)).await;
            let latency = attempt_started.elapsed();

            let (outcome, status) = match result {
                Ok(Ok(response)) => {
                    let status = response.status().as_u16();
                    if !policy.retry.should_retry(status) {
                        debug!(
                            "Request {} served by instance {} of {} with {} (attempt {})",
                            context.request_id, instance.id, route.service, status, attempt
                        );
                        self.emit(self.event(
                            context,
                            route,
                            Some(&instance),
                            RouteOutcome::Success,
                            Some(status),
                            latency,
                            true,
                        ))
                        .await;
                        return Ok(response);
                    }
                    warn!(
                        "Instance {} of {} answered retryable status {} (attempt {})",
                        instance.id, route.service, status, attempt
                    );
                    (RouteOutcome::RetryableStatus, Some(status))
                }
                Ok(Err(e)) => {
                    warn!(
                        "Transport error to instance {} of {} at {}: {} (attempt {})",
                        instance.id,
                        route.service,
                        instance.authority(),
                        e,
                        attempt
                    );
                    (RouteOutcome::TransportError, None)
                }
                Err(_) => {
                    warn!(
                        "Instance {} of {} timed out after {:?} (attempt {})",
                        instance.id, route.service, attempt_timeout, attempt
                    );
                    (RouteOutcome::AttemptTimeout, None)
                }
            };
            self.emit(self.event(context, route, Some(&instance), outcome, status, latency, false))
                .await;
        }

        let attempts = context.attempt();
        warn!(
            "Upstream {} unavailable for request {} after {} attempts",
            route.service, context.request_id, attempts
        );
        self.emit(self.event(
            context,
            route,
            None,
            RouteOutcome::UpstreamUnavailable,
            None,
            started.elapsed(),
            true,
        ))
        .await;
        Err(CoreError::UpstreamUnavailable {
            service: route.service.clone(),
            attempts,
        })
    }

    /// Prefer an instance not tried yet; once every eligible instance has
    /// been tried, start a new pass over the whole set
    async fn pick_fresh(&self, route: &RouteEntry, tried: &HashSet<InstanceId>) -> Result<InstanceRecord> {
        match self.balancer.pick_excluding(&route.service, &route.tags, tried).await {
            Err(CoreError::NoHealthyInstance(_)) if !tried.is_empty() => {
                self.balancer.pick(&route.service, &route.tags).await
            }
            other => other,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn event(
        &self,
        context: &RequestContext,
        route: &RouteEntry,
        instance: Option<&InstanceRecord>,
        outcome: RouteOutcome,
        status: Option<u16>,
        latency: Duration,
        terminal: bool,
    ) -> RouteEvent {
        RouteEvent {
            request_id: context.request_id,
            route: route.name.clone(),
            service: route.service.clone(),
            instance_id: instance.map(|i| i.id),
            outcome,
            status,
            latency,
            attempt: context.attempt(),
            terminal,
        }
    }

    async fn emit(&self, event: RouteEvent) {
        if let Some(events) = &self.events {
            events.publish(event).await;
        }
    }
}
