//! Prometheus metrics fed by route events and registry state

use crate::events::{EventBus, EventHandler, RouteEvent};
use anyhow::Result;
use async_trait::async_trait;
use mesh_core::{InstanceStatus, RegistryStore};
use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;
use tracing::debug;

/// Prometheus metrics collector for the gateway
#[derive(Clone)]
pub struct MetricsCollector {
    /// Upstream attempts by service and outcome
    pub route_attempts_total: CounterVec,
    /// Final routing results by service and outcome
    pub route_results_total: CounterVec,
    /// Latency of each upstream attempt in seconds
    pub route_attempt_duration_seconds: HistogramVec,
    /// Registered instances by service and status
    pub registry_instances: IntGaugeVec,
    /// Route events dropped by the event bus
    pub events_dropped: IntGauge,
    /// Prometheus registry for metrics
    pub registry: Arc<Registry>,
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let route_attempts_total = CounterVec::new(
            Opts::new("gateway_route_attempts_total", "Upstream attempts by outcome"),
            &["service", "outcome"],
        )?;

        let route_results_total = CounterVec::new(
            Opts::new("gateway_route_results_total", "Final routing results by outcome"),
            &["service", "outcome"],
        )?;

        let route_attempt_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "gateway_route_attempt_duration_seconds",
                "Upstream attempt latency in seconds",
            ),
            &["service"],
        )?;

        let registry_instances = IntGaugeVec::new(
            Opts::new("registry_instances", "Registered instances by status"),
            &["service", "status"],
        )?;

        let events_dropped = IntGauge::new(
            "gateway_events_dropped",
            "Route events dropped because the event queue was full",
        )?;

        registry.register(Box::new(route_attempts_total.clone()))?;
        registry.register(Box::new(route_results_total.clone()))?;
        registry.register(Box::new(route_attempt_duration_seconds.clone()))?;
        registry.register(Box::new(registry_instances.clone()))?;
        registry.register(Box::new(events_dropped.clone()))?;

        Ok(Self {
            route_attempts_total,
            route_results_total,
            route_attempt_duration_seconds,
            registry_instances,
            events_dropped,
            registry,
        })
    }

    /// Record one route event
    pub fn record(&self, event: &RouteEvent) {
        let outcome = event.outcome.as_str();
        if event.instance_id.is_some() {
            self.route_attempts_total
                .with_label_values(&[&event.service, outcome])
                .inc();
            self.route_attempt_duration_seconds
                .with_label_values(&[&event.service])
                .observe(event.latency.as_secs_f64());
        }
        if event.terminal {
            self.route_results_total
                .with_label_values(&[&event.service, outcome])
                .inc();
        }
    }

    /// Refresh the registry gauges from a snapshot of every service
    pub async fn observe_registry(&self, store: &RegistryStore) {
        self.registry_instances.reset();
        for service in store.service_names().await {
            let snapshot = store.snapshot(&service).await;
            for status in [
                InstanceStatus::Healthy,
                InstanceStatus::Suspect,
                InstanceStatus::Unhealthy,
                InstanceStatus::Draining,
            ] {
                let count = snapshot.iter().filter(|r| r.status == status).count();
                self.registry_instances
                    .with_label_values(&[&service, status.as_str()])
                    .set(count as i64);
            }
        }
    }

    pub fn observe_event_bus(&self, bus: &EventBus) {
        self.events_dropped.set(bus.dropped() as i64);
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// Event handler recording route events into the collector
pub struct MetricsHandler {
    pub collector: MetricsCollector,
}

impl MetricsHandler {
    pub fn new(collector: MetricsCollector) -> Self {
        Self { collector }
    }
}

#[async_trait]
impl EventHandler for MetricsHandler {
    fn name(&self) -> &'static str {
        "MetricsHandler"
    }

    async fn handle(&self, event: &RouteEvent) -> Result<()> {
        debug!(
            "Recording metrics for {} attempt {} ({})",
            event.service, event.attempt, event.outcome
        );
        self.collector.record(event);
        Ok(())
    }
}
