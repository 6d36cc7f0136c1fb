//! Route events shipped to logging/metrics collaborators through a bounded queue

use async_trait::async_trait;
use mesh_core::InstanceId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outcome recorded by a route event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteOutcome {
    Success,
    NoRouteMatched,
    RetryableStatus,
    TransportError,
    AttemptTimeout,
    NoHealthyInstance,
    UpstreamUnavailable,
    DeadlineExceeded,
}

impl RouteOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteOutcome::Success => "success",
            RouteOutcome::NoRouteMatched => "no_route_matched",
            RouteOutcome::RetryableStatus => "retryable_status",
            RouteOutcome::TransportError => "transport_error",
            RouteOutcome::AttemptTimeout => "attempt_timeout",
            RouteOutcome::NoHealthyInstance => "no_healthy_instance",
            RouteOutcome::UpstreamUnavailable => "upstream_unavailable",
            RouteOutcome::DeadlineExceeded => "deadline_exceeded",
        }
    }
}

impl fmt::Display for RouteOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One attempt, or the final result, of routing a request
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RouteEvent {
    pub request_id: Uuid,
    pub route: String,
    pub service: String,
    pub instance_id: Option<InstanceId>,
    pub outcome: RouteOutcome,
    /// Upstream HTTP status when a response was received
    pub status: Option<u16>,
    pub latency: Duration,
    pub attempt: u32,
    /// Set on the event that concludes the request
    pub terminal: bool,
}

/// Consumer of route events
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &'static str {
        "UnnamedHandler"
    }

    async fn handle(&self, event: &RouteEvent) -> anyhow::Result<()>;
}

/// What `publish` does when the queue is full
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backpressure {
    /// Drop the event and count it
    #[default]
    Reject,
    /// Wait for room in the queue
    Block,
}

/// Event bus sizing
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EventBusConfig {
    pub capacity: usize,
    pub workers: usize,
    pub backpressure: Backpressure,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            workers: 2,
            backpressure: Backpressure::Reject,
        }
    }
}

/// Producer side of the bounded route event queue
#[derive(Clone)]
pub struct EventBus {
    tx: flume::Sender<RouteEvent>,
    backpressure: Backpressure,
    dropped: Arc<AtomicU64>,
}

impl EventBus {
    /// Start `config.workers` workers dispatching every event to all handlers
    pub fn start(config: &EventBusConfig, handlers: Vec<Arc<dyn EventHandler>>) -> (Self, EventWorkers) {
        let (tx, rx) = flume::bounded(config.capacity.max(1));
        let cancel = CancellationToken::new();
        let handlers: Arc<[Arc<dyn EventHandler>]> = handlers.into();

        let tasks = (0..config.workers.max(1))
            .map(|worker| {
                let rx = rx.clone();
                let handlers = handlers.clone();
                let cancel = cancel.clone();
                tokio::spawn(run_worker(worker, rx, handlers, cancel))
            })
            .collect();

        info!(
            "Event bus started with capacity {} and {} workers",
            config.capacity, config.workers
        );

        (
            Self {
                tx,
                backpressure: config.backpressure,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            EventWorkers { cancel, tasks },
        )
    }

    /// Queue an event. Returns false when it was dropped.
    pub async fn publish(&self, event: RouteEvent) -> bool {
        match self.backpressure {
            Backpressure::Reject => match self.tx.try_send(event) {
                Ok(()) => true,
                Err(flume::TrySendError::Full(_)) => {
                    let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    debug!("Event queue full, dropped event (total dropped: {})", dropped);
                    false
                }
                Err(flume::TrySendError::Disconnected(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    false
                }
            },
            Backpressure::Block => {
                if self.tx.send_async(event).await.is_err() {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    return false;
                }
                true
            }
        }
    }

    /// Number of events rejected so far
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Events currently waiting in the queue
    pub fn queued(&self) -> usize {
        self.tx.len()
    }
}

async fn run_worker(
    worker: usize,
    rx: flume::Receiver<RouteEvent>,
    handlers: Arc<[Arc<dyn EventHandler>]>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv_async() => match event {
                Ok(event) => event,
                Err(_) => return,
            },
        };
        dispatch(&handlers, &event).await;
    }

    // Flush what is already queued before exiting
    while let Ok(event) = rx.try_recv() {
        dispatch(&handlers, &event).await;
    }
    debug!("Event worker {} stopped", worker);
}

async fn dispatch(handlers: &[Arc<dyn EventHandler>], event: &RouteEvent) {
    for handler in handlers {
        if let Err(e) = handler.handle(event).await {
            warn!("Event handler {} failed: {}", handler.name(), e);
        }
    }
}

/// Worker pool consuming the event queue
pub struct EventWorkers {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl EventWorkers {
    /// Stop the workers after they flush the queue
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Event worker ended abnormally: {}", e);
            }
        }
    }
}

/// Writes every route event as a structured log line
pub struct LoggingHandler;

#[async_trait]
impl EventHandler for LoggingHandler {
    fn name(&self) -> &'static str {
        "LoggingHandler"
    }

    async fn handle(&self, event: &RouteEvent) -> anyhow::Result<()> {
        info!(
            request_id = %event.request_id,
            route = %event.route,
            service = %event.service,
            instance_id = ?event.instance_id.map(|id| id.get()),
            outcome = %event.outcome,
            status = ?event.status,
            latency_ms = event.latency.as_millis() as u64,
            attempt = event.attempt,
            terminal = event.terminal,
            "route event"
        );
        Ok(())
    }
}
