use anyhow::{Context, Result};
use hyper::{body::Incoming, server::conn::http1, service::service_fn, Request};
use hyper_util::rt::tokio::TokioIo;
use mesh_core::{HealthMonitor, RegistryStore, SystemClock};
use mesh_proxy::http::HttpResponse;
use mesh_proxy::{
    BodySizeLimit, EventBus, EventHandler, GatewayConfig, GatewayRouter, LoadBalancer, LogFormat,
    LoggingConfig, LoggingHandler, MetricsCollector, MetricsHandler, MiddlewareChain,
    RequestForwarder, RequestLoggingMiddleware,
};
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod admin;
mod proxy;

use admin::AdminService;
use proxy::ProxyService;

const DEFAULT_CONFIG_PATH: &str = "/etc/mesh-gateway/config.yaml";
const DEFAULT_LOG_FILTER: &str = "mesh_gateway=info,mesh_core=info,mesh_proxy=info";

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("MESH_GATEWAY_CONFIG").ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = GatewayConfig::load(&config_path)?;

    init_tracing(&config.logging);
    info!("Starting mesh-gateway with config {}", config_path);

    // Registry and health monitor
    let store = Arc::new(RegistryStore::new(Arc::new(SystemClock)));
    let mut monitor = HealthMonitor::new(store.clone(), config.monitor_config());
    if let Some(prober) = config.prober().context("Failed to build health prober")? {
        monitor = monitor.with_prober(prober);
    }
    let monitor = Arc::new(monitor);
    let monitor_handle = monitor.clone().spawn();
    info!(
        "Health monitor started (probe: {:?}, sweep every {}ms)",
        config.probe.kind, config.sweep_interval_ms
    );

    // Route events feed logs and metrics
    let metrics = MetricsCollector::new().context("Failed to create metrics collector")?;
    let handlers: Vec<Arc<dyn EventHandler>> = vec![
        Arc::new(LoggingHandler),
        Arc::new(MetricsHandler::new(metrics.clone())),
    ];
    let (events, event_workers) = EventBus::start(&config.events, handlers);

    let balancer = Arc::new(LoadBalancer::new(store.clone(), config.balancer_policy));
    let forwarder = Arc::new(RequestForwarder::new(config.connect_timeout()));
    let router = Arc::new(
        GatewayRouter::new(config.route_table(), balancer, forwarder).with_events(events.clone()),
    );
    info!(
        "Router initialized with {} routes ({:?} balancing, {} max retries)",
        router.table().routes().len(),
        config.balancer_policy,
        config.max_retries
    );

    let middleware = Arc::new(
        MiddlewareChain::new()
            .add(RequestLoggingMiddleware)
            .add(BodySizeLimit::new(config.max_body_bytes)),
    );

    let proxy = Arc::new(ProxyService::new(
        router,
        middleware,
        config.request_timeout(),
        config.max_body_bytes,
    ));
    let admin = Arc::new(AdminService::new(store, monitor, metrics, events));

    let proxy_listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("Failed to bind proxy listener on {}", config.listen))?;
    info!("Proxy listening on {}", config.listen);

    let admin_listener = TcpListener::bind(&config.admin_listen)
        .await
        .with_context(|| format!("Failed to bind admin listener on {}", config.admin_listen))?;
    info!("Admin API listening on {}", config.admin_listen);

    tokio::select! {
        _ = serve(proxy_listener, "proxy", move |req| {
            let proxy = proxy.clone();
            async move { proxy.handle(req).await }
        }) => {}
        _ = serve(admin_listener, "admin", move |req| {
            let admin = admin.clone();
            async move { admin.handle(req).await }
        }) => {}
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for shutdown signal")?;
            info!("Shutdown signal received");
        }
    }

    monitor_handle.shutdown().await;
    event_workers.shutdown().await;
    info!("mesh-gateway stopped");

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let directives = logging
        .filter
        .clone()
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Accept connections forever, serving each with `handler`
async fn serve<H, F>(listener: TcpListener, name: &'static str, handler: H)
where
    H: Fn(Request<Incoming>) -> F + Clone + Send + Sync + 'static,
    F: Future<Output = HttpResponse> + Send + 'static,
{
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Error accepting {} connection: {}", name, e);
                continue;
            }
        };
        let io = TokioIo::new(stream);
        let handler = handler.clone();

        tokio::task::spawn(async move {
            let service = service_fn(move |req| {
                let response = handler(req);
                async move { Ok::<_, Infallible>(response.await) }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!("Error serving {} connection from {}: {}", name, peer_addr, e);
            }
        });
    }
}
