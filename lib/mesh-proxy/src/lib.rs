//! Gateway data plane: balancing, routing, forwarding and the pieces around them
pub mod config;
pub mod context;
pub mod events;
pub mod forwarder;
pub mod health_check;
pub mod http;
pub mod load_balancer;
pub mod metrics;
pub mod middleware;
pub mod policy;
pub mod router;

pub use config::{GatewayConfig, LogFormat, LoggingConfig, RetryConfig, RouteConfig};
pub use context::{GatewayRequest, RequestContext, ATTEMPT_HEADER, REQUEST_ID_HEADER};
pub use events::{Backpressure, EventBus, EventBusConfig, EventHandler, EventWorkers, LoggingHandler, RouteEvent, RouteOutcome};
pub use forwarder::{RequestForwarder, Upstream};
pub use health_check::{HttpProber, ProbeConfig, ProbeKind, TcpProber};
pub use load_balancer::{BalancerPolicy, LoadBalancer};
pub use metrics::{MetricsCollector, MetricsHandler};
pub use middleware::{BodySizeLimit, Middleware, MiddlewareChain, Rejection, RequestLoggingMiddleware};
pub use policy::{RetryPolicy, RoutePolicy};
pub use router::{GatewayRouter, RouteEntry, RouteTable};
