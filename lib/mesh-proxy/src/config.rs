//! Gateway configuration loaded once at startup from YAML

use crate::events::EventBusConfig;
use crate::health_check::ProbeConfig;
use crate::load_balancer::BalancerPolicy;
use crate::policy::{RetryPolicy, RoutePolicy};
use crate::router::{RouteEntry, RouteTable};
use anyhow::Context;
use mesh_core::{CoreError, MonitorConfig, Prober, Thresholds};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_admin_listen")]
    pub admin_listen: String,

    #[serde(default = "default_suspect_threshold")]
    pub suspect_threshold_ms: u64,
    /// Defaults to halfway between the suspect and expiry thresholds
    #[serde(default)]
    pub unhealthy_threshold_ms: Option<u64>,
    #[serde(default = "default_expiry_threshold")]
    pub expiry_threshold_ms: u64,
    #[serde(default = "default_probe_failures")]
    pub unhealthy_after_probe_failures: u32,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,
    #[serde(default = "default_max_concurrent_probes")]
    pub max_concurrent_probes: usize,
    #[serde(default)]
    pub probe: ProbeConfig,

    #[serde(default)]
    pub balancer_policy: BalancerPolicy,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_ms: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    #[serde(default)]
    pub events: EventBusConfig,
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

/// Retry settings shared by every route unless overridden
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub retryable_status_codes: Vec<u16>,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            retryable_status_codes: policy.retryable_status_codes,
            initial_backoff_ms: policy.initial_backoff.as_millis() as u64,
            max_backoff_ms: policy.max_backoff.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// Filter directives used when `RUST_LOG` is unset
    pub filter: Option<String>,
}

/// One routing rule; unset policy fields inherit the global settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteConfig {
    pub name: String,
    #[serde(default)]
    pub host: Option<String>,
    pub path_prefix: String,
    pub service: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub attempt_timeout_ms: Option<u64>,
    #[serde(default)]
    pub retryable_status_codes: Option<Vec<u16>>,
    #[serde(default)]
    pub initial_backoff_ms: Option<u64>,
    #[serde(default)]
    pub max_backoff_ms: Option<u64>,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_admin_listen() -> String {
    "0.0.0.0:9901".to_string()
}

fn default_suspect_threshold() -> u64 {
    15_000
}

fn default_expiry_threshold() -> u64 {
    90_000
}

fn default_probe_failures() -> u32 {
    3
}

fn default_sweep_interval() -> u64 {
    5_000
}

fn default_max_concurrent_probes() -> usize {
    32
}

fn default_max_retries() -> u32 {
    2
}

fn default_request_timeout() -> u64 {
    30_000
}

fn default_attempt_timeout() -> u64 {
    5_000
}

fn default_connect_timeout() -> u64 {
    2_000
}

fn default_max_body_bytes() -> usize {
    4 * 1024 * 1024
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            admin_listen: default_admin_listen(),
            suspect_threshold_ms: default_suspect_threshold(),
            unhealthy_threshold_ms: None,
            expiry_threshold_ms: default_expiry_threshold(),
            unhealthy_after_probe_failures: default_probe_failures(),
            sweep_interval_ms: default_sweep_interval(),
            max_concurrent_probes: default_max_concurrent_probes(),
            probe: ProbeConfig::default(),
            balancer_policy: BalancerPolicy::default(),
            max_retries: default_max_retries(),
            request_timeout_ms: default_request_timeout(),
            attempt_timeout_ms: default_attempt_timeout(),
            connect_timeout_ms: default_connect_timeout(),
            retry: RetryConfig::default(),
            max_body_bytes: default_max_body_bytes(),
            events: EventBusConfig::default(),
            logging: LoggingConfig::default(),
            routes: Vec::new(),
        }
    }
}

impl GatewayConfig {
    /// Load and validate configuration from a YAML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config = Self::from_yaml(&contents)
            .with_context(|| format!("Invalid config file: {}", path.display()))?;

        Ok(config)
    }

    pub fn from_yaml(contents: &str) -> mesh_core::Result<Self> {
        let config: GatewayConfig = serde_yaml::from_str(contents)
            .map_err(|e| CoreError::InvalidConfiguration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn unhealthy_threshold_ms(&self) -> u64 {
        self.unhealthy_threshold_ms.unwrap_or_else(|| {
            self.suspect_threshold_ms + (self.expiry_threshold_ms.saturating_sub(self.suspect_threshold_ms)) / 2
        })
    }

    /// Reject configurations the gateway cannot run with
    pub fn validate(&self) -> mesh_core::Result<()> {
        let invalid = |msg: String| -> mesh_core::Result<()> { Err(CoreError::InvalidConfiguration(msg)) };

        let suspect = self.suspect_threshold_ms;
        let unhealthy = self.unhealthy_threshold_ms();
        let expiry = self.expiry_threshold_ms;
        if suspect == 0 {
            return invalid("suspect_threshold_ms must be greater than zero".to_string());
        }
        if !(suspect < unhealthy && unhealthy < expiry) {
            return invalid(format!(
                "thresholds must satisfy suspect < unhealthy < expiry (got {} / {} / {})",
                suspect, unhealthy, expiry
            ));
        }
        if self.sweep_interval_ms == 0 {
            return invalid("sweep_interval_ms must be greater than zero".to_string());
        }
        if self.request_timeout_ms == 0 {
            return invalid("request_timeout_ms must be greater than zero".to_string());
        }
        if self.attempt_timeout_ms == 0 {
            return invalid("attempt_timeout_ms must be greater than zero".to_string());
        }
        if self.events.capacity == 0 || self.events.workers == 0 {
            return invalid("events.capacity and events.workers must be greater than zero".to_string());
        }

        let mut seen = HashSet::new();
        for route in &self.routes {
            if route.name.is_empty() || route.service.is_empty() {
                return invalid(format!(
                    "route for prefix '{}' needs a name and a service",
                    route.path_prefix
                ));
            }
            if route.path_prefix.is_empty() {
                return invalid(format!("route '{}' has an empty path_prefix", route.name));
            }
            if !route.path_prefix.starts_with('/') {
                return invalid(format!(
                    "route '{}' path_prefix '{}' must start with '/'",
                    route.name, route.path_prefix
                ));
            }
            if route.attempt_timeout_ms == Some(0) {
                return invalid(format!("route '{}' attempt_timeout_ms must be greater than zero", route.name));
            }
            let host = route.host.as_deref().map(str::to_ascii_lowercase);
            if !seen.insert((host, route.path_prefix.clone())) {
                return invalid(format!(
                    "route '{}' duplicates host {:?} and prefix '{}'",
                    route.name, route.host, route.path_prefix
                ));
            }
        }

        Ok(())
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            suspect_after: Duration::from_millis(self.suspect_threshold_ms),
            unhealthy_after: Duration::from_millis(self.unhealthy_threshold_ms()),
            expire_after: Duration::from_millis(self.expiry_threshold_ms),
            unhealthy_after_probe_failures: self.unhealthy_after_probe_failures,
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            sweep_interval: Duration::from_millis(self.sweep_interval_ms),
            probe_timeout: self.probe.timeout(),
            max_concurrent_probes: self.max_concurrent_probes.max(1),
            thresholds: self.thresholds(),
        }
    }

    pub fn prober(&self) -> anyhow::Result<Option<Arc<dyn Prober>>> {
        self.probe.build()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Policy of a route after applying its overrides to the globals
    pub fn route_policy(&self, route: &RouteConfig) -> RoutePolicy {
        let ms = Duration::from_millis;
        RoutePolicy {
            attempt_timeout: ms(route.attempt_timeout_ms.unwrap_or(self.attempt_timeout_ms)),
            retry: RetryPolicy {
                max_retries: route.max_retries.unwrap_or(self.max_retries),
                retryable_status_codes: route
                    .retryable_status_codes
                    .clone()
                    .unwrap_or_else(|| self.retry.retryable_status_codes.clone()),
                initial_backoff: ms(route.initial_backoff_ms.unwrap_or(self.retry.initial_backoff_ms)),
                max_backoff: ms(route.max_backoff_ms.unwrap_or(self.retry.max_backoff_ms)),
            },
        }
    }

    pub fn route_table(&self) -> RouteTable {
        let routes = self
            .routes
            .iter()
            .map(|route| {
                let mut entry = RouteEntry::new(&route.name, &route.path_prefix, &route.service)
                    .with_tags(route.tags.clone())
                    .with_policy(self.route_policy(route));
                if let Some(host) = &route.host {
                    entry = entry.with_host(host);
                }
                entry
            })
            .collect();
        RouteTable::new(routes)
    }
}
