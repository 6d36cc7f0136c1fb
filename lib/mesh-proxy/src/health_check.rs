//! Active health probes for registered instances

use anyhow::{bail, Result};
use async_trait::async_trait;
use mesh_core::{InstanceRecord, Prober};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Kind of active probe run by the health monitor
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    /// Heartbeats only
    #[default]
    None,
    /// TCP connect to the instance address
    Tcp,
    /// HTTP GET of the health path, 2xx passes
    Http,
}

/// Health probe configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProbeConfig {
    pub kind: ProbeKind,
    /// HTTP path to check for health
    pub path: String,
    /// Timeout for a single probe, in milliseconds
    pub timeout_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            kind: ProbeKind::None,
            path: "/healthz".to_string(),
            timeout_ms: 2000,
        }
    }
}

impl ProbeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Build the configured prober, if any
    pub fn build(&self) -> Result<Option<Arc<dyn Prober>>> {
        Ok(match self.kind {
            ProbeKind::None => None,
            ProbeKind::Tcp => Some(Arc::new(TcpProber)),
            ProbeKind::Http => Some(Arc::new(HttpProber::new(&self.path, self.timeout())?)),
        })
    }
}

/// Considers an instance alive when a TCP connection succeeds
pub struct TcpProber;

#[async_trait]
impl Prober for TcpProber {
    async fn probe(&self, instance: &InstanceRecord) -> Result<()> {
        TcpStream::connect((instance.address.as_str(), instance.port)).await?;
        debug!("TCP connection to {} succeeded", instance.authority());
        Ok(())
    }
}

/// Considers an instance alive when its health path answers 2xx
pub struct HttpProber {
    client: reqwest::Client,
    path: String,
}

impl HttpProber {
    pub fn new(path: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        Ok(Self { client, path })
    }

    fn probe_url(&self, instance: &InstanceRecord) -> String {
        format!("http://{}{}", instance.authority(), self.path)
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, instance: &InstanceRecord) -> Result<()> {
        let url = self.probe_url(instance);
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            bail!("{} answered {}", url, status);
        }
        debug!("Health check of {} passed", url);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_core::{InstanceId, InstanceStatus};
    use std::collections::BTreeMap;

    fn instance(port: u16) -> InstanceRecord {
        InstanceRecord {
            id: InstanceId::from(1),
            service: "orders".to_string(),
            address: "127.0.0.1".to_string(),
            port,
            metadata: BTreeMap::new(),
            status: InstanceStatus::Healthy,
            last_heartbeat: chrono::Utc::now(),
            registered_at: chrono::Utc::now(),
            probe_failures: 0,
        }
    }

    #[test]
    fn test_default_config() {
        let config = ProbeConfig::default();
        assert_eq!(config.kind, ProbeKind::None);
        assert_eq!(config.path, "/healthz");
        assert_eq!(config.timeout(), Duration::from_secs(2));
        assert!(config.build().unwrap().is_none());
    }

    #[test]
    fn test_probe_url() {
        let prober = HttpProber::new("health", Duration::from_secs(1)).unwrap();
        assert_eq!(prober.probe_url(&instance(3000)), "http://127.0.0.1:3000/health");
    }

    #[tokio::test]
    async fn test_tcp_probe() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(TcpProber.probe(&instance(port)).await.is_ok());

        drop(listener);
        assert!(TcpProber.probe(&instance(port)).await.is_err());
    }

    #[test]
    fn test_build_probers() {
        let tcp = ProbeConfig {
            kind: ProbeKind::Tcp,
            ..ProbeConfig::default()
        };
        assert!(tcp.build().unwrap().is_some());

        let http = ProbeConfig {
            kind: ProbeKind::Http,
            ..ProbeConfig::default()
        };
        assert!(http.build().unwrap().is_some());
    }
}
