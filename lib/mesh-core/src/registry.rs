//! Registry store: authoritative mapping of service name to instance records

use crate::clock::{Clock, SystemClock};
use crate::instance::{InstanceId, InstanceRecord, InstanceStatus, ProbeOutcome, Thresholds, Verdict};
use crate::{CoreError, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// RegistryStore owns every instance record.
///
/// Each service name has its own lock; mutations take it exclusively and
/// snapshots share it, so a reader never observes a partially applied write.
pub struct RegistryStore {
    services: RwLock<HashMap<String, Arc<RwLock<ServiceEntry>>>>,
    next_id: AtomicU64,
    clock: Arc<dyn Clock>,
}

#[derive(Default)]
struct ServiceEntry {
    instances: BTreeMap<InstanceId, InstanceRecord>,
    /// Set once the entry is unlinked from the map; writers must look it up again
    retired: bool,
}

/// Outcome of applying one sweep observation to a stored instance
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Observation {
    pub verdict: Verdict,
    pub status: InstanceStatus,
}

impl RegistryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            clock,
        }
    }

    /// The clock used to stamp heartbeats and registrations
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    async fn entry(&self, service: &str) -> Arc<RwLock<ServiceEntry>> {
        if let Some(entry) = self.services.read().await.get(service) {
            return entry.clone();
        }
        let mut services = self.services.write().await;
        services.entry(service.to_string()).or_default().clone()
    }

    async fn existing(&self, service: &str) -> Option<Arc<RwLock<ServiceEntry>>> {
        self.services.read().await.get(service).cloned()
    }

    /// Drop a service's entry once its last instance is gone
    async fn prune(&self, service: &str) {
        let mut services = self.services.write().await;
        let Some(entry) = services.get(service).cloned() else {
            return;
        };
        let mut entry = entry.write().await;
        if entry.instances.is_empty() {
            entry.retired = true;
            services.remove(service);
            debug!("Removed empty service entry {}", service);
        }
    }

    /// Register a new instance; it starts `Healthy` with a fresh heartbeat
    pub async fn register(
        &self,
        service: &str,
        address: impl Into<String>,
        port: u16,
        metadata: BTreeMap<String, String>,
    ) -> Result<InstanceId> {
        let address = address.into();
        if service.is_empty() {
            return Err(CoreError::InvalidRequest("service name must not be empty".to_string()));
        }
        if address.is_empty() || port == 0 {
            return Err(CoreError::InvalidRequest(format!(
                "invalid instance address {}:{}",
                address, port
            )));
        }

        let mut entry = loop {
            let entry = self.entry(service).await.write_owned().await;
            // A retired entry was pruned while we waited; look it up again
            if !entry.retired {
                break entry;
            }
        };

        if entry
            .instances
            .values()
            .any(|r| r.address == address && r.port == port)
        {
            return Err(CoreError::DuplicateAddress {
                service: service.to_string(),
                address,
                port,
            });
        }

        let id = InstanceId::from(self.next_id.fetch_add(1, Ordering::SeqCst));
        let record = InstanceRecord::new(
            id,
            service.to_string(),
            address,
            port,
            metadata,
            self.clock.now(),
        );
        info!("Registered instance {} of {} at {}", id, service, record.authority());
        entry.instances.insert(id, record);

        Ok(id)
    }

    /// Record a heartbeat and return the instance's resulting status
    pub async fn heartbeat(&self, service: &str, id: InstanceId) -> Result<InstanceStatus> {
        let unknown = || CoreError::UnknownInstance {
            service: service.to_string(),
            instance_id: id.to_string(),
        };

        let entry = self.existing(service).await.ok_or_else(unknown)?;
        let mut entry = entry.write().await;
        let record = entry.instances.get_mut(&id).ok_or_else(unknown)?;

        let previous = record.status;
        let status = record.heartbeat(self.clock.now());
        if previous != status {
            info!("Instance {} of {} recovered: {} -> {}", id, service, previous, status);
        } else {
            debug!("Heartbeat from instance {} of {} ({})", id, service, status);
        }

        Ok(status)
    }

    /// Remove an instance. Removing an absent instance is a no-op; returns
    /// whether a record was removed.
    pub async fn deregister(&self, service: &str, id: InstanceId) -> bool {
        let Some(entry) = self.existing(service).await else {
            return false;
        };
        let (removed, now_empty) = {
            let mut entry = entry.write().await;
            let removed = entry.instances.remove(&id).is_some();
            (removed, entry.instances.is_empty())
        };
        if removed {
            info!("Deregistered instance {} of {}", id, service);
        }
        if now_empty {
            self.prune(service).await;
        }
        removed
    }

    /// Point-in-time copy of a service's instances ordered by registration time
    pub async fn snapshot(&self, service: &str) -> Vec<InstanceRecord> {
        let Some(entry) = self.existing(service).await else {
            return Vec::new();
        };
        let entry = entry.read().await;
        let mut records: Vec<InstanceRecord> = entry.instances.values().cloned().collect();
        records.sort_by(|a, b| a.registered_at.cmp(&b.registered_at).then(a.id.cmp(&b.id)));
        records
    }

    /// Names of services that currently have at least one instance, sorted
    pub async fn service_names(&self) -> Vec<String> {
        let entries: Vec<(String, Arc<RwLock<ServiceEntry>>)> = self
            .services
            .read()
            .await
            .iter()
            .map(|(name, entry)| (name.clone(), entry.clone()))
            .collect();

        let mut names = Vec::with_capacity(entries.len());
        for (name, entry) in entries {
            if !entry.read().await.instances.is_empty() {
                names.push(name);
            }
        }
        names.sort();
        names
    }

    /// Total number of registered instances across all services
    pub async fn instance_count(&self) -> usize {
        let entries: Vec<Arc<RwLock<ServiceEntry>>> =
            self.services.read().await.values().cloned().collect();
        let mut count = 0;
        for entry in entries {
            count += entry.read().await.instances.len();
        }
        count
    }

    /// Apply a sweep observation against the current record.
    ///
    /// Evaluation happens under the service lock, so a heartbeat that landed
    /// after the sweep's snapshot is taken into account. Expired records are removed.
    pub(crate) async fn observe(
        &self,
        service: &str,
        id: InstanceId,
        probe: ProbeOutcome,
        thresholds: &Thresholds,
    ) -> Option<Observation> {
        let entry = self.existing(service).await?;
        let (observation, now_empty) = {
            let mut entry = entry.write().await;
            let now = self.clock.now();

            let record = entry.instances.get_mut(&id)?;
            let verdict = record.observe(now, probe, thresholds);
            let status = record.status;
            if verdict == Verdict::Expire {
                entry.instances.remove(&id);
            }
            (Observation { verdict, status }, entry.instances.is_empty())
        };
        if now_empty {
            self.prune(service).await;
        }

        Some(observation)
    }

    /// Move an instance to `Draining`
    pub(crate) async fn set_draining(&self, service: &str, id: InstanceId) -> Result<()> {
        let unknown = || CoreError::UnknownInstance {
            service: service.to_string(),
            instance_id: id.to_string(),
        };

        let entry = self.existing(service).await.ok_or_else(unknown)?;
        let mut entry = entry.write().await;
        let record = entry.instances.get_mut(&id).ok_or_else(unknown)?;
        record.status = InstanceStatus::Draining;
        info!("Instance {} of {} is draining", id, service);
        Ok(())
    }
}

impl Default for RegistryStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}
