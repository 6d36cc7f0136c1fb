//! Load balancing policies for distributing traffic across healthy instances

use lru::LruCache;
use mesh_core::{CoreError, InstanceId, InstanceRecord, InstanceStatus, RegistryStore, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Load balancing policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancerPolicy {
    /// Round-robin: visit every eligible instance once before repeating
    #[default]
    RoundRobin,
    /// Least recently used: route to the instance picked longest ago
    LeastRecentlyUsed,
    /// Random: uniform selection among eligible instances
    Random,
}

const DEFAULT_CURSOR_CAPACITY: usize = 1024;
const DEFAULT_USAGE_CAPACITY: usize = 8192;

type CursorKey = (String, String);

/// Load balancer picking one `Healthy` instance from a registry snapshot
pub struct LoadBalancer {
    store: Arc<RegistryStore>,
    policy: BalancerPolicy,
    /// Round-robin cursor per (service, filter signature)
    cursors: Mutex<LruCache<CursorKey, usize>>,
    /// Last-selected sequence number per instance
    usage: Mutex<LruCache<InstanceId, u64>>,
    sequence: AtomicU64,
}

impl LoadBalancer {
    /// Create a new load balancer with the specified policy
    pub fn new(store: Arc<RegistryStore>, policy: BalancerPolicy) -> Self {
        Self::with_capacity(store, policy, DEFAULT_CURSOR_CAPACITY, DEFAULT_USAGE_CAPACITY)
    }

    /// Create a load balancer with explicit bounds on its bookkeeping
    pub fn with_capacity(
        store: Arc<RegistryStore>,
        policy: BalancerPolicy,
        cursors: usize,
        usage: usize,
    ) -> Self {
        let cursors = NonZeroUsize::new(cursors).unwrap_or(NonZeroUsize::MIN);
        let usage = NonZeroUsize::new(usage).unwrap_or(NonZeroUsize::MIN);
        Self {
            store,
            policy,
            cursors: Mutex::new(LruCache::new(cursors)),
            usage: Mutex::new(LruCache::new(usage)),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> BalancerPolicy {
        self.policy
    }

    /// Pick a healthy instance of `service` whose metadata matches `filter`
    pub async fn pick(&self, service: &str, filter: &BTreeMap<String, String>) -> Result<InstanceRecord> {
        self.pick_excluding(service, filter, &HashSet::new()).await
    }

    /// Like [`pick`](Self::pick), skipping the instances in `exclude`
    pub async fn pick_excluding(
        &self,
        service: &str,
        filter: &BTreeMap<String, String>,
        exclude: &HashSet<InstanceId>,
    ) -> Result<InstanceRecord> {
        let mut eligible: Vec<InstanceRecord> = self
            .store
            .snapshot(service)
            .await
            .into_iter()
            .filter(|r| r.status == InstanceStatus::Healthy)
            .filter(|r| r.matches(filter))
            .filter(|r| !exclude.contains(&r.id))
            .collect();

        if eligible.is_empty() {
            debug!("No eligible instance for {} (filter: {:?})", service, filter);
            return Err(CoreError::NoHealthyInstance(service.to_string()));
        }

        eligible.sort_by_key(|r| r.id);

        let index = match self.policy {
            BalancerPolicy::RoundRobin => self.select_round_robin(service, filter, eligible.len()),
            BalancerPolicy::LeastRecentlyUsed => self.select_least_recently_used(&eligible),
            BalancerPolicy::Random => rand::thread_rng().gen_range(0..eligible.len()),
        };

        let chosen = eligible.swap_remove(index);
        debug!("Selected instance {} of {} at {}", chosen.id, service, chosen.authority());
        Ok(chosen)
    }

    /// Advance the cursor for this service and filter; wraps when the
    /// eligible set shrank since the last call
    fn select_round_robin(&self, service: &str, filter: &BTreeMap<String, String>, len: usize) -> usize {
        let key = (service.to_string(), filter_signature(filter));
        let mut cursors = self.cursors.lock().unwrap_or_else(|e| e.into_inner());
        let index = cursors.get(&key).copied().unwrap_or(0) % len;
        cursors.put(key, (index + 1) % len);
        index
    }

    /// Minimum last-selected mark; never-selected instances come first, ties by id
    fn select_least_recently_used(&self, eligible: &[InstanceRecord]) -> usize {
        let mut usage = self.usage.lock().unwrap_or_else(|e| e.into_inner());
        let index = eligible
            .iter()
            .enumerate()
            .min_by_key(|(_, r)| (usage.peek(&r.id).copied().unwrap_or(0), r.id))
            .map(|(i, _)| i)
            .unwrap_or(0);
        let mark = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        usage.put(eligible[index].id, mark);
        index
    }
}

/// Stable string form of a tag filter
fn filter_signature(filter: &BTreeMap<String, String>) -> String {
    filter
        .iter()
        .map(|(k, v)| format!("{}={}", k.escape_default(), v.escape_default()))
        .collect::<Vec<_>>()
        .join("&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_core::{HealthMonitor, ManualClock, MonitorConfig, Thresholds};
    use std::collections::HashMap;
    use std::time::Duration;

    fn tags(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    async fn store_with(n: u16) -> (Arc<RegistryStore>, Vec<InstanceId>) {
        let store = Arc::new(RegistryStore::new(Arc::new(ManualClock::default())));
        let mut ids = Vec::new();
        for i in 0..n {
            ids.push(
                store
                    .register("orders", format!("10.0.0.{}", i + 1), 8080, BTreeMap::new())
                    .await
                    .unwrap(),
            );
        }
        (store, ids)
    }

    #[tokio::test]
    async fn test_round_robin_visits_each_once() {
        let (store, ids) = store_with(4).await;
        let lb = LoadBalancer::new(store, BalancerPolicy::RoundRobin);

        let mut picked = Vec::new();
        for _ in 0..4 {
            picked.push(lb.pick("orders", &BTreeMap::new()).await.unwrap().id);
        }
        assert_eq!(picked, ids);

        // Then the cycle repeats
        assert_eq!(lb.pick("orders", &BTreeMap::new()).await.unwrap().id, ids[0]);
    }

    #[tokio::test]
    async fn test_round_robin_wraps_when_set_shrinks() {
        let (store, ids) = store_with(3).await;
        let lb = LoadBalancer::new(store.clone(), BalancerPolicy::RoundRobin);

        lb.pick("orders", &BTreeMap::new()).await.unwrap();
        lb.pick("orders", &BTreeMap::new()).await.unwrap();
        store.deregister("orders", ids[2]).await;
        store.deregister("orders", ids[1]).await;

        for _ in 0..3 {
            assert_eq!(lb.pick("orders", &BTreeMap::new()).await.unwrap().id, ids[0]);
        }
    }

    #[tokio::test]
    async fn test_round_robin_cursor_per_filter() {
        let store = Arc::new(RegistryStore::new(Arc::new(ManualClock::default())));
        let a = store.register("orders", "10.0.0.1", 80, tags(&[("zone", "a")])).await.unwrap();
        let b = store.register("orders", "10.0.0.2", 80, tags(&[("zone", "b")])).await.unwrap();
        let lb = LoadBalancer::new(store, BalancerPolicy::RoundRobin);

        assert_eq!(lb.pick("orders", &BTreeMap::new()).await.unwrap().id, a);
        assert_eq!(lb.pick("orders", &tags(&[("zone", "b")])).await.unwrap().id, b);
        assert_eq!(lb.pick("orders", &BTreeMap::new()).await.unwrap().id, b);
    }

    #[tokio::test]
    async fn test_least_recently_used() {
        let (store, ids) = store_with(3).await;
        let lb = LoadBalancer::new(store.clone(), BalancerPolicy::LeastRecentlyUsed);

        // Never-used instances are picked first, by id
        assert_eq!(lb.pick("orders", &BTreeMap::new()).await.unwrap().id, ids[0]);
        assert_eq!(lb.pick("orders", &BTreeMap::new()).await.unwrap().id, ids[1]);
        assert_eq!(lb.pick("orders", &BTreeMap::new()).await.unwrap().id, ids[2]);
        assert_eq!(lb.pick("orders", &BTreeMap::new()).await.unwrap().id, ids[0]);

        // A newcomer has never been used so it goes next
        let fresh = store.register("orders", "10.0.0.99", 8080, BTreeMap::new()).await.unwrap();
        assert_eq!(lb.pick("orders", &BTreeMap::new()).await.unwrap().id, fresh);
        assert_eq!(lb.pick("orders", &BTreeMap::new()).await.unwrap().id, ids[1]);
    }

    #[tokio::test]
    async fn test_random_stays_within_eligible_set() {
        let (store, ids) = store_with(3).await;
        let lb = LoadBalancer::new(store, BalancerPolicy::Random);

        let mut counts: HashMap<InstanceId, usize> = HashMap::new();
        for _ in 0..300 {
            let id = lb.pick("orders", &BTreeMap::new()).await.unwrap().id;
            *counts.entry(id).or_default() += 1;
        }
        assert!(counts.keys().all(|id| ids.contains(id)));
        assert_eq!(counts.len(), 3);
    }

    #[tokio::test]
    async fn test_empty_set_is_no_healthy_instance() {
        let store = Arc::new(RegistryStore::default());
        for policy in [
            BalancerPolicy::RoundRobin,
            BalancerPolicy::LeastRecentlyUsed,
            BalancerPolicy::Random,
        ] {
            let lb = LoadBalancer::new(store.clone(), policy);
            let err = lb.pick("missing", &BTreeMap::new()).await.unwrap_err();
            assert_eq!(err, CoreError::NoHealthyInstance("missing".to_string()));
        }
    }

    #[tokio::test]
    async fn test_filter_eliminating_everything() {
        let store = Arc::new(RegistryStore::default());
        store.register("orders", "10.0.0.1", 80, tags(&[("version", "1")])).await.unwrap();
        let lb = LoadBalancer::new(store, BalancerPolicy::RoundRobin);

        let err = lb.pick("orders", &tags(&[("version", "2")])).await.unwrap_err();
        assert!(matches!(err, CoreError::NoHealthyInstance(_)));
        assert!(lb.pick("orders", &tags(&[("version", "1")])).await.is_ok());
    }

    #[tokio::test]
    async fn test_exclusion() {
        let (store, ids) = store_with(2).await;
        let lb = LoadBalancer::new(store, BalancerPolicy::RoundRobin);

        let exclude = HashSet::from([ids[0]]);
        for _ in 0..3 {
            let picked = lb.pick_excluding("orders", &BTreeMap::new(), &exclude).await.unwrap();
            assert_eq!(picked.id, ids[1]);
        }
        let all = HashSet::from([ids[0], ids[1]]);
        assert!(lb.pick_excluding("orders", &BTreeMap::new(), &all).await.is_err());
    }

    #[tokio::test]
    async fn test_only_healthy_instances_are_picked() {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(RegistryStore::new(clock.clone()));
        let monitor = HealthMonitor::new(
            store.clone(),
            MonitorConfig {
                thresholds: Thresholds {
                    suspect_after: Duration::from_secs(10),
                    unhealthy_after: Duration::from_secs(20),
                    expire_after: Duration::from_secs(30),
                    unhealthy_after_probe_failures: 3,
                },
                ..MonitorConfig::default()
            },
        );

        let a = store.register("orders", "10.0.0.1", 80, BTreeMap::new()).await.unwrap();
        let b = store.register("orders", "10.0.0.2", 80, BTreeMap::new()).await.unwrap();
        let c = store.register("orders", "10.0.0.3", 80, BTreeMap::new()).await.unwrap();
        monitor.drain("orders", c).await.unwrap();

        // b stops heartbeating and becomes suspect
        clock.advance(Duration::from_secs(11));
        store.heartbeat("orders", a).await.unwrap();
        monitor.sweep().await;

        let lb = LoadBalancer::new(store, BalancerPolicy::RoundRobin);
        for _ in 0..10 {
            let picked = lb.pick("orders", &BTreeMap::new()).await.unwrap();
            assert_eq!(picked.status, InstanceStatus::Healthy);
            assert_eq!(picked.id, a);
            assert_ne!(picked.id, b);
        }
    }

    #[tokio::test]
    async fn test_silent_instance_is_skipped_then_expires() {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(RegistryStore::new(clock.clone()));
        let monitor = HealthMonitor::new(
            store.clone(),
            MonitorConfig {
                thresholds: Thresholds {
                    suspect_after: Duration::from_secs(10),
                    unhealthy_after: Duration::from_secs(20),
                    expire_after: Duration::from_secs(30),
                    unhealthy_after_probe_failures: 3,
                },
                ..MonitorConfig::default()
            },
        );
        let lb = LoadBalancer::new(store.clone(), BalancerPolicy::RoundRobin);

        let a = store.register("orders", "10.0.0.1", 80, BTreeMap::new()).await.unwrap();
        let b = store.register("orders", "10.0.0.2", 80, BTreeMap::new()).await.unwrap();
        let c = store.register("orders", "10.0.0.3", 80, BTreeMap::new()).await.unwrap();

        // a and c heartbeat every second, b stays silent
        let mut saw_suspect = false;
        for _ in 0..45 {
            clock.advance(Duration::from_secs(1));
            store.heartbeat("orders", a).await.unwrap();
            store.heartbeat("orders", c).await.unwrap();
            monitor.sweep().await;

            let b_status = store
                .snapshot("orders")
                .await
                .iter()
                .find(|r| r.id == b)
                .map(|r| r.status);
            saw_suspect |= b_status == Some(InstanceStatus::Suspect);

            for _ in 0..3 {
                let picked = lb.pick("orders", &BTreeMap::new()).await.unwrap();
                if b_status != Some(InstanceStatus::Healthy) {
                    assert_ne!(picked.id, b);
                }
            }
        }

        assert!(saw_suspect);
        let remaining: Vec<InstanceId> = store.snapshot("orders").await.iter().map(|r| r.id).collect();
        assert_eq!(remaining, vec![a, c]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_round_robin_stays_eligible() {
        let (store, ids) = store_with(5).await;
        let lb = Arc::new(LoadBalancer::new(store, BalancerPolicy::RoundRobin));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let lb = lb.clone();
            handles.push(tokio::spawn(async move {
                let mut picked = Vec::new();
                for _ in 0..50 {
                    picked.push(lb.pick("orders", &BTreeMap::new()).await.unwrap().id);
                }
                picked
            }));
        }
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(ids.contains(&id));
            }
        }
    }

    #[test]
    fn test_filter_signature_is_stable() {
        assert_eq!(filter_signature(&BTreeMap::new()), "");
        assert_eq!(
            filter_signature(&tags(&[("zone", "a"), ("version", "2")])),
            "version=2&zone=a"
        );
    }
}
