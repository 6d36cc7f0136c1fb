//! Health monitor: periodic sweep driving the instance liveness state machine

use crate::instance::{InstanceId, InstanceRecord, InstanceStatus, ProbeOutcome, Thresholds, Verdict};
use crate::registry::RegistryStore;
use crate::Result;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Active liveness check against a single instance
#[async_trait]
pub trait Prober: Send + Sync {
    /// Returns `Ok(())` when the instance answered its health check
    async fn probe(&self, instance: &InstanceRecord) -> anyhow::Result<()>;
}

/// Health monitor configuration
#[derive(Clone, Debug)]
pub struct MonitorConfig {
    /// Interval between sweeps
    pub sweep_interval: Duration,
    /// Timeout for a single probe
    pub probe_timeout: Duration,
    /// Maximum number of probes in flight during a sweep
    pub max_concurrent_probes: usize,
    pub thresholds: Thresholds,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(2),
            max_concurrent_probes: 32,
            thresholds: Thresholds::default(),
        }
    }
}

/// Counts of what a single sweep did
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub demoted: usize,
    pub recovered: usize,
    pub expired: usize,
}

/// HealthMonitor re-evaluates every registered instance on a fixed interval
pub struct HealthMonitor {
    store: Arc<RegistryStore>,
    prober: Option<Arc<dyn Prober>>,
    config: MonitorConfig,
    sweeping: AtomicBool,
}

struct SweepGuard<'a>(&'a AtomicBool);

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl HealthMonitor {
    /// Create a monitor that relies on heartbeats only
    pub fn new(store: Arc<RegistryStore>, config: MonitorConfig) -> Self {
        Self {
            store,
            prober: None,
            config,
            sweeping: AtomicBool::new(false),
        }
    }

    /// Also actively probe instances during each sweep
    pub fn with_prober(mut self, prober: Arc<dyn Prober>) -> Self {
        self.prober = Some(prober);
        self
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<RegistryStore> {
        &self.store
    }

    /// Operator signal: stop routing new requests to an instance
    pub async fn drain(&self, service: &str, id: InstanceId) -> Result<()> {
        self.store.set_draining(service, id).await
    }

    /// Run one sweep over every instance.
    ///
    /// Returns `None` without doing anything when another sweep is already
    /// running; overlapping triggers are coalesced.
    pub async fn sweep(&self) -> Option<SweepReport> {
        if self
            .sweeping
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            debug!("Sweep already in progress, skipping");
            return None;
        }
        let _guard = SweepGuard(&self.sweeping);

        let mut targets = Vec::new();
        for service in self.store.service_names().await {
            targets.extend(self.store.snapshot(&service).await);
        }

        // Probes run with no registry lock held
        let observations: Vec<(InstanceRecord, ProbeOutcome)> = stream::iter(targets)
            .map(|record| async move {
                let outcome = self.probe(&record).await;
                (record, outcome)
            })
            .buffer_unordered(self.config.max_concurrent_probes.max(1))
            .collect()
            .await;

        let mut report = SweepReport::default();
        for (record, outcome) in observations {
            report.examined += 1;
            let Some(observation) = self
                .store
                .observe(&record.service, record.id, outcome, &self.config.thresholds)
                .await
            else {
                // Deregistered while the sweep was running
                continue;
            };

            match observation.verdict {
                Verdict::Keep => {}
                Verdict::Recover => {
                    if record.status != InstanceStatus::Healthy {
                        info!(
                            "Instance {} of {} recovered by probe",
                            record.id, record.service
                        );
                        report.recovered += 1;
                    }
                }
                Verdict::Demote(status) => {
                    warn!(
                        "Instance {} of {} at {} is now {}",
                        record.id,
                        record.service,
                        record.authority(),
                        status
                    );
                    report.demoted += 1;
                }
                Verdict::Expire => {
                    info!(
                        "Instance {} of {} at {} expired ({})",
                        record.id,
                        record.service,
                        record.authority(),
                        observation.status
                    );
                    report.expired += 1;
                }
            }
        }

        debug!("Sweep finished: {:?}", report);
        Some(report)
    }

    async fn probe(&self, record: &InstanceRecord) -> ProbeOutcome {
        let Some(prober) = &self.prober else {
            return ProbeOutcome::Skipped;
        };
        if record.status == InstanceStatus::Draining {
            return ProbeOutcome::Skipped;
        }

        match time::timeout(self.config.probe_timeout, prober.probe(record)).await {
            Ok(Ok(())) => ProbeOutcome::Passed,
            Ok(Err(e)) => {
                debug!("Probe of {} ({}) failed: {}", record.authority(), record.service, e);
                ProbeOutcome::Failed
            }
            Err(_) => {
                debug!("Probe of {} ({}) timed out", record.authority(), record.service);
                ProbeOutcome::Failed
            }
        }
    }

    /// Start the periodic sweep task
    pub fn spawn(self: Arc<Self>) -> MonitorHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let interval = self.config.sweep_interval;

        let task = tokio::spawn(async move {
            info!("Health monitor started with interval: {:?}", interval);
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = self.sweep() => {}
                        }
                    }
                }
            }
            info!("Health monitor stopped");
        });

        MonitorHandle { cancel, task }
    }
}

/// Handle to the running sweep task
pub struct MonitorHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Stop the sweep task and wait for it to finish
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!("Health monitor task ended abnormally: {}", e);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    fn config() -> MonitorConfig {
        MonitorConfig {
            sweep_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(100),
            max_concurrent_probes: 4,
            thresholds: Thresholds {
                suspect_after: Duration::from_secs(10),
                unhealthy_after: Duration::from_secs(20),
                expire_after: Duration::from_secs(40),
                unhealthy_after_probe_failures: 3,
            },
        }
    }

    fn setup() -> (Arc<RegistryStore>, Arc<ManualClock>, HealthMonitor) {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(RegistryStore::new(clock.clone()));
        let monitor = HealthMonitor::new(store.clone(), config());
        (store, clock, monitor)
    }

    async fn status_of(store: &RegistryStore, service: &str, id: InstanceId) -> Option<InstanceStatus> {
        store
            .snapshot(service)
            .await
            .into_iter()
            .find(|r| r.id == id)
            .map(|r| r.status)
    }

    /// Prober failing for a fixed set of ports
    struct ScriptedProber {
        failing: Mutex<Vec<u16>>,
    }

    #[async_trait]
    impl Prober for ScriptedProber {
        async fn probe(&self, instance: &InstanceRecord) -> anyhow::Result<()> {
            if self.failing.lock().unwrap().contains(&instance.port) {
                anyhow::bail!("connection refused");
            }
            Ok(())
        }
    }

    struct HangingProber;

    #[async_trait]
    impl Prober for HangingProber {
        async fn probe(&self, _instance: &InstanceRecord) -> anyhow::Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_stalled_instance_progression() {
        let (store, clock, monitor) = setup();
        let id = store.register("orders", "10.0.0.1", 8080, BTreeMap::new()).await.unwrap();

        let mut seen = vec![InstanceStatus::Healthy];
        for _ in 0..60 {
            clock.advance(Duration::from_secs(1));
            monitor.sweep().await.expect("no concurrent sweep");
            match status_of(&store, "orders", id).await {
                Some(status) => {
                    if seen.last() != Some(&status) {
                        seen.push(status);
                    }
                }
                None => break,
            }
        }

        assert_eq!(
            seen,
            vec![InstanceStatus::Healthy, InstanceStatus::Suspect, InstanceStatus::Unhealthy]
        );
        assert!(status_of(&store, "orders", id).await.is_none());
    }

    #[tokio::test]
    async fn test_transition_timing_within_one_sweep() {
        let (store, clock, monitor) = setup();
        let id = store.register("orders", "10.0.0.1", 8080, BTreeMap::new()).await.unwrap();

        clock.advance(Duration::from_secs(9));
        monitor.sweep().await;
        assert_eq!(status_of(&store, "orders", id).await, Some(InstanceStatus::Healthy));

        clock.advance(Duration::from_secs(1));
        monitor.sweep().await;
        assert_eq!(status_of(&store, "orders", id).await, Some(InstanceStatus::Suspect));

        clock.advance(Duration::from_secs(10));
        monitor.sweep().await;
        assert_eq!(status_of(&store, "orders", id).await, Some(InstanceStatus::Unhealthy));

        clock.advance(Duration::from_secs(19));
        monitor.sweep().await;
        assert_eq!(status_of(&store, "orders", id).await, Some(InstanceStatus::Unhealthy));

        clock.advance(Duration::from_secs(1));
        let report = monitor.sweep().await.unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(status_of(&store, "orders", id).await, None);
    }

    #[tokio::test]
    async fn test_heartbeat_recovers_suspect() {
        let (store, clock, monitor) = setup();
        let id = store.register("orders", "10.0.0.1", 8080, BTreeMap::new()).await.unwrap();

        clock.advance(Duration::from_secs(12));
        monitor.sweep().await;
        assert_eq!(status_of(&store, "orders", id).await, Some(InstanceStatus::Suspect));

        store.heartbeat("orders", id).await.unwrap();
        assert_eq!(status_of(&store, "orders", id).await, Some(InstanceStatus::Healthy));

        clock.advance(Duration::from_secs(1));
        monitor.sweep().await;
        assert_eq!(status_of(&store, "orders", id).await, Some(InstanceStatus::Healthy));
    }

    #[tokio::test]
    async fn test_probe_failure_is_not_immediately_fatal() {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(RegistryStore::new(clock.clone()));
        let prober = Arc::new(ScriptedProber {
            failing: Mutex::new(vec![8081]),
        });
        let monitor = HealthMonitor::new(store.clone(), config()).with_prober(prober.clone());

        let good = store.register("orders", "10.0.0.1", 8080, BTreeMap::new()).await.unwrap();
        let flaky = store.register("orders", "10.0.0.2", 8081, BTreeMap::new()).await.unwrap();

        let report = monitor.sweep().await.unwrap();
        assert_eq!(report.examined, 2);
        assert_eq!(report.demoted, 1);
        assert_eq!(status_of(&store, "orders", good).await, Some(InstanceStatus::Healthy));
        assert_eq!(status_of(&store, "orders", flaky).await, Some(InstanceStatus::Suspect));

        // The flake clears before the failure budget is spent
        prober.failing.lock().unwrap().clear();
        let report = monitor.sweep().await.unwrap();
        assert_eq!(report.recovered, 1);
        assert_eq!(status_of(&store, "orders", flaky).await, Some(InstanceStatus::Healthy));
    }

    #[tokio::test]
    async fn test_repeated_probe_failures_demote_to_unhealthy() {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(RegistryStore::new(clock.clone()));
        let prober = Arc::new(ScriptedProber {
            failing: Mutex::new(vec![8080]),
        });
        let monitor = HealthMonitor::new(store.clone(), config()).with_prober(prober);
        let id = store.register("orders", "10.0.0.1", 8080, BTreeMap::new()).await.unwrap();

        monitor.sweep().await;
        assert_eq!(status_of(&store, "orders", id).await, Some(InstanceStatus::Suspect));
        monitor.sweep().await;
        assert_eq!(status_of(&store, "orders", id).await, Some(InstanceStatus::Suspect));
        monitor.sweep().await;
        assert_eq!(status_of(&store, "orders", id).await, Some(InstanceStatus::Unhealthy));
    }

    #[tokio::test]
    async fn test_probe_timeout_counts_as_failure() {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(RegistryStore::new(clock.clone()));
        let monitor = HealthMonitor::new(store.clone(), config()).with_prober(Arc::new(HangingProber));
        let id = store.register("orders", "10.0.0.1", 8080, BTreeMap::new()).await.unwrap();

        let report = monitor.sweep().await.unwrap();
        assert_eq!(report.demoted, 1);
        assert_eq!(status_of(&store, "orders", id).await, Some(InstanceStatus::Suspect));
    }

    #[tokio::test]
    async fn test_drain_is_terminal() {
        let (store, clock, monitor) = setup();
        let id = store.register("orders", "10.0.0.1", 8080, BTreeMap::new()).await.unwrap();
        monitor.drain("orders", id).await.unwrap();

        clock.advance(Duration::from_secs(15));
        monitor.sweep().await;
        assert_eq!(status_of(&store, "orders", id).await, Some(InstanceStatus::Draining));

        store.heartbeat("orders", id).await.unwrap();
        assert_eq!(status_of(&store, "orders", id).await, Some(InstanceStatus::Draining));

        clock.advance(Duration::from_secs(40));
        monitor.sweep().await;
        assert_eq!(status_of(&store, "orders", id).await, None);
    }

    #[tokio::test]
    async fn test_overlapping_sweeps_are_coalesced() {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(RegistryStore::new(clock.clone()));
        let mut cfg = config();
        cfg.probe_timeout = Duration::from_millis(200);
        let monitor = HealthMonitor::new(store.clone(), cfg).with_prober(Arc::new(HangingProber));
        store.register("orders", "10.0.0.1", 8080, BTreeMap::new()).await.unwrap();

        let (first, second) = tokio::join!(monitor.sweep(), async {
            tokio::task::yield_now().await;
            monitor.sweep().await
        });
        assert!(first.is_some());
        assert!(second.is_none());

        // The guard is released once the sweep completes
        assert!(monitor.sweep().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_and_shutdown() {
        let (store, clock, monitor) = setup();
        let id = store.register("orders", "10.0.0.1", 8080, BTreeMap::new()).await.unwrap();
        clock.advance(Duration::from_secs(11));

        let handle = Arc::new(monitor).spawn();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(status_of(&store, "orders", id).await, Some(InstanceStatus::Suspect));

        handle.shutdown().await;
    }
}
