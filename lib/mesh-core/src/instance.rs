//! Instance records and their liveness state machine

use crate::clock::elapsed_since;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Registry-assigned instance identifier, never reused within a process
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(u64);

impl InstanceId {
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl From<u64> for InstanceId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for InstanceId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>().map(Self)
    }
}

/// Liveness status of an instance
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Healthy,
    Suspect,
    Unhealthy,
    /// Operator-requested; never selected for new requests
    Draining,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Healthy => "healthy",
            InstanceStatus::Suspect => "suspect",
            InstanceStatus::Unhealthy => "unhealthy",
            InstanceStatus::Draining => "draining",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One running endpoint of a service
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: InstanceId,
    pub service: String,
    pub address: String,
    pub port: u16,
    pub metadata: BTreeMap<String, String>,
    pub status: InstanceStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    /// Consecutive failed active probes since the last heartbeat or passing probe
    pub probe_failures: u32,
}

/// Thresholds driving the liveness state machine.
///
/// Durations are measured from the last accepted heartbeat.
#[derive(Clone, Debug, PartialEq)]
pub struct Thresholds {
    pub suspect_after: Duration,
    pub unhealthy_after: Duration,
    pub expire_after: Duration,
    pub unhealthy_after_probe_failures: u32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            suspect_after: Duration::from_secs(15),
            unhealthy_after: Duration::from_secs(30),
            expire_after: Duration::from_secs(90),
            unhealthy_after_probe_failures: 3,
        }
    }
}

/// Result of an active probe during a sweep
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// No prober configured
    Skipped,
    Passed,
    Failed,
}

/// Decision taken for one instance during a sweep
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Keep,
    Recover,
    Demote(InstanceStatus),
    Expire,
}

impl InstanceRecord {
    pub(crate) fn new(
        id: InstanceId,
        service: String,
        address: String,
        port: u16,
        metadata: BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            service,
            address,
            port,
            metadata,
            status: InstanceStatus::Healthy,
            last_heartbeat: now,
            registered_at: now,
            probe_failures: 0,
        }
    }

    /// `address:port` of the instance
    pub fn authority(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// True when every filter tag is present in the metadata with the same value
    pub fn matches(&self, filter: &BTreeMap<String, String>) -> bool {
        filter
            .iter()
            .all(|(k, v)| self.metadata.get(k).map(|m| m == v).unwrap_or(false))
    }

    /// Decide the next step for this instance without mutating it.
    ///
    /// Each call moves at most one state down, so a stalled instance visits
    /// `Suspect` and `Unhealthy` before it expires.
    pub fn evaluate(&self, now: DateTime<Utc>, probe: ProbeOutcome, thresholds: &Thresholds) -> Verdict {
        let elapsed = elapsed_since(self.last_heartbeat, now);

        match self.status {
            InstanceStatus::Draining | InstanceStatus::Unhealthy => {
                if elapsed >= thresholds.expire_after {
                    Verdict::Expire
                } else {
                    Verdict::Keep
                }
            }
            InstanceStatus::Healthy | InstanceStatus::Suspect if probe == ProbeOutcome::Passed => {
                Verdict::Recover
            }
            InstanceStatus::Healthy => {
                if elapsed >= thresholds.suspect_after || probe == ProbeOutcome::Failed {
                    Verdict::Demote(InstanceStatus::Suspect)
                } else {
                    Verdict::Keep
                }
            }
            InstanceStatus::Suspect => {
                let failures = match probe {
                    ProbeOutcome::Failed => self.probe_failures + 1,
                    _ => self.probe_failures,
                };
                if elapsed >= thresholds.unhealthy_after
                    || failures >= thresholds.unhealthy_after_probe_failures
                {
                    Verdict::Demote(InstanceStatus::Unhealthy)
                } else {
                    Verdict::Keep
                }
            }
        }
    }

    /// Apply a sweep observation and return the verdict that was taken
    pub(crate) fn observe(
        &mut self,
        now: DateTime<Utc>,
        probe: ProbeOutcome,
        thresholds: &Thresholds,
    ) -> Verdict {
        let verdict = self.evaluate(now, probe, thresholds);

        match probe {
            ProbeOutcome::Failed => self.probe_failures = self.probe_failures.saturating_add(1),
            ProbeOutcome::Passed => self.probe_failures = 0,
            ProbeOutcome::Skipped => {}
        }

        match verdict {
            Verdict::Recover => {
                self.status = InstanceStatus::Healthy;
                self.last_heartbeat = now;
            }
            Verdict::Demote(status) => self.status = status,
            Verdict::Keep | Verdict::Expire => {}
        }

        verdict
    }

    /// Record a heartbeat. `Unhealthy` and `Draining` instances keep their status,
    /// and an `Unhealthy` instance does not refresh its timestamp so it still expires.
    pub(crate) fn heartbeat(&mut self, now: DateTime<Utc>) -> InstanceStatus {
        match self.status {
            InstanceStatus::Healthy | InstanceStatus::Suspect => {
                self.status = InstanceStatus::Healthy;
                self.last_heartbeat = now;
                self.probe_failures = 0;
            }
            InstanceStatus::Draining => self.last_heartbeat = now,
            InstanceStatus::Unhealthy => {}
        }
        self.status
    }
}
