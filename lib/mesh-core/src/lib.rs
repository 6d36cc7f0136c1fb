//! Core service registry functionality
//!
//! This library provides:
//! - Registry store holding every service's instance records
//! - Instance liveness state machine
//! - Health monitor sweeping the registry on a fixed interval
//! - Clock abstraction shared by all of the above

pub mod clock;
pub mod error;
pub mod instance;
pub mod monitor;
pub mod registry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CoreError, Result};
pub use instance::{InstanceId, InstanceRecord, InstanceStatus, ProbeOutcome, Thresholds, Verdict};
pub use monitor::{HealthMonitor, MonitorConfig, MonitorHandle, Prober, SweepReport};
pub use registry::{Observation, RegistryStore};
