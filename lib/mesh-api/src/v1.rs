use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Body of `POST /v1/services/{service}/instances`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegisterInstanceRequest {
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Returned after a successful registration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterInstanceResponse {
    pub service: String,
    pub instance_id: u64,
}

/// Returned by the heartbeat endpoint
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub status: String,
}

/// Read-only view of an instance record
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceView {
    pub id: u64,
    pub address: String,
    pub port: u16,
    pub metadata: BTreeMap<String, String>,
    pub status: String,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

/// Entry of `GET /v1/services`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceSummary {
    pub name: String,
    pub instances: usize,
}

/// Error payload returned by every failing admin call
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}
