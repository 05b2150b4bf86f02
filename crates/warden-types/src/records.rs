use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::{BrokerId, ClusterName};

/// Opaque attribute bag carried on a worker record. Two sub-fields are
/// reserved by the protocol: `static` and `recoverable`.
/// Everything else is passed through untouched.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerAttributes(pub Map<String, Value>);

impl WorkerAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_static(&self) -> bool {
        self.0.get("static").and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn recoverable(&self) -> bool {
        self.0
            .get("recoverable")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn with_static(mut self, is_static: bool) -> Self {
        self.0.insert("static".to_string(), Value::Bool(is_static));
        self
    }

    pub fn with_recoverable(mut self, recoverable: bool) -> Self {
        self.0
            .insert("recoverable".to_string(), Value::Bool(recoverable));
        self
    }
}

/// `wh[workerId]` — the protocol §3. `broker_id` is absent while the worker is
/// "under migration" (salvaged but not yet re-attached or recovered).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRecord {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub broker_id: Option<BrokerId>,
    #[serde(default)]
    pub attributes: WorkerAttributes,
}

/// `bh[brokerId].st` — the protocol §3.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerStatus {
    Active,
    Invalid,
}

/// `bh[brokerId]` — the protocol §3.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BrokerRecord {
    pub cn: ClusterName,
    pub st: BrokerStatus,
    pub addr: String,
}

impl BrokerRecord {
    pub fn is_active(&self) -> bool {
        self.st == BrokerStatus::Active
    }
}

/// Why a worker is being created, passed to the application's `onCreate`
/// hook.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CreateCause {
    New,
    Recovery,
}

/// Why a worker is being destroyed, passed to the application's `onDestroy`
/// hook.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DestroyCause {
    #[serde(rename = "SELF")]
    SelfDestroy,
    System,
}

/// A worker record fetched out of `rz` during recovery, with its id filled
/// in.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoverableWorker {
    pub id: String,
    pub name: String,
    pub attributes: WorkerAttributes,
    pub created_at_ms: i64,
}
