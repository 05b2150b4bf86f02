//! Typed wrappers over the eight registry scripts (§4.3): builds the exact
//! key/arg lists each script expects and translates its `[code, ...]`
//! reply into a Rust result, so the rest of the broker never touches a
//! `RegistryValue` directly.

use warden_registry::{KeyNames, RegistryClient, RegistryValue, ScriptId};
use warden_types::{
    BrokerId, BrokerStatus, ClusterName, RecoverableWorker, Result, WardenError, WorkerAttributes, WorkerId,
};

fn malformed(script: &str) -> WardenError {
    WardenError::RegistryFault(format!("malformed reply from {script} script"))
}

pub async fn join<R: RegistryClient + ?Sized>(
    registry: &R,
    keys: &KeyNames,
    broker_id: &BrokerId,
    ch_prefix: &str,
    load: f64,
    cluster: &ClusterName,
    addr: &str,
    hash_key: u64,
) -> Result<()> {
    let key_list = vec![
        keys.gh(),
        keys.bh(),
        keys.cz(cluster.as_str()),
        keys.bz(cluster.as_str()),
        keys.wz(broker_id.as_str()),
        keys.wh(),
        keys.rz(),
    ];
    let args = vec![
        broker_id.as_str().to_string(),
        ch_prefix.to_string(),
        load.to_string(),
        cluster.as_str().to_string(),
        addr.to_string(),
        hash_key.to_string(),
    ];
    let reply = registry.eval(ScriptId::Join, &key_list, &args).await?;
    match reply.code() {
        Some(0) => Ok(()),
        _ => Err(malformed("join")),
    }
}

pub enum PickBrokerOutcome {
    Picked { broker_id: BrokerId, cluster: ClusterName, addr: String },
    Retry,
}

pub async fn pick_broker<R: RegistryClient + ?Sized>(
    registry: &R,
    keys: &KeyNames,
    cluster: &ClusterName,
    max_retries: u32,
) -> Result<PickBrokerOutcome> {
    let key_list = vec![keys.gh(), keys.cz(cluster.as_str()), keys.bh()];
    let args = vec![cluster.as_str().to_string(), max_retries.to_string()];
    let reply = registry.eval(ScriptId::PickBroker, &key_list, &args).await?;
    match reply.code() {
        Some(0) => {
            let broker_id = reply.at(1).and_then(RegistryValue::as_bulk).ok_or_else(|| malformed("pickBroker"))?;
            let cn = reply.at(2).and_then(RegistryValue::as_bulk).ok_or_else(|| malformed("pickBroker"))?;
            let addr = reply.at(3).and_then(RegistryValue::as_bulk).ok_or_else(|| malformed("pickBroker"))?;
            Ok(PickBrokerOutcome::Picked {
                broker_id: BrokerId::new(broker_id),
                cluster: ClusterName::new(cn),
                addr: addr.to_string(),
            })
        }
        Some(1) => Ok(PickBrokerOutcome::Retry),
        _ => Err(malformed("pickBroker")),
    }
}

pub enum FindOrCreateOutcome {
    Found { broker_id: BrokerId, name: String, worker_id: WorkerId },
    NotFound,
    Retry,
}

#[allow(clippy::too_many_arguments)]
pub async fn find_or_create<R: RegistryClient + ?Sized>(
    registry: &R,
    keys: &KeyNames,
    owner_broker_id: Option<&BrokerId>,
    name: &str,
    worker_id: Option<&WorkerId>,
    attributes: &WorkerAttributes,
    now_ms: i64,
    ttl_ms: i64,
    for_recovery: bool,
) -> Result<FindOrCreateOutcome> {
    // `wz` is namespaced under the creating broker when in create mode, and
    // is otherwise irrelevant to a find-only call (the script only reads
    // it on the create path) — pass the caller's own `wz` either way.
    let wz_owner = owner_broker_id.map(BrokerId::as_str).unwrap_or("");
    let key_list = vec![keys.gh(), keys.wh(), keys.bh(), keys.wz(wz_owner), keys.rz()];
    let args = vec![
        owner_broker_id.map(BrokerId::as_str).unwrap_or("").to_string(),
        name.to_string(),
        worker_id.map(WorkerId::as_str).unwrap_or("").to_string(),
        serde_json::to_string(attributes).map_err(|e| WardenError::RegistryFault(e.to_string()))?,
        now_ms.to_string(),
        ttl_ms.to_string(),
        if for_recovery { "1" } else { "0" }.to_string(),
    ];
    let reply = registry.eval(ScriptId::FindOrCreate, &key_list, &args).await?;
    match reply.code() {
        Some(0) => match reply.at(1) {
            Some(RegistryValue::Array(triple)) if triple.len() == 3 => {
                let broker_id = triple[0].as_bulk().ok_or_else(|| malformed("findOrCreate"))?;
                let name = triple[1].as_bulk().ok_or_else(|| malformed("findOrCreate"))?;
                let worker_id = triple[2].as_bulk().ok_or_else(|| malformed("findOrCreate"))?;
                Ok(FindOrCreateOutcome::Found {
                    broker_id: BrokerId::new(broker_id),
                    name: name.to_string(),
                    worker_id: WorkerId::new(worker_id),
                })
            }
            _ => Ok(FindOrCreateOutcome::NotFound),
        },
        Some(1) => Ok(FindOrCreateOutcome::Retry),
        _ => Err(malformed("findOrCreate")),
    }
}

pub enum FindBrokerOutcome {
    Found {
        broker_id: BrokerId,
        cluster: ClusterName,
        status: BrokerStatus,
        addr: String,
    },
    NotFound,
    Invalidated {
        broker_id: BrokerId,
    },
}

pub async fn find_broker<R: RegistryClient + ?Sized>(
    registry: &R,
    keys: &KeyNames,
    self_broker_id: &BrokerId,
    worker_id: &WorkerId,
) -> Result<FindBrokerOutcome> {
    let key_list = vec![keys.gh(), keys.wh(), keys.bh()];
    let args = vec![self_broker_id.as_str().to_string(), worker_id.as_str().to_string()];
    let reply = registry.eval(ScriptId::FindBroker, &key_list, &args).await?;
    match reply.code() {
        Some(0) => {
            let quad = reply.at(1).and_then(RegistryValue::as_array).ok_or_else(|| malformed("findBroker"))?;
            let broker_id = quad.first().and_then(RegistryValue::as_bulk).ok_or_else(|| malformed("findBroker"))?;
            let cn = quad.get(1).and_then(RegistryValue::as_bulk).ok_or_else(|| malformed("findBroker"))?;
            let st = quad.get(2).and_then(RegistryValue::as_bulk).ok_or_else(|| malformed("findBroker"))?;
            let addr = quad.get(3).and_then(RegistryValue::as_bulk).ok_or_else(|| malformed("findBroker"))?;
            let status = if st == "active" { BrokerStatus::Active } else { BrokerStatus::Invalid };
            Ok(FindBrokerOutcome::Found {
                broker_id: BrokerId::new(broker_id),
                cluster: ClusterName::new(cn),
                status,
                addr: addr.to_string(),
            })
        }
        Some(1) => Ok(FindBrokerOutcome::NotFound),
        Some(2) => {
            let broker_id = reply.at(1).and_then(RegistryValue::as_bulk).ok_or_else(|| malformed("findBroker"))?;
            Ok(FindBrokerOutcome::Invalidated { broker_id: BrokerId::new(broker_id) })
        }
        _ => Err(malformed("findBroker")),
    }
}

pub enum HealthCheckOutcome {
    Ok,
    SalvageIssued,
    Warning(String),
}

pub async fn health_check<R: RegistryClient + ?Sized>(
    registry: &R,
    keys: &KeyNames,
    self_broker_id: &BrokerId,
    cluster: &ClusterName,
) -> Result<HealthCheckOutcome> {
    let key_list = vec![keys.gh(), keys.bh(), keys.cz(cluster.as_str()), keys.bz(cluster.as_str())];
    let args = vec![self_broker_id.as_str().to_string()];
    let reply = registry.eval(ScriptId::HealthCheck, &key_list, &args).await?;
    match reply.code() {
        Some(0) => Ok(HealthCheckOutcome::Ok),
        Some(1) => Ok(HealthCheckOutcome::SalvageIssued),
        Some(2) => {
            let msg = reply.at(1).and_then(RegistryValue::as_bulk).unwrap_or("unknown").to_string();
            Ok(HealthCheckOutcome::Warning(msg))
        }
        _ => Err(malformed("healthCheck")),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SalvageMode {
    PeerSalvage = 0,
    SelfDestroySalvage = 1,
    SelfDestroyDiscard = 2,
}

pub async fn salvage<R: RegistryClient + ?Sized>(
    registry: &R,
    keys: &KeyNames,
    cluster: &ClusterName,
    target: &BrokerId,
    mode: SalvageMode,
) -> Result<()> {
    let key_list = vec![
        keys.gh(),
        keys.wh(),
        keys.bh(),
        keys.cz(cluster.as_str()),
        keys.bz(cluster.as_str()),
        keys.wz(target.as_str()),
        keys.rz(),
    ];
    let args = vec![target.as_str().to_string(), (mode as u8).to_string()];
    let reply = registry.eval(ScriptId::Salvage, &key_list, &args).await?;
    match reply.code() {
        Some(0) => Ok(()),
        _ => Err(malformed("salvage")),
    }
}

pub struct FetchForRecoveryOutcome {
    pub records: Vec<RecoverableWorker>,
    pub remaining: i64,
}

pub async fn fetch_for_recovery<R: RegistryClient + ?Sized>(
    registry: &R,
    keys: &KeyNames,
    now_ms: i64,
    ttl_ms: i64,
    max_fetch: usize,
) -> Result<FetchForRecoveryOutcome> {
    let key_list = vec![keys.wh(), keys.rz()];
    let args = vec![now_ms.to_string(), ttl_ms.to_string(), max_fetch.to_string()];
    let reply = registry.eval(ScriptId::FetchForRecovery, &key_list, &args).await?;
    let array = reply.as_array().ok_or_else(|| malformed("fetchForRecovery"))?;
    let raw_records = array.first().and_then(RegistryValue::as_array).ok_or_else(|| malformed("fetchForRecovery"))?;
    let remaining = array.get(1).and_then(RegistryValue::as_int).ok_or_else(|| malformed("fetchForRecovery"))?;
    let mut records = Vec::with_capacity(raw_records.len());
    for raw in raw_records {
        let text = raw.as_bulk().ok_or_else(|| malformed("fetchForRecovery"))?;
        let record: RecoverableWorker =
            serde_json::from_str(text).map_err(|_| WardenError::RegistryFault("corrupt recovery record".to_string()))?;
        records.push(record);
    }
    Ok(FetchForRecoveryOutcome { records, remaining })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DestroyMode {
    Drop = 0,
    SalvageIfRecoverable = 1,
}

pub async fn destroy_worker<R: RegistryClient + ?Sized>(
    registry: &R,
    keys: &KeyNames,
    self_broker_id: &BrokerId,
    worker_id: &WorkerId,
    mode: DestroyMode,
) -> Result<()> {
    let key_list = vec![keys.wh(), keys.wz(self_broker_id.as_str()), keys.rz(), keys.gh()];
    let args = vec![worker_id.as_str().to_string(), (mode as u8).to_string()];
    let reply = registry.eval(ScriptId::DestroyWorker, &key_list, &args).await?;
    match reply.code() {
        Some(0) => Ok(()),
        _ => Err(malformed("destroyWorker")),
    }
}
