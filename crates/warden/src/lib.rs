//! The facade crate (§0 "Crate layout"): wires a [`Broker`] together from a
//! [`Config`], a live registry connection, and a [`Router`] in one call, and
//! re-exports the rest of the workspace so a caller embedding the runtime
//! only needs this one dependency.

use std::sync::Arc;

use prometheus::Registry;
use tracing::info;

pub use warden_broker::{Broker, BrokerDestroyOption, ClassRegistration, ClassRegistry, Metrics, RpcTable, WorkerFactory};
pub use warden_broker::{BrokerState, SharedBrokerState};
pub use warden_common::{broker_hash_key, AddressCache, Backoff, CyclicCounter};
pub use warden_config::{BrokerCacheConfig, Config, RedisConfig, RetryConfig};
pub use warden_registry::{FakeRegistry, KeyNames, PubsubMessage, RedisRegistryClient, RegistryClient};
pub use warden_transport::{FrameCodec, FrameError, LogLevel, Router, RouterEvent};
pub use warden_types::{
    BrokerId, BrokerRecord, BrokerStatus, ClusterName, CreateCause, CreateWorkerRequest, DestroyCause,
    Envelope, GlobalCounters, RecoverableWorker, RemoteError, Result, ResponsePayload, Signal,
    WardenError, WorkerAttributes, WorkerId, WorkerRecord,
};
pub use warden_worker::{Agent, AgentRouter, CreateInfo, DestroyInfo, Worker, WorkerHandler, WorkerState};

/// Brings up a broker backed by a live Redis registry and a peer listener
/// bound to `bind_host`: opens the registry connection, opens the router,
/// joins `config.clustername`, and starts the background loops — the same
/// sequence an embedder would otherwise hand-assemble from the sub-crates.
///
/// Returns before any worker classes are registered; callers add those with
/// [`Broker::register_class`] before handing the broker any `create` calls
/// of their own, or rely on peers routing existing workers to it once its
/// classes are in place.
pub async fn connect(
    id: BrokerId,
    config: Config,
    bind_host: &str,
    advertise_host: Option<&str>,
) -> Result<Arc<Broker<RedisRegistryClient>>> {
    let url = format!("redis://{}:{}", config.redis.host, config.redis.port);
    info!(broker = %id, %url, "connecting to registry");
    let registry = Arc::new(RedisRegistryClient::connect(&url).await?);
    let (router, events) = Router::new(config.soc_timeout, config.server_soc_timeout());
    let metrics = Metrics::new(&Registry::new());
    let cluster = ClusterName::new(config.clustername.clone());
    let broker = Broker::new(id, config, registry, router, events, metrics);
    broker.start(bind_host, advertise_host, cluster).await?;
    Ok(broker)
}
