use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use warden_common::{broker_hash_key, AddressCache, Backoff, CyclicCounter};
use warden_config::Config;
use warden_registry::{KeyNames, PubsubMessage, RegistryClient};
use warden_transport::{LogLevel, Router, RouterEvent};
use warden_types::{
    BrokerId, BrokerRecord, ClusterName, CreateCause, CreateWorkerRequest, DestroyCause, Envelope, RecoverableWorker,
    RemoteError, Result, ResponsePayload, Signal, WardenError, WorkerAttributes, WorkerId,
};
use warden_worker::{Agent, AgentRouter, CreateInfo, DestroyInfo, Worker};

use crate::classes::{ClassRegistry, WorkerFactory};
use crate::clock::ClockSync;
use crate::metrics::Metrics;
use crate::registry_ops::{self, DestroyMode, FindBrokerOutcome, FindOrCreateOutcome, HealthCheckOutcome, PickBrokerOutcome, SalvageMode};
use crate::rpc::RpcTable;
use crate::state::{BrokerState, SharedBrokerState};

/// Which `salvage` mode a voluntary broker teardown runs (§4.4.10): the
/// caller's choice between "salvage recoverable workers into `rz`" and
/// "discard everything", mapped onto `SalvageMode`'s self-destroy variants.
/// `SalvageMode::PeerSalvage` is never reachable through this option —
/// that mode is only ever used against a *different* broker's id, from the
/// `salvage` pubsub signal handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BrokerDestroyOption {
    SalvageRecoverable,
    Discard,
}

impl BrokerDestroyOption {
    fn salvage_mode(self) -> SalvageMode {
        match self {
            BrokerDestroyOption::SalvageRecoverable => SalvageMode::SelfDestroySalvage,
            BrokerDestroyOption::Discard => SalvageMode::SelfDestroyDiscard,
        }
    }
}

/// A running broker process (§4.4): owns a table of local `Worker`
/// instances, advertises itself and routes peer traffic through a
/// [`Router`], and coordinates placement and failure detection through a
/// [`RegistryClient`]. Generic over the registry implementation so the
/// same code drives both the Redis-backed client and the in-memory test
/// double.
pub struct Broker<R: RegistryClient + 'static> {
    id: BrokerId,
    config: Config,
    registry: Arc<R>,
    router: AsyncMutex<Arc<Router>>,
    router_events: AsyncMutex<Option<mpsc::UnboundedReceiver<RouterEvent>>>,
    keys: KeyNames,
    state: SharedBrokerState,
    cluster: AsyncMutex<Option<ClusterName>>,
    own_addr: AsyncMutex<Option<String>>,
    /// The `(bind_host, advertise_host)` this broker last started with, kept
    /// around so the `restart` signal (§4.4.8) can bring it back up the same
    /// way after a full teardown.
    start_params: AsyncMutex<Option<(String, Option<String>)>>,
    workers: AsyncMutex<HashMap<WorkerId, Arc<Worker>>>,
    classes: std::sync::Mutex<ClassRegistry>,
    rpc: AsyncMutex<RpcTable>,
    seq: AsyncMutex<CyclicCounter>,
    clock: AsyncMutex<ClockSync>,
    address_cache: AsyncMutex<AddressCache>,
    broker_addrs: AsyncMutex<HashMap<BrokerId, String>>,
    metrics: Arc<Metrics>,
    load_dirty: AtomicBool,
    health_check_countdown: AtomicU64,
    recovery_running: AtomicBool,
    recovery_dirty: AtomicBool,
    background: AsyncMutex<Vec<JoinHandle<()>>>,
}

impl<R: RegistryClient + 'static> Broker<R> {
    pub fn new(
        id: BrokerId,
        config: Config,
        registry: Arc<R>,
        router: Arc<Router>,
        router_events: mpsc::UnboundedReceiver<RouterEvent>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        let keys = KeyNames::new(config.ns.clone());
        let health_check_ticks = config.health_check_interval.as_secs();
        Arc::new(Self {
            keys,
            registry,
            router: AsyncMutex::new(router),
            router_events: AsyncMutex::new(Some(router_events)),
            state: SharedBrokerState::new(BrokerState::Inactive),
            cluster: AsyncMutex::new(None),
            own_addr: AsyncMutex::new(None),
            start_params: AsyncMutex::new(None),
            workers: AsyncMutex::new(HashMap::new()),
            classes: std::sync::Mutex::new(ClassRegistry::new()),
            rpc: AsyncMutex::new(RpcTable::new()),
            seq: AsyncMutex::new(CyclicCounter::new()),
            clock: AsyncMutex::new(ClockSync::new(std::time::Duration::from_secs(30))),
            address_cache: AsyncMutex::new(AddressCache::new(config.broker_cache.max, config.broker_cache.max_age)),
            broker_addrs: AsyncMutex::new(HashMap::new()),
            metrics,
            load_dirty: AtomicBool::new(false),
            health_check_countdown: AtomicU64::new(health_check_ticks.max(1)),
            recovery_running: AtomicBool::new(false),
            recovery_dirty: AtomicBool::new(false),
            background: AsyncMutex::new(Vec::new()),
            id,
            config,
        })
    }

    pub fn id(&self) -> &BrokerId {
        &self.id
    }

    pub fn state(&self) -> BrokerState {
        self.state.get()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub async fn addr(&self) -> Option<String> {
        self.own_addr.lock().await.clone()
    }

    pub fn register_class(&self, name: impl Into<String>, cluster: ClusterName, factory: Arc<dyn WorkerFactory>) {
        self.classes.lock().unwrap().register(name, cluster, factory);
    }

    pub fn register_class_with_agent_kind(
        &self,
        name: impl Into<String>,
        cluster: ClusterName,
        factory: Arc<dyn WorkerFactory>,
        agent_kind: impl Into<String>,
    ) {
        self.classes.lock().unwrap().register_with_agent_kind(name, cluster, factory, agent_kind);
    }

    fn channel_prefix(&self) -> String {
        format!("{}:ch", self.config.ns)
    }

    fn as_agent_router(self: &Arc<Self>) -> std::sync::Weak<dyn AgentRouter> {
        let router: Arc<dyn AgentRouter> = self.clone();
        Arc::downgrade(&router)
    }

    // ---- start / destroy (§4.4.1, §4.4.10) ----------------------------

    /// Brings the broker up: resyncs the registry clock, opens the peer
    /// listener, joins the cluster's membership, subscribes to its
    /// control-plane channels, and starts the background timer and event
    /// loops. `advertise_host`, when given, replaces `bind_host` in the
    /// address this broker publishes to `bh` — the bound host and the
    /// one peers should dial are not always the same on a multi-homed
    /// box.
    pub async fn start(
        self: &Arc<Self>,
        bind_host: &str,
        advertise_host: Option<&str>,
        cluster: ClusterName,
    ) -> Result<()> {
        let from = match self.state.get() {
            BrokerState::Inactive => BrokerState::Inactive,
            BrokerState::Destroyed => BrokerState::Destroyed,
            other => {
                return Err(WardenError::InvalidState(format!("cannot start broker from state {other:?}")));
            }
        };
        self.state.transition(from, BrokerState::Activating)?;

        if let Err(err) = self.sync_clock().await {
            let _ = self.state.transition(BrokerState::Activating, BrokerState::Inactive);
            return Err(err);
        }

        if let Err(err) = self.registry.load_scripts().await {
            let _ = self.state.transition(BrokerState::Activating, BrokerState::Inactive);
            return Err(err);
        }

        // A restart after a full teardown finds `router_events` already
        // drained by the previous run's event loop; rebuild the router from
        // scratch rather than try to reuse one whose listener was aborted.
        if self.router_events.lock().await.is_none() {
            let (fresh_router, fresh_events) = Router::new(self.config.soc_timeout, self.config.server_soc_timeout());
            *self.router.lock().await = fresh_router;
            *self.router_events.lock().await = Some(fresh_events);
        }

        let port = match self.router.lock().await.listen(bind_host).await {
            Ok(port) => port,
            Err(err) => {
                let _ = self.state.transition(BrokerState::Activating, BrokerState::Inactive);
                return Err(WardenError::Protocol(format!("failed to listen on {bind_host}: {err}")));
            }
        };
        let addr = format!("{}:{port}", advertise_host.unwrap_or(bind_host));
        *self.own_addr.lock().await = Some(addr.clone());
        *self.start_params.lock().await = Some((bind_host.to_string(), advertise_host.map(str::to_string)));

        let ch_prefix = self.channel_prefix();
        let broadcast = format!("{ch_prefix}:*");
        let unicast = format!("{ch_prefix}:{}", self.id);
        let pubsub_rx = match self.registry.subscribe(&[broadcast, unicast]).await {
            Ok(rx) => rx,
            Err(err) => {
                let _ = self.state.transition(BrokerState::Activating, BrokerState::Inactive);
                return Err(err);
            }
        };

        let hash_key = broker_hash_key(self.id.as_str());
        self.metrics.scripts_invoked.with_label_values(&["join"]).inc();
        if let Err(err) = registry_ops::join(
            self.registry.as_ref(),
            &self.keys,
            &self.id,
            &ch_prefix,
            0.0,
            &cluster,
            &addr,
            hash_key,
        )
        .await
        {
            let _ = self.state.transition(BrokerState::Activating, BrokerState::Inactive);
            return Err(err);
        }

        *self.cluster.lock().await = Some(cluster);
        self.state.transition(BrokerState::Activating, BrokerState::Active)?;

        let events = self.router_events.lock().await.take().ok_or_else(|| {
            WardenError::InvalidState("broker was already started once".to_string())
        })?;
        self.spawn_event_loop(events).await;
        self.spawn_pubsub_loop(pubsub_rx).await;
        self.spawn_timer().await;

        Ok(())
    }

    /// Tears the broker down (§4.4.10, §5): cancels the periodic timer and
    /// event loops synchronously, runs every locally-owned worker's
    /// `onDestroy(SYSTEM)` hook, fails every in-flight RPC waiter, closes
    /// the router, atomically salvages or discards this broker's `wz`
    /// membership and removes it from `cz`/`bz`/`bh` in one script call, and
    /// clears the address cache.
    pub async fn destroy(self: &Arc<Self>, option: BrokerDestroyOption) -> Result<()> {
        self.state.transition(BrokerState::Active, BrokerState::Destroying)?;

        {
            let mut background = self.background.lock().await;
            for handle in background.drain(..) {
                handle.abort();
            }
        }

        self.run_teardown_hooks().await;
        self.rpc.lock().await.fail_all();
        self.router.lock().await.close().await;

        if let Some(cluster) = self.cluster.lock().await.take() {
            self.metrics.scripts_invoked.with_label_values(&["salvage"]).inc();
            if let Err(err) =
                registry_ops::salvage(self.registry.as_ref(), &self.keys, &cluster, &self.id, option.salvage_mode()).await
            {
                tracing::warn!(error = %err, "salvage failed during broker destroy");
            }
        }

        self.address_cache.lock().await.clear();

        self.state.transition(BrokerState::Destroying, BrokerState::Destroyed)?;
        Ok(())
    }

    // ---- create / find (§4.4.3, §4.4.4) --------------------------------

    pub async fn create(
        self: &Arc<Self>,
        class: &str,
        id_override: Option<WorkerId>,
        attributes: WorkerAttributes,
    ) -> Result<Agent> {
        self.state.require(BrokerState::Active)?;
        let cluster = {
            let classes = self.classes.lock().unwrap();
            classes.get(class)?.cluster.clone()
        };

        self.metrics.scripts_invoked.with_label_values(&["pickBroker"]).inc();
        let (target_broker, target_addr) =
            match registry_ops::pick_broker(self.registry.as_ref(), &self.keys, &cluster, 100).await? {
                PickBrokerOutcome::Picked { broker_id, addr, .. } => (broker_id, addr),
                PickBrokerOutcome::Retry => {
                    return Err(WardenError::NotFound(format!("no live broker in cluster {cluster}")));
                }
            };

        let is_static = attributes.is_static();
        let request = CreateWorkerRequest {
            name: class.to_string(),
            id: id_override.map(|w| w.as_str().to_string()),
            attributes,
            is_static,
            cause: CreateCause::New,
        };

        let (owner, _name, worker_id) = if target_broker == self.id {
            self.create_worker_here(&request).await?
        } else {
            let payload = serde_json::to_value(&request).map_err(|e| WardenError::Protocol(e.to_string()))?;
            let response = self.send_broker_rpc(&target_addr, "onCreateWorker", payload).await?;
            Self::parse_create_response(response)?
        };

        Ok(Agent::new(worker_id, owner, self.as_agent_router()))
    }

    pub async fn find(self: &Arc<Self>, worker_id: &WorkerId) -> Result<Option<Agent>> {
        self.state.require(BrokerState::Active)?;
        let mut backoff = Backoff::new(
            self.config.retries.initial_interval,
            self.config.retries.max_interval,
            self.config.retries.duration,
        );
        loop {
            self.metrics.scripts_invoked.with_label_values(&["findOrCreate"]).inc();
            let outcome = registry_ops::find_or_create(
                self.registry.as_ref(),
                &self.keys,
                None,
                worker_id.as_str(),
                Some(worker_id),
                &WorkerAttributes::new(),
                0,
                0,
                false,
            )
            .await?;
            match outcome {
                FindOrCreateOutcome::Found { broker_id, worker_id, .. } => {
                    self.address_cache.lock().await.insert(worker_id.clone(), broker_id.clone());
                    return Ok(Some(Agent::new(worker_id, broker_id, self.as_agent_router())));
                }
                FindOrCreateOutcome::NotFound => return Ok(None),
                FindOrCreateOutcome::Retry => match backoff.next_wait() {
                    Some(wait) => tokio::time::sleep(wait).await,
                    None => return Err(WardenError::Timeout(self.config.retries.duration)),
                },
            }
        }
    }

    async fn create_worker_here(
        self: &Arc<Self>,
        request: &CreateWorkerRequest,
    ) -> Result<(BrokerId, String, WorkerId)> {
        let worker_id = request.id.as_ref().map(|s| WorkerId::new(s.as_str()));
        let mut backoff = Backoff::new(
            self.config.retries.initial_interval,
            self.config.retries.max_interval,
            self.config.retries.duration,
        );
        loop {
            let now_ms = self.clock.lock().await.registry_now_ms();
            self.metrics.scripts_invoked.with_label_values(&["findOrCreate"]).inc();
            let outcome = registry_ops::find_or_create(
                self.registry.as_ref(),
                &self.keys,
                Some(&self.id),
                &request.name,
                worker_id.as_ref(),
                &request.attributes,
                now_ms,
                self.config.ttl.as_millis() as i64,
                matches!(request.cause, CreateCause::Recovery),
            )
            .await?;
            match outcome {
                FindOrCreateOutcome::Found { broker_id, name, worker_id } => {
                    if broker_id == self.id {
                        self.materialize_worker(&request.name, &worker_id, request.attributes.clone(), request.cause)
                            .await?;
                    }
                    return Ok((broker_id, name, worker_id));
                }
                FindOrCreateOutcome::NotFound => return Err(WardenError::NotFound(request.name.clone())),
                FindOrCreateOutcome::Retry => match backoff.next_wait() {
                    Some(wait) => tokio::time::sleep(wait).await,
                    None => return Err(WardenError::Timeout(self.config.retries.duration)),
                },
            }
        }
    }

    async fn materialize_worker(
        self: &Arc<Self>,
        class: &str,
        worker_id: &WorkerId,
        attributes: WorkerAttributes,
        cause: CreateCause,
    ) -> Result<()> {
        let factory = {
            let classes = self.classes.lock().unwrap();
            classes.get(class)?.factory.clone()
        };
        let handler = factory.create(&attributes);
        let recoverable = attributes.recoverable();
        let worker = Arc::new(Worker::new(worker_id.clone(), attributes, handler));
        self.workers.lock().await.insert(worker_id.clone(), worker.clone());
        self.metrics.workers_active.inc();

        let deferred = worker.activate(CreateInfo { cause }).await?;
        if deferred {
            let mode = if recoverable { DestroyMode::SalvageIfRecoverable } else { DestroyMode::Drop };
            self.finish_local_destroy(&worker, DestroyCause::System, mode).await;
        }
        Ok(())
    }

    fn parse_create_response(value: Value) -> Result<(BrokerId, String, WorkerId)> {
        let owner = value
            .get("ownerBrokerId")
            .and_then(Value::as_str)
            .ok_or_else(|| WardenError::Protocol("onCreateWorker response missing ownerBrokerId".to_string()))?;
        let name = value
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| WardenError::Protocol("onCreateWorker response missing name".to_string()))?;
        let worker_id = value
            .get("workerId")
            .and_then(Value::as_str)
            .ok_or_else(|| WardenError::Protocol("onCreateWorker response missing workerId".to_string()))?;
        Ok((BrokerId::new(owner), name.to_string(), WorkerId::new(worker_id)))
    }

    // ---- ask / tell (§4.4.5) -------------------------------------------

    async fn resolve_owner(&self, worker_id: &WorkerId) -> Result<BrokerId> {
        if let Some(cached) = self.address_cache.lock().await.get(worker_id) {
            return Ok(cached);
        }
        self.metrics.scripts_invoked.with_label_values(&["findBroker"]).inc();
        match registry_ops::find_broker(self.registry.as_ref(), &self.keys, &self.id, worker_id).await? {
            FindBrokerOutcome::Found { broker_id, addr, .. } => {
                self.address_cache.lock().await.insert(worker_id.clone(), broker_id.clone());
                self.broker_addrs.lock().await.insert(broker_id.clone(), addr);
                Ok(broker_id)
            }
            FindBrokerOutcome::NotFound => Err(WardenError::NotFound(worker_id.to_string())),
            FindBrokerOutcome::Invalidated { broker_id } => Err(WardenError::Unreachable(broker_id.to_string())),
        }
    }

    async fn addr_for(&self, broker_id: &BrokerId) -> Result<String> {
        if let Some(addr) = self.broker_addrs.lock().await.get(broker_id).cloned() {
            return Ok(addr);
        }
        let raw = self
            .registry
            .hget(&self.keys.bh(), broker_id.as_str())
            .await?
            .ok_or_else(|| WardenError::Unreachable(broker_id.to_string()))?;
        let record: BrokerRecord =
            serde_json::from_str(&raw).map_err(|_| WardenError::RegistryFault("corrupt broker record".to_string()))?;
        self.broker_addrs.lock().await.insert(broker_id.clone(), record.addr.clone());
        Ok(record.addr)
    }

    /// A worker's own voluntary self-destroy (§4.5). Default behavior is
    /// non-recoverable regardless of the worker's `recoverable` attribute —
    /// only a system-triggered destroy (broker teardown, restart) honors
    /// that attribute. Pass `allow_recoverable_salvage: true` to opt a
    /// self-destroy into `DestroyMode::SalvageIfRecoverable` instead.
    pub async fn destroy_worker(&self, worker_id: &WorkerId) -> Result<()> {
        self.destroy_worker_with(worker_id, false).await
    }

    pub async fn destroy_worker_with(&self, worker_id: &WorkerId, allow_recoverable_salvage: bool) -> Result<()> {
        let worker = {
            let workers = self.workers.lock().await;
            workers.get(worker_id).cloned().ok_or_else(|| WardenError::NotFound(worker_id.to_string()))?
        };
        if worker.request_destroy()? {
            let mode = if allow_recoverable_salvage && worker.attributes().recoverable() {
                DestroyMode::SalvageIfRecoverable
            } else {
                DestroyMode::Drop
            };
            self.finish_local_destroy(&worker, DestroyCause::SelfDestroy, mode).await;
        }
        Ok(())
    }

    async fn finish_local_destroy(&self, worker: &Arc<Worker>, cause: DestroyCause, mode: DestroyMode) {
        worker.finish_destroy(DestroyInfo { cause }).await;
        self.workers.lock().await.remove(worker.id());
        self.metrics.workers_active.dec();
        self.metrics.scripts_invoked.with_label_values(&["destroyWorker"]).inc();
        if let Err(err) = registry_ops::destroy_worker(self.registry.as_ref(), &self.keys, &self.id, worker.id(), mode).await {
            tracing::warn!(error = %err, worker = %worker.id(), "destroyWorker script failed");
        }
    }

    /// Runs every locally-owned worker's `onDestroy(SYSTEM)` hook and drops
    /// it from the in-memory table, ahead of a full broker teardown. Does
    /// *not* touch the registry per-worker: the `salvage` call that follows
    /// in `destroy` drains `wz:<self>` atomically, including any worker the
    /// registry knows about that never made it into this table (a crashed
    /// or partial creation).
    async fn run_teardown_hooks(&self) {
        let workers: Vec<Arc<Worker>> = self.workers.lock().await.values().cloned().collect();
        for worker in workers {
            if let Ok(true) = worker.request_destroy() {
                worker.finish_destroy(DestroyInfo { cause: DestroyCause::System }).await;
                self.workers.lock().await.remove(worker.id());
                self.metrics.workers_active.dec();
            }
        }
    }

    // ---- wire RPC plumbing ---------------------------------------------

    async fn next_seq(&self) -> u64 {
        self.seq.lock().await.next()
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_rpc(
        &self,
        addr: &str,
        method: &str,
        wid: Option<String>,
        payload: Value,
        is_ask: bool,
    ) -> Result<Value> {
        if !is_ask {
            let envelope = Envelope::request(method, None, wid, payload);
            let bytes = Bytes::from(serde_json::to_vec(&envelope).map_err(|e| WardenError::Protocol(e.to_string()))?);
            self.router.lock().await.request(addr, bytes).await.map_err(WardenError::Unreachable)?;
            return Ok(Value::Null);
        }

        let seq = self.next_seq().await;
        let rx = self.rpc.lock().await.register(seq);
        self.metrics.rpcs_in_flight.inc();
        let envelope = Envelope::request(method, Some(seq), wid, payload);
        let bytes = match serde_json::to_vec(&envelope) {
            Ok(b) => Bytes::from(b),
            Err(err) => {
                self.rpc.lock().await.complete(seq, Err(WardenError::Protocol(err.to_string())));
                self.metrics.rpcs_in_flight.dec();
                return Err(WardenError::Protocol(err.to_string()));
            }
        };
        if let Err(err) = self.router.lock().await.request(addr, bytes).await {
            self.rpc.lock().await.complete(seq, Err(WardenError::Unreachable(err.clone())));
            self.metrics.rpcs_in_flight.dec();
            return Err(WardenError::Unreachable(err));
        }
        let result = rx.await.map_err(|_| WardenError::Unreachable("broker destroyed".to_string()));
        self.metrics.rpcs_in_flight.dec();
        result?
    }

    async fn send_worker_rpc(&self, addr: &str, worker_id: &WorkerId, method: &str, data: Value, is_ask: bool) -> Result<Value> {
        self.send_rpc(addr, method, Some(worker_id.as_str().to_string()), data, is_ask).await
    }

    async fn send_broker_rpc(&self, addr: &str, method: &str, payload: Value) -> Result<Value> {
        self.send_rpc(addr, method, None, payload, true).await
    }

    async fn respond(&self, requester_id: u64, seq: u64, result: Result<Value>) {
        let envelope = match result {
            Ok(value) => Envelope::response(seq, ResponsePayload::Ok { res: value }),
            Err(err) => {
                let parts = err.into_remote();
                Envelope::response(
                    seq,
                    ResponsePayload::Err { err: RemoteError { name: parts.name, message: parts.message } },
                )
            }
        };
        let bytes = match serde_json::to_vec(&envelope) {
            Ok(b) => Bytes::from(b),
            Err(err) => {
                tracing::error!(error = %err, "failed to encode response envelope");
                return;
            }
        };
        self.router.lock().await.respond(requester_id, bytes).await;
    }

    async fn handle_inbound(self: Arc<Self>, payload: Bytes, requester_id: u64) {
        let envelope: Envelope = match serde_json::from_slice(&payload) {
            Ok(e) => e,
            Err(err) => {
                tracing::warn!(error = %err, "failed to decode inbound envelope");
                return;
            }
        };
        let Some(method) = envelope.m.clone() else {
            tracing::warn!("inbound request envelope missing method");
            return;
        };

        if method == "onCreateWorker" {
            self.handle_create_worker_rpc(envelope, requester_id).await;
            return;
        }

        let Some(worker_id) = envelope.wid.as_deref().map(WorkerId::new) else {
            tracing::warn!(method = %method, "worker-targeted envelope missing wid");
            return;
        };

        match envelope.seq {
            Some(seq) => {
                let result = self.dispatch_local_ask(&worker_id, &method, envelope.pl).await;
                self.respond(requester_id, seq, result).await;
            }
            None => self.dispatch_local_tell(&worker_id, &method, envelope.pl).await,
        }
    }

    async fn dispatch_local_ask(&self, worker_id: &WorkerId, method: &str, data: Value) -> Result<Value> {
        let worker = self.workers.lock().await.get(worker_id).cloned();
        match worker {
            Some(worker) => worker.ask(method, data).await,
            None => Err(WardenError::NotFound(worker_id.to_string())),
        }
    }

    async fn dispatch_local_tell(&self, worker_id: &WorkerId, method: &str, data: Value) {
        let worker = self.workers.lock().await.get(worker_id).cloned();
        match worker {
            Some(worker) => worker.tell(method, data).await,
            None => tracing::debug!(worker = %worker_id, "tell for unknown local worker dropped"),
        }
    }

    async fn handle_create_worker_rpc(self: Arc<Self>, envelope: Envelope, requester_id: u64) {
        let Some(seq) = envelope.seq else {
            tracing::warn!("onCreateWorker envelope missing seq");
            return;
        };
        let result: Result<Value> = async {
            let request: CreateWorkerRequest =
                serde_json::from_value(envelope.pl).map_err(|e| WardenError::Protocol(e.to_string()))?;
            let (owner, name, worker_id) = self.create_worker_here(&request).await?;
            Ok(serde_json::json!({
                "ownerBrokerId": owner.as_str(),
                "name": name,
                "workerId": worker_id.as_str(),
            }))
        }
        .await;
        self.respond(requester_id, seq, result).await;
    }

    async fn handle_response(&self, payload: Bytes) {
        let envelope: Envelope = match serde_json::from_slice(&payload) {
            Ok(e) => e,
            Err(err) => {
                tracing::warn!(error = %err, "failed to decode response envelope");
                return;
            }
        };
        let Some(seq) = envelope.seq else {
            return;
        };
        let result = match serde_json::from_value::<ResponsePayload>(envelope.pl) {
            Ok(ResponsePayload::Ok { res }) => Ok(res),
            Ok(ResponsePayload::Err { err }) => Err(WardenError::ApplicationError { name: err.name, message: err.message }),
            Err(err) => Err(WardenError::Protocol(err.to_string())),
        };
        self.rpc.lock().await.complete(seq, result);
    }

    // ---- background loops ------------------------------------------------

    async fn spawn_event_loop(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<RouterEvent>) {
        let broker = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    RouterEvent::Request { payload, requester_id } => {
                        let broker = broker.clone();
                        tokio::spawn(async move { broker.handle_inbound(payload, requester_id).await });
                    }
                    RouterEvent::Response { payload } => broker.handle_response(payload).await,
                    RouterEvent::Disconnect { remote_addr } => {
                        tracing::debug!(remote_addr = %remote_addr, "peer connection closed");
                    }
                    RouterEvent::Log { level, message } => Self::log_router_event(level, &message),
                }
            }
        });
        self.background.lock().await.push(handle);
    }

    fn log_router_event(level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => tracing::debug!(message),
            LogLevel::Warn => tracing::warn!(message),
            LogLevel::Error => tracing::error!(message),
        }
    }

    async fn spawn_pubsub_loop(self: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<PubsubMessage>) {
        let broker = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let Some(signal) = Signal::decode(&msg.payload) else {
                    continue;
                };
                broker.handle_signal(signal).await;
            }
        });
        self.background.lock().await.push(handle);
    }

    async fn handle_signal(self: &Arc<Self>, signal: Signal) {
        match signal {
            Signal::Recover => self.trigger_recovery(),
            Signal::Salvage { clustername, broker_id } => {
                if broker_id == self.id {
                    return;
                }
                let Some(cluster) = self.cluster.lock().await.clone() else {
                    return;
                };
                if cluster != clustername {
                    return;
                }
                self.metrics.salvage_signals_received.inc();
                self.metrics.scripts_invoked.with_label_values(&["salvage"]).inc();
                match registry_ops::salvage(self.registry.as_ref(), &self.keys, &cluster, &broker_id, SalvageMode::PeerSalvage).await {
                    Ok(()) => self.trigger_recovery(),
                    Err(err) => tracing::warn!(error = %err, target = %broker_id, "peer salvage failed"),
                }
            }
            Signal::Restart => {
                tracing::warn!("received restart signal; tearing down and rejoining");
                // destroy() aborts every handle in `background`, which includes
                // the pubsub loop task currently running this handler — doing
                // the teardown inline would abort its own caller mid-flight.
                // Run it on a detached task instead.
                let broker = self.clone();
                tokio::spawn(async move { broker.restart().await });
            }
        }
    }

    /// Full teardown (discarding any recoverable workers, §4.4.8) followed
    /// by rejoining the cluster with the same bind/advertise parameters the
    /// broker last started with.
    async fn restart(self: &Arc<Self>) {
        let Some((bind_host, advertise_host)) = self.start_params.lock().await.clone() else {
            tracing::error!("restart signal received before the broker ever started");
            return;
        };
        let Some(cluster) = self.cluster.lock().await.clone() else {
            tracing::error!("restart signal received while the broker has no cluster membership");
            return;
        };
        if let Err(err) = self.destroy(BrokerDestroyOption::Discard).await {
            tracing::error!(error = %err, "destroy during restart failed");
            return;
        }
        if let Err(err) = self.start(&bind_host, advertise_host.as_deref(), cluster).await {
            tracing::error!(error = %err, "restart failed to bring the broker back up");
        }
    }

    fn trigger_recovery(self: &Arc<Self>) {
        if self.recovery_running.swap(true, Ordering::AcqRel) {
            self.recovery_dirty.store(true, Ordering::Release);
            return;
        }
        let broker = self.clone();
        tokio::spawn(async move { broker.run_recovery_loop().await });
    }

    async fn run_recovery_loop(self: Arc<Self>) {
        loop {
            self.recovery_dirty.store(false, Ordering::Release);
            self.metrics.recovery_loop_iterations.inc();
            let ttl_ms = self.config.ttl.as_millis() as i64;
            loop {
                let now_ms = self.clock.lock().await.registry_now_ms();
                self.metrics.scripts_invoked.with_label_values(&["fetchForRecovery"]).inc();
                let outcome = match registry_ops::fetch_for_recovery(
                    self.registry.as_ref(),
                    &self.keys,
                    now_ms,
                    ttl_ms,
                    self.config.batch_read_size,
                )
                .await
                {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        tracing::warn!(error = %err, "fetchForRecovery failed");
                        break;
                    }
                };
                if outcome.records.is_empty() {
                    break;
                }
                for record in outcome.records {
                    self.recover_one(record).await;
                }
                if outcome.remaining == 0 {
                    break;
                }
            }
            if !self.recovery_dirty.load(Ordering::Acquire) {
                break;
            }
        }
        self.recovery_running.store(false, Ordering::Release);
    }

    async fn recover_one(self: &Arc<Self>, record: RecoverableWorker) {
        let request = CreateWorkerRequest {
            name: record.name.clone(),
            id: Some(record.id.clone()),
            is_static: record.attributes.is_static(),
            attributes: record.attributes,
            cause: CreateCause::Recovery,
        };
        match self.create_worker_here(&request).await {
            Ok((owner, _, worker_id)) if owner == self.id => {
                tracing::info!(worker = %worker_id, "recovered worker");
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(worker = %record.id, error = %err, "failed to recover worker"),
        }
    }

    async fn sync_clock(&self) -> Result<()> {
        let time = self.registry.time().await?;
        self.clock.lock().await.record(time);
        Ok(())
    }

    async fn flush_load(&self) {
        let total: i64 = self.workers.lock().await.values().map(|w| w.load()).sum();
        let Some(cluster) = self.cluster.lock().await.clone() else {
            return;
        };
        if let Err(err) = self.registry.zadd(&self.keys.cz(cluster.as_str()), total as f64, self.id.as_str()).await {
            tracing::warn!(error = %err, "failed to flush broker load");
        }
    }

    async fn run_health_check(self: &Arc<Self>) {
        let Some(cluster) = self.cluster.lock().await.clone() else {
            return;
        };
        self.metrics.health_checks_run.inc();
        self.metrics.scripts_invoked.with_label_values(&["healthCheck"]).inc();
        match registry_ops::health_check(self.registry.as_ref(), &self.keys, &self.id, &cluster).await {
            Ok(HealthCheckOutcome::Ok) => {}
            Ok(HealthCheckOutcome::SalvageIssued) => {
                tracing::debug!("healthCheck issued a salvage signal for a dead peer");
            }
            Ok(HealthCheckOutcome::Warning(message)) => tracing::warn!(message = %message, "healthCheck reported an issue"),
            Err(err) => tracing::warn!(error = %err, "healthCheck script failed"),
        }
    }

    async fn on_tick(self: &Arc<Self>) {
        if self.clock.lock().await.due() {
            if let Err(err) = self.sync_clock().await {
                tracing::warn!(error = %err, "clock resync failed");
            }
        }
        let timed_out = self.rpc.lock().await.sweep_timeouts(self.config.rpc_timeout);
        if timed_out > 0 {
            self.metrics.rpc_timeouts.inc_by(timed_out as u64);
        }
        if self.load_dirty.swap(false, Ordering::AcqRel) {
            self.flush_load().await;
        }
        if !self.config.health_check_interval.is_zero() {
            let remaining = self.health_check_countdown.fetch_sub(1, Ordering::AcqRel);
            if remaining <= 1 {
                self.health_check_countdown.store(self.config.health_check_interval.as_secs().max(1), Ordering::Release);
                self.run_health_check().await;
            }
        }
    }

    async fn spawn_timer(self: &Arc<Self>) {
        let broker = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
            loop {
                ticker.tick().await;
                if broker.state.get() != BrokerState::Active {
                    break;
                }
                broker.on_tick().await;
            }
        });
        self.background.lock().await.push(handle);
    }
}

#[async_trait]
impl<R: RegistryClient + 'static> AgentRouter for Broker<R> {
    async fn ask(&self, worker: &WorkerId, method: &str, data: Value) -> Result<Value> {
        self.ask_no_arc(worker, method, data).await
    }

    async fn tell(&self, worker: &WorkerId, method: &str, data: Value) -> Result<()> {
        self.tell_no_arc(worker, method, data).await
    }
}

impl<R: RegistryClient + 'static> Broker<R> {
    /// `create`/`find` need `self: &Arc<Self>` because they hand a fresh
    /// `Agent` a `Weak<dyn AgentRouter>` pointing back at this broker.
    /// Dispatch itself doesn't need the `Arc` — `Agent::ask`/`tell` reach
    /// the broker through that trait object with a plain `&self`, which is
    /// all `AgentRouter`'s methods give us.
    async fn ask_no_arc(&self, worker_id: &WorkerId, method: &str, data: Value) -> Result<Value> {
        self.state.require(BrokerState::Active)?;
        let mut backoff = Backoff::new(
            self.config.retries.initial_interval,
            self.config.retries.max_interval,
            self.config.retries.duration,
        );
        loop {
            let broker_id = self.resolve_owner(worker_id).await?;
            if broker_id == self.id {
                let worker = self.workers.lock().await.get(worker_id).cloned();
                match worker {
                    Some(w) => return w.ask(method, data).await,
                    None => self.address_cache.lock().await.evict(worker_id),
                }
            } else {
                let addr = self.addr_for(&broker_id).await?;
                match self.send_worker_rpc(&addr, worker_id, method, data.clone(), true).await {
                    Ok(value) => return Ok(value),
                    Err(WardenError::Unreachable(_)) => self.address_cache.lock().await.evict(worker_id),
                    Err(err) => return Err(err),
                }
            }
            match backoff.next_wait() {
                Some(wait) => tokio::time::sleep(wait).await,
                None => return Err(WardenError::Timeout(self.config.retries.duration)),
            }
        }
    }

    async fn tell_no_arc(&self, worker_id: &WorkerId, method: &str, data: Value) -> Result<()> {
        self.state.require(BrokerState::Active)?;
        let mut backoff = Backoff::new(
            self.config.retries.initial_interval,
            self.config.retries.max_interval,
            self.config.retries.duration,
        );
        loop {
            let broker_id = self.resolve_owner(worker_id).await?;
            if broker_id == self.id {
                let worker = self.workers.lock().await.get(worker_id).cloned();
                match worker {
                    Some(w) => {
                        w.tell(method, data).await;
                        return Ok(());
                    }
                    None => self.address_cache.lock().await.evict(worker_id),
                }
            } else {
                let addr = self.addr_for(&broker_id).await?;
                match self.send_worker_rpc(&addr, worker_id, method, data.clone(), false).await {
                    Ok(_) => return Ok(()),
                    Err(WardenError::Unreachable(_)) => self.address_cache.lock().await.evict(worker_id),
                    Err(err) => return Err(err),
                }
            }
            match backoff.next_wait() {
                Some(wait) => tokio::time::sleep(wait).await,
                None => return Err(WardenError::Timeout(self.config.retries.duration)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::time::Duration;

    use warden_registry::FakeRegistry;
    use warden_worker::WorkerHandler;

    struct EchoHandler {
        tells: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl WorkerHandler for EchoHandler {
        async fn on_ask(&self, method: &str, data: Value) -> Result<Value> {
            Ok(serde_json::json!({ "method": method, "echo": data }))
        }

        async fn on_tell(&self, _method: &str, _data: Value) {
            self.tells.fetch_add(1, AtomicOrdering::Relaxed);
        }
    }

    fn test_config() -> Config {
        let mut cfg = Config::new("pvp").with_ns("brokertest");
        cfg.rpc_timeout = Duration::from_secs(2);
        cfg.health_check_interval = Duration::ZERO;
        cfg.retries.initial_interval = Duration::from_millis(5);
        cfg.retries.max_interval = Duration::from_millis(40);
        cfg.retries.duration = Duration::from_millis(400);
        cfg
    }

    async fn spawn_broker(id: &str, registry: Arc<FakeRegistry>, tells: Arc<AtomicUsize>) -> Arc<Broker<FakeRegistry>> {
        let (router, events) = Router::new(Duration::from_secs(5), Duration::from_secs(10));
        let metrics = Metrics::for_test();
        let broker = Broker::new(BrokerId::new(id), test_config(), registry, router, events, metrics);
        broker.register_class(
            "Echo",
            ClusterName::new("pvp"),
            Arc::new(move |_: &WorkerAttributes| Arc::new(EchoHandler { tells: tells.clone() }) as Arc<dyn WorkerHandler>),
        );
        broker.start("127.0.0.1", None, ClusterName::new("pvp")).await.unwrap();
        broker
    }

    #[tokio::test]
    async fn start_then_destroy_round_trips_broker_state() {
        let registry = Arc::new(FakeRegistry::new());
        let broker = spawn_broker("aaa", registry, Arc::new(AtomicUsize::new(0))).await;
        assert_eq!(broker.state(), BrokerState::Active);
        broker.destroy(BrokerDestroyOption::Discard).await.unwrap();
        assert_eq!(broker.state(), BrokerState::Destroyed);
    }

    #[tokio::test]
    async fn create_without_a_registered_class_is_not_found() {
        let registry = Arc::new(FakeRegistry::new());
        let broker = spawn_broker("aaa", registry, Arc::new(AtomicUsize::new(0))).await;
        let err = broker.create("Missing", None, WorkerAttributes::new()).await.unwrap_err();
        assert!(matches!(err, WardenError::NotFound(_)));
    }

    #[tokio::test]
    async fn create_then_ask_reaches_a_locally_owned_worker() {
        let registry = Arc::new(FakeRegistry::new());
        let broker = spawn_broker("aaa", registry, Arc::new(AtomicUsize::new(0))).await;

        let agent = broker.create("Echo", None, WorkerAttributes::new()).await.unwrap();
        assert_eq!(agent.broker_id(), broker.id());

        let result = agent.ask("ping", Value::String("hi".to_string())).await.unwrap();
        assert_eq!(result.get("method").unwrap().as_str().unwrap(), "ping");

        broker.destroy_worker(agent.worker_id()).await.unwrap();
        assert_eq!(broker.metrics().workers_active.get(), 0);
    }

    #[tokio::test]
    async fn a_second_broker_can_find_and_reach_a_worker_owned_by_the_first() {
        let registry = Arc::new(FakeRegistry::new());
        let tells_a = Arc::new(AtomicUsize::new(0));
        let broker_a = spawn_broker("aaa", registry.clone(), tells_a.clone()).await;
        let broker_b = spawn_broker("zzz", registry, Arc::new(AtomicUsize::new(0))).await;

        let agent = broker_a.create("Echo", None, WorkerAttributes::new()).await.unwrap();
        assert_eq!(agent.broker_id(), broker_a.id());

        let found = broker_b.find(agent.worker_id()).await.unwrap().expect("worker should be found by the peer broker");
        assert_eq!(found.broker_id(), broker_a.id());

        let result = found.ask("ping", Value::Null).await.unwrap();
        assert_eq!(result.get("method").unwrap().as_str().unwrap(), "ping");

        found.tell("poke", Value::Null).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(tells_a.load(AtomicOrdering::Relaxed), 1);

        broker_a.destroy(BrokerDestroyOption::Discard).await.unwrap();
        broker_b.destroy(BrokerDestroyOption::Discard).await.unwrap();
    }

    #[tokio::test]
    async fn find_of_an_unknown_worker_is_none() {
        let registry = Arc::new(FakeRegistry::new());
        let broker = spawn_broker("aaa", registry, Arc::new(AtomicUsize::new(0))).await;
        let found = broker.find(&WorkerId::new("NoSuchWorker#1")).await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn restart_signal_tears_down_and_rejoins_the_cluster() {
        let registry = Arc::new(FakeRegistry::new());
        let broker = spawn_broker("aaa", registry.clone(), Arc::new(AtomicUsize::new(0))).await;
        let agent = broker.create("Echo", None, WorkerAttributes::new()).await.unwrap();
        assert_eq!(broker.metrics().workers_active.get(), 1);

        registry
            .publish("brokertest:ch:aaa", &Signal::Restart.encode())
            .await
            .unwrap();

        // handle_signal hands the teardown+restart off to a detached task
        // rather than running it inline, so give it a moment to land.
        for _ in 0..50 {
            if broker.state() == BrokerState::Active && broker.metrics().workers_active.get() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(broker.state(), BrokerState::Active);
        assert_eq!(broker.metrics().workers_active.get(), 0);
        assert!(!registry.worker_exists(agent.worker_id().as_str()));

        broker.destroy(BrokerDestroyOption::Discard).await.unwrap();
    }
}
