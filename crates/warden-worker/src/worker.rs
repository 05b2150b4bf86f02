use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use warden_types::{CreateCause, DestroyCause, Result, WardenError, WorkerAttributes, WorkerId};

/// Passed to the application's `onCreate` hook.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CreateInfo {
    pub cause: CreateCause,
}

/// Passed to the application's `onDestroy` hook.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DestroyInfo {
    pub cause: DestroyCause,
}

/// The four application-supplied hooks (§4.5). Rejections from `on_create`
/// and `on_destroy` are logged and swallowed by the caller; `on_ask`'s
/// error propagates to the requesting `Agent` as `ApplicationError`.
#[async_trait]
pub trait WorkerHandler: Send + Sync + 'static {
    async fn on_create(&self, _info: CreateInfo) -> Result<()> {
        Ok(())
    }

    async fn on_destroy(&self, _info: DestroyInfo) -> Result<()> {
        Ok(())
    }

    async fn on_ask(&self, method: &str, data: Value) -> Result<Value>;

    async fn on_tell(&self, method: &str, data: Value);
}

/// A worker's own lifecycle state (§4.5), independent of the broker's
/// state machine (§4.4).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Inactive = 0,
    Activating = 1,
    Active = 2,
    Destroying = 3,
    Destroyed = 4,
}

impl WorkerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => WorkerState::Inactive,
            1 => WorkerState::Activating,
            2 => WorkerState::Active,
            3 => WorkerState::Destroying,
            _ => WorkerState::Destroyed,
        }
    }
}

/// A local worker instance: immutable `id`/`attributes`, a mutable
/// `state`/`load`, and the application handler behind a trait object so a
/// broker's worker table can hold many different classes without being
/// generic over each one.
pub struct Worker {
    id: WorkerId,
    attributes: WorkerAttributes,
    state: AtomicU8,
    load: AtomicI64,
    /// Set when `request_destroy` arrives while `activating` (§4.5); the
    /// pending destroy runs at the end of `activate`.
    pending_destroy: AtomicBool,
    handler: Arc<dyn WorkerHandler>,
}

impl Worker {
    pub fn new(id: WorkerId, attributes: WorkerAttributes, handler: Arc<dyn WorkerHandler>) -> Self {
        Self {
            id,
            attributes,
            state: AtomicU8::new(WorkerState::Inactive as u8),
            load: AtomicI64::new(0),
            pending_destroy: AtomicBool::new(false),
            handler,
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    pub fn attributes(&self) -> &WorkerAttributes {
        &self.attributes
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn load(&self) -> i64 {
        self.load.load(Ordering::Acquire)
    }

    /// Replaces the load value (§4.4.7): rejected when the worker is
    /// `destroyed` or the new value is negative. Returns the new value
    /// when the write is accepted and actually changes it, so the broker
    /// knows to mark its load aggregate dirty.
    pub fn set_load(&self, new_value: i64) -> Result<Option<i64>> {
        if new_value < 0 {
            return Err(WardenError::InvalidState(format!(
                "load must be non-negative, got {new_value}"
            )));
        }
        if self.state() == WorkerState::Destroyed {
            return Err(WardenError::InvalidState(format!("worker {} is destroyed", self.id)));
        }
        let previous = self.load.swap(new_value, Ordering::AcqRel);
        Ok((previous != new_value).then_some(new_value))
    }

    fn transition(&self, from: WorkerState, to: WorkerState) -> Result<()> {
        let current = self.state();
        if current != from {
            return Err(WardenError::InvalidState(format!(
                "worker {}: cannot move to {to:?} from {current:?} (expected {from:?})",
                self.id
            )));
        }
        self.set_state(to);
        Ok(())
    }

    /// Runs the activation sequence (§4.4.3): `inactive -> activating`,
    /// `onCreate`, `activating -> active`. Returns `true` if a destroy was
    /// requested mid-activation and must now be carried out by the caller.
    pub async fn activate(&self, info: CreateInfo) -> Result<bool> {
        self.transition(WorkerState::Inactive, WorkerState::Activating)?;
        if let Err(err) = self.handler.on_create(info).await {
            tracing::warn!(worker = %self.id, error = %err, "onCreate rejected; ignoring");
        }
        self.transition(WorkerState::Activating, WorkerState::Active)?;
        Ok(self.pending_destroy.swap(false, Ordering::AcqRel))
    }

    /// Requests destruction. Returns `Ok(true)` when the caller should run
    /// the registry-level destroy immediately (the worker was `active`);
    /// `Ok(false)` when the request was deferred because the worker is
    /// still `activating` and will run at the end of `activate`.
    pub fn request_destroy(&self) -> Result<bool> {
        match self.state() {
            WorkerState::Active => {
                self.set_state(WorkerState::Destroying);
                Ok(true)
            }
            WorkerState::Activating => {
                self.pending_destroy.store(true, Ordering::Release);
                Ok(false)
            }
            other => Err(WardenError::InvalidState(format!(
                "worker {} cannot be destroyed from {other:?}",
                self.id
            ))),
        }
    }

    /// Runs `onDestroy` and transitions to `destroyed`. Errors are logged
    /// and swallowed (§7).
    pub async fn finish_destroy(&self, info: DestroyInfo) {
        if let Err(err) = self.handler.on_destroy(info).await {
            tracing::warn!(worker = %self.id, error = %err, "onDestroy rejected; ignoring");
        }
        self.set_state(WorkerState::Destroyed);
    }

    pub async fn ask(&self, method: &str, data: Value) -> Result<Value> {
        self.handler.on_ask(method, data).await
    }

    pub async fn tell(&self, method: &str, data: Value) {
        self.handler.on_tell(method, data).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct EchoHandler {
        created: Mutex<Vec<CreateCause>>,
    }

    #[async_trait]
    impl WorkerHandler for EchoHandler {
        async fn on_create(&self, info: CreateInfo) -> Result<()> {
            self.created.lock().unwrap().push(info.cause);
            Ok(())
        }

        async fn on_ask(&self, method: &str, data: Value) -> Result<Value> {
            Ok(serde_json::json!({ "echo": method, "data": data }))
        }

        async fn on_tell(&self, _method: &str, _data: Value) {}
    }

    fn handler() -> Arc<EchoHandler> {
        Arc::new(EchoHandler { created: Mutex::new(Vec::new()) })
    }

    #[tokio::test]
    async fn activation_sequence_reaches_active() {
        let worker = Worker::new(WorkerId::new("MyWorker#1"), WorkerAttributes::new(), handler());
        assert_eq!(worker.state(), WorkerState::Inactive);
        let pending = worker.activate(CreateInfo { cause: CreateCause::New }).await.unwrap();
        assert!(!pending);
        assert_eq!(worker.state(), WorkerState::Active);
    }

    #[tokio::test]
    async fn destroy_while_activating_is_deferred() {
        let h = handler();
        let worker = Worker::new(WorkerId::new("MyWorker#1"), WorkerAttributes::new(), h);
        // Simulate mid-activation by driving the transition by hand.
        worker.transition(WorkerState::Inactive, WorkerState::Activating).unwrap();
        let deferred = worker.request_destroy().unwrap();
        assert!(!deferred);
        worker.transition(WorkerState::Activating, WorkerState::Active).unwrap();
        assert!(worker.pending_destroy.load(Ordering::Acquire));
    }

    #[test]
    fn set_load_rejects_negative_values() {
        let worker = Worker::new(WorkerId::new("w"), WorkerAttributes::new(), handler());
        assert!(worker.set_load(-1).is_err());
    }

    #[tokio::test]
    async fn set_load_rejects_on_destroyed_worker() {
        let worker = Worker::new(WorkerId::new("w"), WorkerAttributes::new(), handler());
        worker.activate(CreateInfo { cause: CreateCause::New }).await.unwrap();
        worker.request_destroy().unwrap();
        worker.finish_destroy(DestroyInfo { cause: DestroyCause::System }).await;
        assert!(worker.set_load(5).is_err());
    }

    #[test]
    fn set_load_reports_no_change_when_value_is_the_same() {
        let worker = Worker::new(WorkerId::new("w"), WorkerAttributes::new(), handler());
        assert_eq!(worker.set_load(0).unwrap(), None);
        assert_eq!(worker.set_load(3).unwrap(), Some(3));
        assert_eq!(worker.set_load(3).unwrap(), None);
    }
}
