use std::sync::Weak;

use async_trait::async_trait;
use serde_json::Value;
use warden_types::{BrokerId, Result, WardenError, WorkerId};

/// What an `Agent` needs from its owning broker: location-transparent
/// ask/tell funneled through the broker's RPC machinery (§4.4.5). Kept as
/// a trait so this crate need not depend on `warden-broker` — per the
/// design notes' arena-style ownership (§9), the broker owns workers by
/// identifier and a handle refers back to it through this trait object
/// rather than a raw reference.
#[async_trait]
pub trait AgentRouter: Send + Sync {
    async fn ask(&self, worker: &WorkerId, method: &str, data: Value) -> Result<Value>;
    async fn tell(&self, worker: &WorkerId, method: &str, data: Value) -> Result<()>;
}

/// A location-transparent handle to a worker: `{workerId, broker}` plus
/// `ask`/`tell`. Becomes unusable once the owning broker is destroyed —
/// the `Weak` upgrade then fails and both calls return `Unreachable`.
#[derive(Clone)]
pub struct Agent {
    worker_id: WorkerId,
    broker_id: BrokerId,
    router: Weak<dyn AgentRouter>,
}

impl Agent {
    pub fn new(worker_id: WorkerId, broker_id: BrokerId, router: Weak<dyn AgentRouter>) -> Self {
        Self {
            worker_id,
            broker_id,
            router,
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub fn broker_id(&self) -> &BrokerId {
        &self.broker_id
    }

    fn router(&self) -> Result<std::sync::Arc<dyn AgentRouter>> {
        self.router
            .upgrade()
            .ok_or_else(|| WardenError::Unreachable(format!("broker {} is gone", self.broker_id)))
    }

    pub async fn ask(&self, method: &str, data: Value) -> Result<Value> {
        self.router()?.ask(&self.worker_id, method, data).await
    }

    pub async fn tell(&self, method: &str, data: Value) -> Result<()> {
        self.router()?.tell(&self.worker_id, method, data).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct StubRouter;

    #[async_trait]
    impl AgentRouter for StubRouter {
        async fn ask(&self, _worker: &WorkerId, method: &str, _data: Value) -> Result<Value> {
            Ok(Value::String(method.to_string()))
        }

        async fn tell(&self, _worker: &WorkerId, _method: &str, _data: Value) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn ask_reaches_the_router_while_it_is_alive() {
        let router: Arc<dyn AgentRouter> = Arc::new(StubRouter);
        let agent = Agent::new(WorkerId::new("w"), BrokerId::new("br01"), Arc::downgrade(&router));
        let result = agent.ask("ping", Value::Null).await.unwrap();
        assert_eq!(result, Value::String("ping".to_string()));
    }

    #[tokio::test]
    async fn agent_is_unreachable_once_the_broker_is_gone() {
        let router: Arc<dyn AgentRouter> = Arc::new(StubRouter);
        let weak = Arc::downgrade(&router);
        drop(router);
        let agent = Agent::new(WorkerId::new("w"), BrokerId::new("br01"), weak);
        assert!(agent.ask("ping", Value::Null).await.is_err());
        assert!(agent.tell("ping", Value::Null).await.is_err());
    }
}
