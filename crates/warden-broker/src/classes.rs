use std::collections::HashMap;
use std::sync::Arc;

use warden_types::{ClusterName, Result, WardenError, WorkerAttributes};
use warden_worker::WorkerHandler;

/// Constructs a fresh application handler for one worker class. Mirrors
/// §4.4.2's "registry of class constructors keyed by class name": names
/// may be supplied explicitly at registration, inherited from a class's
/// declared name, or defaulted, but the core only ever dispatches by the
/// resulting string key — no reflective lookup.
pub trait WorkerFactory: Send + Sync {
    fn create(&self, attributes: &WorkerAttributes) -> Arc<dyn WorkerHandler>;
}

impl<F> WorkerFactory for F
where
    F: Fn(&WorkerAttributes) -> Arc<dyn WorkerHandler> + Send + Sync,
{
    fn create(&self, attributes: &WorkerAttributes) -> Arc<dyn WorkerHandler> {
        (self)(attributes)
    }
}

/// A registered class: its constructor plus the cluster it's restricted
/// to (placement queries for this class only ever consult that cluster's
/// `cz`/`bz`). `agent_kind` carries §4.4.2's "a worker class may declare
/// an optional custom Agent class" — the core has no reflective dispatch
/// to instantiate a different `Agent` type, so this is surfaced as a
/// label an embedder can match on instead.
pub struct ClassRegistration {
    pub factory: Arc<dyn WorkerFactory>,
    pub cluster: ClusterName,
    pub agent_kind: Option<String>,
}

/// The broker's class registry (§4.4.2), keyed by class name.
#[derive(Default)]
pub struct ClassRegistry {
    classes: HashMap<String, ClassRegistration>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        cluster: ClusterName,
        factory: Arc<dyn WorkerFactory>,
    ) {
        self.classes.insert(
            name.into(),
            ClassRegistration {
                factory,
                cluster,
                agent_kind: None,
            },
        );
    }

    pub fn register_with_agent_kind(
        &mut self,
        name: impl Into<String>,
        cluster: ClusterName,
        factory: Arc<dyn WorkerFactory>,
        agent_kind: impl Into<String>,
    ) {
        self.classes.insert(
            name.into(),
            ClassRegistration {
                factory,
                cluster,
                agent_kind: Some(agent_kind.into()),
            },
        );
    }

    pub fn get(&self, name: &str) -> Result<&ClassRegistration> {
        self.classes
            .get(name)
            .ok_or_else(|| WardenError::NotFound(format!("no registered worker class {name}")))
    }
}
