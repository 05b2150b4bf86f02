//! The broker runtime (§4.4): lifecycle, placement, wire dispatch, failure
//! detection and recovery, built on top of a [`warden_registry::RegistryClient`]
//! and a [`warden_transport::Router`].

pub mod broker;
pub mod classes;
pub mod clock;
pub mod metrics;
pub mod registry_ops;
pub mod rpc;
pub mod state;

pub use broker::{Broker, BrokerDestroyOption};
pub use classes::{ClassRegistration, ClassRegistry, WorkerFactory};
pub use clock::ClockSync;
pub use metrics::Metrics;
pub use rpc::RpcTable;
pub use state::{BrokerState, SharedBrokerState};
