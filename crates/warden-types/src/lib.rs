//! Shared data model for the distributed worker runtime: identifiers,
//! registry records, the peer wire envelope, pubsub signals, and the error
//! taxonomy. Kept dependency-free (beyond serde) so every other crate in
//! the workspace can depend on it without pulling in I/O.

pub mod counters;
pub mod error;
pub mod ids;
pub mod records;
pub mod wire;

pub use counters::GlobalCounters;
pub use error::{Result, WardenError};
pub use ids::{BrokerId, ClusterName, WorkerId};
pub use records::{
    BrokerRecord, BrokerStatus, CreateCause, DestroyCause, RecoverableWorker, WorkerAttributes,
    WorkerRecord,
};
pub use wire::{CreateWorkerRequest, Envelope, RemoteError, ResponsePayload, Signal};
