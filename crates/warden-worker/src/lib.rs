//! The `Worker`/`Agent` contract (§4.5): a long-lived, addressable actor
//! owned by exactly one broker at a time, reachable only through its
//! location-transparent `Agent` handle. Deliberately free of any
//! dependency on `warden-broker` — the broker refers back to a worker by
//! value, and an `Agent` refers back to its broker through the
//! `AgentRouter` trait object, matching the arena-style ownership split
//! from the design notes (§9).

pub mod agent;
pub mod worker;

pub use agent::{Agent, AgentRouter};
pub use worker::{CreateInfo, DestroyInfo, Worker, WorkerHandler, WorkerState};
