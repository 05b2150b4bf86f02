//! `RegistryClient` (§6): the external interface the core requires of the
//! shared key/value store, the eight atomic scripts (§4.3) it evaluates
//! over that client, and two implementations — a Redis-backed client for
//! production and an in-memory `FakeRegistry` reference double for tests.

pub mod client;
pub mod fake;
pub mod keys;
pub mod redis_client;
pub mod scripts;
pub mod value;

pub use client::{PubsubMessage, RegistryClient};
pub use fake::FakeRegistry;
pub use keys::KeyNames;
pub use redis_client::RedisRegistryClient;
pub use scripts::ScriptId;
pub use value::RegistryValue;
