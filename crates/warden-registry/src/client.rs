use async_trait::async_trait;
use tokio::sync::mpsc;
use warden_types::Result;

use crate::scripts::ScriptId;
use crate::value::RegistryValue;

/// A message delivered to a subscriber: the channel it arrived on and the
/// raw payload (empty for a liveness probe, JSON-encoded for a signal).
#[derive(Clone, Debug)]
pub struct PubsubMessage {
    pub channel: String,
    pub payload: Vec<u8>,
}

/// What the core requires of a registry client (§6): script evaluation by
/// content, a handful of administrative hash/sorted-set operations, publish
/// with a subscriber count, subscribe, and the server's wall clock.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Primes the script cache; called once at broker start (§4.4.1). A
    /// client that evaluates by source on every call may treat this as a
    /// no-op.
    async fn load_scripts(&self) -> Result<()>;

    async fn eval(&self, script: ScriptId, keys: &[String], args: &[String]) -> Result<RegistryValue>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;
    async fn hdel(&self, key: &str, field: &str) -> Result<()>;

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<()>;
    async fn zrem(&self, key: &str, member: &str) -> Result<()>;

    /// Returns the number of current subscribers who received the message,
    /// matching the "publish returns the subscriber count" contract used by
    /// the scripts' own liveness probes.
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<i64>;

    async fn subscribe(&self, channels: &[String]) -> Result<mpsc::UnboundedReceiver<PubsubMessage>>;

    /// Server wall clock as `(seconds, microseconds)`.
    async fn time(&self) -> Result<(i64, i64)>;
}
