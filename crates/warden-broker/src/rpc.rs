use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use tokio::sync::oneshot;
use warden_types::{Result, WardenError};

/// Per-broker RPC correlation (§3 "In-broker state"): a lookup from
/// sequence number to waiter, plus a time-ordered list used to sweep
/// timeouts without scanning the whole map every tick.
#[derive(Default)]
pub struct RpcTable {
    waiters: HashMap<u64, oneshot::Sender<Result<serde_json::Value>>>,
    order: VecDeque<(u64, Instant)>,
}

impl RpcTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter for `seq`, returning the receiver half the
    /// caller awaits on.
    pub fn register(&mut self, seq: u64) -> oneshot::Receiver<Result<serde_json::Value>> {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(seq, tx);
        self.order.push_back((seq, Instant::now()));
        rx
    }

    /// Resolves a waiter on response arrival (§4.4.5); a `seq` with no
    /// registered waiter (already timed out, or a stray response) is
    /// dropped silently.
    pub fn complete(&mut self, seq: u64, result: Result<serde_json::Value>) {
        if let Some(tx) = self.waiters.remove(&seq) {
            let _ = tx.send(result);
        }
    }

    /// Fails every waiter whose registration is older than `timeout`
    /// (§4.4.6's 1-second tick). Entries are popped off the front of the
    /// time-ordered queue since it's insertion-ordered and insertion order
    /// equals age order. Returns how many waiters were timed out, so the
    /// caller can report it.
    pub fn sweep_timeouts(&mut self, timeout: std::time::Duration) -> usize {
        let now = Instant::now();
        let mut timed_out = 0;
        while let Some(&(seq, registered_at)) = self.order.front() {
            if now.duration_since(registered_at) <= timeout {
                break;
            }
            self.order.pop_front();
            if let Some(tx) = self.waiters.remove(&seq) {
                let _ = tx.send(Err(WardenError::Timeout(timeout)));
                timed_out += 1;
            }
        }
        timed_out
    }

    /// Fails every outstanding waiter immediately; used on broker destroy
    /// (§5 "destroy cancels the periodic timer synchronously; pending RPC
    /// waiters are dropped").
    pub fn fail_all(&mut self) {
        self.order.clear();
        for (_, tx) in self.waiters.drain() {
            let _ = tx.send(Err(WardenError::Unreachable("broker destroyed".to_string())));
        }
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn complete_resolves_the_matching_waiter() {
        let mut table = RpcTable::new();
        let rx = table.register(1);
        table.complete(1, Ok(serde_json::json!({"res": true})));
        let result = rx.await.unwrap().unwrap();
        assert_eq!(result, serde_json::json!({"res": true}));
    }

    #[tokio::test]
    async fn sweep_times_out_stale_waiters_only() {
        let mut table = RpcTable::new();
        let old = table.register(1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let fresh = table.register(2);

        let timed_out = table.sweep_timeouts(Duration::from_millis(10));

        assert_eq!(timed_out, 1);
        assert!(old.await.unwrap().is_err());
        assert_eq!(table.len(), 1);
        table.complete(2, Ok(serde_json::Value::Null));
        assert!(fresh.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn fail_all_resolves_every_waiter() {
        let mut table = RpcTable::new();
        let a = table.register(1);
        let b = table.register(2);
        table.fail_all();
        assert!(a.await.unwrap().is_err());
        assert!(b.await.unwrap().is_err());
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn response_with_no_waiter_is_dropped_silently() {
        let mut table = RpcTable::new();
        table.complete(42, Ok(serde_json::Value::Null));
        assert!(table.is_empty());
    }
}
