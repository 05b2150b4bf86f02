use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// `gh` — the protocol §3: global counters and configuration. `ch_prefix` is
/// required; everything else is an optional numeric counter, including one
/// per-class creation counter keyed by class name (hence the open `extra`
/// map rather than a fixed field list).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalCounters {
    pub ch_prefix: String,
    pub workers_created: i64,
    pub workers_recovered: i64,
    pub workers_salvaged: i64,
    pub workers_removed: i64,
    pub workers_broken: i64,
    pub brokers_added: i64,
    pub brokers_broken: i64,
    /// Per-class creation counters, keyed by class name (`gh[class]` in
    /// dynamic id derivation).
    #[serde(flatten)]
    pub per_class: HashMap<String, i64>,
}

impl GlobalCounters {
    pub fn class_counter(&self, class: &str) -> i64 {
        self.per_class.get(class).copied().unwrap_or(0)
    }

    /// Builds a snapshot from `gh`'s individual hash fields (as read via
    /// `HGETALL`), since `gh` is a plain registry hash rather than a single
    /// serialized blob.
    pub fn from_fields(fields: &HashMap<String, String>) -> Self {
        let parse = |name: &str| fields.get(name).and_then(|v| v.parse::<i64>().ok()).unwrap_or(0);
        let known = [
            "chPrefix",
            "workersCreated",
            "workersRecovered",
            "workersSalvaged",
            "workersRemoved",
            "workersBroken",
            "brokersAdded",
            "brokersBroken",
        ];
        let per_class = fields
            .iter()
            .filter(|(k, _)| !known.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.parse::<i64>().unwrap_or(0)))
            .collect();
        Self {
            ch_prefix: fields.get("chPrefix").cloned().unwrap_or_default(),
            workers_created: parse("workersCreated"),
            workers_recovered: parse("workersRecovered"),
            workers_salvaged: parse("workersSalvaged"),
            workers_removed: parse("workersRemoved"),
            workers_broken: parse("workersBroken"),
            brokers_added: parse("brokersAdded"),
            brokers_broken: parse("brokersBroken"),
            per_class,
        }
    }
}
