//! A pure-Rust reference implementation of the eight scripts, evaluated
//! against plain in-memory maps instead of Lua against Redis. Lets
//! property tests and broker unit tests run without a live registry, while
//! staying faithful to the exact same algorithms (§4.3).

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;
use warden_types::{BrokerRecord, BrokerStatus, Result, WorkerRecord};

use crate::client::{PubsubMessage, RegistryClient};
use crate::scripts::ScriptId;
use crate::value::RegistryValue;

#[derive(Default)]
struct Inner {
    gh: HashMap<String, String>,
    wh: HashMap<String, String>,
    bh: HashMap<String, String>,
    zsets: HashMap<String, Vec<(String, f64)>>,
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<PubsubMessage>>>,
}

impl Inner {
    fn zscore(&self, key: &str, member: &str) -> Option<f64> {
        self.zsets
            .get(key)
            .and_then(|members| members.iter().find(|(m, _)| m == member))
            .map(|(_, s)| *s)
    }

    fn zadd(&mut self, key: &str, member: &str, score: f64) {
        let set = self.zsets.entry(key.to_string()).or_default();
        if let Some(entry) = set.iter_mut().find(|(m, _)| m == member) {
            entry.1 = score;
        } else {
            set.push((member.to_string(), score));
        }
    }

    fn zrem(&mut self, key: &str, member: &str) {
        if let Some(set) = self.zsets.get_mut(key) {
            set.retain(|(m, _)| m != member);
        }
    }

    /// Members in ascending score order, ties broken by member name (the
    /// behavior a Redis sorted set gives for equal scores).
    fn zrange(&self, key: &str) -> Vec<(String, f64)> {
        let mut set = self.zsets.get(key).cloned().unwrap_or_default();
        set.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap().then_with(|| a.0.cmp(&b.0)));
        set
    }

    fn zcard(&self, key: &str) -> usize {
        self.zsets.get(key).map(|s| s.len()).unwrap_or(0)
    }

    fn hincrby(&mut self, key: &str, field: &str, delta: i64) -> i64 {
        let hash = self.gh_like(key);
        let current = hash.get(field).and_then(|v| v.parse::<i64>().ok()).unwrap_or(0);
        let next = current + delta;
        hash.insert(field.to_string(), next.to_string());
        next
    }

    fn gh_like(&mut self, key: &str) -> &mut HashMap<String, String> {
        // `gh` is the only plain hash scripts increment/read by field name;
        // keyed here generically so a future per-namespace gh still works.
        self.gh_store(key)
    }

    fn gh_store(&mut self, _key: &str) -> &mut HashMap<String, String> {
        &mut self.gh
    }

    fn publish(&self, channel: &str, payload: &[u8]) -> i64 {
        match self.subscribers.get(channel) {
            Some(subs) => {
                let mut delivered = 0;
                for sub in subs {
                    if sub
                        .send(PubsubMessage {
                            channel: channel.to_string(),
                            payload: payload.to_vec(),
                        })
                        .is_ok()
                    {
                        delivered += 1;
                    }
                }
                delivered
            }
            None => 0,
        }
    }

    fn ch_prefix(&self) -> String {
        self.gh.get("chPrefix").cloned().unwrap_or_default()
    }

    /// Drains every worker owned by `wz_key`, salvaging recoverable records
    /// into `rz_key` (unless `force_discard`) and deleting the rest. Shared
    /// by `join`'s stale-entry handling and the `salvage` script.
    fn salvage_drain(&mut self, wz_key: &str, rz_key: &str, force_discard: bool) {
        for (wid, score) in self.zrange(wz_key) {
            let Some(raw) = self.wh.get(&wid).cloned() else {
                continue;
            };
            match serde_json::from_str::<WorkerRecord>(&raw) {
                Ok(mut rec) if rec.attributes.recoverable() && !force_discard => {
                    rec.broker_id = None;
                    self.wh.insert(wid.clone(), serde_json::to_string(&rec).unwrap());
                    self.zadd(rz_key, &wid, score);
                    self.hincrby("gh", "workersSalvaged", 1);
                }
                Ok(_) => {
                    self.wh.remove(&wid);
                    self.hincrby("gh", "workersRemoved", 1);
                }
                Err(_) => {
                    self.wh.remove(&wid);
                    self.hincrby("gh", "workersBroken", 1);
                }
            }
        }
    }

    fn join(&mut self, keys: &[String], args: &[String]) -> RegistryValue {
        let (gh, bh, cz, bz, wz, _wh, rz) = (&keys[0], &keys[1], &keys[2], &keys[3], &keys[4], &keys[5], &keys[6]);
        let (broker_id, ch_prefix, load, cluster, addr, hash_key) =
            (&args[0], &args[1], &args[2], &args[3], &args[4], &args[5]);
        let _ = gh;

        self.gh.insert("chPrefix".to_string(), ch_prefix.clone());

        if let Some(existing) = self.bh.get(broker_id).cloned() {
            if serde_json::from_str::<BrokerRecord>(&existing).is_ok() {
                self.salvage_drain(wz, rz, false);
            } else {
                self.hincrby("gh", "brokersBroken", 1);
            }
        }

        self.zsets.remove(wz);

        let record = BrokerRecord {
            cn: cluster.as_str().into(),
            st: BrokerStatus::Active,
            addr: addr.clone(),
        };
        self.bh
            .insert(broker_id.clone(), serde_json::to_string(&record).unwrap());
        let load_score: f64 = load.parse().unwrap_or(0.0);
        let hash_score: f64 = hash_key.parse().unwrap_or(0.0);
        self.zadd(cz, broker_id, load_score);
        self.zadd(bz, broker_id, hash_score);
        self.hincrby("gh", "brokersAdded", 1);

        if self.zcard(rz) > 0 {
            let prefix = self.ch_prefix();
            self.publish(&format!("{prefix}:*"), &json!({ "sig": "recover" }).to_string().into_bytes());
        }

        RegistryValue::Array(vec![RegistryValue::Int(0)])
    }

    fn pick_broker(&mut self, keys: &[String], args: &[String]) -> RegistryValue {
        let (cz, bh) = (&keys[1], &keys[2]);
        let (cluster, max_retries) = (&args[0], args[1].parse::<u32>().unwrap_or(100));
        let prefix = self.ch_prefix();

        for _ in 0..max_retries {
            let top = self.zrange(cz);
            let Some((candidate, _)) = top.into_iter().next() else {
                return RegistryValue::Array(vec![RegistryValue::Int(1)]);
            };

            let Some(raw) = self.bh.get(&candidate).cloned() else {
                self.hincrby("gh", "brokersBroken", 1);
                self.zrem(cz, &candidate);
                continue;
            };
            let Ok(mut record) = serde_json::from_str::<BrokerRecord>(&raw) else {
                self.hincrby("gh", "brokersBroken", 1);
                self.zrem(cz, &candidate);
                continue;
            };
            if !record.is_active() {
                self.zrem(cz, &candidate);
                continue;
            }

            let subs = self.publish(&format!("{prefix}:{candidate}"), &[]);
            if subs >= 1 {
                return RegistryValue::Array(vec![
                    RegistryValue::Int(0),
                    RegistryValue::Bulk(candidate),
                    RegistryValue::Bulk(record.cn.as_str().to_string()),
                    RegistryValue::Bulk(record.addr.clone()),
                ]);
            }
            record.st = BrokerStatus::Invalid;
            self.bh.insert(candidate.clone(), serde_json::to_string(&record).unwrap());
            self.publish(
                &format!("{prefix}:*"),
                &json!({ "sig": "salvage", "clustername": cluster, "brokerId": candidate }).to_string().into_bytes(),
            );
            self.zrem(cz, &candidate);
        }
        RegistryValue::Array(vec![RegistryValue::Int(1)])
    }

    fn find_or_create(&mut self, keys: &[String], args: &[String]) -> RegistryValue {
        let (wh, bh, wz, rz) = (&keys[1], &keys[2], &keys[3], &keys[4]);
        let broker_id = &args[0];
        let name = &args[1];
        let mut worker_id = args[2].clone();
        let attributes_json = &args[3];
        let now: f64 = args[4].parse().unwrap_or(0.0);
        let ttl: f64 = args[5].parse().unwrap_or(0.0);
        let for_recovery = args[6] == "1";
        let create_mode = !broker_id.is_empty();
        let prefix = self.ch_prefix();

        let probe_alive = |this: &mut Self, target: &str| this.publish(&format!("{prefix}:{target}"), &[]) >= 1;

        if worker_id.is_empty() && create_mode {
            let attrs: serde_json::Value = serde_json::from_str(attributes_json).unwrap_or_default();
            if attrs.get("static").and_then(|v| v.as_bool()).unwrap_or(false) {
                worker_id = name.clone();
            } else {
                let n = self.hincrby("gh", name, 1);
                worker_id = format!("{name}#{n}");
            }
        }

        let do_create = |this: &mut Self| -> RegistryValue {
            if !create_mode {
                return RegistryValue::Array(vec![RegistryValue::Int(0), RegistryValue::Int(0)]);
            }
            let attrs: serde_json::Value = serde_json::from_str(attributes_json).unwrap_or_default();
            let record = json!({ "name": name, "brokerId": broker_id, "attributes": attrs });
            this.wh.insert(worker_id.clone(), record.to_string());
            this.zadd(wz, &worker_id, now);
            if for_recovery {
                this.hincrby("gh", "workersRecovered", 1);
            } else {
                this.hincrby("gh", "workersCreated", 1);
            }
            RegistryValue::Array(vec![
                RegistryValue::Int(0),
                RegistryValue::Array(vec![
                    RegistryValue::Bulk(broker_id.clone()),
                    RegistryValue::Bulk(name.clone()),
                    RegistryValue::Bulk(worker_id.clone()),
                ]),
            ])
        };

        let Some(raw) = self.wh.get(&worker_id).cloned() else {
            return do_create(self);
        };
        let Ok(mut rec) = serde_json::from_str::<WorkerRecord>(&raw) else {
            self.hincrby("gh", "workersBroken", 1);
            return do_create(self);
        };

        if let Some(owner) = rec.broker_id.clone() {
            let Some(brec_raw) = self.bh.get(owner.as_str()).cloned() else {
                self.hincrby("gh", "brokersBroken", 1);
                return do_create(self);
            };
            let Ok(mut brec) = serde_json::from_str::<BrokerRecord>(&brec_raw) else {
                self.bh.remove(owner.as_str());
                self.hincrby("gh", "brokersBroken", 1);
                return do_create(self);
            };
            if probe_alive(self, owner.as_str()) {
                return RegistryValue::Array(vec![
                    RegistryValue::Int(0),
                    RegistryValue::Array(vec![
                        RegistryValue::Bulk(owner.as_str().to_string()),
                        RegistryValue::Bulk(rec.name.clone()),
                        RegistryValue::Bulk(worker_id.clone()),
                    ]),
                ]);
            }
            brec.st = BrokerStatus::Invalid;
            self.bh.insert(owner.as_str().to_string(), serde_json::to_string(&brec).unwrap());
            let prefix = self.ch_prefix();
            self.publish(
                &format!("{prefix}:*"),
                &json!({ "sig": "salvage", "clustername": brec.cn, "brokerId": owner }).to_string().into_bytes(),
            );
            return RegistryValue::Array(vec![RegistryValue::Int(1)]);
        }

        if !create_mode {
            return RegistryValue::Array(vec![RegistryValue::Int(1)]);
        }

        if let Some(rscore) = self.zscore(rz, &worker_id) {
            let within_ttl = ttl == 0.0 || (now - rscore) <= ttl;
            if within_ttl {
                rec.broker_id = Some(broker_id.as_str().into());
                self.wh.insert(worker_id.clone(), serde_json::to_string(&rec).unwrap());
                self.zadd(wz, &worker_id, rscore);
                self.zrem(rz, &worker_id);
                self.hincrby("gh", "workersRecovered", 1);
                return RegistryValue::Array(vec![
                    RegistryValue::Int(0),
                    RegistryValue::Array(vec![
                        RegistryValue::Bulk(broker_id.clone()),
                        RegistryValue::Bulk(rec.name.clone()),
                        RegistryValue::Bulk(worker_id.clone()),
                    ]),
                ]);
            }
        }
        do_create(self)
    }

    fn find_broker(&mut self, keys: &[String], args: &[String]) -> RegistryValue {
        let (wh, bh) = (&keys[1], &keys[2]);
        let worker_id = &args[1];
        let prefix = self.ch_prefix();

        let Some(raw) = self.wh.get(worker_id).cloned() else {
            return RegistryValue::Array(vec![RegistryValue::Int(1)]);
        };
        let _ = wh;
        let Ok(mut rec) = serde_json::from_str::<WorkerRecord>(&raw) else {
            return RegistryValue::Array(vec![RegistryValue::Int(1)]);
        };
        let Some(owner) = rec.broker_id.clone() else {
            return RegistryValue::Array(vec![RegistryValue::Int(1)]);
        };
        let Some(brec_raw) = self.bh.get(owner.as_str()).cloned() else {
            return RegistryValue::Array(vec![RegistryValue::Int(1)]);
        };
        let Ok(mut brec) = serde_json::from_str::<BrokerRecord>(&brec_raw) else {
            return RegistryValue::Array(vec![RegistryValue::Int(1)]);
        };
        let _ = bh;

        let subs = self.publish(&format!("{prefix}:{}", owner.as_str()), &[]);
        if subs >= 1 {
            return RegistryValue::Array(vec![
                RegistryValue::Int(0),
                RegistryValue::Array(vec![
                    RegistryValue::Bulk(owner.as_str().to_string()),
                    RegistryValue::Bulk(brec.cn.as_str().to_string()),
                    RegistryValue::Bulk(if brec.is_active() { "active".into() } else { "invalid".into() }),
                    RegistryValue::Bulk(brec.addr.clone()),
                ]),
            ]);
        }

        brec.st = BrokerStatus::Invalid;
        self.bh.insert(owner.as_str().to_string(), serde_json::to_string(&brec).unwrap());
        rec.broker_id = None;
        self.wh.insert(worker_id.clone(), serde_json::to_string(&rec).unwrap());
        self.publish(
            &format!("{prefix}:*"),
            &json!({ "sig": "salvage", "clustername": brec.cn, "brokerId": owner }).to_string().into_bytes(),
        );
        RegistryValue::Array(vec![RegistryValue::Int(2), RegistryValue::Bulk(owner.as_str().to_string())])
    }

    fn health_check(&mut self, keys: &[String], args: &[String]) -> RegistryValue {
        let (bh, cz, bz) = (&keys[1], &keys[2], &keys[3]);
        let self_broker = &args[0];
        let prefix = self.ch_prefix();

        let ring = self.zrange(bz);
        let size = ring.len();
        if size <= 1 {
            return RegistryValue::Array(vec![RegistryValue::Int(0)]);
        }
        let Some(self_rank) = ring.iter().position(|(id, _)| id == self_broker) else {
            return RegistryValue::Array(vec![RegistryValue::Int(0)]);
        };
        let next_broker = ring[(self_rank + 1) % size].0.clone();

        let Some(raw) = self.bh.get(&next_broker).cloned() else {
            self.zrem(cz, &next_broker);
            self.zrem(bz, &next_broker);
            return RegistryValue::Array(vec![
                RegistryValue::Int(2),
                RegistryValue::Bulk("next broker record missing".to_string()),
            ]);
        };
        let Ok(mut record) = serde_json::from_str::<BrokerRecord>(&raw) else {
            self.bh.remove(&next_broker);
            self.zrem(cz, &next_broker);
            self.zrem(bz, &next_broker);
            return RegistryValue::Array(vec![
                RegistryValue::Int(2),
                RegistryValue::Bulk("next broker record corrupt".to_string()),
            ]);
        };
        let _ = bh;

        if !record.is_active() {
            return RegistryValue::Array(vec![RegistryValue::Int(0)]);
        }

        let subs = self.publish(&format!("{prefix}:{next_broker}"), &[]);
        if subs >= 1 {
            return RegistryValue::Array(vec![RegistryValue::Int(0)]);
        }

        record.st = BrokerStatus::Invalid;
        self.bh.insert(next_broker.clone(), serde_json::to_string(&record).unwrap());
        self.zrem(cz, &next_broker);
        self.zrem(bz, &next_broker);
        self.publish(
            &format!("{prefix}:*"),
            &json!({ "sig": "salvage", "clustername": record.cn, "brokerId": next_broker }).to_string().into_bytes(),
        );
        RegistryValue::Array(vec![RegistryValue::Int(1)])
    }

    fn salvage(&mut self, keys: &[String], args: &[String]) -> RegistryValue {
        let (bh, cz, bz, wz, rz) = (&keys[2], &keys[3], &keys[4], &keys[5], &keys[6]);
        let target = &args[0];
        let mode = args[1].as_str();

        if mode == "0" {
            match self.bh.get(target).and_then(|raw| serde_json::from_str::<BrokerRecord>(raw).ok()) {
                Some(record) if record.st == BrokerStatus::Invalid => {}
                _ => return RegistryValue::Array(vec![RegistryValue::Int(0)]),
            }
        }

        self.salvage_drain(wz, rz, mode == "2");

        self.bh.remove(target);
        self.zrem(cz, target);
        self.zrem(bz, target);
        if mode == "2" {
            self.zsets.remove(wz);
        }
        let _ = bh;

        if self.zcard(rz) > 0 {
            let prefix = self.ch_prefix();
            self.publish(&format!("{prefix}:*"), &json!({ "sig": "recover" }).to_string().into_bytes());
        }

        RegistryValue::Array(vec![RegistryValue::Int(0)])
    }

    fn fetch_for_recovery(&mut self, keys: &[String], args: &[String]) -> RegistryValue {
        let rz = &keys[1];
        let now: f64 = args[0].parse().unwrap_or(0.0);
        let ttl: f64 = args[1].parse().unwrap_or(0.0);
        let max_fetch: usize = args[2].parse().unwrap_or(0);

        let candidates: Vec<_> = self.zrange(rz).into_iter().take(max_fetch).collect();
        let mut results = Vec::new();
        for (wid, score) in candidates {
            self.zrem(rz, &wid);
            if let Some(raw) = self.wh.get(&wid).cloned() {
                if let Ok(rec) = serde_json::from_str::<WorkerRecord>(&raw) {
                    if rec.attributes.recoverable() {
                        let within_ttl = ttl == 0.0 || (now - score) <= ttl;
                        if within_ttl {
                            let out = json!({
                                "id": wid,
                                "name": rec.name,
                                "attributes": rec.attributes,
                                "createdAtMs": score,
                            });
                            results.push(RegistryValue::Bulk(out.to_string()));
                        }
                    }
                }
            }
        }
        let remaining = self.zcard(rz) as i64;
        RegistryValue::Array(vec![RegistryValue::Array(results), RegistryValue::Int(remaining)])
    }

    fn destroy_worker(&mut self, keys: &[String], args: &[String]) -> RegistryValue {
        let (wz, rz) = (&keys[1], &keys[2]);
        let worker_id = &args[0];
        let mode = args[1].as_str();

        if let Some(raw) = self.wh.get(worker_id).cloned() {
            let decoded = serde_json::from_str::<WorkerRecord>(&raw);
            match decoded {
                Ok(rec) if mode == "1" && rec.attributes.recoverable() && rec.broker_id.is_some() => {
                    let score = self.zscore(wz, worker_id).unwrap_or(0.0);
                    let mut rec = rec;
                    rec.broker_id = None;
                    self.wh.insert(worker_id.clone(), serde_json::to_string(&rec).unwrap());
                    self.zadd(rz, worker_id, score);
                }
                _ => {
                    self.wh.remove(worker_id);
                }
            }
        }
        self.zrem(wz, worker_id);

        if self.zcard(rz) > 0 {
            let prefix = self.ch_prefix();
            self.publish(&format!("{prefix}:*"), &json!({ "sig": "recover" }).to_string().into_bytes());
        }

        RegistryValue::Array(vec![RegistryValue::Int(0)])
    }
}

/// In-memory double of the registry, implementing the eight scripts as
/// plain Rust against `HashMap`/`Vec`-backed hashes and sorted sets rather
/// than Lua against Redis.
#[derive(Default)]
pub struct FakeRegistry {
    inner: Mutex<Inner>,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of `gh` for assertions in tests.
    pub fn global_counters(&self) -> warden_types::GlobalCounters {
        let inner = self.inner.lock().unwrap();
        warden_types::GlobalCounters::from_fields(&inner.gh)
    }

    pub fn zset_members(&self, key: &str) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner.zrange(key).into_iter().map(|(m, _)| m).collect()
    }

    pub fn zscore_of(&self, key: &str, member: &str) -> Option<f64> {
        self.inner.lock().unwrap().zscore(key, member)
    }

    /// Decoded `wh[worker_id].brokerId`, or `None` if the record is absent,
    /// corrupt, or under migration. Used by invariant checks in property
    /// tests rather than broker runtime code.
    pub fn worker_owner(&self, worker_id: &str) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        let raw = inner.wh.get(worker_id)?;
        let rec: WorkerRecord = serde_json::from_str(raw).ok()?;
        rec.broker_id.map(|b| b.as_str().to_string())
    }

    pub fn worker_exists(&self, worker_id: &str) -> bool {
        self.inner.lock().unwrap().wh.contains_key(worker_id)
    }

    pub fn broker_status(&self, broker_id: &str) -> Option<BrokerStatus> {
        let inner = self.inner.lock().unwrap();
        let raw = inner.bh.get(broker_id)?;
        serde_json::from_str::<BrokerRecord>(raw).ok().map(|r| r.st)
    }

    pub fn broker_cluster(&self, broker_id: &str) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        let raw = inner.bh.get(broker_id)?;
        serde_json::from_str::<BrokerRecord>(raw)
            .ok()
            .map(|r| r.cn.as_str().to_string())
    }
}

#[async_trait]
impl RegistryClient for FakeRegistry {
    async fn load_scripts(&self) -> Result<()> {
        Ok(())
    }

    async fn eval(&self, script: ScriptId, keys: &[String], args: &[String]) -> Result<RegistryValue> {
        let mut inner = self.inner.lock().unwrap();
        Ok(match script {
            ScriptId::Join => inner.join(keys, args),
            ScriptId::PickBroker => inner.pick_broker(keys, args),
            ScriptId::FindOrCreate => inner.find_or_create(keys, args),
            ScriptId::FindBroker => inner.find_broker(keys, args),
            ScriptId::HealthCheck => inner.health_check(keys, args),
            ScriptId::Salvage => inner.salvage(keys, args),
            ScriptId::FetchForRecovery => inner.fetch_for_recovery(keys, args),
            ScriptId::DestroyWorker => inner.destroy_worker(keys, args),
        })
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.hash_for(key).get(field).cloned())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.hash_for_mut(key).insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.hash_for_mut(key).remove(field);
        Ok(())
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<()> {
        self.inner.lock().unwrap().zadd(key, member, score);
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<()> {
        self.inner.lock().unwrap().zrem(key, member);
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<i64> {
        Ok(self.inner.lock().unwrap().publish(channel, payload))
    }

    async fn subscribe(&self, channels: &[String]) -> Result<mpsc::UnboundedReceiver<PubsubMessage>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap();
        for channel in channels {
            inner.subscribers.entry(channel.clone()).or_default().push(tx.clone());
        }
        Ok(rx)
    }

    async fn time(&self) -> Result<(i64, i64)> {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Ok((now.as_secs() as i64, now.subsec_micros() as i64))
    }
}

impl Inner {
    /// `gh`/`wh`/`bh` are each identified only by their suffix in this
    /// in-memory double (there is a single namespace), so administrative
    /// hash ops dispatch on which of the three key families the caller
    /// passed.
    fn hash_for(&self, key: &str) -> &HashMap<String, String> {
        if key.ends_with(":gh") || key == "gh" {
            &self.gh
        } else if key.ends_with(":wh") || key == "wh" {
            &self.wh
        } else {
            &self.bh
        }
    }

    fn hash_for_mut(&mut self, key: &str) -> &mut HashMap<String, String> {
        if key.ends_with(":gh") || key == "gh" {
            &mut self.gh
        } else if key.ends_with(":wh") || key == "wh" {
            &mut self.wh
        } else {
            &mut self.bh
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_common::broker_hash_key;

    fn ns(suffix: &str) -> String {
        format!("test:{suffix}")
    }

    async fn join(reg: &FakeRegistry, broker_id: &str, cluster: &str, addr: &str, load: &str) -> RegistryValue {
        let keys = vec![
            ns("gh"),
            ns("bh"),
            ns(&format!("cz:{cluster}")),
            ns(&format!("bz:{cluster}")),
            ns(&format!("wz:{broker_id}")),
            ns("wh"),
            ns("rz"),
        ];
        let hash_key = broker_hash_key(broker_id).to_string();
        let args = vec![
            broker_id.to_string(),
            "test:ch".to_string(),
            load.to_string(),
            cluster.to_string(),
            addr.to_string(),
            hash_key,
        ];
        reg.eval(ScriptId::Join, &keys, &args).await.unwrap()
    }

    #[tokio::test]
    async fn s1_add_new_broker() {
        let reg = FakeRegistry::new();
        let result = join(&reg, "br01", "pvp", "1.2.3.4:6690", "10").await;
        assert_eq!(result.code(), Some(0));
        assert_eq!(reg.global_counters().brokers_added, 1);
        assert!(reg.zset_members(&ns("cz:pvp")).contains(&"br01".to_string()));
    }

    #[tokio::test]
    async fn s2_rejoin_salvages_recoverable_stale_worker() {
        let reg = FakeRegistry::new();
        join(&reg, "br01", "pvp", "1.2.3.4:6690", "10").await;
        {
            let mut inner = reg.inner.lock().unwrap();
            inner.wh.insert(
                "MyWorker#1".to_string(),
                serde_json::json!({
                    "name": "MyWorker",
                    "brokerId": "br01",
                    "attributes": { "recoverable": true }
                })
                .to_string(),
            );
            inner.zadd(&ns("wz:br01"), "MyWorker#1", 42.0);
        }

        join(&reg, "br01", "pvp", "1.2.3.4:6690", "10").await;

        assert!(reg.zset_members(&ns("wz:br01")).is_empty());
        assert_eq!(reg.zset_members(&ns("rz")), vec!["MyWorker#1".to_string()]);
        assert_eq!(reg.zscore_of(&ns("rz"), "MyWorker#1"), Some(42.0));
    }

    #[tokio::test]
    async fn s3_rejoin_discards_non_recoverable_stale_worker() {
        let reg = FakeRegistry::new();
        join(&reg, "br01", "pvp", "1.2.3.4:6690", "10").await;
        {
            let mut inner = reg.inner.lock().unwrap();
            inner.wh.insert(
                "MyWorker#1".to_string(),
                serde_json::json!({ "name": "MyWorker", "brokerId": "br01", "attributes": {} }).to_string(),
            );
            inner.zadd(&ns("wz:br01"), "MyWorker#1", 42.0);
        }

        join(&reg, "br01", "pvp", "1.2.3.4:6690", "10").await;

        assert!(reg.zset_members(&ns("wz:br01")).is_empty());
        assert!(reg.zset_members(&ns("rz")).is_empty());
        assert!(reg.inner.lock().unwrap().wh.get("MyWorker#1").is_none());
    }

    #[tokio::test]
    async fn s4_rejoin_with_corrupt_worker_record() {
        let reg = FakeRegistry::new();
        join(&reg, "br01", "pvp", "1.2.3.4:6690", "10").await;
        {
            let mut inner = reg.inner.lock().unwrap();
            inner.wh.insert("MyWorker#1".to_string(), "d$h*2=X".to_string());
            inner.zadd(&ns("wz:br01"), "MyWorker#1", 42.0);
        }

        let result = join(&reg, "br01", "pvp", "1.2.3.4:6690", "10").await;

        assert_eq!(result.code(), Some(0));
        assert!(reg.zset_members(&ns("wz:br01")).is_empty());
        assert_eq!(reg.global_counters().workers_broken, 1);
    }

    #[tokio::test]
    async fn s5_health_check_alone_in_ring() {
        let reg = FakeRegistry::new();
        join(&reg, "br01", "pvp", "1.2.3.4:6690", "10").await;

        let keys = vec![ns("gh"), ns("bh"), ns("cz:pvp"), ns("bz:pvp")];
        let result = reg
            .eval(ScriptId::HealthCheck, &keys, &["br01".to_string()])
            .await
            .unwrap();
        assert_eq!(result.code(), Some(0));
    }

    #[tokio::test]
    async fn s6_health_check_of_dead_next_peer() {
        let reg = FakeRegistry::new();
        join(&reg, "br01", "pvp", "1.2.3.4:6690", "10").await;
        {
            let mut inner = reg.inner.lock().unwrap();
            inner.bh.insert(
                "br02".to_string(),
                serde_json::json!({ "cn": "pvp", "st": "active", "addr": "127.0.0.1:5678" }).to_string(),
            );
            inner.zadd(&ns("bz:pvp"), "br02", 234.0);
            inner.zadd(&ns("cz:pvp"), "br02", 5.0);
        }

        let keys = vec![ns("gh"), ns("bh"), ns("cz:pvp"), ns("bz:pvp")];
        let result = reg
            .eval(ScriptId::HealthCheck, &keys, &["br01".to_string()])
            .await
            .unwrap();

        assert_eq!(result.code(), Some(1));
        let inner = reg.inner.lock().unwrap();
        let record: BrokerRecord = serde_json::from_str(inner.bh.get("br02").unwrap()).unwrap();
        assert_eq!(record.st, BrokerStatus::Invalid);
        assert!(!reg.zset_members(&ns("cz:pvp")).contains(&"br02".to_string()));
        assert!(!reg.zset_members(&ns("bz:pvp")).contains(&"br02".to_string()));
    }

    #[tokio::test]
    async fn destroy_worker_then_find_or_create_recovers_recoverable_worker() {
        let reg = FakeRegistry::new();
        join(&reg, "br01", "pvp", "1.2.3.4:6690", "10").await;

        let fc_keys = vec![ns("gh"), ns("wh"), ns("bh"), ns("wz:br01"), ns("rz")];
        let create_args = vec![
            "br01".to_string(),
            "MyWorker".to_string(),
            "".to_string(),
            serde_json::json!({ "recoverable": true }).to_string(),
            "100".to_string(),
            "0".to_string(),
            "0".to_string(),
        ];
        let created = reg.eval(ScriptId::FindOrCreate, &fc_keys, &create_args).await.unwrap();
        let worker_id = created.at(1).unwrap().at(2).unwrap().as_bulk().unwrap().to_string();

        let dw_keys = vec![ns("wh"), ns("wz:br01"), ns("rz"), ns("gh")];
        reg.eval(ScriptId::DestroyWorker, &dw_keys, &[worker_id.clone(), "1".to_string()])
            .await
            .unwrap();
        assert_eq!(reg.zset_members(&ns("rz")), vec![worker_id.clone()]);

        let mut recover_args = create_args.clone();
        recover_args[2] = worker_id.clone();
        recover_args[6] = "1".to_string();
        let recovered = reg.eval(ScriptId::FindOrCreate, &fc_keys, &recover_args).await.unwrap();
        assert_eq!(recovered.code(), Some(0));
        assert!(reg.zset_members(&ns("rz")).is_empty());
        assert_eq!(reg.global_counters().workers_recovered, 1);
    }

    #[tokio::test]
    async fn publish_reports_subscriber_count() {
        let reg = FakeRegistry::new();
        assert_eq!(reg.publish("test:ch:*", b"hi").await.unwrap(), 0);
        let _rx = reg.subscribe(&["test:ch:*".to_string()]).await.unwrap();
        assert_eq!(reg.publish("test:ch:*", b"hi").await.unwrap(), 1);
    }
}

/// §8's four structural invariants, checked after every step of a random
/// history instead of only at the hand-picked scenarios above. No pubsub
/// subscribers are ever registered here, so every liveness probe inside the
/// scripts reads 0 subscribers and every touched broker is salvaged as
/// "dead" — the history is a stress test of the salvage/invalidate paths,
/// not of the steady-state "broker answers its probe" path those scenario
/// tests already cover.
#[cfg(test)]
mod invariant_properties {
    use proptest::collection::vec as prop_vec;
    use proptest::prelude::*;

    use super::*;

    const CLUSTER: &str = "c0";
    const BROKERS: [&str; 3] = ["b0", "b1", "b2"];
    const CLASSES: [&str; 2] = ["Alpha", "Beta"];

    fn ns(suffix: &str) -> String {
        format!("test:{suffix}")
    }

    fn cz() -> String {
        ns(&format!("cz:{CLUSTER}"))
    }
    fn bz() -> String {
        ns(&format!("bz:{CLUSTER}"))
    }
    fn wz(broker: &str) -> String {
        ns(&format!("wz:{broker}"))
    }

    #[derive(Clone, Debug)]
    enum Op {
        Join { broker: usize },
        Create { broker: usize, class: usize, recoverable: bool },
        DestroyExisting { which: usize, mode: bool },
        SalvageSelf { broker: usize, mode: u8 },
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..BROKERS.len()).prop_map(|broker| Op::Join { broker }),
            (0..BROKERS.len(), 0..CLASSES.len(), any::<bool>())
                .prop_map(|(broker, class, recoverable)| Op::Create { broker, class, recoverable }),
            (0..16usize, any::<bool>()).prop_map(|(which, mode)| Op::DestroyExisting { which, mode }),
            (0..BROKERS.len(), 0u8..3u8).prop_map(|(broker, mode)| Op::SalvageSelf { broker, mode }),
        ]
    }

    async fn join(reg: &FakeRegistry, broker: &str) {
        let keys = vec![ns("gh"), ns("bh"), cz(), bz(), wz(broker), ns("wh"), ns("rz")];
        let hash_key = warden_common::broker_hash_key(broker).to_string();
        let args = vec![
            broker.to_string(),
            "test:ch".to_string(),
            "1".to_string(),
            CLUSTER.to_string(),
            "127.0.0.1:1".to_string(),
            hash_key,
        ];
        reg.eval(ScriptId::Join, &keys, &args).await.unwrap();
    }

    async fn create(reg: &FakeRegistry, broker: &str, class: &str, recoverable: bool) -> Option<String> {
        let keys = vec![ns("gh"), ns("wh"), ns("bh"), wz(broker), ns("rz")];
        let args = vec![
            broker.to_string(),
            class.to_string(),
            "".to_string(),
            serde_json::json!({ "recoverable": recoverable }).to_string(),
            "1000".to_string(),
            "0".to_string(),
            "0".to_string(),
        ];
        let result = reg.eval(ScriptId::FindOrCreate, &keys, &args).await.unwrap();
        if result.code() == Some(0) {
            result.at(1).and_then(|t| t.at(2)).and_then(|v| v.as_bulk()).map(|s| s.to_string())
        } else {
            None
        }
    }

    async fn destroy_worker(reg: &FakeRegistry, broker: &str, worker_id: &str, mode: bool) {
        let keys = vec![ns("wh"), wz(broker), ns("rz"), ns("gh")];
        let args = vec![worker_id.to_string(), if mode { "1" } else { "0" }.to_string()];
        reg.eval(ScriptId::DestroyWorker, &keys, &args).await.unwrap();
    }

    async fn salvage(reg: &FakeRegistry, broker: &str, mode: u8) {
        let keys = vec![ns("gh"), ns("wh"), ns("bh"), cz(), bz(), wz(broker), ns("rz")];
        let args = vec![broker.to_string(), mode.to_string()];
        reg.eval(ScriptId::Salvage, &keys, &args).await.unwrap();
    }

    /// Invariants 1-4 of §8, checked against the full set of brokers/workers
    /// this history has ever touched.
    fn check_invariants(reg: &FakeRegistry, known_workers: &[String]) {
        for w in known_workers {
            if !reg.worker_exists(w) {
                continue;
            }
            match reg.worker_owner(w) {
                // Invariant 1: owned workers are in exactly their owner's wz
                // and nowhere else (rz, or another broker's wz).
                Some(owner) => {
                    let in_owner_wz = reg.zset_members(&wz(&owner)).contains(w);
                    assert!(in_owner_wz, "worker {w} owned by {owner} must be in its wz");
                    assert!(!reg.zset_members(&ns("rz")).contains(w), "owned worker {w} must not be in rz");
                    for other in BROKERS.iter().filter(|b| **b != owner) {
                        assert!(
                            !reg.zset_members(&wz(other)).contains(w),
                            "worker {w} owned by {owner} leaked into {other}'s wz"
                        );
                    }
                }
                // Invariant 2: a worker under migration (no brokerId) either
                // has no record, or is absent from every broker's wz.
                None => {
                    for b in BROKERS {
                        assert!(
                            !reg.zset_members(&wz(&b)).contains(w),
                            "ownerless worker {w} must not sit in any wz"
                        );
                    }
                }
            }
        }

        // Invariant 3: cz and bz have identical membership for the one
        // cluster this history uses.
        let cz_members: std::collections::HashSet<_> = reg.zset_members(&cz()).into_iter().collect();
        let bz_members: std::collections::HashSet<_> = reg.zset_members(&bz()).into_iter().collect();
        assert_eq!(cz_members, bz_members, "cz and bz membership diverged");

        // Invariant 4: every active broker sits in both cz and bz for its
        // cluster.
        for broker in BROKERS {
            if reg.broker_status(broker) == Some(BrokerStatus::Active) {
                assert_eq!(reg.broker_cluster(broker).as_deref(), Some(CLUSTER));
                assert!(cz_members.contains(broker), "active broker {broker} missing from cz");
                assert!(bz_members.contains(broker), "active broker {broker} missing from bz");
            }
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn invariants_hold_over_random_histories(ops in prop_vec(op_strategy(), 1..40)) {
            let reg = FakeRegistry::new();
            let mut created: Vec<String> = Vec::new();

            futures::executor::block_on(async {
                for op in &ops {
                    match op {
                        Op::Join { broker } => join(&reg, BROKERS[*broker]).await,
                        Op::Create { broker, class, recoverable } => {
                            if let Some(id) = create(&reg, BROKERS[*broker], CLASSES[*class], *recoverable).await {
                                created.push(id);
                            }
                        }
                        Op::DestroyExisting { which, mode } => {
                            if !created.is_empty() {
                                let id = created[*which % created.len()].clone();
                                if let Some(owner) = reg.worker_owner(&id) {
                                    destroy_worker(&reg, &owner, &id, *mode).await;
                                }
                            }
                        }
                        Op::SalvageSelf { broker, mode } => salvage(&reg, BROKERS[*broker], *mode).await,
                    }
                    check_invariants(&reg, &created);
                }
            });
        }
    }
}
