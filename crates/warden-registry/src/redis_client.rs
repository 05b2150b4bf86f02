use std::collections::HashMap;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tokio::sync::mpsc;
use warden_types::{Result, WardenError};

use crate::client::{PubsubMessage, RegistryClient};
use crate::scripts::ScriptId;
use crate::value::RegistryValue;

fn map_err(err: redis::RedisError) -> WardenError {
    WardenError::RegistryFault(err.to_string())
}

fn from_redis_value(value: &redis::Value) -> RegistryValue {
    match value {
        redis::Value::Nil => RegistryValue::Nil,
        redis::Value::Int(i) => RegistryValue::Int(*i),
        redis::Value::BulkString(bytes) => {
            RegistryValue::Bulk(String::from_utf8_lossy(bytes).into_owned())
        }
        redis::Value::SimpleString(s) => RegistryValue::Bulk(s.clone()),
        redis::Value::Okay => RegistryValue::Bulk("OK".to_string()),
        redis::Value::Boolean(b) => RegistryValue::Int(if *b { 1 } else { 0 }),
        redis::Value::Double(d) => RegistryValue::Bulk(d.to_string()),
        redis::Value::Array(items) | redis::Value::Set(items) => {
            RegistryValue::Array(items.iter().map(from_redis_value).collect())
        }
        other => RegistryValue::Bulk(format!("{other:?}")),
    }
}

/// A `RegistryClient` backed by a live Redis (or Redis-protocol-compatible)
/// server: a pooled command connection for scripts and administrative ops,
/// plus a dedicated pubsub connection spun up per `subscribe` call.
pub struct RedisRegistryClient {
    client: redis::Client,
    conn: ConnectionManager,
    scripts: HashMap<ScriptId, Script>,
}

impl RedisRegistryClient {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(map_err)?;
        let conn = client.get_connection_manager().await.map_err(map_err)?;
        let scripts = ScriptId::ALL
            .into_iter()
            .map(|id| (id, Script::new(id.source())))
            .collect();
        Ok(Self { client, conn, scripts })
    }
}

#[async_trait]
impl RegistryClient for RedisRegistryClient {
    async fn load_scripts(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        for id in ScriptId::ALL {
            redis::cmd("SCRIPT")
                .arg("LOAD")
                .arg(id.source())
                .query_async::<String>(&mut conn)
                .await
                .map_err(map_err)?;
        }
        Ok(())
    }

    async fn eval(&self, script: ScriptId, keys: &[String], args: &[String]) -> Result<RegistryValue> {
        let compiled = self
            .scripts
            .get(&script)
            .unwrap_or_else(|| panic!("script {} was never registered", script.name()));
        let mut invocation = compiled.prepare_invoke();
        for key in keys {
            invocation.key(key);
        }
        for arg in args {
            invocation.arg(arg);
        }
        let mut conn = self.conn.clone();
        let value: redis::Value = invocation.invoke_async(&mut conn).await.map_err(map_err)?;
        Ok(from_redis_value(&value))
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        conn.hget(key, field).await.map_err(map_err)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.hset(key, field, value).await.map_err(map_err)?;
        Ok(())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.hdel(key, field).await.map_err(map_err)?;
        Ok(())
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.zadd(key, member, score).await.map_err(map_err)?;
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.zrem(key, member).await.map_err(map_err)?;
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<i64> {
        let mut conn = self.conn.clone();
        conn.publish(channel, payload).await.map_err(map_err)
    }

    async fn subscribe(&self, channels: &[String]) -> Result<mpsc::UnboundedReceiver<PubsubMessage>> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(map_err)?;
        for channel in channels {
            pubsub.subscribe(channel).await.map_err(map_err)?;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let channel = msg.get_channel_name().to_string();
                let payload: Vec<u8> = msg.get_payload().unwrap_or_default();
                if tx.send(PubsubMessage { channel, payload }).is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn time(&self) -> Result<(i64, i64)> {
        let mut conn = self.conn.clone();
        let (secs, micros): (i64, i64) = redis::cmd("TIME")
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok((secs, micros))
    }
}
