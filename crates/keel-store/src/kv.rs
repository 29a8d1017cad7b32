//! Redis coordination store: event dedup and distributed leases.
//!
//! Dedup markers are `SET NX EX` keys; leases are holder-tagged keys renewed
//! and released through small Lua scripts so the compare-and-set is atomic on
//! the server.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use keel_core::EventKey;

use crate::error::StoreResult;
use crate::traits::{DedupStore, LeaseStore};

const RENEW_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
  return 0
end
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
else
  return 0
end
"#;

/// Redis-backed dedup + lease store.
#[derive(Clone)]
pub struct RedisKv {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisKv {
    pub async fn connect(url: &str, prefix: impl Into<String>) -> StoreResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            prefix: prefix.into(),
        })
    }

    fn dedup_key(&self, key: EventKey) -> String {
        format!("{}:dedup:{}:{}", self.prefix, key.tx_hash, key.log_index)
    }

    fn lease_key(&self, key: &str) -> String {
        format!("{}:lease:{}", self.prefix, key)
    }
}

#[async_trait]
impl DedupStore for RedisKv {
    async fn check_and_mark(&self, key: EventKey, ttl_secs: u64) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        // SET NX returns OK when the key was fresh, Nil when it existed.
        let marked: Option<String> = redis::cmd("SET")
            .arg(self.dedup_key(key))
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await?;
        Ok(marked.is_some())
    }
}

#[async_trait]
impl LeaseStore for RedisKv {
    async fn acquire(&self, key: &str, holder: &str, ttl_secs: u64) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let lease_key = self.lease_key(key);
        let acquired: Option<String> = redis::cmd("SET")
            .arg(&lease_key)
            .arg(holder)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await?;
        if acquired.is_some() {
            return Ok(true);
        }
        // Re-acquisition by the current holder counts as success.
        let current: Option<String> = conn.get(&lease_key).await?;
        Ok(current.as_deref() == Some(holder))
    }

    async fn renew(&self, key: &str, holder: &str, ttl_secs: u64) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let renewed: i64 = Script::new(RENEW_SCRIPT)
            .key(self.lease_key(key))
            .arg(holder)
            .arg(ttl_secs * 1000)
            .invoke_async(&mut conn)
            .await?;
        Ok(renewed == 1)
    }

    async fn release(&self, key: &str, holder: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = Script::new(RELEASE_SCRIPT)
            .key(self.lease_key(key))
            .arg(holder)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }
}
