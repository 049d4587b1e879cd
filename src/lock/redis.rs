use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use uuid::Uuid;

use crate::config::RedisConfig;
use crate::error::Result;
use crate::lock::LeaseStore;

// Release and extend must be atomic even though Redis has no compound
// compare-and-act command: a Lua script runs GET and DEL/PEXPIRE in a single
// evaluation. A client-side check-then-act would let a stale holder delete a
// lease that already expired and was reissued to another node.
const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

const EXTEND_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("pexpire", KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Redis-backed lease store. Keys are `<prefix>job:<name>`; values are
/// `<node id>:<nonce>` with a fresh nonce per acquisition.
pub struct RedisLeaseStore {
    conn: ConnectionManager,
    node_id: String,
    key_prefix: String,
    release: Script,
    extend: Script,
    held: Mutex<HashMap<String, String>>,
}

impl RedisLeaseStore {
    /// Connect to Redis and build a store scoped to this node.
    pub async fn connect(config: &RedisConfig, node_id: &str) -> Result<Self> {
        let client = redis::Client::open(config.url().as_str())?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn, node_id, &config.key_prefix))
    }

    pub fn new(conn: ConnectionManager, node_id: &str, key_prefix: &str) -> Self {
        Self {
            conn,
            node_id: node_id.to_string(),
            key_prefix: key_prefix.to_string(),
            release: Script::new(RELEASE_SCRIPT),
            extend: Script::new(EXTEND_SCRIPT),
            held: Mutex::new(HashMap::new()),
        }
    }

    /// Round-trip to the server, for startup connectivity checks.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    fn lease_key(&self, job: &str) -> String {
        format!("{}job:{}", self.key_prefix, job)
    }

    fn lease_value(&self) -> String {
        format!("{}:{}", self.node_id, Uuid::new_v4())
    }
}

#[async_trait]
impl LeaseStore for RedisLeaseStore {
    async fn acquire(&self, job: &str, ttl: Duration) -> Result<bool> {
        let key = self.lease_key(job);
        let value = self.lease_value();
        let mut conn = self.conn.clone();

        // SET key value NX PX <millis>: reply is OK on success, nil when the
        // key already exists.
        let reply: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(&value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;

        let acquired = reply.is_some();
        if acquired {
            self.held
                .lock()
                .expect("lease table poisoned")
                .insert(job.to_string(), value);
        }
        Ok(acquired)
    }

    async fn release(&self, job: &str) -> Result<()> {
        // The nonce is cleared up front regardless of what the script
        // reports: a mismatch means the lease already expired and was
        // reissued, and nothing ever retries a release.
        let value = match self
            .held
            .lock()
            .expect("lease table poisoned")
            .remove(job)
        {
            Some(value) => value,
            None => return Ok(()),
        };

        let key = self.lease_key(job);
        let mut conn = self.conn.clone();
        let _deleted: i64 = self
            .release
            .key(&key)
            .arg(&value)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn extend(&self, job: &str, ttl: Duration) -> Result<bool> {
        let value = match self
            .held
            .lock()
            .expect("lease table poisoned")
            .get(job)
            .cloned()
        {
            Some(value) => value,
            None => return Ok(false),
        };

        let key = self.lease_key(job);
        let mut conn = self.conn.clone();
        let applied: i64 = self
            .extend
            .key(&key)
            .arg(&value)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(applied == 1)
    }

    async fn close(&self) -> Result<()> {
        // The multiplexed connection closes when the last clone drops.
        tracing::debug!("closing redis lease store");
        Ok(())
    }
}
