use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;

/// The leader lock key in the shared cache.
pub const LEADER_KEY: &str = "pm:leader";

/// Lease port. Redis in production; tests drive the coordinator with an
/// in-memory fake.
#[async_trait]
pub trait Lease: Send + Sync {
    /// Atomic acquire: SET key NX EX ttl. True when we now hold the lock.
    async fn try_acquire(&self, holder: &str, ttl_s: u64) -> Result<bool>;

    /// Scripted compare-and-extend: refresh the TTL only while we still hold
    /// the lock. False means the lock expired or someone else took it.
    async fn renew(&self, holder: &str, ttl_s: u64) -> Result<bool>;

    /// Scripted compare-and-delete: drop the lock only if it is still ours.
    async fn release(&self, holder: &str) -> Result<bool>;

    /// Current lock holder, if any.
    async fn current_holder(&self) -> Result<Option<String>>;
}

const RENEW_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('expire', KEYS[1], ARGV[2])
else
    return 0
end
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

/// Redis-backed lease. `ConnectionManager` reconnects internally, so the
/// heartbeat loop keeps working through cache blips without re-dialing.
pub struct RedisLease {
    conn: ConnectionManager,
}

impl RedisLease {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("invalid redis url")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("connect to redis")?;
        Ok(Self { conn })
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("redis ping failed")?;
        Ok(())
    }
}

#[async_trait]
impl Lease for RedisLease {
    async fn try_acquire(&self, holder: &str, ttl_s: u64) -> Result<bool> {
        let mut conn = self.conn.clone();
        let outcome: Option<String> = redis::cmd("SET")
            .arg(LEADER_KEY)
            .arg(holder)
            .arg("NX")
            .arg("EX")
            .arg(ttl_s)
            .query_async(&mut conn)
            .await
            .context("leader SET NX EX failed")?;
        Ok(outcome.is_some())
    }

    async fn renew(&self, holder: &str, ttl_s: u64) -> Result<bool> {
        let mut conn = self.conn.clone();
        let extended: i64 = Script::new(RENEW_SCRIPT)
            .key(LEADER_KEY)
            .arg(holder)
            .arg(ttl_s)
            .invoke_async(&mut conn)
            .await
            .context("leader renew script failed")?;
        Ok(extended == 1)
    }

    async fn release(&self, holder: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = Script::new(RELEASE_SCRIPT)
            .key(LEADER_KEY)
            .arg(holder)
            .invoke_async(&mut conn)
            .await
            .context("leader release script failed")?;
        Ok(deleted == 1)
    }

    async fn current_holder(&self) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let holder: Option<String> = redis::cmd("GET")
            .arg(LEADER_KEY)
            .query_async(&mut conn)
            .await
            .context("leader GET failed")?;
        Ok(holder)
    }
}
