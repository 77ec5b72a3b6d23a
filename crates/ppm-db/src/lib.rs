//! Persistence layer: bounded Postgres pool, embedded migrations, the
//! write-through [`Persistence`] facade, and the HA instance queries.
//!
//! Retry discipline: connection-level failures back off 1 s / 2 s / 4 s and
//! give up; data errors (constraint, type) are surfaced immediately and
//! never retried. Optimistic version conflicts reload and retry up to three
//! times before failing.

use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::warn;

mod instance;
mod persistence;
mod signal_log;

pub use instance::{db_leader, upsert_heartbeat, DbLeader, InstanceBeat, LeadershipAudit};
pub use persistence::{DataShapeError, Persistence};
pub use signal_log::SignalLogStatus;

pub const ENV_DB_URL: &str = "PPM_DATABASE_URL";

/// Connection-retry schedule for pool acquisition and per-transaction
/// transient failures.
pub const DB_RETRY_DELAYS_S: [u64; 3] = [1, 2, 4];

/// Connect with the standard bounded pool and backoff schedule.
pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool> {
    let mut last_err = None;
    for (attempt, delay_s) in std::iter::once(&0u64)
        .chain(DB_RETRY_DELAYS_S.iter())
        .enumerate()
    {
        if *delay_s > 0 {
            tokio::time::sleep(Duration::from_secs(*delay_s)).await;
        }
        match PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await
        {
            Ok(pool) => return Ok(pool),
            Err(e) => {
                warn!(attempt, error = %e, "postgres connect failed");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.expect("connect loop ran at least once"))
        .context("failed to connect to Postgres after retries")
}

/// Connect using PPM_DATABASE_URL (tests, CLI maintenance commands).
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;
    connect(&url, 10).await
}

/// Run embedded migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

/// Liveness ping used by GET /ready.
pub async fn ping(pool: &PgPool) -> Result<()> {
    let (one,): (i32,) = sqlx::query_as("select 1")
        .fetch_one(pool)
        .await
        .context("db ping failed")?;
    anyhow::ensure!(one == 1, "db ping returned {one}");
    Ok(())
}

/// True when an error is worth a backoff-retry (connection-shaped), false
/// for data errors which must surface immediately.
pub(crate) fn is_transient(e: &sqlx::Error) -> bool {
    matches!(
        e,
        sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Tls(_)
    )
}

/// Run `op` with the transient-failure backoff schedule.
pub(crate) async fn with_db_retry<T, F, Fut>(what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut last_err = None;
    for (attempt, delay_s) in std::iter::once(&0u64)
        .chain(DB_RETRY_DELAYS_S.iter())
        .enumerate()
    {
        if *delay_s > 0 {
            tokio::time::sleep(Duration::from_secs(*delay_s)).await;
        }
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if is_transient(&e) => {
                warn!(what, attempt, error = %e, "transient db failure");
                last_err = Some(e);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("{what}: non-retryable db error"));
            }
        }
    }
    Err(last_err.expect("retry loop ran at least once"))
        .with_context(|| format!("{what}: db unavailable after retries"))
}
