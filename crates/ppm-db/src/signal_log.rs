use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::with_db_retry;

/// Signal audit states. `Executing` is the claim; the engine settles it to
/// one of the terminal states when processing finishes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SignalLogStatus {
    Executing,
    Executed,
    Failed,
    Rejected,
    Duplicate,
}

impl SignalLogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalLogStatus::Executing => "executing",
            SignalLogStatus::Executed => "executed",
            SignalLogStatus::Failed => "failed",
            SignalLogStatus::Rejected => "rejected",
            SignalLogStatus::Duplicate => "duplicate",
        }
    }
}

/// Atomic fingerprint claim.
///
/// The unique index on `fingerprint` makes this the cluster-wide dedup
/// arbiter: within the dedup window the second claimer gets 0 rows back no
/// matter which instance it is. This is what bounds double-admission during
/// a split-brain window. A row older than the window is re-claimed in place.
pub async fn try_claim(
    pool: &PgPool,
    fingerprint: &str,
    payload: &serde_json::Value,
    instance_id: &str,
    dedup_window_s: i64,
) -> Result<bool> {
    let done = with_db_retry("claim signal fingerprint", || {
        sqlx::query(
            "insert into signal_log (fingerprint, payload, received_at, processed_by, status) \
             values ($1, $2, now(), $3, 'executing') \
             on conflict (fingerprint) do update set \
               payload = excluded.payload, \
               received_at = now(), \
               processed_by = excluded.processed_by, \
               status = 'executing', \
               result_summary = null \
             where signal_log.received_at < now() - make_interval(secs => $4)",
        )
        .bind(fingerprint)
        .bind(payload)
        .bind(instance_id)
        .bind(dedup_window_s as f64)
        .execute(pool)
    })
    .await?;
    Ok(done.rows_affected() == 1)
}

pub async fn is_duplicate(pool: &PgPool, fingerprint: &str, dedup_window_s: i64) -> Result<bool> {
    let (dup,): (bool,) = with_db_retry("check duplicate fingerprint", || {
        sqlx::query_as(
            "select exists ( \
               select 1 from signal_log \
               where fingerprint = $1 and received_at >= now() - make_interval(secs => $2) \
             )",
        )
        .bind(fingerprint)
        .bind(dedup_window_s as f64)
        .fetch_one(pool)
    })
    .await?;
    Ok(dup)
}

pub async fn update_status(
    pool: &PgPool,
    fingerprint: &str,
    status: SignalLogStatus,
    result_summary: &str,
) -> Result<()> {
    with_db_retry("update signal status", || {
        sqlx::query("update signal_log set status = $2, result_summary = $3 where fingerprint = $1")
            .bind(fingerprint)
            .bind(status.as_str())
            .bind(result_summary)
            .execute(pool)
    })
    .await
    .context("update signal log status")?;
    Ok(())
}
