use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::with_db_retry;

/// One heartbeat's worth of instance metadata.
#[derive(Clone, Debug, PartialEq)]
pub struct InstanceBeat {
    pub instance_id: String,
    pub hostname: String,
    pub started_at: DateTime<Utc>,
    pub is_leader: bool,
    pub leader_acquired_at: Option<DateTime<Utc>>,
}

/// The database's opinion of who leads: the freshest heartbeat with
/// `is_leader` set.
#[derive(Clone, Debug, PartialEq)]
pub struct DbLeader {
    pub instance_id: String,
    pub last_heartbeat: DateTime<Utc>,
}

/// Append-only leadership audit rows.
pub struct LeadershipAudit;

/// Upsert this instance's heartbeat row.
pub async fn upsert_heartbeat(pool: &PgPool, beat: &InstanceBeat) -> Result<()> {
    with_db_retry("upsert instance heartbeat", || {
        sqlx::query(
            "insert into instance_metadata \
               (instance_id, hostname, started_at, last_heartbeat, is_leader, leader_acquired_at, status) \
             values ($1, $2, $3, now(), $4, $5, 'active') \
             on conflict (instance_id) do update set \
               last_heartbeat = now(), \
               is_leader = excluded.is_leader, \
               leader_acquired_at = excluded.leader_acquired_at",
        )
        .bind(&beat.instance_id)
        .bind(&beat.hostname)
        .bind(beat.started_at)
        .bind(beat.is_leader)
        .bind(beat.leader_acquired_at)
        .execute(pool)
    })
    .await?;
    Ok(())
}

/// Database-side leader: leader-flagged row with a heartbeat fresher than
/// `fresh_s` seconds. Returns None when nobody qualifies.
pub async fn db_leader(pool: &PgPool, fresh_s: i64) -> Result<Option<DbLeader>> {
    let row: Option<(String, DateTime<Utc>)> = with_db_retry("read db leader", || {
        sqlx::query_as(
            "select instance_id, last_heartbeat from instance_metadata \
             where is_leader and last_heartbeat >= now() - make_interval(secs => $1) \
             order by last_heartbeat desc limit 1",
        )
        .bind(fresh_s as f64)
        .fetch_optional(pool)
    })
    .await?;
    Ok(row.map(|(instance_id, last_heartbeat)| DbLeader {
        instance_id,
        last_heartbeat,
    }))
}

impl LeadershipAudit {
    /// Record a leadership acquisition.
    pub async fn record_acquired(
        pool: &PgPool,
        instance_id: &str,
        hostname: &str,
        became_leader_at: DateTime<Utc>,
    ) -> Result<()> {
        with_db_retry("record leadership acquired", || {
            sqlx::query(
                "insert into leadership_history (instance_id, hostname, became_leader_at) \
                 values ($1, $2, $3)",
            )
            .bind(instance_id)
            .bind(hostname)
            .bind(became_leader_at)
            .execute(pool)
        })
        .await?;
        Ok(())
    }

    /// Close the open leadership stint for this instance, stamping duration.
    pub async fn record_released(pool: &PgPool, instance_id: &str) -> Result<()> {
        with_db_retry("record leadership released", || {
            sqlx::query(
                "update leadership_history set \
                   released_leader_at = now(), \
                   duration_s = extract(epoch from (now() - became_leader_at)) \
                 where id = ( \
                   select id from leadership_history \
                   where instance_id = $1 and released_leader_at is null \
                   order by became_leader_at desc limit 1 \
                 )",
            )
            .bind(instance_id)
            .execute(pool)
        })
        .await?;
        Ok(())
    }
}
