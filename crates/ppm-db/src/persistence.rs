use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};

use ppm_portfolio::{PortfolioAggregate, Position, PositionId, PositionStatus, PyramidState};
use ppm_signal::{Instrument, Slot};

use crate::{with_db_retry, signal_log};

/// Attempts for optimistic-version conflicts (reload + retry).
const VERSION_RETRIES: u32 = 3;

/// Shape error in persisted data: unknown instrument, bad status string,
/// orphaned reference. Recovery downcasts to this to distinguish corruption
/// from unavailability; it is never retried.
#[derive(Debug)]
pub struct DataShapeError(pub String);

impl fmt::Display for DataShapeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "persisted data shape error: {}", self.0)
    }
}

impl std::error::Error for DataShapeError {}

/// Write-through persistence facade over the Postgres pool.
///
/// Every write keeps the process-local position cache in sync with the row
/// that actually landed; readers on the hot path hit the cache, recovery and
/// startup go to the database.
pub struct Persistence {
    pool: PgPool,
    cache: RwLock<HashMap<PositionId, Position>>,
}

impl Persistence {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Cached copy of a position as last written/loaded.
    pub fn cached_position(&self, id: &PositionId) -> Option<Position> {
        self.cache.read().expect("cache lock poisoned").get(id).cloned()
    }

    fn cache_put(&self, position: &Position) {
        self.cache
            .write()
            .expect("cache lock poisoned")
            .insert(position.id.clone(), position.clone());
    }

    fn cache_remove(&self, id: &PositionId) {
        self.cache.write().expect("cache lock poisoned").remove(id);
    }

    // -----------------------------------------------------------------------
    // Composite transactional writers (the engine's commit points)
    // -----------------------------------------------------------------------

    /// Persist a filled entry atomically: the new position, the instrument's
    /// pyramid state, and the aggregate. Version conflicts on the aggregate
    /// reload and retry; after three strikes the error surfaces.
    pub async fn persist_entry(
        &self,
        position: &Position,
        pyramid: &PyramidState,
        aggregate: &PortfolioAggregate,
    ) -> Result<()> {
        for _ in 0..VERSION_RETRIES {
            let mut tx = self.begin().await?;
            insert_position(&mut tx, position).await?;
            upsert_pyramid_state(&mut tx, position.instrument, pyramid).await?;
            if write_aggregate(&mut tx, aggregate).await? {
                tx.commit().await.context("commit entry transaction")?;
                self.cache_put(position);
                return Ok(());
            }
            tx.rollback().await.ok();
        }
        Err(anyhow!(
            "aggregate version conflict persisted across {VERSION_RETRIES} attempts"
        ))
    }

    /// Persist a filled exit atomically: settle each leg, pyramid
    /// bookkeeping, aggregate. A `Some` pyramid upserts the row (base closed,
    /// pyramids remain); `None` deletes it (instrument flat).
    ///
    /// Each leg write is a version CAS like every other position writer; the
    /// in-memory legs have already bumped their versions, so the row is
    /// expected at the previous one. A conflict on any leg (or on the
    /// aggregate) reloads the stored version and retries the whole
    /// transaction.
    pub async fn persist_exit(
        &self,
        closed: &[Position],
        instrument: Instrument,
        pyramid: Option<&PyramidState>,
        aggregate: &PortfolioAggregate,
    ) -> Result<()> {
        let mut expected: Vec<i64> = closed.iter().map(|p| p.version - 1).collect();
        for _ in 0..VERSION_RETRIES {
            let mut tx = self.begin().await?;

            let mut conflicted = None;
            for (i, position) in closed.iter().enumerate() {
                if !settle_position_row(&mut tx, position, expected[i]).await? {
                    conflicted = Some(i);
                    break;
                }
            }
            if let Some(i) = conflicted {
                tx.rollback().await.ok();
                expected[i] = self.stored_position_version(&closed[i].id).await?;
                continue;
            }

            match pyramid {
                Some(ps) => upsert_pyramid_state(&mut tx, instrument, ps).await?,
                None => delete_pyramid_state(&mut tx, instrument).await?,
            }
            if write_aggregate(&mut tx, aggregate).await? {
                tx.commit().await.context("commit exit transaction")?;
                for position in closed {
                    self.cache_remove(&position.id);
                }
                return Ok(());
            }
            tx.rollback().await.ok();
        }
        Err(anyhow!(
            "version conflict persisted across {VERSION_RETRIES} attempts"
        ))
    }

    /// Persist an advanced trailing stop (and refreshed aggregate rollups).
    /// The in-memory position has already bumped its version, so the CAS
    /// expects the previous one in the row.
    pub async fn persist_stop_advance(
        &self,
        position: &Position,
        aggregate: &PortfolioAggregate,
    ) -> Result<()> {
        let mut expected = position.version - 1;
        for _ in 0..VERSION_RETRIES {
            let mut tx = self.begin().await?;
            if !update_position_row(&mut tx, position, expected).await? {
                tx.rollback().await.ok();
                expected = self.stored_position_version(&position.id).await?;
                continue;
            }
            if write_aggregate(&mut tx, aggregate).await? {
                tx.commit().await.context("commit stop-advance transaction")?;
                self.cache_put(position);
                return Ok(());
            }
            tx.rollback().await.ok();
        }
        Err(anyhow!(
            "version conflict persisted across {VERSION_RETRIES} attempts"
        ))
    }

    // -----------------------------------------------------------------------
    // Single-row writers
    // -----------------------------------------------------------------------

    pub async fn save_position(&self, position: &Position) -> Result<()> {
        let mut tx = self.begin().await?;
        insert_position(&mut tx, position).await?;
        tx.commit().await.context("commit position insert")?;
        self.cache_put(position);
        Ok(())
    }

    /// Optimistic update: expects `expected_version` in the row, writes the
    /// position with the next version. Reloads and retries on conflict.
    pub async fn update_position(
        &self,
        position: &Position,
        expected_version: i64,
    ) -> Result<()> {
        let mut expected = expected_version;
        for _ in 0..VERSION_RETRIES {
            let mut tx = self.begin().await?;
            if update_position_row(&mut tx, position, expected).await? {
                tx.commit().await.context("commit position update")?;
                let mut written = position.clone();
                written.version = expected + 1;
                self.cache_put(&written);
                return Ok(());
            }
            tx.rollback().await.ok();
            expected = self.stored_position_version(&position.id).await?;
        }
        Err(anyhow!(
            "position {} version conflict persisted across {VERSION_RETRIES} attempts",
            position.id
        ))
    }

    pub async fn save_pyramid_state(
        &self,
        instrument: Instrument,
        state: &PyramidState,
    ) -> Result<()> {
        let mut tx = self.begin().await?;
        upsert_pyramid_state(&mut tx, instrument, state).await?;
        tx.commit().await.context("commit pyramid state")?;
        Ok(())
    }

    pub async fn save_aggregate(&self, aggregate: &PortfolioAggregate) -> Result<()> {
        for _ in 0..VERSION_RETRIES {
            let mut tx = self.begin().await?;
            if write_aggregate(&mut tx, aggregate).await? {
                tx.commit().await.context("commit aggregate")?;
                return Ok(());
            }
            tx.rollback().await.ok();
        }
        Err(anyhow!(
            "aggregate version conflict persisted across {VERSION_RETRIES} attempts"
        ))
    }

    // -----------------------------------------------------------------------
    // Signal log / dedup
    // -----------------------------------------------------------------------

    /// Atomically claim a fingerprint for processing. Returns false when the
    /// fingerprint was already claimed inside the dedup window; the caller
    /// answers `duplicate`. Claims outside the window are re-taken.
    pub async fn try_claim_signal(
        &self,
        fingerprint: &str,
        payload: &serde_json::Value,
        instance_id: &str,
        dedup_window_s: i64,
    ) -> Result<bool> {
        signal_log::try_claim(&self.pool, fingerprint, payload, instance_id, dedup_window_s).await
    }

    pub async fn is_duplicate_fingerprint(
        &self,
        fingerprint: &str,
        dedup_window_s: i64,
    ) -> Result<bool> {
        signal_log::is_duplicate(&self.pool, fingerprint, dedup_window_s).await
    }

    pub async fn update_signal_status(
        &self,
        fingerprint: &str,
        status: signal_log::SignalLogStatus,
        result_summary: &str,
    ) -> Result<()> {
        signal_log::update_status(&self.pool, fingerprint, status, result_summary).await
    }

    // -----------------------------------------------------------------------
    // State load (recovery path)
    // -----------------------------------------------------------------------

    pub async fn get_open_positions(&self) -> Result<HashMap<PositionId, Position>> {
        let rows = with_db_retry("load open positions", || {
            sqlx::query("select * from positions where status = 'open'").fetch_all(&self.pool)
        })
        .await?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let position = position_from_row(&row)?;
            out.insert(position.id.clone(), position);
        }

        let mut cache = self.cache.write().expect("cache lock poisoned");
        cache.clear();
        cache.extend(out.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(out)
    }

    pub async fn get_pyramid_states(&self) -> Result<HashMap<Instrument, PyramidState>> {
        let rows = with_db_retry("load pyramid states", || {
            sqlx::query("select * from pyramid_state").fetch_all(&self.pool)
        })
        .await?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let raw: String = row.try_get("instrument").context("pyramid_state.instrument")?;
            let instrument = Instrument::from_wire(&raw)
                .ok_or_else(|| anyhow!(DataShapeError(format!("unknown instrument `{raw}`"))))?;
            let base: Option<String> = row.try_get("base_position_id")?;
            out.insert(
                instrument,
                PyramidState {
                    last_pyramid_price: row.try_get("last_pyramid_price")?,
                    base_position_id: base.map(PositionId::from_raw),
                    pyramid_count: row.try_get::<i32, _>("pyramid_count")? as u32,
                },
            );
        }
        Ok(out)
    }

    pub async fn get_aggregate(&self) -> Result<Option<PortfolioAggregate>> {
        let row = with_db_retry("load aggregate", || {
            sqlx::query("select * from portfolio_aggregate where id = 1").fetch_optional(&self.pool)
        })
        .await?;

        row.map(|row| {
            Ok(PortfolioAggregate {
                initial_capital: row.try_get("initial_capital")?,
                closed_equity: row.try_get("closed_equity")?,
                total_risk_amount: row.try_get("total_risk_amount")?,
                total_vol_amount: row.try_get("total_vol_amount")?,
                margin_used: row.try_get("margin_used")?,
                version: row.try_get("version")?,
            })
        })
        .transpose()
    }

    /// Seed the aggregate row on first boot.
    pub async fn init_aggregate(&self, initial_capital: f64) -> Result<()> {
        with_db_retry("init aggregate", || {
            sqlx::query(
                "insert into portfolio_aggregate \
                 (id, initial_capital, closed_equity, total_risk_amount, total_vol_amount, margin_used, version) \
                 values (1, $1, 0, 0, 0, 0, 0) on conflict (id) do nothing",
            )
            .bind(initial_capital)
            .execute(&self.pool)
        })
        .await?;
        Ok(())
    }

    pub async fn set_instance_status(&self, instance_id: &str, status: &str) -> Result<()> {
        with_db_retry("set instance status", || {
            sqlx::query("update instance_metadata set status = $2 where instance_id = $1")
                .bind(instance_id)
                .bind(status)
                .execute(&self.pool)
        })
        .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn begin(&self) -> Result<Transaction<'_, Postgres>> {
        with_db_retry("begin transaction", || self.pool.begin()).await
    }

    async fn stored_position_version(&self, id: &PositionId) -> Result<i64> {
        let (version,): (i64,) = with_db_retry("read position version", || {
            sqlx::query_as("select version from positions where id = $1")
                .bind(id.as_str())
                .fetch_one(&self.pool)
        })
        .await?;
        Ok(version)
    }
}

// ---------------------------------------------------------------------------
// Row-level helpers
// ---------------------------------------------------------------------------

async fn insert_position(tx: &mut Transaction<'_, Postgres>, p: &Position) -> Result<()> {
    sqlx::query(
        "insert into positions ( \
           id, instrument, slot, is_base_position, entry_price, initial_stop, current_stop, \
           highest_close, lots, atr_at_entry, pe_entry_price, ce_entry_price, status, \
           opened_at, closed_at, realized_pnl, version \
         ) values ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17)",
    )
    .bind(p.id.as_str())
    .bind(p.instrument.wire_name())
    .bind(p.slot.wire_name())
    .bind(p.is_base_position)
    .bind(p.entry_price)
    .bind(p.initial_stop)
    .bind(p.current_stop)
    .bind(p.highest_close)
    .bind(p.lots)
    .bind(p.atr_at_entry)
    .bind(p.pe_entry_price)
    .bind(p.ce_entry_price)
    .bind(status_str(p.status))
    .bind(p.opened_at)
    .bind(p.closed_at)
    .bind(p.realized_pnl)
    .bind(p.version)
    .execute(&mut **tx)
    .await
    .context("insert position")?;
    Ok(())
}

/// CAS update keyed on `expected_version`. Returns false on conflict.
async fn update_position_row(
    tx: &mut Transaction<'_, Postgres>,
    p: &Position,
    expected_version: i64,
) -> Result<bool> {
    let done = sqlx::query(
        "update positions set \
           current_stop = $2, highest_close = $3, lots = $4, status = $5, \
           closed_at = $6, realized_pnl = $7, version = $8 \
         where id = $1 and version = $9",
    )
    .bind(p.id.as_str())
    .bind(p.current_stop)
    .bind(p.highest_close)
    .bind(p.lots)
    .bind(status_str(p.status))
    .bind(p.closed_at)
    .bind(p.realized_pnl)
    .bind(expected_version + 1)
    .bind(expected_version)
    .execute(&mut **tx)
    .await
    .context("update position")?;
    Ok(done.rows_affected() == 1)
}

/// Write an exit's effect on one leg: a full close sets status='closed', a
/// peel-off leaves the row open with the reduced lot count. CAS keyed on
/// `expected_version`; returns false on conflict.
async fn settle_position_row(
    tx: &mut Transaction<'_, Postgres>,
    p: &Position,
    expected_version: i64,
) -> Result<bool> {
    let done = sqlx::query(
        "update positions set status = $2, lots = $3, closed_at = $4, realized_pnl = $5, \
         version = $6 where id = $1 and version = $7",
    )
    .bind(p.id.as_str())
    .bind(status_str(p.status))
    .bind(p.lots)
    .bind(p.closed_at)
    .bind(p.realized_pnl)
    .bind(expected_version + 1)
    .bind(expected_version)
    .execute(&mut **tx)
    .await
    .context("settle position after exit")?;
    Ok(done.rows_affected() == 1)
}

async fn upsert_pyramid_state(
    tx: &mut Transaction<'_, Postgres>,
    instrument: Instrument,
    ps: &PyramidState,
) -> Result<()> {
    sqlx::query(
        "insert into pyramid_state (instrument, last_pyramid_price, base_position_id, pyramid_count, updated_at) \
         values ($1, $2, $3, $4, now()) \
         on conflict (instrument) do update set \
           last_pyramid_price = excluded.last_pyramid_price, \
           base_position_id = excluded.base_position_id, \
           pyramid_count = excluded.pyramid_count, \
           updated_at = now()",
    )
    .bind(instrument.wire_name())
    .bind(ps.last_pyramid_price)
    .bind(ps.base_position_id.as_ref().map(|id| id.as_str().to_string()))
    .bind(ps.pyramid_count as i32)
    .execute(&mut **tx)
    .await
    .context("upsert pyramid state")?;
    Ok(())
}

async fn delete_pyramid_state(
    tx: &mut Transaction<'_, Postgres>,
    instrument: Instrument,
) -> Result<()> {
    sqlx::query("delete from pyramid_state where instrument = $1")
        .bind(instrument.wire_name())
        .execute(&mut **tx)
        .await
        .context("delete pyramid state")?;
    Ok(())
}

/// CAS write of the aggregate singleton. Returns false on version conflict.
async fn write_aggregate(
    tx: &mut Transaction<'_, Postgres>,
    agg: &PortfolioAggregate,
) -> Result<bool> {
    let stored: Option<(i64,)> =
        sqlx::query_as("select version from portfolio_aggregate where id = 1")
            .fetch_optional(&mut **tx)
            .await
            .context("read aggregate version")?;

    let done = match stored {
        None => sqlx::query(
            "insert into portfolio_aggregate \
             (id, initial_capital, closed_equity, total_risk_amount, total_vol_amount, margin_used, version) \
             values (1, $1, $2, $3, $4, $5, 1)",
        )
        .bind(agg.initial_capital)
        .bind(agg.closed_equity)
        .bind(agg.total_risk_amount)
        .bind(agg.total_vol_amount)
        .bind(agg.margin_used)
        .execute(&mut **tx)
        .await
        .context("insert aggregate")?,
        Some((version,)) => sqlx::query(
            "update portfolio_aggregate set \
               initial_capital = $1, closed_equity = $2, total_risk_amount = $3, \
               total_vol_amount = $4, margin_used = $5, version = $6, updated_at = now() \
             where id = 1 and version = $7",
        )
        .bind(agg.initial_capital)
        .bind(agg.closed_equity)
        .bind(agg.total_risk_amount)
        .bind(agg.total_vol_amount)
        .bind(agg.margin_used)
        .bind(version + 1)
        .bind(version)
        .execute(&mut **tx)
        .await
        .context("update aggregate")?,
    };
    Ok(done.rows_affected() == 1)
}

fn status_str(status: PositionStatus) -> &'static str {
    match status {
        PositionStatus::Open => "open",
        PositionStatus::Closed => "closed",
    }
}

fn position_from_row(row: &sqlx::postgres::PgRow) -> Result<Position> {
    let instrument_raw: String = row.try_get("instrument").context("positions.instrument")?;
    let instrument = Instrument::from_wire(&instrument_raw).ok_or_else(|| {
        anyhow!(DataShapeError(format!(
            "unknown instrument `{instrument_raw}`"
        )))
    })?;
    let status_raw: String = row.try_get("status").context("positions.status")?;
    let status = match status_raw.as_str() {
        "open" => PositionStatus::Open,
        "closed" => PositionStatus::Closed,
        other => {
            return Err(anyhow!(DataShapeError(format!(
                "unknown position status `{other}`"
            ))))
        }
    };
    let slot_raw: String = row.try_get("slot").context("positions.slot")?;
    let opened_at: DateTime<Utc> = row.try_get("opened_at").context("positions.opened_at")?;

    Ok(Position {
        id: PositionId::from_raw(row.try_get::<String, _>("id").context("positions.id")?),
        instrument,
        slot: Slot::from_wire(&slot_raw),
        is_base_position: row.try_get("is_base_position")?,
        entry_price: row.try_get("entry_price")?,
        initial_stop: row.try_get("initial_stop")?,
        current_stop: row.try_get("current_stop")?,
        highest_close: row.try_get("highest_close")?,
        lots: row.try_get("lots")?,
        atr_at_entry: row.try_get("atr_at_entry")?,
        pe_entry_price: row.try_get("pe_entry_price")?,
        ce_entry_price: row.try_get("ce_entry_price")?,
        status,
        opened_at,
        closed_at: row.try_get("closed_at")?,
        realized_pnl: row.try_get("realized_pnl")?,
        version: row.try_get("version")?,
    })
}
