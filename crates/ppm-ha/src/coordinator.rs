use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{error, info, warn};

use ppm_config::HaConfig;
use ppm_db::{InstanceBeat, LeadershipAudit};

use crate::instance_id::InstanceId;
use crate::lease::Lease;
use crate::metrics::{HaMetrics, HaMetricsSnapshot};

/// Database half of the heartbeat. A port so the coordinator state machine
/// is testable without Postgres.
#[async_trait]
pub trait DbSync: Send + Sync {
    async fn heartbeat(&self, beat: &InstanceBeat) -> Result<()>;
    async fn leader(&self, fresh_s: i64) -> Result<Option<String>>;
    async fn audit_acquired(&self, instance_id: &str, hostname: &str, at: DateTime<Utc>)
        -> Result<()>;
    async fn audit_released(&self, instance_id: &str) -> Result<()>;
}

/// Production sync against instance_metadata / leadership_history.
pub struct PgDbSync {
    pool: PgPool,
}

impl PgDbSync {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DbSync for PgDbSync {
    async fn heartbeat(&self, beat: &InstanceBeat) -> Result<()> {
        ppm_db::upsert_heartbeat(&self.pool, beat).await
    }

    async fn leader(&self, fresh_s: i64) -> Result<Option<String>> {
        Ok(ppm_db::db_leader(&self.pool, fresh_s)
            .await?
            .map(|l| l.instance_id))
    }

    async fn audit_acquired(
        &self,
        instance_id: &str,
        hostname: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        LeadershipAudit::record_acquired(&self.pool, instance_id, hostname, at).await
    }

    async fn audit_released(&self, instance_id: &str) -> Result<()> {
        LeadershipAudit::record_released(&self.pool, instance_id).await
    }
}

// ---------------------------------------------------------------------------
// Split-brain verdict (pure)
// ---------------------------------------------------------------------------

/// What split-brain detection concluded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SplitBrainAction {
    /// Cache and database agree (or there is nothing to compare).
    Consistent,
    /// Disagreement where the database names someone else while we hold (or
    /// believe we hold) leadership: we must demote ourselves.
    AutoDemote { db_leader: String },
    /// Disagreement between two other instances; observed and logged, not
    /// ours to fix.
    ForeignDispute { cache_leader: String, db_leader: String },
}

/// Pure verdict from the two leader views.
///
/// The database view wins disputes: it is synced on every heartbeat and
/// survives cache restarts, so when it names a different live leader we step
/// down rather than fight.
pub fn split_brain_verdict(
    me: &str,
    i_am_leader: bool,
    cache_leader: Option<&str>,
    db_leader: Option<&str>,
) -> SplitBrainAction {
    match (cache_leader, db_leader) {
        (Some(c), Some(d)) if c != d => {
            if d != me && (i_am_leader || c == me) {
                SplitBrainAction::AutoDemote {
                    db_leader: d.to_string(),
                }
            } else if d == me && !i_am_leader {
                // The DB still carries our stale leader row; harmless, the
                // next heartbeat overwrites it.
                SplitBrainAction::Consistent
            } else {
                SplitBrainAction::ForeignDispute {
                    cache_leader: c.to_string(),
                    db_leader: d.to_string(),
                }
            }
        }
        (None, Some(d)) if i_am_leader && d != me => SplitBrainAction::AutoDemote {
            db_leader: d.to_string(),
        },
        _ => SplitBrainAction::Consistent,
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

struct CoordState {
    is_leader: bool,
    leader_acquired_at: Option<DateTime<Utc>>,
    beats: u64,
    split_brain_detected: bool,
}

/// Snapshot served by GET /coordinator/leader.
#[derive(Clone, Debug, Serialize)]
pub struct CoordinatorStatus {
    pub instance_id: String,
    pub is_leader: bool,
    pub cache_leader: Option<String>,
    pub db_leader: Option<String>,
    pub split_brain: bool,
    pub metrics: HaMetricsSnapshot,
}

/// Per-instance HA coordinator. State machine: Starting → Follower ⇄ Leader;
/// terminal on process exit.
pub struct HaCoordinator {
    lease: Arc<dyn Lease>,
    db: Arc<dyn DbSync>,
    cfg: HaConfig,
    instance: String,
    hostname: String,
    started_at: DateTime<Utc>,
    state: Mutex<CoordState>,
    metrics: HaMetrics,
}

impl HaCoordinator {
    pub fn new(
        lease: Arc<dyn Lease>,
        db: Arc<dyn DbSync>,
        cfg: HaConfig,
        instance: &InstanceId,
        hostname: String,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            lease,
            db,
            cfg,
            instance: instance.to_string(),
            hostname,
            started_at,
            state: Mutex::new(CoordState {
                is_leader: false,
                leader_acquired_at: None,
                beats: 0,
                split_brain_detected: false,
            }),
            metrics: HaMetrics::new(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance
    }

    /// Leader-only admission check used by the signal pipeline. Lock-free
    /// callers read a point-in-time answer; the engine re-checks around its
    /// persistence write.
    pub fn is_leader(&self) -> bool {
        self.state.lock().expect("coordinator lock poisoned").is_leader
    }

    pub fn metrics(&self) -> &HaMetrics {
        &self.metrics
    }

    /// One heartbeat: renew-or-acquire the lease, sync the database row,
    /// periodically cross-check for split brain.
    pub async fn heartbeat_once(&self) -> Result<()> {
        let was_leader = self.is_leader();

        if was_leader {
            match self.lease.renew(&self.instance, self.cfg.leader_ttl_s).await {
                Ok(true) => {}
                Ok(false) => self.demote("lease renewal lost the lock").await,
                Err(e) => {
                    // Cache unreachable: keep the flag until the TTL story
                    // resolves; the split-brain check will demote if another
                    // instance takes over meanwhile.
                    warn!(error = %e, "lease renewal errored; cache unreachable?");
                }
            }
        } else {
            match self
                .lease
                .try_acquire(&self.instance, self.cfg.leader_ttl_s)
                .await
            {
                Ok(true) => self.promote().await,
                Ok(false) => {}
                Err(e) => warn!(error = %e, "lease acquisition errored; cache unreachable?"),
            }
        }

        self.sync_db().await;

        let run_split_brain = {
            let mut st = self.state.lock().expect("coordinator lock poisoned");
            st.beats += 1;
            self.cfg.split_brain_every_n_beats > 0
                && st.beats % self.cfg.split_brain_every_n_beats as u64 == 0
        };
        if run_split_brain {
            self.detect_split_brain().await?;
        }
        Ok(())
    }

    /// Cross-check cache-side and database-side leadership. On a verdict of
    /// AutoDemote the cache lock is released FIRST and only then is the
    /// local flag cleared; reversing the order would make the scripted
    /// compare-and-delete a no-op because renewals have already stopped.
    pub async fn detect_split_brain(&self) -> Result<SplitBrainAction> {
        let cache_leader = self.lease.current_holder().await.unwrap_or_else(|e| {
            warn!(error = %e, "cache leader read failed during split-brain check");
            None
        });
        let db_leader = self.db.leader(self.cfg.db_leader_fresh_s).await?;

        let verdict = split_brain_verdict(
            &self.instance,
            self.is_leader(),
            cache_leader.as_deref(),
            db_leader.as_deref(),
        );

        match &verdict {
            SplitBrainAction::Consistent => {
                let mut st = self.state.lock().expect("coordinator lock poisoned");
                st.split_brain_detected = false;
            }
            SplitBrainAction::AutoDemote { db_leader } => {
                error!(
                    db_leader,
                    cache_leader = cache_leader.as_deref().unwrap_or("<none>"),
                    "🚨 split brain: database names another leader; auto-demoting"
                );
                self.state
                    .lock()
                    .expect("coordinator lock poisoned")
                    .split_brain_detected = true;
                // Release first, flag second. See method doc.
                if let Err(e) = self.lease.release(&self.instance).await {
                    warn!(error = %e, "release during auto-demotion failed");
                }
                self.demote("split-brain auto-demotion").await;
            }
            SplitBrainAction::ForeignDispute {
                cache_leader,
                db_leader,
            } => {
                error!(
                    cache_leader,
                    db_leader, "🚨 split brain observed between other instances"
                );
                self.state
                    .lock()
                    .expect("coordinator lock poisoned")
                    .split_brain_detected = true;
            }
        }
        Ok(verdict)
    }

    /// Graceful release on shutdown.
    pub async fn release_leadership(&self) {
        if !self.is_leader() {
            return;
        }
        if let Err(e) = self.lease.release(&self.instance).await {
            warn!(error = %e, "graceful lease release failed");
        }
        self.demote("graceful shutdown").await;
    }

    /// Status for the coordinator endpoint.
    pub async fn status(&self) -> CoordinatorStatus {
        let cache_leader = self.lease.current_holder().await.unwrap_or(None);
        let db_leader = self.db.leader(self.cfg.db_leader_fresh_s).await.unwrap_or(None);
        let st = self.state.lock().expect("coordinator lock poisoned");
        CoordinatorStatus {
            instance_id: self.instance.clone(),
            is_leader: st.is_leader,
            cache_leader,
            db_leader,
            split_brain: st.split_brain_detected,
            metrics: self.metrics.snapshot(),
        }
    }

    /// Heartbeat loop: every TTL/2 until shutdown, then graceful release.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_secs((self.cfg.leader_ttl_s / 2).max(1));
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.heartbeat_once().await {
                        warn!(error = %e, "heartbeat iteration failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        self.release_leadership().await;
                        info!("ha coordinator stopped");
                        return;
                    }
                }
            }
        }
    }

    async fn promote(&self) {
        let now = Utc::now();
        {
            let mut st = self.state.lock().expect("coordinator lock poisoned");
            st.is_leader = true;
            st.leader_acquired_at = Some(now);
        }
        self.metrics.record_leadership_change();
        // Loud but without the alert marker: acquisition is a routine
        // handoff, only loss and split-brain should page.
        error!(instance = %self.instance, "leadership ACQUIRED");
        if let Err(e) = self
            .db
            .audit_acquired(&self.instance, &self.hostname, now)
            .await
        {
            warn!(error = %e, "leadership audit write failed");
        }
    }

    async fn demote(&self, why: &str) {
        {
            let mut st = self.state.lock().expect("coordinator lock poisoned");
            if !st.is_leader {
                return;
            }
            st.is_leader = false;
            st.leader_acquired_at = None;
        }
        self.metrics.record_leadership_change();
        error!(instance = %self.instance, why, "🚨 leadership LOST");
        if let Err(e) = self.db.audit_released(&self.instance).await {
            warn!(error = %e, "leadership audit write failed");
        }
    }

    async fn sync_db(&self) {
        let (is_leader, leader_acquired_at) = {
            let st = self.state.lock().expect("coordinator lock poisoned");
            (st.is_leader, st.leader_acquired_at)
        };
        let beat = InstanceBeat {
            instance_id: self.instance.clone(),
            hostname: self.hostname.clone(),
            started_at: self.started_at,
            is_leader,
            leader_acquired_at,
        };
        let begun = std::time::Instant::now();
        let outcome = self.db.heartbeat(&beat).await;
        let ok = outcome.is_ok();
        if let Err(e) = outcome {
            warn!(error = %e, "instance heartbeat db sync failed");
        }
        self.metrics.record_db_sync(begun.elapsed(), ok, Utc::now());
    }
}
