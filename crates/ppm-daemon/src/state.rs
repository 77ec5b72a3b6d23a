use std::sync::Arc;

use ppm_config::PipelineConfig;
use ppm_db::Persistence;
use ppm_engine::LiveEngine;
use ppm_ha::{HaCoordinator, RedisLease};

use crate::rate_limit::IpRateLimiter;

/// Static build metadata for /health.
#[derive(Clone, Copy, Debug)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

/// Cloneable (Arc) handle shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<LiveEngine>,
    /// Absent in single-instance deployments; webhooks are then always
    /// admitted locally and /coordinator/leader answers 503.
    pub coordinator: Option<Arc<HaCoordinator>>,
    /// Absent when the daemon was started without a reachable database.
    pub persistence: Option<Arc<Persistence>>,
    /// Cache handle for readiness pings.
    pub lease: Option<Arc<RedisLease>>,
    pub rate_limiter: Arc<IpRateLimiter>,
    pub pipeline: PipelineConfig,
    pub build: BuildInfo,
}

impl AppState {
    pub fn new(
        engine: Arc<LiveEngine>,
        coordinator: Option<Arc<HaCoordinator>>,
        persistence: Option<Arc<Persistence>>,
        lease: Option<Arc<RedisLease>>,
        pipeline: PipelineConfig,
    ) -> Self {
        let rate_limiter = Arc::new(IpRateLimiter::new(pipeline.rate_limit_per_min));
        Self {
            engine,
            coordinator,
            persistence,
            lease,
            rate_limiter,
            pipeline,
            build: BuildInfo {
                service: "ppm-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
        }
    }
}
