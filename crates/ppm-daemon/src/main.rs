//! ppm-daemon entry point: load config, recover state, wire the coordinator
//! and engine, serve HTTP until ctrl-c, release leadership on the way out.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{error, info, Level};

use ppm_config::load_config;
use ppm_daemon::{routes, state::AppState};
use ppm_db::Persistence;
use ppm_engine::{EngineHandles, LeaderGate, LiveEngine};
use ppm_execution::HttpBroker;
use ppm_ha::{HaCoordinator, InstanceId, PgDbSync, RedisLease};
use ppm_portfolio::PortfolioState;
use ppm_recovery::{load_state_or_empty, RecoveryError};
use ppm_signal::{Instrument, SystemClock};
use ppm_validate::ValidatorMetrics;

const ENV_CONFIG_PATH: &str = "PPM_CONFIG";

#[tokio::main]
async fn main() -> Result<()> {
    // Dev convenience; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var(ENV_CONFIG_PATH).ok())
        .unwrap_or_else(|| "ppm.json".to_string());
    let loaded = load_config(&config_path)?;
    let cfg = loaded.config;
    info!(config = %config_path, hash = %loaded.config_hash, "configuration loaded");

    let instance = InstanceId::load_or_create(&cfg.ha.instance_id_path)?;
    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
    info!(instance = %instance, %hostname, "instance identity");

    // Database. A live deployment should have one; we keep serving (with
    // loud errors) when it is unreachable so webhooks can still be answered.
    let persistence = match ppm_db::connect(&cfg.db.url, cfg.db.max_connections).await {
        Ok(pool) => {
            ppm_db::migrate(&pool).await?;
            let db = Arc::new(Persistence::new(pool));
            db.init_aggregate(cfg.initial_capital).await?;
            Some(db)
        }
        Err(e) => {
            error!(error = %e, "🚨 starting WITHOUT persistence; dedup and recovery degraded");
            None
        }
    };

    // Shared cache / leader lease.
    let lease = match RedisLease::connect(&cfg.ha.redis_url).await {
        Ok(l) => Some(Arc::new(l)),
        Err(e) => {
            error!(error = %e, "🚨 starting WITHOUT the leader lease; this instance acts alone");
            None
        }
    };

    // Recovery: rebuild the book before anything is admitted.
    let specs: BTreeMap<_, _> = Instrument::ALL
        .iter()
        .map(|i| (*i, cfg.instrument_spec(*i)))
        .collect();
    let portfolio = match &persistence {
        Some(db) => {
            match load_state_or_empty(
                db.as_ref(),
                Some(&instance.to_string()),
                cfg.initial_capital,
                specs.clone(),
            )
            .await
            {
                Ok(book) => book,
                Err(e @ (RecoveryError::DataCorrupt(_) | RecoveryError::ValidationFailed(_))) => {
                    // Terminal by contract: running against a book we cannot
                    // trust diverges from the broker immediately.
                    return Err(anyhow::anyhow!(e)).context("recovery refused the persisted state");
                }
                Err(other) => return Err(anyhow::anyhow!(other)).context("recovery failed"),
            }
        }
        None => PortfolioState::new(cfg.initial_capital, specs),
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // Coordinator (requires both cache and database).
    let coordinator = match (&lease, &persistence) {
        (Some(lease), Some(db)) => {
            let coordinator = Arc::new(HaCoordinator::new(
                Arc::clone(lease) as _,
                Arc::new(PgDbSync::new(db.pool().clone())) as _,
                cfg.ha.clone(),
                &instance,
                hostname.clone(),
                Utc::now(),
            ));
            tokio::spawn(Arc::clone(&coordinator).run(shutdown_rx.clone()));
            Some(coordinator)
        }
        _ => None,
    };

    // Broker gateway + engine.
    let broker = Arc::new(HttpBroker::new(
        &cfg.execution.broker_base_url,
        &cfg.execution.broker_api_key,
        Duration::from_secs(cfg.execution.broker_call_timeout_s),
    )?);
    let leader_gate: Option<Arc<dyn LeaderGate>> = coordinator
        .as_ref()
        .map(|c| Arc::clone(c) as Arc<dyn LeaderGate>);
    let engine = Arc::new(LiveEngine::new(
        cfg.clone(),
        portfolio,
        EngineHandles {
            broker,
            clock: Arc::new(SystemClock::new()),
            persistence: persistence.clone(),
            leader: leader_gate,
            metrics: Arc::new(ValidatorMetrics::new()),
            instance_id: instance.to_string(),
        },
    ));

    spawn_trailing_updater(
        Arc::clone(&engine),
        cfg.pipeline.trail_poll_s,
        shutdown_rx.clone(),
    );

    let shared = Arc::new(AppState::new(
        engine,
        coordinator.clone(),
        persistence,
        lease,
        cfg.pipeline.clone(),
    ));

    let app = routes::build_router(Arc::clone(&shared)).layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    );

    let addr: SocketAddr = cfg
        .pipeline
        .bind_addr
        .parse()
        .with_context(|| format!("invalid bind_addr {}", cfg.pipeline.bind_addr))?;
    info!("ppm-daemon listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server crashed")?;

    // Stop the heartbeat loop and hand the lease back before exiting.
    let _ = shutdown_tx.send(true);
    if let Some(coordinator) = coordinator {
        coordinator.release_leadership().await;
    }
    info!("ppm-daemon stopped");
    Ok(())
}

/// Background trailing-stop refresh: quote-driven ratchet on the configured
/// cadence, stopped by the shutdown watch.
fn spawn_trailing_updater(
    engine: Arc<LiveEngine>,
    poll_s: u64,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(poll_s.max(1)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let advanced = engine.refresh_trailing_stops().await;
                    if advanced > 0 {
                        info!(advanced, "trailing stops advanced");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    });
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "ctrl-c handler failed; running until killed");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
