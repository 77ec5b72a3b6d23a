//! Operator CLI: backtest driver and database maintenance. Live serving is
//! the ppm-daemon binary; this tool covers everything that runs to
//! completion and exits.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use ppm_config::load_config;
use ppm_engine::{backtest_handles, run_backtest};
use ppm_testkit::{FakeClock, PaperBroker};

#[derive(Parser)]
#[command(name = "ppm")]
#[command(about = "Pyramid portfolio manager CLI", long_about = None)]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, global = true, default_value = "ppm.json")]
    config: String,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a JSONL signal stream through the live decision logic.
    Backtest {
        /// Signal file, one webhook JSON body per line.
        #[arg(long)]
        signals: PathBuf,

        /// Override the configured initial capital.
        #[arg(long)]
        capital: Option<f64>,
    },

    /// Database commands.
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    /// Apply embedded migrations.
    Migrate,
    /// Connectivity check.
    Ping,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let loaded = load_config(&cli.config)?;
    let mut cfg = loaded.config;

    match cli.cmd {
        Commands::Backtest { signals, capital } => {
            if let Some(capital) = capital {
                cfg.initial_capital = capital;
            }

            // Deterministic venue: fills at the limit, quotes pinned to each
            // signal's own price, clock pinned to each signal's timestamp.
            let broker = Arc::new(PaperBroker::new());
            let clock = Arc::new(FakeClock::new());

            let broker_for_hook = Arc::clone(&broker);
            let clock_for_hook = Arc::clone(&clock);
            let report = run_backtest(
                cfg,
                &signals,
                backtest_handles(Arc::clone(&broker) as _, Arc::clone(&clock) as _),
                move |signal| {
                    clock_for_hook.set_wall(signal.timestamp);
                    broker_for_hook.set_quote(signal.instrument, signal.price);
                },
            )
            .await?;

            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Db { cmd } => {
            let pool = ppm_db::connect(&cfg.db.url, cfg.db.max_connections).await?;
            match cmd {
                DbCmd::Migrate => {
                    ppm_db::migrate(&pool).await?;
                    println!("migrations applied");
                }
                DbCmd::Ping => {
                    ppm_db::ping(&pool).await?;
                    println!("db ok");
                }
            }
        }
    }
    Ok(())
}
