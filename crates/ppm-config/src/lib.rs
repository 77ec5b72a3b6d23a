//! Typed configuration for the portfolio manager.
//!
//! One JSON file, loaded once at startup into [`AppConfig`], passed by
//! reference into components. `${ENV_VAR}` placeholders are substituted from
//! the environment so secrets (DB URL, redis URL, broker key) never live in
//! the file. Unknown keys are rejected outright; a typo'd cap name must not
//! silently fall back to a default.

mod load;
mod types;

pub use load::{load_config, LoadedConfig};
pub use types::{
    AppConfig, DbConfig, ExecutionConfig, ExecutionStrategyKind, HaConfig, PartialFillStrategy,
    PipelineConfig, RiskLimitsConfig, ValidationConfig,
};
