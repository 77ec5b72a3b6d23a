use std::fs;

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};

use crate::types::AppConfig;

/// A loaded configuration plus the hash of the file as written on disk.
///
/// The hash is computed over the raw bytes BEFORE `${VAR}` substitution, so
/// secrets injected from the environment never influence (or leak through)
/// the logged config hash.
#[derive(Clone, Debug)]
pub struct LoadedConfig {
    pub config: AppConfig,
    pub config_hash: String,
}

/// Read, substitute, parse, and validate the config file.
pub fn load_config(path: &str) -> Result<LoadedConfig> {
    let raw = fs::read_to_string(path).with_context(|| format!("read config: {path}"))?;

    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    let config_hash = hex::encode(hasher.finalize());

    let substituted = substitute_env(&raw)?;
    let config: AppConfig =
        serde_json::from_str(&substituted).with_context(|| format!("parse config: {path}"))?;
    config.validate().context("config validation failed")?;

    Ok(LoadedConfig {
        config,
        config_hash,
    })
}

/// Replace every `${NAME}` with the value of environment variable `NAME`.
/// A referenced-but-unset variable is a hard error: a config that silently
/// substitutes the empty string produces confusing connect failures later.
fn substitute_env(raw: &str) -> Result<String> {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            bail!("unterminated ${{...}} placeholder in config");
        };
        let name = &after[..end];
        if name.is_empty() || !name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
            bail!("invalid environment placeholder `${{{name}}}`");
        }
        let value =
            std::env::var(name).with_context(|| format!("config references unset env var {name}"))?;
        // Substitution happens inside JSON string literals; escape accordingly.
        let escaped = serde_json::to_string(&value)?;
        out.push_str(escaped.trim_matches('"'));
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().expect("tempfile");
        f.write_all(contents.as_bytes()).expect("write");
        f
    }

    #[test]
    fn loads_minimal_config() {
        let f = write_temp(r#"{"initial_capital": 5000000}"#);
        let loaded = load_config(f.path().to_str().unwrap()).expect("load");
        assert_eq!(loaded.config.initial_capital, 5_000_000.0);
        assert_eq!(loaded.config_hash.len(), 64);
    }

    #[test]
    fn unknown_top_level_key_rejected() {
        let f = write_temp(r#"{"initial_capital": 1, "risk_pct": 0.01}"#);
        assert!(load_config(f.path().to_str().unwrap()).is_err());
    }

    #[test]
    fn env_substitution_fills_secrets() {
        std::env::set_var("PPM_TEST_DB_URL", "postgres://u:p@db/ppm");
        let f = write_temp(
            r#"{"initial_capital": 1, "db": {"url": "${PPM_TEST_DB_URL}", "max_connections": 5}}"#,
        );
        let loaded = load_config(f.path().to_str().unwrap()).expect("load");
        assert_eq!(loaded.config.db.url, "postgres://u:p@db/ppm");
    }

    #[test]
    fn unset_env_var_is_an_error() {
        let f = write_temp(
            r#"{"initial_capital": 1, "db": {"url": "${PPM_DEFINITELY_UNSET_VAR}", "max_connections": 5}}"#,
        );
        assert!(load_config(f.path().to_str().unwrap()).is_err());
    }

    #[test]
    fn hash_ignores_environment_values() {
        std::env::set_var("PPM_TEST_SECRET_A", "one");
        let f = write_temp(
            r#"{"initial_capital": 1, "db": {"url": "${PPM_TEST_SECRET_A}", "max_connections": 5}}"#,
        );
        let first = load_config(f.path().to_str().unwrap()).expect("load").config_hash;
        std::env::set_var("PPM_TEST_SECRET_A", "two");
        let second = load_config(f.path().to_str().unwrap()).expect("load").config_hash;
        assert_eq!(first, second);
    }
}
