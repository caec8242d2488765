//! Configuration management for the promotion controller
//!
//! Loads configuration from environment variables with sensible defaults.

use anyhow::{Context, Result};
use promotion_common::MAX_LEASE_TTL_SECS;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Region used when `AWS_REGION` is unset
pub const DEFAULT_REGION: &str = "us-east-1";

/// Which compute API implementation to talk to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Image Registry Service over HTTP
    Http,
    /// In-process, optionally seeded from `SEED_FILE`; nothing persists
    Memory,
}

impl BackendKind {
    fn parse(raw: &str) -> Result<Self> {
        match raw {
            "http" => Ok(BackendKind::Http),
            "memory" => Ok(BackendKind::Memory),
            other => anyhow::bail!("Invalid BACKEND: {} (expected http or memory)", other),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Provider region
    pub region: String,

    pub backend: BackendKind,

    /// Image Registry Service base URL
    pub registry_url: String,

    /// Fixture loaded into the memory backend
    pub seed_file: Option<PathBuf>,

    /// Directory holding rollback records
    pub audit_dir: PathBuf,

    /// Recorded as `initiated_by` / `updated_by`
    pub operator: String,

    pub lease_ttl_secs: u64,

    pub request_timeout_secs: u64,

    pub max_retries: u32,

    /// Set `Production=false` on the image superseded by a rollback
    pub clear_stale_production_flag: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if it exists (for local development)
        dotenvy::dotenv().ok();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let config = Config {
            region: var("AWS_REGION", DEFAULT_REGION),

            backend: BackendKind::parse(&var("BACKEND", "http"))?,

            registry_url: var("REGISTRY_URL", "http://127.0.0.1:8083"),

            seed_file: lookup("SEED_FILE").map(PathBuf::from),

            audit_dir: var("AUDIT_DIR", "./rollback-records").into(),

            operator: lookup("OPERATOR")
                .or_else(|| lookup("USER"))
                .unwrap_or_else(|| "unknown".to_string()),

            lease_ttl_secs: var("LEASE_TTL_SECS", "900")
                .parse()
                .context("Invalid LEASE_TTL_SECS")?,

            request_timeout_secs: var("REQUEST_TIMEOUT_SECS", "30")
                .parse()
                .context("Invalid REQUEST_TIMEOUT_SECS")?,

            max_retries: var("MAX_RETRIES", "2")
                .parse()
                .context("Invalid MAX_RETRIES")?,

            clear_stale_production_flag: var("CLEAR_STALE_PRODUCTION_FLAG", "false")
                .parse()
                .context("Invalid CLEAR_STALE_PRODUCTION_FLAG (expected true/false)")?,
        };

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.region.trim().is_empty() {
            anyhow::bail!("AWS_REGION must not be empty");
        }

        if self.lease_ttl_secs == 0 {
            anyhow::bail!("LEASE_TTL_SECS must be greater than 0");
        }

        if self.lease_ttl_secs > MAX_LEASE_TTL_SECS {
            anyhow::bail!("LEASE_TTL_SECS must be at most {}", MAX_LEASE_TTL_SECS);
        }

        if self.request_timeout_secs == 0 {
            anyhow::bail!("REQUEST_TIMEOUT_SECS must be greater than 0");
        }

        if self.backend == BackendKind::Http
            && !(self.registry_url.starts_with("http://") || self.registry_url.starts_with("https://"))
        {
            anyhow::bail!("REGISTRY_URL must be an http(s) URL when BACKEND=http");
        }

        Ok(())
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_config_defaults() {
        let config = load(&[]).expect("Failed to load config");

        assert_eq!(config.region, "us-east-1");
        assert_eq!(config.backend, BackendKind::Http);
        assert_eq!(config.registry_url, "http://127.0.0.1:8083");
        assert_eq!(config.audit_dir, PathBuf::from("./rollback-records"));
        assert_eq!(config.operator, "unknown");
        assert_eq!(config.lease_ttl(), Duration::from_secs(900));
        assert!(!config.clear_stale_production_flag);
        assert!(config.seed_file.is_none());
    }

    #[test]
    fn test_region_and_operator_overrides() {
        let config = load(&[("AWS_REGION", "eu-central-1"), ("USER", "alice")]).unwrap();
        assert_eq!(config.region, "eu-central-1");
        assert_eq!(config.operator, "alice");

        let config = load(&[("USER", "alice"), ("OPERATOR", "release-bot")]).unwrap();
        assert_eq!(config.operator, "release-bot");
    }

    #[test]
    fn test_memory_backend_with_seed() {
        let config = load(&[("BACKEND", "memory"), ("SEED_FILE", "fixtures/seed.json")]).unwrap();
        assert_eq!(config.backend, BackendKind::Memory);
        assert_eq!(config.seed_file, Some(PathBuf::from("fixtures/seed.json")));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let err = load(&[("LEASE_TTL_SECS", "0")]).unwrap_err();
        assert!(err.to_string().contains("LEASE_TTL_SECS must be greater than 0"));

        let err = load(&[("LEASE_TTL_SECS", "18446744073709551615")]).unwrap_err();
        assert!(err.to_string().contains("LEASE_TTL_SECS must be at most 86400"));
        assert!(load(&[("LEASE_TTL_SECS", "86401")]).is_err());
        assert_eq!(
            load(&[("LEASE_TTL_SECS", "86400")]).unwrap().lease_ttl(),
            Duration::from_secs(86_400)
        );

        assert!(load(&[("BACKEND", "aws")]).is_err());
        assert!(load(&[("REGISTRY_URL", "localhost:8083")]).is_err());
        assert!(load(&[("CLEAR_STALE_PRODUCTION_FLAG", "maybe")]).is_err());
    }
}
