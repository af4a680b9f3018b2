use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;

/// Runtime configuration, read from the environment (`.env` honoured via dotenv).
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    pub database_url: String,
    pub redis_url: String,
    pub admin_addr: String,
    pub providers: Vec<String>,
    /// JSON zone catalog replacing the mock provider's demo zones.
    pub mock_catalog_file: Option<String>,
    pub templates_file: Option<String>,
    pub health_check_port: u16,
    pub health_check_initial_interval: Duration,
    pub health_check_max_interval: Duration,
    pub creation_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub gc_interval: Duration,
    pub gc_stale_after: Duration,
    pub drain_timeout: Duration,
}

impl OrchestratorSettings {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as `from_env` with an injectable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let number = |key: &str, default: u64| -> anyhow::Result<u64> {
            match var(key) {
                Some(raw) => u64::from_str(&raw)
                    .with_context(|| format!("{key} must be a non-negative integer, got '{raw}'")),
                None => Ok(default),
            }
        };

        let database_url = var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let redis_url = var("REDIS_URL").unwrap_or_else(|| "redis://localhost:6379".to_string());
        let admin_addr = var("ADMIN_ADDR").unwrap_or_else(|| "0.0.0.0:8001".to_string());
        let providers = var("PROVIDERS")
            .unwrap_or_else(|| "mock".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let health_check_port = u16::try_from(number("HEALTH_CHECK_PORT", 8484)?)
            .context("HEALTH_CHECK_PORT out of range")?;
        let health_check_initial_interval =
            Duration::from_millis(number("HEALTH_CHECK_INITIAL_INTERVAL_MS", 1000)?);
        let health_check_max_interval =
            Duration::from_millis(number("HEALTH_CHECK_MAX_INTERVAL_MS", 30_000)?);
        if health_check_initial_interval.is_zero()
            || health_check_max_interval < health_check_initial_interval
        {
            anyhow::bail!("health check intervals must satisfy 0 < initial <= max");
        }

        Ok(Self {
            database_url,
            redis_url,
            admin_addr,
            providers,
            mock_catalog_file: var("MOCK_CATALOG_FILE"),
            templates_file: var("TEMPLATES_FILE"),
            health_check_port,
            health_check_initial_interval,
            health_check_max_interval,
            creation_timeout: Duration::from_secs(number("CREATION_TIMEOUT_SECS", 900)?),
            shutdown_timeout: Duration::from_secs(number("SHUTDOWN_TIMEOUT_SECS", 600)?),
            gc_interval: Duration::from_secs(number("GC_INTERVAL_SECS", 60)?.max(1)),
            gc_stale_after: Duration::from_secs(number("GC_STALE_AFTER_SECS", 900)?),
            drain_timeout: Duration::from_secs(number("DRAIN_TIMEOUT_SECS", 30)?),
        })
    }
}
