//! Configuration module for metering-service.

use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct MeteringConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub storage: StorageBackend,
    pub database: DatabaseConfig,
    pub redis: Option<RedisConfig>,
    pub metering: MeteringSettings,
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Postgres,
    Memory,
}

impl StorageBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageBackend::Postgres => "postgres",
            StorageBackend::Memory => "memory",
        }
    }
}

impl FromStr for StorageBackend {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" => Ok(StorageBackend::Postgres),
            "memory" => Ok(StorageBackend::Memory),
            other => Err(AppError::ConfigError(anyhow::anyhow!(
                "Unknown STORAGE_BACKEND: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
}

/// Tunables of the metering core, shared by the ledger, oracle and sweep.
#[derive(Debug, Clone)]
pub struct MeteringSettings {
    /// Line amount differences up to this many minor units are ignored.
    pub rounding_tolerance_cents: i64,
    pub late_arrival_grace: Duration,
    /// Upper bound on events a single simulation may scan.
    pub max_simulation_events: u64,
    pub event_page_size: usize,
    pub lock_ttl: Duration,
    pub lock_wait: Duration,
    pub sweep_concurrency: usize,
}

impl Default for MeteringSettings {
    fn default() -> Self {
        Self {
            rounding_tolerance_cents: 1,
            late_arrival_grace: Duration::from_secs(24 * 60 * 60),
            max_simulation_events: 1_000_000,
            event_page_size: 1_000,
            lock_ttl: Duration::from_secs(60),
            lock_wait: Duration::from_secs(10),
            sweep_concurrency: 8,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub sweep_window_hours: i64,
    pub sweep_interval: Duration,
    pub ledger_tick: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sweep_window_hours: 24,
            sweep_interval: Duration::from_secs(24 * 60 * 60),
            ledger_tick: Duration::from_secs(60),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

impl MeteringConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        let storage = env::var("STORAGE_BACKEND")
            .unwrap_or_else(|_| "postgres".to_string())
            .parse::<StorageBackend>()?;

        let database_url = match storage {
            StorageBackend::Postgres => env::var("DATABASE_URL").map_err(|_| {
                AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
            })?,
            StorageBackend::Memory => env::var("DATABASE_URL").unwrap_or_default(),
        };

        let defaults = MeteringSettings::default();
        let scheduler = SchedulerConfig::default();

        let metering = MeteringSettings {
            rounding_tolerance_cents: env_or(
                "ROUNDING_TOLERANCE_CENTS",
                defaults.rounding_tolerance_cents,
            ),
            late_arrival_grace: env_secs("LATE_ARRIVAL_GRACE_SECS", defaults.late_arrival_grace),
            max_simulation_events: env_or("MAX_SIMULATION_EVENTS", defaults.max_simulation_events),
            event_page_size: env_or("EVENT_PAGE_SIZE", defaults.event_page_size).max(1),
            lock_ttl: env_secs("LOCK_TTL_SECS", defaults.lock_ttl),
            lock_wait: env_secs("LOCK_WAIT_SECS", defaults.lock_wait),
            sweep_concurrency: env_or("SWEEP_CONCURRENCY", defaults.sweep_concurrency).max(1),
        };

        if metering.rounding_tolerance_cents < 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "ROUNDING_TOLERANCE_CENTS must not be negative"
            )));
        }

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "metering-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            storage,
            database: DatabaseConfig {
                url: database_url,
                max_connections: env_or("DATABASE_MAX_CONNECTIONS", 10),
                min_connections: env_or("DATABASE_MIN_CONNECTIONS", 2),
            },
            redis: env::var("REDIS_URL").ok().map(|url| RedisConfig { url }),
            metering,
            scheduler: SchedulerConfig {
                sweep_window_hours: env_or("SWEEP_WINDOW_HOURS", scheduler.sweep_window_hours),
                sweep_interval: env_secs("SWEEP_INTERVAL_SECS", scheduler.sweep_interval),
                ledger_tick: env_secs("LEDGER_TICK_SECS", scheduler.ledger_tick),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_backend_parses_case_insensitively() {
        assert_eq!(
            "Memory".parse::<StorageBackend>().unwrap(),
            StorageBackend::Memory
        );
        assert!("sqlite".parse::<StorageBackend>().is_err());
    }

    #[test]
    fn default_tolerance_is_one_minor_unit() {
        assert_eq!(MeteringSettings::default().rounding_tolerance_cents, 1);
    }
}
