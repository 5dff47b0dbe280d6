//! Configuration types for the scheduler.

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use lodestar_state::StoreConfig;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Scheduler configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// HTTP API configuration.
    pub api: ApiConfig,
    /// Storage backend.
    pub store: StoreConfig,
    /// Priority decay configuration.
    pub priority: PriorityConfig,
    /// Lease configuration.
    pub lease: LeaseConfig,
    /// Queue cache configuration.
    pub cache: CacheConfig,
    /// Shutdown configuration.
    pub shutdown: ShutdownConfig,
}

impl SchedulerConfig {
    /// Loads `lodestar.toml`, then `path`, then `LODESTAR_*` variables
    /// (`__` separates sections, e.g. `LODESTAR_LEASE__BATCH_SIZE`).
    pub fn load(path: Option<&str>) -> Result<Self, figment::Error> {
        let mut figment = Figment::new().merge(Toml::file("lodestar.toml"));

        if let Some(p) = path {
            figment = figment.merge(Toml::file(p));
        }

        figment
            .merge(Env::prefixed("LODESTAR_").split("__"))
            .extract()
    }
}

/// HTTP API configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Address to listen on.
    pub listen_addr: SocketAddr,
    /// Serve Prometheus metrics at `/metrics`.
    pub metrics_enabled: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8080),
            metrics_enabled: true,
        }
    }
}

/// Priority decay configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PriorityConfig {
    /// Time for a queue's past usage to lose half its weight.
    #[serde(with = "serde_duration_secs")]
    pub half_life: Duration,
    /// Elapsed time assumed for a cluster's first report.
    #[serde(with = "serde_duration_secs")]
    pub default_time_change: Duration,
    /// Attempts at a usage update before giving up on a conflict.
    pub max_update_attempts: u32,
}

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            half_life: Duration::from_secs(20 * 60),
            default_time_change: Duration::from_secs(60),
            max_update_attempts: 3,
        }
    }
}

/// Lease configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// Jobs peeked and claimed per batch.
    pub batch_size: usize,
    /// Floor applied to priorities before inversion.
    pub min_priority: f64,
    /// Reports older than this mark a cluster inactive.
    #[serde(with = "serde_duration_secs")]
    pub cluster_expiry: Duration,
    /// Leases not renewed within this window return to the queue.
    #[serde(with = "serde_duration_secs")]
    pub lease_expiry: Duration,
    /// How often expired leases are swept.
    #[serde(with = "serde_duration_secs")]
    pub expiry_check_interval: Duration,
    /// Deadline for one lease round.
    #[serde(with = "serde_duration_secs")]
    pub request_timeout: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            min_priority: 0.5,
            cluster_expiry: Duration::from_secs(10 * 60),
            lease_expiry: Duration::from_secs(15 * 60),
            expiry_check_interval: Duration::from_secs(60),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Queue cache configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Interval between snapshot rebuilds.
    #[serde(with = "serde_duration_secs")]
    pub refresh_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(10),
        }
    }
}

/// Shutdown configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// How long background tasks get to finish after cancellation.
    #[serde(with = "serde_duration_secs")]
    pub grace_period: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(2),
        }
    }
}

/// Serde helper for Duration as seconds.
mod serde_duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
