//! Controller configuration.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use fleet_id::NodeId;
use fleet_proto::LivenessStrategy;

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,

    /// Interval between full verify passes over every specification.
    pub reconcile_interval: Duration,

    /// Interval between expired-lease sweeps.
    pub lease_reap_interval: Duration,

    /// Longest lease the registry grants.
    pub max_lease: Duration,

    /// Provision requests dispatched concurrently by one `process()` pass.
    pub dispatch_concurrency: usize,

    /// This controller's own node, excluded from fault monitoring.
    pub controller_node_id: Option<NodeId>,

    /// Heartbeat settings applied to specifications that leave them unset.
    pub heartbeat_interval: Duration,
    pub heartbeat_misses: u32,

    /// In-process executors `fleetd` starts.
    pub local_executors: usize,

    /// JSON array of specifications submitted at startup.
    pub specs_path: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let log_level = std::env::var("FLEET_LOG_LEVEL").unwrap_or_else(|_| defaults.log_level.clone());

        let reconcile_interval = Duration::from_secs(env_or(
            "FLEET_RECONCILE_INTERVAL_SECS",
            defaults.reconcile_interval.as_secs(),
        )?);
        let lease_reap_interval = Duration::from_secs(env_or(
            "FLEET_LEASE_REAP_INTERVAL_SECS",
            defaults.lease_reap_interval.as_secs(),
        )?);
        let max_lease = Duration::from_secs(env_or("FLEET_MAX_LEASE_SECS", defaults.max_lease.as_secs())?);
        let dispatch_concurrency: usize =
            env_or("FLEET_DISPATCH_CONCURRENCY", defaults.dispatch_concurrency)?;

        let controller_node_id = match std::env::var("FLEET_CONTROLLER_NODE_ID") {
            Ok(raw) => Some(
                raw.parse()
                    .with_context(|| format!("invalid FLEET_CONTROLLER_NODE_ID: {raw}"))?,
            ),
            Err(_) => None,
        };

        let heartbeat_interval = Duration::from_millis(env_or(
            "FLEET_HEARTBEAT_INTERVAL_MS",
            defaults.heartbeat_interval.as_millis() as u64,
        )?);
        let heartbeat_misses = env_or("FLEET_HEARTBEAT_MISSES", defaults.heartbeat_misses)?;
        let local_executors = env_or("FLEET_LOCAL_EXECUTORS", defaults.local_executors)?;
        let specs_path = std::env::var("FLEET_SPECS_PATH").ok().map(PathBuf::from);

        Ok(Self {
            log_level,
            reconcile_interval,
            lease_reap_interval,
            max_lease,
            dispatch_concurrency: dispatch_concurrency.max(1),
            controller_node_id,
            heartbeat_interval,
            heartbeat_misses: heartbeat_misses.max(1),
            local_executors,
            specs_path,
        })
    }
}

impl Config {
    /// Liveness for specifications that keep the built-in default.
    pub fn default_liveness(&self) -> LivenessStrategy {
        LivenessStrategy::Heartbeat {
            interval_ms: self.heartbeat_interval.as_millis() as u64,
            misses: self.heartbeat_misses,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            reconcile_interval: fleet_reconcile::DEFAULT_RECONCILE_INTERVAL,
            lease_reap_interval: Duration::from_secs(5),
            max_lease: Duration::from_secs(60),
            dispatch_concurrency: 16,
            controller_node_id: None,
            heartbeat_interval: Duration::from_millis(1_000),
            heartbeat_misses: 3,
            local_executors: 2,
            specs_path: None,
        }
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("invalid value for {key}: {raw}")),
        Err(_) => Ok(default),
    }
}
