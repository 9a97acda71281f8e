//! Configuration for an executor node.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use fleet_id::NodeId;

/// Executor configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Unique identifier for this node.
    pub node_id: NodeId,

    /// Address instances on this node are reachable at.
    pub host_address: String,

    /// Lease duration requested from each controller.
    pub lease_duration: Duration,

    /// Registration attempts per controller after the first one fails.
    pub registration_retries: u32,

    /// Fixed delay between registration attempts.
    pub registration_retry_delay: Duration,

    /// Maximum number of instances this node hosts.
    pub service_limit: u32,

    /// Utilization at or above which the node reports itself out of range.
    pub capacity_threshold: f64,

    /// Hard timeout on user startup code.
    pub activation_timeout: Duration,

    /// Concurrent activations.
    pub activation_workers: usize,

    /// Directory for the state store; `None` keeps no on-disk state.
    pub data_dir: Option<PathBuf>,

    /// Interval between resource measurements.
    pub resource_poll_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        // Node ID can be provided or auto-generated
        let node_id = match std::env::var("FLEET_NODE_ID") {
            Ok(raw) => raw
                .parse()
                .with_context(|| format!("invalid FLEET_NODE_ID: {raw}"))?,
            Err(_) => defaults.node_id,
        };

        let host_address =
            std::env::var("FLEET_HOST_ADDRESS").unwrap_or_else(|_| defaults.host_address.clone());

        let lease_duration = Duration::from_secs(env_or("FLEET_LEASE_SECS", 30)?);
        let registration_retries = env_or("FLEET_REGISTRATION_RETRIES", 3)?;
        let registration_retry_delay =
            Duration::from_millis(env_or("FLEET_REGISTRATION_RETRY_DELAY_MS", 1_000)?);
        let service_limit = env_or("FLEET_SERVICE_LIMIT", 100)?;
        let capacity_threshold: f64 = env_or("FLEET_CAPACITY_THRESHOLD", 0.9)?;
        if !(0.0..=1.0).contains(&capacity_threshold) {
            anyhow::bail!("FLEET_CAPACITY_THRESHOLD must be within 0.0..=1.0");
        }
        let activation_timeout =
            Duration::from_secs(env_or("FLEET_ACTIVATION_TIMEOUT_SECS", 60)?);
        let activation_workers: usize = env_or("FLEET_ACTIVATION_WORKERS", 4)?;
        let data_dir = std::env::var("FLEET_DATA_DIR").ok().map(PathBuf::from);
        let resource_poll_interval = Duration::from_secs(env_or("FLEET_RESOURCE_POLL_SECS", 5)?);

        Ok(Self {
            node_id,
            host_address,
            lease_duration,
            registration_retries,
            registration_retry_delay,
            service_limit,
            capacity_threshold,
            activation_timeout,
            activation_workers: activation_workers.max(1),
            data_dir,
            resource_poll_interval,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: NodeId::new(),
            host_address: "127.0.0.1".to_string(),
            lease_duration: Duration::from_secs(30),
            registration_retries: 3,
            registration_retry_delay: Duration::from_secs(1),
            service_limit: 100,
            capacity_threshold: 0.9,
            activation_timeout: Duration::from_secs(60),
            activation_workers: 4,
            data_dir: None,
            resource_poll_interval: Duration::from_secs(5),
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
