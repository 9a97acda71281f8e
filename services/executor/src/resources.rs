//! Host resource measurement and capability reporting.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use fleet_proto::ResourceCapability;
use tokio::sync::watch;
use tracing::{debug, info, instrument};

use crate::host::ContainerHost;

/// Raw host measurements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemResources {
    pub cpu_cores: u32,
    pub total_memory_bytes: u64,
    pub available_memory_bytes: u64,
}

impl SystemResources {
    pub fn measure() -> Self {
        let cpu_cores = get_cpu_count();
        let (total_memory, available_memory) = get_memory_info();

        Self {
            cpu_cores,
            total_memory_bytes: total_memory,
            available_memory_bytes: available_memory.min(total_memory),
        }
    }
}

fn get_cpu_count() -> u32 {
    #[cfg(unix)]
    {
        let count = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
        if count > 0 {
            return count as u32;
        }
    }

    std::thread::available_parallelism()
        .map(|p| p.get() as u32)
        .unwrap_or(1)
}

#[cfg(target_os = "linux")]
fn get_memory_info() -> (u64, u64) {
    if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
        let (total, available) = parse_meminfo(&meminfo);
        if total > 0 {
            return (total, available);
        }
    }
    sysconf_memory()
}

#[cfg(not(target_os = "linux"))]
fn get_memory_info() -> (u64, u64) {
    sysconf_memory()
}

fn sysconf_memory() -> (u64, u64) {
    #[cfg(unix)]
    {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let total_pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };

        if page_size > 0 && total_pages > 0 {
            let total = (page_size as u64) * (total_pages as u64);
            return (total, total / 2);
        }
    }

    (16 * 1024 * 1024 * 1024, 8 * 1024 * 1024 * 1024)
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_meminfo(content: &str) -> (u64, u64) {
    const KB_TO_BYTES: u64 = 1024;
    let mut total = 0;
    let mut available = 0;
    let mut free = 0;
    let mut buffers = 0;
    let mut cached = 0;

    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let value = value.parse::<u64>().unwrap_or(0) * KB_TO_BYTES;
        match key {
            "MemTotal:" => total = value,
            "MemAvailable:" => available = value,
            "MemFree:" => free = value,
            "Buffers:" => buffers = value,
            "Cached:" => cached = value,
            _ => {}
        }
    }

    if available == 0 {
        available = free + buffers + cached;
    }

    (total, available)
}

/// Source of host measurements.
pub type Probe = Arc<dyn Fn() -> SystemResources + Send + Sync>;

/// Periodically turns host measurements and container reservations into a
/// [`ResourceCapability`], publishing it on a watch channel.
///
/// The channel value is always current, but receivers are only woken when
/// the capability crosses the threshold in either direction.
pub struct ResourceMonitor {
    host: Arc<ContainerHost>,
    threshold: f64,
    interval: Duration,
    attributes: BTreeMap<String, String>,
    probe: Probe,
}

impl ResourceMonitor {
    pub fn new(host: Arc<ContainerHost>, threshold: f64, interval: Duration) -> Self {
        Self {
            host,
            threshold,
            interval,
            attributes: BTreeMap::new(),
            probe: Arc::new(SystemResources::measure),
        }
    }

    pub fn with_probe(mut self, probe: Probe) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_attributes(mut self, attributes: BTreeMap<String, String>) -> Self {
        self.attributes = attributes;
        self
    }

    /// Measure now.
    pub fn sample(&self) -> ResourceCapability {
        let system = (self.probe)();
        let mut capability = self.host.capability(&system, self.threshold);
        capability.attributes = self.attributes.clone();
        capability
    }

    /// A channel seeded with a fresh sample.
    pub fn channel(&self) -> (watch::Sender<ResourceCapability>, watch::Receiver<ResourceCapability>) {
        watch::channel(self.sample())
    }

    /// Run until shutdown, publishing samples to `tx`.
    #[instrument(skip_all, fields(node_id = %self.host.node_id()))]
    pub async fn run(
        self,
        tx: watch::Sender<ResourceCapability>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            interval_secs = self.interval.as_secs(),
            threshold = self.threshold,
            "Starting resource monitor"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let capability = self.sample();
                    if publish(&tx, capability) {
                        info!(within_range = tx.borrow().is_within_range(), "Capacity crossed threshold");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Resource monitor shutting down");
                        break;
                    }
                }
            }
        }
    }
}

/// Store `capability`; wake receivers only on a threshold crossing.
pub fn publish(tx: &watch::Sender<ResourceCapability>, capability: ResourceCapability) -> bool {
    tx.send_if_modified(|current| {
        let crossed = current.is_within_range() != capability.is_within_range();
        debug!(utilization = capability.utilization, crossed, "Resource sample");
        *current = capability;
        crossed
    })
}
