//! Linux `/proc` metrics provider.
//!
//! CPU usage is the non-idle share of jiffies between two reads of
//! `/proc/stat`. Memory uses `MemAvailable` (falling back to `MemFree` on old
//! kernels). Disks are the block-device mounts from `/proc/mounts`, sized with
//! `statvfs`. Other platforms report every domain as unsupported.

use super::provider::{
    DiskReading, HostUptime, InterfaceReading, MemoryReading, MetricDomain, MetricsProvider,
    ProviderError, Reading,
};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Gap between the two `/proc/stat` reads of one CPU sample.
pub const CPU_SAMPLE_WINDOW: Duration = Duration::from_millis(250);

/// Aggregate CPU jiffies from the first line of `/proc/stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTimes {
    pub idle: u64,
    pub total: u64,
}

/// Reads host telemetry from procfs.
#[derive(Debug, Clone)]
pub struct ProcMetricsProvider {
    root: PathBuf,
    started_at: Instant,
    cpu_window: Duration,
}

impl Default for ProcMetricsProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcMetricsProvider {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// Read from an alternative procfs mount (containers, tests).
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            started_at: Instant::now(),
            cpu_window: CPU_SAMPLE_WINDOW,
        }
    }

    pub fn with_cpu_window(mut self, window: Duration) -> Self {
        self.cpu_window = window;
        self
    }

    async fn read(&self, name: &str) -> Result<String, ProviderError> {
        let path = self.root.join(name);
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| ProviderError::Failed(format!("read {}: {e}", path.display())))
    }

    async fn cpu(&self) -> Result<Reading, ProviderError> {
        let before = parse_cpu_times(&self.read("stat").await?)
            .ok_or_else(|| ProviderError::Failed("malformed stat".to_owned()))?;
        tokio::time::sleep(self.cpu_window).await;
        let after = parse_cpu_times(&self.read("stat").await?)
            .ok_or_else(|| ProviderError::Failed("malformed stat".to_owned()))?;
        Ok(Reading::Cpu {
            usage_percent: cpu_usage(before, after),
        })
    }

    async fn memory(&self) -> Result<Reading, ProviderError> {
        parse_meminfo(&self.read("meminfo").await?)
            .map(Reading::Memory)
            .ok_or_else(|| ProviderError::Failed("meminfo has no MemTotal".to_owned()))
    }

    async fn disks(&self) -> Result<Reading, ProviderError> {
        let mounts = parse_mounts(&self.read("mounts").await?);
        let disks = tokio::task::spawn_blocking(move || {
            mounts
                .into_iter()
                .filter_map(|mount| match filesystem_usage(Path::new(&mount)) {
                    Ok((total, available)) if total > 0 => {
                        Some(disk_reading(mount, total, available))
                    }
                    Ok(_) => None,
                    Err(e) => {
                        tracing::debug!(mount = %mount, error = %e, "skipping mount");
                        None
                    }
                })
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| ProviderError::Failed(format!("disk probe: {e}")))?;
        Ok(Reading::Disk(disks))
    }

    async fn network(&self) -> Result<Reading, ProviderError> {
        Ok(Reading::Network(parse_net_dev(&self.read("net/dev").await?)))
    }

    async fn uptime(&self) -> Result<Reading, ProviderError> {
        let system_secs = parse_uptime(&self.read("uptime").await?)
            .ok_or_else(|| ProviderError::Failed("malformed uptime".to_owned()))?;
        Ok(Reading::Uptime(HostUptime {
            system_secs,
            process_secs: self.started_at.elapsed().as_secs(),
        }))
    }
}

#[async_trait]
impl MetricsProvider for ProcMetricsProvider {
    async fn sample(&self, domain: MetricDomain) -> Result<Reading, ProviderError> {
        if !cfg!(target_os = "linux") && self.root == Path::new("/proc") {
            return Err(ProviderError::Unsupported);
        }
        match domain {
            MetricDomain::Cpu => self.cpu().await,
            MetricDomain::Memory => self.memory().await,
            MetricDomain::Disk => self.disks().await,
            MetricDomain::Network => self.network().await,
            MetricDomain::Uptime => self.uptime().await,
        }
    }
}

/// Parse the aggregate `cpu` line. `idle` includes `iowait`.
pub fn parse_cpu_times(stat: &str) -> Option<CpuTimes> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .map(str::parse)
        .collect::<Result<_, _>>()
        .ok()?;
    if fields.len() < 4 {
        return None;
    }
    // user nice system idle iowait irq softirq steal; guest is already in user.
    let total: u64 = fields.iter().take(8).sum();
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Some(CpuTimes { idle, total })
}

/// Busy percentage between two readings. Zero when no time elapsed.
pub fn cpu_usage(before: CpuTimes, after: CpuTimes) -> f64 {
    let total = after.total.saturating_sub(before.total);
    if total == 0 {
        return 0.0;
    }
    let idle = after.idle.saturating_sub(before.idle).min(total);
    (total - idle) as f64 / total as f64 * 100.0
}

pub fn parse_meminfo(meminfo: &str) -> Option<MemoryReading> {
    let field = |name: &str| {
        meminfo.lines().find_map(|line| {
            let rest = line.strip_prefix(name)?.strip_prefix(':')?;
            let kb: u64 = rest.split_whitespace().next()?.parse().ok()?;
            Some(kb.saturating_mul(1024))
        })
    };
    let total = field("MemTotal")?;
    let available = field("MemAvailable").or_else(|| field("MemFree"))?;
    let used = total.saturating_sub(available);
    let usage_percent = if total == 0 {
        0.0
    } else {
        used as f64 / total as f64 * 100.0
    };
    Some(MemoryReading {
        usage_percent,
        total_bytes: total,
        used_bytes: used,
    })
}

/// Mount points backed by a block device, each listed once.
pub fn parse_mounts(mounts: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for line in mounts.lines() {
        let mut fields = line.split_whitespace();
        let (Some(device), Some(mount)) = (fields.next(), fields.next()) else {
            continue;
        };
        if !device.starts_with("/dev/") || device.starts_with("/dev/loop") {
            continue;
        }
        let mount = unescape_mount(mount);
        if !seen.contains(&mount) {
            seen.push(mount);
        }
    }
    seen
}

// /proc/mounts escapes space, tab, newline and backslash as octal.
fn unescape_mount(raw: &str) -> String {
    raw.replace("\\040", " ")
        .replace("\\011", "\t")
        .replace("\\012", "\n")
        .replace("\\134", "\\")
}

/// Interface counters, loopback excluded.
pub fn parse_net_dev(net_dev: &str) -> Vec<InterfaceReading> {
    net_dev
        .lines()
        .skip(2)
        .filter_map(|line| {
            let (name, counters) = line.split_once(':')?;
            let name = name.trim();
            if name == "lo" {
                return None;
            }
            let counters: Vec<u64> = counters
                .split_whitespace()
                .map(|c| c.parse().unwrap_or(0))
                .collect();
            if counters.len() < 9 {
                return None;
            }
            Some(InterfaceReading {
                name: name.to_owned(),
                rx_bytes: counters[0],
                tx_bytes: counters[8],
            })
        })
        .collect()
}

/// Whole seconds of system uptime.
pub fn parse_uptime(uptime: &str) -> Option<u64> {
    let secs: f64 = uptime.split_whitespace().next()?.parse().ok()?;
    if secs.is_finite() && secs >= 0.0 {
        Some(secs as u64)
    } else {
        None
    }
}

fn disk_reading(mount: String, total: u64, available: u64) -> DiskReading {
    let used = total.saturating_sub(available);
    DiskReading {
        mount,
        total_bytes: total,
        used_bytes: used,
        usage_percent: used as f64 / total as f64 * 100.0,
    }
}

/// `(total, available)` bytes of the filesystem holding `path`.
#[cfg(unix)]
fn filesystem_usage(path: &Path) -> std::io::Result<(u64, u64)> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }

    // Field widths differ between platforms.
    let blocks: u64 = stat.f_blocks as _;
    let bavail: u64 = stat.f_bavail as _;
    let frsize: u64 = stat.f_frsize as _;
    Ok((blocks.wrapping_mul(frsize), bavail.wrapping_mul(frsize)))
}

#[cfg(not(unix))]
fn filesystem_usage(_path: &Path) -> std::io::Result<(u64, u64)> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "statvfs unavailable",
    ))
}
