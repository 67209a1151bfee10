use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sysinfo::{Disks, Networks, System};
use tokio::task;

use crate::clock::{Clock, format_calendar_date, format_clock_time};

const BYTES_PER_GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Host snapshot pushed as `systemStats`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStats {
    pub cpu: CpuLoad,
    pub mem: MemoryUsage,
    pub disk: Vec<DiskUsage>,
    pub network: Vec<NetworkUsage>,
    pub os_info: OsInfo,
    pub time: String,
    pub date: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuLoad {
    pub current_load: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryUsage {
    pub total: u64,
    pub used: u64,
    pub free: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskUsage {
    pub fs: String,
    pub mount: String,
    pub size: u64,
    pub used: u64,
    /// Percent of `size` in use.
    #[serde(rename = "use")]
    pub use_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkUsage {
    pub iface: String,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OsInfo {
    pub platform: String,
    pub distro: Option<String>,
    pub release: Option<String>,
    pub kernel: Option<String>,
    pub hostname: Option<String>,
    pub arch: String,
}

impl SystemStats {
    /// Multi-line summary spoken for a system-stats query.
    pub fn summary(&self) -> String {
        let disk = self
            .disk
            .first()
            .map(|disk| format!("{:.1}% full", disk.use_percent))
            .unwrap_or_else(|| "unavailable".into());
        format!(
            "System status:\nCPU: {:.1}%\nRAM: {:.1}GB used\nDisk: {}",
            self.cpu.current_load,
            self.mem.used as f64 / BYTES_PER_GIB,
            disk
        )
    }
}

#[async_trait]
pub trait StatsProvider: Send + Sync {
    async fn snapshot(&self) -> Result<SystemStats>;
}

/// `sysinfo`-backed sampler. CPU load is measured between consecutive refreshes.
pub struct SysinfoStats {
    system: Arc<Mutex<System>>,
    clock: Arc<dyn Clock>,
}

impl SysinfoStats {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        system.refresh_memory();
        Self {
            system: Arc::new(Mutex::new(system)),
            clock,
        }
    }
}

#[async_trait]
impl StatsProvider for SysinfoStats {
    async fn snapshot(&self) -> Result<SystemStats> {
        let system = Arc::clone(&self.system);
        let now = self.clock.now();
        task::spawn_blocking(move || -> Result<SystemStats> {
            let mut system = system
                .lock()
                .map_err(|_| anyhow!("system sampler lock poisoned"))?;
            system.refresh_cpu_usage();
            system.refresh_memory();

            let disks = Disks::new_with_refreshed_list();
            let networks = Networks::new_with_refreshed_list();

            Ok(SystemStats {
                cpu: CpuLoad {
                    current_load: f64::from(system.global_cpu_usage()),
                },
                mem: MemoryUsage {
                    total: system.total_memory(),
                    used: system.used_memory(),
                    free: system.free_memory(),
                },
                disk: disks
                    .list()
                    .iter()
                    .map(|disk| {
                        disk_usage(
                            disk.name().to_string_lossy().to_string(),
                            disk.mount_point().to_string_lossy().to_string(),
                            disk.total_space(),
                            disk.available_space(),
                        )
                    })
                    .collect(),
                network: networks
                    .iter()
                    .map(|(name, data)| NetworkUsage {
                        iface: name.clone(),
                        rx_bytes: data.total_received(),
                        tx_bytes: data.total_transmitted(),
                    })
                    .collect(),
                os_info: OsInfo {
                    platform: std::env::consts::OS.to_string(),
                    distro: System::name(),
                    release: System::os_version(),
                    kernel: System::kernel_version(),
                    hostname: System::host_name(),
                    arch: std::env::consts::ARCH.to_string(),
                },
                time: format_clock_time(now),
                date: format_calendar_date(now),
            })
        })
        .await
        .context("system stats worker panicked")?
    }
}

pub fn disk_usage(fs: String, mount: String, size: u64, available: u64) -> DiskUsage {
    let used = size.saturating_sub(available);
    let use_percent = if size == 0 {
        0.0
    } else {
        used as f64 / size as f64 * 100.0
    };
    DiskUsage {
        fs,
        mount,
        size,
        used,
        use_percent,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_stats() -> SystemStats {
        SystemStats {
            cpu: CpuLoad {
                current_load: 12.345,
            },
            mem: MemoryUsage {
                total: 16 * 1024 * 1024 * 1024,
                used: 6 * 1024 * 1024 * 1024 + 512 * 1024 * 1024,
                free: 9 * 1024 * 1024 * 1024,
            },
            disk: vec![disk_usage("/dev/sda1".into(), "/".into(), 1000, 250)],
            network: vec![NetworkUsage {
                iface: "eth0".into(),
                rx_bytes: 10,
                tx_bytes: 20,
            }],
            os_info: OsInfo {
                platform: "linux".into(),
                distro: Some("Arch Linux".into()),
                release: None,
                kernel: None,
                hostname: Some("box".into()),
                arch: "x86_64".into(),
            },
            time: "2:05:00 PM".into(),
            date: "10/14/2026".into(),
        }
    }

    #[test]
    fn summary_uses_first_disk_and_gigabytes() {
        assert_eq!(
            sample_stats().summary(),
            "System status:\nCPU: 12.3%\nRAM: 6.5GB used\nDisk: 75.0% full"
        );
    }

    #[test]
    fn summary_without_disks_reports_unavailable() {
        let mut stats = sample_stats();
        stats.disk.clear();
        assert!(stats.summary().ends_with("Disk: unavailable"));
    }

    #[test]
    fn zero_sized_disk_is_zero_percent() {
        let disk = disk_usage("tmpfs".into(), "/run".into(), 0, 0);
        assert_eq!(disk.use_percent, 0.0);
        assert_eq!(disk.used, 0);
    }

    #[test]
    fn wire_shape_matches_client_expectations() {
        let value = serde_json::to_value(sample_stats()).expect("json");
        assert_eq!(value["cpu"]["currentLoad"], 12.345);
        assert_eq!(value["disk"][0]["use"], 75.0);
        assert!(value["mem"]["used"].is_u64());
        assert_eq!(value["osInfo"]["platform"], "linux");
    }

    #[tokio::test]
    async fn sysinfo_snapshot_is_populated() {
        let sampler = SysinfoStats::new(Arc::new(crate::clock::SystemClock));
        let stats = sampler.snapshot().await.expect("snapshot");
        assert!(stats.mem.total > 0);
        assert!(stats.cpu.current_load >= 0.0);
        assert!(!stats.os_info.arch.is_empty());
    }
}
