//! Host metrics snapshot for the current-state report and the admin API.

use serde::Serialize;
use sysinfo::{Components, Disks, System};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Default, Serialize)]
pub struct HostMetrics {
    /// Percent across all cores.
    pub cpu_usage: f32,
    pub cpu_temp: Option<f32>,
    /// Bytes.
    pub memory_usage: u64,
    pub memory_total: u64,
    pub storage_usage: u64,
    pub storage_total: u64,
    /// Seconds since boot.
    pub uptime: u64,
    pub os_version: Option<String>,
    pub ip_address: Option<String>,
}

pub struct MetricsCollector {
    system: Mutex<System>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    pub async fn collect(&self) -> HostMetrics {
        let (cpu_usage, memory_usage, memory_total) = {
            let mut system = self.system.lock().await;
            system.refresh_cpu();
            system.refresh_memory();
            (
                system.global_cpu_info().cpu_usage(),
                system.used_memory(),
                system.total_memory(),
            )
        };

        let disks = Disks::new_with_refreshed_list();
        let (storage_total, storage_available) = disks
            .iter()
            .fold((0u64, 0u64), |(total, avail), disk| {
                (total + disk.total_space(), avail + disk.available_space())
            });

        let components = Components::new_with_refreshed_list();
        let cpu_temp = components
            .iter()
            .find(|c| {
                let label = c.label().to_lowercase();
                label.contains("cpu") || label.contains("package")
            })
            .map(|c| c.temperature());

        HostMetrics {
            cpu_usage,
            cpu_temp,
            memory_usage,
            memory_total,
            storage_usage: storage_total.saturating_sub(storage_available),
            storage_total,
            uptime: System::uptime(),
            os_version: System::long_os_version(),
            ip_address: local_ip(),
        }
    }
}

/// Best-effort local address: the source address of an unconnected UDP
/// socket "towards" a public host. No packets are sent.
fn local_ip() -> Option<String> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    Some(socket.local_addr().ok()?.ip().to_string())
}
