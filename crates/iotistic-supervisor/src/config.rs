use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Environment-first configuration for the device supervisor.
#[derive(Debug, Clone, Parser)]
#[command(name = "iotistic-supervisor", version, about = "Device-side container supervisor")]
pub struct Config {
    /// Base URL of the fleet cloud API.
    #[arg(long, env = "CLOUD_API_URL")]
    pub cloud_api_url: String,

    /// Fleet-scoped key authorizing first-time registration.
    #[arg(long, env = "PROVISIONING_KEY")]
    pub provisioning_key: Option<String>,

    /// Device api-key for pre-provisioned identities. Held in memory only.
    #[arg(long, env = "DEVICE_API_KEY")]
    pub device_api_key: Option<String>,

    #[arg(long, env = "DEVICE_NAME", default_value = "iotistic-device")]
    pub device_name: String,

    #[arg(long, env = "DEVICE_TYPE", default_value = "generic")]
    pub device_type: String,

    /// On-device data directory (store file plus logs/).
    #[arg(long, env = "DATA_DIR", default_value = "/var/lib/iotistic")]
    pub data_dir: PathBuf,

    /// Overrides `{data_dir}/logs` for rotating log files.
    #[arg(long, env = "LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Broker as host or host:port. Messaging and the remote log backend
    /// are disabled when unset.
    #[arg(long, env = "MQTT_BROKER")]
    pub mqtt_broker: Option<String>,

    #[arg(long, env = "MQTT_USERNAME")]
    pub mqtt_username: Option<String>,

    #[arg(long, env = "MQTT_PASSWORD")]
    pub mqtt_password: Option<String>,

    #[arg(long, env = "MQTT_QOS", default_value_t = 0)]
    pub mqtt_qos: u8,

    /// Trace every packet on the messaging transport.
    #[arg(long, env = "MQTT_DEBUG", default_value_t = false)]
    pub mqtt_debug: bool,

    /// Max entries per batched log publish.
    #[arg(long, env = "MQTT_BATCH", default_value_t = 50)]
    pub mqtt_batch: usize,

    /// Drive the real Docker daemon instead of the in-memory runtime.
    #[arg(long, env = "USE_REAL_DOCKER", default_value_t = false)]
    pub use_real_docker: bool,

    /// Empty means the platform default socket.
    #[arg(long, env = "DOCKER_SOCKET", default_value = "")]
    pub docker_socket: String,

    #[arg(long, env = "ADMIN_BIND", default_value = "0.0.0.0")]
    pub admin_bind: String,

    #[arg(long, env = "ADMIN_PORT", default_value_t = 48484)]
    pub admin_port: u16,

    #[arg(long, env = "POLL_INTERVAL_SECS", default_value_t = 10)]
    pub poll_interval_secs: u64,

    #[arg(long, env = "REPORT_INTERVAL_SECS", default_value_t = 10)]
    pub report_interval_secs: u64,

    #[arg(long, env = "METRICS_INTERVAL_SECS", default_value_t = 60)]
    pub metrics_interval_secs: u64,
}

impl Config {
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("supervisor.redb")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("logs"))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs)
    }

    /// Broker "host[:port]" split with the MQTT default port.
    pub fn broker_host_port(&self) -> Option<(String, u16)> {
        let broker = self.mqtt_broker.as_deref()?;
        match broker.rsplit_once(':') {
            Some((host, port)) => match port.parse::<u16>() {
                Ok(port) => Some((host.to_string(), port)),
                Err(_) => Some((broker.to_string(), 1883)),
            },
            None => Some((broker.to_string(), 1883)),
        }
    }

    pub fn mqtt_qos(&self) -> iotistic_messaging::QoS {
        match self.mqtt_qos {
            2 => iotistic_messaging::QoS::ExactlyOnce,
            1 => iotistic_messaging::QoS::AtLeastOnce,
            _ => iotistic_messaging::QoS::AtMostOnce,
        }
    }
}
