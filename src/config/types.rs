//! Configuration data types.

use crate::health::HealthSettings;
use crate::registry::RegistrySettings;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Global settings
    #[serde(default)]
    pub global: GlobalConfig,

    /// Where forwarding groups listen and how many workers they get
    #[serde(default)]
    pub listener: ListenerConfig,

    /// TCP forwarding settings
    #[serde(default)]
    pub tcp: TcpConfig,

    /// UDP forwarding settings
    #[serde(default)]
    pub udp: UdpConfig,

    /// Health monitor settings
    #[serde(default)]
    pub health_check: HealthCheckConfig,

    /// Control server settings
    #[serde(default)]
    pub control: ControlConfig,
}

impl Config {
    /// Settings for the group registry, with `worker_threads: 0` resolved to
    /// the available parallelism.
    pub fn registry_settings(&self) -> RegistrySettings {
        RegistrySettings {
            bind_ip: self.listener.bind_ip,
            worker_threads: self.listener.resolved_worker_threads(),
            tcp_timeout: self.tcp.timeout,
            udp_timeout: self.udp.timeout,
            udp_idle_timeout: self.udp.idle_timeout,
        }
    }

    pub fn health_settings(&self) -> HealthSettings {
        HealthSettings {
            delay: self.health_check.delay,
        }
    }
}

/// Global configuration settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GlobalConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::Json,
            metrics: MetricsConfig::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Metrics endpoint configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Whether metrics endpoint is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Address to bind metrics server
    #[serde(default = "default_metrics_address")]
    pub address: SocketAddr,

    /// Path for metrics endpoint
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: default_metrics_address(),
            path: default_metrics_path(),
        }
    }
}

/// Forwarding group listener settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenerConfig {
    /// IP every group binds to; the port is the backend's port
    #[serde(default = "default_bind_ip")]
    pub bind_ip: IpAddr,

    /// Workers per group; 0 means one per available CPU
    #[serde(default)]
    pub worker_threads: usize,
}

impl ListenerConfig {
    pub fn resolved_worker_threads(&self) -> usize {
        match self.worker_threads {
            0 => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            n => n,
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_ip: default_bind_ip(),
            worker_threads: 0,
        }
    }
}

/// TCP forwarding configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TcpConfig {
    /// Bound on every connect, read and write
    #[serde(default = "default_io_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            timeout: default_io_timeout(),
        }
    }
}

/// UDP forwarding configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UdpConfig {
    /// How long to wait for a backend's reply datagram
    #[serde(default = "default_io_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Receive window after which an idle listener re-checks its state
    #[serde(default = "default_idle_timeout", with = "humantime_serde")]
    pub idle_timeout: Duration,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            timeout: default_io_timeout(),
            idle_timeout: default_idle_timeout(),
        }
    }
}

/// Health monitor configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthCheckConfig {
    /// Pause between probes of one backend
    #[serde(default = "default_health_delay", with = "humantime_serde")]
    pub delay: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            delay: default_health_delay(),
        }
    }
}

/// Control server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControlConfig {
    /// Address the control server listens on
    #[serde(default = "default_control_listen")]
    pub listen: SocketAddr,

    /// Bound on reading a request and writing the response
    #[serde(default = "default_io_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            listen: default_control_listen(),
            timeout: default_io_timeout(),
        }
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

fn default_true() -> bool {
    true
}

fn default_metrics_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_bind_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_io_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_health_delay() -> Duration {
    Duration::from_secs(3)
}

fn default_control_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

/// Custom serde module for humantime durations.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
