use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;

use crate::datagram::DatagramOptions;

/// Root configuration for eventgate
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// WebSocket bridges accept client sessions
    #[serde(default)]
    pub bridges: Vec<BridgeConfig>,

    /// Datagram services
    #[serde(default)]
    pub datagram: Vec<DatagramConfig>,

    /// Modules to load at startup (`group~artifact~version`)
    #[serde(default)]
    pub modules: Vec<String>,

    /// Admin API configuration
    #[serde(default)]
    pub admin: AdminConfig,

    /// Global settings
    #[serde(default)]
    pub settings: Settings,

    /// Logging and tracing
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Bridge configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    /// Bridge name (for logging/metrics)
    pub name: String,

    /// Bind address
    pub address: SocketAddr,

    /// HTTP path the WebSocket endpoint is served on
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Addresses clients may send and publish to
    #[serde(default)]
    pub inbound_permitted: Vec<PermittedConfig>,

    /// Addresses clients may subscribe to and receive from
    #[serde(default)]
    pub outbound_permitted: Vec<PermittedConfig>,

    /// Session limits
    #[serde(default)]
    pub limits: SessionLimits,
}

fn default_prefix() -> String {
    "/eventbus".to_string()
}

/// One permitted-list entry. An entry with no address, regex or match
/// permits every address.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PermittedConfig {
    /// Exact address
    pub address: Option<String>,

    /// Address regex (whole-address match)
    pub address_re: Option<String>,

    /// JSON fields the message body must contain
    #[serde(rename = "match")]
    pub match_: Option<serde_json::Map<String, serde_json::Value>>,

    /// Require an `authorise` handler to allow the address
    #[serde(default)]
    pub requires_auth: bool,
}

/// Session limits
#[derive(Debug, Clone, Deserialize)]
pub struct SessionLimits {
    /// Maximum concurrent sessions
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Outbound frames buffered per session before dropping
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,

    /// Largest accepted client frame in bytes
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Close sessions with no client traffic for this long
    #[serde(default = "default_idle_timeout", with = "humantime_serde")]
    pub idle_timeout: Duration,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            outbound_queue: default_outbound_queue(),
            max_frame_size: default_max_frame_size(),
            idle_timeout: default_idle_timeout(),
        }
    }
}

fn default_max_sessions() -> usize {
    10000
}

fn default_outbound_queue() -> usize {
    256
}

fn default_max_frame_size() -> usize {
    64 * 1024
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(300)
}

/// Datagram service configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatagramConfig {
    /// Service name
    pub name: String,

    /// Bind address
    pub listen: SocketAddr,

    /// Echo every datagram back to its sender
    #[serde(default)]
    pub echo: bool,

    /// Publish every datagram on this bus address
    pub bridge_address: Option<String>,

    /// Socket options
    #[serde(default)]
    pub options: DatagramOptions,
}

/// Admin API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AdminConfig {
    /// HTTP API address
    #[serde(default = "default_admin_address")]
    pub address: SocketAddr,

    /// Enable metrics endpoint
    #[serde(default = "default_true")]
    pub metrics: bool,

    /// Enable health endpoint
    #[serde(default = "default_true")]
    pub health: bool,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            address: default_admin_address(),
            metrics: true,
            health: true,
        }
    }
}

fn default_admin_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9090))
}

fn default_true() -> bool {
    true
}

/// Global settings
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Context worker threads (0 = one per CPU)
    #[serde(default)]
    pub workers: usize,

    /// Upper bound on a single hook handler call
    #[serde(default = "default_hook_timeout", with = "humantime_serde")]
    pub hook_timeout: Duration,

    /// How long a client send waits for a bus reply
    #[serde(default = "default_reply_timeout", with = "humantime_serde")]
    pub reply_timeout: Duration,

    /// Shutdown configuration
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            workers: 0,
            hook_timeout: default_hook_timeout(),
            reply_timeout: default_reply_timeout(),
            shutdown: ShutdownConfig::default(),
        }
    }
}

fn default_hook_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_reply_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Shutdown configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownConfig {
    /// How long to wait for sessions to close before exiting
    #[serde(default = "default_drain_timeout", with = "humantime_serde")]
    pub drain_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout: default_drain_timeout(),
        }
    }
}

fn default_drain_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Logging and tracing configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    /// Log level or filter directive
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable structured JSON logging
    #[serde(default)]
    pub json_logs: bool,

    /// OTLP endpoint for distributed tracing
    pub otlp_endpoint: Option<String>,

    /// Trace sample rate (0.0 - 1.0)
    #[serde(default = "default_sample_rate")]
    pub trace_sample_rate: f64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
            otlp_endpoint: None,
            trace_sample_rate: default_sample_rate(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_sample_rate() -> f64 {
    1.0
}

/// Humantime serde support module
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
