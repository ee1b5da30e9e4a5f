//! Configuration options.
//!
//! Applications that embed flowscope are free to define their own command
//! line arguments, but the runtime itself is configured through a TOML file
//! that defines the subscriber endpoint, capture defaults, and the bounds on
//! the flow table, the reassembler, and per-subscriber send queues. The path
//! to the configuration file is typically a command line argument passed to
//! the daemon.
//!
//! Every field has a default, so an empty file (or [`default_config`]) yields
//! a working local setup.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Loads a configuration file from `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> RuntimeConfig {
    let config_str = fs::read_to_string(path).expect("ERROR: File read failed");
    let config: RuntimeConfig = toml::from_str(&config_str).expect("Invalid config file");
    config
}

/// Loads a default configuration.
///
/// For demonstration and tests, not tuned for load:
/// ```toml
/// [server]
///     bind = "127.0.0.1:9077"
///
/// [conntrack]
///     max_flows = 10_000
/// ```
pub fn default_config() -> RuntimeConfig {
    RuntimeConfig::default()
}

/* --------------------------------------------------------------------------------- */

/// Runtime configuration options.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// Subscriber transport settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Capture defaults applied when a `start_capture` command omits them.
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Flow table settings.
    #[serde(default)]
    pub conntrack: ConnTrackConfig,

    /// TCP stream reassembly settings.
    #[serde(default)]
    pub reassembly: ReassemblyConfig,

    /// Per-subscriber send queue settings.
    #[serde(default)]
    pub subscriber: SubscriberConfig,
}

/// Subscriber transport settings.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ServerConfig {
    /// Address the subscriber listener binds to. Defaults to
    /// `127.0.0.1:9077`.
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: default_bind(),
        }
    }
}

/// Capture defaults.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct CaptureConfig {
    /// Snapshot length applied when a start request passes zero. Defaults to
    /// 65535.
    #[serde(default = "default_snaplen")]
    pub snaplen: i32,

    /// Live read poll timeout in milliseconds. Bounds how long the capture
    /// loop blocks before re-checking cancellation. Defaults to 100.
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: i32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            snaplen: default_snaplen(),
            poll_timeout_ms: default_poll_timeout_ms(),
        }
    }
}

/// Flow table settings.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ConnTrackConfig {
    /// Hard cap on tracked flows. Defaults to 10_000.
    #[serde(default = "default_max_flows")]
    pub max_flows: usize,

    /// Idle window in seconds; entries older than this are evicted when the
    /// table is at capacity. Defaults to 300.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Interval between `flow_update` broadcasts, in milliseconds. Defaults
    /// to 1000.
    #[serde(default = "default_broadcast_interval_ms")]
    pub broadcast_interval_ms: u64,
}

impl Default for ConnTrackConfig {
    fn default() -> Self {
        ConnTrackConfig {
            max_flows: default_max_flows(),
            idle_timeout_secs: default_idle_timeout_secs(),
            broadcast_interval_ms: default_broadcast_interval_ms(),
        }
    }
}

/// TCP stream reassembly settings.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ReassemblyConfig {
    /// Capacity of the dissector-to-worker segment channel. Segments are
    /// dropped when it is full. Defaults to 4096.
    #[serde(default = "default_segment_queue")]
    pub segment_queue: usize,

    /// Per-direction stream buffer cap in bytes. Defaults to 262144.
    #[serde(default = "default_buffer_cap")]
    pub buffer_cap: usize,

    /// Interval between idle half-flow flushes, in seconds. Defaults to 30.
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        ReassemblyConfig {
            segment_queue: default_segment_queue(),
            buffer_cap: default_buffer_cap(),
            flush_interval_secs: default_flush_interval_secs(),
        }
    }
}

/// Per-subscriber send queue settings.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SubscriberConfig {
    /// Send queue capacity per subscriber. Defaults to 512.
    #[serde(default = "default_send_queue")]
    pub send_queue: usize,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        SubscriberConfig {
            send_queue: default_send_queue(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:9077".to_string()
}

fn default_snaplen() -> i32 {
    65535
}

fn default_poll_timeout_ms() -> i32 {
    100
}

fn default_max_flows() -> usize {
    10_000
}

fn default_idle_timeout_secs() -> u64 {
    300
}

fn default_broadcast_interval_ms() -> u64 {
    1000
}

fn default_segment_queue() -> usize {
    4096
}

fn default_buffer_cap() -> usize {
    262_144
}

fn default_flush_interval_secs() -> u64 {
    30
}

fn default_send_queue() -> usize {
    512
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_config_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[server]\nbind = \"0.0.0.0:9100\"\n").unwrap();
        let config = load_config(file.path());
        assert_eq!(config.server.bind, "0.0.0.0:9100");
        assert_eq!(config.conntrack.max_flows, 10_000);
    }

    #[test]
    fn empty_toml_yields_defaults() {
        let config: RuntimeConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:9077");
        assert_eq!(config.capture.snaplen, 65535);
        assert_eq!(config.conntrack.max_flows, 10_000);
        assert_eq!(config.conntrack.idle_timeout_secs, 300);
        assert_eq!(config.reassembly.segment_queue, 4096);
        assert_eq!(config.reassembly.buffer_cap, 262_144);
        assert_eq!(config.subscriber.send_queue, 512);
    }

    #[test]
    fn partial_section_keeps_remaining_defaults() {
        let config: RuntimeConfig = toml::from_str(
            r#"
            [conntrack]
            max_flows = 64
            "#,
        )
        .unwrap();
        assert_eq!(config.conntrack.max_flows, 64);
        assert_eq!(config.conntrack.idle_timeout_secs, 300);
        assert_eq!(config.reassembly.flush_interval_secs, 30);
    }
}
