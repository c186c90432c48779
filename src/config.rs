//! Connectivity configuration consumed by the core.
//!
//! All structs use `#[serde(rename_all = "camelCase")]` so the JSON config
//! file can use camelCase keys while Rust code uses snake_case fields.
//! Loading and merging of the file itself is owned by the application layer;
//! this crate only defines the schema and the defaults.

use serde::{Deserialize, Serialize};

/// Default LMX node port.
pub const DEFAULT_PORT: u16 = 1234;

/// Well-known HTTP path serving the node's discovery document.
pub const WELL_KNOWN_PATH: &str = "/.well-known/opta-lmx";

/// Service marker the discovery document must carry to count as a node.
pub const SERVICE_MARKER: &str = "opta-lmx";

/// mDNS service type announced by nodes on the LAN.
pub const MDNS_SERVICE_TYPE: &str = "_opta-lmx._tcp.local";

/// Top-level connectivity settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct LinkConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub stream: StreamConfig,
}

/// Where the node lives and how patiently we look for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    /// Configured primary host (IP or name). Empty means "discover one".
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Extra hosts to race against the primary during resolution.
    #[serde(default)]
    pub fallback_hosts: Vec<String>,
    /// Admin key for model control RPCs, sent as `X-Admin-Key`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_key: Option<String>,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_resolve_timeout_ms")]
    pub resolve_timeout_ms: u64,
    /// How long a connected fallback waits for the primary to also come up.
    #[serde(default = "default_primary_grace_ms")]
    pub primary_grace_ms: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_probe_timeout_ms() -> u64 {
    3_000
}

fn default_resolve_timeout_ms() -> u64 {
    8_000
}

fn default_primary_grace_ms() -> u64 {
    750
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            fallback_hosts: Vec::new(),
            admin_key: None,
            probe_timeout_ms: default_probe_timeout_ms(),
            resolve_timeout_ms: default_resolve_timeout_ms(),
            primary_grace_ms: default_primary_grace_ms(),
        }
    }
}

/// LAN discovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_port")]
    pub sweep_port: u16,
    /// Concurrent HTTP probes during the subnet sweep.
    #[serde(default = "default_sweep_concurrency")]
    pub sweep_concurrency: usize,
    #[serde(default = "default_discover_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_sweep_concurrency() -> usize {
    20
}

fn default_discover_timeout_ms() -> u64 {
    5_000
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sweep_port: default_port(),
            sweep_concurrency: default_sweep_concurrency(),
            timeout_ms: default_discover_timeout_ms(),
        }
    }
}

/// Chat streaming settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamConfig {
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
}

fn default_handshake_timeout_ms() -> u64 {
    5_000
}

fn default_idle_timeout_ms() -> u64 {
    120_000
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: default_handshake_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = LinkConfig::default();
        assert_eq!(cfg.connection.host, "127.0.0.1");
        assert_eq!(cfg.connection.port, DEFAULT_PORT);
        assert!(cfg.connection.fallback_hosts.is_empty());
        assert!(cfg.discovery.enabled);
        assert_eq!(cfg.discovery.sweep_concurrency, 20);
    }

    #[test]
    fn test_camel_case_round_trip() {
        let json = r#"{
            "connection": {
                "host": "192.168.1.40",
                "port": 1234,
                "fallbackHosts": ["mini.local"],
                "adminKey": "secret",
                "primaryGraceMs": 500
            }
        }"#;
        let cfg: LinkConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.connection.host, "192.168.1.40");
        assert_eq!(cfg.connection.fallback_hosts, vec!["mini.local"]);
        assert_eq!(cfg.connection.admin_key.as_deref(), Some("secret"));
        assert_eq!(cfg.connection.primary_grace_ms, 500);
        // Unspecified fields fall back to defaults.
        assert_eq!(cfg.connection.probe_timeout_ms, 3_000);
        assert_eq!(cfg.stream.idle_timeout_ms, 120_000);
    }

    #[test]
    fn test_serializes_camel_case_keys() {
        let cfg = LinkConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(json.contains("fallbackHosts"));
        assert!(json.contains("probeTimeoutMs"));
        assert!(!json.contains("admin_key"));
    }

    #[test]
    fn test_empty_object_is_all_defaults() {
        let cfg: LinkConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.connection.resolve_timeout_ms, 8_000);
        assert_eq!(cfg.discovery.timeout_ms, 5_000);
    }
}
