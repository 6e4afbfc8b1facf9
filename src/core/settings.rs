//! Connection and engine settings.
//!
//! One record handed to the transport and the coordinator; defaults
//! target a controller on localhost.

use serde::{Deserialize, Serialize};

/// Transport item cap: a bulk read/write never carries more than this
/// many items per request; larger calls are split.
pub const DEFAULT_MAX_ITEMS_PER_REQUEST: usize = 500;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct MirrorSettings {
    pub target_address: String,
    pub target_port: u16,
    pub local_address: Option<String>,
    pub local_port: Option<u16>,
    pub router_address: String,
    pub router_port: u16,
    pub connect_timeout_ms: u32,
    pub request_timeout_ms: u32,
    pub auto_reconnect: bool,
    pub reconnect_interval_ms: u32,
    pub health_check_interval_ms: u32,
    pub connection_down_grace_ms: u32,
    /// Subscribe the source-change probe at connect and rebuild the
    /// mirror when the controller swaps its program.
    pub monitor_source_changes: bool,
    pub warn_to_console: bool,
    pub warn_unpacked_structs: bool,
    pub max_items_per_request: usize,
    /// Sample interval used when a subscriber does not pass one.
    pub default_cycle_time_ms: u32,
    /// System-info variable holding the last compile timestamp.
    pub source_probe_path: String,
}

impl Default for MirrorSettings {
    fn default() -> Self {
        Self {
            target_address: "127.0.0.1".to_string(),
            target_port: 851,
            local_address: None,
            local_port: None,
            router_address: "127.0.0.1".to_string(),
            router_port: 48898,
            connect_timeout_ms: 2000,
            request_timeout_ms: 2000,
            auto_reconnect: true,
            reconnect_interval_ms: 2000,
            health_check_interval_ms: 1000,
            connection_down_grace_ms: 5000,
            monitor_source_changes: true,
            warn_to_console: true,
            warn_unpacked_structs: true,
            max_items_per_request: DEFAULT_MAX_ITEMS_PER_REQUEST,
            default_cycle_time_ms: 200,
            source_probe_path: "SystemInfo.AppTimestamp".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_target_localhost_and_json_is_camel_case() {
        let settings = MirrorSettings::default();
        assert_eq!(settings.target_address, "127.0.0.1");
        assert!(settings.monitor_source_changes);
        assert_eq!(settings.max_items_per_request, 500);

        let json = serde_json::to_string(&settings).unwrap();
        assert!(json.contains("\"targetAddress\":\"127.0.0.1\""));
        assert!(json.contains("\"monitorSourceChanges\":true"));
        assert!(!json.contains("target_address"));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let settings: MirrorSettings =
            serde_json::from_str(r#"{"targetAddress":"192.168.0.10"}"#).unwrap();
        assert_eq!(settings.target_address, "192.168.0.10");
        assert_eq!(settings.target_port, 851);
    }
}
