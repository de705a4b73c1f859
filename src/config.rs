use std::{fs, net::SocketAddr, path::Path, time::Duration};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::protocol::{
    DeviceKind, GatewayDescriptor, DEFAULT_JOIN_WINDOW_SECS, DEFAULT_RETRY_INTERVAL_SECS,
    DEFAULT_WEBSOCKET_PATH, DEFAULT_WEBSOCKET_PORT, DISCOVERY_BROADCAST_PORT,
    DISCOVERY_WINDOW_SECS, GATEWAY_ALIVE_TIMEOUT_SECS, GATEWAY_COMMAND_PORT,
    GATEWAY_RESPONSE_PORT, INITIAL_RECONNECT_DELAY_SECS, MAX_RECONNECT_DELAY_SECS,
    WATCHDOG_TICK_SECS,
};

fn default_listen_port() -> u16 {
    GATEWAY_RESPONSE_PORT
}

fn default_command_port() -> u16 {
    GATEWAY_COMMAND_PORT
}

fn default_join_window_secs() -> u64 {
    DEFAULT_JOIN_WINDOW_SECS
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_broadcast_port() -> u16 {
    DISCOVERY_BROADCAST_PORT
}

fn default_retry_interval_secs() -> u64 {
    DEFAULT_RETRY_INTERVAL_SECS
}

fn default_window_secs() -> u64 {
    DISCOVERY_WINDOW_SECS
}

fn default_timeout_secs() -> u64 {
    GATEWAY_ALIVE_TIMEOUT_SECS
}

fn default_tick_secs() -> u64 {
    WATCHDOG_TICK_SECS
}

fn default_ws_port() -> u16 {
    DEFAULT_WEBSOCKET_PORT
}

fn default_ws_path() -> String {
    DEFAULT_WEBSOCKET_PATH.to_string()
}

fn default_backoff_floor_secs() -> u64 {
    INITIAL_RECONNECT_DELAY_SECS
}

fn default_backoff_ceiling_secs() -> u64 {
    MAX_RECONNECT_DELAY_SECS
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_platforms() -> Vec<DeviceKind> {
    vec![DeviceKind::Light, DeviceKind::Cover]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Local address to listen on and to send commands from. Unset means
    /// all interfaces / OS-chosen egress.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_bind_ip: Option<String>,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default = "default_command_port")]
    pub command_port: u16,
    #[serde(default = "default_join_window_secs")]
    pub join_window_secs: u64,
    /// `error` | `warn` | `info` | `debug` | `trace`
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub websocket: WebSocketConfig,
    #[serde(default)]
    pub gateways: Vec<GatewayEntryConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_broadcast_port")]
    pub broadcast_port: u16,
    /// Port replies are received on; `0` binds an ephemeral port.
    #[serde(default = "default_listen_port")]
    pub response_port: u16,
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Explicit probe destinations (`ip:port`). Empty → broadcast.
    #[serde(default)]
    pub targets: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketConfig {
    #[serde(default = "default_ws_port")]
    pub port: u16,
    #[serde(default = "default_ws_path")]
    pub path: String,
    #[serde(default = "default_backoff_floor_secs")]
    pub backoff_floor_secs: u64,
    #[serde(default = "default_backoff_ceiling_secs")]
    pub backoff_ceiling_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

/// A statically configured gateway (one setup entry).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayEntryConfig {
    pub mac: String,
    pub ip: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_version: Option<String>,
    /// Also keep a persistent WebSocket to this gateway.
    #[serde(default)]
    pub websocket: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_path: Option<String>,
    #[serde(default = "default_platforms")]
    pub platforms: Vec<DeviceKind>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            local_bind_ip: None,
            listen_port: default_listen_port(),
            command_port: default_command_port(),
            join_window_secs: default_join_window_secs(),
            log_level: default_log_level(),
            log_file: None,
            discovery: DiscoveryConfig::default(),
            watchdog: WatchdogConfig::default(),
            websocket: WebSocketConfig::default(),
            gateways: Vec::new(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            broadcast_port: default_broadcast_port(),
            response_port: default_listen_port(),
            retry_interval_secs: default_retry_interval_secs(),
            window_secs: default_window_secs(),
            targets: Vec::new(),
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            tick_secs: default_tick_secs(),
        }
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            port: default_ws_port(),
            path: default_ws_path(),
            backoff_floor_secs: default_backoff_floor_secs(),
            backoff_ceiling_secs: default_backoff_ceiling_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl BridgeConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let cfg: BridgeConfig = toml::from_str(content).context("failed to parse bridge config")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    fn validate(&self) -> Result<()> {
        if self.watchdog.tick_secs == 0 {
            anyhow::bail!("watchdog.tick_secs must be greater than zero");
        }
        if self.discovery.retry_interval_secs == 0 {
            anyhow::bail!("discovery.retry_interval_secs must be greater than zero");
        }
        if self.websocket.backoff_floor_secs == 0 {
            anyhow::bail!("websocket.backoff_floor_secs must be greater than zero");
        }
        if self.websocket.backoff_floor_secs > self.websocket.backoff_ceiling_secs {
            anyhow::bail!("websocket.backoff_floor_secs exceeds backoff_ceiling_secs");
        }
        for target in &self.discovery.targets {
            target
                .parse::<SocketAddr>()
                .with_context(|| format!("invalid discovery target {}", target))?;
        }
        if let Some(ip) = &self.local_bind_ip {
            ip.parse::<std::net::IpAddr>()
                .with_context(|| format!("invalid local_bind_ip {}", ip))?;
        }
        Ok(())
    }

    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_secs(self.watchdog.timeout_secs)
    }

    pub fn watchdog_tick(&self) -> Duration {
        Duration::from_secs(self.watchdog.tick_secs)
    }
}

impl GatewayEntryConfig {
    pub fn descriptor(&self) -> GatewayDescriptor {
        GatewayDescriptor {
            model: self.model.clone(),
            hardware_version: self.hardware_version.clone(),
            ..GatewayDescriptor::new(&self.mac, self.ip.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let cfg = BridgeConfig::from_toml_str("").unwrap();
        assert_eq!(cfg.listen_port, 50002);
        assert_eq!(cfg.command_port, 50000);
        assert_eq!(cfg.discovery.retry_interval_secs, 10);
        assert_eq!(cfg.discovery.window_secs, 30);
        assert_eq!(cfg.websocket.backoff_ceiling_secs, 30);
        assert!(cfg.gateways.is_empty());
    }

    #[test]
    fn parses_gateway_entries() {
        let cfg = BridgeConfig::from_toml_str(
            r#"
local_bind_ip = "192.168.1.5"

[watchdog]
timeout_secs = 45

[[gateways]]
mac = "AA:BB:CC:00:11:22"
ip = "192.168.1.20"
type = "BHK-GW2"
websocket = true
platforms = ["cover"]
"#,
        )
        .unwrap();
        assert_eq!(cfg.watchdog.timeout_secs, 45);
        assert_eq!(cfg.watchdog.tick_secs, 15);
        let gw = &cfg.gateways[0];
        assert_eq!(gw.platforms, vec![DeviceKind::Cover]);
        assert!(gw.websocket);
        let descriptor = gw.descriptor();
        assert_eq!(descriptor.mac, "aa:bb:cc:00:11:22");
        assert_eq!(descriptor.model.as_deref(), Some("BHK-GW2"));
    }

    #[test]
    fn rejects_inconsistent_values() {
        assert!(BridgeConfig::from_toml_str("[watchdog]\ntick_secs = 0\n").is_err());
        assert!(BridgeConfig::from_toml_str(
            "[websocket]\nbackoff_floor_secs = 60\nbackoff_ceiling_secs = 30\n"
        )
        .is_err());
        assert!(BridgeConfig::from_toml_str("local_bind_ip = \"not-an-ip\"\n").is_err());
        assert!(
            BridgeConfig::from_toml_str("[websocket]\nbackoff_floor_secs = 0\n").is_err()
        );
    }
}
