//! Gateway wire protocol.
//!
//! Every datagram on the gateway network is one complete message. Two
//! dialects exist:
//!
//! ```text
//! {"type": "light_register", "unique_id": "...", ...}   JSON (all traffic)
//! ESP-GATEWAY|mac=...|ip=...|type=...                 legacy discovery reply
//! ```
//!
//! JSON keys are folded to lower case before lookup and the `type`
//! discriminator is matched case-insensitively. Decoding produces typed
//! messages; nothing past this module touches raw key/value maps.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

// ────────────────────────────────────────────────────────────────────────────
// Constants
// ────────────────────────────────────────────────────────────────────────────

/// Probe broadcast during discovery.
pub const DISCOVERY_MESSAGE: &str = "DISCOVER_GATEWAY";

/// Literal prefix of a legacy discovery reply.
pub const DISCOVERY_RESPONSE_PREFIX: &str = "ESP-GATEWAY";

/// Port gateways listen on for the discovery probe.
pub const DISCOVERY_BROADCAST_PORT: u16 = 50000;

/// Port gateways send discovery replies and events to.
pub const GATEWAY_RESPONSE_PORT: u16 = 50002;

/// Port gateways accept UDP commands on.
pub const GATEWAY_COMMAND_PORT: u16 = 50000;

pub const DEFAULT_RETRY_INTERVAL_SECS: u64 = 10;
pub const DISCOVERY_WINDOW_SECS: u64 = 30;
pub const DEFAULT_JOIN_WINDOW_SECS: u64 = 120;

/// A gateway that has not sent `gateway_alive` for this long is stale.
pub const GATEWAY_ALIVE_TIMEOUT_SECS: u64 = 60;
pub const WATCHDOG_TICK_SECS: u64 = 15;

pub const DEFAULT_WEBSOCKET_PORT: u16 = 80;
pub const DEFAULT_WEBSOCKET_PATH: &str = "/ws";

/// Initial reconnection delay (seconds).
pub const INITIAL_RECONNECT_DELAY_SECS: u64 = 1;

/// Back-off ceiling for reconnection attempts (seconds).
pub const MAX_RECONNECT_DELAY_SECS: u64 = 30;

pub const MAX_DATAGRAM_SIZE: usize = 2048;

/// ZCL On/Off cluster, used by legacy cluster-based join announcements.
const CLUSTER_ON_OFF: u64 = 0x0006;
/// ZCL Window Covering cluster.
const CLUSTER_WINDOW_COVERING: u64 = 0x0102;

/// Addressable sub-function (relay channel) of a field device.
pub type Endpoint = u16;

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("datagram is not valid UTF-8")]
    InvalidUtf8,
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("JSON payload is not an object")]
    NotAnObject,
    #[error("missing `type` field")]
    MissingType,
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("missing `ESP-GATEWAY` prefix")]
    BadPrefix,
}

// ────────────────────────────────────────────────────────────────────────────
// Shared model
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Light,
    Cover,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Light => "light",
            DeviceKind::Cover => "cover",
        }
    }
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one physical gateway. `mac` is always stored lower-case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayDescriptor {
    pub mac: String,
    pub ip: String,
    #[serde(rename = "type", default)]
    pub model: Option<String>,
    #[serde(default)]
    pub hardware_version: Option<String>,
}

impl GatewayDescriptor {
    pub fn new(mac: &str, ip: impl Into<String>) -> Self {
        Self {
            mac: normalize_mac(mac),
            ip: ip.into(),
            model: None,
            hardware_version: None,
        }
    }
}

/// MACs are compared case-insensitively everywhere.
pub fn normalize_mac(mac: &str) -> String {
    mac.trim().to_ascii_lowercase()
}

// ────────────────────────────────────────────────────────────────────────────
// Inbound messages
// ────────────────────────────────────────────────────────────────────────────

/// `light_register` / `cover_register`, also synthesised from `device_join`.
#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    pub kind: DeviceKind,
    pub unique_id: String,
    pub device_id: Option<String>,
    pub endpoint: Option<Endpoint>,
    pub name: Option<String>,
    pub gateway_mac: Option<String>,
    pub device_type: Option<String>,
    pub state: Option<String>,
    pub position: Option<i64>,
}

impl Registration {
    pub fn new(kind: DeviceKind, unique_id: impl Into<String>) -> Self {
        Self {
            kind,
            unique_id: unique_id.into(),
            device_id: None,
            endpoint: None,
            name: None,
            gateway_mac: None,
            device_type: None,
            state: None,
            position: None,
        }
    }

    pub fn carries_state(&self) -> bool {
        self.state.is_some() || self.position.is_some()
    }
}

/// How a state message names its device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceKey {
    UniqueId(String),
    /// WebSocket frames only carry the endpoint of the sending gateway.
    Endpoint(Endpoint),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StateUpdate {
    pub kind: DeviceKind,
    pub key: DeviceKey,
    pub state: Option<String>,
    pub position: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceJoin {
    pub device_id: String,
    pub endpoints: Vec<Endpoint>,
    pub device_type: String,
    pub gateway_mac: Option<String>,
}

/// Compact cover report such as `OPENED` or `P:40`.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceReport {
    pub device_id: String,
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ZigbeeReport {
    pub device_id: String,
    pub endpoint: Endpoint,
    pub on: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayAlive {
    pub mac: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinWindow {
    pub mac: String,
    pub duration_s: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Register(Registration),
    State(StateUpdate),
    DeviceJoin(DeviceJoin),
    DeviceReport(DeviceReport),
    ZigbeeReport(ZigbeeReport),
    GatewayAlive(GatewayAlive),
    JoinWindow(JoinWindow),
    /// Well-formed but of a type we do not handle.
    Unrecognized(String),
}

/// Decode one UDP datagram or WebSocket text frame.
pub fn decode_datagram(data: &[u8]) -> Result<InboundMessage, DecodeError> {
    let text = std::str::from_utf8(data).map_err(|_| DecodeError::InvalidUtf8)?;
    decode_text(text)
}

pub fn decode_text(text: &str) -> Result<InboundMessage, DecodeError> {
    let value: Value = serde_json::from_str(text.trim())?;
    let Value::Object(map) = value else {
        return Err(DecodeError::NotAnObject);
    };
    let fields = Fields::new(map);
    let msg_type = fields
        .text("type")
        .ok_or(DecodeError::MissingType)?
        .to_ascii_lowercase();

    let message = match msg_type.as_str() {
        "light_register" => InboundMessage::Register(Registration {
            kind: DeviceKind::Light,
            unique_id: fields
                .first_text(&["unique_id", "mac"])
                .ok_or(DecodeError::MissingField("unique_id"))?,
            device_id: fields.first_text(&["id", "ieee"]),
            endpoint: fields.endpoint("endpoint"),
            name: fields.text("name"),
            gateway_mac: fields.text("gateway_mac").map(|m| normalize_mac(&m)),
            device_type: fields.text("device_type"),
            state: fields.text("state"),
            position: None,
        }),
        "cover_register" => InboundMessage::Register(Registration {
            kind: DeviceKind::Cover,
            unique_id: fields
                .first_text(&["unique_id", "device_id", "id", "mac"])
                .ok_or(DecodeError::MissingField("unique_id"))?,
            device_id: fields.first_text(&["device_id", "id"]),
            endpoint: fields.endpoint("endpoint"),
            name: fields.text("name"),
            gateway_mac: fields.text("gateway_mac").map(|m| normalize_mac(&m)),
            device_type: fields.text("device_type"),
            state: fields.text("state"),
            position: fields.int("position"),
        }),
        "light_state" => {
            let key = match fields.first_text(&["unique_id", "mac"]) {
                Some(id) => DeviceKey::UniqueId(id),
                None => DeviceKey::Endpoint(
                    fields
                        .endpoint("endpoint")
                        .ok_or(DecodeError::MissingField("unique_id"))?,
                ),
            };
            InboundMessage::State(StateUpdate {
                kind: DeviceKind::Light,
                key,
                state: fields.text("state"),
                position: None,
            })
        }
        "cover_state" => InboundMessage::State(StateUpdate {
            kind: DeviceKind::Cover,
            key: DeviceKey::UniqueId(
                fields
                    .first_text(&["unique_id", "device_id", "id", "mac"])
                    .ok_or(DecodeError::MissingField("unique_id"))?,
            ),
            state: fields.text("state"),
            position: fields.int("position"),
        }),
        "device_join" => InboundMessage::DeviceJoin(DeviceJoin {
            device_id: fields
                .first_text(&["device_id", "id", "ieee"])
                .ok_or(DecodeError::MissingField("device_id"))?,
            endpoints: fields.endpoints(),
            device_type: fields
                .text("device_type")
                .or_else(|| fields.legacy_device_type())
                .unwrap_or_default(),
            gateway_mac: fields.text("gateway_mac").map(|m| normalize_mac(&m)),
        }),
        "device_report" => InboundMessage::DeviceReport(DeviceReport {
            device_id: fields
                .first_text(&["device_id", "id"])
                .ok_or(DecodeError::MissingField("device_id"))?,
            payload: fields
                .raw("payload")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or(DecodeError::MissingField("payload"))?,
        }),
        "zigbee_report" => InboundMessage::ZigbeeReport(ZigbeeReport {
            device_id: fields
                .first_text(&["id", "ieee"])
                .ok_or(DecodeError::MissingField("id"))?,
            endpoint: fields
                .endpoint("endpoint")
                .ok_or(DecodeError::MissingField("endpoint"))?,
            on: fields.text("st").map(|st| {
                matches!(st.to_ascii_lowercase().as_str(), "1" | "true" | "on")
            }),
        }),
        "gateway_alive" => InboundMessage::GatewayAlive(GatewayAlive {
            mac: fields
                .first_text(&["mac", "gateway_mac"])
                .map(|m| normalize_mac(&m))
                .ok_or(DecodeError::MissingField("mac"))?,
        }),
        "join_window" => InboundMessage::JoinWindow(JoinWindow {
            mac: fields
                .first_text(&["mac", "gateway_mac"])
                .map(|m| normalize_mac(&m))
                .ok_or(DecodeError::MissingField("mac"))?,
            duration_s: fields.int("duration_s").and_then(|d| u64::try_from(d).ok()),
        }),
        _ => InboundMessage::Unrecognized(msg_type),
    };
    Ok(message)
}

/// JSON object with keys folded to lower case.
struct Fields(Map<String, Value>);

impl Fields {
    fn new(map: Map<String, Value>) -> Self {
        Self(
            map.into_iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v))
                .collect(),
        )
    }

    fn raw(&self, key: &str) -> Option<&Value> {
        self.0.get(key).filter(|v| !v.is_null())
    }

    /// Non-empty string, or a number/bool rendered as text.
    fn text(&self, key: &str) -> Option<String> {
        match self.raw(key)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    fn first_text(&self, keys: &[&str]) -> Option<String> {
        keys.iter().find_map(|k| self.text(k))
    }

    fn int(&self, key: &str) -> Option<i64> {
        match self.raw(key)? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            _ => None,
        }
    }

    fn endpoint(&self, key: &str) -> Option<Endpoint> {
        self.raw(key).and_then(value_to_endpoint)
    }

    /// `endpoint` when present, else the `eps` / `endpoints` list.
    fn endpoints(&self) -> Vec<Endpoint> {
        if let Some(ep) = self.endpoint("endpoint") {
            return vec![ep];
        }
        ["eps", "endpoints"]
            .iter()
            .find_map(|k| self.raw(k).and_then(Value::as_array))
            .map(|list| list.iter().filter_map(value_to_endpoint).collect())
            .unwrap_or_default()
    }

    /// Maps a cluster-ID join (older firmware) onto a device-type marker.
    fn legacy_device_type(&self) -> Option<String> {
        let clusters: Vec<u64> = self
            .raw("clusters")?
            .as_array()?
            .iter()
            .filter_map(value_to_cluster)
            .collect();
        if clusters.contains(&CLUSTER_WINDOW_COVERING) {
            Some("cover".to_string())
        } else if clusters.contains(&CLUSTER_ON_OFF) {
            Some("3lights".to_string())
        } else {
            None
        }
    }
}

fn value_to_endpoint(value: &Value) -> Option<Endpoint> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|v| Endpoint::try_from(v).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn value_to_cluster(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => {
            let s = s.trim();
            match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                Some(hex) => u64::from_str_radix(hex, 16).ok(),
                None => s.parse().ok(),
            }
        }
        _ => None,
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Discovery replies
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryResponse {
    pub mac: String,
    pub ip: Option<String>,
    pub model: Option<String>,
    pub hardware_version: Option<String>,
}

/// Parse `ESP-GATEWAY|mac=...|ip=...|type=...[|hw=...]`.
pub fn decode_discovery_response(data: &[u8]) -> Result<DiscoveryResponse, DecodeError> {
    let text = std::str::from_utf8(data).map_err(|_| DecodeError::InvalidUtf8)?;
    let mut parts = text.trim().split('|');
    if parts.next().map(str::trim) != Some(DISCOVERY_RESPONSE_PREFIX) {
        return Err(DecodeError::BadPrefix);
    }

    let mut response = DiscoveryResponse {
        mac: String::new(),
        ip: None,
        model: None,
        hardware_version: None,
    };
    for part in parts {
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        match key.trim().to_ascii_lowercase().as_str() {
            "mac" => response.mac = normalize_mac(value),
            "ip" => response.ip = Some(value.to_string()),
            "type" => response.model = Some(value.to_string()),
            "hw" | "hw_version" | "hardware_version" => {
                response.hardware_version = Some(value.to_string())
            }
            _ => {}
        }
    }

    if response.mac.is_empty() {
        return Err(DecodeError::MissingField("mac"));
    }
    Ok(response)
}

// ────────────────────────────────────────────────────────────────────────────
// Outbound commands
// ────────────────────────────────────────────────────────────────────────────

/// Control messages sent to a gateway.
///
/// Internally tagged so serde writes `{"type": "device_cmd", ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundCommand {
    OpenJoin {
        target_mac: String,
        duration_s: u64,
        req_id: String,
    },
    DeviceCmd {
        dest: String,
        com: String,
    },
    ForwardCommand {
        id: String,
        endpoint: Endpoint,
        cmd: String,
    },
    /// WebSocket-only light control.
    SetLight {
        endpoint: Endpoint,
        state: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoverCommand {
    Open,
    Close,
    Position(u8),
}

impl CoverCommand {
    /// Builds a position command, clamping to 0..=100.
    pub fn position(percent: i64) -> Self {
        CoverCommand::Position(percent.clamp(0, 100) as u8)
    }

    pub fn com(&self) -> String {
        match self {
            CoverCommand::Open => "OPEN".to_string(),
            CoverCommand::Close => "CLOSE".to_string(),
            CoverCommand::Position(p) => format!("P:{}", p),
        }
    }
}

pub fn on_off(on: bool) -> &'static str {
    if on {
        "on"
    } else {
        "off"
    }
}

pub fn encode_command(command: &OutboundCommand) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(command)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_keys_and_type_are_case_insensitive() {
        let msg = decode_datagram(
            br#"{"TYPE": "Light_Register", "Unique_ID": "abc_1", "Name": "Hall", "Gateway_MAC": "AA:BB", "state": "ON"}"#,
        )
        .unwrap();
        let InboundMessage::Register(reg) = msg else {
            panic!("expected registration, got {:?}", msg);
        };
        assert_eq!(reg.kind, DeviceKind::Light);
        assert_eq!(reg.unique_id, "abc_1");
        assert_eq!(reg.name.as_deref(), Some("Hall"));
        assert_eq!(reg.gateway_mac.as_deref(), Some("aa:bb"));
        assert_eq!(reg.state.as_deref(), Some("ON"));
    }

    #[test]
    fn cover_register_falls_back_through_id_keys() {
        let msg = decode_text(r#"{"type": "cover_register", "id": 17, "position": 42.7}"#).unwrap();
        let InboundMessage::Register(reg) = msg else {
            panic!("expected registration");
        };
        assert_eq!(reg.kind, DeviceKind::Cover);
        assert_eq!(reg.unique_id, "17");
        assert_eq!(reg.device_id.as_deref(), Some("17"));
        assert_eq!(reg.position, Some(42));
    }

    #[test]
    fn malformed_input_is_rejected() {
        assert!(matches!(
            decode_datagram(b"{not json"),
            Err(DecodeError::InvalidJson(_))
        ));
        assert!(matches!(
            decode_datagram(&[0xff, 0xfe, 0x7b]),
            Err(DecodeError::InvalidUtf8)
        ));
        assert!(matches!(
            decode_text(r#"{"unique_id": "x"}"#),
            Err(DecodeError::MissingType)
        ));
        assert!(matches!(decode_text("[1, 2]"), Err(DecodeError::NotAnObject)));
        assert!(matches!(
            decode_text(r#"{"type": "light_state", "state": "on"}"#),
            Err(DecodeError::MissingField("unique_id"))
        ));
    }

    #[test]
    fn unknown_type_is_unrecognized_not_an_error() {
        let msg = decode_text(r#"{"type": "Firmware_Progress", "pct": 10}"#).unwrap();
        assert_eq!(msg, InboundMessage::Unrecognized("firmware_progress".into()));
    }

    #[test]
    fn websocket_light_state_is_keyed_by_endpoint() {
        let msg = decode_text(r#"{"type": "light_state", "endpoint": 2, "state": "off"}"#).unwrap();
        let InboundMessage::State(update) = msg else {
            panic!("expected state");
        };
        assert_eq!(update.key, DeviceKey::Endpoint(2));
    }

    #[test]
    fn device_join_reads_endpoint_lists_and_legacy_clusters() {
        let msg = decode_text(
            r#"{"type": "device_join", "ieee": "00124b00", "eps": [1, "2", 3], "device_type": "ZB-3Lights"}"#,
        )
        .unwrap();
        let InboundMessage::DeviceJoin(join) = msg else {
            panic!("expected join");
        };
        assert_eq!(join.device_id, "00124b00");
        assert_eq!(join.endpoints, vec![1, 2, 3]);

        let msg = decode_text(
            r#"{"type": "device_join", "id": "c1", "endpoint": 1, "clusters": ["0x0000", "0x0102"]}"#,
        )
        .unwrap();
        let InboundMessage::DeviceJoin(join) = msg else {
            panic!("expected join");
        };
        assert_eq!(join.device_type, "cover");
        assert_eq!(join.endpoints, vec![1]);
    }

    #[test]
    fn zigbee_report_state_flag() {
        let msg = decode_text(r#"{"type": "zigbee_report", "id": "d", "endpoint": 1, "st": 1}"#).unwrap();
        assert_eq!(
            msg,
            InboundMessage::ZigbeeReport(ZigbeeReport {
                device_id: "d".into(),
                endpoint: 1,
                on: Some(true),
            })
        );
    }

    #[test]
    fn device_report_requires_string_payload() {
        assert!(matches!(
            decode_text(r#"{"type": "device_report", "device_id": "d", "payload": 5}"#),
            Err(DecodeError::MissingField("payload"))
        ));
    }

    #[test]
    fn discovery_reply_parses_legacy_text() {
        let reply = decode_discovery_response(
            b"ESP-GATEWAY|mac=AA:BB:CC:DD:EE:FF|ip=192.168.1.20|type=BHK-GW2|hw=1.3\n",
        )
        .unwrap();
        assert_eq!(reply.mac, "aa:bb:cc:dd:ee:ff");
        assert_eq!(reply.ip.as_deref(), Some("192.168.1.20"));
        assert_eq!(reply.model.as_deref(), Some("BHK-GW2"));
        assert_eq!(reply.hardware_version.as_deref(), Some("1.3"));

        assert!(matches!(
            decode_discovery_response(DISCOVERY_MESSAGE.as_bytes()),
            Err(DecodeError::BadPrefix)
        ));
        assert!(matches!(
            decode_discovery_response(b"ESP-GATEWAY|ip=1.2.3.4"),
            Err(DecodeError::MissingField("mac"))
        ));
    }

    #[test]
    fn commands_serialise_with_type_tag() {
        let json: Value = serde_json::from_slice(
            &encode_command(&OutboundCommand::DeviceCmd {
                dest: "c1".into(),
                com: CoverCommand::position(140).com(),
            })
            .unwrap(),
        )
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "device_cmd", "dest": "c1", "com": "P:100"})
        );

        let json: Value = serde_json::from_slice(
            &encode_command(&OutboundCommand::SetLight {
                endpoint: 3,
                state: on_off(true).into(),
            })
            .unwrap(),
        )
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "set_light", "endpoint": 3, "state": "on"})
        );
    }
}
