//! Light state rules and join expansion.

use crate::protocol::{DeviceJoin, DeviceKind, Registration};

/// Device-type marker for multi-endpoint relay lights.
const THREE_LIGHTS_MARKER: &str = "3lights";

/// `on` / `off` in any case; anything else is not a light state.
pub fn parse_light_state(state: &str) -> Option<bool> {
    match state.trim().to_ascii_lowercase().as_str() {
        "on" => Some(true),
        "off" => Some(false),
        _ => None,
    }
}

/// New `is_on` after a textual state. Unknown text leaves it unchanged.
pub fn apply_light_state(is_on: bool, state: Option<&str>) -> bool {
    state.and_then(parse_light_state).unwrap_or(is_on)
}

pub fn light_unique_id(device_id: &str, endpoint: u16) -> String {
    format!("{}_{}", device_id, endpoint)
}

/// One light registration per endpoint for `3lights` devices; nothing
/// for any other device type.
pub fn join_registrations(join: &DeviceJoin) -> Vec<Registration> {
    if !join
        .device_type
        .to_ascii_lowercase()
        .contains(THREE_LIGHTS_MARKER)
    {
        return Vec::new();
    }

    join.endpoints
        .iter()
        .map(|&endpoint| Registration {
            device_id: Some(join.device_id.clone()),
            endpoint: Some(endpoint),
            name: Some(format!("Light {}", endpoint)),
            gateway_mac: join.gateway_mac.clone(),
            device_type: Some(join.device_type.clone()),
            ..Registration::new(DeviceKind::Light, light_unique_id(&join.device_id, endpoint))
        })
        .collect()
}
