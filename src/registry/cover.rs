//! Cover state rules and join expansion.
//!
//! Two encodings reach a cover: structured `state` + `position` fields
//! (`cover_register`, `cover_state`) and compact report strings such as
//! `OPENING` or `P:40` (`device_report`). Both reduce to [`CoverState`].

use crate::protocol::{DeviceJoin, DeviceKind, Registration};

const COVER_MARKER: &str = "cover";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoverState {
    /// `None` while moving or when the position is in between.
    pub is_closed: Option<bool>,
    pub position: Option<u8>,
}

pub fn clamp_position(position: i64) -> u8 {
    position.clamp(0, 100) as u8
}

/// Only the end stops say anything about open/closed.
pub fn closed_from_position(position: u8) -> Option<bool> {
    match position {
        0 => Some(true),
        100 => Some(false),
        _ => None,
    }
}

/// Structured update. `state` and `position` are applied independently;
/// unknown state text leaves `is_closed` as it was.
pub fn apply_cover_state(
    current: CoverState,
    state: Option<&str>,
    position: Option<i64>,
) -> CoverState {
    let mut next = current;
    if let Some(state) = state {
        match state.trim().to_ascii_lowercase().as_str() {
            "open" | "opened" => next.is_closed = Some(false),
            "close" | "closed" => next.is_closed = Some(true),
            "opening" | "closing" => next.is_closed = None,
            _ => {}
        }
    }
    if let Some(position) = position {
        next.position = Some(clamp_position(position));
    }
    next
}

/// Compact report string. Unknown tokens leave the state untouched.
pub fn apply_cover_report(current: CoverState, payload: &str) -> CoverState {
    let token = payload.trim().to_ascii_uppercase();
    match token.as_str() {
        "OPENING" | "CLOSING" => CoverState {
            is_closed: None,
            ..current
        },
        "OPENED" => CoverState {
            is_closed: Some(false),
            position: Some(100),
        },
        "CLOSED" => CoverState {
            is_closed: Some(true),
            position: Some(0),
        },
        _ => match token
            .strip_prefix("P:")
            .and_then(|n| n.trim().parse::<i64>().ok())
        {
            Some(n) => {
                let position = clamp_position(n);
                CoverState {
                    is_closed: closed_from_position(position),
                    position: Some(position),
                }
            }
            None => current,
        },
    }
}

/// A single cover registration for `cover` devices, keyed by device id.
pub fn join_registrations(join: &DeviceJoin) -> Vec<Registration> {
    if !join.device_type.to_ascii_lowercase().contains(COVER_MARKER) {
        return Vec::new();
    }
    vec![Registration {
        device_id: Some(join.device_id.clone()),
        endpoint: join.endpoints.first().copied(),
        name: Some(format!("Cover {}", join.device_id)),
        gateway_mac: join.gateway_mac.clone(),
        device_type: Some(join.device_type.clone()),
        ..Registration::new(DeviceKind::Cover, join.device_id.clone())
    }]
}
