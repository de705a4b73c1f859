//! Device registry.
//!
//! One [`DeviceRegistry`] per device kind, shared by every setup entry of
//! that kind. Records are keyed by `unique_id`; the first registration of
//! an id fixes its identity and owning entry, later ones may only rename
//! it. Every observable change is pushed to the owning entry's
//! [`DeviceSink`], and only when something actually changed.

pub mod cover;
pub mod light;

use std::collections::HashMap;

use tokio::{sync::mpsc, time::Instant};

use crate::error::{BridgeError, Result};
use crate::protocol::{
    normalize_mac, DeviceJoin, DeviceKey, DeviceKind, DeviceReport, Endpoint, GatewayDescriptor,
    Registration, StateUpdate, ZigbeeReport,
};

pub use cover::CoverState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Light { is_on: bool },
    Cover(CoverState),
}

impl DeviceState {
    fn initial(kind: DeviceKind) -> Self {
        match kind {
            DeviceKind::Light => DeviceState::Light { is_on: false },
            DeviceKind::Cover => DeviceState::Cover(CoverState::default()),
        }
    }

    /// Apply structured `state` / `position` fields.
    fn with_fields(self, state: Option<&str>, position: Option<i64>) -> Self {
        match self {
            DeviceState::Light { is_on } => DeviceState::Light {
                is_on: light::apply_light_state(is_on, state),
            },
            DeviceState::Cover(current) => {
                DeviceState::Cover(cover::apply_cover_state(current, state, position))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub unique_id: String,
    pub kind: DeviceKind,
    pub entry_id: String,
    pub gateway_mac: String,
    pub device_id: Option<String>,
    pub endpoint: Option<Endpoint>,
    pub device_type: Option<String>,
    pub name: String,
    pub state: DeviceState,
    pub available: bool,
    pub last_update: Instant,
}

/// What the entity layer of one setup entry is told.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    Added(DeviceRecord),
    Updated(DeviceRecord),
    Removed { unique_id: String },
    ConnectionChanged { gateway_mac: String, connected: bool },
    JoinWindowOpened { gateway_mac: String, duration_s: u64 },
}

pub type DeviceSink = mpsc::UnboundedSender<DeviceEvent>;

/// A setup entry as seen by a registry.
#[derive(Debug, Clone)]
pub struct EntryContext {
    pub entry_id: String,
    pub gateway: GatewayDescriptor,
    pub sink: DeviceSink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationOutcome {
    Created,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateOutcome {
    Changed,
    Unchanged,
    UnknownDevice,
}

pub struct DeviceRegistry {
    kind: DeviceKind,
    entries: Vec<EntryContext>,
    devices: HashMap<String, DeviceRecord>,
    dropped_updates: u64,
}

impl DeviceRegistry {
    pub fn new(kind: DeviceKind) -> Self {
        Self {
            kind,
            entries: Vec::new(),
            devices: HashMap::new(),
            dropped_updates: 0,
        }
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn register_entry(&mut self, context: EntryContext) -> Result<()> {
        if self.entries.iter().any(|e| e.entry_id == context.entry_id) {
            return Err(BridgeError::DuplicateEntry(context.entry_id));
        }
        log::debug!(
            "{} registry: entry {} (gateway {}) registered",
            self.kind,
            context.entry_id,
            context.gateway.mac
        );
        self.entries.push(context);
        Ok(())
    }

    /// Drop the entry and every device it owns. Returns the removed ids.
    pub fn unregister_entry(&mut self, entry_id: &str) -> Vec<String> {
        let Some(index) = self.entries.iter().position(|e| e.entry_id == entry_id) else {
            return Vec::new();
        };
        let context = self.entries.remove(index);

        let mut removed: Vec<String> = self
            .devices
            .values()
            .filter(|d| d.entry_id == entry_id)
            .map(|d| d.unique_id.clone())
            .collect();
        removed.sort();
        for unique_id in &removed {
            self.devices.remove(unique_id);
            let _ = context.sink.send(DeviceEvent::Removed {
                unique_id: unique_id.clone(),
            });
        }
        log::debug!(
            "{} registry: entry {} unregistered, {} device(s) removed",
            self.kind,
            entry_id,
            removed.len()
        );
        removed
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, unique_id: &str) -> Option<&DeviceRecord> {
        self.devices.get(unique_id)
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceRecord> {
        self.devices.values()
    }

    /// State updates and reports that named no known device.
    pub fn dropped_updates(&self) -> u64 {
        self.dropped_updates
    }

    pub fn handle_registration(&mut self, reg: &Registration) -> Result<RegistrationOutcome> {
        if reg.kind != self.kind {
            return Ok(RegistrationOutcome::Unchanged);
        }

        if let Some(record) = self.devices.get_mut(&reg.unique_id) {
            let renamed = match &reg.name {
                Some(name) if *name != record.name => {
                    record.name = name.clone();
                    true
                }
                _ => false,
            };
            if !renamed {
                return Ok(RegistrationOutcome::Unchanged);
            }
            record.last_update = Instant::now();
            let snapshot = record.clone();
            self.emit(&snapshot.entry_id, DeviceEvent::Updated(snapshot.clone()));
            return Ok(RegistrationOutcome::Updated);
        }

        let index = self.resolve_entry(reg)?;
        let context = &self.entries[index];
        let record = DeviceRecord {
            unique_id: reg.unique_id.clone(),
            kind: self.kind,
            entry_id: context.entry_id.clone(),
            gateway_mac: context.gateway.mac.clone(),
            device_id: reg.device_id.clone(),
            endpoint: reg.endpoint,
            device_type: reg.device_type.clone(),
            name: reg
                .name
                .clone()
                .unwrap_or_else(|| default_name(self.kind, &reg.unique_id)),
            state: DeviceState::initial(self.kind),
            available: true,
            last_update: Instant::now(),
        };
        log::info!(
            "New {} {} ({}) on gateway {}",
            self.kind,
            record.unique_id,
            record.name,
            record.gateway_mac
        );
        let _ = context.sink.send(DeviceEvent::Added(record.clone()));
        self.devices.insert(record.unique_id.clone(), record);

        if reg.carries_state() {
            let (state, position) = (reg.state.as_deref(), reg.position);
            self.update(&reg.unique_id, |r| {
                r.state = r.state.with_fields(state, position);
            });
        }
        Ok(RegistrationOutcome::Created)
    }

    /// Turn a join announcement into registrations of this registry's kind.
    /// Returns how many new devices were created.
    pub fn handle_device_join(&mut self, join: &DeviceJoin) -> usize {
        let registrations = match self.kind {
            DeviceKind::Light => light::join_registrations(join),
            DeviceKind::Cover => cover::join_registrations(join),
        };
        let mut created = 0;
        for reg in &registrations {
            match self.handle_registration(reg) {
                Ok(RegistrationOutcome::Created) => created += 1,
                Ok(_) => {}
                Err(e) => log::warn!("Dropping joined {} {}: {}", self.kind, reg.unique_id, e),
            }
        }
        created
    }

    pub fn handle_state(&mut self, update: &StateUpdate) -> StateOutcome {
        if update.kind != self.kind {
            return StateOutcome::Unchanged;
        }
        let (state, position) = (update.state.as_deref(), update.position);
        match &update.key {
            DeviceKey::UniqueId(unique_id) => {
                let outcome = self.update(unique_id, |r| {
                    r.state = r.state.with_fields(state, position);
                });
                self.note_unknown(outcome, unique_id)
            }
            DeviceKey::Endpoint(endpoint) => match self.entries.as_slice() {
                [only] => {
                    let mac = only.gateway.mac.clone();
                    self.handle_endpoint_state(&mac, *endpoint, state, position)
                }
                _ => {
                    let key = format!("endpoint {}", endpoint);
                    self.note_unknown(StateOutcome::UnknownDevice, &key)
                }
            },
        }
    }

    /// State for the device on `endpoint` behind `gateway_mac`, as carried
    /// by a gateway's websocket frames.
    pub fn handle_endpoint_state(
        &mut self,
        gateway_mac: &str,
        endpoint: Endpoint,
        state: Option<&str>,
        position: Option<i64>,
    ) -> StateOutcome {
        let mac = normalize_mac(gateway_mac);
        let unique_id = self
            .devices
            .values()
            .find(|d| d.gateway_mac == mac && d.endpoint == Some(endpoint))
            .map(|d| d.unique_id.clone());
        match unique_id {
            Some(unique_id) => self.update(&unique_id, |r| {
                r.state = r.state.with_fields(state, position);
            }),
            None => {
                let key = format!("{} endpoint {}", mac, endpoint);
                self.note_unknown(StateOutcome::UnknownDevice, &key)
            }
        }
    }

    /// Compact cover report. Returns the owning gateway's MAC when the
    /// device is known, so the caller can count it as liveness.
    pub fn handle_report(&mut self, report: &DeviceReport) -> Option<String> {
        if self.kind != DeviceKind::Cover {
            return None;
        }
        let unique_id = self.find_by_device_id(&report.device_id)?;
        let payload = report.payload.as_str();
        self.update(&unique_id, |r| {
            if let DeviceState::Cover(current) = r.state {
                r.state = DeviceState::Cover(cover::apply_cover_report(current, payload));
            }
        });
        self.devices.get(&unique_id).map(|d| d.gateway_mac.clone())
    }

    /// Light on/off report from the radio side. Also marks the light
    /// available. Returns the owning gateway's MAC when known.
    pub fn handle_zigbee_report(&mut self, report: &ZigbeeReport) -> Option<String> {
        if self.kind != DeviceKind::Light {
            return None;
        }
        let unique_id = light::light_unique_id(&report.device_id, report.endpoint);
        let on = report.on;
        let outcome = self.update(&unique_id, |r| {
            if let Some(is_on) = on {
                r.state = DeviceState::Light { is_on };
            }
            r.available = true;
        });
        if self.note_unknown(outcome, &unique_id) == StateOutcome::UnknownDevice {
            return None;
        }
        self.devices.get(&unique_id).map(|d| d.gateway_mac.clone())
    }

    /// Set `available` on every device behind `gateway_mac`. Returns how
    /// many devices actually changed.
    pub fn set_gateway_availability(&mut self, gateway_mac: &str, available: bool) -> usize {
        let mac = normalize_mac(gateway_mac);
        let now = Instant::now();
        let mut changed = Vec::new();
        for record in self.devices.values_mut() {
            if record.gateway_mac == mac && record.available != available {
                record.available = available;
                record.last_update = now;
                changed.push(record.clone());
            }
        }
        for record in &changed {
            self.emit(&record.entry_id, DeviceEvent::Updated(record.clone()));
        }
        if !changed.is_empty() {
            log::info!(
                "Gateway {} {}: {} {}(s) updated",
                mac,
                if available { "available" } else { "unavailable" },
                changed.len(),
                self.kind
            );
        }
        changed.len()
    }

    /// Explicit `gateway_mac` if it names an entry, else the only entry.
    fn resolve_entry(&self, reg: &Registration) -> Result<usize> {
        if let Some(mac) = &reg.gateway_mac {
            if let Some(index) = self.entries.iter().position(|e| e.gateway.mac == *mac) {
                return Ok(index);
            }
        }
        if self.entries.len() == 1 {
            return Ok(0);
        }
        Err(BridgeError::RoutingAmbiguous {
            unique_id: reg.unique_id.clone(),
            candidates: self.entries.len(),
        })
    }

    fn find_by_device_id(&mut self, device_id: &str) -> Option<String> {
        let found = if self.devices.contains_key(device_id) {
            Some(device_id.to_string())
        } else {
            self.devices
                .values()
                .find(|d| d.device_id.as_deref() == Some(device_id))
                .map(|d| d.unique_id.clone())
        };
        if found.is_none() {
            self.note_unknown(StateOutcome::UnknownDevice, device_id);
        }
        found
    }

    /// Mutate one record; notify its entry if state or availability moved.
    fn update(&mut self, unique_id: &str, mutate: impl FnOnce(&mut DeviceRecord)) -> StateOutcome {
        let Some(record) = self.devices.get_mut(unique_id) else {
            return StateOutcome::UnknownDevice;
        };
        let before = (record.state, record.available);
        mutate(record);
        if (record.state, record.available) == before {
            return StateOutcome::Unchanged;
        }
        record.last_update = Instant::now();
        let snapshot = record.clone();
        log::debug!("{} {} -> {:?}", self.kind, unique_id, snapshot.state);
        self.emit(&snapshot.entry_id, DeviceEvent::Updated(snapshot.clone()));
        StateOutcome::Changed
    }

    fn note_unknown(&mut self, outcome: StateOutcome, key: &str) -> StateOutcome {
        if outcome == StateOutcome::UnknownDevice {
            self.dropped_updates += 1;
            log::debug!("Dropping update for unknown {} {}", self.kind, key);
        }
        outcome
    }

    fn emit(&self, entry_id: &str, event: DeviceEvent) {
        if let Some(context) = self.entries.iter().find(|e| e.entry_id == entry_id) {
            // A closed sink means the entity layer is gone; nothing to do.
            let _ = context.sink.send(event);
        }
    }
}

fn default_name(kind: DeviceKind, unique_id: &str) -> String {
    match kind {
        DeviceKind::Light => format!("Light {}", unique_id),
        DeviceKind::Cover => format!("Cover {}", unique_id),
    }
}
