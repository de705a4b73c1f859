//! Bridge orchestrator.
//!
//! Ties the shared services to setup entries:
//!
//! ```text
//!   gateways ──UDP──▶ InboundRouter ──▶ EventBus ──▶ light / cover registries ──▶ DeviceSink
//!                                          │  ▲
//!                            gateway_alive ▼  │ availability
//!                                       WatchdogHandle
//!
//!   gateway ──WebSocket──▶ GatewayConnection (one per entry) ──▶ registries / EventBus
//!
//!   Bridge::set_light & co ──▶ CommandDispatcher ──UDP / WebSocket──▶ gateway
//! ```
//!
//! The router, the watchdog and each registry are shared by every entry
//! and reference counted: the first [`Bridge::add_entry`] creates them and
//! the last [`Bridge::remove_entry`] shuts them down. A gateway's
//! WebSocket connection belongs to its entry alone.

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::bus::{EventBus, Subscription};
use crate::command::CommandDispatcher;
use crate::config::{BridgeConfig, GatewayEntryConfig, WebSocketConfig};
use crate::error::{BridgeError, Result};
use crate::gateway::{ConnectionOptions, ConnectionStatus, GatewayConnection};
use crate::protocol::{
    on_off, CoverCommand, DeviceKey, DeviceKind, Endpoint, GatewayAlive, GatewayDescriptor,
    InboundMessage, OutboundCommand, StateUpdate,
};
use crate::registry::{DeviceEvent, DeviceRecord, DeviceRegistry, DeviceSink, EntryContext};
use crate::router::InboundRouter;
use crate::service::RefCounted;
use crate::socket::listen_addr;
use crate::watchdog::WatchdogHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebSocketSettings {
    pub port: u16,
    pub path: String,
}

/// Everything needed to bring one gateway online.
#[derive(Debug, Clone)]
pub struct EntrySetup {
    pub entry_id: String,
    pub gateway: GatewayDescriptor,
    pub platforms: Vec<DeviceKind>,
    pub websocket: Option<WebSocketSettings>,
}

impl EntrySetup {
    /// Entry for a discovered gateway: both platforms, UDP only.
    pub fn new(gateway: GatewayDescriptor) -> Self {
        Self {
            entry_id: gateway.mac.clone(),
            gateway,
            platforms: vec![DeviceKind::Light, DeviceKind::Cover],
            websocket: None,
        }
    }

    pub fn from_config(entry: &GatewayEntryConfig, ws: &WebSocketConfig) -> Self {
        let gateway = entry.descriptor();
        Self {
            entry_id: gateway.mac.clone(),
            gateway,
            platforms: entry.platforms.clone(),
            websocket: entry.websocket.then(|| WebSocketSettings {
                port: entry.ws_port.unwrap_or(ws.port),
                path: entry.ws_path.clone().unwrap_or_else(|| ws.path.clone()),
            }),
        }
    }
}

type SharedRegistry = Arc<Mutex<DeviceRegistry>>;

/// A registry plus the bus subscriptions that feed it.
struct RegistryService {
    registry: SharedRegistry,
    _subscriptions: Vec<Subscription>,
}

impl RegistryService {
    fn start(kind: DeviceKind, bus: &EventBus) -> Self {
        let registry: SharedRegistry = Arc::new(Mutex::new(DeviceRegistry::new(kind)));
        let mut subscriptions = Vec::new();

        let (register, state) = match kind {
            DeviceKind::Light => (&bus.light_register, &bus.light_state),
            DeviceKind::Cover => (&bus.cover_register, &bus.cover_state),
        };
        subscriptions.push({
            let registry = registry.clone();
            register.subscribe(move |reg| {
                if let Err(e) = registry.lock().handle_registration(reg) {
                    log::warn!("Dropping {} registration {}: {}", reg.kind, reg.unique_id, e);
                }
            })
        });
        subscriptions.push({
            let registry = registry.clone();
            state.subscribe(move |update| {
                registry.lock().handle_state(update);
            })
        });
        subscriptions.push({
            let registry = registry.clone();
            bus.device_join.subscribe(move |join| {
                let created = registry.lock().handle_device_join(join);
                if created > 0 {
                    log::info!("Join of {} added {} {}(s)", join.device_id, created, kind);
                }
            })
        });
        subscriptions.push({
            let registry = registry.clone();
            bus.availability.subscribe(move |verdict| {
                registry
                    .lock()
                    .set_gateway_availability(&verdict.mac, verdict.available);
            })
        });

        // Reports relayed by a gateway also prove the gateway is alive.
        let liveness = bus.gateway_alive.clone();
        subscriptions.push(match kind {
            DeviceKind::Light => {
                let registry = registry.clone();
                bus.zigbee_report.subscribe(move |report| {
                    let mac = registry.lock().handle_zigbee_report(report);
                    if let Some(mac) = mac {
                        liveness.publish(&GatewayAlive { mac });
                    }
                })
            }
            DeviceKind::Cover => {
                let registry = registry.clone();
                bus.device_report.subscribe(move |report| {
                    let mac = registry.lock().handle_report(report);
                    if let Some(mac) = mac {
                        liveness.publish(&GatewayAlive { mac });
                    }
                })
            }
        });

        log::debug!("{} registry started", kind);
        Self {
            registry,
            _subscriptions: subscriptions,
        }
    }
}

struct EntryRuntime {
    setup: EntrySetup,
    connection: Option<Arc<GatewayConnection>>,
    _subscriptions: Vec<Subscription>,
}

pub struct Bridge {
    config: BridgeConfig,
    bus: EventBus,
    dispatcher: CommandDispatcher,
    router: RefCounted<InboundRouter>,
    watchdog: RefCounted<WatchdogHandle>,
    lights: RefCounted<RegistryService>,
    covers: RefCounted<RegistryService>,
    entries: HashMap<String, EntryRuntime>,
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            dispatcher: CommandDispatcher::from_config(&config),
            config,
            bus: EventBus::new(),
            router: RefCounted::new(),
            watchdog: RefCounted::new(),
            lights: RefCounted::new(),
            covers: RefCounted::new(),
            entries: HashMap::new(),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Where the shared UDP router listens, while any entry is active.
    pub fn router_addr(&self) -> Option<std::net::SocketAddr> {
        self.router.get().map(InboundRouter::local_addr)
    }

    pub fn entry_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Bring an entry online. Fails with [`BridgeError::Bind`] when the
    /// shared router cannot be started.
    pub fn add_entry(&mut self, setup: EntrySetup, sink: DeviceSink) -> Result<()> {
        if self.entries.contains_key(&setup.entry_id) {
            return Err(BridgeError::DuplicateEntry(setup.entry_id));
        }
        if setup.platforms.is_empty() {
            return Err(BridgeError::Config(format!(
                "entry {} enables no platform",
                setup.entry_id
            )));
        }

        let bind = listen_addr(self.config.local_bind_ip.as_deref(), self.config.listen_port);
        let bus = self.bus.clone();
        self.router.acquire(|| InboundRouter::start(bind, bus))?;

        let (timeout, tick) = (self.config.watchdog_timeout(), self.config.watchdog_tick());
        let bus = self.bus.clone();
        self.watchdog
            .acquire(|| Ok::<_, BridgeError>(WatchdogHandle::start(bus, timeout, tick)))?;

        let mut kinds = setup.platforms.clone();
        kinds.sort_by_key(|k| k.as_str());
        kinds.dedup();
        for kind in &kinds {
            let bus = self.bus.clone();
            let service = self
                .registry_slot(*kind)
                .acquire(|| Ok::<_, BridgeError>(RegistryService::start(*kind, &bus)))?;
            service.registry.lock().register_entry(EntryContext {
                entry_id: setup.entry_id.clone(),
                gateway: setup.gateway.clone(),
                sink: sink.clone(),
            })?;
        }

        let mut subscriptions = Vec::new();
        subscriptions.push({
            let sink = sink.clone();
            let mac = setup.gateway.mac.clone();
            let default_duration = self.config.join_window_secs;
            self.bus.join_window.subscribe(move |window| {
                if window.mac == mac {
                    let _ = sink.send(DeviceEvent::JoinWindowOpened {
                        gateway_mac: mac.clone(),
                        duration_s: window.duration_s.unwrap_or(default_duration),
                    });
                }
            })
        });

        let connection = match &setup.websocket {
            Some(ws) => {
                let connection = Arc::new(GatewayConnection::new(
                    &setup.gateway.mac,
                    &setup.gateway.ip,
                    ws.port,
                    &ws.path,
                    ConnectionOptions::from_config(&self.config.websocket),
                ));
                subscriptions.push(self.watch_connection(&connection, &setup, &sink));
                subscriptions.push(self.relay_frames(&connection, &setup));
                connection.start();
                Some(connection)
            }
            None => None,
        };

        log::info!(
            "Entry {} added (gateway {} at {}, platforms {:?}, websocket {})",
            setup.entry_id,
            setup.gateway.mac,
            setup.gateway.ip,
            kinds,
            connection.is_some()
        );
        self.entries.insert(
            setup.entry_id.clone(),
            EntryRuntime {
                setup: EntrySetup {
                    platforms: kinds,
                    ..setup
                },
                connection,
                _subscriptions: subscriptions,
            },
        );
        Ok(())
    }

    /// Tear an entry down: its devices are removed (and reported to its
    /// sink), its connection stopped, and shared services released.
    pub async fn remove_entry(&mut self, entry_id: &str) -> Result<()> {
        let entry = self
            .entries
            .remove(entry_id)
            .ok_or_else(|| BridgeError::UnknownEntry(entry_id.to_string()))?;
        let EntryRuntime {
            setup,
            connection,
            _subscriptions,
        } = entry;
        drop(_subscriptions);

        if let Some(connection) = connection {
            connection.stop().await;
        }

        for kind in &setup.platforms {
            let slot = self.registry_slot(*kind);
            if let Some(service) = slot.get() {
                service.registry.lock().unregister_entry(entry_id);
            }
            if slot.release().is_some() {
                log::debug!("{} registry released", kind);
            }
        }
        if let Some(mut watchdog) = self.watchdog.release() {
            watchdog.stop().await;
        }
        if let Some(mut router) = self.router.release() {
            router.stop().await;
        }

        log::info!("Entry {} removed", entry_id);
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        for entry_id in self.entry_ids() {
            if let Err(e) = self.remove_entry(&entry_id).await {
                log::warn!("Failed to remove entry {}: {}", entry_id, e);
            }
        }
    }

    /// Snapshot of every known device, ordered by kind then id.
    pub fn devices(&self) -> Vec<DeviceRecord> {
        let mut devices: Vec<DeviceRecord> = [self.lights.get(), self.covers.get()]
            .into_iter()
            .flatten()
            .flat_map(|service| service.registry.lock().devices().cloned().collect::<Vec<_>>())
            .collect();
        devices.sort_by(|a, b| {
            (a.kind.as_str(), &a.unique_id).cmp(&(b.kind.as_str(), &b.unique_id))
        });
        devices
    }

    pub fn device(&self, kind: DeviceKind, unique_id: &str) -> Option<DeviceRecord> {
        let service = match kind {
            DeviceKind::Light => self.lights.get(),
            DeviceKind::Cover => self.covers.get(),
        }?;
        service.registry.lock().get(unique_id).cloned()
    }

    /// Switch a light. Uses the gateway's WebSocket when it is connected,
    /// UDP otherwise. Transport failures are logged, not returned.
    pub async fn set_light(&self, unique_id: &str, on: bool) -> Result<()> {
        let (record, entry) = self.command_target(DeviceKind::Light, unique_id)?;
        let (device_id, endpoint) = light_address(&record);

        if let Some(connection) = entry.connection.as_ref().filter(|c| c.is_connected()) {
            let command = OutboundCommand::SetLight {
                endpoint,
                state: on_off(on).to_string(),
            };
            match self.dispatcher.send_ws(connection, &command).await {
                Ok(()) => return Ok(()),
                Err(e) => log::warn!("Websocket send for {} failed, using UDP: {}", unique_id, e),
            }
        }

        let command = OutboundCommand::ForwardCommand {
            id: device_id,
            endpoint,
            cmd: on_off(on).to_string(),
        };
        self.send_to_entry(entry, &command).await;
        Ok(())
    }

    pub async fn open_cover(&self, unique_id: &str) -> Result<()> {
        self.cover_command(unique_id, CoverCommand::Open).await
    }

    pub async fn close_cover(&self, unique_id: &str) -> Result<()> {
        self.cover_command(unique_id, CoverCommand::Close).await
    }

    /// Position is clamped to 0..=100 before sending.
    pub async fn set_cover_position(&self, unique_id: &str, position: i64) -> Result<()> {
        self.cover_command(unique_id, CoverCommand::position(position))
            .await
    }

    /// Ask the entry's gateway to accept new devices for the configured
    /// join window.
    pub async fn open_join_window(&self, entry_id: &str) -> Result<()> {
        let entry = self.entries.get(entry_id).ok_or_else(|| {
            log::warn!("Join window requested for unknown entry {}", entry_id);
            BridgeError::UnknownEntry(entry_id.to_string())
        })?;
        let command = OutboundCommand::OpenJoin {
            target_mac: entry.setup.gateway.mac.clone(),
            duration_s: self.config.join_window_secs,
            req_id: Uuid::new_v4().to_string(),
        };
        self.send_to_entry(entry, &command).await;
        Ok(())
    }

    async fn cover_command(&self, unique_id: &str, command: CoverCommand) -> Result<()> {
        let (record, entry) = self.command_target(DeviceKind::Cover, unique_id)?;
        let command = OutboundCommand::DeviceCmd {
            dest: record.device_id.unwrap_or(record.unique_id),
            com: command.com(),
        };
        self.send_to_entry(entry, &command).await;
        Ok(())
    }

    fn command_target(
        &self,
        kind: DeviceKind,
        unique_id: &str,
    ) -> Result<(DeviceRecord, &EntryRuntime)> {
        let target = self.device(kind, unique_id).and_then(|record| {
            let entry = self.entries.get(&record.entry_id)?;
            Some((record, entry))
        });
        target.ok_or_else(|| {
            log::warn!("Command for unknown {} {} dropped", kind, unique_id);
            BridgeError::UnknownDevice(unique_id.to_string())
        })
    }

    async fn send_to_entry(&self, entry: &EntryRuntime, command: &OutboundCommand) {
        let ip = entry.setup.gateway.ip.trim();
        if ip.is_empty() {
            log::warn!(
                "Gateway {} has no known address; dropping {:?}",
                entry.setup.gateway.mac,
                command
            );
            return;
        }
        self.dispatcher.send_to_gateway(ip, command).await;
    }

    fn registry_slot(&mut self, kind: DeviceKind) -> &mut RefCounted<RegistryService> {
        match kind {
            DeviceKind::Light => &mut self.lights,
            DeviceKind::Cover => &mut self.covers,
        }
    }

    fn watch_connection(
        &self,
        connection: &GatewayConnection,
        setup: &EntrySetup,
        sink: &DeviceSink,
    ) -> Subscription {
        let sink = sink.clone();
        let mac = setup.gateway.mac.clone();
        // Failed reconnects cycle through Connecting; the sink only hears
        // about flips of the connected flag.
        let last = Mutex::new(None::<bool>);
        connection.subscribe_status(move |status| {
            let connected = match status {
                ConnectionStatus::Connected => true,
                ConnectionStatus::Disconnected => false,
                ConnectionStatus::Connecting => return,
            };
            if last.lock().replace(connected) == Some(connected) {
                return;
            }
            let _ = sink.send(DeviceEvent::ConnectionChanged {
                gateway_mac: mac.clone(),
                connected,
            });
        })
    }

    /// Registry for this entry's endpoint-keyed light frames. Only an entry
    /// with the light platform holds a reference that keeps it alive.
    fn endpoint_registry(&self, setup: &EntrySetup) -> Option<SharedRegistry> {
        if !setup.platforms.contains(&DeviceKind::Light) {
            return None;
        }
        self.lights.get().map(|service| service.registry.clone())
    }

    /// Frames keyed by endpoint only make sense for this gateway and go
    /// straight to the light registry; everything else joins the UDP
    /// traffic on the bus.
    fn relay_frames(&self, connection: &GatewayConnection, setup: &EntrySetup) -> Subscription {
        let lights = self.endpoint_registry(setup);
        let bus = self.bus.clone();
        let mac = setup.gateway.mac.clone();
        connection.subscribe_messages(move |message| match message {
            InboundMessage::State(StateUpdate {
                kind: DeviceKind::Light,
                key: DeviceKey::Endpoint(endpoint),
                state,
                ..
            }) => match &lights {
                Some(lights) => {
                    lights
                        .lock()
                        .handle_endpoint_state(&mac, *endpoint, state.as_deref(), None);
                }
                None => log::debug!("Light frame from {} without a light platform", mac),
            },
            InboundMessage::Unrecognized(msg_type) => {
                log::debug!("Ignoring websocket message '{}' from {}", msg_type, mac);
            }
            other => {
                bus.dispatch(other);
            }
        })
    }
}

/// Device id and endpoint a light command addresses. Falls back to the
/// `{device}_{endpoint}` shape of the unique id, then to endpoint 1.
fn light_address(record: &DeviceRecord) -> (String, Endpoint) {
    let parsed = record
        .unique_id
        .rsplit_once('_')
        .and_then(|(device, ep)| Some((device.to_string(), ep.parse::<Endpoint>().ok()?)));
    let device_id = record
        .device_id
        .clone()
        .or_else(|| parsed.as_ref().map(|(device, _)| device.clone()))
        .unwrap_or_else(|| record.unique_id.clone());
    let endpoint = record
        .endpoint
        .or_else(|| parsed.map(|(_, ep)| ep))
        .unwrap_or(1);
    (device_id, endpoint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DeviceReport, Registration};
    use crate::registry::DeviceState;
    use futures_util::{SinkExt, StreamExt};
    use serde_json::Value;
    use tokio::{
        net::{TcpListener, UdpSocket},
        sync::mpsc::{self, UnboundedReceiver},
        time::{timeout, Duration},
    };
    use tokio_tungstenite::tungstenite::Message;

    fn test_config(command_port: u16) -> BridgeConfig {
        BridgeConfig {
            local_bind_ip: Some("127.0.0.1".into()),
            listen_port: 0,
            command_port,
            ..BridgeConfig::default()
        }
    }

    fn setup(mac: &str, ip: &str) -> EntrySetup {
        EntrySetup::new(GatewayDescriptor::new(mac, ip))
    }

    async fn next_event(rx: &mut UnboundedReceiver<DeviceEvent>) -> DeviceEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a device event")
            .expect("sink closed")
    }

    async fn recv_json(socket: &UdpSocket) -> Value {
        let mut buf = [0u8; 1024];
        let (len, _) = timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        serde_json::from_slice(&buf[..len]).unwrap()
    }

    #[tokio::test]
    async fn entries_share_the_router_and_release_it_last() {
        let mut bridge = Bridge::new(test_config(50000));
        let (sink1, _rx1) = mpsc::unbounded_channel();
        let (sink2, mut rx2) = mpsc::unbounded_channel();
        bridge.add_entry(setup("aa:01", "10.0.0.1"), sink1).unwrap();
        let addr = bridge.router_addr().unwrap();
        bridge.add_entry(setup("AA:02", "10.0.0.2"), sink2.clone()).unwrap();
        assert_eq!(bridge.router_addr(), Some(addr));
        assert!(matches!(
            bridge.add_entry(setup("aa:02", "10.0.0.2"), sink2),
            Err(BridgeError::DuplicateEntry(_))
        ));
        let mut bare = setup("aa:09", "10.0.0.9");
        bare.platforms.clear();
        assert!(matches!(
            bridge.add_entry(bare, mpsc::unbounded_channel().0),
            Err(BridgeError::Config(_))
        ));

        let gateway = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        gateway
            .send_to(
                br#"{"type": "light_register", "unique_id": "zb9_1", "gateway_mac": "aa:02", "state": "on"}"#,
                addr,
            )
            .await
            .unwrap();

        let DeviceEvent::Added(record) = next_event(&mut rx2).await else {
            panic!("expected a new device");
        };
        assert_eq!(record.entry_id, "aa:02");
        let DeviceEvent::Updated(record) = next_event(&mut rx2).await else {
            panic!("expected initial state");
        };
        assert_eq!(record.state, DeviceState::Light { is_on: true });

        bridge.remove_entry("aa:02").await.unwrap();
        assert!(matches!(
            next_event(&mut rx2).await,
            DeviceEvent::Removed { unique_id } if unique_id == "zb9_1"
        ));
        assert_eq!(bridge.router_addr(), Some(addr));
        assert!(bridge.devices().is_empty());

        bridge.remove_entry("aa:01").await.unwrap();
        assert_eq!(bridge.router_addr(), None);
        assert!(matches!(
            bridge.remove_entry("aa:01").await,
            Err(BridgeError::UnknownEntry(_))
        ));
    }

    #[tokio::test]
    async fn cover_and_join_commands_go_out_over_udp() {
        let gateway = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = gateway.local_addr().unwrap().port();
        let mut bridge = Bridge::new(test_config(port));
        let (sink, _rx) = mpsc::unbounded_channel();
        bridge.add_entry(setup("aa:01", "127.0.0.1"), sink).unwrap();

        let mut reg = Registration::new(DeviceKind::Cover, "cover_7");
        reg.device_id = Some("c7".into());
        bridge.bus().dispatch(&InboundMessage::Register(reg));

        bridge.set_cover_position("cover_7", 150).await.unwrap();
        assert_eq!(
            recv_json(&gateway).await,
            serde_json::json!({"type": "device_cmd", "dest": "c7", "com": "P:100"})
        );
        bridge.close_cover("cover_7").await.unwrap();
        assert_eq!(recv_json(&gateway).await["com"], "CLOSE");

        bridge.open_join_window("aa:01").await.unwrap();
        let join = recv_json(&gateway).await;
        assert_eq!(join["type"], "open_join");
        assert_eq!(join["target_mac"], "aa:01");
        assert_eq!(join["duration_s"], 120);
        assert!(Uuid::parse_str(join["req_id"].as_str().unwrap()).is_ok());

        assert!(matches!(
            bridge.open_cover("nope").await,
            Err(BridgeError::UnknownDevice(_))
        ));
        assert!(matches!(
            bridge.open_join_window("nope").await,
            Err(BridgeError::UnknownEntry(_))
        ));
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn light_without_websocket_uses_forward_command() {
        let gateway = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = gateway.local_addr().unwrap().port();
        let mut bridge = Bridge::new(test_config(port));
        let (sink, _rx) = mpsc::unbounded_channel();
        bridge.add_entry(setup("aa:01", "127.0.0.1"), sink).unwrap();

        bridge
            .bus()
            .dispatch(&InboundMessage::Register(Registration::new(
                DeviceKind::Light,
                "00124b_3",
            )));
        bridge.set_light("00124b_3", true).await.unwrap();
        assert_eq!(
            recv_json(&gateway).await,
            serde_json::json!({"type": "forward_command", "id": "00124b", "endpoint": 3, "cmd": "on"})
        );
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn device_report_counts_as_gateway_liveness() {
        let mut bridge = Bridge::new(test_config(50000));
        let (sink, mut rx) = mpsc::unbounded_channel();
        bridge.add_entry(setup("aa:01", "10.0.0.1"), sink).unwrap();

        let (alive_tx, mut alive_rx) = mpsc::unbounded_channel();
        let _alive = bridge.bus().gateway_alive.subscribe(move |alive| {
            let _ = alive_tx.send(alive.mac.clone());
        });

        bridge
            .bus()
            .dispatch(&InboundMessage::Register(Registration::new(
                DeviceKind::Cover,
                "c1",
            )));
        assert!(matches!(next_event(&mut rx).await, DeviceEvent::Added(_)));

        bridge
            .bus()
            .dispatch(&InboundMessage::DeviceReport(DeviceReport {
                device_id: "c1".into(),
                payload: "P:40".into(),
            }));
        assert_eq!(alive_rx.try_recv().unwrap(), "aa:01");
        let DeviceEvent::Updated(record) = next_event(&mut rx).await else {
            panic!("expected update");
        };
        assert_eq!(
            record.state,
            DeviceState::Cover(crate::registry::CoverState {
                is_closed: None,
                position: Some(40),
            })
        );

        // Reports for devices nobody registered say nothing about liveness.
        bridge
            .bus()
            .dispatch(&InboundMessage::DeviceReport(DeviceReport {
                device_id: "ghost".into(),
                payload: "OPENED".into(),
            }));
        assert!(alive_rx.try_recv().is_err());
        bridge.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn device_added_after_gateway_went_quiet_becomes_unavailable() {
        let mut bridge = Bridge::new(test_config(50000));
        let (sink, mut rx) = mpsc::unbounded_channel();
        bridge.add_entry(setup("aa:01", "10.0.0.1"), sink).unwrap();

        bridge
            .bus()
            .dispatch(&InboundMessage::Register(Registration::new(
                DeviceKind::Cover,
                "c1",
            )));
        bridge.bus().gateway_alive.publish(&GatewayAlive {
            mac: "aa:01".into(),
        });

        tokio::time::sleep(Duration::from_secs(150)).await;
        assert!(!bridge.device(DeviceKind::Cover, "c1").unwrap().available);

        bridge
            .bus()
            .dispatch(&InboundMessage::Register(Registration::new(
                DeviceKind::Cover,
                "c2",
            )));
        assert!(bridge.device(DeviceKind::Cover, "c2").unwrap().available);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!bridge.device(DeviceKind::Cover, "c2").unwrap().available);

        // Repeated verdicts do not repeat notifications.
        let mut unavailable = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let DeviceEvent::Updated(record) = event {
                if !record.available {
                    unavailable.push(record.unique_id);
                }
            }
        }
        assert_eq!(unavailable, vec!["c1".to_string(), "c2".to_string()]);
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn failed_reconnects_report_disconnected_once() {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ws_port = closed.local_addr().unwrap().port();
        drop(closed);

        let mut config = test_config(50000);
        config.websocket.backoff_floor_secs = 1;
        config.websocket.backoff_ceiling_secs = 1;
        let mut bridge = Bridge::new(config);
        let (sink, mut rx) = mpsc::unbounded_channel();
        let mut entry = setup("aa:01", "127.0.0.1");
        entry.websocket = Some(WebSocketSettings {
            port: ws_port,
            path: "/ws".into(),
        });
        bridge.add_entry(entry, sink).unwrap();

        tokio::time::sleep(Duration::from_millis(3500)).await;
        let connection = bridge.entries["aa:01"].connection.clone().unwrap();
        assert!(connection.connect_attempts() >= 2);

        let mut changes = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let DeviceEvent::ConnectionChanged { connected, .. } = event {
                changes.push(connected);
            }
        }
        assert_eq!(changes, vec![false]);
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn endpoint_frames_follow_the_entry_light_platform() {
        let mut bridge = Bridge::new(test_config(50000));
        let lit = setup("aa:01", "10.0.0.1");
        let mut dark = setup("aa:02", "10.0.0.2");
        dark.platforms = vec![DeviceKind::Cover];
        bridge
            .add_entry(lit.clone(), mpsc::unbounded_channel().0)
            .unwrap();
        bridge
            .add_entry(dark.clone(), mpsc::unbounded_channel().0)
            .unwrap();

        let lights = bridge.lights.get().unwrap().registry.clone();
        assert!(Arc::ptr_eq(&bridge.endpoint_registry(&lit).unwrap(), &lights));
        assert!(bridge.endpoint_registry(&dark).is_none());
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn websocket_entry_controls_lights_by_endpoint() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ws_port = listener.local_addr().unwrap().port();
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<Value>();
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Text(text) = msg {
                    let cmd: Value = serde_json::from_str(text.as_str()).unwrap();
                    let reply = serde_json::json!({
                        "type": "light_state",
                        "endpoint": cmd["endpoint"],
                        "state": cmd["state"],
                    });
                    let _ = cmd_tx.send(cmd);
                    ws.send(Message::Text(reply.to_string().into())).await.unwrap();
                }
            }
        });

        let mut bridge = Bridge::new(test_config(50000));
        let (sink, mut rx) = mpsc::unbounded_channel();
        let mut entry = setup("aa:01", "127.0.0.1");
        entry.websocket = Some(WebSocketSettings {
            port: ws_port,
            path: "/ws".into(),
        });
        bridge.add_entry(entry, sink).unwrap();

        assert!(matches!(
            next_event(&mut rx).await,
            DeviceEvent::ConnectionChanged { connected: false, .. }
        ));
        assert!(matches!(
            next_event(&mut rx).await,
            DeviceEvent::ConnectionChanged { connected: true, .. }
        ));

        let mut reg = Registration::new(DeviceKind::Light, "zb1_2");
        reg.endpoint = Some(2);
        bridge.bus().dispatch(&InboundMessage::Register(reg));
        assert!(matches!(next_event(&mut rx).await, DeviceEvent::Added(_)));

        bridge.set_light("zb1_2", true).await.unwrap();
        let cmd = timeout(Duration::from_secs(5), cmd_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            cmd,
            serde_json::json!({"type": "set_light", "endpoint": 2, "state": "on"})
        );

        let DeviceEvent::Updated(record) = next_event(&mut rx).await else {
            panic!("expected the echoed state");
        };
        assert_eq!(record.unique_id, "zb1_2");
        assert_eq!(record.state, DeviceState::Light { is_on: true });

        bridge.shutdown().await;
        server.abort();
    }
}
