//! UDP broadcast discovery of gateways.
//!
//! Used once at setup: the probe string is broadcast every retry interval
//! until the window closes, and every `ESP-GATEWAY|...` reply received
//! inside the window is folded into a map keyed by gateway MAC. Repeated
//! replies from the same gateway overwrite each other (last reply wins);
//! anything that fails to decode is skipped without ending the window.

use std::{
    collections::{HashMap, HashSet},
    net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4},
};

use tokio::{
    net::UdpSocket,
    time::{interval, sleep_until, Duration, Instant, MissedTickBehavior},
};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::protocol::{
    decode_discovery_response, DiscoveryResponse, GatewayDescriptor, DISCOVERY_MESSAGE,
    MAX_DATAGRAM_SIZE,
};
use crate::socket::{bind_reusable_udp, listen_addr};

/// Gateways found during one discovery window, keyed by lower-case MAC.
pub type DiscoveredGateways = HashMap<String, GatewayDescriptor>;

#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// Where replies are received; the probe is sent from the same socket.
    pub bind: SocketAddr,
    /// Probe destinations. Empty → every broadcast address we can find.
    pub targets: Vec<SocketAddr>,
    pub broadcast_port: u16,
    pub retry_interval: Duration,
    pub window: Duration,
}

impl DiscoveryOptions {
    pub fn from_config(cfg: &BridgeConfig) -> Self {
        Self {
            bind: listen_addr(cfg.local_bind_ip.as_deref(), cfg.discovery.response_port),
            // Validated when the config was loaded.
            targets: cfg
                .discovery
                .targets
                .iter()
                .filter_map(|t| t.parse().ok())
                .collect(),
            broadcast_port: cfg.discovery.broadcast_port,
            retry_interval: Duration::from_secs(cfg.discovery.retry_interval_secs),
            window: Duration::from_secs(cfg.discovery.window_secs),
        }
    }
}

/// Run one discovery window and return every gateway that answered.
///
/// An empty map is a normal outcome; only failing to bind the reply
/// socket is an error.
pub async fn discover(options: &DiscoveryOptions) -> Result<DiscoveredGateways> {
    let socket = bind_reusable_udp(options.bind, true)?;
    let targets = if options.targets.is_empty() {
        broadcast_targets(options.broadcast_port)
    } else {
        options.targets.clone()
    };

    log::info!(
        "Gateway discovery started (bind={}, targets={:?}, window={}s)",
        options.bind,
        targets,
        options.window.as_secs_f32()
    );

    let found = run_window(&socket, &targets, options.retry_interval, options.window).await;

    log::info!("Gateway discovery finished: {} gateway(s)", found.len());
    Ok(found)
}

/// Discovery for the setup flow: only gateways not already configured.
///
/// Fails with [`BridgeError::NoGatewayFound`] when nothing answered and
/// [`BridgeError::NoNewGateway`] when everything that answered is known.
pub async fn discover_new(
    options: &DiscoveryOptions,
    known_macs: &HashSet<String>,
) -> Result<Vec<GatewayDescriptor>> {
    let found = discover(options).await?;
    filter_new(found, known_macs)
}

fn filter_new(
    found: DiscoveredGateways,
    known_macs: &HashSet<String>,
) -> Result<Vec<GatewayDescriptor>> {
    if found.is_empty() {
        return Err(BridgeError::NoGatewayFound);
    }
    let known: HashSet<String> = known_macs
        .iter()
        .map(|m| crate::protocol::normalize_mac(m))
        .collect();
    let mut fresh: Vec<GatewayDescriptor> = found
        .into_values()
        .filter(|gw| !known.contains(&gw.mac))
        .collect();
    if fresh.is_empty() {
        return Err(BridgeError::NoNewGateway);
    }
    fresh.sort_by(|a, b| a.mac.cmp(&b.mac));
    Ok(fresh)
}

async fn run_window(
    socket: &UdpSocket,
    targets: &[SocketAddr],
    retry_interval: Duration,
    window: Duration,
) -> DiscoveredGateways {
    let mut found = DiscoveredGateways::new();
    let deadline = sleep_until(Instant::now() + window);
    tokio::pin!(deadline);

    let mut probe_tick = interval(retry_interval);
    probe_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut buf = [0u8; MAX_DATAGRAM_SIZE];

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = probe_tick.tick() => {
                for target in targets {
                    if let Err(e) = socket.send_to(DISCOVERY_MESSAGE.as_bytes(), target).await {
                        log::warn!("Discovery probe to {} failed: {}", target, e);
                    }
                }
            }
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, src)) => match decode_discovery_response(&buf[..len]) {
                        Ok(reply) => {
                            if upsert_gateway(&mut found, reply, src) {
                                log::debug!("Discovery reply from {}", src);
                            }
                        }
                        Err(e) => log::debug!("Ignoring discovery datagram from {}: {}", src, e),
                    },
                    Err(e) => log::warn!("Discovery recv error: {}", e),
                }
            }
        }
    }

    found
}

/// Insert or overwrite a gateway. Returns `true` when the stored entry
/// changed (new gateway, or a different address/model for a known one).
fn upsert_gateway(
    found: &mut DiscoveredGateways,
    reply: DiscoveryResponse,
    src: SocketAddr,
) -> bool {
    let descriptor = GatewayDescriptor {
        ip: reply.ip.unwrap_or_else(|| src.ip().to_string()),
        model: reply.model,
        hardware_version: reply.hardware_version,
        mac: reply.mac,
    };
    let changed = found.get(&descriptor.mac) != Some(&descriptor);
    found.insert(descriptor.mac.clone(), descriptor);
    changed
}

/// Limited broadcast plus a directed /24 broadcast for every non-loopback
/// IPv4 interface. Falls back to the limited broadcast alone when the
/// interfaces cannot be listed.
pub fn broadcast_targets(port: u16) -> Vec<SocketAddr> {
    let mut targets = vec![SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, port))];

    match local_ip_address::list_afinet_netifas() {
        Ok(interfaces) => {
            for (name, ip) in interfaces {
                let IpAddr::V4(v4) = ip else { continue };
                if v4.is_loopback() || v4.is_link_local() {
                    continue;
                }
                let target = SocketAddr::V4(SocketAddrV4::new(directed_broadcast(v4), port));
                if !targets.contains(&target) {
                    log::debug!("Discovery target {} (interface {})", target, name);
                    targets.push(target);
                }
            }
        }
        Err(e) => log::debug!("Failed to list network interfaces: {}", e),
    }

    targets
}

fn directed_broadcast(ip: Ipv4Addr) -> Ipv4Addr {
    let [a, b, c, _] = ip.octets();
    Ipv4Addr::new(a, b, c, 255)
}
