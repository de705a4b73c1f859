//! Inbound message router.
//!
//! Owns the process-wide UDP socket gateways send events to. Every datagram
//! is decoded and published on the matching [`EventBus`] channel; the
//! router keeps no device state of its own. Undecodable and unrecognized
//! datagrams are logged and dropped; nothing a gateway sends can end the
//! receive loop.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use tokio::{net::UdpSocket, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::bus::EventBus;
use crate::error::Result;
use crate::protocol::{decode_datagram, InboundMessage, MAX_DATAGRAM_SIZE};
use crate::socket::bind_reusable_udp;

#[derive(Debug, Default)]
pub struct RouterStats {
    pub routed: AtomicU64,
    pub dropped: AtomicU64,
    pub unrecognized: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Routed,
    Dropped,
    Unrecognized,
}

pub struct InboundRouter {
    local_addr: SocketAddr,
    stats: Arc<RouterStats>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl InboundRouter {
    /// Bind `bind` (with address reuse) and spawn the receive loop.
    ///
    /// A bind failure is returned as [`crate::BridgeError::Bind`] and is
    /// fatal to bridge start-up.
    pub fn start(bind: SocketAddr, bus: EventBus) -> Result<Self> {
        let socket = bind_reusable_udp(bind, false)?;
        let local_addr = socket.local_addr()?;
        let stats = Arc::new(RouterStats::default());
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run_receive_loop(
            socket,
            bus,
            stats.clone(),
            cancel.clone(),
        ));

        log::info!("UDP router listening on {}", local_addr);
        Ok(Self {
            local_addr,
            stats,
            cancel,
            handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> &RouterStats {
        &self.stats
    }

    /// Stop the receive loop and wait for it to exit. Idempotent.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
            log::info!("UDP router on {} stopped", self.local_addr);
        }
    }
}

impl Drop for InboundRouter {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_receive_loop(
    socket: UdpSocket,
    bus: EventBus,
    stats: Arc<RouterStats>,
    cancel: CancellationToken,
) {
    let mut buf = [0u8; MAX_DATAGRAM_SIZE];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, src)) => {
                        route_datagram(&bus, &buf[..len], src, &stats);
                    }
                    Err(e) => {
                        log::warn!("UDP router recv error: {}", e);
                    }
                }
            }
        }
    }
}

/// Decode and publish one datagram.
pub fn route_datagram(
    bus: &EventBus,
    data: &[u8],
    src: SocketAddr,
    stats: &RouterStats,
) -> RouteOutcome {
    let message = match decode_datagram(data) {
        Ok(message) => message,
        Err(e) => {
            log::debug!(
                "Dropping datagram from {} ({} bytes): {}; raw={:?}",
                src,
                data.len(),
                e,
                String::from_utf8_lossy(data)
            );
            stats.dropped.fetch_add(1, Ordering::Relaxed);
            return RouteOutcome::Dropped;
        }
    };

    if let InboundMessage::Unrecognized(msg_type) = &message {
        log::debug!("Ignoring unsupported message type '{}' from {}", msg_type, src);
        stats.unrecognized.fetch_add(1, Ordering::Relaxed);
        return RouteOutcome::Unrecognized;
    }

    log::debug!("Routing {:?} from {}", message, src);
    bus.dispatch(&message);
    stats.routed.fetch_add(1, Ordering::Relaxed);
    RouteOutcome::Routed
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio::time::{timeout, Duration};

    #[test]
    fn classification() {
        let bus = EventBus::new();
        let stats = RouterStats::default();
        let src: SocketAddr = "10.0.0.1:50000".parse().unwrap();

        assert_eq!(route_datagram(&bus, b"{not json", src, &stats), RouteOutcome::Dropped);
        assert_eq!(
            route_datagram(&bus, br#"{"type": "mystery"}"#, src, &stats),
            RouteOutcome::Unrecognized
        );
        assert_eq!(
            route_datagram(&bus, br#"{"type": "gateway_alive", "mac": "AA"}"#, src, &stats),
            RouteOutcome::Routed
        );
        assert_eq!(stats.dropped.load(Ordering::Relaxed), 1);
        assert_eq!(stats.unrecognized.load(Ordering::Relaxed), 1);
        assert_eq!(stats.routed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn malformed_datagram_does_not_stop_the_loop() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = bus.light_register.subscribe(move |reg| {
            let _ = tx.send(reg.unique_id.clone());
        });

        let mut router = InboundRouter::start("127.0.0.1:0".parse().unwrap(), bus).unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"{not json", router.local_addr()).await.unwrap();
        sender
            .send_to(
                br#"{"type": "light_register", "unique_id": "dev_1"}"#,
                router.local_addr(),
            )
            .await
            .unwrap();

        let got = timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert_eq!(got.as_deref(), Some("dev_1"));
        assert_eq!(router.stats().dropped.load(Ordering::Relaxed), 1);

        router.stop().await;
        router.stop().await;
    }

    #[tokio::test]
    async fn stop_releases_the_port() {
        let bus = EventBus::new();
        let mut router = InboundRouter::start("127.0.0.1:0".parse().unwrap(), bus.clone()).unwrap();
        let addr = router.local_addr();
        router.stop().await;

        let mut again = InboundRouter::start(addr, bus).unwrap();
        assert_eq!(again.local_addr(), addr);
        again.stop().await;
    }
}
