//! Outbound commands.
//!
//! UDP commands are fire-and-forget: one JSON datagram per command, sent
//! from an optional fixed source address. Failures are logged, never
//! raised to the entity that issued the command. WebSocket sends go
//! through the gateway's [`GatewayConnection`] and do report
//! [`BridgeError::NotConnected`].

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use tokio::net::UdpSocket;

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::gateway::GatewayConnection;
use crate::protocol::{encode_command, OutboundCommand};

#[derive(Debug, Clone)]
pub struct CommandDispatcher {
    command_port: u16,
    source_ip: Option<IpAddr>,
}

impl CommandDispatcher {
    pub fn new(command_port: u16, source_ip: Option<IpAddr>) -> Self {
        Self {
            command_port,
            source_ip,
        }
    }

    pub fn from_config(cfg: &BridgeConfig) -> Self {
        Self::new(
            cfg.command_port,
            cfg.local_bind_ip.as_deref().and_then(|ip| ip.parse().ok()),
        )
    }

    pub fn command_port(&self) -> u16 {
        self.command_port
    }

    /// Send to a gateway's command port. See [`Self::send_udp`].
    pub async fn send_to_gateway(&self, host: &str, command: &OutboundCommand) -> bool {
        self.send_udp(host, self.command_port, command).await
    }

    /// Fire-and-forget send. Returns whether the datagram left the host.
    pub async fn send_udp(&self, host: &str, port: u16, command: &OutboundCommand) -> bool {
        match self.try_send_udp(host, port, command).await {
            Ok(len) => {
                log::info!("Sent {} bytes to {}:{}: {:?}", len, host, port, command);
                true
            }
            Err(e) => {
                log::warn!("Command to {}:{} not sent: {}", host, port, e);
                false
            }
        }
    }

    pub async fn try_send_udp(
        &self,
        host: &str,
        port: u16,
        command: &OutboundCommand,
    ) -> Result<usize> {
        let payload = encode_command(command)?;
        let bind = SocketAddr::new(
            self.source_ip.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            0,
        );
        let socket = UdpSocket::bind(bind)
            .await
            .map_err(|source| BridgeError::Bind { addr: bind, source })?;
        let sent = socket.send_to(&payload, (host, port)).await?;
        Ok(sent)
    }

    /// Send over a gateway's websocket; fails when it is not connected.
    pub async fn send_ws(
        &self,
        connection: &GatewayConnection,
        command: &OutboundCommand,
    ) -> Result<()> {
        connection.send(command).await?;
        log::info!("Sent over websocket to {}: {:?}", connection.mac(), command);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ConnectionOptions;
    use serde_json::Value;

    #[tokio::test]
    async fn udp_command_arrives_as_one_json_datagram() {
        let gateway = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = gateway.local_addr().unwrap().port();
        let dispatcher = CommandDispatcher::new(port, Some("127.0.0.1".parse().unwrap()));

        let command = OutboundCommand::ForwardCommand {
            id: "zb1".into(),
            endpoint: 2,
            cmd: "on".into(),
        };
        assert!(dispatcher.send_to_gateway("127.0.0.1", &command).await);

        let mut buf = [0u8; 512];
        let (len, from) = gateway.recv_from(&mut buf).await.unwrap();
        assert_eq!(from.ip(), "127.0.0.1".parse::<IpAddr>().unwrap());
        let json: Value = serde_json::from_slice(&buf[..len]).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "forward_command", "id": "zb1", "endpoint": 2, "cmd": "on"})
        );
    }

    #[tokio::test]
    async fn bind_failure_is_reported_not_raised() {
        // TEST-NET-1 is never assigned to a local interface.
        let dispatcher = CommandDispatcher::new(50000, Some("192.0.2.55".parse().unwrap()));
        let command = OutboundCommand::DeviceCmd {
            dest: "c1".into(),
            com: "OPEN".into(),
        };
        assert!(matches!(
            dispatcher.try_send_udp("127.0.0.1", 50000, &command).await,
            Err(BridgeError::Bind { .. })
        ));
        assert!(!dispatcher.send_udp("127.0.0.1", 50000, &command).await);
    }

    #[tokio::test]
    async fn websocket_send_surfaces_not_connected() {
        let dispatcher = CommandDispatcher::new(50000, None);
        let connection =
            GatewayConnection::new("aa:01", "127.0.0.1", 1, "/ws", ConnectionOptions::default());
        let err = dispatcher
            .send_ws(
                &connection,
                &OutboundCommand::SetLight {
                    endpoint: 1,
                    state: "on".into(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::NotConnected { .. }));
    }
}
