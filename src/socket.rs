use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::error::BridgeError;

/// Bind a UDP socket with `SO_REUSEADDR` (and `SO_REUSEPORT` where
/// available) so that a restarted bridge, or discovery running next to the
/// router, can share the gateway response port.
///
/// Must be called from within a tokio runtime.
pub fn bind_reusable_udp(addr: SocketAddr, broadcast: bool) -> Result<UdpSocket, BridgeError> {
    let bind_err = |source| BridgeError::Bind { addr, source };

    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).map_err(bind_err)?;

    if let Err(e) = socket.set_reuse_address(true) {
        log::warn!("SO_REUSEADDR failed on {} (non-fatal): {}", addr, e);
    }

    #[cfg(not(target_os = "windows"))]
    {
        if let Err(e) = socket.set_reuse_port(true) {
            log::warn!("SO_REUSEPORT failed on {} (non-fatal): {}", addr, e);
        }
    }

    if broadcast {
        socket.set_broadcast(true).map_err(bind_err)?;
    }

    // Must be non-blocking before handing it to tokio.
    socket.set_nonblocking(true).map_err(bind_err)?;
    socket.bind(&socket2::SockAddr::from(addr)).map_err(bind_err)?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).map_err(bind_err)
}

/// `ip:port`, with an unset or unparsable ip meaning all interfaces.
pub fn listen_addr(ip: Option<&str>, port: u16) -> SocketAddr {
    let ip = ip
        .and_then(|s| s.parse::<IpAddr>().ok())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    SocketAddr::new(ip, port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn two_sockets_share_a_port() {
        let first = bind_reusable_udp("127.0.0.1:0".parse().unwrap(), false).unwrap();
        let addr = first.local_addr().unwrap();
        let second = bind_reusable_udp(addr, false);
        #[cfg(not(target_os = "windows"))]
        assert!(second.is_ok());
        #[cfg(target_os = "windows")]
        let _ = second;
    }

    #[test]
    fn listen_addr_defaults_to_unspecified() {
        assert_eq!(listen_addr(None, 50002), "0.0.0.0:50002".parse().unwrap());
        assert_eq!(
            listen_addr(Some("10.1.2.3"), 1),
            "10.1.2.3:1".parse().unwrap()
        );
        assert_eq!(listen_addr(Some("bogus"), 7), "0.0.0.0:7".parse().unwrap());
    }
}
