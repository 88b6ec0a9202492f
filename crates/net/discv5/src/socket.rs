//! UDP transport: dedicated send and receive tasks bridged to the service by channels.

use crate::packet::MAX_PACKET_SIZE;
use std::{
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
};
use tokio::{net::UdpSocket, sync::mpsc};
use tracing::{debug, trace, warn};

/// Which UDP socket(s) the service binds at start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenConfig {
    /// A single IPv4 socket.
    Ipv4 {
        /// Address to bind.
        ip: Ipv4Addr,
        /// Port to bind.
        port: u16,
    },
    /// A single IPv6 socket.
    Ipv6 {
        /// Address to bind.
        ip: Ipv6Addr,
        /// Port to bind.
        port: u16,
    },
    /// One socket per address family.
    DualStack {
        /// IPv4 address to bind.
        ipv4: Ipv4Addr,
        /// IPv4 port.
        ipv4_port: u16,
        /// IPv6 address to bind.
        ipv6: Ipv6Addr,
        /// IPv6 port.
        ipv6_port: u16,
    },
}

impl Default for ListenConfig {
    fn default() -> Self {
        ListenConfig::Ipv4 { ip: Ipv4Addr::UNSPECIFIED, port: 9000 }
    }
}

impl From<SocketAddr> for ListenConfig {
    fn from(socket_addr: SocketAddr) -> Self {
        match socket_addr {
            SocketAddr::V4(addr) => ListenConfig::Ipv4 { ip: *addr.ip(), port: addr.port() },
            SocketAddr::V6(addr) => ListenConfig::Ipv6 { ip: *addr.ip(), port: addr.port() },
        }
    }
}

/// A raw datagram handed up to the service.
#[derive(Debug)]
pub(crate) struct InboundDatagram {
    /// The observed sender.
    pub(crate) src: SocketAddr,
    /// The datagram payload, at most [`MAX_PACKET_SIZE`] bytes.
    pub(crate) data: Vec<u8>,
}

/// A datagram the service wants on the wire.
#[derive(Debug)]
pub(crate) struct OutboundDatagram {
    /// The destination.
    pub(crate) dst: SocketAddr,
    /// The encoded packet.
    pub(crate) data: Vec<u8>,
}

/// Handle pair to the socket tasks.
#[derive(Debug)]
pub(crate) struct Socket {
    /// Inbound datagrams from all bound sockets.
    pub(crate) recv: mpsc::Receiver<InboundDatagram>,
    /// Sink for outbound datagrams.
    pub(crate) send: mpsc::Sender<OutboundDatagram>,
    /// Locally bound addresses, used to refuse requests to self.
    pub(crate) local_sockets: Vec<SocketAddr>,
}

// === impl Socket ===

impl Socket {
    /// Binds the configured socket(s) and spawns their IO tasks.
    ///
    /// The tasks exit when the service drops its ends of the channels.
    pub(crate) async fn bind(
        config: &ListenConfig,
        ingress_buffer: usize,
        egress_buffer: usize,
    ) -> io::Result<Self> {
        let (ipv4, ipv6) = match config {
            ListenConfig::Ipv4 { ip, port } => (Some((*ip, *port)), None),
            ListenConfig::Ipv6 { ip, port } => (None, Some((*ip, *port))),
            ListenConfig::DualStack { ipv4, ipv4_port, ipv6, ipv6_port } => {
                (Some((*ipv4, *ipv4_port)), Some((*ipv6, *ipv6_port)))
            }
        };

        let (inbound_tx, recv) = mpsc::channel(ingress_buffer);
        let (send, outbound_rx) = mpsc::channel::<OutboundDatagram>(egress_buffer);

        let mut local_sockets = Vec::new();
        let mut sockets = Vec::new();
        if let Some((ip, port)) = ipv4 {
            let socket = Arc::new(UdpSocket::bind((IpAddr::V4(ip), port)).await?);
            local_sockets.push(socket.local_addr()?);
            sockets.push(socket);
        }
        if let Some((ip, port)) = ipv6 {
            let socket = Arc::new(UdpSocket::bind((IpAddr::V6(ip), port)).await?);
            local_sockets.push(socket.local_addr()?);
            sockets.push(socket);
        }

        for socket in &sockets {
            tokio::spawn(recv_task(socket.clone(), inbound_tx.clone()));
        }
        tokio::spawn(send_task(sockets, outbound_rx));

        Ok(Self { recv, send, local_sockets })
    }
}

/// Reads datagrams off one socket until the service goes away. Receive errors end the current
/// read and the loop retries.
async fn recv_task(socket: Arc<UdpSocket>, inbound: mpsc::Sender<InboundDatagram>) {
    let mut buf = [0u8; MAX_PACKET_SIZE];
    loop {
        let received = tokio::select! {
            received = socket.recv_from(&mut buf) => received,
            // Unblock the read when the service goes away, releasing the socket.
            _ = inbound.closed() => return,
        };
        match received {
            Ok((length, src)) => {
                trace!(target: "discv5::socket", %src, length, "received datagram");
                let datagram = InboundDatagram { src, data: buf[..length].to_vec() };
                if inbound.send(datagram).await.is_err() {
                    return
                }
            }
            Err(err) => {
                debug!(target: "discv5::socket", %err, "udp receive error");
            }
        }
    }
}

/// Writes queued datagrams, picking the socket matching the destination's address family.
async fn send_task(sockets: Vec<Arc<UdpSocket>>, mut outbound: mpsc::Receiver<OutboundDatagram>) {
    let pick = |dst: &SocketAddr| {
        sockets.iter().find(|socket| {
            socket.local_addr().map(|addr| addr.is_ipv4() == dst.is_ipv4()).unwrap_or(false)
        })
    };
    while let Some(OutboundDatagram { dst, data }) = outbound.recv().await {
        let Some(socket) = pick(&dst) else {
            warn!(target: "discv5::socket", %dst, "no socket for destination address family");
            continue
        };
        if let Err(err) = socket.send_to(&data, dst).await {
            warn!(target: "discv5::socket", %dst, %err, "failed to send datagram");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_loopback_round_trip() {
        let config_a = ListenConfig::Ipv4 { ip: Ipv4Addr::LOCALHOST, port: 0 };
        let mut a = Socket::bind(&config_a, 16, 16).await.unwrap();
        let mut b = Socket::bind(&config_a, 16, 16).await.unwrap();

        let dst = a.local_sockets[0];
        b.send.send(OutboundDatagram { dst, data: vec![1, 2, 3] }).await.unwrap();

        let datagram = a.recv.recv().await.unwrap();
        assert_eq!(datagram.data, vec![1, 2, 3]);
        assert_eq!(datagram.src, b.local_sockets[0]);
    }

    #[tokio::test]
    async fn test_dual_stack_binds_both_families() {
        let config = ListenConfig::DualStack {
            ipv4: Ipv4Addr::LOCALHOST,
            ipv4_port: 0,
            ipv6: Ipv6Addr::LOCALHOST,
            ipv6_port: 0,
        };
        let socket = Socket::bind(&config, 16, 16).await.unwrap();
        assert_eq!(socket.local_sockets.len(), 2);
        assert!(socket.local_sockets[0].is_ipv4());
        assert!(socket.local_sockets[1].is_ipv6());
    }
}
