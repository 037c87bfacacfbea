use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::debug;

use crate::{
    settings::TransportSettings,
    transport::{Datagram, Transport, TransportError},
};

/// The largest payload of a UDP datagram over IPv4.
const MAX_DATAGRAM_SIZE: usize = 65_507;

#[derive(Debug, Clone)]
/// A transport over UDP.
pub struct UdpTransport {
    bind_ip: IpAddr,
    advertised_ip: IpAddr,
    max_message_size: usize,
}

impl UdpTransport {
    /// Creates a transport binding sockets to `bind_ip` and advertising them as
    /// reachable through `advertised_ip`.
    pub fn new(bind_ip: IpAddr, advertised_ip: IpAddr, max_message_size: usize) -> Self {
        Self {
            bind_ip,
            advertised_ip,
            max_message_size: max_message_size.min(MAX_DATAGRAM_SIZE),
        }
    }
}

impl From<&TransportSettings> for UdpTransport {
    fn from(settings: &TransportSettings) -> Self {
        Self::new(
            settings.bind_ip,
            settings.advertised_ip,
            settings.max_message_size,
        )
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn bind(&self) -> Result<Arc<dyn Datagram>, TransportError> {
        let socket = UdpSocket::bind(SocketAddr::new(self.bind_ip, 0)).await?;
        let candidate = SocketAddr::new(self.advertised_ip, socket.local_addr()?.port());
        debug!("bound UDP socket with candidate {}", candidate);
        Ok(Arc::new(UdpDatagram { socket, candidate }))
    }

    fn max_message_size(&self) -> usize {
        self.max_message_size
    }
}

struct UdpDatagram {
    socket: UdpSocket,
    candidate: SocketAddr,
}

#[async_trait]
impl Datagram for UdpDatagram {
    fn local_candidate(&self) -> String {
        self.candidate.to_string()
    }

    async fn connect(&self, candidate: &str) -> Result<(), TransportError> {
        let remote: SocketAddr = candidate
            .parse()
            .map_err(|_| TransportError::InvalidCandidate(candidate.to_string()))?;
        self.socket.connect(remote).await?;
        Ok(())
    }

    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        self.socket.send(data).await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        let mut buffer = vec![0; MAX_DATAGRAM_SIZE];
        let len = self.socket.recv(&mut buffer).await?;
        buffer.truncate(len);
        Ok(buffer)
    }

    fn buffered_amount(&self) -> usize {
        // the kernel buffers outgoing datagrams
        0
    }

    fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    #[tokio::test]
    async fn test_udp_exchange() {
        let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let transport = UdpTransport::new(localhost, localhost, 1024);
        let a = transport.bind().await.unwrap();
        let b = transport.bind().await.unwrap();
        a.connect(&b.local_candidate()).await.unwrap();
        b.connect(&a.local_candidate()).await.unwrap();

        a.send(b"ping").await.unwrap();
        assert_eq!(b.recv().await.unwrap(), b"ping".to_vec());
        b.send(b"pong").await.unwrap();
        assert_eq!(a.recv().await.unwrap(), b"pong".to_vec());
    }

    #[tokio::test]
    async fn test_invalid_candidate() {
        let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let socket = UdpTransport::new(localhost, localhost, 1024)
            .bind()
            .await
            .unwrap();
        assert!(matches!(
            socket.connect("memory:1").await.unwrap_err(),
            TransportError::InvalidCandidate(_)
        ));
    }
}
