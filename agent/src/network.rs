use crate::error::AgentError;
use bincode::{deserialize, serialize};
use log::{debug, warn};
use shared::{Packet, MAX_PACKET_SIZE};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};

/// Request/response channel to the hub over UDP
pub struct HubLink {
    socket: UdpSocket,
    hub_addr: SocketAddr,
}

impl HubLink {
    /// Binds an ephemeral local port for talking to `hub_addr`
    pub async fn connect(hub_addr: &str) -> Result<Self, AgentError> {
        let hub_addr: SocketAddr = hub_addr
            .parse()
            .map_err(|_| AgentError::Address(hub_addr.to_string()))?;

        let bind_addr = if hub_addr.is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        debug!("Agent socket bound to {}", socket.local_addr()?);

        Ok(Self { socket, hub_addr })
    }

    pub fn hub_addr(&self) -> SocketAddr {
        self.hub_addr
    }

    pub fn local_addr(&self) -> Result<SocketAddr, AgentError> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn send(&self, packet: &Packet) -> Result<(), AgentError> {
        let data = serialize(packet)?;
        self.socket.send_to(&data, self.hub_addr).await?;
        Ok(())
    }

    /// Waits for the next packet from the hub. Datagrams from other peers
    /// and undecodable ones are skipped.
    pub async fn recv(&self, wait: Duration) -> Result<Packet, AgentError> {
        let deadline = Instant::now() + wait;
        let mut buffer = vec![0u8; MAX_PACKET_SIZE];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let (len, from) = timeout(remaining, self.socket.recv_from(&mut buffer))
                .await
                .map_err(|_| AgentError::Timeout(wait))??;

            if from != self.hub_addr {
                debug!("Ignoring datagram from {}", from);
                continue;
            }

            match deserialize::<Packet>(&buffer[..len]) {
                Ok(packet) => return Ok(packet),
                Err(e) => warn!("Failed to deserialize packet from hub: {}", e),
            }
        }
    }

    pub async fn request(&self, packet: &Packet, wait: Duration) -> Result<Packet, AgentError> {
        self.send(packet).await?;
        self.recv(wait).await
    }
}
