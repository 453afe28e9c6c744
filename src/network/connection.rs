use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use futures::{SinkExt, StreamExt};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::udp::UdpFramed;
use tracing::{debug, info, warn};

use crate::core::{Error, Result, Z21Config};
use crate::gateway::GatewayEvent;
use crate::protocol::{LanCodec, LanCommand};

/// UDP link to the command station
pub struct CentralLink {
    /// Socket connected to the central; only its datagrams are received
    socket: UdpSocket,
    /// Resolved central address
    central: SocketAddr,
    codec: LanCodec,
}

impl CentralLink {
    /// Resolves the central and binds the local socket
    pub async fn connect(config: &Z21Config) -> Result<Self> {
        let central = lookup_host((config.host.as_str(), config.udp_port))
            .await
            .map_err(|e| Error::network(format!("Failed to resolve {}: {}", config.host, e)))?
            .next()
            .ok_or_else(|| Error::network(format!("No address found for {}", config.host)))?;

        let socket = bind_socket(central, config.listen_port.unwrap_or(0))?;
        socket
            .connect(central)
            .await
            .map_err(|e| Error::network(format!("Failed to connect to {}: {}", central, e)))?;

        let link = CentralLink {
            socket,
            central,
            codec: LanCodec::new().with_frame_dumps(config.debug),
        };
        info!(%central, local = %link.local_addr()?, "Central link ready");
        Ok(link)
    }

    /// Returns the local socket address
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket
            .local_addr()
            .map_err(|e| Error::network(format!("Failed to get local address: {}", e)))
    }

    pub fn central_addr(&self) -> SocketAddr {
        self.central
    }

    /// Starts the link task
    ///
    /// Commands from `outbound` are encoded and sent as they arrive; every
    /// decoded datagram becomes a [`GatewayEvent::Central`]. Malformed
    /// datagrams are dropped. The task ends when either channel closes.
    pub fn spawn(
        self,
        events: mpsc::UnboundedSender<GatewayEvent>,
        outbound: mpsc::UnboundedReceiver<LanCommand>,
    ) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run(events, outbound))
    }

    async fn run(
        self,
        events: mpsc::UnboundedSender<GatewayEvent>,
        mut outbound: mpsc::UnboundedReceiver<LanCommand>,
    ) -> Result<()> {
        let central = self.central;
        let mut framed = UdpFramed::new(self.socket, self.codec);

        loop {
            tokio::select! {
                command = outbound.recv() => {
                    let Some(command) = command else {
                        debug!("Outbound queue closed, stopping central link");
                        return Ok(());
                    };
                    // A lost datagram is the central's normal failure mode
                    if let Err(e) = framed.send((command, central)).await {
                        warn!(%central, error = %e, "Failed to send datagram");
                    }
                }

                received = framed.next() => {
                    match received {
                        Some(Ok((event, _))) => {
                            if events.send(GatewayEvent::Central(event)).is_err() {
                                debug!("Gateway stopped, stopping central link");
                                return Ok(());
                            }
                        }
                        // Already logged by the codec
                        Some(Err(Error::Frame(_))) => {}
                        Some(Err(e)) => warn!(%central, error = %e, "Failed to receive datagram"),
                        None => return Ok(()),
                    }
                }
            }
        }
    }
}

/// Binds a reusable UDP socket on the wildcard address of the central's family
fn bind_socket(central: SocketAddr, port: u16) -> Result<UdpSocket> {
    let local: SocketAddr = if central.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, port).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, port).into()
    };

    let socket = Socket::new(Domain::for_address(local), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| Error::network(format!("Failed to create socket: {}", e)))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| Error::network(format!("Failed to set SO_REUSEADDR: {}", e)))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| Error::network(format!("Failed to set non-blocking: {}", e)))?;
    socket
        .bind(&local.into())
        .map_err(|e| Error::network(format!("Failed to bind socket to {}: {}", local, e)))?;

    UdpSocket::from_std(socket.into())
        .map_err(|e| Error::network(format!("Failed to register socket: {}", e)))
}
