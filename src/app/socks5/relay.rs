use std::net::SocketAddr;

use async_trait::async_trait;
use derivative::Derivative;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::app::{
    error::ServiceError,
    net::{bind_udp_socket, UDP_MAX_SIZE},
    supervisor::Service,
    types::ClientAddr,
    AppContext,
};

const SERVICE_NAME: &str = "UDP relay";

pub(crate) const UDP_ACK: &[u8] = b"UDP Proxy Received";

/// Placeholder for the UDP side of SOCKSv5. Every datagram is answered with
/// [`UDP_ACK`] and nothing is forwarded; SOCKS UDP request headers are not
/// parsed.
#[derive(Derivative)]
#[derivative(Debug)]
pub(crate) struct UdpEchoRelayService {
    #[derivative(Debug = "ignore")]
    context: AppContext,
    bind_addr: SocketAddr,
}

impl UdpEchoRelayService {
    pub(crate) fn new(context: &AppContext) -> Self {
        Self {
            context: context.clone(),
            bind_addr: context.bind_addr(context.socks_port),
        }
    }

    pub(crate) async fn serve(self, socket: UdpSocket, shutdown: CancellationToken) {
        info!("Starting UDP relay at {}", self.bind_addr);
        let mut buf = [0u8; UDP_MAX_SIZE];
        loop {
            let (n, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(err) => {
                        warn!("UDP read error: {}", err);
                        continue;
                    }
                },
            };
            let client = ClientAddr::from(peer);
            if self.context.verbose {
                info!("Received UDP packet from {}, {} bytes", client, n);
            } else {
                debug!("Received UDP packet from {}, {} bytes", client, n);
            }
            if let Err(err) = socket.send_to(UDP_ACK, peer).await {
                warn!("UDP write error to {}: {}", client, err);
            }
        }
        info!("UDP relay stopped");
    }
}

#[async_trait]
impl Service for UdpEchoRelayService {
    fn name(&self) -> &'static str {
        SERVICE_NAME
    }

    async fn launch(self: Box<Self>, shutdown: CancellationToken) -> Result<(), ServiceError> {
        let socket = bind_udp_socket(&self.bind_addr).map_err(|source| ServiceError::Bind {
            service: SERVICE_NAME,
            addr: self.bind_addr,
            source,
        })?;
        self.serve(socket, shutdown).await;
        Ok(())
    }
}
