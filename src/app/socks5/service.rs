use std::{
    io,
    net::{Ipv4Addr, SocketAddr},
};

use async_trait::async_trait;
use derivative::Derivative;
use tokio::{
    io::{copy_bidirectional, AsyncReadExt},
    net::{TcpListener, TcpStream},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::app::{
    error::ServiceError,
    net::{bind_tcp_listener, is_transient_accept_error},
    supervisor::Service,
    types::{ClientAddr, Traffic},
    AppContext,
};

use super::handshake::{self, Command, Reply, Request, TargetAddr};

const SERVICE_NAME: &str = "SOCKSv5 proxy";

#[derive(Derivative)]
#[derivative(Debug)]
pub(crate) struct SocksForwardService {
    #[derivative(Debug = "ignore")]
    context: AppContext,
    bind_addr: SocketAddr,
}

impl SocksForwardService {
    pub(crate) fn new(context: &AppContext) -> Self {
        Self {
            context: context.clone(),
            bind_addr: context.bind_addr(context.socks_port),
        }
    }

    pub(crate) async fn serve(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), ServiceError> {
        info!("Starting SOCKSv5 proxy at {}", self.bind_addr);
        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(err) if is_transient_accept_error(&err) => {
                        warn!("SOCKSv5 accept error: {}", err);
                        continue;
                    }
                    Err(source) => return Err(ServiceError::Serve { service: SERVICE_NAME, source }),
                },
            };
            let context = self.context.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let client = ClientAddr::from(peer);
                tokio::select! {
                    _ = shutdown.cancelled() => (),
                    result = handle_client(&context, stream, client) => {
                        if let Err(err) = result {
                            warn!("SOCKSv5 session with {} failed: {}", client, err);
                        }
                    }
                }
            });
        }
        info!("SOCKSv5 proxy stopped");
        Ok(())
    }
}

#[async_trait]
impl Service for SocksForwardService {
    fn name(&self) -> &'static str {
        SERVICE_NAME
    }

    async fn launch(self: Box<Self>, shutdown: CancellationToken) -> Result<(), ServiceError> {
        let listener = bind_tcp_listener(&self.bind_addr).map_err(|source| ServiceError::Bind {
            service: SERVICE_NAME,
            addr: self.bind_addr,
            source,
        })?;
        self.serve(listener, shutdown).await
    }
}

#[instrument(skip_all, fields(client = %client))]
async fn handle_client(
    context: &AppContext,
    mut stream: TcpStream,
    client: ClientAddr,
) -> io::Result<()> {
    if !handshake::negotiate_method(&mut stream).await? {
        debug!("No acceptable auth method");
        return Ok(());
    }
    let unspecified: SocketAddr = (Ipv4Addr::UNSPECIFIED, 0).into();
    let (command, target) = match handshake::read_request(&mut stream).await? {
        Request::Valid(command, target) => (command, target),
        Request::Rejected(reply) => {
            debug!("Reject request: {:?}", reply);
            return handshake::write_reply(&mut stream, reply, unspecified).await;
        }
    };
    match command {
        Command::Connect => connect(context, stream, client, target).await,
        Command::UdpAssociate => udp_associate(context, stream, client).await,
        Command::Bind => {
            debug!("BIND is not supported");
            handshake::write_reply(&mut stream, Reply::CommandNotSupported, unspecified).await
        }
    }
}

async fn connect(
    context: &AppContext,
    mut stream: TcpStream,
    client: ClientAddr,
    target: TargetAddr,
) -> io::Result<()> {
    let outbound = match &target {
        TargetAddr::Ip(addr) => TcpStream::connect(*addr).await,
        TargetAddr::Domain(host, port) => TcpStream::connect((host.as_str(), *port)).await,
    };
    let mut outbound = match outbound {
        Ok(outbound) => outbound,
        Err(err) => {
            warn!("Failed to connect {}: {}", target, err);
            let unspecified = (Ipv4Addr::UNSPECIFIED, 0).into();
            return handshake::write_reply(&mut stream, (&err).into(), unspecified).await;
        }
    };
    let bound = outbound.local_addr()?;
    handshake::write_reply(&mut stream, Reply::Succeeded, bound).await?;
    if context.verbose {
        info!("{} => {}", client, target);
    } else {
        debug!("{} => {}", client, target);
    }
    let traffic: Traffic = copy_bidirectional(&mut stream, &mut outbound).await?.into();
    debug!("Closed {} => {}, {}", client, target, traffic);
    Ok(())
}

/// Point the client at the UDP relay and keep the control connection open
/// until the client drops it. The relay only acknowledges datagrams.
async fn udp_associate(
    context: &AppContext,
    mut stream: TcpStream,
    client: ClientAddr,
) -> io::Result<()> {
    let relay = context.advertised_addr(context.socks_port);
    handshake::write_reply(&mut stream, Reply::Succeeded, relay).await?;
    if context.verbose {
        info!("{} associated with UDP relay {}", client, relay);
    } else {
        debug!("{} associated with UDP relay {}", client, relay);
    }
    let mut buf = [0u8; 64];
    while stream.read(&mut buf).await? > 0 {}
    debug!("{} closed UDP association", client);
    Ok(())
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::app::ProxyConfiguration;

    async fn start_proxy(config: ProxyConfiguration) -> (SocketAddr, CancellationToken) {
        let context: AppContext = config.into();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let service = SocksForwardService::new(&context);
        tokio::spawn(service.serve(listener, shutdown.clone()));
        (addr, shutdown)
    }

    async fn start_echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut rd, mut wr) = stream.split();
                    let _ = tokio::io::copy(&mut rd, &mut wr).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn connect_and_relay() {
        let echo = start_echo_server().await;
        let (proxy, shutdown) = start_proxy(Default::default()).await;

        let mut client = TcpStream::connect(proxy).await.unwrap();
        client.write_all(&hex!("05 01 00")).await.unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, hex!("05 00"));

        let mut request = hex!("05 01 00 01 7f 00 00 01").to_vec();
        request.extend_from_slice(&echo.port().to_be_bytes());
        client.write_all(&request).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[..4], hex!("05 00 00 01"));

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        shutdown.cancel();
    }

    #[tokio::test]
    async fn connect_refused() {
        let closed = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let (proxy, shutdown) = start_proxy(Default::default()).await;

        let mut client = TcpStream::connect(proxy).await.unwrap();
        client.write_all(&hex!("05 01 00")).await.unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).await.unwrap();

        let mut request = hex!("05 01 00 01 7f 00 00 01").to_vec();
        request.extend_from_slice(&closed.port().to_be_bytes());
        client.write_all(&request).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], Reply::ConnectionRefused as u8);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn udp_associate_points_at_relay() {
        let config = ProxyConfiguration {
            advertised_address: "10.0.0.5".parse().unwrap(),
            socks_port: 1080,
            ..Default::default()
        };
        let (proxy, shutdown) = start_proxy(config).await;

        let mut client = TcpStream::connect(proxy).await.unwrap();
        client.write_all(&hex!("05 01 00")).await.unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).await.unwrap();
        client
            .write_all(&hex!("05 03 00 01 00 00 00 00 00 00"))
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, hex!("05 00 00 01 0a 00 00 05 04 38"));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn bind_command_unsupported() {
        let (proxy, shutdown) = start_proxy(Default::default()).await;

        let mut client = TcpStream::connect(proxy).await.unwrap();
        client.write_all(&hex!("05 01 00")).await.unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).await.unwrap();
        client
            .write_all(&hex!("05 02 00 01 7f 00 00 01 00 50"))
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], Reply::CommandNotSupported as u8);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn stop_on_shutdown() {
        let context: AppContext = ProxyConfiguration::default().into();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(SocksForwardService::new(&context).serve(listener, shutdown.clone()));
        shutdown.cancel();
        assert!(task.await.unwrap().is_ok());
    }
}
