use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use derivative::Derivative;
use http_body_util::{combinators::BoxBody, BodyExt, Empty};
use hyper::{
    body::Incoming,
    client::conn::http1::Builder as ClientBuilder,
    header::{HeaderName, HOST, PROXY_AUTHORIZATION},
    server::conn::http1,
    service::service_fn,
    upgrade::Upgraded,
    Method, Request, Response, StatusCode, Uri,
};
use hyper_util::rt::TokioIo;
use tokio::{
    io::copy_bidirectional,
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

const SERVICE_NAME: &str = "HTTP proxy";

type ProxyBody = BoxBody<Bytes, hyper::Error>;

#[derive(Derivative)]
#[derivative(Debug)]
pub(crate) struct HttpForwardService {
    #[derivative(Debug = "ignore")]
    context: AppContext,
    bind_addr: SocketAddr,
}

impl HttpForwardService {
    pub(crate) fn new(context: &AppContext) -> Self {
        Self {
            context: context.clone(),
            bind_addr: context.bind_addr(context.http_port),
        }
    }

    pub(crate) async fn serve(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), ServiceError> {
        info!("Starting HTTP proxy at {}", self.bind_addr);
        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(err) if is_transient_accept_error(&err) => {
                        warn!("HTTP proxy accept error: {}", err);
                        continue;
                    }
                    Err(source) => return Err(ServiceError::Serve { service: SERVICE_NAME, source }),
                },
            };
            let client = ClientAddr::from(peer);
            let verbose = self.context.verbose;
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let tunnels = shutdown.clone();
                let service = service_fn(move |req| proxy(req, client, verbose, tunnels.clone()));
                let conn = http1::Builder::new()
                    .preserve_header_case(true)
                    .title_case_headers(true)
                    .serve_connection(TokioIo::new(stream), service)
                    .with_upgrades();
                tokio::select! {
                    _ = shutdown.cancelled() => (),
                    result = conn => if let Err(err) = result {
                        debug!("HTTP proxy connection with {} failed: {}", client, err);
                    },
                }
            });
        }
        info!("HTTP proxy stopped");
        Ok(())
    }
}

#[async_trait]
impl Service for HttpForwardService {
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

#[instrument(skip_all, fields(client = %client, method = %req.method()))]
async fn proxy(
    req: Request<Incoming>,
    client: ClientAddr,
    verbose: bool,
    shutdown: CancellationToken,
) -> Result<Response<ProxyBody>, hyper::Error> {
    if verbose {
        info!("{} {}", req.method(), req.uri());
    } else {
        debug!("{} {}", req.method(), req.uri());
    }
    if req.method() == Method::CONNECT {
        let target = match authority_addr(req.uri()) {
            Some(target) => target,
            None => {
                warn!("CONNECT host is not a socket address: {:?}", req.uri());
                return Ok(with_status(StatusCode::BAD_REQUEST));
            }
        };
        // Reply first, the upgrade completes once the 200 is sent.
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => (),
                        result = tunnel(upgraded, &target) => match result {
                            Ok(traffic) => debug!("Closed tunnel to {}, {}", target, traffic),
                            Err(err) => warn!("Tunnel to {} failed: {}", target, err),
                        },
                    }
                }
                Err(err) => warn!("Upgrade error: {}", err),
            }
        });
        Ok(Response::new(empty()))
    } else {
        forward(req).await
    }
}

async fn forward(mut req: Request<Incoming>) -> Result<Response<ProxyBody>, hyper::Error> {
    let (host, port) = match req.uri().host() {
        Some(host) => (
            host.trim_start_matches('[').trim_end_matches(']').to_string(),
            req.uri().port_u16().unwrap_or(80),
        ),
        None => {
            debug!("Request without absolute URI: {}", req.uri());
            return Ok(with_status(StatusCode::BAD_REQUEST));
        }
    };
    let stream = match TcpStream::connect((host.as_str(), port)).await {
        Ok(stream) => stream,
        Err(err) => {
            warn!("Failed to connect {}:{}: {}", host, port, err);
            return Ok(with_status(StatusCode::BAD_GATEWAY));
        }
    };
    strip_proxy_headers(&mut req);

    let (mut sender, conn) = ClientBuilder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .handshake(TokioIo::new(stream))
        .await?;
    tokio::spawn(async move {
        if let Err(err) = conn.await {
            debug!("Origin connection failed: {}", err);
        }
    });
    let response = sender.send_request(req).await?;
    Ok(response.map(|body| body.boxed()))
}

fn strip_proxy_headers<B>(req: &mut Request<B>) {
    let headers = req.headers_mut();
    headers.remove(HeaderName::from_static("proxy-connection"));
    headers.remove(PROXY_AUTHORIZATION);
    if !headers.contains_key(HOST) {
        if let Some(authority) = req.uri().authority().cloned() {
            if let Ok(value) = authority.as_str().parse() {
                req.headers_mut().insert(HOST, value);
            }
        }
    }
}

fn authority_addr(uri: &Uri) -> Option<String> {
    let authority = uri.authority()?;
    authority.port_u16()?;
    Some(authority.to_string())
}

async fn tunnel(upgraded: Upgraded, target: &str) -> std::io::Result<Traffic> {
    let mut server = TcpStream::connect(target).await?;
    let mut upgraded = TokioIo::new(upgraded);
    let traffic = copy_bidirectional(&mut upgraded, &mut server).await?;
    Ok(traffic.into())
}

fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

fn with_status(status: StatusCode) -> Response<ProxyBody> {
    let mut response = Response::new(empty());
    *response.status_mut() = status;
    response
}
