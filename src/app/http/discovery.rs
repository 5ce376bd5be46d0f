use std::{convert::Infallible, net::SocketAddr};

use async_trait::async_trait;
use bytes::Bytes;
use derivative::Derivative;
use http_body_util::Full;
use hyper::{
    body::Incoming,
    header::{HeaderValue, ALLOW, CONTENT_TYPE},
    server::conn::http1,
    service::service_fn,
    Method, Request, Response, StatusCode,
};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::app::{
    error::ServiceError,
    net::{bind_tcp_listener, is_transient_accept_error},
    supervisor::Service,
    types::ClientAddr,
    AppContext, ProxyConfiguration,
};

use super::pac::discovery_script;

const SERVICE_NAME: &str = "PAC discovery";

pub(crate) const DISCOVERY_PATH: &str = "/proxy";
const PAC_CONTENT_TYPE: &str = "text/javascript";

#[derive(Derivative)]
#[derivative(Debug)]
pub(crate) struct DiscoveryService {
    #[derivative(Debug = "ignore")]
    context: AppContext,
    bind_addr: SocketAddr,
}

impl DiscoveryService {
    pub(crate) fn new(context: &AppContext) -> Self {
        Self {
            context: context.clone(),
            bind_addr: context.bind_addr(context.discovery_port),
        }
    }

    pub(crate) async fn serve(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), ServiceError> {
        info!("Starting HTTP discovery at {}", self.bind_addr);
        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(err) if is_transient_accept_error(&err) => {
                        warn!("Discovery accept error: {}", err);
                        continue;
                    }
                    Err(source) => return Err(ServiceError::Serve { service: SERVICE_NAME, source }),
                },
            };
            let client = ClientAddr::from(peer);
            let context = self.context.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    if context.verbose {
                        info!("Serving proxy discovery request from {}", client);
                    } else {
                        debug!("{} {} from {}", req.method(), req.uri(), client);
                    }
                    let response = respond(&context, &req);
                    async move { Ok::<_, Infallible>(response) }
                });
                let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
                tokio::select! {
                    _ = shutdown.cancelled() => (),
                    result = conn => if let Err(err) = result {
                        debug!("Discovery connection with {} failed: {}", client, err);
                    },
                }
            });
        }
        info!("HTTP discovery stopped");
        Ok(())
    }
}

#[async_trait]
impl Service for DiscoveryService {
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

fn respond<B>(config: &ProxyConfiguration, req: &Request<B>) -> Response<Full<Bytes>> {
    if req.uri().path() != DISCOVERY_PATH {
        return with_status(StatusCode::NOT_FOUND);
    }
    match *req.method() {
        Method::GET | Method::HEAD => {
            let mut response = Response::new(Full::new(discovery_script(config).into()));
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static(PAC_CONTENT_TYPE));
            response
        }
        _ => {
            let mut response = with_status(StatusCode::METHOD_NOT_ALLOWED);
            response
                .headers_mut()
                .insert(ALLOW, HeaderValue::from_static("GET, HEAD"));
            response
        }
    }
}

fn with_status(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::default());
    *response.status_mut() = status;
    response
}
