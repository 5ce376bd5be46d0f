mod handshake;
mod relay;
mod service;

pub(crate) use relay::UdpEchoRelayService;
pub(crate) use service::SocksForwardService;
