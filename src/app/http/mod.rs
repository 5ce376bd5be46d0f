mod discovery;
mod pac;
mod proxy;

pub(crate) use discovery::DiscoveryService;
pub(crate) use proxy::HttpForwardService;
