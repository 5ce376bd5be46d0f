use std::{ops::Deref, sync::Arc};

use tracing::{info, warn};

use super::config::ProxyConfiguration;

#[derive(Debug, Clone)]
pub(crate) struct AppContext {
    config: Arc<ProxyConfiguration>,
}

impl AppContext {
    pub(crate) fn new(config: ProxyConfiguration) -> Self {
        info!(
            "Advertise {}, bind on {}",
            config.advertised_address, config.bind_address
        );
        if !config.socks_enabled()
            && !config.http_enabled()
            && !config.discovery_enabled()
            && !config.location_enabled
        {
            warn!("No service enabled");
        }
        Self {
            config: config.into(),
        }
    }
}

impl Deref for AppContext {
    type Target = ProxyConfiguration;

    fn deref(&self) -> &Self::Target {
        &self.config
    }
}

impl From<ProxyConfiguration> for AppContext {
    fn from(config: ProxyConfiguration) -> Self {
        Self {
            config: config.into(),
        }
    }
}
