mod config;
mod context;
mod error;
mod http;
mod net;
mod socks5;
mod supervisor;
mod telemetry;
mod types;

pub(crate) use config::{ProxyConfiguration, RawConfig};
pub(crate) use context::AppContext;
pub(crate) use error::{ConfigError, ServiceError};
pub(crate) use supervisor::{block_on, shutdown_signal, ServiceSupervisor, StopReason};
