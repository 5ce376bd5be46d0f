use std::{
    fs,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use super::error::ConfigError;

pub(crate) const DEFAULT_ADVERTISED_ADDRESS: IpAddr = IpAddr::V4(Ipv4Addr::new(172, 20, 10, 1));
pub(crate) const DEFAULT_BIND_ADDRESS: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
pub(crate) const DEFAULT_LOCATION_DEVICE: &str = "/dev/location";
pub(crate) const DEFAULT_LOCATION_INTERVAL: Duration = Duration::from_secs(1);

/// Operator input before validation. Every field is optional so that the
/// command line and the config file can be layered.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub(crate) struct RawConfig {
    pub(crate) advertised_address: Option<String>,
    pub(crate) bind_address: Option<String>,
    pub(crate) socks_port: Option<i64>,
    pub(crate) http_port: Option<i64>,
    pub(crate) discovery_port: Option<i64>,
    pub(crate) location: Option<bool>,
    pub(crate) verbose: Option<bool>,
    pub(crate) location_device: Option<PathBuf>,
    pub(crate) location_interval: Option<String>,
}

impl RawConfig {
    pub(crate) fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.into(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::ParseFile {
            path: path.into(),
            source,
        })
    }

    /// Values set in `self` win over the ones in `lower`. Flags are enabled
    /// if either side enables them.
    pub(crate) fn layered_over(self, lower: RawConfig) -> RawConfig {
        RawConfig {
            advertised_address: self.advertised_address.or(lower.advertised_address),
            bind_address: self.bind_address.or(lower.bind_address),
            socks_port: self.socks_port.or(lower.socks_port),
            http_port: self.http_port.or(lower.http_port),
            discovery_port: self.discovery_port.or(lower.discovery_port),
            location: or_flag(self.location, lower.location),
            verbose: or_flag(self.verbose, lower.verbose),
            location_device: self.location_device.or(lower.location_device),
            location_interval: self.location_interval.or(lower.location_interval),
        }
    }

    pub(crate) fn resolve(self) -> Result<ProxyConfiguration, ConfigError> {
        let advertised_address =
            parse_ip("advertised-address", self.advertised_address, DEFAULT_ADVERTISED_ADDRESS)?;
        let bind_address = parse_ip("bind-address", self.bind_address, DEFAULT_BIND_ADDRESS)?;
        let socks_port = parse_port("socks-port", self.socks_port)?;
        let http_port = parse_port("http-port", self.http_port)?;
        let discovery_port = parse_port("discovery-port", self.discovery_port)?;
        let location_interval = match self.location_interval {
            None => DEFAULT_LOCATION_INTERVAL,
            Some(text) => parse_duration::parse(&text)
                .map_err(|err| ConfigError::invalid("location-interval", err))?,
        };
        Ok(ProxyConfiguration {
            advertised_address,
            bind_address,
            socks_port,
            http_port,
            discovery_port,
            verbose: self.verbose.unwrap_or(false),
            location_enabled: self.location.unwrap_or(false),
            location_device: self
                .location_device
                .unwrap_or_else(|| DEFAULT_LOCATION_DEVICE.into()),
            location_interval,
        })
    }
}

fn or_flag(upper: Option<bool>, lower: Option<bool>) -> Option<bool> {
    match (upper, lower) {
        (None, None) => None,
        (a, b) => Some(a.unwrap_or(false) || b.unwrap_or(false)),
    }
}

fn parse_ip(
    field: &'static str,
    value: Option<String>,
    default: IpAddr,
) -> Result<IpAddr, ConfigError> {
    match value {
        None => Ok(default),
        Some(text) => text
            .trim()
            .parse()
            .map_err(|_| ConfigError::invalid(field, format!("{:?} is not an IP address", text))),
    }
}

fn parse_port(field: &'static str, value: Option<i64>) -> Result<u16, ConfigError> {
    let port = value.unwrap_or(0);
    u16::try_from(port)
        .map_err(|_| ConfigError::invalid(field, format!("{} is outside 0-65535", port)))
}

/// Validated, immutable configuration shared by every service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ProxyConfiguration {
    /// Address written into the PAC script and SOCKS replies
    pub(crate) advertised_address: IpAddr,
    /// Address all listeners bind on
    pub(crate) bind_address: IpAddr,
    pub(crate) socks_port: u16,
    pub(crate) http_port: u16,
    pub(crate) discovery_port: u16,
    pub(crate) verbose: bool,
    pub(crate) location_enabled: bool,
    pub(crate) location_device: PathBuf,
    pub(crate) location_interval: Duration,
}

impl Default for ProxyConfiguration {
    fn default() -> Self {
        Self {
            advertised_address: DEFAULT_ADVERTISED_ADDRESS,
            bind_address: DEFAULT_BIND_ADDRESS,
            socks_port: 0,
            http_port: 0,
            discovery_port: 0,
            verbose: false,
            location_enabled: false,
            location_device: DEFAULT_LOCATION_DEVICE.into(),
            location_interval: DEFAULT_LOCATION_INTERVAL,
        }
    }
}

impl ProxyConfiguration {
    pub(crate) fn socks_enabled(&self) -> bool {
        self.socks_port != 0
    }

    pub(crate) fn http_enabled(&self) -> bool {
        self.http_port != 0
    }

    pub(crate) fn discovery_enabled(&self) -> bool {
        self.discovery_port != 0
    }

    pub(crate) fn bind_addr(&self, port: u16) -> SocketAddr {
        (self.bind_address, port).into()
    }

    pub(crate) fn advertised_addr(&self, port: u16) -> SocketAddr {
        (self.advertised_address, port).into()
    }
}
