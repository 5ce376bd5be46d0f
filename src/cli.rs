use std::path::PathBuf;

use clap::Parser;
use tracing::metadata::LevelFilter;

use crate::app::RawConfig;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub(crate) struct CliArgs {
    /// Proxy address to expose to clients
    #[clap(short = 'a', long)]
    pub(crate) advertised_address: Option<String>,

    /// Address to bind on for all listeners [default: 0.0.0.0]
    #[clap(short = 'b', long)]
    pub(crate) bind_address: Option<String>,

    /// SOCKSv5 proxy port, also used by the UDP relay (0 to disable)
    #[clap(short = 's', long)]
    pub(crate) socks_port: Option<i64>,

    /// HTTP proxy port (0 to disable)
    #[clap(short = 'p', long)]
    pub(crate) http_port: Option<i64>,

    /// HTTP port for auto proxy configuration discovery (0 to disable)
    #[clap(short = 'd', long)]
    pub(crate) discovery_port: Option<i64>,

    /// Stream location samples from the location device
    #[clap(short = 'l', long)]
    pub(crate) location: bool,

    /// Log forwarding activity
    #[clap(short = 'v', long)]
    pub(crate) verbose: bool,

    /// Path of the location device [default: /dev/location]
    #[clap(long)]
    pub(crate) location_device: Option<PathBuf>,

    /// Period of time to wait between two location reads [default: 1s]
    #[clap(long)]
    pub(crate) location_interval: Option<String>,

    /// TOML file to read options from. Options given on the command line
    /// take precedence.
    #[clap(short = 'c', long)]
    pub(crate) config: Option<PathBuf>,

    /// Level of logging verbosity [possible values: off, error, warn, info,
    /// debug, trace]
    #[clap(long)]
    #[clap(default_value = "info")]
    pub(crate) log_level: LevelFilter,
}

impl CliArgs {
    pub(crate) fn raw_config(&self) -> RawConfig {
        RawConfig {
            advertised_address: self.advertised_address.clone(),
            bind_address: self.bind_address.clone(),
            socks_port: self.socks_port,
            http_port: self.http_port,
            discovery_port: self.discovery_port,
            location: self.location.then_some(true),
            verbose: self.verbose.then_some(true),
            location_device: self.location_device.clone(),
            location_interval: self.location_interval.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_flags() {
        let args = CliArgs::try_parse_from([
            "gatewayd", "-a", "10.0.0.5", "-b", "127.0.0.1", "-s", "1080", "-p", "3128", "-d",
            "8080", "-l", "-v",
        ])
        .unwrap();
        let raw = args.raw_config();
        assert_eq!(raw.advertised_address.as_deref(), Some("10.0.0.5"));
        assert_eq!(raw.bind_address.as_deref(), Some("127.0.0.1"));
        assert_eq!(raw.socks_port, Some(1080));
        assert_eq!(raw.http_port, Some(3128));
        assert_eq!(raw.discovery_port, Some(8080));
        assert_eq!(raw.location, Some(true));
        assert_eq!(raw.verbose, Some(true));
        assert_eq!(args.log_level, LevelFilter::INFO);
    }

    #[test]
    fn unset_flags_stay_unset() {
        let raw = CliArgs::try_parse_from(["gatewayd"]).unwrap().raw_config();
        assert_eq!(raw.socks_port, None);
        assert_eq!(raw.location, None);
        assert_eq!(raw.verbose, None);
    }

    #[test]
    fn help_flag() {
        let err = CliArgs::try_parse_from(["gatewayd", "-h"]).unwrap_err();
        assert_eq!(err.kind(), clap::ErrorKind::DisplayHelp);
    }
}
