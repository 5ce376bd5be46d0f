use std::fmt::Write;

use crate::app::ProxyConfiguration;

/// Proxy directives for each enabled forwarding service, SOCKSv5 first.
pub(crate) fn proxy_entries(config: &ProxyConfiguration) -> String {
    let mut entries = String::new();
    if config.socks_enabled() {
        let _ = write!(entries, "SOCKS5 {}; ", config.advertised_addr(config.socks_port));
    }
    if config.http_enabled() {
        let _ = write!(entries, "HTTP {}; ", config.advertised_addr(config.http_port));
    }
    entries
}

/// Render the PAC script. Pure function of `config`, never cached.
pub(crate) fn discovery_script(config: &ProxyConfiguration) -> String {
    format!(
        "function FindProxyForURL(url, host) {{ return '{}DIRECT'; }}",
        proxy_entries(config)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_only() {
        let config = ProxyConfiguration {
            discovery_port: 8080,
            ..Default::default()
        };
        assert_eq!(
            discovery_script(&config),
            "function FindProxyForURL(url, host) { return 'DIRECT'; }"
        );
    }

    #[test]
    fn socks_then_http() {
        let config = ProxyConfiguration {
            advertised_address: "10.0.0.5".parse().unwrap(),
            socks_port: 1080,
            http_port: 3128,
            ..Default::default()
        };
        assert_eq!(
            discovery_script(&config),
            "function FindProxyForURL(url, host) { return 'SOCKS5 10.0.0.5:1080; HTTP 10.0.0.5:3128; DIRECT'; }"
        );
    }

    #[test]
    fn http_only() {
        let config = ProxyConfiguration {
            advertised_address: "10.0.0.5".parse().unwrap(),
            http_port: 3128,
            ..Default::default()
        };
        assert_eq!(proxy_entries(&config), "HTTP 10.0.0.5:3128; ");
    }

    #[test]
    fn bracket_ipv6() {
        let config = ProxyConfiguration {
            advertised_address: "fd00::1".parse().unwrap(),
            socks_port: 1080,
            ..Default::default()
        };
        assert_eq!(proxy_entries(&config), "SOCKS5 [fd00::1]:1080; ");
    }

    #[test]
    fn advertise_not_bind_address() {
        let config = ProxyConfiguration {
            advertised_address: "192.168.1.10".parse().unwrap(),
            bind_address: "0.0.0.0".parse().unwrap(),
            socks_port: 1080,
            ..Default::default()
        };
        assert!(discovery_script(&config).contains("SOCKS5 192.168.1.10:1080; "));
    }
}
