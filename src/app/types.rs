use std::{
    fmt::{self, Display},
    net::SocketAddr,
};

use bytesize::ByteSize;

/// Peer address with IPv4-mapped IPv6 addresses folded back to IPv4, as seen
/// on dual-stack listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct ClientAddr(pub(crate) SocketAddr);

impl From<SocketAddr> for ClientAddr {
    fn from(addr: SocketAddr) -> Self {
        Self(canonicalize_socket_addr(addr))
    }
}

impl Display for ClientAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

fn canonicalize_socket_addr(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(_) => addr,
        SocketAddr::V6(addr6) => {
            if let Some(ip4) = addr6.ip().to_ipv4_mapped() {
                (ip4, addr6.port()).into()
            } else {
                addr
            }
        }
    }
}

/// Bytes moved by one tunnel, client's point of view.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Traffic {
    pub(crate) tx_bytes: u64,
    pub(crate) rx_bytes: u64,
}

impl From<(u64, u64)> for Traffic {
    fn from((tx_bytes, rx_bytes): (u64, u64)) -> Self {
        Self { tx_bytes, rx_bytes }
    }
}

impl Display for Traffic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TX {}, RX {}",
            ByteSize(self.tx_bytes),
            ByteSize(self.rx_bytes)
        )
    }
}
