use std::{
    io::{self, ErrorKind},
    net::SocketAddr,
};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, UdpSocket};

const LISTEN_BACKLOG: i32 = 1024;

/// Bind a listening TCP socket. Must be called inside a tokio runtime.
pub(crate) fn bind_tcp_listener(addr: &SocketAddr) -> io::Result<TcpListener> {
    let sock = new_socket(addr, Type::STREAM, Protocol::TCP)?;
    // Allow rebinding right after restart, an active listener still conflicts.
    sock.set_reuse_address(true)?;
    sock.bind(&(*addr).into())?;
    sock.listen(LISTEN_BACKLOG)?;
    TcpListener::from_std(sock.into())
}

/// Bind a UDP socket. No `SO_REUSEADDR` here, or two processes could share
/// the port silently.
pub(crate) fn bind_udp_socket(addr: &SocketAddr) -> io::Result<UdpSocket> {
    let sock = new_socket(addr, Type::DGRAM, Protocol::UDP)?;
    sock.bind(&(*addr).into())?;
    UdpSocket::from_std(sock.into())
}

fn new_socket(addr: &SocketAddr, ty: Type, proto: Protocol) -> io::Result<Socket> {
    let domain = Domain::for_address(*addr);
    let sock = Socket::new(domain, ty, Some(proto))?;
    sock.set_nonblocking(true)?;
    if addr.is_ipv6() && addr.ip().is_unspecified() {
        // Accept IPv4 clients on `::` as well
        sock.set_only_v6(false)?;
    }
    Ok(sock)
}

/// Errors on `accept()` that concern one pending connection only.
pub(crate) fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionRefused
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
    )
}
