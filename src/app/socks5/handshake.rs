//! Server side of the SOCKSv5 handshake (RFC 1928), no authentication.

use std::{
    fmt::{self, Display},
    io::{self, ErrorKind},
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::app::error::io_error;

const SOCKS_VERSION: u8 = 0x05;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NO_ACCEPTABLE: u8 = 0xff;

const CMD_CONNECT: u8 = 0x01;
const CMD_BIND: u8 = 0x02;
const CMD_UDP_ASSOCIATE: u8 = 0x03;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    Connect,
    Bind,
    UdpAssociate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip(addr) => addr.fmt(f),
            Self::Domain(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl From<&io::Error> for Reply {
    fn from(err: &io::Error) -> Self {
        match err.kind() {
            ErrorKind::ConnectionRefused => Reply::ConnectionRefused,
            ErrorKind::AddrNotAvailable => Reply::HostUnreachable,
            ErrorKind::NotFound => Reply::HostUnreachable,
            ErrorKind::HostUnreachable => Reply::HostUnreachable,
            ErrorKind::NetworkUnreachable => Reply::NetworkUnreachable,
            _ => Reply::GeneralFailure,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Request {
    Valid(Command, TargetAddr),
    /// Request parsed far enough to answer, but must be refused.
    Rejected(Reply),
}

/// Negotiate the auth method. Returns `false` if the client offers no
/// method we accept, after telling it so.
pub(crate) async fn negotiate_method<S>(stream: &mut S) -> io::Result<bool>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await?;
    let [version, n_methods] = buf;
    if version != SOCKS_VERSION {
        io_error!(InvalidData, "Not a SOCKSv5 client");
    }
    let mut methods = vec![0u8; n_methods as usize];
    stream.read_exact(&mut methods).await?;
    if methods.contains(&METHOD_NO_AUTH) {
        stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;
        Ok(true)
    } else {
        stream
            .write_all(&[SOCKS_VERSION, METHOD_NO_ACCEPTABLE])
            .await?;
        Ok(false)
    }
}

pub(crate) async fn read_request<S>(stream: &mut S) -> io::Result<Request>
where
    S: AsyncRead + Unpin,
{
    // VER, CMD, RSV, ATYP
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await?;
    let [version, cmd, _, atyp] = buf;
    if version != SOCKS_VERSION {
        io_error!(InvalidData, "Unexpected SOCKS version in request");
    }
    let ip: IpAddr = match atyp {
        ATYP_IPV4 => Ipv4Addr::from(stream.read_u32().await?).into(),
        ATYP_IPV6 => Ipv6Addr::from(stream.read_u128().await?).into(),
        ATYP_DOMAIN => {
            let len = stream.read_u8().await?;
            let mut host = vec![0u8; len as usize];
            stream.read_exact(&mut host).await?;
            let port = stream.read_u16().await?;
            let host = match String::from_utf8(host) {
                Ok(host) => host,
                Err(_) => return Ok(Request::Rejected(Reply::AddressTypeNotSupported)),
            };
            return Ok(parse_command(cmd, TargetAddr::Domain(host, port)));
        }
        _ => return Ok(Request::Rejected(Reply::AddressTypeNotSupported)),
    };
    let port = stream.read_u16().await?;
    Ok(parse_command(cmd, TargetAddr::Ip((ip, port).into())))
}

fn parse_command(cmd: u8, target: TargetAddr) -> Request {
    let command = match cmd {
        CMD_CONNECT => Command::Connect,
        CMD_BIND => Command::Bind,
        CMD_UDP_ASSOCIATE => Command::UdpAssociate,
        _ => return Request::Rejected(Reply::CommandNotSupported),
    };
    Request::Valid(command, target)
}

pub(crate) async fn write_reply<S>(stream: &mut S, reply: Reply, bound: SocketAddr) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&encode_reply(reply, bound)).await?;
    stream.flush().await
}

fn encode_reply(reply: Reply, bound: SocketAddr) -> Vec<u8> {
    let mut buf = Vec::with_capacity(22);
    buf.extend_from_slice(&[SOCKS_VERSION, reply as u8, 0x00]);
    match bound.ip() {
        IpAddr::V4(ip) => {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.push(ATYP_IPV6);
            buf.extend_from_slice(&ip.octets());
        }
    }
    buf.extend_from_slice(&bound.port().to_be_bytes());
    buf
}
