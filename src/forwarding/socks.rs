//! SOCKS4/4a/5 wire codec (CONNECT only)
//!
//! [`read_request`] performs the server side of the handshake up to the
//! point where the upstream must be opened, then the caller answers with
//! [`success_reply`] or [`failure_reply`].

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::ssh::OpenFailure;

/// SOCKS protocol constants
mod socks5 {
    pub const VERSION: u8 = 0x05;
    pub const AUTH_NONE: u8 = 0x00;
    pub const AUTH_NO_ACCEPTABLE: u8 = 0xFF;
    pub const CMD_CONNECT: u8 = 0x01;
    pub const CMD_BIND: u8 = 0x02;
    pub const CMD_UDP_ASSOCIATE: u8 = 0x03;
    pub const ATYP_IPV4: u8 = 0x01;
    pub const ATYP_DOMAIN: u8 = 0x03;
    pub const ATYP_IPV6: u8 = 0x04;
}

mod socks4 {
    pub const VERSION: u8 = 0x04;
    pub const REPLY_VERSION: u8 = 0x00;
    pub const CMD_CONNECT: u8 = 0x01;
    pub const CMD_BIND: u8 = 0x02;
    pub const GRANTED: u8 = 90;
    pub const REJECTED: u8 = 91;
    pub const MAX_FIELD: usize = 255;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksVersion {
    V4,
    V5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Bind,
    UdpAssociate,
}

/// SOCKS5 reply codes (RFC 1928 section 6)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyCode {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    NotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl From<OpenFailure> for ReplyCode {
    fn from(failure: OpenFailure) -> Self {
        match failure {
            OpenFailure::HostUnreachable => ReplyCode::HostUnreachable,
            OpenFailure::ConnectionRefused => ReplyCode::ConnectionRefused,
            OpenFailure::TimedOut => ReplyCode::TtlExpired,
            OpenFailure::Other => ReplyCode::GeneralFailure,
        }
    }
}

/// Destination requested by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    V4(Ipv4Addr, u16),
    V6(Ipv6Addr, u16),
    Domain(String, u16),
}

impl TargetAddr {
    pub fn host(&self) -> String {
        match self {
            TargetAddr::V4(ip, _) => ip.to_string(),
            TargetAddr::V6(ip, _) => ip.to_string(),
            TargetAddr::Domain(name, _) => name.clone(),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::V4(_, port) | TargetAddr::V6(_, port) | TargetAddr::Domain(_, port) => {
                *port
            }
        }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::V6(ip, port) => write!(f, "[{}]:{}", ip, port),
            other => write!(f, "{}:{}", other.host(), other.port()),
        }
    }
}

/// A fully decoded client request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocksRequest {
    Socks4 {
        command: Command,
        target: TargetAddr,
        user_id: Vec<u8>,
    },
    Socks5 {
        command: Command,
        target: TargetAddr,
    },
}

impl SocksRequest {
    pub fn version(&self) -> SocksVersion {
        match self {
            SocksRequest::Socks4 { .. } => SocksVersion::V4,
            SocksRequest::Socks5 { .. } => SocksVersion::V5,
        }
    }

    pub fn command(&self) -> Command {
        match self {
            SocksRequest::Socks4 { command, .. } | SocksRequest::Socks5 { command, .. } => *command,
        }
    }

    pub fn target(&self) -> &TargetAddr {
        match self {
            SocksRequest::Socks4 { target, .. } | SocksRequest::Socks5 { target, .. } => target,
        }
    }
}

#[derive(Error, Debug)]
pub enum SocksError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Unsupported SOCKS version: {0}")]
    UnsupportedVersion(u8),

    #[error("No acceptable authentication method offered")]
    NoAcceptableMethod,

    #[error("Unsupported SOCKS command: {command}")]
    UnsupportedCommand { version: SocksVersion, command: u8 },

    #[error("Unsupported address type: {0}")]
    UnsupportedAddressType(u8),

    #[error("Malformed SOCKS request: {reason}")]
    Malformed {
        version: SocksVersion,
        reason: &'static str,
    },
}

impl SocksError {
    /// The error reply owed to the client, if the protocol defines one
    pub fn reply(&self) -> Option<Vec<u8>> {
        match self {
            SocksError::Io(_) | SocksError::NoAcceptableMethod => None,
            SocksError::UnsupportedVersion(_) => {
                Some(reply(SocksVersion::V5, ReplyCode::GeneralFailure))
            }
            SocksError::UnsupportedCommand { version, .. } => {
                Some(reply(*version, ReplyCode::CommandNotSupported))
            }
            SocksError::UnsupportedAddressType(_) => {
                Some(reply(SocksVersion::V5, ReplyCode::AddressTypeNotSupported))
            }
            SocksError::Malformed { version, .. } => {
                Some(reply(*version, ReplyCode::GeneralFailure))
            }
        }
    }
}

/// Run the handshake up to the decoded request.
///
/// For SOCKS5 this writes the method selection (no-auth only).
pub async fn read_request<S>(stream: &mut S) -> Result<SocksRequest, SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let version = stream.read_u8().await?;
    match version {
        socks4::VERSION => read_socks4(stream).await,
        socks5::VERSION => read_socks5(stream).await,
        other => Err(SocksError::UnsupportedVersion(other)),
    }
}

async fn read_socks4<S>(stream: &mut S) -> Result<SocksRequest, SocksError>
where
    S: AsyncRead + Unpin,
{
    let command = stream.read_u8().await?;
    let port = stream.read_u16().await?;
    let mut ip = [0u8; 4];
    stream.read_exact(&mut ip).await?;
    let user_id = read_nul_terminated(stream).await?;

    // SOCKS4a: 0.0.0.x with x != 0 means a domain name follows the user id
    let target = if ip[..3] == [0, 0, 0] && ip[3] != 0 {
        let name = read_nul_terminated(stream).await?;
        let name = String::from_utf8(name).map_err(|_| SocksError::Malformed {
            version: SocksVersion::V4,
            reason: "domain name is not UTF-8",
        })?;
        if name.is_empty() {
            return Err(SocksError::Malformed {
                version: SocksVersion::V4,
                reason: "empty domain name",
            });
        }
        TargetAddr::Domain(name, port)
    } else {
        TargetAddr::V4(Ipv4Addr::from(ip), port)
    };

    let command = match command {
        socks4::CMD_CONNECT => Command::Connect,
        socks4::CMD_BIND => Command::Bind,
        other => {
            return Err(SocksError::UnsupportedCommand {
                version: SocksVersion::V4,
                command: other,
            })
        }
    };

    Ok(SocksRequest::Socks4 {
        command,
        target,
        user_id,
    })
}

async fn read_nul_terminated<S>(stream: &mut S) -> Result<Vec<u8>, SocksError>
where
    S: AsyncRead + Unpin,
{
    let mut field = Vec::new();
    loop {
        match stream.read_u8().await? {
            0 => return Ok(field),
            byte if field.len() < socks4::MAX_FIELD => field.push(byte),
            _ => {
                return Err(SocksError::Malformed {
                    version: SocksVersion::V4,
                    reason: "field too long",
                })
            }
        }
    }
}

async fn read_socks5<S>(stream: &mut S) -> Result<SocksRequest, SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let nmethods = stream.read_u8().await? as usize;
    let mut methods = vec![0u8; nmethods];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&socks5::AUTH_NONE) {
        stream
            .write_all(&[socks5::VERSION, socks5::AUTH_NO_ACCEPTABLE])
            .await?;
        return Err(SocksError::NoAcceptableMethod);
    }
    stream
        .write_all(&[socks5::VERSION, socks5::AUTH_NONE])
        .await?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let [version, command, _reserved, atyp] = header;
    if version != socks5::VERSION {
        return Err(SocksError::Malformed {
            version: SocksVersion::V5,
            reason: "request version mismatch",
        });
    }

    let target = match atyp {
        socks5::ATYP_IPV4 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            TargetAddr::V4(Ipv4Addr::from(ip), stream.read_u16().await?)
        }
        socks5::ATYP_IPV6 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            TargetAddr::V6(Ipv6Addr::from(ip), stream.read_u16().await?)
        }
        socks5::ATYP_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            stream.read_exact(&mut name).await?;
            let name = String::from_utf8(name).map_err(|_| SocksError::Malformed {
                version: SocksVersion::V5,
                reason: "domain name is not UTF-8",
            })?;
            if name.is_empty() {
                return Err(SocksError::Malformed {
                    version: SocksVersion::V5,
                    reason: "empty domain name",
                });
            }
            TargetAddr::Domain(name, stream.read_u16().await?)
        }
        other => return Err(SocksError::UnsupportedAddressType(other)),
    };

    let command = match command {
        socks5::CMD_CONNECT => Command::Connect,
        socks5::CMD_BIND => Command::Bind,
        socks5::CMD_UDP_ASSOCIATE => Command::UdpAssociate,
        other => {
            return Err(SocksError::UnsupportedCommand {
                version: SocksVersion::V5,
                command: other,
            })
        }
    };

    Ok(SocksRequest::Socks5 { command, target })
}

/// Reply frame for `code`; the bound address is always reported as zeros.
///
/// SOCKS4 has a single rejection code, so every failure maps to it.
pub fn reply(version: SocksVersion, code: ReplyCode) -> Vec<u8> {
    match version {
        SocksVersion::V4 => {
            let status = if code == ReplyCode::Succeeded {
                socks4::GRANTED
            } else {
                socks4::REJECTED
            };
            vec![socks4::REPLY_VERSION, status, 0, 0, 0, 0, 0, 0]
        }
        SocksVersion::V5 => vec![
            socks5::VERSION,
            code as u8,
            0x00,
            socks5::ATYP_IPV4,
            0,
            0,
            0,
            0,
            0,
            0,
        ],
    }
}

pub fn success_reply(version: SocksVersion) -> Vec<u8> {
    reply(version, ReplyCode::Succeeded)
}

pub fn failure_reply(version: SocksVersion, failure: OpenFailure) -> Vec<u8> {
    reply(version, ReplyCode::from(failure))
}

/// Reject a request whose command this proxy does not implement
pub fn unsupported_command(request: &SocksRequest) -> SocksError {
    let command = match request.command() {
        Command::Connect => socks5::CMD_CONNECT,
        Command::Bind => socks5::CMD_BIND,
        Command::UdpAssociate => socks5::CMD_UDP_ASSOCIATE,
    };
    SocksError::UnsupportedCommand {
        version: request.version(),
        command,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn decode(client_bytes: &[u8]) -> (Result<SocksRequest, SocksError>, Vec<u8>) {
        let (mut server, mut client) = tokio::io::duplex(1024);
        client.write_all(client_bytes).await.unwrap();
        client.shutdown().await.unwrap();
        let result = read_request(&mut server).await;
        drop(server);
        let mut written = Vec::new();
        client.read_to_end(&mut written).await.unwrap();
        (result, written)
    }

    #[tokio::test]
    async fn test_socks5_domain_connect() {
        let mut bytes = vec![5, 1, 0, 5, 1, 0, 3, 11];
        bytes.extend_from_slice(b"example.org");
        bytes.extend_from_slice(&80u16.to_be_bytes());

        let (result, written) = decode(&bytes).await;
        let request = result.unwrap();
        assert_eq!(request.version(), SocksVersion::V5);
        assert_eq!(request.command(), Command::Connect);
        assert_eq!(request.target(), &TargetAddr::Domain("example.org".into(), 80));
        assert_eq!(written, vec![5, 0]);
    }

    #[tokio::test]
    async fn test_socks5_ipv6_target() {
        let mut bytes = vec![5, 1, 0, 5, 1, 0, 4];
        bytes.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        bytes.extend_from_slice(&443u16.to_be_bytes());

        let (result, _) = decode(&bytes).await;
        let target = result.unwrap().target().clone();
        assert_eq!(target, TargetAddr::V6(Ipv6Addr::LOCALHOST, 443));
        assert_eq!(target.to_string(), "[::1]:443");
    }

    #[tokio::test]
    async fn test_socks5_requires_no_auth_method() {
        let (result, written) = decode(&[5, 1, 2]).await;
        assert!(matches!(result, Err(SocksError::NoAcceptableMethod)));
        assert_eq!(written, vec![5, 0xFF]);
    }

    #[tokio::test]
    async fn test_socks5_udp_associate_is_decoded_then_rejected() {
        let (result, _) = decode(&[5, 1, 0, 5, 3, 0, 1, 10, 0, 0, 1, 0, 53]).await;
        let request = result.unwrap();
        assert_eq!(request.command(), Command::UdpAssociate);
        let reply = unsupported_command(&request).reply().unwrap();
        assert_eq!(reply[1], ReplyCode::CommandNotSupported as u8);
    }

    #[tokio::test]
    async fn test_socks5_bad_address_type() {
        let (result, _) = decode(&[5, 1, 0, 5, 1, 0, 9]).await;
        let err = result.unwrap_err();
        assert!(matches!(err, SocksError::UnsupportedAddressType(9)));
        assert_eq!(err.reply().unwrap()[1], 0x08);
    }

    #[tokio::test]
    async fn test_socks4_ipv4_connect() {
        let mut bytes = vec![4, 1];
        bytes.extend_from_slice(&8080u16.to_be_bytes());
        bytes.extend_from_slice(&[192, 168, 1, 20]);
        bytes.extend_from_slice(b"alice\0");

        let (result, written) = decode(&bytes).await;
        assert!(written.is_empty());
        match result.unwrap() {
            SocksRequest::Socks4 {
                command,
                target,
                user_id,
            } => {
                assert_eq!(command, Command::Connect);
                assert_eq!(target, TargetAddr::V4(Ipv4Addr::new(192, 168, 1, 20), 8080));
                assert_eq!(user_id, b"alice");
            }
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_socks4a_domain() {
        let mut bytes = vec![4, 1, 0, 22, 0, 0, 0, 1];
        bytes.extend_from_slice(b"\0build.internal\0");

        let (result, _) = decode(&bytes).await;
        assert_eq!(
            result.unwrap().target(),
            &TargetAddr::Domain("build.internal".into(), 22)
        );
    }

    #[tokio::test]
    async fn test_socks4_unknown_command() {
        let (result, _) = decode(&[4, 7, 0, 80, 1, 2, 3, 4, 0]).await;
        let err = result.unwrap_err();
        assert_eq!(err.reply().unwrap(), vec![0, 91, 0, 0, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_unknown_version_gets_socks5_general_failure() {
        let (result, _) = decode(b"GET / HTTP/1.1\r\n").await;
        let err = result.unwrap_err();
        assert!(matches!(err, SocksError::UnsupportedVersion(b'G')));
        assert_eq!(err.reply().unwrap(), vec![5, 1, 0, 1, 0, 0, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_truncated_request_is_io_error() {
        let (result, _) = decode(&[5, 1, 0, 5, 1]).await;
        let err = result.unwrap_err();
        assert!(matches!(err, SocksError::Io(_)));
        assert!(err.reply().is_none());
    }

    #[test]
    fn test_open_failure_reply_codes() {
        let cases = [
            (OpenFailure::HostUnreachable, 0x04),
            (OpenFailure::ConnectionRefused, 0x05),
            (OpenFailure::TimedOut, 0x06),
            (OpenFailure::Other, 0x01),
        ];
        for (failure, code) in cases {
            assert_eq!(failure_reply(SocksVersion::V5, failure)[1], code);
            assert_eq!(failure_reply(SocksVersion::V4, failure)[1], 91);
        }
        assert_eq!(success_reply(SocksVersion::V4)[1], 90);
        assert_eq!(success_reply(SocksVersion::V5)[1], 0);
    }
}
