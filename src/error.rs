use crate::protocol::ReplyCode;
use std::io;
use thiserror::Error;

/// Error is everything that can end a SOCKS5 session
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed negotiation or request framing. No reply is sent.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// ATYP byte outside of IPv4, domain name and IPv6
    #[error("address type {0:#04x} not supported")]
    AddressType(u8),

    /// Outbound dial failed or timed out
    #[error("failed to connect to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: io::Error,
    },

    /// CMD byte outside of CONNECT, BIND and UDP ASSOCIATE
    #[error("command {0:#04x} not supported")]
    UnsupportedCommand(u8),

    /// The UDP relay socket could not be set up
    #[error("failed to set up UDP relay: {0}")]
    UdpRelay(#[source] io::Error),

    /// I/O failure once relaying has started
    #[error("relay failed: {0}")]
    Relay(#[source] io::Error),
}

/// ProtocolError covers the framing failures of negotiation and request parsing
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unsupported SOCKS version {0}")]
    Version(u8),

    #[error("short read: {0}")]
    Io(#[from] io::Error),

    #[error("timed out waiting for client")]
    Timeout,
}

/// Error implementation block
impl Error {
    /// reply_code returns the status announced to the client before the
    /// session is torn down, if any
    pub fn reply_code(&self) -> Option<ReplyCode> {
        match self {
            Error::AddressType(_) => Some(ReplyCode::AddrTypeNotSupported),
            Error::Connect { .. } => Some(ReplyCode::HostUnreachable),
            Error::UnsupportedCommand(_) => Some(ReplyCode::CommandNotSupported),
            Error::UdpRelay(_) => Some(ReplyCode::ServerFailure),
            Error::Protocol(_) | Error::Relay(_) => None,
        }
    }
}

// Reads on the client connection before relaying are framing reads
impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Protocol(ProtocolError::Io(e))
    }
}
