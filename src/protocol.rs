// RSV: Fields marked RESERVED (RSV) must be set to X'00'.
pub const RSV: u8 = 0x00;

/// CONNECT_TIMEOUT_SECS is the default bound on an outbound dial
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// MAX_DGRAM is the largest UDP payload we expect to relay
pub const MAX_DGRAM: usize = 65_535;

/// Version represents available SOCKS proxy versions.
/// Only SOCKS5 is spoken here.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    SOCKS5 = 0x05,
}

/// AuthMethod represents available SOCKS5
/// authentication methods
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    NoAuth = 0x00,
    // Gssapi = 0x01, not supported
    // UserPass = 0x02, not supported
    // 0x03 - 0x7f: IANA reserved
    // 0x80 - 0xFE: private methods
    // 0xFF: no acceptable methods, never sent
}

/// AddressType represents the SOCKS5 address types:
/// IPv4, Domain Name, IPv6
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
    IPv4 = 0x01,
    DomainName = 0x03,
    IPv6 = 0x04,
}

/// AddressType implementation block
impl AddressType {
    /// from_byte converts a byte to its related network address type
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(AddressType::IPv4),
            0x03 => Some(AddressType::DomainName),
            0x04 => Some(AddressType::IPv6),
            _ => None,
        }
    }
}

/// Command represents SOCKS5 protocol commands
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect = 0x01,
    Bind = 0x02,
    UdpAssociate = 0x03,
}

/// Command implementation block
impl Command {
    /// from_byte converts a byte to its related SOCKS5 protocol command
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Command::Connect),
            0x02 => Some(Command::Bind),
            0x03 => Some(Command::UdpAssociate),
            _ => None,
        }
    }
}

/// ReplyCode is the REP field of a server reply
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCode {
    Succeeded = 0x00,
    ServerFailure = 0x01,
    ConnectionNotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddrTypeNotSupported = 0x08,
    // 0x09 - 0xFF: unassigned
}
