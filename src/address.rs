use crate::error::Error;
use crate::protocol::AddressType;
use anyhow::{Result, anyhow};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Host is the DST.ADDR part of a request, kept in its wire form
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Host {
    Ipv4(Ipv4Addr),
    Domain(String),
    Ipv6(Ipv6Addr),
}

/// TargetAddr is a decoded DST.ADDR and DST.PORT pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetAddr {
    pub host: Host,
    pub port: u16,
}

/// Host implementation block
impl Host {
    /// address_type returns the ATYP tag this host is encoded with
    pub fn address_type(&self) -> AddressType {
        match self {
            Host::Ipv4(_) => AddressType::IPv4,
            Host::Domain(_) => AddressType::DomainName,
            Host::Ipv6(_) => AddressType::IPv6,
        }
    }
}

// Dotted-decimal, canonical IPv6 or the domain verbatim
impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Host::Ipv4(ip) => write!(f, "{ip}"),
            Host::Domain(name) => f.write_str(name),
            Host::Ipv6(ip) => write!(f, "{ip}"),
        }
    }
}

// host:port, with IPv6 hosts in brackets
impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Host::Ipv6(ip) => write!(f, "[{ip}]:{}", self.port),
            host => write!(f, "{host}:{}", self.port),
        }
    }
}

impl From<SocketAddr> for TargetAddr {
    fn from(addr: SocketAddr) -> Self {
        let host = match addr.ip() {
            IpAddr::V4(ip) => Host::Ipv4(ip),
            IpAddr::V6(ip) => Host::Ipv6(ip),
        };
        TargetAddr {
            host,
            port: addr.port(),
        }
    }
}

/// TargetAddr implementation block
impl TargetAddr {
    /// write_to appends the ATYP, DST.ADDR and DST.PORT fields to buf
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.push(self.host.address_type() as u8);
        match &self.host {
            Host::Ipv4(ip) => buf.extend_from_slice(&ip.octets()),
            Host::Domain(name) => {
                // Length octet caps a domain at 255 bytes
                let bytes = &name.as_bytes()[..name.len().min(u8::MAX as usize)];
                buf.push(bytes.len() as u8);
                buf.extend_from_slice(bytes);
            }
            Host::Ipv6(ip) => buf.extend_from_slice(&ip.octets()),
        }
        buf.extend_from_slice(&self.port.to_be_bytes());
    }

    /// resolve turns the target into socket addresses, using DNS for domains
    pub async fn resolve(&self) -> std::io::Result<Vec<SocketAddr>> {
        match &self.host {
            Host::Ipv4(ip) => Ok(vec![SocketAddr::new(IpAddr::V4(*ip), self.port)]),
            Host::Ipv6(ip) => Ok(vec![SocketAddr::new(IpAddr::V6(*ip), self.port)]),
            Host::Domain(name) => Ok(tokio::net::lookup_host((name.as_str(), self.port))
                .await?
                .collect()),
        }
    }
}

/// read_target_address parses ATYP, DST.ADDR and DST.PORT from a client
/// stream
///
/// An unknown ATYP yields [`Error::AddressType`]; the caller owns the
/// `addrTypeNotSupported` reply. Short reads surface as protocol errors.
pub async fn read_target_address<S>(stream: &mut S) -> Result<TargetAddr, Error>
where
    S: AsyncRead + Unpin,
{
    // Read address type byte from stream
    let atyp = stream.read_u8().await?;

    // Match type and extract address or domain name
    let host = match AddressType::from_byte(atyp) {
        Some(AddressType::IPv4) => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            Host::Ipv4(Ipv4Addr::from(addr))
        }
        Some(AddressType::DomainName) => {
            // First octet in DomainName contains the number of
            // octets to follow
            let len = stream.read_u8().await?;
            let mut domain = vec![0u8; len as usize];
            stream.read_exact(&mut domain).await?;
            Host::Domain(String::from_utf8_lossy(&domain).into_owned())
        }
        Some(AddressType::IPv6) => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            Host::Ipv6(Ipv6Addr::from(addr))
        }
        None => return Err(Error::AddressType(atyp)),
    };

    // Port -> BigEndian (network order)
    let port = stream.read_u16().await?;

    Ok(TargetAddr { host, port })
}

/// parse_address_from_packet parses ATYP, DST.ADDR and DST.PORT from a
/// datagram starting at offset and returns the target plus the number of
/// bytes consumed
pub fn parse_address_from_packet(packet: &[u8], offset: usize) -> Result<(TargetAddr, usize)> {
    let atyp = *packet
        .get(offset)
        .ok_or_else(|| anyhow!("not enough data to read address type"))?;

    // Start of DST.ADDR
    let mut cursor = offset + 1;

    let host = match AddressType::from_byte(atyp) {
        Some(AddressType::IPv4) => {
            let bytes: [u8; 4] = take(packet, &mut cursor, 4)?
                .try_into()
                .map_err(|_| anyhow!("invalid IPv4 bytes"))?;
            Host::Ipv4(Ipv4Addr::from(bytes))
        }
        Some(AddressType::DomainName) => {
            let len = take(packet, &mut cursor, 1)?[0] as usize;
            if len == 0 {
                return Err(anyhow!("domain length cannot be 0"));
            }
            let name = take(packet, &mut cursor, len)?;
            Host::Domain(String::from_utf8_lossy(name).into_owned())
        }
        Some(AddressType::IPv6) => {
            let bytes: [u8; 16] = take(packet, &mut cursor, 16)?
                .try_into()
                .map_err(|_| anyhow!("invalid IPv6 bytes"))?;
            Host::Ipv6(Ipv6Addr::from(bytes))
        }
        None => return Err(anyhow!("unknown address type: {atyp}")),
    };

    let port_bytes = take(packet, &mut cursor, 2)?;
    let port = u16::from_be_bytes([port_bytes[0], port_bytes[1]]);

    Ok((TargetAddr { host, port }, cursor - offset))
}

// take returns the next len bytes of data and advances the cursor
fn take<'a>(data: &'a [u8], cursor: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = *cursor + len;
    let bytes = data
        .get(*cursor..end)
        .ok_or_else(|| anyhow!("datagram truncated at offset {}", *cursor))?;
    *cursor = end;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtocolError;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn reads_ipv4_target() {
        let mut stream = Builder::new().read(&[0x01, 127, 0, 0, 1, 0, 80]).build();

        let target = read_target_address(&mut stream).await.unwrap();

        assert_eq!(target.host, Host::Ipv4(Ipv4Addr::LOCALHOST));
        assert_eq!(target.port, 80);
        assert_eq!(target.host.to_string(), "127.0.0.1");
        assert_eq!(target.to_string(), "127.0.0.1:80");
    }

    #[tokio::test]
    async fn reads_ipv6_target() {
        let mut wire = vec![0x04];
        wire.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        wire.extend_from_slice(&[0x1f, 0x90]);
        let mut stream = Builder::new().read(&wire).build();

        let target = read_target_address(&mut stream).await.unwrap();

        assert_eq!(target.host.to_string(), "::1");
        assert_eq!(target.port, 8080);
        assert_eq!(target.to_string(), "[::1]:8080");
    }

    #[tokio::test]
    async fn reads_domain_target_in_pieces() {
        let mut stream = Builder::new()
            .read(&[0x03, 11])
            .read(b"example")
            .read(b".com")
            .read(&[0x01, 0xbb])
            .build();

        let target = read_target_address(&mut stream).await.unwrap();

        assert_eq!(target.host, Host::Domain("example.com".into()));
        assert_eq!(target.port, 443);
    }

    #[tokio::test]
    async fn domain_is_kept_verbatim() {
        let mut stream = Builder::new()
            .read(&[0x03, 5])
            .read(b"a_b c")
            .read(&[0, 1])
            .build();

        let target = read_target_address(&mut stream).await.unwrap();

        assert_eq!(target.host.to_string(), "a_b c");
    }

    #[tokio::test]
    async fn unknown_address_type_is_rejected() {
        let mut stream = Builder::new().read(&[0x02]).build();

        let err = read_target_address(&mut stream).await.unwrap_err();

        assert!(matches!(err, Error::AddressType(0x02)));
    }

    #[tokio::test]
    async fn truncated_port_is_a_protocol_error() {
        let mut stream = Builder::new().read(&[0x01, 10, 0, 0, 1, 0]).build();

        let err = read_target_address(&mut stream).await.unwrap_err();

        assert!(matches!(err, Error::Protocol(ProtocolError::Io(_))));
    }

    #[tokio::test]
    async fn domain_survives_encode_and_decode_for_every_length() {
        for len in 1..=255usize {
            let name: String = (0..len).map(|i| (b'a' + (i % 26) as u8) as char).collect();
            let target = TargetAddr {
                host: Host::Domain(name.clone()),
                port: 1000 + len as u16,
            };
            let mut wire = Vec::new();
            target.write_to(&mut wire);
            assert_eq!(wire.len(), 1 + 1 + len + 2);

            let mut stream = Builder::new().read(&wire).build();
            let decoded = read_target_address(&mut stream).await.unwrap();

            assert_eq!(decoded.host.to_string(), name);
            assert_eq!(decoded.port, 1000 + len as u16);
        }
    }

    #[test]
    fn parses_address_from_packet() {
        // RSV RSV FRAG | ATYP ADDR PORT | DATA
        let packet = [0, 0, 0, 0x01, 10, 1, 2, 3, 0x00, 0x35, 0xde, 0xad];

        let (target, consumed) = parse_address_from_packet(&packet, 3).unwrap();

        assert_eq!(target.to_string(), "10.1.2.3:53");
        assert_eq!(consumed, 7);
        assert_eq!(&packet[3 + consumed..], &[0xde, 0xad]);
    }

    #[test]
    fn parses_domain_from_packet() {
        let mut packet = vec![0x03, 3];
        packet.extend_from_slice(b"foo");
        packet.extend_from_slice(&[0, 7]);

        let (target, consumed) = parse_address_from_packet(&packet, 0).unwrap();

        assert_eq!(target.host, Host::Domain("foo".into()));
        assert_eq!(target.port, 7);
        assert_eq!(consumed, packet.len());
    }

    #[test]
    fn rejects_truncated_packets() {
        assert!(parse_address_from_packet(&[], 0).is_err());
        assert!(parse_address_from_packet(&[0x01, 1, 2], 0).is_err());
        assert!(parse_address_from_packet(&[0x04, 0, 0, 0], 0).is_err());
        assert!(parse_address_from_packet(&[0x03, 0, 0, 0], 0).is_err());
        assert!(parse_address_from_packet(&[0x05, 0, 0, 0], 0).is_err());
    }

    #[test]
    fn socket_addr_round_trips_through_target() {
        let addr: SocketAddr = "[2001:db8::1]:5353".parse().unwrap();
        let target = TargetAddr::from(addr);

        let mut wire = Vec::new();
        target.write_to(&mut wire);
        let (parsed, _) = parse_address_from_packet(&wire, 0).unwrap();

        assert_eq!(parsed, target);
        assert_eq!(parsed.host.address_type(), AddressType::IPv6);
    }
}
