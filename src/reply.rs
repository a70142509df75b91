use crate::protocol::{AddressType, RSV, ReplyCode, Version};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// REPLY_LEN is the size of every reply we send: the bound address is
/// always reported as IPv4
pub const REPLY_LEN: usize = 10;

/// encode_reply builds the reply for reply_code, announcing bound_addr
///
/// BND.ADDR is the server's own address, not a per-target endpoint. An IPv6
/// address that does not map onto IPv4 is reported as 0.0.0.0.
pub fn encode_reply(reply_code: ReplyCode, bound_addr: SocketAddr) -> [u8; REPLY_LEN] {
    // SOCKS5 reply format
    // +----+-----+-------+------+----------+----------+
    // |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
    // +----+-----+-------+------+----------+----------+
    // | 1  |  1  | X'00' |  1   | Variable |    2     |
    // +----+-----+-------+------+----------+----------+
    let ip = match bound_addr.ip() {
        IpAddr::V4(ip) => ip,
        IpAddr::V6(ip) => ip.to_ipv4_mapped().unwrap_or(Ipv4Addr::UNSPECIFIED),
    };
    let [a, b, c, d] = ip.octets();
    let [hi, lo] = bound_addr.port().to_be_bytes();

    [
        Version::SOCKS5 as u8,
        reply_code as u8,
        RSV,
        AddressType::IPv4 as u8,
        a,
        b,
        c,
        d,
        hi,
        lo,
    ]
}

/// send_reply writes an encoded reply to the client
pub async fn send_reply<S>(
    stream: &mut S,
    reply_code: ReplyCode,
    bound_addr: SocketAddr,
) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&encode_reply(reply_code, bound_addr)).await?;
    stream.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    #[test]
    fn encodes_ipv4_bound_address() {
        let reply = encode_reply(ReplyCode::Succeeded, "192.168.1.10:1080".parse().unwrap());

        assert_eq!(reply, [5, 0, 0, 1, 192, 168, 1, 10, 0x04, 0x38]);
    }

    #[test]
    fn carries_status_code() {
        let local: SocketAddr = "127.0.0.1:9".parse().unwrap();

        assert_eq!(encode_reply(ReplyCode::HostUnreachable, local)[1], 0x04);
        assert_eq!(encode_reply(ReplyCode::CommandNotSupported, local)[1], 0x07);
        assert_eq!(encode_reply(ReplyCode::AddrTypeNotSupported, local)[1], 0x08);
    }

    #[test]
    fn ipv6_bound_address_is_reported_as_ipv4() {
        let mapped = encode_reply(ReplyCode::Succeeded, "[::ffff:10.0.0.2]:80".parse().unwrap());
        assert_eq!(mapped, [5, 0, 0, 1, 10, 0, 0, 2, 0, 80]);

        let native = encode_reply(ReplyCode::Succeeded, "[2001:db8::1]:80".parse().unwrap());
        assert_eq!(native, [5, 0, 0, 1, 0, 0, 0, 0, 0, 80]);
    }

    #[tokio::test]
    async fn writes_reply_to_stream() {
        let mut stream = Builder::new()
            .write(&[5, 7, 0, 1, 127, 0, 0, 1, 0x04, 0x38])
            .build();

        send_reply(
            &mut stream,
            ReplyCode::CommandNotSupported,
            "127.0.0.1:1080".parse().unwrap(),
        )
        .await
        .unwrap();
    }
}
