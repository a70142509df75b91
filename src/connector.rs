use crate::address::TargetAddr;
use crate::error::Error;
use crate::protocol::ReplyCode;
use crate::reply::send_reply;
use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, error, info};

/// Transport is the kind of outbound socket a command asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Stream,
    Datagram,
}

/// Upstream is an established outbound connection, owned by the relay
/// once handed over
#[derive(Debug)]
pub enum Upstream {
    Stream(TcpStream),
    Datagram(DatagramStream),
}

/// DatagramStream is a connected UdpSocket handed to the relay: each
/// client read goes out as one datagram and each datagram received is
/// written back to the client
#[derive(Debug)]
pub struct DatagramStream {
    socket: UdpSocket,
}

/// DatagramStream implementation block
impl DatagramStream {
    pub fn new(socket: UdpSocket) -> Self {
        Self { socket }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.socket.peer_addr()
    }

    /// recv waits for the next datagram; Ok(0) is an empty datagram
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.recv(buf).await
    }

    /// send writes buf as a single datagram
    pub async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.socket.send(buf).await
    }
}

/// Dialer opens outbound connections for the connector
pub trait Dialer: Send + Sync + 'static {
    fn dial(
        &self,
        target: &TargetAddr,
        transport: Transport,
    ) -> impl Future<Output = io::Result<Upstream>> + Send;
}

/// TokioDialer dials straight out with tokio sockets
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioDialer;

impl Dialer for TokioDialer {
    async fn dial(&self, target: &TargetAddr, transport: Transport) -> io::Result<Upstream> {
        let addrs = target.resolve().await?;
        match transport {
            Transport::Stream => {
                let stream = TcpStream::connect(addrs.as_slice()).await?;
                Ok(Upstream::Stream(stream))
            }
            Transport::Datagram => {
                let mut last_err = None;
                for addr in addrs {
                    match connect_datagram(addr).await {
                        Ok(socket) => return Ok(Upstream::Datagram(DatagramStream::new(socket))),
                        Err(e) => last_err = Some(e),
                    }
                }
                Err(last_err.unwrap_or_else(|| {
                    io::Error::new(io::ErrorKind::NotFound, "no address resolved")
                }))
            }
        }
    }
}

// connect_datagram binds an ephemeral socket of the target's family and
// connects it to the target
async fn connect_datagram(addr: SocketAddr) -> io::Result<UdpSocket> {
    let local: SocketAddr = match addr {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(addr).await?;
    Ok(socket)
}

/// connect_target dials target within timeout and tells the client how it
/// went
///
/// On success a `succeeded` reply naming local_addr is sent and the
/// upstream is returned to the caller. On failure or timeout a
/// `hostUnreachable` reply is sent instead and no outbound socket survives.
pub async fn connect_target<S, D>(
    stream: &mut S,
    dialer: &D,
    target: &TargetAddr,
    transport: Transport,
    timeout: Duration,
    local_addr: SocketAddr,
) -> Result<Upstream, Error>
where
    S: AsyncWrite + Unpin,
    D: Dialer,
{
    let dialed = match tokio::time::timeout(timeout, dialer.dial(target, transport)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("no connection within {timeout:?}"),
        )),
    };

    match dialed {
        Ok(upstream) => {
            // Send OK reply; upstream is dropped (and closed) if this fails
            send_reply(stream, ReplyCode::Succeeded, local_addr).await?;

            // DEBUG
            info!("connected to {} over {:?}", target, transport);

            Ok(upstream)
        }
        Err(e) => {
            error!("fail to connect to {}: {}", target, e);
            if let Err(reply_err) =
                send_reply(stream, ReplyCode::HostUnreachable, local_addr).await
            {
                debug!("could not send failure reply: {}", reply_err);
            }
            Err(Error::Connect {
                target: target.to_string(),
                source: e,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Host;
    use std::net::Ipv4Addr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_test::io::Builder;

    /// Never finishes dialing
    struct StalledDialer;

    impl Dialer for StalledDialer {
        async fn dial(&self, _target: &TargetAddr, _transport: Transport) -> io::Result<Upstream> {
            std::future::pending().await
        }
    }

    fn local() -> SocketAddr {
        "127.0.0.1:1080".parse().unwrap()
    }

    fn target(port: u16) -> TargetAddr {
        TargetAddr {
            host: Host::Ipv4(Ipv4Addr::LOCALHOST),
            port,
        }
    }

    #[tokio::test]
    async fn connects_and_replies_succeeded() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut client = Builder::new()
            .write(&[5, 0, 0, 1, 127, 0, 0, 1, 0x04, 0x38])
            .build();

        let upstream = connect_target(
            &mut client,
            &TokioDialer,
            &target(port),
            Transport::Stream,
            Duration::from_secs(10),
            local(),
        )
        .await
        .unwrap();

        let Upstream::Stream(mut outbound) = upstream else {
            panic!("expected a stream upstream");
        };
        let (mut accepted, _) = listener.accept().await.unwrap();
        outbound.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn refused_dial_replies_host_unreachable() {
        // Grab a free port, then close it
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut client = Builder::new()
            .write(&[5, 4, 0, 1, 127, 0, 0, 1, 0x04, 0x38])
            .build();

        let err = connect_target(
            &mut client,
            &TokioDialer,
            &target(port),
            Transport::Stream,
            Duration::from_secs(10),
            local(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Connect { .. }));
        assert_eq!(err.reply_code(), Some(ReplyCode::HostUnreachable));
    }

    #[tokio::test]
    async fn dial_failure_survives_unwritable_reply() {
        let mut client = Builder::new()
            .write_error(io::ErrorKind::BrokenPipe.into())
            .build();

        let err = connect_target(
            &mut client,
            &StalledDialer,
            &target(80),
            Transport::Stream,
            Duration::from_millis(20),
            local(),
        )
        .await
        .unwrap_err();

        match err {
            Error::Connect { target, source } => {
                assert_eq!(target, "127.0.0.1:80");
                assert_eq!(source.kind(), io::ErrorKind::TimedOut);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn stalled_dial_times_out() {
        let mut client = Builder::new()
            .write(&[5, 4, 0, 1, 127, 0, 0, 1, 0x04, 0x38])
            .build();

        let err = connect_target(
            &mut client,
            &StalledDialer,
            &target(80),
            Transport::Stream,
            Duration::from_millis(50),
            local(),
        )
        .await
        .unwrap_err();

        match err {
            Error::Connect { target, source } => {
                assert_eq!(target, "127.0.0.1:80");
                assert_eq!(source.kind(), io::ErrorKind::TimedOut);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn datagram_dial_is_connected() {
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();

        let upstream = TokioDialer
            .dial(&TargetAddr::from(echo_addr), Transport::Datagram)
            .await
            .unwrap();
        let Upstream::Datagram(datagrams) = upstream else {
            panic!("expected a datagram upstream");
        };
        assert_eq!(datagrams.peer_addr().unwrap(), echo_addr);

        datagrams.send(b"hello").await.unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = echo.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(from, datagrams.local_addr().unwrap());

        echo.send_to(b"world", from).await.unwrap();
        let n = datagrams.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"world");
    }
}
