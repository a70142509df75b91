use crate::address::{Host, TargetAddr, parse_address_from_packet};
use crate::error::Error;
use crate::protocol::{CONNECT_TIMEOUT_SECS, MAX_DGRAM, RSV};
use anyhow::{Result, anyhow, bail};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    net::UdpSocket,
    select,
    task::JoinSet,
    time::Instant,
};
use tracing::{Instrument, debug, info, warn};

/// LOOKUP_TIMEOUT bounds name resolution for a single datagram
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(CONNECT_TIMEOUT_SECS);

/// UdpAssociation relays datagrams for one UDP ASSOCIATE request
///
/// The client sends to the relay socket with a SOCKS5 UDP header in front
/// of every payload. Payloads go out to their targets from a separate
/// outbound socket; answers come back with a header naming their source.
/// The association lives as long as its TCP control connection.
pub struct UdpAssociation {
    relay_socket: UdpSocket,
    relay_addr: SocketAddr,
    peer_addr: SocketAddr,
}

/// UdpAssociation implementation block
impl UdpAssociation {
    /// bind opens the relay socket on the control connection's local IP
    pub async fn bind(local_addr: SocketAddr, peer_addr: SocketAddr) -> std::io::Result<Self> {
        let relay_socket = UdpSocket::bind(SocketAddr::new(local_addr.ip(), 0)).await?;
        let relay_addr = relay_socket.local_addr()?;

        Ok(Self {
            relay_socket,
            relay_addr,
            peer_addr,
        })
    }

    /// relay_addr is the address announced to the client in the reply
    pub fn relay_addr(&self) -> SocketAddr {
        self.relay_addr
    }

    /// run relays datagrams until the control connection closes or nothing
    /// moves for the idle period
    pub async fn run<S>(self, control: &mut S, idle: Option<Duration>) -> Result<(), Error>
    where
        S: AsyncRead + Unpin,
    {
        // Outbound socket shares the relay socket's address family
        let unspecified = match self.relay_addr.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let outbound = UdpSocket::bind(SocketAddr::new(unspecified, 0))
            .await
            .map_err(Error::UdpRelay)?;
        let outbound = Arc::new(outbound);

        // DEBUG
        info!(
            "UDP relay started: listening on {}, sending from {:?}",
            self.relay_addr,
            outbound.local_addr()
        );

        // Client address is learned from the first accepted datagram
        let mut client_addr: Option<SocketAddr> = None;
        let mut probe = [0u8; 64];
        let mut from_client = vec![0u8; MAX_DGRAM];
        let mut from_target = vec![0u8; MAX_DGRAM];
        let mut last_activity = Instant::now();

        // Datagrams waiting on name resolution; aborted when the loop ends
        let mut lookups = JoinSet::new();

        loop {
            let idle_deadline = idle.map(|limit| last_activity + limit);
            let idle_expired = async move {
                match idle_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            select! {
                // The TCP connection is the association's liveness signal
                read = control.read(&mut probe) => {
                    match read {
                        Ok(0) => {
                            info!("client disconnected: terminating UDP association");
                            break;
                        }
                        Ok(n) => debug!("ignoring {n} bytes on control connection"),
                        Err(e) => return Err(Error::Relay(e)),
                    }
                }

                // Client -> target
                received = self.relay_socket.recv_from(&mut from_client) => {
                    let (len, from) = received.map_err(Error::Relay)?;

                    // Client IP address must match the control connection
                    if from.ip() != self.peer_addr.ip() {
                        warn!("rejected UDP from unauthorized client: {from}");
                        continue;
                    }
                    client_addr = Some(from);
                    last_activity = Instant::now();

                    match parse_datagram(&from_client[..len]) {
                        Err(e) => warn!("dropping datagram from {from}: {e}"),
                        Ok((target, data)) if matches!(target.host, Host::Domain(_)) => {
                            let outbound = Arc::clone(&outbound);
                            let data = data.to_vec();
                            lookups.spawn(
                                async move {
                                    let sent = tokio::time::timeout(
                                        LOOKUP_TIMEOUT,
                                        send_to_target(&outbound, &target, &data),
                                    )
                                    .await
                                    .unwrap_or_else(|_| Err(anyhow!("lookup of {target} timed out")));
                                    if let Err(e) = sent {
                                        warn!("dropping datagram from {from}: {e}");
                                    }
                                }
                                .in_current_span(),
                            );
                        }
                        Ok((target, data)) => {
                            if let Err(e) = send_to_target(&outbound, &target, data).await {
                                warn!("dropping datagram from {from}: {e}");
                            }
                        }
                    }
                }

                // Reap finished lookups
                Some(_) = lookups.join_next(), if !lookups.is_empty() => {}

                // Target -> client
                received = outbound.recv_from(&mut from_target) => {
                    let (len, from) = received.map_err(Error::Relay)?;
                    let Some(client) = client_addr else {
                        debug!("no client yet, dropping {len} bytes from {from}");
                        continue;
                    };
                    last_activity = Instant::now();

                    let packet = encode_datagram(from, &from_target[..len]);
                    self.relay_socket
                        .send_to(&packet, client)
                        .await
                        .map_err(Error::Relay)?;

                    // DEBUG
                    debug!("sent {len} bytes from {from} to client {client}");
                }

                _ = idle_expired => {
                    info!("UDP association idle: terminating");
                    break;
                }
            }
        }

        Ok(())
    }
}

/// parse_datagram splits a client datagram into its destination and
/// payload
fn parse_datagram(packet: &[u8]) -> Result<(TargetAddr, &[u8])> {
    // SOCKS5 UDP Request Header
    // +----+------+------+----------+----------+----------+
    // |RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
    // +----+------+------+----------+----------+----------+
    // | 2  |  1   |  1   | Variable |    2     | Variable |
    // +----+------+------+----------+----------+----------+
    if packet.len() < 4 {
        bail!("UDP packet too short");
    }

    if packet[2] != 0x00 {
        bail!("does not support fragmentation (FRAG {})", packet[2]);
    }

    let (target, consumed) = parse_address_from_packet(packet, 3)?;
    Ok((target, &packet[3 + consumed..]))
}

/// send_to_target resolves target and sends data from the outbound socket
async fn send_to_target(outbound: &UdpSocket, target: &TargetAddr, data: &[u8]) -> Result<()> {
    // Pick a destination the outbound socket can reach
    let want_v4 = outbound.local_addr()?.is_ipv4();
    let destination = target
        .resolve()
        .await?
        .into_iter()
        .find(|addr| addr.is_ipv4() == want_v4)
        .ok_or_else(|| anyhow!("no usable address for {target}"))?;

    outbound.send_to(data, destination).await?;

    // DEBUG
    debug!("forwarded {} bytes to {destination}", data.len());

    Ok(())
}

/// encode_datagram wraps a target's answer in the SOCKS5 UDP header
fn encode_datagram(from: SocketAddr, data: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(data.len() + 22);

    // RSV -> 2 bytes, FRAG -> single byte
    packet.extend_from_slice(&[RSV, RSV, 0x00]);
    TargetAddr::from(from).write_to(&mut packet);
    packet.extend_from_slice(data);

    packet
}
