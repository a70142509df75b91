use crate::address::{TargetAddr, read_target_address};
use crate::config::{BindPolicy, Config, UdpMode};
use crate::connector::{Dialer, Transport, Upstream, connect_target};
use crate::error::{Error, ProtocolError};
use crate::protocol::{Command, ReplyCode, Version};
use crate::reply::send_reply;
use crate::udp::UdpAssociation;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tracing::{debug, info, warn};

/// Dispatch is what a request leaves the session with
pub enum Dispatch {
    /// Outbound connection established and acknowledged, ready to relay
    Relay(Upstream),
    /// RFC 1928 UDP relay, acknowledged
    Associate(UdpAssociation),
    /// Unimplemented command left without reply
    Inert,
}

/// RequestContext carries what the command handlers need besides the
/// client stream
pub struct RequestContext<'a, D> {
    /// Server side of the client connection, announced in replies
    pub local_addr: SocketAddr,
    pub peer_addr: SocketAddr,
    pub config: &'a Config,
    pub dialer: &'a D,
}

/// handle_socks_request reads the request header and routes the stream to
/// the appropriate command handler
///
/// Routing looks at the command byte only. A header that cannot be read
/// ends the session without a reply.
pub async fn handle_socks_request<S, D>(
    stream: &mut S,
    ctx: &RequestContext<'_, D>,
) -> Result<Dispatch, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
    D: Dialer,
{
    // SOCKS5 request format
    // +----+-----+-------+------+----------+----------+
    // |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
    // +----+-----+-------+------+----------+----------+
    // | 1  |  1  | X'00' |  1   | Variable |    2     |
    // +----+-----+-------+------+----------+----------+

    // Instantiate a request buffer & read
    let mut reqbuf = [0u8; 3];
    within(ctx.config.handshake_timeout, async {
        stream.read_exact(&mut reqbuf).await?;
        Ok::<_, Error>(())
    })
    .await?;

    // Parse
    let version = reqbuf[0];
    let command = reqbuf[1];
    // Not retrieving RSV (RESERVED) -> 0x00

    if version != Version::SOCKS5 as u8 {
        debug!("request header carries version {version}, routing on command anyway");
    }

    // Check command and route
    match Command::from_byte(command) {
        Some(Command::Connect) => handle_connect_cmd(stream, ctx).await.map(Dispatch::Relay),
        Some(Command::Bind) => handle_bind_cmd(stream, ctx).await,
        Some(Command::UdpAssociate) => handle_udpassociate_cmd(stream, ctx).await,
        None => reject(stream, Error::UnsupportedCommand(command), ctx.local_addr).await,
    }
}

// ================
// CONNECT COMMAND
// ================

/// handle_connect_cmd parses the target of a CONNECT request and dials it
async fn handle_connect_cmd<S, D>(
    stream: &mut S,
    ctx: &RequestContext<'_, D>,
) -> Result<Upstream, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
    D: Dialer,
{
    // Retrieve target from request
    let target = read_target(stream, ctx).await?;

    // DEBUG
    info!("CONNECT {}", target);

    connect_target(
        stream,
        ctx.dialer,
        &target,
        Transport::Stream,
        ctx.config.connect_timeout,
        ctx.local_addr,
    )
    .await
}

// =============
// BIND COMMAND
// =============

/// handle_bind_cmd answers BIND according to the configured policy; passive
/// mode itself is not implemented
async fn handle_bind_cmd<S, D>(stream: &mut S, ctx: &RequestContext<'_, D>) -> Result<Dispatch, Error>
where
    S: AsyncWrite + Unpin,
{
    match ctx.config.bind_policy {
        BindPolicy::Silent => {
            warn!("BIND not implemented: leaving connection without reply");
            Ok(Dispatch::Inert)
        }
        BindPolicy::Reject => {
            reject(stream, Error::UnsupportedCommand(Command::Bind as u8), ctx.local_addr).await
        }
    }
}

// ===============
// UDP ASSOCIATE
// ===============

/// handle_udpassociate_cmd serves UDP ASSOCIATE in the configured mode
async fn handle_udpassociate_cmd<S, D>(
    stream: &mut S,
    ctx: &RequestContext<'_, D>,
) -> Result<Dispatch, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
    D: Dialer,
{
    info!("UDP ASSOCIATE");

    match ctx.config.udp_mode {
        UdpMode::Legacy => {
            // +----+------+------+----------+----------+
            // |RSV | FRAG | ATYP | DST.ADDR | DST.PORT |
            // +----+------+------+----------+----------+
            // | 2  |  1   |  1   | Variable |    2     |
            // +----+------+------+----------+----------+
            let mut prefix = [0u8; 3];
            within(ctx.config.handshake_timeout, async {
                stream.read_exact(&mut prefix).await?;
                Ok::<_, Error>(())
            })
            .await?;

            // Fragments are not reassembled; carry on regardless
            if prefix[2] != 0 {
                warn!("does not support fragmentation (FRAG {})", prefix[2]);
            }

            let target = read_target(stream, ctx).await?;
            let upstream = connect_target(
                stream,
                ctx.dialer,
                &target,
                Transport::Datagram,
                ctx.config.connect_timeout,
                ctx.local_addr,
            )
            .await?;

            Ok(Dispatch::Relay(upstream))
        }
        UdpMode::Rfc1928 => {
            // DST.ADDR/DST.PORT name where the client will send from; the
            // relay trusts the control connection's peer IP instead
            let expected = read_target(stream, ctx).await?;
            debug!("client expects to send from {}", expected);

            let association = match UdpAssociation::bind(ctx.local_addr, ctx.peer_addr).await {
                Ok(association) => association,
                Err(e) => return reject(stream, Error::UdpRelay(e), ctx.local_addr).await,
            };

            // Send OK reply naming the relay socket
            send_reply(stream, ReplyCode::Succeeded, association.relay_addr()).await?;

            Ok(Dispatch::Associate(association))
        }
    }
}

// =========
// HELPERS
// =========

/// read_target reads DST.ADDR and DST.PORT, answering
/// `addrTypeNotSupported` for an unknown address type
async fn read_target<S, D>(stream: &mut S, ctx: &RequestContext<'_, D>) -> Result<TargetAddr, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match within(ctx.config.handshake_timeout, read_target_address(stream)).await {
        Err(e @ Error::AddressType(_)) => reject(stream, e, ctx.local_addr).await,
        other => other,
    }
}

/// reject announces err's reply code, if it has one, and fails with err
async fn reject<S, T>(stream: &mut S, err: Error, local_addr: SocketAddr) -> Result<T, Error>
where
    S: AsyncWrite + Unpin,
{
    if let Some(reply_code) = err.reply_code() {
        // The session ends either way; a failed write changes nothing
        if let Err(e) = send_reply(stream, reply_code, local_addr).await {
            debug!("could not send {:?} reply: {}", reply_code, e);
        }
    }
    Err(err)
}

/// within bounds a client read by the handshake timeout, when one is set
pub(crate) async fn within<F, T>(limit: Option<Duration>, fut: F) -> Result<T, Error>
where
    F: Future<Output = Result<T, Error>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| Error::from(ProtocolError::Timeout))?,
        None => fut.await,
    }
}
