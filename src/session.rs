use crate::auth::negotiate_auth;
use crate::commands::{Dispatch, RequestContext, handle_socks_request, within};
use crate::config::Config;
use crate::connector::{Dialer, Upstream};
use crate::error::Error;
use crate::relay::{relay, relay_datagrams};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

/// SessionState is how far a session got through the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Negotiating,
    Requesting,
    Relaying,
}

/// Session owns one client connection from negotiation to teardown
pub struct Session<S, D> {
    stream: S,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    config: Arc<Config>,
    dialer: Arc<D>,
}

/// Session implementation block
impl<S, D> Session<S, D>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    D: Dialer,
{
    /// new wraps an accepted client stream; local_addr is the server side
    /// of that connection
    pub fn new(
        stream: S,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        config: Arc<Config>,
        dialer: Arc<D>,
    ) -> Self {
        Self {
            stream,
            local_addr,
            peer_addr,
            config,
            dialer,
        }
    }

    /// run drives the session to completion
    ///
    /// Any failure is logged once, here, and returned. The client stream and
    /// any upstream are closed on every exit path.
    pub async fn run(self) -> Result<(), Error> {
        let Session {
            mut stream,
            local_addr,
            peer_addr,
            config,
            dialer,
        } = self;
        let mut state = SessionState::Negotiating;

        let result = async {
            // Negotiate authentication with client
            within(config.handshake_timeout, negotiate_auth(&mut stream)).await?;
            state = SessionState::Requesting;

            // Handle connection request from client
            let ctx = RequestContext {
                local_addr,
                peer_addr,
                config: &config,
                dialer: &*dialer,
            };
            let dispatch = handle_socks_request(&mut stream, &ctx).await?;
            state = SessionState::Relaying;

            match dispatch {
                Dispatch::Relay(Upstream::Stream(outbound)) => {
                    relay(stream, outbound, config.idle_timeout).await?;
                }
                Dispatch::Relay(Upstream::Datagram(outbound)) => {
                    relay_datagrams(stream, outbound, config.idle_timeout).await?;
                }
                Dispatch::Associate(association) => {
                    association.run(&mut stream, config.idle_timeout).await?;
                }
                Dispatch::Inert => hold_open(stream, config.idle_timeout).await?,
            }

            Ok::<_, Error>(())
        }
        .await;

        match &result {
            Ok(()) => info!("connection closed"),
            Err(e) => warn!("session failed while {:?}: {}", state, e),
        }

        result
    }
}

/// hold_open keeps a connection that gets no reply until the client leaves,
/// discarding whatever it sends
async fn hold_open<S>(mut stream: S, idle: Option<Duration>) -> Result<(), Error>
where
    S: AsyncRead + Unpin,
{
    let mut sink = tokio::io::sink();
    let drain = tokio::io::copy(&mut stream, &mut sink);

    let drained = match idle {
        Some(limit) => tokio::time::timeout(limit, drain).await.map_err(|_| {
            Error::Relay(io::Error::new(io::ErrorKind::TimedOut, "no reply pending"))
        })?,
        None => drain.await,
    }
    .map_err(Error::Relay)?;

    // DEBUG
    debug!("client left after {} ignored bytes", drained);

    Ok(())
}
