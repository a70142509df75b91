use crate::{
    config::Config,
    connector::{Dialer, TokioDialer},
    session::Session,
};
use anyhow::{Result, anyhow, bail};
use std::{future::Future, net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tracing::{Instrument, debug, info, info_span};

/// Socks5Server represents a SOCKS5 server and houses related
/// configuration data
pub struct Socks5Server<D = TokioDialer> {
    pub listen_addr: String,
    pub config: Arc<Config>,
    dialer: Arc<D>,
    listener: Option<TcpListener>,
}

/// Socks5Server constructor block
impl Socks5Server<TokioDialer> {
    /// new is a constructor for the Socks5Server type
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            config: Arc::new(Config::default()),
            dialer: Arc::new(TokioDialer),
            listener: None,
        }
    }
}

/// Socks5Server implementation block
impl<D: Dialer> Socks5Server<D> {
    /// with_config applies the per-session policy
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Arc::new(config);
        self
    }

    /// with_dialer swaps the way outbound connections are opened
    pub fn with_dialer<E: Dialer>(self, dialer: E) -> Socks5Server<E> {
        Socks5Server {
            listen_addr: self.listen_addr,
            config: self.config,
            dialer: Arc::new(dialer),
            listener: self.listener,
        }
    }

    /// bind to the listen address; fails when called twice
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        if self.listener.is_some() {
            bail!("bind can only be called once");
        }

        // Instantiate tokio listener
        let listener = TcpListener::bind(&self.listen_addr).await?;
        let addr = listener.local_addr()?;

        // DEBUG
        info!("SOCKS5 proxy listening on {:?}", addr);

        self.listener = Some(listener);
        Ok(addr)
    }

    /// local_addr is the bound listener address, once bound
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// run handles server spinup and listens for incoming connections
    pub async fn run(&mut self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// run_until accepts connections until shutdown completes. Sessions
    /// already running are left to finish on their own.
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        if self.listener.is_none() {
            self.bind().await?;
        }
        let listener = self
            .listener
            .take()
            .ok_or_else(|| anyhow!("listener missing after bind"))?;
        tokio::pin!(shutdown);

        // Listen for connections to proxy
        loop {
            // Accept incoming connection
            let (inbound, peer_addr) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = &mut shutdown => {
                    info!("shutting down listener");
                    return Ok(());
                }
            };
            let local_addr = inbound.local_addr()?;

            // Clone for this connection
            let session = Session::new(
                inbound,
                local_addr,
                peer_addr,
                Arc::clone(&self.config),
                Arc::clone(&self.dialer),
            );

            // Spawn async task
            tokio::spawn(
                async move {
                    // DEBUG
                    debug!("new client");

                    // Failures are logged by the session itself
                    let _ = session.run().await;
                }
                .instrument(info_span!("session", peer = %peer_addr)),
            );
        }
    }
}
