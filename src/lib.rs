//! A lightweight SOCKS5 proxy library
//!
//! ## SOCKS5 Implementation
//!
//! - Features:
//!     - CONNECT
//!     - UDP ASSOCIATE, either as a byte relay over a connected datagram
//!       socket or as a per-datagram RFC 1928 relay
//!     - No Authentication
//!     - BIND answered by policy: left without reply, or rejected
//!     - Async using tokio, one task per client connection
//!     - Bounded outbound dials, optional handshake and idle timeouts
//! - [SOCKS5 (RFC 1928)](https://datatracker.ietf.org/doc/html/rfc1928)
//!
//! # Example
//! ```no_run
//! use minisocks::Socks5Server;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut server = Socks5Server::new("127.0.0.1:1080");
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod address;
pub mod auth;
pub mod commands;
pub mod config;
pub mod connector;
pub mod error;
pub mod protocol;
pub mod relay;
pub mod reply;
pub mod server;
pub mod session;
pub mod udp;

// Re-export main types at crate root for convenience
pub use address::{Host, TargetAddr};
pub use config::{BindPolicy, Config, UdpMode};
pub use connector::{Dialer, TokioDialer, Transport, Upstream};
pub use error::{Error, ProtocolError};
pub use protocol::{AddressType, AuthMethod, Command, ReplyCode, Version};
pub use server::Socks5Server;
pub use session::Session;
