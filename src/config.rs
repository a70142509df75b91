use crate::protocol::CONNECT_TIMEOUT_SECS;
use clap::ValueEnum;
use std::time::Duration;

/// BindPolicy decides what a BIND request gets, as passive mode is not
/// implemented
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum BindPolicy {
    /// No reply, no relay: the connection idles until the client hangs up
    #[default]
    Silent,
    /// Reply commandNotSupported and close
    Reject,
}

/// UdpMode selects how UDP ASSOCIATE is served
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum UdpMode {
    /// RSV/FRAG prefix on the control connection, then a byte relay over a
    /// connected datagram socket
    #[default]
    Legacy,
    /// Relay socket announced in the reply, per-datagram headers
    #[value(name = "rfc1928")]
    Rfc1928,
}

/// Config holds the per-session policy shared by every connection
#[derive(Debug, Clone)]
pub struct Config {
    /// Bound on every outbound dial
    pub connect_timeout: Duration,
    /// Bound on each client read during negotiation and request parsing
    pub handshake_timeout: Option<Duration>,
    /// Relay teardown after this long without traffic in either direction
    pub idle_timeout: Option<Duration>,
    pub bind_policy: BindPolicy,
    pub udp_mode: UdpMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            handshake_timeout: None,
            idle_timeout: None,
            bind_policy: BindPolicy::default(),
            udp_mode: UdpMode::default(),
        }
    }
}

/// Config implementation block
impl Config {
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_bind_policy(mut self, policy: BindPolicy) -> Self {
        self.bind_policy = policy;
        self
    }

    pub fn with_udp_mode(mut self, mode: UdpMode) -> Self {
        self.udp_mode = mode;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_behaviour() {
        let config = Config::default();

        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.handshake_timeout, None);
        assert_eq!(config.idle_timeout, None);
        assert_eq!(config.bind_policy, BindPolicy::Silent);
        assert_eq!(config.udp_mode, UdpMode::Legacy);
    }

    #[test]
    fn builders_override_fields() {
        let config = Config::default()
            .with_connect_timeout(Duration::from_millis(250))
            .with_handshake_timeout(Some(Duration::from_secs(5)))
            .with_idle_timeout(Some(Duration::from_secs(300)))
            .with_bind_policy(BindPolicy::Reject)
            .with_udp_mode(UdpMode::Rfc1928);

        assert_eq!(config.connect_timeout, Duration::from_millis(250));
        assert_eq!(config.handshake_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(300)));
        assert_eq!(config.bind_policy, BindPolicy::Reject);
        assert_eq!(config.udp_mode, UdpMode::Rfc1928);
    }

    #[test]
    fn cli_names() {
        assert_eq!(
            UdpMode::from_str("rfc1928", true).unwrap(),
            UdpMode::Rfc1928
        );
        assert_eq!(
            BindPolicy::from_str("reject", true).unwrap(),
            BindPolicy::Reject
        );
    }
}
