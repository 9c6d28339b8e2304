//! Configuration for the event bus.

use std::time::Duration;

/// Environment key overriding the advertised host.
pub const PUBLIC_HOST_KEY: &str = "cluster.public.host";

/// Environment key overriding the advertised port.
pub const PUBLIC_PORT_KEY: &str = "cluster.public.port";

/// Configuration for a clustered event bus instance.
///
/// The listener binds `host:port`; the identity advertised to peers is
/// `public_host:public_port` when set, otherwise the configured host and
/// the actual bound port (so `port = 0` works with ephemeral ports).
#[derive(Clone, Debug)]
pub struct BusConfig {
    /// Address the inbound listener binds.
    pub host: String,

    /// Port the inbound listener binds. `0` picks an ephemeral port.
    pub port: u16,

    /// Operator-supplied host advertised to peers instead of `host`.
    pub public_host: Option<String>,

    /// Operator-supplied port advertised to peers instead of the bound port.
    pub public_port: Option<u16>,

    /// Interval between liveness pings on each pooled connection.
    pub ping_interval: Duration,

    /// How long to wait for a pong (any inbound byte) before declaring a
    /// pooled connection dead.
    pub ping_reply_interval: Duration,

    /// Timeout for establishing an outbound connection.
    ///
    /// Generous by default: a node creating many connections at once can
    /// take a while to get through them.
    pub connect_timeout: Duration,

    /// Reply timeout applied to sends that do not specify their own.
    /// `None` means reply handlers wait indefinitely.
    pub default_reply_timeout: Option<Duration>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            public_host: None,
            public_port: None,
            ping_interval: Duration::from_secs(20),
            ping_reply_interval: Duration::from_secs(20),
            connect_timeout: Duration::from_secs(60),
            default_reply_timeout: None,
        }
    }
}

impl BusConfig {
    /// Default configuration with the public-identity overrides read from
    /// the process environment (`cluster.public.host`,
    /// `cluster.public.port`).
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(host) = std::env::var(PUBLIC_HOST_KEY) {
            if !host.is_empty() {
                config.public_host = Some(host);
            }
        }
        if let Ok(port) = std::env::var(PUBLIC_PORT_KEY) {
            if let Ok(port) = port.parse() {
                config.public_port = Some(port);
            }
        }
        config
    }

    /// Configuration tuned for loopback clusters: aggressive ping timing so
    /// dead peers are detected quickly.
    pub fn local_network() -> Self {
        Self {
            ping_interval: Duration::from_millis(500),
            ping_reply_interval: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(1),
            ..Self::default()
        }
    }

    /// Override the bind host.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Override the bind port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the default reply timeout.
    pub fn with_default_reply_timeout(mut self, timeout: Duration) -> Self {
        self.default_reply_timeout = Some(timeout);
        self
    }
}
