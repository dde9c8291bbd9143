//! Session configuration.
//!
//! All fields are plain settable values; mutate them on the [`Session`]
//! before calling `connect`. Per-connection snapshots are taken at dial
//! time, so changes made while connected apply to the next (re)connect.
//!
//! [`Session`]: crate::Session

use std::net::IpAddr;
use std::time::Duration;

/// Client version string, used in the default CTCP VERSION reply.
pub const VERSION: &str = concat!("ircline v", env!("CARGO_PKG_VERSION"));

/// Configuration for a [`Session`](crate::Session).
#[derive(Debug, Clone)]
pub struct Config {
    /// Use TLS. Auto-enabled when the address ends in `:6697`.
    pub use_tls: bool,
    /// Skip TLS certificate verification (for self-signed certs).
    pub tls_insecure: bool,
    /// Tunnel the connection through a proxy instead of dialing direct.
    pub proxy: Option<ProxyConfig>,
    /// Local address to bind when dialing direct.
    pub local_ip: Option<IpAddr>,
    /// Server password, sent as `PASS` before registration.
    pub server_password: Option<String>,
    /// `WEBIRC` payload, sent first when set (gateway deployments).
    pub webirc: Option<String>,
    /// Real name for registration; falls back to the username when empty.
    pub realname: String,
    /// Version string for the default CTCP VERSION reply.
    pub version: String,
    /// Message attached to `QUIT`.
    pub quit_message: String,
    /// Write deadline, and the base of the read deadline.
    pub timeout: Duration,
    /// How often the unconditional liveness probe fires. Also paces the
    /// desired-nickname reconciliation check.
    pub ping_frequency: Duration,
    /// Quiet period after which the idle monitor sends a probe.
    pub keep_alive: Duration,
    /// IRCv3 capabilities to request when the server offers them.
    pub request_caps: Vec<String>,
    /// Run SASL authentication during capability negotiation.
    pub use_sasl: bool,
    /// SASL authentication identity.
    pub sasl_login: String,
    /// SASL password.
    pub sasl_password: String,
    /// SASL mechanism, `PLAIN` (default) or `EXTERNAL`.
    pub sasl_mechanism: String,
    /// Upper bound on a single event's handler fan-out; handlers still
    /// running when it elapses are abandoned. `None` waits indefinitely.
    pub callback_timeout: Option<Duration>,
    /// Cap on consecutive reconnects after recoverable server failures.
    /// `0` means unlimited.
    pub max_recoverable_reconnects: u32,
    /// Sleep between failed reconnect attempts.
    pub reconnect_cooldown: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            use_tls: false,
            tls_insecure: false,
            proxy: None,
            local_ip: None,
            server_password: None,
            webirc: None,
            realname: String::new(),
            version: VERSION.to_string(),
            quit_message: String::new(),
            timeout: Duration::from_secs(60),
            ping_frequency: Duration::from_secs(15 * 60),
            keep_alive: Duration::from_secs(4 * 60),
            request_caps: Vec::new(),
            use_sasl: false,
            sasl_login: String::new(),
            sasl_password: String::new(),
            sasl_mechanism: "PLAIN".to_string(),
            callback_timeout: None,
            max_recoverable_reconnects: 3,
            reconnect_cooldown: Duration::from_secs(60),
        }
    }
}

/// Proxy tunnel settings.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub kind: ProxyKind,
    /// Proxy address as `host:port`.
    pub address: String,
    /// Credentials; empty username means unauthenticated.
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    Socks4,
    Socks5,
    Http,
}
