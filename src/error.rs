//! Error taxonomy and server failure classification.
//!
//! Transport and protocol failures funnel through the session's error
//! signal into the control loop; [`classify_failure`] decides whether a
//! server `ERROR` line should block, limit, or allow reconnection.

use std::fmt;

use thiserror::Error;

/// Errors surfaced by the session engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed address or missing identity fields. Never retried.
    #[error("configuration error: {0}")]
    Config(String),

    /// TCP, proxy, or TLS connect failure.
    #[error("dial error: {0}")]
    Dial(String),

    /// SASL authentication was rejected or timed out.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// A classified `ERROR` line from the server.
    #[error("server failure ({kind}): {message}")]
    Protocol { kind: FailureKind, message: String },

    /// Sentinel reported on the error signal when the caller requested
    /// the disconnect, so a supervising loop can tell voluntary from
    /// involuntary termination.
    #[error("disconnect requested")]
    Disconnected,

    /// Transport i/o failure, including read/write deadline expiry.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// An operation that needs a live connection was called without one.
    #[error("not connected")]
    NotConnected,
}

pub type Result<T> = std::result::Result<T, Error>;

/// The parser rejected a wire line. Logged and dropped by the reader,
/// never fatal to the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("malformed line from server")]
pub struct ParseError;

/// Category of a server-initiated `ERROR`, driving the reconnect policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Temporary trouble; reconnection is allowed (and rate-capped).
    Recoverable,
    /// Bans, throttling, access denial; reconnecting would be abuse.
    Permanent,
    /// Server-side resource limits (connection/host/clone caps).
    Server,
    /// Network connectivity loss.
    Network,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureKind::Recoverable => "recoverable",
            FailureKind::Permanent => "permanent",
            FailureKind::Server => "server",
            FailureKind::Network => "network",
        })
    }
}

const PERMANENT_PATTERNS: &[&str] = &[
    "k-lined",
    "k-line",
    "klined",
    "g-lined",
    "g-line",
    "glined",
    "banned",
    "you are banned",
    "user is banned",
    "unauthorized connection",
    "connection refused",
    "access denied",
    "you are not authorized",
    "blacklisted",
    "throttled",
    "throttling",
    "flood",
    "flooding",
    "spam",
    "spamming",
];

const SERVER_PATTERNS: &[&str] = &[
    "too many connections",
    "too many host connections",
    "too many global connections",
    "connection limit exceeded",
    "server full",
    "max connections reached",
    "too many connections from this ip",
    "too many connections from your host",
    "connection limit",
    "host limit",
    "ip limit",
    "clone limit",
    "too many clones",
];

const NETWORK_PATTERNS: &[&str] = &[
    "connection reset",
    "connection timed out",
    "network unreachable",
    "no route to host",
    "connection lost",
    "broken pipe",
];

/// Categorize the free-text payload of a server `ERROR` line.
///
/// Pattern families are checked in order. Explicit soft-failure phrases
/// (registration timeout, ping timeout, server shutdown/restart) and
/// anything unmatched land in [`FailureKind::Recoverable`]: unknown
/// failures are more likely to be temporary than permanent.
pub fn classify_failure(message: &str) -> FailureKind {
    let lower = message.to_lowercase();
    let matches = |patterns: &[&str]| patterns.iter().any(|p| lower.contains(p));

    if matches(PERMANENT_PATTERNS) {
        FailureKind::Permanent
    } else if matches(SERVER_PATTERNS) {
        FailureKind::Server
    } else if matches(NETWORK_PATTERNS) {
        FailureKind::Network
    } else {
        FailureKind::Recoverable
    }
}
