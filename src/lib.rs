//! Event-driven IRC client library.
//!
//! One [`Session`] maintains a logical identity against a server across
//! network failures, protocol rejections and capability negotiation.
//! Parsed wire lines are fanned out to registered async callbacks; a
//! three-state nickname machine keeps the client's identity in step
//! with the server's view of it, and a failure classifier decides when
//! a dropped connection is worth re-dialing.
//!
//! Supports plaintext and TLS connections, SOCKS/HTTP proxies, IRCv3
//! capability negotiation with SASL (`PLAIN`/`EXTERNAL`), standard CTCP
//! replies, and direct peer chats (DCC CHAT).
//!
//! ```rust,no_run
//! use ircline::Session;
//!
//! # async fn example() -> ircline::Result<()> {
//! let mut session = Session::new("mybot", "mybot").expect("non-empty identity");
//! session.config.use_tls = true;
//! session.add_callback("PRIVMSG", |handle, event| {
//!     Box::pin(async move {
//!         tracing::info!(from = %event.nick, text = %event.message(), "message");
//!         let _ = handle;
//!         Ok(())
//!     })
//! });
//! session.connect("irc.libera.chat:6697").await?;
//! session.run().await; // reconnects until quit or a permanent failure
//! # Ok(())
//! # }
//! ```

mod config;
mod dispatch;
mod error;
mod handshake;
mod identity;
mod message;
mod peer;
mod session;
mod transport;

pub use config::{Config, ProxyConfig, ProxyKind, VERSION};
pub use dispatch::{BoxFuture, CallbackId};
pub use error::{Error, FailureKind, ParseError, Result, classify_failure};
pub use identity::NickStatus;
pub use message::Event;
pub use session::{Session, SessionHandle};
