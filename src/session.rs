//! The session aggregate: connection lifecycle, the concurrent I/O
//! pipeline, privileged protocol observers, and the reconnecting
//! control loop.
//!
//! One [`Session`] represents one logical identity against one server.
//! Per-connection resources (socket, outbound queue, shutdown signal,
//! error signal, workers) are created by [`Session::connect`] and torn
//! down on disconnect or reconnect; the session itself persists across
//! reconnects, carrying the desired identity and callback registrations
//! forward.
//!
//! Three workers run per live connection: a reader (lines → parser →
//! observers → dispatch), a writer (outbound queue → socket), and a
//! keep-alive worker (idle monitor + unconditional probe + nickname
//! reconciliation). They block only on socket I/O with a deadline, the
//! outbound queue, or the shutdown signal — never on each other.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rand::Rng;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::dispatch::{self, BoxFuture, CallbackId, Registry};
use crate::error::{Error, FailureKind, Result, classify_failure};
use crate::handshake::{CAP_TIMEOUT, Handshake, REGISTRATION_FALLBACK, SaslOutcome};
use crate::identity::{Identity, NickStatus};
use crate::message::Event;
use crate::peer::PeerChats;
use crate::transport::{self, Transport};

/// Cadence of the idle monitor that backs the keep-alive window.
const MONITOR_PERIOD: Duration = Duration::from_secs(60);

/// A persistent-connection IRC client session.
///
/// ```rust,no_run
/// use ircline::Session;
///
/// # async fn example() -> ircline::Result<()> {
/// let mut session = Session::new("mybot", "mybot").expect("non-empty identity");
/// session.config.request_caps = vec!["message-tags".into()];
/// session.add_callback("PRIVMSG", |handle, event| {
///     Box::pin(async move {
///         handle.privmsg(&event.arguments[0], "hello yourself").await?;
///         Ok(())
///     })
/// });
/// session.connect("irc.example.org:6697").await?;
/// session.run().await;
/// # Ok(())
/// # }
/// ```
pub struct Session {
    /// Plain settable configuration; snapshotted at each connect.
    pub config: Config,
    shared: Arc<Shared>,
    handle: SessionHandle,
}

/// Cloneable facade over a session, handed to callbacks. Sends go to
/// the connection that is live at call time.
#[derive(Clone)]
pub struct SessionHandle {
    pub(crate) shared: Arc<Shared>,
}

pub(crate) struct Shared {
    pub(crate) state: Mutex<SessionState>,
    pub(crate) registry: Registry,
    pub(crate) peers: Arc<PeerChats>,
}

pub(crate) struct SessionState {
    user: String,
    server: String,
    /// Configuration snapshot for the live connection.
    params: Config,
    identity: Identity,
    handshake: Handshake,
    outbound: Option<mpsc::Sender<String>>,
    errors: Option<mpsc::Sender<Error>>,
    error_rx: Option<mpsc::Receiver<Error>>,
    shutdown: Option<watch::Sender<bool>>,
    workers: Vec<JoinHandle<()>>,
    sasl_waiter: Option<oneshot::Sender<std::result::Result<(), String>>>,
    last_activity: Instant,
    quitting: bool,
    stopped: bool,
    /// Bumped on every connect and teardown; lets the handshake
    /// watchdog notice it outlived its connection.
    epoch: u64,
}

impl Session {
    /// Create a session with the desired nickname and username.
    /// Returns `None` when either is empty.
    pub fn new(nick: &str, user: &str) -> Option<Session> {
        if nick.is_empty() || user.is_empty() {
            return None;
        }
        let config = Config::default();
        let shared = Arc::new(Shared {
            state: Mutex::new(SessionState {
                user: user.to_string(),
                server: String::new(),
                params: config.clone(),
                identity: Identity::new(nick),
                handshake: Handshake::new(&config),
                outbound: None,
                errors: None,
                error_rx: None,
                shutdown: None,
                workers: Vec::new(),
                sasl_waiter: None,
                last_activity: Instant::now(),
                quitting: false,
                stopped: true,
                epoch: 0,
            }),
            registry: Registry::new(),
            peers: Arc::new(PeerChats::new()),
        });
        let handle = SessionHandle {
            shared: Arc::clone(&shared),
        };
        let session = Session {
            config,
            shared,
            handle,
        };
        session.install_default_callbacks();
        Some(session)
    }

    /// A cloneable handle for use outside the session's owner (the same
    /// handle is passed to every callback).
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Dial the server and start the I/O pipeline.
    ///
    /// Resets all per-connection state, spawns the workers, kicks off
    /// capability negotiation (or immediate registration), and — when
    /// SASL is enabled — waits for the authentication outcome, failing
    /// with [`Error::Auth`] on rejection or timeout.
    pub async fn connect(&self, server: &str) -> Result<()> {
        {
            let st = self.shared.state.lock();
            if !st.workers.is_empty() {
                return Err(Error::Config("already connected".to_string()));
            }
            if st.user.is_empty() || st.identity.desired().is_empty() {
                return Err(Error::Config("empty nick or user".to_string()));
            }
        }

        let config = self.config.clone();
        let transport = transport::dial(&config, server).await?;
        tracing::info!(server, "connected");

        let (out_tx, out_rx) = mpsc::channel::<String>(64);
        let (err_tx, err_rx) = mpsc::channel::<Error>(16);
        let (shut_tx, shut_rx) = watch::channel(false);

        let (initial_lines, sasl_rx, epoch) = {
            let mut st = self.shared.state.lock();
            st.server = server.to_string();
            st.params = config.clone();
            st.identity.reset_connection();
            st.handshake = Handshake::new(&st.params);
            st.outbound = Some(out_tx.clone());
            st.errors = Some(err_tx);
            st.error_rx = Some(err_rx);
            st.shutdown = Some(shut_tx);
            st.last_activity = Instant::now();
            st.quitting = false;
            st.stopped = false;
            st.epoch += 1;

            let mut lines = Vec::new();
            if let Some(webirc) = &st.params.webirc {
                lines.push(format!("WEBIRC {webirc}"));
            }
            if let Some(password) = &st.params.server_password {
                lines.push(format!("PASS {password}"));
            }
            let (handshake_lines, register_now) = st.handshake.begin();
            lines.extend(handshake_lines);
            if register_now {
                lines.extend(registration_lines(&mut st));
            }

            let sasl_rx = if st.params.use_sasl {
                let (tx, rx) = oneshot::channel();
                st.sasl_waiter = Some(tx);
                Some(rx)
            } else {
                None
            };
            (lines, sasl_rx, st.epoch)
        };

        self.spawn_pipeline(transport, out_rx, shut_rx, &config);
        self.spawn_handshake_watchdog(epoch);

        for line in initial_lines {
            let _ = out_tx.send(format!("{line}\r\n")).await;
        }

        if let Some(rx) = sasl_rx {
            let outcome = tokio::time::timeout(CAP_TIMEOUT, rx).await;
            let failure = match outcome {
                Ok(Ok(Ok(()))) => None,
                Ok(Ok(Err(reason))) => Some(reason),
                Ok(Err(_)) => Some("connection closed during authentication".to_string()),
                Err(_) => Some("SASL negotiation timed out".to_string()),
            };
            if let Some(reason) = failure {
                self.teardown().await;
                return Err(Error::Auth(reason));
            }
        }
        Ok(())
    }

    /// Stop the workers, close the outbound queue and socket, and
    /// report the voluntary-disconnect sentinel on the error signal.
    pub async fn disconnect(&self) {
        if let Some(err_tx) = self.teardown().await {
            let _ = err_tx.send(Error::Disconnected).await;
        }
    }

    /// Disconnect-semantics followed by a fresh connect to the stored
    /// address.
    pub async fn reconnect(&self) -> Result<()> {
        let server = self.shared.state.lock().server.clone();
        if server.is_empty() {
            return Err(Error::NotConnected);
        }
        self.teardown().await;
        self.connect(&server).await
    }

    /// Whether the session currently holds a live connection.
    pub fn connected(&self) -> bool {
        !self.shared.state.lock().stopped
    }

    /// Send `QUIT` and mark the session as quitting, so the control
    /// loop stops instead of reconnecting when the server closes the
    /// link.
    pub async fn quit(&self) -> Result<()> {
        self.handle.quit().await
    }

    /// The governing control loop: consumes the error signal and
    /// decides, per classified failure, whether to halt or to tear down
    /// and reconnect, sleeping a jittered cooldown between failed
    /// attempts. Returns when the session has fully stopped.
    pub async fn run(&self) {
        let mut policy = ReconnectPolicy::new(self.config.max_recoverable_reconnects);
        loop {
            let Some(mut err_rx) = self.shared.state.lock().error_rx.take() else {
                tracing::error!("run() requires a connected session");
                return;
            };
            let Some(error) = err_rx.recv().await else {
                return;
            };
            tracing::warn!(error = %error, "session error");

            match policy.decide(&error) {
                Decision::Voluntary => return,
                Decision::Halt => {
                    self.teardown().await;
                    return;
                }
                Decision::Reconnect => {
                    self.teardown().await;
                    loop {
                        if self.shared.state.lock().quitting {
                            return;
                        }
                        let server = self.shared.state.lock().server.clone();
                        match self.connect(&server).await {
                            Ok(()) => {
                                policy.on_success();
                                break;
                            }
                            Err(e @ Error::Config(_)) => {
                                tracing::error!(error = %e, "cannot reconnect");
                                return;
                            }
                            Err(e) => {
                                let cooldown = jittered(self.config.reconnect_cooldown);
                                tracing::warn!(
                                    error = %e,
                                    cooldown_secs = cooldown.as_secs(),
                                    "reconnect failed, retrying"
                                );
                                tokio::time::sleep(cooldown).await;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Stop workers and release per-connection resources. Returns the
    /// error-signal sender so `disconnect` can post its sentinel.
    async fn teardown(&self) -> Option<mpsc::Sender<Error>> {
        let (shutdown, workers, err_tx) = {
            let mut st = self.shared.state.lock();
            st.epoch += 1;
            st.stopped = true;
            st.outbound = None;
            st.sasl_waiter = None;
            (
                st.shutdown.take(),
                std::mem::take(&mut st.workers),
                st.errors.take(),
            )
        };
        if let Some(tx) = &shutdown {
            let _ = tx.send(true);
        }
        for worker in workers {
            let _ = worker.await;
        }
        err_tx
    }

    fn spawn_pipeline(
        &self,
        transport: Transport,
        out_rx: mpsc::Receiver<String>,
        shutdown: watch::Receiver<bool>,
        config: &Config,
    ) {
        match transport {
            Transport::Plain(stream) => {
                let (r, w) = tokio::io::split(stream);
                self.spawn_workers(BufReader::new(r), w, out_rx, shutdown, config);
            }
            Transport::Tls(stream) => {
                let (r, w) = tokio::io::split(*stream);
                self.spawn_workers(BufReader::new(r), w, out_rx, shutdown, config);
            }
        }
    }

    fn spawn_workers<R, W>(
        &self,
        reader: BufReader<R>,
        writer: W,
        out_rx: mpsc::Receiver<String>,
        shutdown: watch::Receiver<bool>,
        config: &Config,
    ) where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        // The server must answer our own probes well within
        // timeout + ping_frequency, so that bounds the read deadline.
        let read_deadline = config.timeout + config.ping_frequency;
        let reader_task = tokio::spawn(read_loop(
            Arc::clone(&self.shared),
            reader,
            shutdown.clone(),
            read_deadline,
            config.callback_timeout,
        ));
        let writer_task = tokio::spawn(write_loop(
            Arc::clone(&self.shared),
            writer,
            out_rx,
            shutdown.clone(),
            config.timeout,
        ));
        let keepalive_task = tokio::spawn(keepalive_loop(
            Arc::clone(&self.shared),
            shutdown,
            config.keep_alive,
            config.ping_frequency,
        ));
        self.shared.state.lock().workers = vec![reader_task, writer_task, keepalive_task];
    }

    /// Two timers that outlive no connection: the registration fallback
    /// (send NICK/USER even if the server never engages with CAP) and
    /// the listing timeout (abandon negotiation when CAP LS goes
    /// unanswered).
    fn spawn_handshake_watchdog(&self, epoch: u64) {
        let shared = Arc::clone(&self.shared);
        let handle = SessionHandle {
            shared: Arc::clone(&self.shared),
        };
        tokio::spawn(async move {
            tokio::time::sleep(REGISTRATION_FALLBACK).await;
            let lines = {
                let mut st = shared.state.lock();
                if st.epoch != epoch {
                    return;
                }
                if st.handshake.take_registration() {
                    registration_lines(&mut st)
                } else {
                    Vec::new()
                }
            };
            for line in lines {
                let _ = handle.send_line(line).await;
            }

            tokio::time::sleep(CAP_TIMEOUT.saturating_sub(REGISTRATION_FALLBACK)).await;
            let mut st = shared.state.lock();
            if st.epoch == epoch && st.handshake.listing_timed_out() {
                tracing::debug!("no CAP LS reply, abandoning capability negotiation");
            }
        });
    }

    // ── Callback registry ──

    /// Register a callback for an event code (`"*"` for all events).
    /// Returns an id usable with [`Session::remove_callback`] and
    /// [`Session::replace_callback`].
    pub fn add_callback<F>(&self, code: &str, callback: F) -> CallbackId
    where
        F: Fn(SessionHandle, Arc<Event>) -> BoxFuture + Send + Sync + 'static,
    {
        self.shared.registry.add(code, Arc::new(callback))
    }

    pub fn remove_callback(&self, code: &str, id: CallbackId) -> bool {
        self.shared.registry.remove(code, id)
    }

    pub fn clear_callbacks(&self, code: &str) -> bool {
        self.shared.registry.clear(code)
    }

    pub fn replace_callback<F>(&self, code: &str, id: CallbackId, callback: F) -> bool
    where
        F: Fn(SessionHandle, Arc<Event>) -> BoxFuture + Send + Sync + 'static,
    {
        self.shared.registry.replace(code, id, Arc::new(callback))
    }

    /// Built-in protocol courtesies, registered through the same
    /// registry user callbacks go through.
    fn install_default_callbacks(&self) {
        let r = &self.shared.registry;

        r.add(
            "PING",
            Arc::new(|h, e| {
                Box::pin(async move {
                    h.send_raw(&format!("PONG :{}", e.message())).await?;
                    Ok(())
                })
            }),
        );

        r.add(
            "PONG",
            Arc::new(|_h, e| {
                Box::pin(async move {
                    if let Ok(sent) = e.message().parse::<i64>() {
                        let now = unix_nanos();
                        tracing::debug!(lag_ms = (now - sent) / 1_000_000, "pong");
                    }
                    Ok(())
                })
            }),
        );

        r.add(
            "CTCP_VERSION",
            Arc::new(|h, e| {
                Box::pin(async move {
                    let version = h.version();
                    h.send_raw(&format!("NOTICE {} :\u{1}VERSION {version}\u{1}", e.nick))
                        .await?;
                    Ok(())
                })
            }),
        );

        r.add(
            "CTCP_USERINFO",
            Arc::new(|h, e| {
                Box::pin(async move {
                    let user = h.username();
                    h.send_raw(&format!("NOTICE {} :\u{1}USERINFO {user}\u{1}", e.nick))
                        .await?;
                    Ok(())
                })
            }),
        );

        r.add(
            "CTCP_CLIENTINFO",
            Arc::new(|h, e| {
                Box::pin(async move {
                    h.send_raw(&format!(
                        "NOTICE {} :\u{1}CLIENTINFO PING VERSION TIME USERINFO CLIENTINFO DCC\u{1}",
                        e.nick
                    ))
                    .await?;
                    Ok(())
                })
            }),
        );

        r.add(
            "CTCP_TIME",
            Arc::new(|h, e| {
                Box::pin(async move {
                    let now = chrono::Local::now().to_rfc2822();
                    h.send_raw(&format!("NOTICE {} :\u{1}TIME {now}\u{1}", e.nick))
                        .await?;
                    Ok(())
                })
            }),
        );

        r.add(
            "CTCP_PING",
            Arc::new(|h, e| {
                Box::pin(async move {
                    h.send_raw(&format!("NOTICE {} :\u{1}{}\u{1}", e.nick, e.message()))
                        .await?;
                    Ok(())
                })
            }),
        );

        r.add(
            "CTCP_DCC",
            Arc::new(|h, e| {
                Box::pin(async move {
                    // DCC CHAT chat <ip> <port>
                    let payload = e.message().to_string();
                    let parts: Vec<&str> = payload.split_whitespace().collect();
                    if parts.len() < 5 || !parts[1].eq_ignore_ascii_case("CHAT") {
                        return Ok(());
                    }
                    let Ok(port) = parts[4].parse::<u16>() else {
                        return Ok(());
                    };
                    h.accept_peer_offer(&e.nick, parts[3], port).await;
                    Ok(())
                })
            }),
        );
    }

    // ── Messaging and identity, delegated to the handle ──

    pub async fn send_raw(&self, message: &str) -> Result<()> {
        self.handle.send_raw(message).await
    }

    pub async fn join(&self, channel: &str) -> Result<()> {
        self.handle.join(channel).await
    }

    pub async fn part(&self, channel: &str) -> Result<()> {
        self.handle.part(channel).await
    }

    pub async fn privmsg(&self, target: &str, text: &str) -> Result<()> {
        self.handle.privmsg(target, text).await
    }

    pub async fn notice(&self, target: &str, text: &str) -> Result<()> {
        self.handle.notice(target, text).await
    }

    pub async fn privmsg_with_tags(
        &self,
        target: &str,
        text: &str,
        tags: &HashMap<String, String>,
    ) -> Result<()> {
        self.handle.privmsg_with_tags(target, text, tags).await
    }

    pub async fn action(&self, target: &str, text: &str) -> Result<()> {
        self.handle.action(target, text).await
    }

    pub async fn kick(&self, user: &str, channel: &str, reason: &str) -> Result<()> {
        self.handle.kick(user, channel, reason).await
    }

    pub async fn multi_kick(&self, users: &[&str], channel: &str, reason: &str) -> Result<()> {
        self.handle.multi_kick(users, channel, reason).await
    }

    pub async fn mode(&self, target: &str, modes: &[&str]) -> Result<()> {
        self.handle.mode(target, modes).await
    }

    pub async fn whois(&self, nick: &str) -> Result<()> {
        self.handle.whois(nick).await
    }

    pub async fn who(&self, nick: &str) -> Result<()> {
        self.handle.who(nick).await
    }

    pub async fn set_nick(&self, nick: &str) -> Result<()> {
        self.handle.set_nick(nick).await
    }

    pub fn current_nick(&self) -> String {
        self.handle.current_nick()
    }

    pub fn nick_status(&self) -> NickStatus {
        self.handle.nick_status()
    }

    pub fn acknowledged_capabilities(&self) -> Vec<String> {
        self.handle.acknowledged_capabilities()
    }
}

impl SessionHandle {
    fn sender(&self) -> Option<mpsc::Sender<String>> {
        self.shared.state.lock().outbound.clone()
    }

    pub(crate) async fn send_line(&self, line: String) -> Result<()> {
        let tx = self.sender().ok_or(Error::NotConnected)?;
        tx.send(format!("{line}\r\n"))
            .await
            .map_err(|_| Error::NotConnected)
    }

    /// Send a raw protocol line (terminator appended).
    pub async fn send_raw(&self, message: &str) -> Result<()> {
        self.send_line(message.to_string()).await
    }

    pub async fn join(&self, channel: &str) -> Result<()> {
        self.send_raw(&format!("JOIN {channel}")).await
    }

    pub async fn part(&self, channel: &str) -> Result<()> {
        self.send_raw(&format!("PART {channel}")).await
    }

    pub async fn privmsg(&self, target: &str, text: &str) -> Result<()> {
        self.send_raw(&format!("PRIVMSG {target} :{text}")).await
    }

    pub async fn notice(&self, target: &str, text: &str) -> Result<()> {
        self.send_raw(&format!("NOTICE {target} :{text}")).await
    }

    /// Send a message with IRCv3 tags (requires the server to have
    /// acknowledged `message-tags`).
    pub async fn privmsg_with_tags(
        &self,
        target: &str,
        text: &str,
        tags: &HashMap<String, String>,
    ) -> Result<()> {
        if tags.is_empty() {
            return self.privmsg(target, text).await;
        }
        let mut encoded = String::from("@");
        for (i, (key, value)) in tags.iter().enumerate() {
            if i > 0 {
                encoded.push(';');
            }
            if value.is_empty() {
                encoded.push_str(key);
            } else {
                encoded.push_str(key);
                encoded.push('=');
                encoded.push_str(&crate::message::escape_tag_value(value));
            }
        }
        self.send_raw(&format!("{encoded} PRIVMSG {target} :{text}"))
            .await
    }

    /// CTCP ACTION ("/me").
    pub async fn action(&self, target: &str, text: &str) -> Result<()> {
        self.send_raw(&format!("PRIVMSG {target} :\u{1}ACTION {text}\u{1}"))
            .await
    }

    /// Kick a user; pass an empty reason for none.
    pub async fn kick(&self, user: &str, channel: &str, reason: &str) -> Result<()> {
        if reason.is_empty() {
            self.send_raw(&format!("KICK {channel} {user}")).await
        } else {
            self.send_raw(&format!("KICK {channel} {user} :{reason}")).await
        }
    }

    pub async fn multi_kick(&self, users: &[&str], channel: &str, reason: &str) -> Result<()> {
        let users = users.join(",");
        if reason.is_empty() {
            self.send_raw(&format!("KICK {channel} {users}")).await
        } else {
            self.send_raw(&format!("KICK {channel} {users} :{reason}")).await
        }
    }

    pub async fn mode(&self, target: &str, modes: &[&str]) -> Result<()> {
        if modes.is_empty() {
            self.send_raw(&format!("MODE {target}")).await
        } else {
            self.send_raw(&format!("MODE {target} {}", modes.join(" "))).await
        }
    }

    pub async fn whois(&self, nick: &str) -> Result<()> {
        self.send_raw(&format!("WHOIS {nick}")).await
    }

    pub async fn who(&self, nick: &str) -> Result<()> {
        self.send_raw(&format!("WHO {nick}")).await
    }

    /// Request a nickname change. The confirmed nickname moves only
    /// when the server acknowledges; a request while another change is
    /// in flight coalesces instead of sending a duplicate command.
    pub async fn set_nick(&self, nick: &str) -> Result<()> {
        let announce = self.shared.state.lock().identity.request_change(nick);
        match announce {
            Some(nick) => self.send_line(format!("NICK {nick}")).await,
            None => Ok(()),
        }
    }

    /// The nickname the server has acknowledged for this session.
    pub fn current_nick(&self) -> String {
        self.shared.state.lock().identity.current().to_string()
    }

    /// Detailed nickname state, including pending changes and the last
    /// rejection error.
    pub fn nick_status(&self) -> NickStatus {
        self.shared.state.lock().identity.status()
    }

    /// Capabilities the server has acknowledged on this connection.
    pub fn acknowledged_capabilities(&self) -> Vec<String> {
        self.shared.state.lock().handshake.acknowledged().to_vec()
    }

    /// Send `QUIT` and stop the control loop from reconnecting.
    pub async fn quit(&self) -> Result<()> {
        let message = {
            let mut st = self.shared.state.lock();
            st.quitting = true;
            st.stopped = true;
            st.params.quit_message.clone()
        };
        if message.is_empty() {
            self.send_raw("QUIT").await
        } else {
            self.send_raw(&format!("QUIT :{message}")).await
        }
    }

    pub(crate) fn version(&self) -> String {
        self.shared.state.lock().params.version.clone()
    }

    pub(crate) fn username(&self) -> String {
        self.shared.state.lock().user.clone()
    }

    pub(crate) fn peer_chats(&self) -> Arc<PeerChats> {
        Arc::clone(&self.shared.peers)
    }
}

/// NICK + USER, exactly once per connection attempt (callers consume
/// the handshake's idempotency flag first).
fn registration_lines(st: &mut SessionState) -> Vec<String> {
    st.identity.begin_registration();
    let nick = st.identity.desired().to_string();
    let realname = if st.params.realname.is_empty() {
        st.user.clone()
    } else {
        st.params.realname.clone()
    };
    vec![
        format!("NICK {nick}"),
        format!("USER {} 0 * :{realname}", st.user),
    ]
}

/// Feed an inbound event to the privileged observers (handshake,
/// identity, SASL outcome) under the session lock; returns the wire
/// lines they want sent.
fn observe(shared: &Shared, event: &Event) -> Vec<String> {
    let mut st = shared.state.lock();
    let mut lines = Vec::new();
    match event.code.as_str() {
        "CAP" => {
            let out = st.handshake.on_cap(&event.arguments);
            lines.extend(out.lines);
            if out.register_now {
                lines.extend(registration_lines(&mut st));
            }
            if let Some(outcome) = out.sasl {
                deliver_sasl(&mut st, outcome);
            }
            if let Some(end) = st.handshake.maybe_end() {
                lines.push(end);
            }
        }
        "AUTHENTICATE" => {
            let challenge = event.arguments.first().map(String::as_str).unwrap_or("");
            lines.extend(st.handshake.on_authenticate(challenge));
        }
        "903" | "904" | "905" | "906" => {
            if let Some(outcome) = st.handshake.on_sasl_result(&event.code, event.message()) {
                deliver_sasl(&mut st, outcome);
            }
            if let Some(end) = st.handshake.maybe_end() {
                lines.push(end);
            }
        }
        "001" => {
            let nick = event.arguments.first().cloned().unwrap_or_default();
            tracing::debug!(nick = %nick, "registration complete");
            st.identity.on_welcome(&nick);
        }
        "431" | "432" | "433" | "436" | "437" | "484" => {
            if let Some(next) = st.identity.on_rejection(&event.code, event.message()) {
                tracing::debug!(code = %event.code, next = %next, "nickname rejected, retrying");
                lines.push(format!("NICK {next}"));
            }
        }
        "NICK" => {
            if !event.nick.is_empty() {
                st.identity.on_nick_notification(&event.nick, event.message());
            }
        }
        _ => {}
    }
    lines
}

fn deliver_sasl(st: &mut SessionState, outcome: SaslOutcome) {
    if let Some(tx) = st.sasl_waiter.take() {
        let _ = tx.send(match outcome {
            SaslOutcome::Success => Ok(()),
            SaslOutcome::Failure(reason) => Err(reason),
        });
    }
}

async fn post_error(shared: &Shared, error: Error) {
    let tx = shared.state.lock().errors.clone();
    if let Some(tx) = tx {
        let _ = tx.send(error).await;
    }
}

async fn read_loop<R>(
    shared: Arc<Shared>,
    mut reader: BufReader<R>,
    mut shutdown: watch::Receiver<bool>,
    read_deadline: Duration,
    callback_timeout: Option<Duration>,
) where
    R: AsyncRead + Unpin,
{
    let handle = SessionHandle {
        shared: Arc::clone(&shared),
    };
    let mut line = String::new();
    loop {
        line.clear();
        let read = tokio::select! {
            _ = shutdown.changed() => return,
            read = tokio::time::timeout(read_deadline, reader.read_line(&mut line)) => read,
        };
        let n = match read {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                post_error(&shared, Error::Io(e)).await;
                return;
            }
            Err(_) => {
                post_error(
                    &shared,
                    Error::Io(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "read deadline exceeded",
                    )),
                )
                .await;
                return;
            }
        };
        if n == 0 {
            post_error(
                &shared,
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "server closed the connection",
                )),
            )
            .await;
            return;
        }

        tracing::debug!(line = %line.trim_end(), "<--");
        shared.state.lock().last_activity = Instant::now();

        let event = match Event::parse(&line) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, line = %line.trim_end(), "dropping unparseable line");
                continue;
            }
        };

        for out in observe(&shared, &event) {
            let _ = handle.send_line(out).await;
        }

        if event.code == "ERROR" {
            let message = event.message().to_string();
            let kind = classify_failure(&message);
            tracing::warn!(kind = %kind, message = %message, "server ERROR");
            if kind != FailureKind::Permanent {
                dispatch::dispatch(&shared.registry, handle.clone(), event, callback_timeout)
                    .await;
            }
            post_error(&shared, Error::Protocol { kind, message }).await;
            return;
        }

        dispatch::dispatch(&shared.registry, handle.clone(), event, callback_timeout).await;
    }
}

async fn write_loop<W>(
    shared: Arc<Shared>,
    mut writer: W,
    mut out_rx: mpsc::Receiver<String>,
    mut shutdown: watch::Receiver<bool>,
    write_deadline: Duration,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let message = tokio::select! {
            _ = shutdown.changed() => return,
            message = out_rx.recv() => match message {
                Some(message) => message,
                None => return,
            },
        };
        tracing::debug!(line = %message.trim_end(), "-->");
        let write = async {
            writer.write_all(message.as_bytes()).await?;
            writer.flush().await
        };
        match tokio::time::timeout(write_deadline, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                post_error(&shared, Error::Io(e)).await;
                return;
            }
            Err(_) => {
                post_error(
                    &shared,
                    Error::Io(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "write deadline exceeded",
                    )),
                )
                .await;
                return;
            }
        }
    }
}

/// Idle monitor plus unconditional probe. The probe tick also runs the
/// nickname reconciliation check, re-announcing the desired nickname
/// whenever it differs from the confirmed one.
async fn keepalive_loop(
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
    keep_alive: Duration,
    ping_frequency: Duration,
) {
    let handle = SessionHandle {
        shared: Arc::clone(&shared),
    };
    let start = tokio::time::Instant::now();
    let mut monitor = tokio::time::interval_at(start + MONITOR_PERIOD, MONITOR_PERIOD);
    let mut prober = tokio::time::interval_at(start + ping_frequency, ping_frequency);
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = monitor.tick() => {
                let idle = shared.state.lock().last_activity.elapsed();
                if idle >= keep_alive {
                    let _ = handle.send_line(probe_line()).await;
                }
            }
            _ = prober.tick() => {
                let _ = handle.send_line(probe_line()).await;
                let retry = shared.state.lock().identity.reconcile();
                if let Some(nick) = retry {
                    tracing::debug!(nick = %nick, "re-announcing desired nickname");
                    let _ = handle.send_line(format!("NICK {nick}")).await;
                }
            }
        }
    }
}

fn probe_line() -> String {
    format!("PING {}", unix_nanos())
}

fn unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

fn jittered(base: Duration) -> Duration {
    let quarter = (base.as_millis() as u64 / 4).max(1);
    base + Duration::from_millis(rand::thread_rng().gen_range(0..quarter))
}

// ── Reconnect policy ──

#[derive(Debug, PartialEq, Eq)]
enum Decision {
    /// Caller asked for the disconnect; stop without reconnecting.
    Voluntary,
    /// Stop and stay stopped (permanent failure or ceiling reached).
    Halt,
    Reconnect,
}

struct ReconnectPolicy {
    max_recoverable: u32,
    recoverable_attempts: u32,
}

impl ReconnectPolicy {
    fn new(max_recoverable: u32) -> Self {
        Self {
            max_recoverable,
            recoverable_attempts: 0,
        }
    }

    fn decide(&mut self, error: &Error) -> Decision {
        match error {
            Error::Disconnected => Decision::Voluntary,
            Error::Protocol {
                kind: FailureKind::Permanent,
                ..
            } => {
                tracing::warn!("permanent failure, not reconnecting");
                Decision::Halt
            }
            Error::Protocol {
                kind: FailureKind::Recoverable,
                ..
            } => {
                if self.max_recoverable > 0 && self.recoverable_attempts >= self.max_recoverable {
                    tracing::warn!(
                        max = self.max_recoverable,
                        "recoverable reconnect ceiling reached, stopping"
                    );
                    Decision::Halt
                } else {
                    self.recoverable_attempts += 1;
                    Decision::Reconnect
                }
            }
            _ => Decision::Reconnect,
        }
    }

    fn on_success(&mut self) {
        self.recoverable_attempts = 0;
    }
}
