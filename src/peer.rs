//! Direct peer-to-peer chat side channel (DCC CHAT).
//!
//! A peer chat is a plain line-oriented TCP relay negotiated over the
//! IRC connection: the offering side listens on an ephemeral port and
//! advertises it via a CTCP `DCC CHAT` message; the accepting side
//! dials it. Message content never touches the server.
//!
//! The chat table is keyed by peer nick under its own lock, independent
//! of the session lock. Send and receive are non-blocking: a full
//! outgoing queue or an empty incoming queue is an error, not a wait.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use crate::session::SessionHandle;

/// How long an outgoing offer waits for the peer to dial back.
const OFFER_TIMEOUT: Duration = Duration::from_secs(120);

const QUEUE_DEPTH: usize = 100;

struct PeerChat {
    outgoing: mpsc::Sender<String>,
    incoming: mpsc::Receiver<String>,
}

/// All live peer chats for a session.
#[derive(Default)]
pub(crate) struct PeerChats {
    chats: Mutex<HashMap<String, PeerChat>>,
}

impl PeerChats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adopt an established connection and start its line pump.
    pub fn register(self: &Arc<Self>, nick: &str, stream: TcpStream) {
        let (out_tx, mut out_rx) = mpsc::channel::<String>(QUEUE_DEPTH);
        let (in_tx, in_rx) = mpsc::channel::<String>(QUEUE_DEPTH);
        self.chats.lock().insert(
            nick.to_string(),
            PeerChat {
                outgoing: out_tx,
                incoming: in_rx,
            },
        );
        tracing::debug!(peer = %nick, "peer chat established");

        let chats = Arc::clone(self);
        let nick = nick.to_string();
        tokio::spawn(async move {
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();
            loop {
                tokio::select! {
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            if in_tx.send(line).await.is_err() {
                                break;
                            }
                        }
                        _ => break,
                    },
                    message = out_rx.recv() => match message {
                        Some(message) => {
                            if write_half
                                .write_all(format!("{message}\r\n").as_bytes())
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            chats.chats.lock().remove(&nick);
            tracing::debug!(peer = %nick, "peer chat closed");
        });
    }

    pub fn send(&self, nick: &str, text: &str) -> Result<()> {
        let outgoing = {
            let chats = self.chats.lock();
            let chat = chats
                .get(nick)
                .ok_or_else(|| anyhow!("no active peer chat with {nick}"))?;
            chat.outgoing.clone()
        };
        outgoing
            .try_send(text.to_string())
            .map_err(|_| anyhow!("failed to send to {nick}: queue full or chat closed"))
    }

    pub fn receive(&self, nick: &str) -> Result<String> {
        let mut chats = self.chats.lock();
        let chat = chats
            .get_mut(nick)
            .ok_or_else(|| anyhow!("no active peer chat with {nick}"))?;
        match chat.incoming.try_recv() {
            Ok(message) => Ok(message),
            Err(TryRecvError::Empty) => Err(anyhow!("no message available from {nick}")),
            Err(TryRecvError::Disconnected) => Err(anyhow!("peer chat with {nick} closed")),
        }
    }

    pub fn close(&self, nick: &str) -> Result<()> {
        self.chats
            .lock()
            .remove(nick)
            .map(|_| ())
            .ok_or_else(|| anyhow!("no active peer chat with {nick}"))
    }

    pub fn list(&self) -> Vec<String> {
        self.chats.lock().keys().cloned().collect()
    }

    pub fn active(&self, nick: &str) -> bool {
        self.chats.lock().contains_key(nick)
    }
}

impl SessionHandle {
    /// Offer a direct chat to `target`: listen on an ephemeral port,
    /// advertise it over the server, and adopt the first connection
    /// that arrives (or give up after a couple of minutes).
    pub async fn open_peer_chat(&self, target: &str) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", 0)).await?;
        let port = listener.local_addr()?.port();
        let ip = local_ipv4().await;
        self.send_raw(&format!(
            "PRIVMSG {target} :\u{1}DCC CHAT chat {} {port}\u{1}",
            u32::from(ip)
        ))
        .await?;

        let chats = self.peer_chats();
        let target = target.to_string();
        tokio::spawn(async move {
            match tokio::time::timeout(OFFER_TIMEOUT, listener.accept()).await {
                Ok(Ok((stream, addr))) => {
                    tracing::debug!(peer = %target, from = %addr, "peer accepted chat offer");
                    chats.register(&target, stream);
                }
                Ok(Err(e)) => tracing::warn!(peer = %target, error = %e, "peer chat accept failed"),
                Err(_) => tracing::debug!(peer = %target, "peer chat offer timed out"),
            }
        });
        Ok(())
    }

    /// Queue a line for the peer. Errors when no chat is active or the
    /// queue is full.
    pub fn send_peer_message(&self, target: &str, text: &str) -> Result<()> {
        self.peer_chats().send(target, text)
    }

    /// Take the next received line, if one is waiting.
    pub fn receive_peer_message(&self, target: &str) -> Result<String> {
        self.peer_chats().receive(target)
    }

    pub fn close_peer_chat(&self, target: &str) -> Result<()> {
        self.peer_chats().close(target)
    }

    pub fn list_peer_chats(&self) -> Vec<String> {
        self.peer_chats().list()
    }

    pub fn peer_chat_active(&self, target: &str) -> bool {
        self.peer_chats().active(target)
    }

    /// Dial back an incoming `DCC CHAT` offer (invoked by the default
    /// CTCP_DCC callback).
    pub(crate) async fn accept_peer_offer(&self, nick: &str, host: &str, port: u16) {
        let Some(ip) = parse_peer_addr(host) else {
            tracing::warn!(peer = %nick, host, "unparseable peer chat address");
            return;
        };
        match TcpStream::connect((ip, port)).await {
            Ok(stream) => self.peer_chats().register(nick, stream),
            Err(e) => tracing::warn!(peer = %nick, error = %e, "connecting to peer chat failed"),
        }
    }
}

impl crate::session::Session {
    pub async fn open_peer_chat(&self, target: &str) -> Result<()> {
        self.handle().open_peer_chat(target).await
    }

    pub fn send_peer_message(&self, target: &str, text: &str) -> Result<()> {
        self.handle().send_peer_message(target, text)
    }

    pub fn receive_peer_message(&self, target: &str) -> Result<String> {
        self.handle().receive_peer_message(target)
    }

    pub fn close_peer_chat(&self, target: &str) -> Result<()> {
        self.handle().close_peer_chat(target)
    }

    pub fn list_peer_chats(&self) -> Vec<String> {
        self.handle().list_peer_chats()
    }

    pub fn peer_chat_active(&self, target: &str) -> bool {
        self.handle().peer_chat_active(target)
    }
}

/// Offers carry the address either as a decimal 32-bit integer (the
/// classic form) or dotted-quad.
fn parse_peer_addr(host: &str) -> Option<Ipv4Addr> {
    if let Ok(packed) = host.parse::<u32>() {
        return Some(Ipv4Addr::from(packed));
    }
    host.parse::<Ipv4Addr>().ok()
}

/// Best-effort local address discovery: the address a UDP socket would
/// use to reach the outside world. Falls back to loopback.
async fn local_ipv4() -> Ipv4Addr {
    let Ok(socket) = UdpSocket::bind(("0.0.0.0", 0)).await else {
        return Ipv4Addr::LOCALHOST;
    };
    if socket.connect(("8.8.8.8", 80)).await.is_err() {
        return Ipv4Addr::LOCALHOST;
    }
    match socket.local_addr() {
        Ok(addr) => match addr.ip() {
            IpAddr::V4(ip) => ip,
            IpAddr::V6(_) => Ipv4Addr::LOCALHOST,
        },
        Err(_) => Ipv4Addr::LOCALHOST,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_addresses_parse_in_both_forms() {
        assert_eq!(
            parse_peer_addr("2130706433"),
            Some(Ipv4Addr::new(127, 0, 0, 1))
        );
        assert_eq!(
            parse_peer_addr("192.168.1.10"),
            Some(Ipv4Addr::new(192, 168, 1, 10))
        );
        assert_eq!(parse_peer_addr("not-an-address"), None);
    }

    #[tokio::test]
    async fn send_and_receive_relay_lines_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let remote = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();
            let got = lines.next_line().await.unwrap().unwrap();
            assert_eq!(got, "hello peer");
            write_half.write_all(b"hello back\r\n").await.unwrap();
            // Hold the socket open until the test finishes reading.
            tokio::time::sleep(Duration::from_millis(500)).await;
        });

        let chats = Arc::new(PeerChats::new());
        let stream = TcpStream::connect(addr).await.unwrap();
        chats.register("buddy", stream);
        assert!(chats.active("buddy"));
        assert_eq!(chats.list(), vec!["buddy".to_string()]);

        chats.send("buddy", "hello peer").unwrap();
        let mut received = None;
        for _ in 0..100 {
            match chats.receive("buddy") {
                Ok(line) => {
                    received = Some(line);
                    break;
                }
                Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
        assert_eq!(received.as_deref(), Some("hello back"));

        chats.close("buddy").unwrap();
        assert!(!chats.active("buddy"));
        assert!(chats.send("buddy", "x").is_err());
        remote.await.unwrap();
    }

    #[test]
    fn operations_on_unknown_peers_error() {
        let chats = PeerChats::new();
        assert!(chats.send("ghost", "hi").is_err());
        assert!(chats.receive("ghost").is_err());
        assert!(chats.close("ghost").is_err());
        assert!(!chats.active("ghost"));
        assert!(chats.list().is_empty());
    }
}
