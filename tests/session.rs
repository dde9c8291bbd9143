//! End-to-end session tests against a scripted in-process server.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

use ircline::{Error, Event, Session};

const STEP: Duration = Duration::from_secs(5);

struct Server {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Server {
    async fn accept(listener: &TcpListener) -> Server {
        let (stream, _) = timeout(STEP, listener.accept())
            .await
            .expect("timed out waiting for a connection")
            .expect("accept failed");
        let (read_half, writer) = stream.into_split();
        Server {
            lines: BufReader::new(read_half).lines(),
            writer,
        }
    }

    /// Read lines until one starts with `prefix`, skipping unrelated
    /// traffic (liveness probes and the like).
    async fn expect(&mut self, prefix: &str) -> String {
        loop {
            let line = timeout(STEP, self.lines.next_line())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for a line starting with {prefix:?}"))
                .expect("read failed")
                .unwrap_or_else(|| panic!("connection closed while waiting for {prefix:?}"));
            if line.starts_with(prefix) {
                return line;
            }
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .expect("write failed");
    }
}

async fn listen() -> (String, TcpListener) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
    (addr, listener)
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..250 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition was never reached");
}

#[tokio::test]
async fn registers_and_answers_server_pings() {
    let (addr, listener) = listen().await;
    let session = Session::new("alice", "alicebot").unwrap();

    let script = tokio::spawn(async move {
        let mut server = Server::accept(&listener).await;
        assert_eq!(server.expect("NICK").await, "NICK alice");
        assert_eq!(server.expect("USER").await, "USER alicebot 0 * :alicebot");
        server.send(":irc.test 001 alice :Welcome to the test network").await;
        server.send("PING :token-123").await;
        assert_eq!(server.expect("PONG").await, "PONG :token-123");
        server
    });

    session.connect(&addr).await.unwrap();
    assert!(session.connected());
    let _server = script.await.unwrap();

    wait_for(|| session.nick_status().confirmed).await;
    assert_eq!(session.current_nick(), "alice");
    assert!(!session.nick_status().pending_change);
}

#[tokio::test]
async fn nickname_in_use_retries_with_the_alternative() {
    let (addr, listener) = listen().await;
    let session = Session::new("bob", "bob").unwrap();

    let script = tokio::spawn(async move {
        let mut server = Server::accept(&listener).await;
        assert_eq!(server.expect("NICK").await, "NICK bob");
        server.expect("USER").await;
        server.send(":irc.test 433 * bob :Nickname is already in use").await;
        // The retry must derive from the rejected value, not touch the
        // confirmed one, and arrive without re-registration.
        assert_eq!(server.expect("NICK").await, "NICK bob_");
        server.send(":irc.test 001 bob_ :Welcome").await;
        server
    });

    session.connect(&addr).await.unwrap();
    let _server = script.await.unwrap();

    wait_for(|| session.nick_status().confirmed).await;
    let status = session.nick_status();
    assert_eq!(status.current, "bob_");
    assert!(!status.pending_change);
    assert!(status.last_error.is_empty());
}

#[tokio::test]
async fn capability_negotiation_requests_the_supported_intersection() {
    let (addr, listener) = listen().await;
    let mut session = Session::new("alice", "alice").unwrap();
    session.config.request_caps = vec!["message-tags".into(), "away-notify".into()];

    let script = tokio::spawn(async move {
        let mut server = Server::accept(&listener).await;
        assert_eq!(server.expect("CAP LS").await, "CAP LS 302");
        server.send(":irc.test CAP * LS :message-tags sasl server-time").await;
        // Only the mutually supported capability is requested, and
        // registration rides on the LS reply.
        assert_eq!(server.expect("CAP REQ").await, "CAP REQ :message-tags");
        server.expect("NICK").await;
        server.expect("USER").await;
        server.send(":irc.test CAP alice ACK :message-tags").await;
        assert_eq!(server.expect("CAP END").await, "CAP END");
        server.send(":irc.test 001 alice :Welcome").await;
        server
    });

    session.connect(&addr).await.unwrap();
    let _server = script.await.unwrap();
    wait_for(|| session.nick_status().confirmed).await;
    assert_eq!(
        session.acknowledged_capabilities(),
        vec!["message-tags".to_string()]
    );
}

#[tokio::test]
async fn sasl_plain_authenticates_during_negotiation() {
    let (addr, listener) = listen().await;
    let mut session = Session::new("alice", "alice").unwrap();
    session.config.use_sasl = true;
    session.config.sasl_login = "a".into();
    session.config.sasl_password = "b".into();

    let script = tokio::spawn(async move {
        let mut server = Server::accept(&listener).await;
        server.expect("CAP LS").await;
        server.send(":irc.test CAP * LS :sasl=PLAIN,EXTERNAL message-tags").await;
        assert_eq!(server.expect("CAP REQ").await, "CAP REQ :sasl");
        server.expect("USER").await;
        server.send(":irc.test CAP alice ACK :sasl").await;
        assert_eq!(server.expect("AUTHENTICATE").await, "AUTHENTICATE PLAIN");
        server.send("AUTHENTICATE +").await;
        // base64("a\0a\0b")
        assert_eq!(server.expect("AUTHENTICATE").await, "AUTHENTICATE YQBhAGI=");
        server.send(":irc.test 903 alice :SASL authentication successful").await;
        assert_eq!(server.expect("CAP END").await, "CAP END");
        server.send(":irc.test 001 alice :Welcome").await;
        server
    });

    session.connect(&addr).await.unwrap();
    let _server = script.await.unwrap();
    wait_for(|| session.nick_status().confirmed).await;
}

#[tokio::test]
async fn sasl_rejection_aborts_connect() {
    let (addr, listener) = listen().await;
    let mut session = Session::new("alice", "alice").unwrap();
    session.config.use_sasl = true;
    session.config.sasl_login = "a".into();
    session.config.sasl_password = "wrong".into();

    let script = tokio::spawn(async move {
        let mut server = Server::accept(&listener).await;
        server.expect("CAP LS").await;
        server.send(":irc.test CAP * LS :sasl").await;
        server.expect("CAP REQ").await;
        server.send(":irc.test CAP alice ACK :sasl").await;
        server.expect("AUTHENTICATE").await;
        server.send("AUTHENTICATE +").await;
        server.expect("AUTHENTICATE").await;
        server.send(":irc.test 904 alice :SASL authentication failed").await;
        server
    });

    let err = session.connect(&addr).await.unwrap_err();
    assert!(matches!(err, Error::Auth(_)), "unexpected error: {err}");
    assert!(!session.connected());
    let _server = script.await.unwrap();
}

#[tokio::test]
async fn dispatches_messages_and_answers_ctcp_version() {
    let (addr, listener) = listen().await;
    let session = Session::new("alice", "alice").unwrap();

    let (seen_tx, mut seen_rx) = mpsc::channel::<Arc<Event>>(8);
    session.add_callback("PRIVMSG", move |_handle, event| {
        let seen_tx = seen_tx.clone();
        Box::pin(async move {
            seen_tx.send(event).await.ok();
            Ok(())
        })
    });

    let script = tokio::spawn(async move {
        let mut server = Server::accept(&listener).await;
        server.expect("NICK").await;
        server.expect("USER").await;
        server.send(":irc.test 001 alice :Welcome").await;
        server.send(":bob!u@h PRIVMSG alice :hello there").await;
        server.send(":bob!u@h PRIVMSG alice :\u{1}VERSION\u{1}").await;
        let reply = server.expect("NOTICE bob").await;
        assert!(
            reply.starts_with("NOTICE bob :\u{1}VERSION ircline"),
            "unexpected CTCP reply: {reply:?}"
        );
        server
    });

    session.connect(&addr).await.unwrap();

    let event = timeout(STEP, seen_rx.recv()).await.unwrap().unwrap();
    assert_eq!(event.code, "PRIVMSG");
    assert_eq!(event.nick, "bob");
    assert_eq!(event.arguments, vec!["alice", "hello there"]);

    let _server = script.await.unwrap();
}

#[tokio::test]
async fn caller_initiated_nick_change_confirms_via_notification() {
    let (addr, listener) = listen().await;
    let session = Session::new("bob", "bob").unwrap();

    let script = tokio::spawn(async move {
        let mut server = Server::accept(&listener).await;
        server.expect("NICK").await;
        server.expect("USER").await;
        server.send(":irc.test 001 bob :Welcome").await;
        assert_eq!(server.expect("NICK").await, "NICK alice");
        server.send(":bob!bob@h NICK :alice").await;
        server
    });

    session.connect(&addr).await.unwrap();
    wait_for(|| session.nick_status().confirmed).await;

    session.set_nick("alice").await.unwrap();
    assert!(session.nick_status().pending_change);
    // Confirmed only moves on the server's change notification.
    assert_eq!(session.current_nick(), "bob");

    let _server = script.await.unwrap();
    wait_for(|| session.current_nick() == "alice").await;
    assert!(!session.nick_status().pending_change);
}

#[tokio::test]
async fn voluntary_disconnect_halts_the_control_loop() {
    let (addr, listener) = listen().await;
    let session = Session::new("alice", "alice").unwrap();

    let script = tokio::spawn(async move {
        let mut server = Server::accept(&listener).await;
        server.expect("USER").await;
        server.send(":irc.test 001 alice :Welcome").await;
        server
    });

    session.connect(&addr).await.unwrap();
    let _server = script.await.unwrap();

    session.disconnect().await;
    assert!(!session.connected());
    // The sentinel is already queued: the loop must exit, not reconnect.
    timeout(STEP, session.run()).await.expect("run() did not halt");
}

#[tokio::test]
async fn recoverable_error_reconnects_and_permanent_error_halts() {
    let (addr, listener) = listen().await;
    let session = Session::new("alice", "alice").unwrap();

    let script = tokio::spawn(async move {
        let mut first = Server::accept(&listener).await;
        first.expect("USER").await;
        first.send(":irc.test 001 alice :Welcome").await;
        first.send("ERROR :Closing Link: Ping timeout").await;
        drop(first);

        // The control loop classifies the failure as recoverable and
        // dials again.
        let mut second = Server::accept(&listener).await;
        assert_eq!(second.expect("NICK").await, "NICK alice");
        second.expect("USER").await;
        second.send(":irc.test 001 alice :Welcome").await;
        second.send("ERROR :You are banned from this server").await;
        second
    });

    session.connect(&addr).await.unwrap();
    timeout(Duration::from_secs(10), session.run())
        .await
        .expect("run() did not halt on the permanent failure");
    assert!(!session.connected());
    let _server = script.await.unwrap();
}
