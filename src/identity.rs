//! Nickname reconciliation.
//!
//! Three independent fields track the session's identity:
//!
//! - `confirmed` — the nickname the server has explicitly acknowledged,
//!   via the welcome reply or a `NICK` change notification sourced from
//!   the current confirmed value. Nothing else may touch it.
//! - `desired` — what the caller most recently asked for.
//! - `pending` — the value currently awaiting server acknowledgment.
//!
//! Rejection replies derive an alternative candidate and retry without
//! touching `confirmed`; the keep-alive worker periodically resends the
//! desired nickname whenever it differs from the confirmed one, which
//! is how a previously-unavailable nickname gets reclaimed once free.
//!
//! All transitions run under the session lock; this type itself is a
//! plain state machine whose methods return the wire line to send, if
//! any.

use std::time::{Duration, Instant};

/// A caller-initiated change inside this window coalesces into the
/// in-flight one instead of sending a duplicate command.
const CHANGE_DEBOUNCE: Duration = Duration::from_secs(30);

/// Nicknames longer than this get the filler prefixed instead of
/// appended, matching common server length limits.
const SUFFIX_LIMIT: usize = 8;

/// Snapshot of the nickname state, as reported by
/// [`Session::nick_status`](crate::Session::nick_status).
#[derive(Debug, Clone)]
pub struct NickStatus {
    /// The nickname currently acknowledged by the server.
    pub current: String,
    /// The nickname the caller wants.
    pub desired: String,
    /// Whether registration has completed on this connection.
    pub confirmed: bool,
    /// True while `desired` differs from the acknowledged nickname.
    pub pending_change: bool,
    /// Last server rejection text, cleared on a successful change.
    pub last_error: String,
    /// When the nickname state last moved.
    pub last_change: Instant,
}

#[derive(Debug)]
pub(crate) struct Identity {
    desired: String,
    confirmed: String,
    pending: Option<String>,
    last_error: String,
    registered: bool,
    change_started: Option<Instant>,
    last_change: Instant,
}

impl Identity {
    pub fn new(nick: &str) -> Self {
        Self {
            desired: nick.to_string(),
            confirmed: nick.to_string(),
            pending: None,
            last_error: String::new(),
            registered: false,
            change_started: None,
            last_change: Instant::now(),
        }
    }

    pub fn current(&self) -> &str {
        &self.confirmed
    }

    pub fn desired(&self) -> &str {
        &self.desired
    }

    pub fn status(&self) -> NickStatus {
        NickStatus {
            current: self.confirmed.clone(),
            desired: self.desired.clone(),
            confirmed: self.registered,
            pending_change: self.desired != self.confirmed,
            last_error: self.last_error.clone(),
            last_change: self.last_change,
        }
    }

    /// Clear per-connection bookkeeping. Desired identity survives.
    pub fn reset_connection(&mut self) {
        self.registered = false;
        self.pending = None;
        self.change_started = None;
    }

    /// Registration is about to announce the desired nickname.
    pub fn begin_registration(&mut self) {
        self.pending = Some(self.desired.clone());
    }

    /// Registration succeeded; the server announced our nickname.
    pub fn on_welcome(&mut self, nick: &str) {
        self.confirmed = nick.to_string();
        self.desired = nick.to_string();
        self.pending = None;
        self.change_started = None;
        self.last_error.clear();
        self.registered = true;
        self.last_change = Instant::now();
    }

    /// A `NICK` change notification arrived. Only one sourced from the
    /// currently confirmed nickname may move `confirmed`; `desired`
    /// follows along only if it had not independently diverged, so a
    /// separately requested change is preserved for the retry path.
    pub fn on_nick_notification(&mut self, source_nick: &str, new_nick: &str) {
        if source_nick != self.confirmed || new_nick.is_empty() {
            return;
        }
        let old = std::mem::replace(&mut self.confirmed, new_nick.to_string());
        if self.desired == old {
            self.desired = new_nick.to_string();
        }
        self.pending = None;
        self.change_started = None;
        self.last_error.clear();
        self.last_change = Instant::now();
    }

    /// The server rejected a nickname (in use, erroneous, collision,
    /// unavailable, none given). Derives the next candidate from the
    /// pending value (else desired), stores it as pending and returns
    /// it for resending — the same way before and after registration.
    /// The restricted rejection (`484`) is terminal for this attempt.
    /// `confirmed` is never touched.
    pub fn on_rejection(&mut self, code: &str, text: &str) -> Option<String> {
        self.last_error = text.to_string();
        self.last_change = Instant::now();
        if code == "484" {
            self.change_started = None;
            return None;
        }
        let base = self.pending.take().unwrap_or_else(|| self.desired.clone());
        let alternative = if code == "432" {
            // The nickname itself was invalid; a filler won't help.
            format!("Err{base}")
        } else if base.len() > SUFFIX_LIMIT {
            format!("_{base}")
        } else {
            format!("{base}_")
        };
        self.pending = Some(alternative.clone());
        self.change_started = Some(Instant::now());
        Some(alternative)
    }

    /// Caller asked for a new nickname. Returns the value to announce,
    /// or `None` when the request coalesced into an in-flight change or
    /// already matches the acknowledged nickname.
    pub fn request_change(&mut self, nick: &str) -> Option<String> {
        self.last_change = Instant::now();
        if let Some(started) = self.change_started
            && started.elapsed() < CHANGE_DEBOUNCE
        {
            tracing::debug!(nick, "nickname change already in flight, coalescing");
            self.desired = nick.to_string();
            self.pending = Some(nick.to_string());
            return None;
        }
        self.desired = nick.to_string();
        if self.confirmed != nick {
            self.pending = Some(nick.to_string());
            self.change_started = Some(Instant::now());
            return Some(nick.to_string());
        }
        self.pending = None;
        self.change_started = None;
        None
    }

    /// Periodic check: when the desired nickname is not the confirmed
    /// one, re-announce it. This is the reclaim path for a nickname
    /// that was taken earlier and has since come free.
    pub fn reconcile(&mut self) -> Option<String> {
        if self.desired == self.confirmed {
            return None;
        }
        self.pending = Some(self.desired.clone());
        self.change_started = Some(Instant::now());
        Some(self.desired.clone())
    }
}
