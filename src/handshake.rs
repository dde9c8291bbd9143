//! Capability negotiation and SASL authentication.
//!
//! The engine is a synchronous state machine driven by `CAP`,
//! `AUTHENTICATE` and the SASL result numerics; its methods return the
//! wire lines to send. Timers (the registration fallback and the
//! listing timeout) live in the session's watchdog task.
//!
//! Phases: `Idle → Listing → Requesting → Ended`. Registration is sent
//! exactly once per connection attempt — immediately when no
//! capabilities are wanted, upon the `CAP LS` reply, or via the
//! fallback timer, whichever comes first. `CAP END` goes out once every
//! requested capability has been acknowledged or rejected and any SASL
//! exchange has settled. A server that never answers `CAP LS` is not an
//! error: negotiation is abandoned silently after the listing timeout.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::config::Config;

/// How long to wait for the server to engage with `CAP LS`, and the
/// bound on the whole SASL exchange.
pub(crate) const CAP_TIMEOUT: Duration = Duration::from_secs(15);

/// If no `CAP LS` reply has arrived by then, send registration anyway
/// to avoid ping timeouts on networks without capability support.
pub(crate) const REGISTRATION_FALLBACK: Duration = Duration::from_millis(800);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Idle,
    Listing,
    Requesting,
    Ended,
}

/// Terminal result of the SASL exchange.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SaslOutcome {
    Success,
    Failure(String),
}

/// What a `CAP` reply asks the session to do.
#[derive(Debug, Default)]
pub(crate) struct CapOutcome {
    pub lines: Vec<String>,
    /// Registration should be sent now (the idempotency flag was just
    /// consumed by this reply).
    pub register_now: bool,
    pub sasl: Option<SaslOutcome>,
}

#[derive(Debug)]
pub(crate) struct Handshake {
    phase: Phase,
    want: Vec<String>,
    acknowledged: Vec<String>,
    outstanding: usize,
    sasl_enabled: bool,
    sasl_mechanism: String,
    sasl_login: String,
    sasl_password: String,
    sasl_in_progress: bool,
    sasl_settled: bool,
    sent_registration: bool,
}

impl Handshake {
    pub fn new(config: &Config) -> Self {
        let mut want = config.request_caps.clone();
        if config.use_sasl && !want.iter().any(|c| c == "sasl") {
            want.push("sasl".to_string());
        }
        Self {
            phase: Phase::Idle,
            want,
            acknowledged: Vec::new(),
            outstanding: 0,
            sasl_enabled: config.use_sasl,
            sasl_mechanism: config.sasl_mechanism.clone(),
            sasl_login: config.sasl_login.clone(),
            sasl_password: config.sasl_password.clone(),
            sasl_in_progress: false,
            sasl_settled: false,
            sent_registration: false,
        }
    }

    #[cfg(test)]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn acknowledged(&self) -> &[String] {
        &self.acknowledged
    }

    /// Lines to send when the connection opens. The returned flag asks
    /// the session to send registration immediately (no capabilities
    /// were requested).
    pub fn begin(&mut self) -> (Vec<String>, bool) {
        if self.want.is_empty() {
            self.phase = Phase::Ended;
            (Vec::new(), self.take_registration())
        } else {
            self.phase = Phase::Listing;
            (vec!["CAP LS 302".to_string()], false)
        }
    }

    /// Consume the one-shot registration flag.
    pub fn take_registration(&mut self) -> bool {
        !std::mem::replace(&mut self.sent_registration, true)
    }

    /// Handle a `CAP` reply (`arguments` as parsed off the wire:
    /// `[target, subcommand, .., caps]`).
    pub fn on_cap(&mut self, arguments: &[String]) -> CapOutcome {
        let mut out = CapOutcome::default();
        let sub = arguments.get(1).map(|s| s.to_ascii_uppercase());
        let caps = arguments.last().map(String::as_str).unwrap_or("");
        match sub.as_deref() {
            Some("LS") => {
                // The server is alive and talking: registration can go
                // out now, ahead of the fallback timer.
                out.register_now = self.take_registration();
                if self.phase != Phase::Listing {
                    return out;
                }
                self.phase = Phase::Requesting;
                self.outstanding = self.want.len();
                let mut matched = 0usize;
                for token in caps.split_whitespace() {
                    // CAP LS 302 may advertise values: `sasl=PLAIN,EXTERNAL`
                    let name = token.split('=').next().unwrap_or(token);
                    if self.want.iter().any(|w| w == name) {
                        out.lines.push(format!("CAP REQ :{name}"));
                        matched += 1;
                    }
                }
                // Capabilities the server doesn't offer resolve now.
                self.outstanding = matched;
                if self.sasl_enabled
                    && !self.sasl_settled
                    && !caps
                        .split_whitespace()
                        .any(|t| t.split('=').next() == Some("sasl"))
                {
                    self.sasl_settled = true;
                    out.sasl = Some(SaslOutcome::Failure(
                        "server does not support sasl".to_string(),
                    ));
                }
            }
            Some("ACK") | Some("NAK") => {
                let ack = sub.as_deref() == Some("ACK");
                for cap in caps.trim().split_whitespace() {
                    if ack {
                        self.acknowledged.push(cap.to_string());
                        if cap == "sasl" && self.sasl_enabled && !self.sasl_settled {
                            self.sasl_in_progress = true;
                            out.lines
                                .push(format!("AUTHENTICATE {}", self.sasl_mechanism));
                        }
                    } else if cap == "sasl" && self.sasl_enabled && !self.sasl_settled {
                        self.sasl_settled = true;
                        out.sasl = Some(SaslOutcome::Failure(
                            "server refused the sasl capability".to_string(),
                        ));
                    }
                    self.outstanding = self.outstanding.saturating_sub(1);
                }
            }
            _ => {}
        }
        out
    }

    /// The server's `AUTHENTICATE` challenge. For PLAIN the reply is
    /// `base64(login NUL login NUL password)`; EXTERNAL sends `+`.
    pub fn on_authenticate(&mut self, _challenge: &str) -> Vec<String> {
        if !self.sasl_in_progress {
            return Vec::new();
        }
        let payload = if self.sasl_mechanism.eq_ignore_ascii_case("EXTERNAL") {
            "+".to_string()
        } else {
            let raw = format!(
                "{login}\0{login}\0{password}",
                login = self.sasl_login,
                password = self.sasl_password
            );
            BASE64.encode(raw.as_bytes())
        };
        vec![format!("AUTHENTICATE {payload}")]
    }

    /// A SASL result numeric (903 success; 904/905/906 failure).
    pub fn on_sasl_result(&mut self, code: &str, text: &str) -> Option<SaslOutcome> {
        if self.sasl_settled {
            return None;
        }
        self.sasl_in_progress = false;
        self.sasl_settled = true;
        if code == "903" {
            Some(SaslOutcome::Success)
        } else {
            Some(SaslOutcome::Failure(text.to_string()))
        }
    }

    /// `CAP END`, once negotiation has fully resolved. Idempotent.
    pub fn maybe_end(&mut self) -> Option<String> {
        if self.phase == Phase::Requesting && self.outstanding == 0 && !self.sasl_in_progress {
            self.phase = Phase::Ended;
            Some("CAP END".to_string())
        } else {
            None
        }
    }

    /// The server never answered `CAP LS`. Negotiation is abandoned
    /// without `CAP END`; absent capability support is not an error.
    pub fn listing_timed_out(&mut self) -> bool {
        if self.phase == Phase::Listing {
            self.phase = Phase::Ended;
            true
        } else {
            false
        }
    }
}
