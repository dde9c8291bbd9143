//! Callback registration and concurrent event fan-out.
//!
//! Callbacks are keyed by event code (`"*"` matches everything) and run
//! concurrently per dispatched event. An optional per-dispatch timeout
//! bounds how long dispatch waits; callbacks still running when it
//! elapses are abandoned — logged, never forcibly cancelled — so a
//! pathological handler can leak a task but cannot stall the reader.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinSet;

use crate::message::Event;
use crate::session::SessionHandle;

/// Identifier returned by callback registration, for later removal or
/// replacement. Monotonically assigned.
pub type CallbackId = u64;

/// The future type callbacks return; build it with `Box::pin(async move { .. })`.
pub type BoxFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

pub(crate) type Callback = Arc<dyn Fn(SessionHandle, Arc<Event>) -> BoxFuture + Send + Sync>;

#[derive(Default)]
struct RegistryInner {
    events: HashMap<String, Vec<(CallbackId, Callback)>>,
    next_id: CallbackId,
}

/// Event-code → ordered callback list, with a `"*"` wildcard bucket.
#[derive(Default)]
pub(crate) struct Registry {
    inner: Mutex<RegistryInner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, code: &str, callback: Callback) -> CallbackId {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner
            .events
            .entry(normalize(code))
            .or_default()
            .push((id, callback));
        id
    }

    pub fn remove(&self, code: &str, id: CallbackId) -> bool {
        let mut inner = self.inner.lock();
        if let Some(list) = inner.events.get_mut(&normalize(code))
            && let Some(pos) = list.iter().position(|(cb_id, _)| *cb_id == id)
        {
            list.remove(pos);
            return true;
        }
        tracing::debug!(code, id, "no such callback to remove");
        false
    }

    pub fn clear(&self, code: &str) -> bool {
        self.inner.lock().events.remove(&normalize(code)).is_some()
    }

    pub fn replace(&self, code: &str, id: CallbackId, callback: Callback) -> bool {
        let mut inner = self.inner.lock();
        if let Some(list) = inner.events.get_mut(&normalize(code))
            && let Some(slot) = list.iter_mut().find(|(cb_id, _)| *cb_id == id)
        {
            slot.1 = callback;
            return true;
        }
        tracing::debug!(code, id, "no such callback to replace");
        false
    }

    /// Copy of the matching list plus the wildcard list, taken under
    /// the lock so callback execution never blocks registration.
    fn snapshot(&self, code: &str) -> Vec<(CallbackId, Callback)> {
        let inner = self.inner.lock();
        let mut out = Vec::new();
        if let Some(list) = inner.events.get(code) {
            out.extend(list.iter().cloned());
        }
        if code != "*"
            && let Some(list) = inner.events.get("*")
        {
            out.extend(list.iter().cloned());
        }
        out
    }
}

fn normalize(code: &str) -> String {
    code.to_ascii_uppercase()
}

/// Rewrite a `PRIVMSG` carrying a `\x01`-framed client-to-client
/// payload to its CTCP sub-code and strip the framing. Returns `false`
/// when the frame is unterminated and the event should be dropped.
pub(crate) fn reclassify_ctcp(event: &mut Event) -> bool {
    if event.code != "PRIVMSG" {
        return true;
    }
    let msg = event.message().to_string();
    if msg.len() <= 2 || !msg.starts_with('\u{1}') {
        return true;
    }
    let Some(end) = msg.rfind('\u{1}').filter(|end| *end > 0) else {
        tracing::warn!(raw = %event.raw, "invalid CTCP framing, dropping event");
        return false;
    };
    let mut inner = msg[1..end].to_string();

    event.code = if inner == "VERSION" {
        "CTCP_VERSION".to_string()
    } else if inner == "TIME" {
        "CTCP_TIME".to_string()
    } else if inner == "USERINFO" {
        "CTCP_USERINFO".to_string()
    } else if inner == "CLIENTINFO" {
        "CTCP_CLIENTINFO".to_string()
    } else if inner.starts_with("PING") {
        "CTCP_PING".to_string()
    } else if inner.starts_with("ACTION") {
        inner = inner.get(7..).unwrap_or_default().to_string();
        "CTCP_ACTION".to_string()
    } else if inner.starts_with("DCC") {
        "CTCP_DCC".to_string()
    } else {
        "CTCP".to_string()
    };

    if let Some(last) = event.arguments.last_mut() {
        *last = inner;
    }
    true
}

/// Run every registered callback for this event concurrently, waiting
/// for all of them or for `timeout`.
pub(crate) async fn dispatch(
    registry: &Registry,
    handle: SessionHandle,
    mut event: Event,
    timeout: Option<Duration>,
) {
    if !reclassify_ctcp(&mut event) {
        return;
    }
    let callbacks = registry.snapshot(&event.code);
    if callbacks.is_empty() {
        return;
    }

    let code = event.code.clone();
    let event = Arc::new(event);
    let mut set = JoinSet::new();
    for (id, callback) in callbacks {
        let handle = handle.clone();
        let event = Arc::clone(&event);
        set.spawn(async move { (id, callback(handle, event).await) });
    }

    let drain = async {
        while let Some(joined) = set.join_next().await {
            if let Ok((id, Err(error))) = joined {
                tracing::warn!(callback = id, code = %code, error = %error, "callback failed");
            }
        }
    };

    match timeout {
        Some(limit) => {
            let timed_out = tokio::time::timeout(limit, drain).await.is_err();
            if timed_out {
                tracing::warn!(
                    code = %code,
                    abandoned = set.len(),
                    "callback timeout elapsed, abandoning unfinished callbacks"
                );
                set.detach_all();
            }
        }
        None => drain.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn privmsg(text: &str) -> Event {
        Event::parse(&format!(":bob!u@h PRIVMSG alice :{text}")).unwrap()
    }

    fn noop() -> Callback {
        Arc::new(|_, _| Box::pin(async { Ok(()) }))
    }

    #[test]
    fn ctcp_version_is_reclassified() {
        let mut event = privmsg("\u{1}VERSION\u{1}");
        assert!(reclassify_ctcp(&mut event));
        assert_eq!(event.code, "CTCP_VERSION");
        assert_eq!(event.message(), "VERSION");
    }

    #[test]
    fn ctcp_action_strips_the_verb() {
        let mut event = privmsg("\u{1}ACTION waves hello\u{1}");
        assert!(reclassify_ctcp(&mut event));
        assert_eq!(event.code, "CTCP_ACTION");
        assert_eq!(event.message(), "waves hello");
    }

    #[test]
    fn ctcp_dcc_and_unknown_subcommands() {
        let mut event = privmsg("\u{1}DCC CHAT chat 2130706433 4321\u{1}");
        assert!(reclassify_ctcp(&mut event));
        assert_eq!(event.code, "CTCP_DCC");
        assert_eq!(event.message(), "DCC CHAT chat 2130706433 4321");

        let mut event = privmsg("\u{1}SOMETHINGELSE\u{1}");
        assert!(reclassify_ctcp(&mut event));
        assert_eq!(event.code, "CTCP");
    }

    #[test]
    fn unterminated_ctcp_frame_drops_the_event() {
        let mut event = privmsg("\u{1}VERSION");
        assert!(!reclassify_ctcp(&mut event));
    }

    #[test]
    fn plain_privmsg_is_untouched() {
        let mut event = privmsg("just a message");
        assert!(reclassify_ctcp(&mut event));
        assert_eq!(event.code, "PRIVMSG");
    }

    #[test]
    fn registry_ids_are_monotonic_and_removable() {
        let registry = Registry::new();
        let a = registry.add("privmsg", noop());
        let b = registry.add("PRIVMSG", noop());
        assert!(b > a);
        assert_eq!(registry.snapshot("PRIVMSG").len(), 2);

        assert!(registry.remove("privmsg", a));
        assert!(!registry.remove("PRIVMSG", a));
        assert_eq!(registry.snapshot("PRIVMSG").len(), 1);

        assert!(registry.replace("PRIVMSG", b, noop()));
        assert!(!registry.replace("PRIVMSG", 9999, noop()));

        assert!(registry.clear("PRIVMSG"));
        assert!(!registry.clear("PRIVMSG"));
        assert!(registry.snapshot("PRIVMSG").is_empty());
    }

    #[test]
    fn wildcard_callbacks_are_included_in_snapshots() {
        let registry = Registry::new();
        registry.add("*", noop());
        registry.add("JOIN", noop());
        assert_eq!(registry.snapshot("JOIN").len(), 2);
        assert_eq!(registry.snapshot("PART").len(), 1);
        assert_eq!(registry.snapshot("*").len(), 1);
    }

    #[tokio::test]
    async fn dispatch_runs_matching_and_wildcard_callbacks() {
        let registry = Registry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for code in ["PRIVMSG", "*"] {
            let hits = Arc::clone(&hits);
            registry.add(
                code,
                Arc::new(move |_, event| {
                    let hits = Arc::clone(&hits);
                    Box::pin(async move {
                        assert_eq!(event.code, "PRIVMSG");
                        hits.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                }),
            );
        }
        let handle = crate::session::Session::new("n", "u").unwrap().handle();
        dispatch(&registry, handle, privmsg("hello"), None).await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_abandons_callbacks_past_the_timeout() {
        let registry = Registry::new();
        let finished = Arc::new(AtomicUsize::new(0));
        {
            let finished = Arc::clone(&finished);
            registry.add(
                "PRIVMSG",
                Arc::new(move |_, _| {
                    let finished = Arc::clone(&finished);
                    Box::pin(async move {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        finished.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                }),
            );
        }
        let handle = crate::session::Session::new("n", "u").unwrap().handle();
        dispatch(
            &registry,
            handle,
            privmsg("hello"),
            Some(Duration::from_millis(50)),
        )
        .await;
        // Dispatch returned without the callback having completed.
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn callback_errors_are_contained() {
        let registry = Registry::new();
        registry.add(
            "PRIVMSG",
            Arc::new(|_, _| Box::pin(async { Err(anyhow::anyhow!("handler exploded")) })),
        );
        let handle = crate::session::Session::new("n", "u").unwrap().handle();
        // Must not panic or propagate.
        dispatch(&registry, handle, privmsg("hello"), None).await;
    }
}
