//! Correlates outbound calls with the resolutions the peer sends back.
//!
//! Every tracked call id owns exactly one slot: waiting for a poller, holding
//! a callback pair, or holding an unread result. A resolution consumes the
//! slot once; the poll and callback paths never both observe the same result.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::ids::{CallId, CallIdGenerator};
use crate::wire::{Call, CallResult, PeerError};

pub type SuccessCallback = Box<dyn FnOnce(Value) + Send + Sync>;
pub type ErrorCallback = Box<dyn FnOnce(PeerError) + Send + Sync>;

enum Slot {
    /// Sent, nobody has registered a callback. A poller may be parked on the notify.
    Waiting(Arc<Notify>),
    Callback {
        on_ok: SuccessCallback,
        on_err: Option<ErrorCallback>,
    },
    /// Arrived before anyone consumed it.
    Resolved { result: CallResult, at: Instant },
}

enum Found {
    Callback { handles_result: bool },
    Waiting(Arc<Notify>),
    Resolved,
}

#[derive(Default)]
pub struct CallCorrelator {
    ids: CallIdGenerator,
    slots: DashMap<CallId, Slot>,
}

impl CallCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a call envelope with a fresh id. Does not track it.
    pub fn create_call(&self, target: impl Into<String>, args: Vec<Value>) -> Call {
        Call {
            id: self.ids.next_id(),
            name: target.into(),
            args,
        }
    }

    /// Start tracking a call that is about to be sent.
    pub fn track(&self, id: CallId) {
        self.slots
            .entry(id)
            .or_insert_with(|| Slot::Waiting(Arc::new(Notify::new())));
    }

    /// Wait up to `timeout` for the result of `id`.
    ///
    /// Returns `None` on timeout, when a callback took over the call, or when
    /// the correlator was cleared. A timeout consumes the pending slot.
    pub async fn await_result(&self, id: CallId, timeout: Duration) -> Option<CallResult> {
        let deadline = Instant::now() + timeout;
        let mut first = true;

        loop {
            if let Some(result) = self.take_resolved(id) {
                return Some(result);
            }

            let notify = match self.slots.entry(id) {
                Entry::Occupied(e) => match e.get() {
                    Slot::Waiting(n) => Arc::clone(n),
                    Slot::Callback { .. } => {
                        debug!(call_id = %id, "Result belongs to a registered callback");
                        return None;
                    }
                    Slot::Resolved { .. } => continue,
                },
                Entry::Vacant(e) => {
                    if !first {
                        return None;
                    }
                    let n = Arc::new(Notify::new());
                    e.insert(Slot::Waiting(Arc::clone(&n)));
                    n
                }
            };
            first = false;

            if tokio::time::timeout_at(deadline, notify.notified()).await.is_err() {
                if let Some(result) = self.take_resolved(id) {
                    return Some(result);
                }
                self.slots
                    .remove_if(&id, |_, slot| matches!(slot, Slot::Waiting(_)));
                debug!(call_id = %id, timeout_ms = timeout.as_millis() as u64, "Call timed out");
                return None;
            }
        }
    }

    /// Attach callbacks to `id`.
    ///
    /// If the result already arrived, the matching callback runs immediately.
    /// Returns `false` when there is nothing to attach to (the call was never
    /// tracked or its result was already consumed).
    pub fn register_callback(
        &self,
        id: CallId,
        on_ok: SuccessCallback,
        on_err: Option<ErrorCallback>,
    ) -> bool {
        let ready = match self.slots.entry(id) {
            Entry::Occupied(mut e) => {
                if let Slot::Resolved { result: Err(_), .. } = e.get() {
                    if on_err.is_none() {
                        debug!(call_id = %id, "Stored error left for polling");
                        return false;
                    }
                }
                if matches!(e.get(), Slot::Resolved { .. }) {
                    match e.remove() {
                        Slot::Resolved { result, .. } => Some(result),
                        _ => None,
                    }
                } else {
                    let displaced = e.insert(Slot::Callback { on_ok, on_err });
                    if let Slot::Waiting(n) = displaced {
                        // Release a poller so it stops waiting for this result.
                        n.notify_one();
                    }
                    trace!(call_id = %id, "Callback registered");
                    return true;
                }
            }
            Entry::Vacant(_) => {
                debug!(call_id = %id, "No pending call to attach a callback to");
                return false;
            }
        };

        if let Some(result) = ready {
            deliver(id, result, on_ok, on_err);
        }
        true
    }

    /// Record the peer's resolution of `id`.
    ///
    /// A registered callback runs and the slot is discarded. Otherwise the
    /// result is stored for a poller. An error with no error callback is also
    /// stored, so it stays observable.
    pub fn resolve(&self, id: CallId, result: CallResult) {
        let callbacks = match self.slots.entry(id) {
            Entry::Occupied(mut e) => {
                let found = match e.get() {
                    Slot::Callback { on_err, .. } => Found::Callback {
                        handles_result: result.is_ok() || on_err.is_some(),
                    },
                    Slot::Waiting(n) => Found::Waiting(Arc::clone(n)),
                    Slot::Resolved { .. } => Found::Resolved,
                };
                match found {
                    Found::Callback { handles_result: true } => match e.remove() {
                        Slot::Callback { on_ok, on_err } => (on_ok, on_err),
                        _ => return,
                    },
                    Found::Callback { handles_result: false } => {
                        e.insert(Slot::Resolved {
                            result,
                            at: Instant::now(),
                        });
                        return;
                    }
                    Found::Waiting(n) => {
                        e.insert(Slot::Resolved {
                            result,
                            at: Instant::now(),
                        });
                        n.notify_one();
                        return;
                    }
                    Found::Resolved => {
                        warn!(call_id = %id, "Duplicate resolution ignored");
                        return;
                    }
                }
            }
            Entry::Vacant(e) => {
                e.insert(Slot::Resolved {
                    result,
                    at: Instant::now(),
                });
                return;
            }
        };

        let (on_ok, on_err) = callbacks;
        deliver(id, result, on_ok, on_err);
    }

    /// Drop unread results older than `ttl`. Returns how many were dropped.
    pub fn sweep_expired(&self, ttl: Duration) -> usize {
        let mut removed = 0;
        self.slots.retain(|_, slot| match slot {
            Slot::Resolved { at, .. } if at.elapsed() >= ttl => {
                removed += 1;
                false
            }
            _ => true,
        });
        removed
    }

    /// Calls still waiting for a resolution.
    pub fn pending_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|e| !matches!(e.value(), Slot::Resolved { .. }))
            .count()
    }

    /// Results that arrived but were never consumed.
    pub fn unread_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|e| matches!(e.value(), Slot::Resolved { .. }))
            .count()
    }

    /// Forget every call, releasing parked pollers.
    pub fn clear(&self) {
        for entry in self.slots.iter() {
            if let Slot::Waiting(n) = entry.value() {
                n.notify_one();
            }
        }
        self.slots.clear();
    }

    fn take_resolved(&self, id: CallId) -> Option<CallResult> {
        match self
            .slots
            .remove_if(&id, |_, slot| matches!(slot, Slot::Resolved { .. }))
        {
            Some((_, Slot::Resolved { result, .. })) => Some(result),
            _ => None,
        }
    }
}

fn deliver(id: CallId, result: CallResult, on_ok: SuccessCallback, on_err: Option<ErrorCallback>) {
    match result {
        Ok(value) => on_ok(value),
        Err(error) => match on_err {
            Some(f) => f(error),
            None => warn!(call_id = %id, error = %error, "Peer call failed with no error callback"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    fn capture() -> (Arc<Mutex<Vec<Value>>>, SuccessCallback) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, Box::new(move |v| sink.lock().push(v)))
    }

    fn capture_err() -> (Arc<Mutex<Vec<PeerError>>>, ErrorCallback) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, Box::new(move |e| sink.lock().push(e)))
    }

    fn peer_error(text: &str) -> PeerError {
        PeerError {
            error_text: text.into(),
            error_traceback: "trace".into(),
        }
    }

    #[test]
    fn create_call_allocates_distinct_ids() {
        let c = CallCorrelator::new();
        let a = c.create_call("js_random", vec![]);
        let b = c.create_call("js_random", vec![]);
        assert_ne!(a.id, b.id);
        assert_eq!(a.name, "js_random");
        assert_eq!(c.pending_count(), 0);
    }

    #[tokio::test]
    async fn poll_returns_stored_value() {
        let c = CallCorrelator::new();
        let call = c.create_call("f", vec![]);
        c.track(call.id);
        c.resolve(call.id, Ok(json!(42)));

        let result = c.await_result(call.id, Duration::from_millis(10)).await;
        assert_eq!(result, Some(Ok(json!(42))));
        assert_eq!(c.unread_count(), 0);
        assert_eq!(c.pending_count(), 0);
    }

    #[tokio::test]
    async fn poll_wakes_when_resolution_arrives() {
        let c = Arc::new(CallCorrelator::new());
        let call = c.create_call("f", vec![]);
        c.track(call.id);

        let resolver = Arc::clone(&c);
        let id = call.id;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            resolver.resolve(id, Ok(json!("late")));
        });

        let result = c.await_result(call.id, Duration::from_secs(5)).await;
        assert_eq!(result, Some(Ok(json!("late"))));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_times_out_after_deadline() {
        let c = CallCorrelator::new();
        let call = c.create_call("f", vec![]);
        c.track(call.id);

        let start = Instant::now();
        let result = c.await_result(call.id, Duration::from_millis(500)).await;
        let waited = start.elapsed();

        assert!(result.is_none());
        assert!(waited >= Duration::from_millis(500), "returned early: {waited:?}");
        assert!(waited < Duration::from_millis(600), "returned late: {waited:?}");
        assert_eq!(c.pending_count(), 0);
    }

    #[test]
    fn callback_receives_value() {
        let c = CallCorrelator::new();
        let call = c.create_call("f", vec![]);
        c.track(call.id);
        let (seen, on_ok) = capture();

        assert!(c.register_callback(call.id, on_ok, None));
        c.resolve(call.id, Ok(json!(7)));

        assert_eq!(*seen.lock(), vec![json!(7)]);
        assert_eq!(c.pending_count(), 0);
        assert_eq!(c.unread_count(), 0);
    }

    #[test]
    fn callback_registered_after_resolution_fires_immediately() {
        let c = CallCorrelator::new();
        let call = c.create_call("f", vec![]);
        c.track(call.id);
        c.resolve(call.id, Ok(json!("early")));

        let (seen, on_ok) = capture();
        assert!(c.register_callback(call.id, on_ok, None));
        assert_eq!(*seen.lock(), vec![json!("early")]);
        assert_eq!(c.unread_count(), 0);
    }

    #[tokio::test]
    async fn late_success_callback_leaves_stored_error() {
        let c = CallCorrelator::new();
        let call = c.create_call("f", vec![]);
        c.track(call.id);
        c.resolve(call.id, Err(peer_error("early failure")));

        let (seen, on_ok) = capture();
        assert!(!c.register_callback(call.id, on_ok, None));
        assert!(seen.lock().is_empty());

        let result = c.await_result(call.id, Duration::from_millis(10)).await;
        assert_eq!(result.unwrap().unwrap_err().error_text, "early failure");
    }

    #[tokio::test]
    async fn callback_after_consumed_result_is_noop() {
        let c = CallCorrelator::new();
        let call = c.create_call("f", vec![]);
        c.track(call.id);
        c.resolve(call.id, Ok(json!(1)));
        assert!(c.await_result(call.id, Duration::from_millis(10)).await.is_some());

        let (seen, on_ok) = capture();
        assert!(!c.register_callback(call.id, on_ok, None));
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn error_callback_receives_peer_error() {
        let c = CallCorrelator::new();
        let call = c.create_call("js_with_error", vec![]);
        c.track(call.id);
        let (oks, on_ok) = capture();
        let (errs, on_err) = capture_err();

        c.register_callback(call.id, on_ok, Some(on_err));
        c.resolve(call.id, Err(peer_error("ReferenceError")));

        assert!(oks.lock().is_empty());
        assert_eq!(errs.lock()[0].error_text, "ReferenceError");
    }

    #[tokio::test]
    async fn error_without_error_callback_is_kept_for_polling() {
        let c = CallCorrelator::new();
        let call = c.create_call("f", vec![]);
        c.track(call.id);
        let (oks, on_ok) = capture();
        c.register_callback(call.id, on_ok, None);

        c.resolve(call.id, Err(peer_error("nope")));
        assert!(oks.lock().is_empty());
        assert_eq!(c.unread_count(), 1);

        let result = c.await_result(call.id, Duration::from_millis(10)).await;
        assert_eq!(result.unwrap().unwrap_err().error_text, "nope");
    }

    #[tokio::test]
    async fn callback_replaces_waiting_poller() {
        let c = Arc::new(CallCorrelator::new());
        let call = c.create_call("f", vec![]);
        c.track(call.id);

        let poller = Arc::clone(&c);
        let id = call.id;
        let poll = tokio::spawn(async move { poller.await_result(id, Duration::from_secs(5)).await });
        tokio::task::yield_now().await;

        let (seen, on_ok) = capture();
        c.register_callback(call.id, on_ok, None);
        c.resolve(call.id, Ok(json!("cb")));

        assert!(poll.await.unwrap().is_none());
        assert_eq!(*seen.lock(), vec![json!("cb")]);
    }

    #[test]
    fn out_of_order_resolutions_stay_independent() {
        let c = CallCorrelator::new();
        let first = c.create_call("a", vec![]);
        let second = c.create_call("b", vec![]);
        c.track(first.id);
        c.track(second.id);
        let (seen_first, on_first) = capture();
        let (seen_second, on_second) = capture();
        c.register_callback(first.id, on_first, None);
        c.register_callback(second.id, on_second, None);

        c.resolve(second.id, Ok(json!(2)));
        assert!(seen_first.lock().is_empty());
        assert_eq!(c.pending_count(), 1);

        c.resolve(first.id, Ok(json!(1)));
        assert_eq!(*seen_first.lock(), vec![json!(1)]);
        assert_eq!(*seen_second.lock(), vec![json!(2)]);
    }

    #[tokio::test]
    async fn two_calls_to_same_target_are_distinguished_by_id() {
        let c = CallCorrelator::new();
        let a = c.create_call("js_random", vec![]);
        let b = c.create_call("js_random", vec![]);
        c.track(a.id);
        c.track(b.id);
        c.resolve(b.id, Ok(json!("b")));
        c.resolve(a.id, Ok(json!("a")));

        assert_eq!(c.await_result(a.id, Duration::from_millis(1)).await, Some(Ok(json!("a"))));
        assert_eq!(c.await_result(b.id, Duration::from_millis(1)).await, Some(Ok(json!("b"))));
    }

    #[test]
    fn duplicate_resolution_is_ignored() {
        let c = CallCorrelator::new();
        let call = c.create_call("f", vec![]);
        c.track(call.id);
        c.resolve(call.id, Ok(json!("first")));
        c.resolve(call.id, Ok(json!("second")));

        let (seen, on_ok) = capture();
        c.register_callback(call.id, on_ok, None);
        assert_eq!(*seen.lock(), vec![json!("first")]);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_drops_only_expired_unread_results() {
        let c = CallCorrelator::new();
        let old = c.create_call("f", vec![]);
        c.resolve(old.id, Ok(json!(1)));

        tokio::time::advance(Duration::from_secs(120)).await;

        let fresh = c.create_call("f", vec![]);
        c.resolve(fresh.id, Ok(json!(2)));
        let pending = c.create_call("f", vec![]);
        c.track(pending.id);

        assert_eq!(c.sweep_expired(Duration::from_secs(60)), 1);
        assert_eq!(c.unread_count(), 1);
        assert_eq!(c.pending_count(), 1);
    }

    #[tokio::test]
    async fn clear_releases_pollers() {
        let c = Arc::new(CallCorrelator::new());
        let call = c.create_call("f", vec![]);
        c.track(call.id);

        let poller = Arc::clone(&c);
        let id = call.id;
        let poll = tokio::spawn(async move { poller.await_result(id, Duration::from_secs(30)).await });
        tokio::task::yield_now().await;

        c.clear();
        let result = tokio::time::timeout(Duration::from_secs(1), poll).await.unwrap().unwrap();
        assert!(result.is_none());
    }
}
