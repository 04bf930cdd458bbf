//! Publish/subscribe bus shared by the devices of one process.
//!
//! Two kinds of listeners:
//! - persistent subscribers, called in priority order on every publish;
//! - one-shot waiters, which receive the next publish of their event once and
//!   are then dropped. A waiter is a channel end, so a thread can block on it
//!   with a timeout.
//!
//! Subscribers run on the publishing thread with no bus lock held, so a
//! subscriber may publish or subscribe itself.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use indexmap::IndexMap;
use parking_lot::Mutex;
use regex::Regex;
use tracing::{debug, trace};

pub const EXPERIMENT_EXECUTION: &str = "experiment execution";
pub const UPDATE_STATUS_LIGHT: &str = "update status light";
pub const PREPARE_FOR_EXPERIMENT: &str = "prepare for experiment";
pub const CLEANUP_AFTER_EXPERIMENT: &str = "cleanup after experiment";
pub const USER_ABORT: &str = "user abort";

pub const DEFAULT_PRIORITY: i32 = 100;

/// Status-light update, shown by the GUI next to the device.
#[derive(Clone, Debug, PartialEq)]
pub struct StatusUpdate {
    pub key: String,
    pub text: String,
    pub color: (u8, u8, u8),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    None,
    Status(StatusUpdate),
    Text(String),
}

pub type Handler = Arc<dyn Fn(&Payload) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// How a one-shot wait ended.
#[derive(Clone, Debug, PartialEq)]
pub enum WaitOutcome {
    Fired(Payload),
    /// The waiter was cleared, e.g. by a user abort.
    Cleared,
    TimedOut,
}

enum Signal {
    Fired(Payload),
    Cleared,
}

struct Subscriber {
    id: u64,
    priority: i32,
    handler: Handler,
}

struct Waiter {
    id: u64,
    tx: Sender<Signal>,
}

/// Pending one-shot subscription. Dropping it without waiting is harmless.
pub struct OneShot {
    event: String,
    id: u64,
    rx: Receiver<Signal>,
}

impl OneShot {
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Blocks until the event is published, the waiter is cleared, or
    /// `timeout` expires. `None` waits forever.
    pub fn wait(&self, timeout: Option<Duration>) -> WaitOutcome {
        let received = match timeout {
            Some(timeout) => self.rx.recv_timeout(timeout),
            None => self
                .rx
                .recv()
                .map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok(Signal::Fired(payload)) => WaitOutcome::Fired(payload),
            Ok(Signal::Cleared) | Err(RecvTimeoutError::Disconnected) => WaitOutcome::Cleared,
            Err(RecvTimeoutError::Timeout) => WaitOutcome::TimedOut,
        }
    }
}

#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<IndexMap<String, Vec<Subscriber>>>,
    one_shots: Mutex<IndexMap<String, Vec<Waiter>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn fresh_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Calls the subscribers of `event`, lowest priority value first, then
    /// releases its one-shot waiters. Publishing [`USER_ABORT`] clears every
    /// one-shot waiter instead.
    pub fn publish(&self, event: &str, payload: Payload) {
        trace!(event, "publish");
        let handlers: Vec<Handler> = self
            .subscribers
            .lock()
            .get(event)
            .map(|subs| subs.iter().map(|s| s.handler.clone()).collect())
            .unwrap_or_default();
        for handler in handlers {
            handler(&payload);
        }

        if event == USER_ABORT {
            self.clear_one_shot(None);
            return;
        }
        let waiters = self.one_shots.lock().shift_remove(event);
        for waiter in waiters.into_iter().flatten() {
            // The receiver may have given up already
            let _ = waiter.tx.send(Signal::Fired(payload.clone()));
        }
    }

    pub fn subscribe(
        &self,
        event: &str,
        priority: i32,
        handler: impl Fn(&Payload) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self.fresh_id();
        let mut subscribers = self.subscribers.lock();
        let subs = subscribers.entry(event.to_string()).or_default();
        subs.push(Subscriber {
            id,
            priority,
            handler: Arc::new(handler),
        });
        // Stable: equal priorities keep subscription order
        subs.sort_by_key(|s| s.priority);
        SubscriptionId(id)
    }

    pub fn unsubscribe(&self, event: &str, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock();
        let Some(subs) = subscribers.get_mut(event) else {
            return false;
        };
        let before = subs.len();
        subs.retain(|s| s.id != id.0);
        before != subs.len()
    }

    pub fn num_subscribers(&self, event: &str) -> usize {
        self.subscribers.lock().get(event).map_or(0, Vec::len)
    }

    pub fn num_one_shots(&self, event: &str) -> usize {
        self.one_shots.lock().get(event).map_or(0, Vec::len)
    }

    /// Registers a waiter for the next publish of `event`.
    pub fn one_shot(&self, event: &str) -> OneShot {
        let (tx, rx) = channel::bounded(1);
        let id = self.fresh_id();
        self.one_shots
            .lock()
            .entry(event.to_string())
            .or_default()
            .push(Waiter { id, tx });
        OneShot {
            event: event.to_string(),
            id,
            rx,
        }
    }

    /// Removes a waiter that was never released.
    pub fn cancel(&self, one_shot: &OneShot) {
        let mut one_shots = self.one_shots.lock();
        if let Some(waiters) = one_shots.get_mut(&one_shot.event) {
            waiters.retain(|w| w.id != one_shot.id);
            if waiters.is_empty() {
                one_shots.shift_remove(&one_shot.event);
            }
        }
    }

    /// Releases one-shot waiters as [`WaitOutcome::Cleared`]: all of them, or
    /// those whose event name matches `pattern` at its start.
    pub fn clear_one_shot(&self, pattern: Option<&Regex>) -> usize {
        let cleared: Vec<Waiter> = {
            let mut one_shots = self.one_shots.lock();
            match pattern {
                None => one_shots.drain(..).flat_map(|(_, w)| w).collect(),
                Some(re) => {
                    let matching: Vec<String> = one_shots
                        .keys()
                        .filter(|event| re.find(event).map_or(false, |m| m.start() == 0))
                        .cloned()
                        .collect();
                    matching
                        .iter()
                        .filter_map(|event| one_shots.shift_remove(event))
                        .flatten()
                        .collect()
                }
            }
        };
        if !cleared.is_empty() {
            debug!(count = cleared.len(), "cleared one-shot waiters");
        }
        for waiter in &cleared {
            let _ = waiter.tx.send(Signal::Cleared);
        }
        cleared.len()
    }

    /// Registers a waiter for `event`, runs `f` and blocks for the event.
    ///
    /// The waiter exists before `f` runs, so `f` may publish the event
    /// synchronously. If `f` fails or the wait times out the waiter is removed.
    pub fn execute_and_wait_for<E>(
        &self,
        event: &str,
        timeout: Option<Duration>,
        f: impl FnOnce() -> Result<(), E>,
    ) -> Result<WaitOutcome, E> {
        let waiter = self.one_shot(event);
        if let Err(err) = f() {
            self.cancel(&waiter);
            return Err(err);
        }
        let outcome = waiter.wait(timeout);
        if outcome == WaitOutcome::TimedOut {
            self.cancel(&waiter);
        }
        Ok(outcome)
    }
}
