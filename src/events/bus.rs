//! Publish/subscribe event bus with bounded history.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::event::{Event, EventType};
use crate::config::DEFAULT_MAX_HISTORY;
use crate::{dlog_error, dlog_trace, Result};

/// Callback invoked for every matching event.
///
/// An `Err` return is logged and otherwise ignored.
pub type Subscriber = Arc<dyn Fn(&Event) -> Result<()> + Send + Sync>;

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct BusState {
    history: VecDeque<Event>,
    by_type: HashMap<EventType, Vec<(SubscriptionId, Subscriber)>>,
    wildcard: Vec<(SubscriptionId, Subscriber)>,
}

struct Inner {
    state: Mutex<BusState>,
    max_history: usize,
    next_id: AtomicU64,
}

/// Clonable handle to a shared event bus.
///
/// The internal lock guards history and the subscriber table only. Callbacks
/// run after it is released, so a callback may publish or subscribe itself.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_max_history(DEFAULT_MAX_HISTORY)
    }

    pub fn with_max_history(max_history: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BusState {
                    history: VecDeque::with_capacity(max_history.min(1024)),
                    by_type: HashMap::new(),
                    wildcard: Vec::new(),
                }),
                max_history,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn max_history(&self) -> usize {
        self.inner.max_history
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        // A panicking subscriber never holds this lock, but recover anyway.
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_subscription(&self) -> SubscriptionId {
        SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register `callback` for one event type.
    pub fn subscribe<F>(&self, event_type: EventType, callback: F) -> SubscriptionId
    where
        F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
    {
        let id = self.next_subscription();
        self.lock()
            .by_type
            .entry(event_type)
            .or_default()
            .push((id, Arc::new(callback)));
        id
    }

    /// Register `callback` for every event type.
    pub fn subscribe_all<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
    {
        let id = self.next_subscription();
        self.lock().wildcard.push((id, Arc::new(callback)));
        id
    }

    /// Remove a subscription. Unknown ids are ignored.
    pub fn unsubscribe(&self, event_type: EventType, id: SubscriptionId) {
        let mut state = self.lock();
        if let Some(subs) = state.by_type.get_mut(&event_type) {
            subs.retain(|(sub_id, _)| *sub_id != id);
            if subs.is_empty() {
                state.by_type.remove(&event_type);
            }
        }
    }

    /// Remove a wildcard subscription. Unknown ids are ignored.
    pub fn unsubscribe_all(&self, id: SubscriptionId) {
        self.lock().wildcard.retain(|(sub_id, _)| *sub_id != id);
    }

    pub fn subscriber_count(&self, event_type: EventType) -> usize {
        let state = self.lock();
        state.by_type.get(&event_type).map_or(0, Vec::len) + state.wildcard.len()
    }

    /// Append `event` to history, then notify its subscribers.
    pub fn publish(&self, event: Event) {
        let subscribers: Vec<(SubscriptionId, Subscriber)> = {
            let mut state = self.lock();
            state.history.push_back(event.clone());
            while state.history.len() > self.inner.max_history {
                state.history.pop_front();
            }
            state
                .by_type
                .get(&event.event_type())
                .into_iter()
                .flatten()
                .chain(state.wildcard.iter())
                .cloned()
                .collect()
        };

        dlog_trace!(
            "EventBus: publish {} to {} subscriber(s)",
            event.event_type(),
            subscribers.len()
        );

        for (id, callback) in subscribers {
            match catch_unwind(AssertUnwindSafe(|| callback(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    dlog_error!(
                        "EventBus: subscriber {:?} failed on {}: {}",
                        id,
                        event.event_type(),
                        e
                    );
                }
                Err(_) => {
                    dlog_error!(
                        "EventBus: subscriber {:?} panicked on {}",
                        id,
                        event.event_type()
                    );
                }
            }
        }
    }

    /// Up to `limit` most recent events, oldest first.
    ///
    /// With `filter`, only events whose type appears in it are considered.
    pub fn get_history(&self, filter: Option<&[EventType]>, limit: usize) -> Vec<Event> {
        let state = self.lock();
        let mut recent: Vec<Event> = state
            .history
            .iter()
            .rev()
            .filter(|e| filter.is_none_or(|types| types.contains(&e.event_type())))
            .take(limit)
            .cloned()
            .collect();
        recent.reverse();
        recent
    }

    pub fn history_len(&self) -> usize {
        self.lock().history.len()
    }

    pub fn clear_history(&self) {
        self.lock().history.clear();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("max_history", &self.inner.max_history)
            .field("history_len", &self.history_len())
            .finish()
    }
}
