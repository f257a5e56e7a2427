//! Synchronous in-process event bus.
//!
//! [`EventBus`] is the central publish/subscribe hub for [`JobEvent`]s. It is
//! designed to be shared via `Arc<EventBus>` across the application.
//!
//! Handlers run synchronously in the publisher's thread, in subscription
//! order. A panicking handler never reaches the publisher and never blocks
//! delivery to the remaining handlers; each failure is recorded in a bounded
//! dead-letter buffer for diagnosis.

use std::collections::{BTreeMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::event::{JobEvent, JobEventTag};

/// Maximum retained dead-letter records; older entries are dropped first.
const DEAD_LETTER_CAPACITY: usize = 128;

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

/// What a handler wants to receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    /// Every job event.
    All,
    /// Only events of one kind.
    Kind(JobEventTag),
}

impl Topic {
    fn matches(self, event: &JobEvent) -> bool {
        match self {
            Topic::All => true,
            Topic::Kind(tag) => event.kind.tag() == tag,
        }
    }
}

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&JobEvent) + Send + Sync>;

struct Subscriber {
    topic: Topic,
    handler: Handler,
}

// ---------------------------------------------------------------------------
// Dead letters
// ---------------------------------------------------------------------------

/// Record of a handler failure during delivery.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub timestamp: DateTime<Utc>,
    /// The event that was being delivered.
    pub event: JobEvent,
    /// Panic payload rendered as text.
    pub error: String,
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Synchronous in-process fan-out bus for job events.
///
/// No persistence and no cross-process delivery; durable capture is the
/// [`PersistenceSink`](crate::sink::PersistenceSink)'s concern.
pub struct EventBus {
    // Keyed by monotonically increasing id, so iteration order is
    // subscription order.
    subscribers: Mutex<BTreeMap<SubscriptionId, Subscriber>>,
    next_id: AtomicU64,
    dead_letters: Mutex<VecDeque<DeadLetter>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            dead_letters: Mutex::new(VecDeque::new()),
        }
    }

    /// Register a handler for `topic`. Handlers are invoked in subscription
    /// order from the publishing thread.
    pub fn subscribe(
        &self,
        topic: Topic,
        handler: impl Fn(&JobEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut subs = self.subscribers.lock().expect("subscriber map poisoned");
        subs.insert(
            id,
            Subscriber {
                topic,
                handler: Arc::new(handler),
            },
        );
        id
    }

    /// Remove a subscription. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut subs = self.subscribers.lock().expect("subscriber map poisoned");
        subs.remove(&id);
    }

    /// Deliver `event` synchronously to every matching handler.
    ///
    /// A handler panic is caught, logged, and appended to the dead-letter
    /// buffer; remaining handlers still receive the event and the publisher
    /// never observes the failure.
    pub fn publish(&self, event: &JobEvent) {
        // Snapshot handlers under the lock, dispatch outside it, so handlers
        // may themselves subscribe/unsubscribe.
        let handlers: Vec<Handler> = {
            let subs = self.subscribers.lock().expect("subscriber map poisoned");
            subs.values()
                .filter(|s| s.topic.matches(event))
                .map(|s| Arc::clone(&s.handler))
                .collect()
        };

        for handler in handlers {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(event))) {
                let error = panic_message(panic);
                tracing::error!(
                    job_id = %event.job_id,
                    event = ?event.kind.tag(),
                    error = %error,
                    "Event handler failed",
                );
                self.push_dead_letter(DeadLetter {
                    timestamp: Utc::now(),
                    event: event.clone(),
                    error,
                });
            }
        }
    }

    /// Snapshot of the dead-letter buffer, oldest first.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters
            .lock()
            .expect("dead letter buffer poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// Number of currently registered subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("subscriber map poisoned")
            .len()
    }

    fn push_dead_letter(&self, letter: DeadLetter) {
        let mut letters = self.dead_letters.lock().expect("dead letter buffer poisoned");
        if letters.len() == DEAD_LETTER_CAPACITY {
            letters.pop_front();
        }
        letters.push_back(letter);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
