//! Durable event capture.
//!
//! [`PersistenceSink`] subscribes a [`JobEventStore`] to the [`EventBus`] so
//! every published job event is appended to the log. Replay at startup reads
//! the store directly and never re-enters the bus, so a restart does not
//! duplicate records.

use std::sync::Arc;

use crate::bus::{EventBus, SubscriptionId, Topic};
use crate::store::JobEventStore;

/// Bus subscription that appends every event to a store.
pub struct PersistenceSink {
    subscription: SubscriptionId,
}

impl PersistenceSink {
    /// Subscribe `store` to every event published on `bus`.
    pub fn attach(bus: &EventBus, store: Arc<dyn JobEventStore>) -> Self {
        let subscription = bus.subscribe(Topic::All, move |event| store.append(event));
        Self { subscription }
    }

    /// Stop persisting. Events published afterwards are not captured.
    pub fn detach(self, bus: &EventBus) {
        bus.unsubscribe(self.subscription);
    }
}
