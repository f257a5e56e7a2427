//! Event plumbing for the atelier job orchestration core.
//!
//! [`bus::EventBus`] is the synchronous in-process publish/subscribe hub all
//! runners publish to; [`store::JsonlJobEventStore`] is the append-only
//! durable log used for crash recovery, wired to the bus by
//! [`sink::PersistenceSink`].

pub mod bus;
pub mod event;
pub mod sanitize;
pub mod sink;
pub mod store;

pub use bus::{DeadLetter, EventBus, SubscriptionId, Topic};
pub use event::{JobEvent, JobEventKind, JobEventTag};
pub use sink::PersistenceSink;
pub use store::{JobEventStore, JsonlJobEventStore, StoreHealth};
