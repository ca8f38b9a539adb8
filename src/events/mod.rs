//! Lifecycle events and the bus that distributes them.

pub mod bus;
pub mod event;

pub use bus::{EventBus, Subscriber, SubscriptionId};
pub use event::{data, Event, EventCategory, EventType};
