//! Update notifications for Tessera.
//!
//! Every successful local commit is published as an [`UpdateEvent`] on an
//! [`EventBus`]. Subscribers receive the events matching their
//! [`EventFilter`] over a `tokio` broadcast channel; this drives real-time
//! subscriptions and peer push fan-out.

pub mod bus;
pub mod event;

pub use bus::{EventBus, EventFilter, EventStream};
pub use event::UpdateEvent;
