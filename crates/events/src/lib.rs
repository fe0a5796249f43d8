//! Event primitives for the sale item lifecycle: the `Event` contract,
//! history envelopes and the publish/subscribe bus that fans committed
//! history out to observers.

pub mod bus;
pub mod envelope;
pub mod event;
pub mod handler;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use handler::execute;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
