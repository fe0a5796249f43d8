//! In-memory event bus backed by a tokio broadcast channel.

use thiserror::Error;
use tokio::sync::broadcast;

use crate::bus::{EventBus, Subscription};

#[derive(Debug, Error)]
pub enum InMemoryBusError {
    #[error("event bus capacity must be greater than zero")]
    ZeroCapacity,
}

/// In-process fan-out bus. Slow subscribers lose the oldest messages once
/// `capacity` is exceeded.
#[derive(Debug)]
pub struct InMemoryEventBus<M> {
    sender: broadcast::Sender<M>,
}

impl<M: Clone> InMemoryEventBus<M> {
    pub const DEFAULT_CAPACITY: usize = 1024;

    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(Self::DEFAULT_CAPACITY);
        Self { sender }
    }

    pub fn with_capacity(capacity: usize) -> Result<Self, InMemoryBusError> {
        if capacity == 0 {
            return Err(InMemoryBusError::ZeroCapacity);
        }
        let (sender, _) = broadcast::channel(capacity);
        Ok(Self { sender })
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<M: Clone> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> EventBus<M> for InMemoryEventBus<M>
where
    M: Clone + Send + Sync + 'static,
{
    type Error = InMemoryBusError;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        // `send` only fails when nobody is listening.
        let _ = self.sender.send(message);
        Ok(())
    }

    fn subscribe(&self) -> Subscription<M> {
        Subscription::new(self.sender.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_without_subscribers_is_ok() {
        let bus: InMemoryEventBus<u32> = InMemoryEventBus::new();
        assert!(bus.publish(1).is_ok());
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(InMemoryEventBus::<u32>::with_capacity(0).is_err());
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_message() {
        let bus: InMemoryEventBus<u32> = InMemoryEventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(1).unwrap();
        bus.publish(2).unwrap();

        assert_eq!(a.recv().await, Some(1));
        assert_eq!(a.recv().await, Some(2));
        assert_eq!(b.drain(), vec![1, 2]);
    }

    #[test]
    fn late_subscriber_misses_earlier_messages() {
        let bus: InMemoryEventBus<u32> = InMemoryEventBus::new();
        bus.publish(1).unwrap();
        let mut late = bus.subscribe();
        bus.publish(2).unwrap();
        assert_eq!(late.drain(), vec![2]);
    }
}
