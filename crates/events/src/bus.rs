//! Event publishing/subscription abstraction.
//!
//! The bus distributes history events *after* they have been appended to
//! the store. It is for observers (logs, projections, tests), never the
//! source of truth: a subscriber that lags or joins late can always go back
//! to the store.

use std::sync::Arc;

use tokio::sync::broadcast;

/// A subscription to a bus. Each subscription sees every message published
/// after it was created, in publish order.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: broadcast::Receiver<M>,
}

impl<M: Clone> Subscription<M> {
    pub fn new(receiver: broadcast::Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Wait for the next message. Returns `None` once the bus is gone.
    ///
    /// Messages dropped because this subscriber lagged are skipped.
    pub async fn recv(&mut self) -> Option<M> {
        loop {
            match self.receiver.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next message if one is already buffered.
    pub fn try_recv(&mut self) -> Option<M> {
        loop {
            match self.receiver.try_recv() {
                Ok(message) => return Some(message),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Take every message currently buffered.
    pub fn drain(&mut self) -> Vec<M> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

/// Publish/subscribe contract.
///
/// `publish` must not block on subscribers. Publishing with no subscribers
/// is not an error.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
