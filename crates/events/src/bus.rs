//! Channel-backed change subscriptions.
//!
//! Listeners run synchronously on the mutating thread. A `ChannelListener`
//! turns that into a hand-off: it only enqueues the event, and a consumer on
//! another thread drains the matching `Subscription` at its own pace.
//!
//! ## Usage Pattern
//!
//! ```ignore
//! let (listener, subscription) = ChannelListener::pair();
//! store.register_listener(Arc::new(listener));
//!
//! loop {
//!     match subscription.recv_timeout(Duration::from_secs(1)) {
//!         Ok(event) => process(event)?,
//!         Err(RecvTimeoutError::Timeout) => continue,  // Check for shutdown
//!         Err(RecvTimeoutError::Disconnected) => break,
//!     }
//! }
//! ```

use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Duration;

use ctlplane_core::Entity;

use crate::change::ChangeEvent;
use crate::listener::{ChangeListener, ListenerError};

/// Receiving end of a change stream.
///
/// Messages arrive in delivery order, which for one store is commit order.
/// Designed for consumption by a single thread.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain everything currently queued without blocking.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}

/// Listener that forwards each event into an unbounded channel.
#[derive(Debug)]
pub struct ChannelListener<E: Entity> {
    sender: Sender<ChangeEvent<E>>,
}

impl<E: Entity + Clone> ChannelListener<E> {
    pub fn pair() -> (Self, Subscription<ChangeEvent<E>>) {
        let (sender, receiver) = mpsc::channel();
        (Self { sender }, Subscription::new(receiver))
    }
}

impl<E> ChangeListener<E> for ChannelListener<E>
where
    E: Entity + Clone + Send + Sync,
    E::Id: Send + Sync,
{
    fn on_change(&self, event: &ChangeEvent<E>) -> Result<(), ListenerError> {
        self.sender
            .send(event.clone())
            .map_err(|_| ListenerError::Failed(anyhow::anyhow!("subscription dropped")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[derive(Debug, Clone)]
    struct Item {
        id: u32,
    }

    impl Entity for Item {
        type Id = u32;

        fn id(&self) -> &u32 {
            &self.id
        }
    }

    #[test]
    fn forwards_events_in_order() {
        let (listener, subscription) = ChannelListener::pair();

        for seq in 1..=3 {
            listener
                .on_change(&ChangeEvent::created(Item { id: 1 }, seq, Utc::now()))
                .unwrap();
        }

        let seqs: Vec<u64> = subscription.drain().iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert!(subscription.try_recv().is_err());
    }

    #[test]
    fn dropped_subscription_is_a_listener_failure() {
        let (listener, subscription) = ChannelListener::<Item>::pair();
        drop(subscription);

        let result = listener.on_change(&ChangeEvent::created(Item { id: 1 }, 1, Utc::now()));
        assert!(matches!(result, Err(ListenerError::Failed(_))));
    }
}
