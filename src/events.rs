//! Fan-out of engine events to any number of subscribers.

use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;

/// Delivers every published event to every live subscriber.
///
/// Each subscriber gets its own unbounded queue, so a slow reader never
/// loses events; subscribers whose receiver was dropped are pruned on the
/// next publish.
pub struct Publisher<T> {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<T>>>,
}

impl<T: Clone> Publisher<T> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Returns how many subscribers received the event.
    pub fn publish(&self, event: T) -> usize {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl<T: Clone> Default for Publisher<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_subscriber_gets_every_event() {
        let publisher = Publisher::new();
        let mut first = publisher.subscribe();
        let mut second = publisher.subscribe();

        assert_eq!(publisher.publish(1u32), 2);
        assert_eq!(publisher.publish(2u32), 2);

        assert_eq!(first.recv().await, Some(1));
        assert_eq!(first.recv().await, Some(2));
        assert_eq!(second.recv().await, Some(1));
        assert_eq!(second.recv().await, Some(2));
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let publisher = Publisher::new();
        let kept = publisher.subscribe();
        drop(publisher.subscribe());

        assert_eq!(publisher.publish("hello"), 1);
        assert_eq!(publisher.subscriber_count(), 1);
        drop(kept);
        assert_eq!(publisher.publish("again"), 0);
    }
}
