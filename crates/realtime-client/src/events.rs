//! Typed event emitter with deterministic, registration-order delivery.
//!
//! All emission happens on the engine's single execution context, so
//! subscribers observe events in exactly the order transitions occurred.

use tokio::sync::{mpsc, oneshot};

pub(crate) struct Emitter<T: Clone> {
    subscribers: Vec<mpsc::Sender<T>>,
    once: Vec<oneshot::Sender<T>>,
    capacity: usize,
}

impl<T: Clone> Emitter<T> {
    pub fn new(capacity: usize) -> Self {
        Emitter {
            subscribers: Vec::new(),
            once: Vec::new(),
            capacity,
        }
    }

    /// Register a persistent listener; events arrive on the returned receiver.
    pub fn subscribe(&mut self) -> mpsc::Receiver<T> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.subscribers.push(tx);
        rx
    }

    /// Register a one-shot listener for the next event.
    pub fn once(&mut self) -> oneshot::Receiver<T> {
        let (tx, rx) = oneshot::channel();
        self.once.push(tx);
        rx
    }

    /// Deliver `event` to every listener in registration order. Listeners
    /// whose receiver was dropped are pruned; a full listener channel drops
    /// this event for that listener rather than stalling the engine.
    pub fn emit(&mut self, event: &T) {
        self.subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("listener channel full, dropping event");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        for tx in self.once.drain(..) {
            let _ = tx.send(event.clone());
        }
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty() && self.once.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_in_registration_order() {
        let mut em: Emitter<u32> = Emitter::new(8);
        let mut a = em.subscribe();
        let mut b = em.subscribe();
        em.emit(&1);
        em.emit(&2);
        assert_eq!(a.recv().await, Some(1));
        assert_eq!(a.recv().await, Some(2));
        assert_eq!(b.recv().await, Some(1));
        assert_eq!(b.recv().await, Some(2));
    }

    #[tokio::test]
    async fn once_fires_a_single_time() {
        let mut em: Emitter<u32> = Emitter::new(8);
        let once = em.once();
        em.emit(&7);
        em.emit(&8);
        assert_eq!(once.await.ok(), Some(7));
        assert!(em.is_empty());
    }

    #[tokio::test]
    async fn dropped_receivers_are_pruned() {
        let mut em: Emitter<u32> = Emitter::new(8);
        let rx = em.subscribe();
        drop(rx);
        em.emit(&1);
        assert!(em.is_empty());
    }
}
