//! Fan-out notifications for writes and rotations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

/// Identifies one subscription within a [`Notifier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Receiving end of a notifier subscription.
///
/// Each subscriber has a single-slot queue, so bursts of notifications
/// coalesce into one pending wakeup.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    receiver: mpsc::Receiver<()>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Wait for the next notification. Returns `None` once the subscription
    /// has been evicted or the notifier closed.
    pub async fn recv(&mut self) -> Option<()> {
        self.receiver.recv().await
    }

    /// Consume a pending notification without waiting.
    pub fn try_recv(&mut self) -> bool {
        self.receiver.try_recv().is_ok()
    }
}

/// A broadcast source that never blocks the publisher.
#[derive(Debug, Default)]
pub struct Notifier {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<SubscriptionId, mpsc::Sender<()>>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(1);
        self.lock().insert(id, tx);
        Subscription { id, receiver: rx }
    }

    /// Remove a subscriber. Its [`Subscription::recv`] then returns `None`.
    pub fn evict(&self, id: SubscriptionId) {
        self.lock().remove(&id);
    }

    /// Wake every subscriber. Subscribers that already have a wakeup
    /// pending are skipped; dropped subscribers are pruned.
    pub fn publish(&self) {
        self.lock().retain(|_, tx| match tx.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => true,
            Err(mpsc::error::TrySendError::Closed(())) => false,
        });
    }

    /// Drop every subscriber.
    pub fn close(&self) {
        self.lock().clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SubscriptionId, mpsc::Sender<()>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
