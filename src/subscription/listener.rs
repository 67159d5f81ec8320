//! Local listeners on a shared subscription
//!
//! Each listener owns its own unbounded channel, so one slow consumer never
//! holds up delivery to the others. Dropping the [`SubscriptionHandle`]
//! releases the listener synchronously; releasing the last one tears the
//! underlying subscription down.

use std::sync::{Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::{mpsc, watch};

use super::manager::ManagerInner;
use super::{SubscriptionKey, SubscriptionStatus};
use crate::model::ChangeEvent;

pub(crate) type ListenerId = u64;

/// One event delivered on a subscription
#[derive(Debug, Clone, PartialEq)]
pub struct FeedUpdate {
    pub event: ChangeEvent,
    /// Whether the event changed the cache (false for stale redeliveries)
    pub effective: bool,
}

/// Listeners registered on one subscription, in registration order
#[derive(Default)]
pub(crate) struct ListenerSet {
    senders: Mutex<Vec<(ListenerId, mpsc::UnboundedSender<FeedUpdate>)>>,
}

impl ListenerSet {
    fn senders(&self) -> MutexGuard<'_, Vec<(ListenerId, mpsc::UnboundedSender<FeedUpdate>)>> {
        self.senders.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn add(&self, id: ListenerId, tx: mpsc::UnboundedSender<FeedUpdate>) {
        self.senders().push((id, tx));
    }

    pub(crate) fn remove(&self, id: ListenerId) {
        self.senders().retain(|(listener, _)| *listener != id);
    }

    pub(crate) fn len(&self) -> usize {
        self.senders().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every sender so each listener's stream ends
    pub(crate) fn close(&self) -> usize {
        let mut senders = self.senders();
        let closed = senders.len();
        senders.clear();
        closed
    }

    /// Deliver to every listener. Returns how many received it.
    pub(crate) fn fan_out(&self, update: &FeedUpdate) -> usize {
        self.senders()
            .iter()
            .filter(|(_, tx)| tx.send(update.clone()).is_ok())
            .count()
    }
}

/// Registration of one listener; dropping it unsubscribes
pub struct SubscriptionHandle {
    key: SubscriptionKey,
    id: ListenerId,
    manager: Weak<ManagerInner>,
}

impl SubscriptionHandle {
    pub(crate) fn new(key: SubscriptionKey, id: ListenerId, manager: Weak<ManagerInner>) -> Self {
        Self { key, id, manager }
    }

    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    /// Release now; same as dropping the handle
    pub fn unsubscribe(self) {}
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.release(&self.key, self.id);
        }
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}

/// A registered listener: its handle, its event stream and the
/// subscription's status
pub struct Listener {
    handle: SubscriptionHandle,
    events: mpsc::UnboundedReceiver<FeedUpdate>,
    status: watch::Receiver<SubscriptionStatus>,
}

impl Listener {
    pub(crate) fn new(
        handle: SubscriptionHandle,
        events: mpsc::UnboundedReceiver<FeedUpdate>,
        status: watch::Receiver<SubscriptionStatus>,
    ) -> Self {
        Self {
            handle,
            events,
            status,
        }
    }

    pub fn key(&self) -> &SubscriptionKey {
        self.handle.key()
    }

    /// Next delivered event; `None` once the subscription is gone
    pub async fn recv(&mut self) -> Option<FeedUpdate> {
        self.events.recv().await
    }

    /// Next event if one is already queued
    pub fn try_recv(&mut self) -> Option<FeedUpdate> {
        self.events.try_recv().ok()
    }

    /// Current status of the shared subscription
    pub fn status(&self) -> SubscriptionStatus {
        self.status.borrow().clone()
    }

    /// Watch the shared subscription's status
    pub fn status_receiver(&self) -> watch::Receiver<SubscriptionStatus> {
        self.status.clone()
    }

    /// Release the listener now; same as dropping it
    pub fn unsubscribe(self) {}

    pub(crate) fn into_parts(self) -> (SubscriptionHandle, mpsc::UnboundedReceiver<FeedUpdate>) {
        (self.handle, self.events)
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener").field("handle", &self.handle).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Property;

    fn update(id: &str) -> FeedUpdate {
        FeedUpdate {
            event: ChangeEvent::insert(Property::new(id, "Plot", 1.0, 1)),
            effective: true,
        }
    }

    #[test]
    fn test_fan_out_reaches_every_listener_once() {
        let set = ListenerSet::default();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        set.add(1, tx_a);
        set.add(2, tx_b);

        assert_eq!(set.fan_out(&update("x")), 2);
        assert_eq!(rx_a.try_recv().unwrap(), update("x"));
        assert_eq!(rx_b.try_recv().unwrap(), update("x"));
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn test_remove_and_dead_receivers() {
        let set = ListenerSet::default();
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, _rx_b) = mpsc::unbounded_channel();
        set.add(1, tx_a);
        set.add(2, tx_b);

        drop(rx_a);
        assert_eq!(set.fan_out(&update("x")), 1);

        set.remove(2);
        set.remove(1);
        assert!(set.is_empty());
    }

    #[test]
    fn test_close_ends_every_stream() {
        let set = ListenerSet::default();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        set.add(1, tx_a);
        set.add(2, tx_b);

        assert_eq!(set.close(), 2);
        assert!(set.is_empty());
        assert_eq!(set.fan_out(&update("x")), 0);
        assert!(matches!(rx_a.try_recv(), Err(mpsc::error::TryRecvError::Disconnected)));
        assert!(matches!(rx_b.try_recv(), Err(mpsc::error::TryRecvError::Disconnected)));
    }
}
