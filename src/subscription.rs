//! # Change Subscriptions
//!
//! Subscribers receive the full set of field-qualified changed keys after
//! every merge that changed anything, synchronously on the writer path.
//!
//! ## Contract
//!
//! - Membership is identity-based: the same `Arc` that subscribed is the one
//!   that unsubscribes.
//! - Notification order is registration order.
//! - One write produces exactly one invocation per subscriber, carrying the
//!   whole changed-key set for that write.
//! - The optional identifier lets the originator of a write recognize and
//!   skip its own notification.
//! - A panicking subscriber is caught and logged; delivery continues to the
//!   remaining subscribers.
//!
//! Changed keys are formatted `"<cacheKey>.<fieldKey>"`; subscribers
//! typically prefix-match against the keys their last read depended on.

use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::api::NormStore;

/// A receiver of change notifications.
///
/// Invoked synchronously from the writer's publish path, after the merge
/// has been applied and before the publish future resolves. Re-entering the
/// store from inside the callback will deadlock on the write lock; hand the
/// keys off to a task instead.
pub trait Subscriber: Send + Sync {
    /// `changed_keys` is the full `"<cacheKey>.<fieldKey>"` set for one
    /// write; `identifier` is whatever the publisher passed along.
    fn did_change_keys(
        &self,
        store: &NormStore,
        changed_keys: &BTreeSet<String>,
        identifier: Option<Uuid>,
    );
}

/// The store's subscriber list.
pub(crate) struct SubscriberRegistry {
    entries: Mutex<Vec<Arc<dyn Subscriber>>>,
}

impl SubscriberRegistry {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Registers a subscriber. Registering the same `Arc` twice is a no-op.
    pub(crate) fn add(&self, subscriber: Arc<dyn Subscriber>) {
        let mut entries = self.entries.lock().expect("subscriber mutex poisoned");
        if !entries.iter().any(|entry| Arc::ptr_eq(entry, &subscriber)) {
            entries.push(subscriber);
        }
    }

    /// Removes a subscriber by identity. Unknown subscribers are ignored.
    pub(crate) fn remove(&self, subscriber: &Arc<dyn Subscriber>) {
        self.entries
            .lock()
            .expect("subscriber mutex poisoned")
            .retain(|entry| !Arc::ptr_eq(entry, subscriber));
    }

    /// Delivers one change notification to every subscriber, in
    /// registration order.
    pub(crate) fn notify(
        &self,
        store: &NormStore,
        changed_keys: &BTreeSet<String>,
        identifier: Option<Uuid>,
    ) {
        let snapshot: Vec<Arc<dyn Subscriber>> = self
            .entries
            .lock()
            .expect("subscriber mutex poisoned")
            .clone();

        for subscriber in snapshot {
            let delivery = catch_unwind(AssertUnwindSafe(|| {
                subscriber.did_change_keys(store, changed_keys, identifier);
            }));
            if delivery.is_err() {
                tracing::warn!("subscriber panicked during change notification; continuing");
            }
        }
    }

    /// Number of registered subscribers.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().expect("subscriber mutex poisoned").len()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    struct Recording {
        seen: Mutex<Vec<BTreeSet<String>>>,
    }

    impl Recording {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    impl Subscriber for Recording {
        fn did_change_keys(
            &self,
            _store: &NormStore,
            changed_keys: &BTreeSet<String>,
            _identifier: Option<Uuid>,
        ) {
            self.seen.lock().unwrap().push(changed_keys.clone());
        }
    }

    fn changed(keys: &[&str]) -> BTreeSet<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    #[test]
    fn test_membership_is_identity_based() {
        let registry = SubscriberRegistry::new();
        let first = Recording::new();
        let second = Recording::new();

        registry.add(first.clone());
        registry.add(first.clone());
        registry.add(second.clone());
        assert_eq!(registry.len(), 2);

        let first_handle: Arc<dyn Subscriber> = first;
        registry.remove(&first_handle);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_notification_reaches_every_subscriber() {
        let registry = SubscriberRegistry::new();
        let first = Recording::new();
        let second = Recording::new();
        registry.add(first.clone());
        registry.add(second.clone());

        let store = NormStore::in_memory();
        registry.notify(&store, &changed(&["2001.name"]), None);

        assert_eq!(first.seen.lock().unwrap().len(), 1);
        assert_eq!(second.seen.lock().unwrap().len(), 1);
    }

    struct Panicking;

    impl Subscriber for Panicking {
        fn did_change_keys(
            &self,
            _store: &NormStore,
            _changed_keys: &BTreeSet<String>,
            _identifier: Option<Uuid>,
        ) {
            panic!("subscriber bug");
        }
    }

    #[test]
    fn test_panicking_subscriber_does_not_stop_delivery() {
        let registry = SubscriberRegistry::new();
        let after = Recording::new();
        registry.add(Arc::new(Panicking));
        registry.add(after.clone());

        let store = NormStore::in_memory();
        registry.notify(&store, &changed(&["2001.name"]), None);

        assert_eq!(after.seen.lock().unwrap().len(), 1);
    }
}
