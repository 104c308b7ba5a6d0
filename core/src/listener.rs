//! Listener fan-out with explicit subscriptions.
//!
//! Registration returns a [`Subscription`]; dropping it (or calling
//! [`Subscription::unsubscribe`]) removes the listener. Notification iterates a
//! snapshot, so listeners may register or unregister from inside a callback, and a
//! panicking listener is logged and skipped without affecting the others.

use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::warn;

type Entries<L> = Mutex<Vec<(u64, Arc<L>)>>;

/// Ordered set of listeners of type `L` (usually a `dyn Trait`)
pub struct ListenerSet<L: ?Sized> {
    entries: Arc<Entries<L>>,
    next_id: Arc<AtomicU64>,
}

impl<L: ?Sized> Clone for ListenerSet<L> {
    /// Clones share the same underlying registrations
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
            next_id: Arc::clone(&self.next_id),
        }
    }
}

impl<L: ?Sized> Default for ListenerSet<L> {
    fn default() -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }
}

impl<L: ?Sized + Send + Sync + 'static> ListenerSet<L> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener; it stays registered while the returned subscription lives
    pub fn add(&self, listener: Arc<L>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().push((id, listener));

        let entries: Weak<Entries<L>> = Arc::downgrade(&self.entries);
        Subscription::new(move || {
            if let Some(entries) = entries.upgrade() {
                entries.lock().retain(|(entry_id, _)| *entry_id != id);
            }
        })
    }

    /// Current listeners in registration order
    pub fn snapshot(&self) -> Vec<Arc<L>> {
        self.entries
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Deliver to every listener in registration order.
    ///
    /// Returns the number of listeners that panicked.
    pub fn notify<F>(&self, what: &str, f: F) -> usize
    where
        F: Fn(&L),
    {
        let mut failures = 0;
        for listener in self.snapshot() {
            let result = panic::catch_unwind(AssertUnwindSafe(|| f(&listener)));
            if result.is_err() {
                failures += 1;
                warn!("Listener panicked while handling {}", what);
            }
        }
        failures
    }
}

/// Handle keeping a listener registered.
///
/// The registration ends when the subscription is dropped.
#[must_use = "dropping a Subscription immediately unregisters the listener"]
pub struct Subscription {
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub(crate) fn new<F>(release: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// Unregister now
    pub fn unsubscribe(mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.release.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    trait Counter: Send + Sync {
        fn hit(&self, order: &Mutex<Vec<usize>>);
    }

    struct Recorder {
        id: usize,
        hits: AtomicUsize,
    }

    impl Counter for Recorder {
        fn hit(&self, order: &Mutex<Vec<usize>>) {
            self.hits.fetch_add(1, Ordering::SeqCst);
            order.lock().push(self.id);
        }
    }

    struct Panicker;

    impl Counter for Panicker {
        fn hit(&self, _order: &Mutex<Vec<usize>>) {
            panic!("listener failure");
        }
    }

    fn recorder(id: usize) -> Arc<Recorder> {
        Arc::new(Recorder {
            id,
            hits: AtomicUsize::new(0),
        })
    }

    #[test]
    fn test_delivery_in_registration_order() {
        let set: ListenerSet<dyn Counter> = ListenerSet::new();
        let order = Mutex::new(Vec::new());
        let _a = set.add(recorder(1));
        let _b = set.add(recorder(2));
        let _c = set.add(recorder(3));

        set.notify("hit", |l| l.hit(&order));
        assert_eq!(*order.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let set: ListenerSet<dyn Counter> = ListenerSet::new();
        let first = recorder(1);
        let sub = set.add(first.clone());
        assert_eq!(set.len(), 1);

        drop(sub);
        assert!(set.is_empty());

        set.notify("hit", |l| l.hit(&Mutex::new(Vec::new())));
        assert_eq!(first.hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_explicit_unsubscribe() {
        let set: ListenerSet<dyn Counter> = ListenerSet::new();
        let sub = set.add(recorder(1));
        let _keep = set.add(recorder(2));
        sub.unsubscribe();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_panicking_listener_does_not_block_others() {
        let set: ListenerSet<dyn Counter> = ListenerSet::new();
        let order = Mutex::new(Vec::new());
        let _a = set.add(recorder(1));
        let _p = set.add(Arc::new(Panicker));
        let _b = set.add(recorder(2));

        let failures = set.notify("hit", |l| l.hit(&order));
        assert_eq!(failures, 1);
        assert_eq!(*order.lock(), vec![1, 2]);
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_subscription_outliving_set_is_harmless() {
        let set: ListenerSet<dyn Counter> = ListenerSet::new();
        let sub = set.add(recorder(1));
        drop(set);
        drop(sub);
    }

    #[test]
    fn test_mutation_during_notify_uses_snapshot() {
        let set: ListenerSet<dyn Counter> = ListenerSet::new();
        let order = Mutex::new(Vec::new());
        let _a = set.add(recorder(1));
        let late: Mutex<Vec<Subscription>> = Mutex::new(Vec::new());

        set.notify("hit", |l| {
            l.hit(&order);
            late.lock().push(set.add(recorder(9)));
        });

        assert_eq!(*order.lock(), vec![1]);
        assert_eq!(set.len(), 2);
    }
}
