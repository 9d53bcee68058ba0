use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use relay_core::Frame;

type Callback = Arc<dyn Fn(&Frame) + Send + Sync>;

#[derive(Default)]
struct Inner {
    entries: Vec<(u64, Callback)>,
    next_id: u64,
}

/// In-process listeners, delivered to in registration order. A panicking
/// subscriber is logged and skipped; the rest still receive the frame.
#[derive(Clone, Default)]
pub struct SubscriberSet {
    inner: Arc<Mutex<Inner>>,
}

impl SubscriberSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, callback: impl Fn(&Frame) + Send + Sync + 'static) -> Subscription {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.entries.push((id, Arc::new(callback)));
        Subscription {
            inner: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Deliver to a snapshot of the current subscribers. Taking a snapshot
    /// first makes it safe for a callback to dispose itself or subscribe.
    pub fn deliver(&self, frame: &Frame) {
        let snapshot: Vec<Callback> = {
            let inner = self.inner.lock();
            inner.entries.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };
        for callback in snapshot {
            if catch_unwind(AssertUnwindSafe(|| callback(frame))).is_err() {
                tracing::error!(kind = %frame.kind, "subscriber panicked, continuing fan-out");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Disposer returned by `subscribe`. Safe to call from inside a subscriber.
pub struct Subscription {
    inner: Weak<Mutex<Inner>>,
    id: u64,
}

impl Subscription {
    pub fn dispose(self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.lock().entries.retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn delivers_in_registration_order() {
        let set = SubscriberSet::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b", "c"] {
            let seen = Arc::clone(&seen);
            // Keep the subscription alive for the test by leaking the disposer.
            std::mem::forget(set.subscribe(move |_| seen.lock().push(tag)));
        }

        set.deliver(&Frame::new("x"));
        assert_eq!(*seen.lock(), vec!["a", "b", "c"]);
    }

    #[test]
    fn dispose_removes_exactly_one() {
        let set = SubscriberSet::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c1 = Arc::clone(&count);
        let sub1 = set.subscribe(move |_| {
            c1.fetch_add(1, Ordering::SeqCst);
        });
        let c2 = Arc::clone(&count);
        std::mem::forget(set.subscribe(move |_| {
            c2.fetch_add(10, Ordering::SeqCst);
        }));

        sub1.dispose();
        set.deliver(&Frame::new("x"));
        assert_eq!(count.load(Ordering::SeqCst), 10);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn panicking_subscriber_does_not_block_the_rest() {
        let set = SubscriberSet::new();
        let count = Arc::new(AtomicUsize::new(0));

        std::mem::forget(set.subscribe(|_| panic!("boom")));
        let c = Arc::clone(&count);
        std::mem::forget(set.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        set.deliver(&Frame::new("x"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dispose_from_inside_a_subscriber_is_safe() {
        let set = SubscriberSet::new();
        let count = Arc::new(AtomicUsize::new(0));

        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let inner_slot = Arc::clone(&slot);
        let c = Arc::clone(&count);
        let sub = set.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            if let Some(sub) = inner_slot.lock().take() {
                sub.dispose();
            }
        });
        *slot.lock() = Some(sub);

        set.deliver(&Frame::new("x"));
        set.deliver(&Frame::new("x"));
        // Second delivery reaches nobody: the subscriber removed itself.
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(set.is_empty());
    }

    #[test]
    fn dispose_after_set_dropped_is_a_no_op() {
        let set = SubscriberSet::new();
        let sub = set.subscribe(|_| {});
        drop(set);
        sub.dispose();
    }
}
