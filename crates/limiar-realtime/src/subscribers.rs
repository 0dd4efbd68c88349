//! Callback registries with guard-based unsubscription.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

pub(crate) type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Ordered set of handlers for one event type.
///
/// Emission snapshots the handler list first, so handlers may subscribe or
/// unsubscribe (including themselves) while being invoked.
pub(crate) struct Subscribers<T> {
    next_id: AtomicU64,
    handlers: Mutex<Vec<(u64, Handler<T>)>>,
}

impl<T: 'static> Subscribers<T> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(0),
            handlers: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn subscribe(self: &Arc<Self>, handler: Handler<T>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers.lock().push((id, handler));
        let registry: Weak<Self> = Arc::downgrade(self);
        Subscription::new(move || {
            if let Some(registry) = registry.upgrade() {
                registry.remove(id);
            }
        })
    }

    pub(crate) fn emit(&self, value: &T) {
        let snapshot: Vec<Handler<T>> = self
            .handlers
            .lock()
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();
        for handler in snapshot {
            handler(value);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.handlers.lock().len()
    }

    fn remove(&self, id: u64) {
        self.handlers.lock().retain(|(entry, _)| *entry != id);
    }
}

/// Handle to a registered callback. Unsubscribes on [`unsubscribe`] or drop.
///
/// [`unsubscribe`]: Subscription::unsubscribe
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Remove the handler now.
    pub fn unsubscribe(mut self) {
        self.cancel_now();
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<u32>>>, Handler<u32>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, Arc::new(move |v: &u32| sink.lock().push(*v)))
    }

    #[test]
    fn emit_reaches_all_handlers() {
        let subs = Subscribers::new();
        let (a, ha) = recorder();
        let (b, hb) = recorder();
        let _sa = subs.subscribe(ha);
        let _sb = subs.subscribe(hb);
        subs.emit(&7);
        assert_eq!(*a.lock(), vec![7]);
        assert_eq!(*b.lock(), vec![7]);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let subs = Subscribers::new();
        let (seen, h) = recorder();
        let sub = subs.subscribe(h);
        subs.emit(&1);
        sub.unsubscribe();
        subs.emit(&2);
        assert_eq!(*seen.lock(), vec![1]);
        assert_eq!(subs.len(), 0);
    }

    #[test]
    fn drop_unsubscribes() {
        let subs = Subscribers::new();
        let (seen, h) = recorder();
        {
            let _sub = subs.subscribe(h);
            assert_eq!(subs.len(), 1);
        }
        subs.emit(&3);
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn guard_outliving_registry_is_harmless() {
        let subs = Subscribers::<u32>::new();
        let sub = subs.subscribe(Arc::new(|_| {}));
        drop(subs);
        sub.unsubscribe();
    }

    #[test]
    fn handler_may_unsubscribe_itself() {
        let subs = Subscribers::<u32>::new();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let count = Arc::new(AtomicU64::new(0));
        let (slot_h, count_h) = (Arc::clone(&slot), Arc::clone(&count));
        let sub = subs.subscribe(Arc::new(move |_| {
            let _ = count_h.fetch_add(1, Ordering::SeqCst);
            drop(slot_h.lock().take());
        }));
        *slot.lock() = Some(sub);
        subs.emit(&1);
        subs.emit(&2);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
