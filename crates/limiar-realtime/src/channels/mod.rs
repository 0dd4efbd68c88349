//! Protocol channels layered over connection managers.
//!
//! Each channel owns at most one activation (a connection plus the
//! subscriptions and tasks attached to it) and publishes a view through a
//! `tokio::sync::watch` channel. Every activation gets a fresh epoch; late
//! callbacks from a torn-down activation carry a stale epoch and cannot
//! touch the view.

pub mod campaign;
pub mod commands;
pub mod roll_session;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::factory::ConnectionLease;
use crate::manager::{ConnectionManager, ConnectionState};
use crate::subscribers::Subscription;

pub(crate) struct ViewCell<V> {
    tx: Arc<watch::Sender<V>>,
    epoch: Arc<AtomicU64>,
}

impl<V: Clone + Default + PartialEq + Send + Sync + 'static> ViewCell<V> {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(V::default());
        Self {
            tx: Arc::new(tx),
            epoch: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Invalidate outstanding updaters and return the new epoch.
    pub(crate) fn begin(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn updater(&self, epoch: u64) -> ViewUpdater<V> {
        ViewUpdater {
            tx: Arc::clone(&self.tx),
            epoch: Arc::clone(&self.epoch),
            expected: epoch,
        }
    }

    /// Unconditional edit; notifies when `f` reports a change.
    pub(crate) fn modify(&self, f: impl FnOnce(&mut V) -> bool) {
        let _ = self.tx.send_if_modified(f);
    }

    /// Replace the view, notifying only if it differs.
    pub(crate) fn reset(&self, next: V) {
        self.modify(|view| {
            if *view == next {
                false
            } else {
                *view = next;
                true
            }
        });
    }

    pub(crate) fn get(&self) -> V {
        self.tx.borrow().clone()
    }

    pub(crate) fn read<R>(&self, f: impl FnOnce(&V) -> R) -> R {
        f(&self.tx.borrow())
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<V> {
        self.tx.subscribe()
    }
}

/// Epoch-guarded writer handed to callbacks and tasks.
pub(crate) struct ViewUpdater<V> {
    tx: Arc<watch::Sender<V>>,
    epoch: Arc<AtomicU64>,
    expected: u64,
}

impl<V> Clone for ViewUpdater<V> {
    fn clone(&self) -> Self {
        Self {
            tx: Arc::clone(&self.tx),
            epoch: Arc::clone(&self.epoch),
            expected: self.expected,
        }
    }
}

impl<V> ViewUpdater<V> {
    /// Apply `f` if the activation is still current. `f` returns whether it
    /// changed anything; subscribers are notified only then.
    pub(crate) fn update(&self, f: impl FnOnce(&mut V) -> bool) {
        let _ = self.tx.send_if_modified(|view| {
            self.epoch.load(Ordering::SeqCst) == self.expected && f(view)
        });
    }
}

/// Assign if different; reports whether it was.
pub(crate) fn set_if_changed<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        false
    } else {
        *slot = value;
        true
    }
}

pub(crate) enum Link {
    Lease(ConnectionLease),
    Owned(ConnectionManager),
}

impl Link {
    pub(crate) fn manager(&self) -> &ConnectionManager {
        match self {
            Self::Lease(lease) => lease.manager(),
            Self::Owned(manager) => manager,
        }
    }

    fn release(self) {
        match self {
            Self::Lease(lease) => lease.release(),
            Self::Owned(manager) => manager.close(),
        }
    }
}

/// Everything one activation holds.
pub(crate) struct Activation<K> {
    pub(crate) key: K,
    pub(crate) link: Option<Link>,
    pub(crate) subscriptions: Vec<Subscription>,
    pub(crate) tasks: Vec<JoinHandle<()>>,
}

impl<K> Activation<K> {
    pub(crate) fn idle(key: K) -> Self {
        Self {
            key,
            link: None,
            subscriptions: Vec::new(),
            tasks: Vec::new(),
        }
    }

    pub(crate) fn manager(&self) -> Option<&ConnectionManager> {
        self.link.as_ref().map(Link::manager)
    }

    /// Unsubscribe, stop tasks, then let go of the connection.
    pub(crate) fn teardown(self) {
        for subscription in self.subscriptions {
            subscription.unsubscribe();
        }
        for task in self.tasks {
            task.abort();
        }
        if let Some(link) = self.link {
            link.release();
        }
    }
}

/// State handler that mirrors transitions into a view field.
pub(crate) fn mirror_state<V: Send + Sync + 'static>(
    updater: ViewUpdater<V>,
    field: fn(&mut V) -> &mut ConnectionState,
) -> impl Fn(&ConnectionState) + Send + Sync + 'static {
    move |state: &ConnectionState| {
        let state = *state;
        updater.update(|view| set_if_changed(field(view), state));
    }
}
