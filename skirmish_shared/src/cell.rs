//! Observable cell: a single value with change notification.
//!
//! # Design
//!
//! [`ObservableCell<T>`] keeps its value and its listener list behind two
//! separate locks. `set` commits the value first, releases the value lock,
//! then calls every listener with the committed value. Because no lock is
//! held while a listener runs, a listener may call `get`, `subscribe`, or
//! even `set` on the same cell.
//!
//! # Notification policy
//!
//! Every `set` notifies, including a `set` with an unchanged value. There is
//! no coalescing: listeners observe the exact sequence of committed values.
//!
//! # Failure isolation
//!
//! Listeners return `anyhow::Result<()>`. A listener that errors or panics
//! does not stop the others; failures are logged and returned in the
//! [`NotifyReport`] of the `set` that triggered them.

use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tracing::warn;

type Listener<T> = Arc<dyn Fn(&T) -> anyhow::Result<()> + Send + Sync>;

/// Identifies a registered listener within one cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

struct Slot<T> {
    value: T,
    version: u64,
}

struct Listeners<T> {
    next_id: u64,
    entries: Vec<(ListenerId, Listener<T>)>,
}

fn lock<M>(m: &Mutex<M>) -> MutexGuard<'_, M> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A shared value with synchronous, ordered change notification.
///
/// Cloning the cell yields another handle to the same value and listeners.
pub struct ObservableCell<T> {
    slot: Arc<Mutex<Slot<T>>>,
    listeners: Arc<Mutex<Listeners<T>>>,
}

impl<T> Clone for ObservableCell<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
            listeners: Arc::clone(&self.listeners),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for ObservableCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = lock(&self.slot);
        f.debug_struct("ObservableCell")
            .field("value", &slot.value)
            .field("version", &slot.version)
            .field("listeners", &lock(&self.listeners).entries.len())
            .finish()
    }
}

impl<T: Default + Clone + Send + 'static> Default for ObservableCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Clone + Send + 'static> ObservableCell<T> {
    /// Creates a cell holding `value` at version 0 with no listeners.
    pub fn new(value: T) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot { value, version: 0 })),
            listeners: Arc::new(Mutex::new(Listeners {
                next_id: 1,
                entries: Vec::new(),
            })),
        }
    }

    /// Returns a clone of the committed value.
    pub fn get(&self) -> T {
        lock(&self.slot).value.clone()
    }

    /// Number of committed `set`/`update` calls.
    pub fn version(&self) -> u64 {
        lock(&self.slot).version
    }

    /// Replaces the value and notifies every listener in registration order.
    pub fn set(&self, value: T) -> NotifyReport {
        let committed = {
            let mut slot = lock(&self.slot);
            slot.value = value;
            slot.version += 1;
            slot.value.clone()
        };
        self.notify(&committed)
    }

    /// Read-modify-write. Notifies like [`set`](Self::set).
    pub fn update(&self, f: impl FnOnce(&mut T)) -> NotifyReport {
        let committed = {
            let mut slot = lock(&self.slot);
            f(&mut slot.value);
            slot.version += 1;
            slot.value.clone()
        };
        self.notify(&committed)
    }

    /// Registers a listener called after every committed change.
    ///
    /// The listener stays registered until the returned [`Subscription`] is
    /// dropped or [`unsubscribed`](Subscription::unsubscribe). Use
    /// [`Subscription::keep`] for a listener that lives as long as the cell.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let listener: Listener<T> = Arc::new(listener);
        let id = {
            let mut listeners = lock(&self.listeners);
            let id = ListenerId(listeners.next_id);
            listeners.next_id += 1;
            listeners.entries.push((id, listener));
            id
        };

        let weak = Arc::downgrade(&self.listeners);
        Subscription {
            id,
            detach: Some(Box::new(move || {
                if let Some(listeners) = weak.upgrade() {
                    lock(&listeners).entries.retain(|(lid, _)| *lid != id);
                }
            })),
        }
    }

    /// Number of currently registered listeners.
    pub fn subscriber_count(&self) -> usize {
        lock(&self.listeners).entries.len()
    }

    fn notify(&self, value: &T) -> NotifyReport {
        // Snapshot so listeners can (un)subscribe while we iterate.
        let snapshot: Vec<(ListenerId, Listener<T>)> = lock(&self.listeners)
            .entries
            .iter()
            .map(|(id, l)| (*id, Arc::clone(l)))
            .collect();

        let mut report = NotifyReport::default();
        for (id, listener) in snapshot {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| listener(value)));
            let message = match outcome {
                Ok(Ok(())) => {
                    report.delivered += 1;
                    continue;
                }
                Ok(Err(e)) => format!("{e:#}"),
                Err(payload) => panic_message(payload.as_ref()),
            };
            warn!(listener = ?id, error = %message, "Cell listener failed");
            report.failures.push(ListenerFailure { listener: id, message });
        }
        report
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

/// Outcome of one notification round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotifyReport {
    /// Listeners that returned `Ok`.
    pub delivered: usize,
    /// Listeners that returned an error or panicked.
    pub failures: Vec<ListenerFailure>,
}

impl NotifyReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// A single listener failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerFailure {
    pub listener: ListenerId,
    pub message: String,
}

/// Registration guard returned by [`ObservableCell::subscribe`].
///
/// Dropping it removes the listener.
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    id: ListenerId,
    detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Removes the listener. Later `set` calls will not reach it.
    pub fn unsubscribe(self) {
        drop(self);
    }

    /// Leaves the listener registered for the lifetime of the cell.
    pub fn keep(mut self) {
        self.detach = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("attached", &self.detach.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder<T: Clone + Send + 'static>() -> (
        Arc<Mutex<Vec<T>>>,
        impl Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static,
    ) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        (log, move |v: &T| {
            sink.lock().unwrap().push(v.clone());
            Ok(())
        })
    }

    #[test]
    fn get_reflects_each_set() {
        let cell = ObservableCell::new(0u32);
        for v in [3, 1, 4, 1, 5] {
            cell.set(v);
            assert_eq!(cell.get(), v);
        }
        assert_eq!(cell.version(), 5);
    }

    #[test]
    fn listeners_observe_values_in_call_order() {
        let cell = ObservableCell::new(0u32);
        let (log, listener) = recorder();
        cell.subscribe(listener).keep();

        for v in [7, 2, 9, 2] {
            cell.set(v);
        }
        assert_eq!(*log.lock().unwrap(), vec![7, 2, 9, 2]);
    }

    #[test]
    fn same_value_set_still_notifies() {
        let cell = ObservableCell::new(0u32);
        let (log, listener) = recorder();
        let _sub = cell.subscribe(listener);

        cell.set(1);
        cell.set(2);
        cell.set(2);
        assert_eq!(*log.lock().unwrap(), vec![1, 2, 2]);
    }

    #[test]
    fn listeners_fire_in_registration_order() {
        let cell = ObservableCell::new(0u32);
        let order = Arc::new(Mutex::new(Vec::new()));
        let subs: Vec<_> = ["a", "b", "c"]
            .into_iter()
            .map(|name| {
                let order = Arc::clone(&order);
                cell.subscribe(move |_| {
                    order.lock().unwrap().push(name);
                    Ok(())
                })
            })
            .collect();

        cell.set(1);
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
        drop(subs);
    }

    #[test]
    fn unsubscribed_listener_receives_nothing_more() {
        let cell = ObservableCell::new(0u32);
        let (log, listener) = recorder();
        let sub = cell.subscribe(listener);

        cell.set(1);
        sub.unsubscribe();
        cell.set(2);
        cell.set(3);

        assert_eq!(*log.lock().unwrap(), vec![1]);
        assert_eq!(cell.subscriber_count(), 0);
    }

    #[test]
    fn dropping_guard_unsubscribes() {
        let cell = ObservableCell::new(0u32);
        {
            let _sub = cell.subscribe(|_| Ok(()));
            assert_eq!(cell.subscriber_count(), 1);
        }
        assert_eq!(cell.subscriber_count(), 0);
    }

    #[test]
    fn failing_listener_does_not_block_others() {
        let cell = ObservableCell::new(0u32);
        let _bad = cell.subscribe(|_| anyhow::bail!("render failed"));
        let _panics = cell.subscribe(|v| {
            if *v == 2 {
                panic!("boom");
            }
            Ok(())
        });
        let (log, listener) = recorder();
        let _good = cell.subscribe(listener);

        let first = cell.set(1);
        assert_eq!(first.delivered, 2);
        assert_eq!(first.failures.len(), 1);
        assert!(first.failures[0].message.contains("render failed"));

        let second = cell.set(2);
        assert_eq!(second.delivered, 1);
        assert_eq!(second.failures.len(), 2);
        assert!(second.failures[1].message.contains("boom"));

        assert_eq!(*log.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn listener_sees_committed_value_through_get() {
        let cell = ObservableCell::new(0u32);
        let probe = cell.clone();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = cell.subscribe(move |v| {
            sink.lock().unwrap().push((*v, probe.get()));
            Ok(())
        });

        cell.set(4);
        cell.update(|v| *v += 1);
        assert_eq!(*seen.lock().unwrap(), vec![(4, 4), (5, 5)]);
    }
}
