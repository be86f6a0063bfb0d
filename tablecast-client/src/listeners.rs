//! Listener fan-out
//!
//! [`ListenerSet`] stores callbacks for one kind of event and calls all of
//! them with [`ListenerSet::invoke_all`]. A panicking listener is caught and
//! logged; the remaining listeners still run and the caller never sees the
//! panic.
//!
//! Registration returns a [`ListenerHandle`]. Dropping the handle leaves the
//! listener registered; call [`ListenerHandle::remove`] to deregister.

use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

type Listener<A> = Arc<dyn Fn(&A) + Send + Sync>;

struct Entries<A: ?Sized> {
    next_id: u64,
    listeners: Vec<(u64, Listener<A>)>,
}

/// Ordered set of callbacks taking `&A`
///
/// # Examples
///
/// ```
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
/// use tablecast_client::ListenerSet;
///
/// let seated: ListenerSet<u32> = ListenerSet::new("seated");
/// let total = Arc::new(AtomicUsize::new(0));
/// let t = total.clone();
/// let handle = seated.add(move |guests: &u32| {
///     t.fetch_add(*guests as usize, Ordering::SeqCst);
/// });
///
/// seated.invoke_all(&4);
/// handle.remove();
/// seated.invoke_all(&2);
///
/// assert_eq!(total.load(Ordering::SeqCst), 4);
/// assert!(seated.is_empty());
/// ```
pub struct ListenerSet<A: ?Sized + 'static> {
    name: &'static str,
    entries: Arc<Mutex<Entries<A>>>,
}

impl<A: ?Sized + 'static> ListenerSet<A> {
    /// `name` labels log lines about failing listeners
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: Arc::new(Mutex::new(Entries {
                next_id: 0,
                listeners: Vec::new(),
            })),
        }
    }

    /// Register a listener
    ///
    /// Listeners run in registration order. Keep the returned handle to
    /// deregister it later.
    pub fn add<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        let id = {
            let mut entries = self.entries.lock();
            let id = entries.next_id;
            entries.next_id += 1;
            entries.listeners.push((id, Arc::new(listener)));
            id
        };

        let weak: Weak<Mutex<Entries<A>>> = Arc::downgrade(&self.entries);
        ListenerHandle {
            remover: Some(Box::new(move || {
                if let Some(entries) = weak.upgrade() {
                    entries.lock().listeners.retain(|(entry, _)| *entry != id);
                }
            })),
        }
    }

    /// Call every listener in registration order
    ///
    /// Returns how many listeners panicked.
    pub fn invoke_all(&self, arg: &A) -> usize {
        // Listeners may register or remove listeners, so call them unlocked.
        let snapshot: Vec<Listener<A>> = self
            .entries
            .lock()
            .listeners
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        let mut failed = 0;
        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(arg))).is_err() {
                failed += 1;
                tracing::error!(listeners = self.name, "Listener panicked; continuing");
            }
        }
        failed
    }

    /// Number of registered listeners
    pub fn len(&self) -> usize {
        self.entries.lock().listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Deregisters its listener when [`remove`](ListenerHandle::remove)d
pub struct ListenerHandle {
    remover: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl ListenerHandle {
    /// Deregister the listener; a no-op if the set is gone
    pub fn remove(mut self) {
        if let Some(remover) = self.remover.take() {
            remover();
        }
    }
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("active", &self.remover.is_some())
            .finish()
    }
}
