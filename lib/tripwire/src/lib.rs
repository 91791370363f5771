//! A cancellation scope built from a `Trigger` and any number of `Tripwire`s.
//!
//! A `Tripwire` is a future which resolves once its `Trigger` is cancelled or
//! dropped. Scopes form a tree, a tripwire created by [`Tripwire::child`]
//! resolves when its own trigger fires, or when any ancestor scope does.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use tracing::trace;

// Ids are process wide, so one id can be registered in every scope up the chain.
static NEXT_ID: AtomicU64 = AtomicU64::new(0);

fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

struct Shared {
    name: String,

    cancelled: AtomicBool,
    wakers: Mutex<HashMap<u64, Waker>>,

    parent: Option<Arc<Shared>>,
}

impl Shared {
    fn new(name: String, parent: Option<Arc<Shared>>) -> Arc<Self> {
        Arc::new(Shared {
            name,
            cancelled: AtomicBool::new(false),
            wakers: Mutex::new(HashMap::new()),
            parent,
        })
    }

    /// Iterate this scope and all of its ancestors.
    fn chain(&self) -> impl Iterator<Item = &Shared> {
        std::iter::successors(Some(self), |shared| shared.parent.as_deref())
    }

    fn cancelled(&self) -> bool {
        self.chain()
            .any(|shared| shared.cancelled.load(Ordering::SeqCst))
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);

        let wakers = std::mem::take(&mut *self.wakers.lock().expect("lock waker map success"));
        trace!(message = "wake tripwires", scope = self.name, count = wakers.len());

        wakers.into_values().for_each(Waker::wake);
    }
}

/// The cancelling side of a scope. Dropping it cancels the scope too.
pub struct Trigger {
    shared: Arc<Shared>,
}

impl Trigger {
    /// Cancel all associated tripwires, make them immediately resolved.
    pub fn cancel(self) {
        // drop does the work
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }
}

impl Drop for Trigger {
    fn drop(&mut self) {
        trace!(message = "trigger fired", scope = self.shared.name);

        self.shared.cancel();
    }
}

pub struct Tripwire {
    shared: Arc<Shared>,
    id: u64,
}

impl Clone for Tripwire {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            id: next_id(),
        }
    }
}

impl Drop for Tripwire {
    fn drop(&mut self) {
        for shared in self.shared.chain() {
            shared
                .wakers
                .lock()
                .expect("lock waker map success")
                .remove(&self.id);
        }
    }
}

impl Future for Tripwire {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.shared.cancelled() {
            return Poll::Ready(());
        }

        // Register before the second check, so a cancel racing with this poll
        // either sees our waker or we see its flag.
        for shared in self.shared.chain() {
            shared
                .wakers
                .lock()
                .expect("lock waker map success")
                .insert(self.id, cx.waker().clone());
        }

        if self.shared.cancelled() {
            return Poll::Ready(());
        }

        Poll::Pending
    }
}

impl Tripwire {
    /// Create a new root scope.
    pub fn new(name: impl Into<String>) -> (Trigger, Tripwire) {
        Self::with_parent(name.into(), None)
    }

    /// Create a scope nested in this one. The returned tripwire resolves when
    /// the returned trigger fires, or when this scope (or any of its ancestors)
    /// is cancelled. Cancelling the child never affects the parent.
    pub fn child(&self, name: impl Into<String>) -> (Trigger, Tripwire) {
        Self::with_parent(name.into(), Some(Arc::clone(&self.shared)))
    }

    fn with_parent(name: String, parent: Option<Arc<Shared>>) -> (Trigger, Tripwire) {
        let shared = Shared::new(name, parent);

        (
            Trigger {
                shared: Arc::clone(&shared),
            },
            Tripwire {
                shared,
                id: next_id(),
            },
        )
    }

    /// Returns true if this scope or any ancestor has been cancelled, without
    /// registering for wakeups.
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled()
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }
}
