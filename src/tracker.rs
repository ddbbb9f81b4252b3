// Object tracker
//
// Every backend allocation is owned by exactly one strong reference kept
// here. Client handles and views only hold weak references, so the device
// can force-release everything at teardown even if a handle leaked.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::{DeviceError, Result};

type TrackedObject = Arc<dyn Any + Send + Sync>;

#[derive(Default)]
struct TrackerInner {
    next_id: u64,
    objects: HashMap<u64, TrackedObject>,
}

/// Registry of live backend allocations
#[derive(Default)]
pub struct ObjectTracker {
    inner: Mutex<TrackerInner>,
}

impl ObjectTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take ownership of `object` and hand back a weak reference to it
    pub fn track<T: Any + Send + Sync>(self: &Arc<Self>, object: T) -> TrackedRef {
        let object: TrackedObject = Arc::new(object);
        let weak = Arc::downgrade(&object);

        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.objects.insert(id, object);

        TrackedRef {
            id,
            object: weak,
            tracker: Arc::downgrade(self),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, id: u64) {
        // Drop outside the lock, native destructors may be slow
        let released = self.inner.lock().objects.remove(&id);
        drop(released);
    }

    /// Drop every registered allocation. Returns how many were still alive.
    pub fn release_all(&self) -> usize {
        let objects = std::mem::take(&mut self.inner.lock().objects);
        let count = objects.len();

        if count > 0 {
            log::debug!("Tracker releasing {} leaked allocation(s)", count);
        }

        drop(objects);
        count
    }
}

/// Non-owning reference to a tracked allocation. Dropping it releases the
/// allocation from the tracker.
pub struct TrackedRef {
    id: u64,
    object: Weak<dyn Any + Send + Sync>,
    tracker: Weak<ObjectTracker>,
}

impl TrackedRef {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_alive(&self) -> bool {
        self.object.strong_count() > 0
    }

    pub(crate) fn downgrade(&self) -> Weak<dyn Any + Send + Sync> {
        self.object.clone()
    }

    /// Resolve to the backend object, failing if it was released or belongs
    /// to another backend
    pub fn upgrade<T: Any + Send + Sync>(&self) -> Result<Arc<T>> {
        upgrade_weak(&self.object, "resource")
    }
}

impl Drop for TrackedRef {
    fn drop(&mut self) {
        if let Some(tracker) = self.tracker.upgrade() {
            tracker.release(self.id);
        }
    }
}

impl std::fmt::Debug for TrackedRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedRef")
            .field("id", &self.id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

pub(crate) fn upgrade_weak<T: Any + Send + Sync>(
    weak: &Weak<dyn Any + Send + Sync>,
    what: &'static str,
) -> Result<Arc<T>> {
    let object = weak.upgrade().ok_or(DeviceError::Expired(what))?;

    object.downcast::<T>().map_err(|_| {
        DeviceError::unsupported(format!("{} was created by a different backend", what))
    })
}
