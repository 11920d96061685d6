//! Lock-free owning reference slots.

use std::ptr::{null_mut, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::object::{Obj, ObjPtr, ObjectHeader};

/// An owning slot for a managed object.
///
/// Each populated `Ref` accounts for exactly one reference. `set` swaps the
/// slot atomically, so any number of threads may read and write the same
/// `Ref` concurrently; the object behind a displaced pointer is only
/// destroyed once every slot holding it has let go, and destruction itself
/// is deferred to the slot's [`ObjectSpace`](crate::space::ObjectSpace).
pub struct Ref<T: Send + Sync + 'static> {
    slot: AtomicPtr<Obj<T>>,
}

impl<T: Send + Sync + 'static> Ref<T> {
    /// An empty slot.
    pub const fn null() -> Self {
        Self {
            slot: AtomicPtr::new(null_mut()),
        }
    }

    pub fn new(object: ObjPtr<T>) -> Self {
        let cell = Self::null();
        cell.set(Some(object));
        cell
    }

    pub fn is_null(&self) -> bool {
        self.slot.load(Ordering::SeqCst).is_null()
    }

    /// Read the current handle without transferring ownership.
    pub fn get(&self) -> Option<ObjPtr<T>> {
        NonNull::new(self.slot.load(Ordering::SeqCst)).map(ObjPtr::from_raw)
    }

    /// Replace the slot's object. The displaced object loses one reference
    /// and is queued for reclamation when that was the last one.
    pub fn set(&self, object: Option<ObjPtr<T>>) {
        let new = object.map_or(null_mut(), |o| o.as_obj());
        let old = self.slot.swap(new, Ordering::SeqCst);
        if old == new {
            return;
        }
        unsafe {
            // retain first: dropping the old chain may recursively release
            // the penultimate reference to the incoming object
            if !new.is_null() {
                retain(new as *mut ObjectHeader);
            }
            if !old.is_null() {
                release(old as *mut ObjectHeader);
            }
        }
    }

    pub fn take(&self) -> Option<ObjPtr<T>> {
        let object = self.get();
        self.set(None);
        object
    }
}

impl<T: Send + Sync + 'static> Default for Ref<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T: Send + Sync + 'static> Clone for Ref<T> {
    fn clone(&self) -> Self {
        let cell = Self::null();
        cell.set(self.get());
        cell
    }
}

impl<T: Send + Sync + 'static> Drop for Ref<T> {
    fn drop(&mut self) {
        self.set(None);
    }
}

unsafe impl<T: Send + Sync + 'static> Send for Ref<T> {}
unsafe impl<T: Send + Sync + 'static> Sync for Ref<T> {}

unsafe fn retain(header: *mut ObjectHeader) {
    let counter = (*header).counter();
    let mut old = counter.load(Ordering::Relaxed);
    loop {
        let new = old.wrapping_add(1);
        if new <= 0 {
            crate::fatal_error(&format!(
                "reference count overflow on object {:p} ({})",
                header, old
            ));
        }
        match counter.compare_exchange_weak(old, new, Ordering::SeqCst, Ordering::Relaxed) {
            Ok(_) => {
                if old == 0 {
                    (*header).space().count_object(1);
                }
                return;
            }
            Err(now) => old = now,
        }
    }
}

unsafe fn release(header: *mut ObjectHeader) {
    let counter = (*header).counter();
    let mut old = counter.load(Ordering::Relaxed);
    loop {
        let new = old - 1;
        if new < 0 {
            crate::fatal_error(&format!(
                "reference count underflow on object {:p} ({})",
                header, old
            ));
        }
        match counter.compare_exchange_weak(old, new, Ordering::SeqCst, Ordering::Relaxed) {
            Ok(_) => {
                if new == 0 {
                    let space = (*header).space();
                    space.count_object(-1);
                    space.reclaim(header);
                }
                return;
            }
            Err(now) => old = now,
        }
    }
}
