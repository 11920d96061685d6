//! Heap object layout and typed handles.

use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, Ordering};

use crate::space::ObjectSpace;

/// Header placed in front of every managed value. Carries the shared
/// reference counter, the destroy thunk for the concrete type, and the
/// space the object reclaims into.
pub struct ObjectHeader {
    references: AtomicI32,
    space: &'static ObjectSpace,
    destroy: unsafe fn(*mut ObjectHeader),
}

impl ObjectHeader {
    pub(crate) fn new(space: &'static ObjectSpace, destroy: unsafe fn(*mut ObjectHeader)) -> Self {
        Self {
            references: AtomicI32::new(0),
            space,
            destroy,
        }
    }

    pub fn references(&self) -> i32 {
        self.references.load(Ordering::SeqCst)
    }

    pub(crate) fn counter(&self) -> &AtomicI32 {
        &self.references
    }

    pub(crate) fn space(&self) -> &'static ObjectSpace {
        self.space
    }

    /// # Safety
    /// Must be invoked exactly once, after the last reference dropped, with
    /// a pointer produced by the matching `Obj<T>` allocation.
    pub(crate) unsafe fn destroy(this: *mut ObjectHeader) {
        ((*this).destroy)(this)
    }
}

/// Managed allocation: header followed by the value. `#[repr(C)]` so a
/// header pointer and the allocation pointer are interchangeable.
#[repr(C)]
pub struct Obj<T> {
    pub(crate) header: ObjectHeader,
    pub(crate) value: T,
}

pub(crate) unsafe fn drop_obj<T>(header: *mut ObjectHeader) {
    drop(Box::from_raw(header as *mut Obj<T>));
}

/// Unowned typed handle to a managed object.
///
/// Copying an `ObjPtr` does not touch the reference count; ownership lives
/// in [`Ref`](crate::cell::Ref) slots. A handle read from a `Ref` stays
/// valid as long as some `Ref` holds the object.
pub struct ObjPtr<T: Send + Sync + 'static> {
    ptr: NonNull<Obj<T>>,
}

impl<T: Send + Sync + 'static> ObjPtr<T> {
    pub(crate) fn from_raw(ptr: NonNull<Obj<T>>) -> Self {
        Self { ptr }
    }

    pub(crate) fn as_obj(&self) -> *mut Obj<T> {
        self.ptr.as_ptr()
    }

    pub(crate) fn header(&self) -> *mut ObjectHeader {
        self.ptr.as_ptr() as *mut ObjectHeader
    }

    /// Current reference count, racy by nature.
    pub fn ref_count(&self) -> i32 {
        unsafe { (*self.header()).references() }
    }
}

impl<T: Send + Sync + 'static> Deref for ObjPtr<T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &self.ptr.as_ref().value }
    }
}

impl<T: Send + Sync + 'static> Clone for ObjPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: Send + Sync + 'static> Copy for ObjPtr<T> {}

impl<T: Send + Sync + 'static> PartialEq for ObjPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<T: Send + Sync + 'static> Eq for ObjPtr<T> {}

unsafe impl<T: Send + Sync + 'static> Send for ObjPtr<T> {}
unsafe impl<T: Send + Sync + 'static> Sync for ObjPtr<T> {}
