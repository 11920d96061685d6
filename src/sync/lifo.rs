use std::sync::atomic::{AtomicPtr, Ordering};

/// Intrusive node of a [`LifoStack`]. The node type embeds its own link
/// pointer, so stack membership never allocates.
pub trait LifoNode: Sized {
    fn next_ptr(&self) -> &AtomicPtr<Self>;
}

/// Lock-free LIFO stack of intrusive nodes.
///
/// `push` and `pop_all` are safe to call concurrently from any number of
/// threads. `pop` removes single nodes and must be serialized by the caller
/// (a single consumer, or an external lock); concurrent pushes remain fine.
pub struct LifoStack<T: LifoNode> {
    top: AtomicPtr<T>,
}

impl<T: LifoNode> LifoStack<T> {
    pub const fn new() -> Self {
        Self {
            top: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    pub fn top(&self) -> *mut T {
        self.top.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.top.load(Ordering::Relaxed).is_null()
    }

    pub fn next(node: &T) -> *mut T {
        node.next_ptr().load(Ordering::Relaxed)
    }

    pub fn set_next(node: &T, next: *mut T) {
        node.next_ptr().store(next, Ordering::Relaxed);
    }

    /// Push `node`, returning the previous top. A null return means the
    /// stack was empty before this push.
    ///
    /// # Safety
    /// `node` must be valid and not already on a stack.
    pub unsafe fn push(&self, node: *mut T) -> *mut T {
        let mut cur = self.top.load(Ordering::Relaxed);
        loop {
            Self::set_next(&*node, cur);
            match self
                .top
                .compare_exchange_weak(cur, node, Ordering::SeqCst, Ordering::Relaxed)
            {
                Ok(prev) => return prev,
                Err(now) => cur = now,
            }
        }
    }

    /// Detach the entire chain, linked newest to oldest.
    pub fn pop_all(&self) -> *mut T {
        self.top.swap(core::ptr::null_mut(), Ordering::SeqCst)
    }

    /// Pop the most recently pushed node, or null if empty.
    ///
    /// # Safety
    /// Only one thread may pop at a time; otherwise the head CAS is exposed
    /// to ABA on nodes that are popped and re-pushed.
    pub unsafe fn pop(&self) -> *mut T {
        let mut cur = self.top.load(Ordering::Acquire);
        while !cur.is_null() {
            let next = Self::next(&*cur);
            match self
                .top
                .compare_exchange_weak(cur, next, Ordering::SeqCst, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(now) => cur = now,
            }
        }
        cur
    }
}
