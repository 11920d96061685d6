//! Atomic FIFO built from a single tail pointer.
//!
//! Producers prepend at the tail with one CAS; the single consumer walks
//! the chain to the oldest element. Whether a queue went empty to non-empty
//! is reported by `fifo`, which is what drives scheduling decisions.

use std::ptr::null_mut;
use std::sync::atomic::{AtomicPtr, Ordering};

/// Intrusive node of an [`AuList`].
pub trait QueueLink: Sized {
    fn link_ptr(&self) -> &AtomicPtr<Self>;
}

pub struct AuList<T: QueueLink> {
    tail: AtomicPtr<T>,
}

impl<T: QueueLink> AuList<T> {
    pub const fn new() -> Self {
        Self {
            tail: AtomicPtr::new(null_mut()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tail.load(Ordering::Relaxed).is_null()
    }

    /// Insert `node`, returning the previous tail. A null return means the
    /// queue was empty before this insert and needs to be scheduled.
    ///
    /// # Safety
    /// `node` must be valid and not already queued.
    pub unsafe fn fifo(&self, node: *mut T) -> *mut T {
        let mut cur = self.tail.load(Ordering::Relaxed);
        loop {
            (*node).link_ptr().store(cur, Ordering::Relaxed);
            match self
                .tail
                .compare_exchange_weak(cur, node, Ordering::SeqCst, Ordering::Relaxed)
            {
                Ok(prev) => return prev,
                Err(now) => cur = now,
            }
        }
    }

    /// Detach the whole chain, linked newest to oldest.
    pub fn reset(&self) -> *mut T {
        self.tail.swap(null_mut(), Ordering::SeqCst)
    }

    /// Remove the oldest element, or null once only `stopper` remains.
    ///
    /// The returned element may be `stopper` itself when newer inserts
    /// raced past it; the caller re-inserts it and keeps draining. Null
    /// means `stopper` was the sole element and has been consumed, i.e.
    /// the drain is complete.
    ///
    /// # Safety
    /// Single consumer. `stopper` must have been inserted by that consumer.
    pub unsafe fn remq(&self, stopper: *mut T) -> *mut T {
        loop {
            let tail = self.tail.load(Ordering::SeqCst);
            if tail.is_null() {
                return null_mut();
            }

            let next = (*tail).link_ptr().load(Ordering::Relaxed);
            if next.is_null() {
                // single element; the consumer owns removal, so only a
                // producer can race this CAS by appending
                if tail == stopper {
                    if self
                        .tail
                        .compare_exchange(tail, null_mut(), Ordering::SeqCst, Ordering::Relaxed)
                        .is_ok()
                    {
                        return null_mut();
                    }
                    continue;
                }
                if self
                    .tail
                    .compare_exchange(tail, null_mut(), Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
                {
                    return tail;
                }
                continue;
            }

            // two or more elements: walk to the oldest, unlink it behind
            // its predecessor (interior links are consumer-owned)
            let mut pred = tail;
            let mut oldest = next;
            loop {
                let after = (*oldest).link_ptr().load(Ordering::Relaxed);
                if after.is_null() {
                    break;
                }
                pred = oldest;
                oldest = after;
            }
            (*pred).link_ptr().store(null_mut(), Ordering::Release);
            return oldest;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Node {
        link: AtomicPtr<Node>,
        tag: i32,
    }

    impl QueueLink for Node {
        fn link_ptr(&self) -> &AtomicPtr<Node> {
            &self.link
        }
    }

    fn node(tag: i32) -> *mut Node {
        Box::into_raw(Box::new(Node {
            link: AtomicPtr::new(null_mut()),
            tag,
        }))
    }

    #[test]
    fn fifo_reports_empty_transition() {
        let q = AuList::<Node>::new();
        unsafe {
            let a = node(1);
            assert!(q.fifo(a).is_null());
            assert!(!q.fifo(node(2)).is_null());
            let chain = q.reset();
            let mut cur = chain;
            let mut tags = Vec::new();
            while !cur.is_null() {
                let next = (*cur).link.load(Ordering::Relaxed);
                tags.push(Box::from_raw(cur).tag);
                cur = next;
            }
            assert_eq!(tags, vec![2, 1]);
        }
    }

    #[test]
    fn remq_drains_oldest_first() {
        let q = AuList::<Node>::new();
        unsafe {
            for tag in 1..=3 {
                q.fifo(node(tag));
            }
            let stopper = node(0);
            q.fifo(stopper);

            let mut tags = Vec::new();
            loop {
                let got = q.remq(stopper);
                if got.is_null() {
                    break;
                }
                if got == stopper {
                    q.fifo(stopper);
                    continue;
                }
                tags.push(Box::from_raw(got).tag);
            }
            assert_eq!(tags, vec![1, 2, 3]);
            assert!(q.is_empty());
            drop(Box::from_raw(stopper));
        }
    }

    #[test]
    fn remq_returns_displaced_stopper() {
        let q = AuList::<Node>::new();
        unsafe {
            let stopper = node(0);
            q.fifo(stopper);
            q.fifo(node(7));

            // stopper is oldest now, so it comes back first
            let got = q.remq(stopper);
            assert_eq!(got, stopper);
            q.fifo(stopper);

            let item = q.remq(stopper);
            assert_eq!((*item).tag, 7);
            drop(Box::from_raw(item));

            assert!(q.remq(stopper).is_null());
            drop(Box::from_raw(stopper));
        }
    }
}
