//! Work items, completion callbacks, and serial task queues.

use std::any::Any;
use std::ptr::null_mut;
use std::sync::atomic::AtomicPtr;
use std::sync::Arc;

use crate::dispatch::queue::{AuList, QueueLink};
use crate::sync::monitor::Monitor;

/// Function code of the internal chaser item that terminates a drain.
pub const FC_CHASE: i32 = -1;
/// Function code tracing queue passage; completes normally without work.
pub const FC_TRACE: i32 = -2;
/// Function code purging everything queued behind it.
pub const FC_RESET: i32 = -3;

/// Completion: the item was worked.
pub const CC_NORMAL: i32 = 0;
/// Completion: the item was discarded by a purge, cancel, or shutdown.
pub const CC_PURGE: i32 = -1;
/// Completion: the worker reported a failure.
pub const CC_ERROR: i32 = -2;
/// Completion: the function code was negative but not recognized.
pub const CC_ERROR_FC: i32 = -3;

/// Completion callback. Receives the finished item back, including its
/// completion code and payload.
pub trait Done: Send + Sync {
    fn done(&self, item: Box<Item>);
}

/// [`Done`] adapter over a closure.
pub struct LambdaDone<F: Fn(Box<Item>) + Send + Sync> {
    f: F,
}

impl<F: Fn(Box<Item>) + Send + Sync + 'static> LambdaDone<F> {
    pub fn new(f: F) -> Box<Self> {
        Box::new(Self { f })
    }
}

impl<F: Fn(Box<Item>) + Send + Sync> Done for LambdaDone<F> {
    fn done(&self, item: Box<Item>) {
        (self.f)(item)
    }
}

/// Synchronous completion rendezvous. Enqueue an item carrying an
/// `Arc<Wait>` as its [`Done`], then block on [`wait`](Self::wait) for the
/// completion code.
pub struct Wait {
    status: Monitor<Option<i32>>,
}

impl Wait {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            status: Monitor::new(None),
        })
    }

    /// Block until a completion arrives and consume it.
    pub fn wait(&self) -> i32 {
        let mut status = self.status.lock();
        loop {
            if let Some(cc) = status.take() {
                return cc;
            }
            status.wait();
        }
    }

    /// Discard any completion already posted, rearming for reuse.
    pub fn reset(&self) {
        self.status.lock().take();
    }

    pub fn post(&self, cc: i32) {
        let mut status = self.status.lock();
        *status = Some(cc);
        drop(status);
        self.status.notify_all();
    }
}

impl Done for Arc<Wait> {
    fn done(&self, item: Box<Item>) {
        self.post(item.cc());
    }
}

/// A unit of queued work.
pub struct Item {
    link: AtomicPtr<Item>,
    fc: i32,
    cc: i32,
    data: Option<Box<dyn Any + Send>>,
    done: Option<Box<dyn Done>>,
}

impl QueueLink for Item {
    fn link_ptr(&self) -> &AtomicPtr<Item> {
        &self.link
    }
}

impl Item {
    pub fn new(fc: i32) -> Box<Item> {
        Box::new(Self {
            link: AtomicPtr::new(null_mut()),
            fc,
            cc: CC_NORMAL,
            data: None,
            done: None,
        })
    }

    pub fn with_done(fc: i32, done: Box<dyn Done>) -> Box<Item> {
        let mut item = Self::new(fc);
        item.done = Some(done);
        item
    }

    pub fn with_data(fc: i32, data: Box<dyn Any + Send>) -> Box<Item> {
        let mut item = Self::new(fc);
        item.data = Some(data);
        item
    }

    pub fn set_done(&mut self, done: Box<dyn Done>) {
        self.done = Some(done);
    }

    pub fn set_data(&mut self, data: Box<dyn Any + Send>) {
        self.data = Some(data);
    }

    pub fn fc(&self) -> i32 {
        self.fc
    }

    pub fn cc(&self) -> i32 {
        self.cc
    }

    pub fn take_data(&mut self) -> Option<Box<dyn Any + Send>> {
        self.data.take()
    }

    /// Complete the item: record `cc` and hand it to its [`Done`], or drop
    /// it when no completion was requested.
    pub fn post(mut self: Box<Self>, cc: i32) {
        self.cc = cc;
        if let Some(done) = self.done.take() {
            done.done(self);
        }
    }
}

/// Task body: invoked once per worked item, on the dispatcher's worker
/// thread, in queue order.
pub trait Worker: Send + Sync + 'static {
    fn work(&self, item: Box<Item>);
}

struct LambdaWorker<F: Fn(Box<Item>) + Send + Sync + 'static> {
    f: F,
}

impl<F: Fn(Box<Item>) + Send + Sync + 'static> Worker for LambdaWorker<F> {
    fn work(&self, item: Box<Item>) {
        (self.f)(item)
    }
}

/// A serial queue of items bound to one [`Worker`].
///
/// Items on the same task are worked one at a time, oldest first, with no
/// two drains of the same task ever running concurrently.
pub struct Task {
    link: AtomicPtr<Task>,
    queue: AuList<Item>,
    worker: Box<dyn Worker>,
}

impl QueueLink for Task {
    fn link_ptr(&self) -> &AtomicPtr<Task> {
        &self.link
    }
}

struct InertWorker;

impl Worker for InertWorker {
    fn work(&self, item: Box<Item>) {
        item.post(CC_ERROR);
    }
}

impl Task {
    pub fn new(worker: impl Worker) -> Arc<Task> {
        Arc::new(Self {
            link: AtomicPtr::new(null_mut()),
            queue: AuList::new(),
            worker: Box::new(worker),
        })
    }

    pub fn with_fn(f: impl Fn(Box<Item>) + Send + Sync + 'static) -> Arc<Task> {
        Self::new(LambdaWorker { f })
    }

    /// Placeholder task for scheduler drain protocols. Never worked.
    pub(crate) fn stopper() -> Task {
        Self {
            link: AtomicPtr::new(null_mut()),
            queue: AuList::new(),
            worker: Box::new(InertWorker),
        }
    }

    /// Queue `item`; returns true when the task went empty to non-empty and
    /// therefore needs scheduling.
    pub(crate) fn push(&self, item: Box<Item>) -> bool {
        unsafe { self.queue.fifo(Box::into_raw(item)).is_null() }
    }

    /// Work every queued item, oldest first, then stop. Single caller at a
    /// time per task; the scheduler guarantees that.
    pub(crate) fn drain(&self) {
        if self.queue.is_empty() {
            return;
        }
        // the chaser marks where this drain ends; items queued after it are
        // left for the next schedule
        let stopper = Box::into_raw(Item::new(FC_CHASE));
        unsafe {
            self.queue.fifo(stopper);
            loop {
                let raw = self.queue.remq(stopper);
                if raw.is_null() {
                    drop(Box::from_raw(stopper));
                    return;
                }
                if raw == stopper {
                    self.queue.fifo(stopper);
                    continue;
                }
                let item = Box::from_raw(raw);
                if item.fc < 0 {
                    match item.fc {
                        FC_CHASE => item.post(CC_NORMAL),
                        FC_TRACE => {
                            log::debug!(target: "dispatch", "trace item through task {:p}", self);
                            item.post(CC_NORMAL);
                        }
                        FC_RESET => {
                            self.purge(stopper);
                            item.post(CC_NORMAL);
                            return;
                        }
                        fc => {
                            log::error!(target: "dispatch", "unknown function code {}", fc);
                            item.post(CC_ERROR_FC);
                        }
                    }
                } else {
                    self.worker.work(item);
                }
            }
        }
    }

    /// Discard everything still queued, completing each item with
    /// [`CC_PURGE`] in queue order. Consumes the drain's chaser.
    unsafe fn purge(&self, stopper: *mut Item) {
        let mut chain = self.queue.reset();
        let mut items = Vec::new();
        while !chain.is_null() {
            let next = (*chain).link.load(std::sync::atomic::Ordering::Relaxed);
            if chain == stopper {
                drop(Box::from_raw(chain));
            } else {
                items.push(Box::from_raw(chain));
            }
            chain = next;
        }
        for item in items.into_iter().rev() {
            item.post(CC_PURGE);
        }
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        let mut chain = self.queue.reset();
        let mut items = Vec::new();
        unsafe {
            while !chain.is_null() {
                let next = (*chain).link.load(std::sync::atomic::Ordering::Relaxed);
                items.push(Box::from_raw(chain));
                chain = next;
            }
        }
        for item in items.into_iter().rev() {
            item.post(CC_PURGE);
        }
    }
}
