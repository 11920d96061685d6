//! Deferred reclamation space and its collector service thread.

use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicU8, AtomicUsize, Ordering};
use std::thread;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::freelist::{FreeList, ReclaimLink};
use crate::object::{drop_obj, Obj, ObjPtr, ObjectHeader};
use crate::sync::lifo::LifoStack;
use crate::sync::monitor::Monitor;
use crate::sync::semaphore::Semaphore;

const IDLE: u8 = 0;
const CLAIMED: u8 = 1;

thread_local! {
    // true on whichever thread is inside collect()
    static COLLECTING: Cell<bool> = const { Cell::new(false) };
}

#[derive(Clone, Copy, Debug)]
pub struct SpaceConfig {
    /// Reclaim links preallocated in the base block.
    pub reserved_links: usize,
    /// Minimum links carved from each extension page.
    pub links_per_page: usize,
    /// Extension pages tolerated before releasing threads are stalled into
    /// foreground collection.
    pub backpressure_pages: usize,
}

impl Default for SpaceConfig {
    fn default() -> Self {
        Self {
            reserved_links: 16384,
            links_per_page: 4096,
            backpressure_pages: 2,
        }
    }
}

#[derive(Default)]
struct SpaceStats {
    adds: AtomicUsize,
    deletes: AtomicUsize,
    collects: AtomicUsize,
    passes: AtomicUsize,
    redos: AtomicUsize,
    posts: AtomicUsize,
    waits: AtomicUsize,
}

/// Snapshot of the space's activity counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct SpaceCounters {
    pub adds: usize,
    pub deletes: usize,
    pub collects: usize,
    pub passes: usize,
    pub redos: usize,
    pub posts: usize,
    pub waits: usize,
}

/// A reclamation domain.
///
/// Objects whose last reference drops are queued here and destroyed later,
/// off the releasing thread, by the space's collector thread (or by whoever
/// calls [`collect`](Self::collect) first). One process-wide instance is
/// available through [`space`]; independent instances can be created for
/// isolation.
pub struct ObjectSpace {
    pool: FreeList,
    reclaim: LifoStack<ReclaimLink>,
    collector: AtomicU8,
    gc_monitor: Monitor<bool>,
    backpressure: Mutex<()>,
    work: Semaphore,
    operational: AtomicBool,
    live_objects: AtomicIsize,
    stats: SpaceStats,
    config: SpaceConfig,
}

static GLOBAL: Lazy<&'static ObjectSpace> =
    Lazy::new(|| ObjectSpace::new(SpaceConfig::default()));

/// The process-wide space, created on first use.
pub fn space() -> &'static ObjectSpace {
    *GLOBAL
}

impl ObjectSpace {
    /// Create a space and start its collector thread. The space is leaked;
    /// it lives for the rest of the process.
    pub fn new(config: SpaceConfig) -> &'static ObjectSpace {
        let space: &'static ObjectSpace = Box::leak(Box::new(Self {
            pool: FreeList::new(config.reserved_links, config.links_per_page),
            reclaim: LifoStack::new(),
            collector: AtomicU8::new(IDLE),
            gc_monitor: Monitor::new(false),
            backpressure: Mutex::new(()),
            work: Semaphore::new(),
            operational: AtomicBool::new(true),
            live_objects: AtomicIsize::new(0),
            stats: SpaceStats::default(),
            config,
        }));

        let spawned = thread::Builder::new()
            .name("lazygc-collector".into())
            .spawn(move || space.run());
        if spawned.is_err() {
            crate::fatal_error("collector thread spawn failure");
        }

        space
    }

    /// Allocate a managed value. The object starts unreferenced; store the
    /// handle into a [`Ref`](crate::cell::Ref) to keep it alive.
    pub fn alloc<T: Send + Sync + 'static>(&'static self, value: T) -> ObjPtr<T> {
        let raw = Box::into_raw(Box::new(Obj {
            header: ObjectHeader::new(self, drop_obj::<T>),
            value,
        }));
        // just allocated, cannot be null
        match NonNull::new(raw) {
            Some(ptr) => ObjPtr::from_raw(ptr),
            None => crate::fatal_error("object allocation returned null"),
        }
    }

    /// Queue `header` for destruction. Called when its last reference drops.
    pub(crate) fn reclaim(&self, header: *mut ObjectHeader) {
        // releasing threads pay for collection once the link pool grows past
        // the configured page budget
        if !COLLECTING.with(|c| c.get())
            && self.pool.used_pages() > self.config.backpressure_pages
        {
            let _stall = self.backpressure.lock();
            if self.pool.used_pages() > self.config.backpressure_pages {
                log::debug!(
                    target: "gc",
                    "backpressure: {} pages in use, stalling release",
                    self.pool.used_pages()
                );
                while self.gc() {}
            }
        }

        self.stats.adds.fetch_add(1, Ordering::Relaxed);
        let link = self.pool.get();
        unsafe {
            (*link).object = header;
            if self.reclaim.push(link).is_null() {
                // empty to non-empty transition wakes the collector
                self.stats.posts.fetch_add(1, Ordering::Relaxed);
                self.work.post();
            }
        }
    }

    /// Destroy everything queued so far. At most one thread collects at a
    /// time; losers return immediately. Objects whose destruction releases
    /// further references are handled in the same call.
    pub fn collect(&self) {
        self.stats.collects.fetch_add(1, Ordering::Relaxed);
        if self.reclaim.top().is_null() {
            return;
        }
        if self
            .collector
            .compare_exchange(IDLE, CLAIMED, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        COLLECTING.with(|c| c.set(true));
        let mut chain = self.reclaim.pop_all();
        while !chain.is_null() {
            self.stats.passes.fetch_add(1, Ordering::Relaxed);
            while !chain.is_null() {
                unsafe {
                    let link = chain;
                    chain = LifoStack::next(&*link);
                    #[cfg(debug_assertions)]
                    self.pool.check(link);
                    let object = (*link).object;
                    (*link).object = std::ptr::null_mut();
                    if catch_unwind(AssertUnwindSafe(|| ObjectHeader::destroy(object))).is_err() {
                        crate::fatal_error(&format!("object {:p} panicked in destroy", object));
                    }
                    self.pool.put(link);
                }
                self.stats.deletes.fetch_add(1, Ordering::Relaxed);
            }
            // destructions may have queued more work
            chain = self.reclaim.pop_all();
            if !chain.is_null() {
                self.stats.redos.fetch_add(1, Ordering::Relaxed);
            }
        }
        COLLECTING.with(|c| c.set(false));
        self.collector.store(IDLE, Ordering::SeqCst);

        let mut done = self.gc_monitor.lock();
        *done = true;
        drop(done);
        self.gc_monitor.notify_all();
    }

    /// Wait for one collection cycle to finish. Returns true if there was
    /// anything to wait for; callers wanting quiescence loop until false.
    pub fn gc(&self) -> bool {
        let mut result = false;
        let mut done = self.gc_monitor.lock();
        while self.operational.load(Ordering::Relaxed) && self.pending() {
            result = true;
            if *done {
                break;
            }
            self.stats.waits.fetch_add(1, Ordering::Relaxed);
            done.wait();
        }
        *done = false;
        result
    }

    /// Whether reclamation work is queued or a collection pass is running.
    pub fn pending(&self) -> bool {
        !self.reclaim.is_empty() || self.collector.load(Ordering::SeqCst) == CLAIMED
    }

    /// Objects currently holding at least one reference.
    pub fn live_objects(&self) -> isize {
        self.live_objects.load(Ordering::Relaxed)
    }

    pub(crate) fn count_object(&self, delta: isize) {
        if delta >= 0 {
            self.live_objects.fetch_add(delta, Ordering::Relaxed);
        } else {
            self.live_objects.fetch_sub(-delta, Ordering::Relaxed);
        }
    }

    pub fn counters(&self) -> SpaceCounters {
        SpaceCounters {
            adds: self.stats.adds.load(Ordering::Relaxed),
            deletes: self.stats.deletes.load(Ordering::Relaxed),
            collects: self.stats.collects.load(Ordering::Relaxed),
            passes: self.stats.passes.load(Ordering::Relaxed),
            redos: self.stats.redos.load(Ordering::Relaxed),
            posts: self.stats.posts.load(Ordering::Relaxed),
            waits: self.stats.waits.load(Ordering::Relaxed),
        }
    }

    pub fn debug(&self) {
        let c = self.counters();
        log::debug!(
            target: "gc",
            "space: adds({}) deletes({}) collects({}) passes({}) redos({}) posts({}) waits({}) live({})",
            c.adds, c.deletes, c.collects, c.passes, c.redos, c.posts, c.waits,
            self.live_objects()
        );
        self.pool.debug();
    }

    fn run(&'static self) {
        log::debug!(target: "gc", "collector thread running");
        loop {
            self.work.wait();
            if !self.operational.load(Ordering::Relaxed) {
                break;
            }
            self.collect();
        }
        log::debug!(target: "gc", "collector thread exiting");
    }
}
