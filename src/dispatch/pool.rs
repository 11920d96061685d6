//! Scheduler thread and the cached worker pool behind it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;

use crate::dispatch::queue::AuList;
use crate::dispatch::task::Task;
use crate::sync::semaphore::Semaphore;

/// Owns the scheduler thread. Tasks that transition empty to non-empty are
/// queued here; the scheduler hands each to an idle worker, spawns a new
/// worker up to the configured cap, or holds the task until a worker frees
/// up.
pub(crate) struct Master {
    inner: Arc<MasterInner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct MasterInner {
    sem: Semaphore,
    stop: AtomicBool,
    sched: AuList<Task>,
    stopper: Task,
    idle: SegQueue<Arc<WorkerThread>>,
    workers: Mutex<Vec<Arc<WorkerThread>>>,
    count: AtomicUsize,
    max_workers: usize,
    scheduled: AtomicUsize,
}

impl Master {
    pub(crate) fn new(max_workers: usize) -> Master {
        let inner = Arc::new(MasterInner {
            sem: Semaphore::new(),
            stop: AtomicBool::new(false),
            sched: AuList::new(),
            stopper: Task::stopper(),
            idle: SegQueue::new(),
            workers: Mutex::new(Vec::new()),
            count: AtomicUsize::new(0),
            max_workers: max_workers.max(1),
            scheduled: AtomicUsize::new(0),
        });

        let service = inner.clone();
        let spawned = thread::Builder::new()
            .name("lazygc-dispatch".into())
            .spawn(move || service.run());
        let handle = match spawned {
            Ok(handle) => handle,
            Err(_) => crate::fatal_error("dispatch thread spawn failure"),
        };

        Master {
            inner,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Hand a non-empty task to the scheduler. The task's queue ownership
    /// travels as a raw Arc through the scheduling list.
    pub(crate) fn schedule(&self, task: Arc<Task>) {
        let raw = Arc::into_raw(task) as *mut Task;
        unsafe {
            self.inner.sched.fifo(raw);
        }
        self.inner.scheduled.fetch_add(1, Ordering::Relaxed);
        self.inner.sem.post();
    }

    pub(crate) fn debug(&self) {
        log::debug!(
            target: "dispatch",
            "master: schedules({}) workers({}/{})",
            self.inner.scheduled.load(Ordering::Relaxed),
            self.inner.count.load(Ordering::Relaxed),
            self.inner.max_workers
        );
    }

    /// Finish outstanding work and retire the scheduler and every worker.
    pub(crate) fn stop(&self) {
        self.inner.stop.store(true, Ordering::SeqCst);
        self.inner.sem.post();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl MasterInner {
    fn run(self: Arc<Self>) {
        log::debug!(target: "dispatch", "scheduler running, max {} workers", self.max_workers);
        let mut held: VecDeque<Arc<Task>> = VecDeque::new();
        loop {
            self.sem.wait();

            // tasks held back for want of a worker go first
            while let Some(task) = held.pop_front() {
                if let Some(task) = Self::place(&self, task) {
                    held.push_front(task);
                    break;
                }
            }
            unsafe {
                Self::cycle(&self, &mut held);
            }

            if self.stop.load(Ordering::SeqCst) && held.is_empty() && self.sched.is_empty() {
                break;
            }
        }
        self.stop_workers();
        log::debug!(target: "dispatch", "scheduler exiting");
    }

    /// Drain the scheduling list, oldest first, placing each task.
    unsafe fn cycle(this: &Arc<Self>, held: &mut VecDeque<Arc<Task>>) {
        if this.sched.is_empty() {
            return;
        }
        let stopper = &this.stopper as *const Task as *mut Task;
        this.sched.fifo(stopper);
        loop {
            let raw = this.sched.remq(stopper);
            if raw.is_null() {
                return;
            }
            if raw == stopper {
                this.sched.fifo(stopper);
                continue;
            }
            let task = Arc::from_raw(raw as *const Task);
            if let Some(task) = Self::place(this, task) {
                held.push_back(task);
            }
        }
    }

    /// Give `task` to a worker, spawning one if the pool has room. Returns
    /// the task back when every worker is busy and the pool is full.
    fn place(this: &Arc<Self>, task: Arc<Task>) -> Option<Arc<Task>> {
        if let Some(worker) = this.idle.pop() {
            worker.give(task);
            return None;
        }
        if this.count.load(Ordering::Relaxed) < this.max_workers {
            Self::spawn_worker(this, task);
            return None;
        }
        Some(task)
    }

    fn spawn_worker(this: &Arc<Self>, task: Arc<Task>) {
        let index = this.count.fetch_add(1, Ordering::Relaxed);
        let worker = Arc::new(WorkerThread {
            sem: Semaphore::new(),
            slot: Mutex::new(Some(task)),
            stop: AtomicBool::new(false),
            handle: Mutex::new(None),
        });
        worker.sem.post();

        let master = this.clone();
        let body = worker.clone();
        let spawned = thread::Builder::new()
            .name(format!("lazygc-worker-{}", index))
            .spawn(move || body.run(master));
        match spawned {
            Ok(handle) => {
                *worker.handle.lock() = Some(handle);
                this.workers.lock().push(worker);
                log::debug!(target: "dispatch", "worker {} spawned", index);
            }
            Err(_) => crate::fatal_error("worker thread spawn failure"),
        }
    }

    fn stop_workers(&self) {
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in &workers {
            worker.stop.store(true, Ordering::SeqCst);
            worker.sem.post();
        }
        for worker in workers {
            if let Some(handle) = worker.handle.lock().take() {
                let _ = handle.join();
            }
        }
        while self.idle.pop().is_some() {}
    }
}

/// A cached worker. Parks on its own semaphore between tasks; only the
/// scheduler fills the slot, and only while the worker sits on the idle
/// list.
struct WorkerThread {
    sem: Semaphore,
    slot: Mutex<Option<Arc<Task>>>,
    stop: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerThread {
    fn give(&self, task: Arc<Task>) {
        *self.slot.lock() = Some(task);
        self.sem.post();
    }

    fn run(self: Arc<Self>, master: Arc<MasterInner>) {
        loop {
            self.sem.wait();
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            let task = self.slot.lock().take();
            if let Some(task) = task {
                task.drain();
            }
            master.idle.push(self.clone());
            master.sem.post();
        }
    }
}
