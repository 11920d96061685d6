//! Work dispatch engine: serial tasks, a cached worker pool, and
//! cancellable delayed completions.

pub mod queue;
pub mod task;

mod pool;
mod timer;

pub use task::{
    Done, Item, LambdaDone, Task, Wait, Worker, CC_ERROR, CC_ERROR_FC, CC_NORMAL, CC_PURGE,
    FC_CHASE, FC_RESET, FC_TRACE,
};
pub use timer::Token;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::dispatch::pool::Master;
use crate::dispatch::timer::Timers;

#[derive(Clone, Copy, Debug)]
pub struct DispatchConfig {
    /// Worker thread cap. Workers are spawned on demand and cached.
    pub max_workers: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_workers: num_cpus::get().max(1),
        }
    }
}

/// A dispatcher instance: one scheduler thread, one timer thread, and up to
/// `max_workers` cached worker threads.
///
/// Items queued on the same [`Task`] are worked serially in queue order;
/// distinct tasks run concurrently across the pool.
pub struct Dispatch {
    master: Master,
    timers: Timers,
    down: AtomicBool,
}

impl Dispatch {
    pub fn new() -> Arc<Dispatch> {
        Self::with_config(DispatchConfig::default())
    }

    pub fn with_config(config: DispatchConfig) -> Arc<Dispatch> {
        Arc::new(Self {
            master: Master::new(config.max_workers),
            timers: Timers::new(),
            down: AtomicBool::new(false),
        })
    }

    /// Queue `item` on `task`. If the task was idle it is handed to the
    /// scheduler; after shutdown the task is drained on the calling thread
    /// instead, so no item is ever silently dropped.
    pub fn enqueue(&self, task: &Arc<Task>, item: Box<Item>) {
        if task.push(item) {
            if self.down.load(Ordering::SeqCst) {
                log::warn!(target: "dispatch", "enqueue after shutdown, draining inline");
                task.drain();
            } else {
                self.master.schedule(task.clone());
            }
        }
    }

    /// Complete `item` with `CC_NORMAL` after `delay`, unless cancelled
    /// first. See [`Token`].
    pub fn delay(&self, delay: Duration, item: Box<Item>) -> Token {
        self.timers.delay(delay, item)
    }

    /// Cancel a pending delay; its item completes with `CC_PURGE`.
    pub fn cancel(&self, token: Token) {
        self.timers.cancel(token)
    }

    /// Shut down: purge pending delays, finish queued work, and join every
    /// service thread. Idempotent.
    pub fn wait(&self) {
        if self.down.swap(true, Ordering::SeqCst) {
            return;
        }
        log::debug!(target: "dispatch", "shutting down");
        self.timers.notify();
        self.timers.join();
        self.master.stop();
        self.debug();
        log::debug!(target: "dispatch", "shutdown complete");
    }

    pub fn debug(&self) {
        self.master.debug();
    }
}

impl Drop for Dispatch {
    fn drop(&mut self) {
        self.wait();
    }
}
