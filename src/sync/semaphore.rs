use std::time::{Duration, Instant};

use super::monitor::Monitor;

/// Counting semaphore. Drives the collector and dispatcher service threads.
pub struct Semaphore {
    count: Monitor<usize>,
}

impl Semaphore {
    pub const fn new() -> Self {
        Self {
            count: Monitor::new(0),
        }
    }

    pub fn post(&self) {
        let mut count = self.count.lock();
        *count += 1;
        drop(count);
        self.count.notify_one();
    }

    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            count.wait();
        }
        *count -= 1;
    }

    /// Wait with a timeout; returns false if the timeout elapsed without a
    /// post being consumed.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count == 0 {
            if count.wait_until(deadline) {
                return false;
            }
        }
        *count -= 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn post_then_wait() {
        let sem = Semaphore::new();
        sem.post();
        sem.post();
        sem.wait();
        assert!(sem.wait_for(Duration::from_millis(10)));
        assert!(!sem.wait_for(Duration::from_millis(10)));
    }

    #[test]
    fn wakes_waiter() {
        let sem = Arc::new(Semaphore::new());
        let sem2 = sem.clone();
        let handle = std::thread::spawn(move || sem2.wait());
        std::thread::sleep(Duration::from_millis(20));
        sem.post();
        handle.join().unwrap();
    }
}
