//! Cancellable delayed completions.
//!
//! One service thread owns a deadline-sorted map. Requests and cancels
//! arrive over an atomic FIFO so callers never contend on the map itself;
//! tokens are serial numbers, so a stale cancel can never hit a recycled
//! entry.

use std::collections::{BTreeMap, HashMap};
use std::ptr::null_mut;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::dispatch::queue::{AuList, QueueLink};
use crate::dispatch::task::{Item, CC_NORMAL, CC_PURGE};
use crate::sync::semaphore::Semaphore;

/// Upper bound on one service-thread sleep.
const MAX_WAIT: Duration = Duration::from_secs(60);

/// Handle for cancelling a pending delay.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Token(u64);

impl Token {
    /// Token that never matches a pending delay; cancelling it is a no-op.
    pub const NONE: Token = Token(0);
}

/// Pending request: a delayed item, or with `item` empty a cancel command
/// for the delay identified by `id`.
struct TimerLink {
    link: AtomicPtr<TimerLink>,
    id: u64,
    at: Instant,
    item: Option<Box<Item>>,
}

impl QueueLink for TimerLink {
    fn link_ptr(&self) -> &AtomicPtr<TimerLink> {
        &self.link
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum TimerFsm {
    Start,
    Ready,
    Close,
    Reset,
}

struct TimerInner {
    event: Semaphore,
    pend: AuList<TimerLink>,
    fsm: Mutex<TimerFsm>,
    next_id: AtomicU64,
}

pub(crate) struct Timers {
    inner: Arc<TimerInner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Timers {
    pub(crate) fn new() -> Timers {
        let inner = Arc::new(TimerInner {
            event: Semaphore::new(),
            pend: AuList::new(),
            fsm: Mutex::new(TimerFsm::Start),
            next_id: AtomicU64::new(1),
        });

        let service = inner.clone();
        let spawned = thread::Builder::new()
            .name("lazygc-timer".into())
            .spawn(move || service.run());
        let handle = match spawned {
            Ok(handle) => handle,
            Err(_) => crate::fatal_error("timer thread spawn failure"),
        };

        Timers {
            inner,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Queue `item` to complete with `CC_NORMAL` after `delay`. After
    /// shutdown the item completes immediately with `CC_PURGE` and the
    /// returned token is [`Token::NONE`].
    pub(crate) fn delay(&self, delay: Duration, item: Box<Item>) -> Token {
        // the state lock spans the insert so a concurrent shutdown cannot
        // slip between the check and the queue push
        let fsm = self.inner.fsm.lock();
        if matches!(*fsm, TimerFsm::Close | TimerFsm::Reset) {
            drop(fsm);
            log::error!(target: "dispatch", "delay() after shutdown");
            item.post(CC_PURGE);
            return Token::NONE;
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let link = Box::into_raw(Box::new(TimerLink {
            link: AtomicPtr::new(null_mut()),
            id,
            at: Instant::now() + delay,
            item: Some(item),
        }));
        unsafe {
            self.inner.pend.fifo(link);
        }
        self.inner.event.post();
        drop(fsm);
        Token(id)
    }

    /// Cancel a pending delay. The delayed item completes with `CC_PURGE`
    /// on the service thread. Cancelling a token that already fired, was
    /// already cancelled, or is [`Token::NONE`] does nothing.
    pub(crate) fn cancel(&self, token: Token) {
        if token == Token::NONE {
            return;
        }
        let fsm = self.inner.fsm.lock();
        if matches!(*fsm, TimerFsm::Close | TimerFsm::Reset) {
            return;
        }
        let link = Box::into_raw(Box::new(TimerLink {
            link: AtomicPtr::new(null_mut()),
            id: token.0,
            at: Instant::now(),
            item: None,
        }));
        unsafe {
            self.inner.pend.fifo(link);
        }
        self.inner.event.post();
        drop(fsm);
    }

    /// Begin shutdown: stop accepting delays and wake the service thread to
    /// purge everything pending.
    pub(crate) fn notify(&self) {
        let mut fsm = self.inner.fsm.lock();
        if matches!(*fsm, TimerFsm::Ready | TimerFsm::Start) {
            *fsm = TimerFsm::Close;
        }
        drop(fsm);
        self.inner.event.post();
    }

    pub(crate) fn join(&self) {
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl TimerInner {
    /// Detach the request FIFO, oldest first.
    fn take_pend(&self) -> Vec<Box<TimerLink>> {
        let mut chain = self.pend.reset();
        let mut links = Vec::new();
        unsafe {
            while !chain.is_null() {
                let next = (*chain).link.load(Ordering::Relaxed);
                links.push(Box::from_raw(chain));
                chain = next;
            }
        }
        links.reverse();
        links
    }

    fn run(self: Arc<Self>) {
        {
            let mut fsm = self.fsm.lock();
            if *fsm != TimerFsm::Start {
                crate::fatal_error("timer state corrupt at startup");
            }
            *fsm = TimerFsm::Ready;
        }
        log::debug!(target: "dispatch", "timer thread running");

        let mut queue: BTreeMap<(Instant, u64), Box<Item>> = BTreeMap::new();
        let mut index: HashMap<u64, Instant> = HashMap::new();

        loop {
            for mut link in self.take_pend() {
                match link.item.take() {
                    Some(item) => {
                        queue.insert((link.at, link.id), item);
                        index.insert(link.id, link.at);
                    }
                    None => {
                        // cancel; a miss means the delay already fired
                        if let Some(at) = index.remove(&link.id) {
                            if let Some(item) = queue.remove(&(at, link.id)) {
                                item.post(CC_PURGE);
                            }
                        }
                    }
                }
            }

            let mut now = Instant::now();
            loop {
                let due = match queue.iter().next() {
                    Some((&key, _)) if key.0 <= now => key,
                    _ => break,
                };
                if let Some(item) = queue.remove(&due) {
                    index.remove(&due.1);
                    item.post(CC_NORMAL);
                }
                now = Instant::now();
            }

            if *self.fsm.lock() != TimerFsm::Ready {
                break;
            }

            let sleep = queue
                .keys()
                .next()
                .map(|&(at, _)| at.saturating_duration_since(now))
                .unwrap_or(MAX_WAIT)
                .min(MAX_WAIT);
            self.event.wait_for(sleep);
        }

        *self.fsm.lock() = TimerFsm::Reset;
        let purged = queue.len();
        for (_, item) in std::mem::take(&mut queue) {
            item.post(CC_PURGE);
        }
        for mut link in self.take_pend() {
            if let Some(item) = link.item.take() {
                item.post(CC_PURGE);
            }
        }
        log::debug!(target: "dispatch", "timer thread exiting, {} purged", purged);
    }
}
