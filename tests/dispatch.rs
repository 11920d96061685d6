use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use lazygc::{
    Dispatch, DispatchConfig, Item, LambdaDone, Task, Token, Wait, CC_NORMAL, CC_PURGE, FC_RESET,
    FC_TRACE,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn recording_task(seen: &Arc<Mutex<Vec<i32>>>) -> Arc<Task> {
    let sink = seen.clone();
    Task::with_fn(move |mut item| {
        if let Some(data) = item.take_data() {
            if let Ok(tag) = data.downcast::<i32>() {
                sink.lock().push(*tag);
            }
        }
        item.post(CC_NORMAL);
    })
}

#[test]
fn items_run_serially_in_queue_order() {
    init_logging();
    let dispatch = Dispatch::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let task = recording_task(&seen);

    for tag in 1..=5 {
        dispatch.enqueue(&task, Item::with_data(0, Box::new(tag)));
    }
    let wait = Wait::new();
    dispatch.enqueue(&task, Item::with_done(0, Box::new(wait.clone())));
    assert_eq!(wait.wait(), CC_NORMAL);

    assert_eq!(*seen.lock(), vec![1, 2, 3, 4, 5]);
    dispatch.wait();
}

#[test]
fn wait_is_reusable_after_reset() {
    init_logging();
    let dispatch = Dispatch::new();
    let task = Task::with_fn(|item| item.post(CC_NORMAL));
    let wait = Wait::new();

    dispatch.enqueue(&task, Item::with_done(0, Box::new(wait.clone())));
    assert_eq!(wait.wait(), CC_NORMAL);

    // a stale completion is discarded by reset
    wait.post(42);
    wait.reset();
    dispatch.enqueue(&task, Item::with_done(0, Box::new(wait.clone())));
    assert_eq!(wait.wait(), CC_NORMAL);

    dispatch.wait();
}

#[test]
fn reset_item_purges_queued_work() {
    init_logging();
    let dispatch = Dispatch::new();

    let (gate_tx, gate_rx) = std::sync::mpsc::channel::<()>();
    let gate_rx = Mutex::new(gate_rx);
    let worked = Arc::new(AtomicUsize::new(0));
    let w = worked.clone();
    let task = Task::with_fn(move |item| {
        let _ = gate_rx.lock().recv();
        w.fetch_add(1, Ordering::SeqCst);
        item.post(CC_NORMAL);
    });

    // first item parks the worker at the gate so the rest stay queued
    dispatch.enqueue(&task, Item::new(0));

    let reset_wait = Wait::new();
    dispatch.enqueue(&task, Item::with_done(FC_RESET, Box::new(reset_wait.clone())));

    let purged = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        let p = purged.clone();
        dispatch.enqueue(
            &task,
            Item::with_done(
                0,
                LambdaDone::new(move |item| {
                    assert_eq!(item.cc(), CC_PURGE);
                    p.fetch_add(1, Ordering::SeqCst);
                }),
            ),
        );
    }

    gate_tx.send(()).unwrap();
    assert_eq!(reset_wait.wait(), CC_NORMAL);
    assert_eq!(worked.load(Ordering::SeqCst), 1);
    assert_eq!(purged.load(Ordering::SeqCst), 3);

    dispatch.wait();
}

#[test]
fn trace_item_completes_without_work() {
    init_logging();
    let dispatch = Dispatch::new();
    let worked = Arc::new(AtomicUsize::new(0));
    let w = worked.clone();
    let task = Task::with_fn(move |item| {
        w.fetch_add(1, Ordering::SeqCst);
        item.post(CC_NORMAL);
    });

    let wait = Wait::new();
    dispatch.enqueue(&task, Item::with_done(FC_TRACE, Box::new(wait.clone())));
    assert_eq!(wait.wait(), CC_NORMAL);
    assert_eq!(worked.load(Ordering::SeqCst), 0);

    dispatch.wait();
}

#[test]
fn task_never_drains_concurrently() {
    init_logging();
    let dispatch = Dispatch::with_config(DispatchConfig { max_workers: 4 });
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let a = active.clone();
    let p = peak.clone();
    let task = Task::with_fn(move |item| {
        let now = a.fetch_add(1, Ordering::SeqCst) + 1;
        p.fetch_max(now, Ordering::SeqCst);
        thread::sleep(Duration::from_micros(50));
        a.fetch_sub(1, Ordering::SeqCst);
        item.post(CC_NORMAL);
    });

    let mut handles = Vec::new();
    for _ in 0..8 {
        let dispatch = dispatch.clone();
        let task = task.clone();
        handles.push(thread::spawn(move || {
            for _ in 0..100 {
                dispatch.enqueue(&task, Item::new(0));
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    dispatch.wait();
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[test]
fn delay_fires_after_deadline() {
    init_logging();
    let dispatch = Dispatch::new();
    let wait = Wait::new();
    let start = Instant::now();
    let token = dispatch.delay(
        Duration::from_millis(50),
        Item::with_done(0, Box::new(wait.clone())),
    );
    assert_ne!(token, Token::NONE);
    assert_eq!(wait.wait(), CC_NORMAL);
    assert!(start.elapsed() >= Duration::from_millis(50));
    dispatch.wait();
}

#[test]
fn cancel_purges_pending_delay() {
    init_logging();
    let dispatch = Dispatch::new();
    let wait = Wait::new();
    let token = dispatch.delay(
        Duration::from_secs(10),
        Item::with_done(0, Box::new(wait.clone())),
    );

    let start = Instant::now();
    dispatch.cancel(token);
    assert_eq!(wait.wait(), CC_PURGE);
    assert!(start.elapsed() < Duration::from_secs(5));

    // cancelling again, or cancelling nothing, is harmless
    dispatch.cancel(token);
    dispatch.cancel(Token::NONE);
    dispatch.wait();
}

#[test]
fn cancel_after_fire_is_a_noop() {
    init_logging();
    let dispatch = Dispatch::new();
    let completions = Arc::new(Mutex::new(Vec::new()));
    let sink = completions.clone();
    let token = dispatch.delay(
        Duration::from_millis(10),
        Item::with_done(
            0,
            LambdaDone::new(move |item| sink.lock().push(item.cc())),
        ),
    );

    thread::sleep(Duration::from_millis(100));
    dispatch.cancel(token);
    thread::sleep(Duration::from_millis(50));

    assert_eq!(*completions.lock(), vec![CC_NORMAL]);
    dispatch.wait();
}

#[test]
fn shutdown_purges_pending_delays() {
    init_logging();
    let dispatch = Dispatch::new();
    let wait = Wait::new();
    dispatch.delay(
        Duration::from_secs(60),
        Item::with_done(0, Box::new(wait.clone())),
    );

    dispatch.wait();
    assert_eq!(wait.wait(), CC_PURGE);

    // a delay requested after shutdown purges immediately
    let late = Wait::new();
    let token = dispatch.delay(
        Duration::from_millis(1),
        Item::with_done(0, Box::new(late.clone())),
    );
    assert_eq!(token, Token::NONE);
    assert_eq!(late.wait(), CC_PURGE);
}

#[test]
fn enqueue_after_shutdown_drains_inline() {
    init_logging();
    let dispatch = Dispatch::new();
    let task = Task::with_fn(|item| item.post(CC_NORMAL));
    dispatch.wait();

    let wait = Wait::new();
    dispatch.enqueue(&task, Item::with_done(0, Box::new(wait.clone())));
    assert_eq!(wait.wait(), CC_NORMAL);
}

#[test]
fn shutdown_finishes_outstanding_work() {
    init_logging();
    let dispatch = Dispatch::new();
    let worked = Arc::new(AtomicUsize::new(0));
    let w = worked.clone();
    let task = Task::with_fn(move |item| {
        thread::sleep(Duration::from_millis(1));
        w.fetch_add(1, Ordering::SeqCst);
        item.post(CC_NORMAL);
    });

    for _ in 0..50 {
        dispatch.enqueue(&task, Item::new(0));
    }
    dispatch.wait();
    assert_eq!(worked.load(Ordering::SeqCst), 50);
}
