use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use rand::Rng;

use lazygc::{ObjectSpace, Ref, SpaceConfig};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct Probe {
    drops: Arc<AtomicUsize>,
}

impl Drop for Probe {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

fn quiesce(space: &'static ObjectSpace) {
    while space.gc() {}
}

#[test]
fn reference_lifecycle() {
    init_logging();
    let space = ObjectSpace::new(SpaceConfig::default());
    let drops = Arc::new(AtomicUsize::new(0));

    let object = space.alloc(Probe {
        drops: drops.clone(),
    });
    let first = Ref::new(object);
    assert_eq!(object.ref_count(), 1);
    assert_eq!(space.live_objects(), 1);

    let second = first.clone();
    assert_eq!(object.ref_count(), 2);

    drop(second);
    assert_eq!(object.ref_count(), 1);
    assert_eq!(drops.load(Ordering::SeqCst), 0);

    first.set(None);
    quiesce(space);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert_eq!(space.live_objects(), 0);
}

#[test]
fn replacing_slot_releases_old_object() {
    init_logging();
    let space = ObjectSpace::new(SpaceConfig::default());
    let drops = Arc::new(AtomicUsize::new(0));

    let slot = Ref::new(space.alloc(Probe {
        drops: drops.clone(),
    }));
    slot.set(Some(space.alloc(Probe {
        drops: drops.clone(),
    })));
    quiesce(space);
    assert_eq!(drops.load(Ordering::SeqCst), 1);

    // storing the same object back is a no-op
    let current = slot.get();
    slot.set(current);
    assert_eq!(drops.load(Ordering::SeqCst), 1);

    slot.set(None);
    quiesce(space);
    assert_eq!(drops.load(Ordering::SeqCst), 2);
}

struct Node {
    next: Ref<Node>,
    drops: Arc<AtomicUsize>,
}

impl Drop for Node {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn chain_release_collects_recursively() {
    init_logging();
    let space = ObjectSpace::new(SpaceConfig::default());
    let drops = Arc::new(AtomicUsize::new(0));
    let depth = 500;

    let head: Ref<Node> = Ref::null();
    for _ in 0..depth {
        let node = space.alloc(Node {
            next: Ref::null(),
            drops: drops.clone(),
        });
        node.next.set(head.get());
        head.set(Some(node));
    }
    assert_eq!(space.live_objects(), depth as isize);

    // dropping the head unravels the whole chain through the collector
    head.set(None);
    quiesce(space);
    assert_eq!(drops.load(Ordering::SeqCst), depth);
    assert_eq!(space.live_objects(), 0);
}

#[test]
fn concurrent_churn_destroys_everything_once() {
    init_logging();
    let space = ObjectSpace::new(SpaceConfig::default());
    let drops = Arc::new(AtomicUsize::new(0));
    let allocs = Arc::new(AtomicUsize::new(0));

    let slots: Arc<Vec<Ref<Probe>>> = Arc::new((0..16).map(|_| Ref::null()).collect());

    let mut handles = Vec::new();
    for _ in 0..4 {
        let slots = slots.clone();
        let drops = drops.clone();
        let allocs = allocs.clone();
        handles.push(thread::spawn(move || {
            let mut rng = rand::thread_rng();
            for _ in 0..2000 {
                let slot = &slots[rng.gen_range(0..slots.len())];
                if rng.gen_bool(0.7) {
                    allocs.fetch_add(1, Ordering::SeqCst);
                    slot.set(Some(space.alloc(Probe {
                        drops: drops.clone(),
                    })));
                } else {
                    slot.set(None);
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    for slot in slots.iter() {
        slot.set(None);
    }
    quiesce(space);

    assert_eq!(drops.load(Ordering::SeqCst), allocs.load(Ordering::SeqCst));
    assert_eq!(space.live_objects(), 0);
    space.debug();
}

#[test]
fn release_storm_with_tight_pool() {
    init_logging();
    // small pool so release traffic spills into extension pages and the
    // backpressure stall
    let space = ObjectSpace::new(SpaceConfig {
        reserved_links: 32,
        links_per_page: 32,
        backpressure_pages: 1,
    });
    let drops = Arc::new(AtomicUsize::new(0));
    let total = 4 * 5000;

    let mut handles = Vec::new();
    for _ in 0..4 {
        let drops = drops.clone();
        handles.push(thread::spawn(move || {
            for _ in 0..5000 {
                let slot = Ref::new(space.alloc(Probe {
                    drops: drops.clone(),
                }));
                slot.set(None);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    quiesce(space);
    assert_eq!(drops.load(Ordering::SeqCst), total);

    let counters = space.counters();
    assert_eq!(counters.adds, total);
    assert_eq!(counters.deletes, total);
    assert!(counters.collects > 0);
}

#[test]
fn global_space_allocates() {
    init_logging();
    let drops = Arc::new(AtomicUsize::new(0));
    let slot = Ref::new(lazygc::space().alloc(Probe {
        drops: drops.clone(),
    }));
    slot.set(None);
    quiesce(lazygc::space());
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn gc_is_quiet_when_idle() {
    init_logging();
    let space = ObjectSpace::new(SpaceConfig::default());
    assert!(!space.gc());
    assert!(!space.pending());

    let slot = Ref::new(space.alloc(Probe {
        drops: Arc::new(AtomicUsize::new(0)),
    }));
    // a live object is not pending work
    assert!(!space.pending());
    slot.set(None);
    quiesce(space);
    assert!(!space.pending());
}
