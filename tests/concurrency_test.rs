//! Concurrency tests: two simulated CPUs driving one shared cache from real
//! threads. Objects must be conserved across any interleaving - never
//! handed to two owners, never lost.

use std::alloc::Layout;
use std::cell::Cell;
use std::collections::{BTreeMap, HashSet};
use std::ptr::NonNull;
use std::sync::{Arc, Barrier, Mutex};
use std::thread;

use slab_cache_allocator::{
    AcquireFlags, AllocResult, CacheFlags, CpuTopology, PageProvider, SlabAllocator, SlabConfig,
    PAGE_SIZE,
};

#[derive(Clone, Default)]
struct MockPages {
    live: Arc<Mutex<BTreeMap<usize, usize>>>,
}

impl MockPages {
    fn live_blocks(&self) -> usize {
        self.live.lock().unwrap().len()
    }
}

impl PageProvider for MockPages {
    fn acquire_pages(&self, order: usize, _flags: AcquireFlags) -> AllocResult<usize> {
        let layout = Layout::from_size_align(PAGE_SIZE << order, PAGE_SIZE).unwrap();
        let ptr = unsafe { std::alloc::alloc(layout) };
        assert!(!ptr.is_null(), "host allocation failed");
        self.live.lock().unwrap().insert(ptr as usize, order);
        Ok(ptr as usize)
    }

    fn release_pages(&self, addr: usize, order: usize) {
        let stored = self.live.lock().unwrap().remove(&addr);
        assert_eq!(stored, Some(order));
        let layout = Layout::from_size_align(PAGE_SIZE << order, PAGE_SIZE).unwrap();
        unsafe { std::alloc::dealloc(addr as *mut u8, layout) };
    }
}

thread_local! {
    static CPU_ID: Cell<usize> = const { Cell::new(0) };
}

/// Two logical CPUs; each worker thread pins itself to one. The rendezvous
/// degrades to a serial sweep, which the pocket locks make safe.
struct TwoCpus;

impl CpuTopology for TwoCpus {
    fn cpu_count(&self) -> usize {
        2
    }

    fn current_cpu(&self) -> usize {
        CPU_ID.with(|cpu| cpu.get())
    }

    fn run_on_all_cpus(&self, f: &mut dyn FnMut(usize)) {
        for cpu in 0..2 {
            f(cpu);
        }
    }
}

fn obj_ptr(addr: usize) -> NonNull<u8> {
    NonNull::new(addr as *mut u8).unwrap()
}

#[test]
fn test_parallel_holders_get_disjoint_objects() {
    let pages = MockPages::default();
    let probe = pages.clone();
    let allocator = Arc::new(SlabAllocator::new(pages, TwoCpus, SlabConfig::default()));
    let cache = allocator
        .create_cache("disjoint-128", 128, 0, CacheFlags::empty(), None, None)
        .unwrap();

    let barrier = Arc::new(Barrier::new(3));
    let (tx, rx) = std::sync::mpsc::channel::<Vec<usize>>();

    let mut workers = Vec::new();
    for cpu in 0..2 {
        let allocator = allocator.clone();
        let cache = cache.clone();
        let barrier = barrier.clone();
        let tx = tx.clone();
        workers.push(thread::spawn(move || {
            CPU_ID.with(|id| id.set(cpu));
            let held: Vec<usize> = (0..500)
                .map(|_| allocator.alloc(&cache, true).unwrap().as_ptr() as usize)
                .collect();
            tx.send(held.clone()).unwrap();
            // hold everything until the main thread has checked overlap
            barrier.wait();
            for addr in held {
                allocator.cache_free(&cache, obj_ptr(addr));
            }
        }));
    }
    drop(tx);

    let first = rx.recv().unwrap();
    let second = rx.recv().unwrap();
    assert_eq!(first.len(), 500);
    assert_eq!(second.len(), 500);
    let unique: HashSet<usize> = first.iter().chain(second.iter()).copied().collect();
    assert_eq!(unique.len(), 1000, "an object was handed to two owners");

    barrier.wait();
    for worker in workers {
        worker.join().unwrap();
    }

    assert!(allocator.shrink(&cache));
    assert_eq!(probe.live_blocks(), 0);
}

#[test]
fn test_parallel_churn_conserves_objects() {
    let pages = MockPages::default();
    let probe = pages.clone();
    let allocator = Arc::new(SlabAllocator::new(pages, TwoCpus, SlabConfig::default()));
    let cache = allocator
        .create_cache("churn-64", 64, 0, CacheFlags::empty(), None, None)
        .unwrap();

    let mut workers = Vec::new();
    for cpu in 0..2 {
        let allocator = allocator.clone();
        let cache = cache.clone();
        workers.push(thread::spawn(move || {
            CPU_ID.with(|id| id.set(cpu));
            let mut held: Vec<usize> = Vec::new();
            for round in 0..3000usize {
                if round % 7 < 4 || held.is_empty() {
                    held.push(allocator.alloc(&cache, true).unwrap().as_ptr() as usize);
                } else {
                    let addr = held.swap_remove(round % held.len());
                    allocator.cache_free(&cache, obj_ptr(addr));
                }
                if round % 611 == 0 {
                    // objects written on one CPU stay valid wherever freed
                    if let Some(&addr) = held.last() {
                        unsafe { std::ptr::write_bytes(addr as *mut u8, cpu as u8, 64) };
                    }
                }
            }
            for addr in held {
                allocator.cache_free(&cache, obj_ptr(addr));
            }
        }));
    }
    for worker in workers {
        worker.join().unwrap();
    }

    // every object came back: the cache drains to empty and the page
    // provider balance closes
    assert!(allocator.shrink(&cache));
    assert_eq!(probe.live_blocks(), 0);
}

#[test]
fn test_reap_races_with_churn() {
    let pages = MockPages::default();
    let allocator = Arc::new(SlabAllocator::new(pages, TwoCpus, SlabConfig::default()));
    let cache = allocator
        .create_cache("reap-race-64", 64, 0, CacheFlags::empty(), None, None)
        .unwrap();

    let worker = {
        let allocator = allocator.clone();
        let cache = cache.clone();
        thread::spawn(move || {
            CPU_ID.with(|id| id.set(1));
            for _ in 0..200 {
                let objs: Vec<usize> = (0..100)
                    .map(|_| allocator.alloc(&cache, true).unwrap().as_ptr() as usize)
                    .collect();
                for addr in objs {
                    allocator.cache_free(&cache, obj_ptr(addr));
                }
            }
        })
    };

    CPU_ID.with(|id| id.set(0));
    for _ in 0..50 {
        // both the blocking and the opportunistic flavours must stay safe
        let _ = allocator.reap(true);
        let _ = allocator.reap(false);
    }
    worker.join().unwrap();

    assert!(allocator.shrink(&cache));
}
