//! The allocator subsystem: cache lifecycle, the allocation and free paths,
//! batched pocket refill/flush, shrinking, destruction and reaping.
//!
//! Lock order, outermost first: registry lock, per-CPU pocket lock, cache
//! spinlock, page-owner table lock. The cache spinlock is dropped before
//! every page-provider call. Off-slab management frees chain into a strictly
//! smaller cache, so cross-cache holds cannot cycle.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use kspin::SpinNoIrq;

#[cfg(feature = "log")]
use log::{error, warn};

use crate::cache::{compute_geometry, CacheId, CacheInner, MgmtPlacement, ObjectCache};
use crate::flags::{AcquireFlags, CacheFlags, CtorFlags, ObjectCtor, ObjectDtor};
use crate::percpu::{default_pocket_limit, CpuCache};
use crate::registry::CacheRegistry;
use crate::report::{self, CacheInfo};
use crate::slab::{Bufctl, SlabMgmt, SlabView};
use crate::{
    align_down, align_up, AllocError, AllocResult, CpuTopology, PageProvider, SingleCpu,
    SlabConfig, BYTES_PER_WORD, CACHE_LINE_SIZE, MAX_OBJECT_SIZE, PAGE_SIZE,
};

/// How many registry entries one reap scan examines.
const REAP_SCANLEN: usize = 10;
/// A candidate worth this many pages ends the scan early.
const REAP_PERFECT: usize = 10;

/// The general caches backing arbitrary-size allocation.
const GENERAL_SIZES: &[(usize, &str)] = &[
    (32, "size-32"),
    (64, "size-64"),
    (96, "size-96"),
    (128, "size-128"),
    (192, "size-192"),
    (256, "size-256"),
    (512, "size-512"),
    (1024, "size-1024"),
    (2048, "size-2048"),
    (4096, "size-4096"),
    (8192, "size-8192"),
    (16384, "size-16384"),
    (32768, "size-32768"),
    (65536, "size-65536"),
    (131072, "size-131072"),
];

/// Reverse-lookup tag: which cache and slab a page belongs to. Stable for
/// as long as the page is attributed to the slab.
#[derive(Debug, Clone, Copy)]
struct PageOwner {
    cache: CacheId,
    slab: usize,
}

/// The allocator subsystem instance.
pub struct SlabAllocator<P: PageProvider, C: CpuTopology = SingleCpu> {
    pages: P,
    cpus: C,
    registry: SpinNoIrq<CacheRegistry>,
    page_owners: SpinNoIrq<BTreeMap<usize, PageOwner>>,
    general: Vec<(usize, Arc<ObjectCache>)>,
    break_order: usize,
    /// Max objects per slab for caches with off-slab management; bounded by
    /// the largest on-slab general cache the management fits into.
    offslab_limit: usize,
}

fn nonnull(addr: usize) -> NonNull<u8> {
    // SAFETY: object and management addresses come from the page provider
    // and are never 0.
    unsafe { NonNull::new_unchecked(addr as *mut u8) }
}

impl<P: PageProvider, C: CpuTopology> SlabAllocator<P, C> {
    /// Build the subsystem and its general size-class ladder.
    pub fn new(pages: P, cpus: C, config: SlabConfig) -> Self {
        let mut this = Self {
            pages,
            cpus,
            registry: SpinNoIrq::new(CacheRegistry::new()),
            page_owners: SpinNoIrq::new(BTreeMap::new()),
            general: Vec::new(),
            break_order: config.break_order,
            offslab_limit: 0,
        };
        // The general caches are cache-line aligned; this eliminates false
        // sharing between neighbouring allocations.
        for &(size, name) in GENERAL_SIZES {
            let cache =
                match this.create_cache(name, size, 0, CacheFlags::HWCACHE_ALIGN, None, None) {
                    Ok(cache) => cache,
                    Err(e) => panic!("slab: cannot create general cache '{}': {:?}", name, e),
                };
            // Raise the off-slab object ceiling until the threshold is hit.
            if !cache.is_off_slab() && size > core::mem::size_of::<SlabMgmt>() {
                this.offslab_limit = (size - core::mem::size_of::<SlabMgmt>())
                    / core::mem::size_of::<Bufctl>();
            }
            this.general.push((size, cache));
        }
        this
    }

    /// Create a cache.
    ///
    /// `name` must be unique and is used for duplicate detection and
    /// reporting. `size` is the object size in bytes; `align_offset` is the
    /// coloring step (0 picks the cache line size). The constructor is run
    /// when new slabs are grown, the destructor before slab pages are handed
    /// back. Fails if the parameters are invalid, the name is taken, or no
    /// slab order fits at least one object.
    pub fn create_cache(
        &self,
        name: &'static str,
        size: usize,
        align_offset: usize,
        flags: CacheFlags,
        ctor: Option<ObjectCtor>,
        dtor: Option<ObjectDtor>,
    ) -> AllocResult<Arc<ObjectCache>> {
        if name.is_empty()
            || size < BYTES_PER_WORD
            || size > MAX_OBJECT_SIZE
            || align_offset > size
            || (dtor.is_some() && ctor.is_none())
        {
            return Err(AllocError::InvalidParam);
        }

        let mut flags = flags;
        #[cfg(not(feature = "debug-checks"))]
        {
            // The instrumentation flags are optional debugging aids, not
            // load-bearing; without the checks compiled in they are inert.
            flags.remove(CacheFlags::POISON | CacheFlags::RED_ZONE | CacheFlags::DEBUG_INITIAL);
        }
        #[cfg(feature = "debug-checks")]
        if flags.contains(CacheFlags::DEBUG_INITIAL) && ctor.is_none() {
            warn!("slab cache '{}': state check requested without constructor", name);
            flags.remove(CacheFlags::DEBUG_INITIAL);
        }

        // Word-sized objects keep redzones and on-slab bufctls aligned.
        if size & (BYTES_PER_WORD - 1) != 0 {
            warn!("slab cache '{}': forcing word alignment", name);
        }
        let mut size = align_up(size, BYTES_PER_WORD);

        #[cfg(feature = "debug-checks")]
        if flags.contains(CacheFlags::RED_ZONE) {
            // No point honouring cache alignment when the sentinel words
            // shift the payload anyway.
            flags.remove(CacheFlags::HWCACHE_ALIGN);
            size += 2 * BYTES_PER_WORD;
        }

        let mut align = BYTES_PER_WORD;
        if flags.contains(CacheFlags::HWCACHE_ALIGN) {
            align = CACHE_LINE_SIZE;
            // Small objects: pack at least two per cache line.
            while size < align / 2 {
                align /= 2;
            }
            size = align_up(size, align);
        }

        // Large objects: keep the management structure off-slab so the
        // object slab packs better.
        let off_slab_hint = size >= PAGE_SIZE >> 3;
        let geom = compute_geometry(size, off_slab_hint, self.break_order, self.offslab_limit);
        if geom.num == 0 {
            warn!("slab cache '{}': no usable slab geometry", name);
            return Err(AllocError::InvalidParam);
        }

        let mgmt = if geom.off_slab {
            match self.find_general_cache(geom.mgmt_size) {
                Some(cache) => MgmtPlacement::OffSlab(cache),
                None => return Err(AllocError::InvalidParam),
            }
        } else {
            MgmtPlacement::OnSlab
        };

        let mut color_step = align_up(align_offset, align);
        if color_step == 0 {
            color_step = CACHE_LINE_SIZE;
        }
        let color_range = geom.left_over / color_step;

        let limit = default_pocket_limit(size);
        let batchcount = (limit / 2).max(1);

        let mut registry = self.registry.lock();
        if registry.contains_name(name) {
            warn!("slab cache '{}': duplicate cache name", name);
            return Err(AllocError::DuplicateName);
        }
        let id = registry.next_id();
        let cache = Arc::new(ObjectCache {
            id,
            name,
            obj_size: size,
            order: geom.order,
            num: geom.num,
            flags,
            color_range,
            color_step,
            mgmt,
            mgmt_size: geom.mgmt_size,
            ctor,
            dtor,
            growing_cpu: AtomicUsize::new(usize::MAX),
            inner: SpinNoIrq::new(CacheInner::new(limit, batchcount)),
            pockets: (0..self.cpus.cpu_count())
                .map(|_| SpinNoIrq::new(CpuCache::new(limit, batchcount)))
                .collect(),
            #[cfg(feature = "tracking")]
            alloc_hit: AtomicUsize::new(0),
            #[cfg(feature = "tracking")]
            alloc_miss: AtomicUsize::new(0),
            #[cfg(feature = "tracking")]
            free_hit: AtomicUsize::new(0),
            #[cfg(feature = "tracking")]
            free_miss: AtomicUsize::new(0),
        });
        registry.install(id, cache.clone());
        Ok(cache)
    }

    /// Allocate an object from `cache`. With `blocking` the page provider
    /// may sleep when a new slab is needed; otherwise an empty cache fails
    /// with [`AllocError::NoMemory`] right away.
    pub fn alloc(&self, cache: &ObjectCache, blocking: bool) -> AllocResult<NonNull<u8>> {
        let mut flags = AcquireFlags::empty();
        if blocking {
            flags |= AcquireFlags::BLOCKING;
        }
        if cache.flags.contains(CacheFlags::DMA) {
            flags |= AcquireFlags::DMA;
        }
        let raw = self.alloc_raw(cache, flags)?;
        let user = self.debug_alloc_fixup(cache, raw, flags);
        Ok(nonnull(user))
    }

    /// Allocate `size` bytes from the general caches.
    pub fn alloc_bytes(&self, size: usize, blocking: bool) -> AllocResult<NonNull<u8>> {
        let cache = self.find_general_cache(size).ok_or(AllocError::InvalidParam)?;
        self.alloc(&cache, blocking)
    }

    /// Free an object back to the cache it was allocated from.
    pub fn cache_free(&self, cache: &ObjectCache, ptr: NonNull<u8>) {
        self.free_raw(cache, ptr.as_ptr() as usize);
    }

    /// Free an object, resolving its cache through the page-owner table.
    /// Freeing a pointer no slab tracks is a fatal usage error.
    pub fn free(&self, ptr: NonNull<u8>) {
        let addr = ptr.as_ptr() as usize;
        let page = align_down(addr, PAGE_SIZE);
        let owner = self.page_owners.lock().get(&page).copied();
        let Some(owner) = owner else {
            panic!("slab: free of untracked pointer {:#x}", addr);
        };
        let cache = self.registry.lock().get(owner.cache).cloned();
        let Some(cache) = cache else {
            panic!("slab: free of pointer {:#x} into a destroyed cache", addr);
        };
        self.free_raw(&cache, addr);
    }

    /// Free a general-cache allocation.
    pub fn free_bytes(&self, ptr: NonNull<u8>) {
        self.free(ptr);
    }

    /// The smallest general cache whose class covers `size`.
    pub fn find_general_cache(&self, size: usize) -> Option<Arc<ObjectCache>> {
        self.general
            .iter()
            .find(|(cs_size, _)| *cs_size >= size)
            .map(|(_, cache)| cache.clone())
    }

    /// Drain the pockets and release every fully free slab. Returns whether
    /// the cache ended up with no object outstanding.
    pub fn shrink(&self, cache: &ObjectCache) -> bool {
        self.shrink_cache(cache)
    }

    /// Destroy a cache. The cache must be fully drained: if objects are
    /// still outstanding the cache stays registered and usable and
    /// [`AllocError::CacheBusy`] is returned.
    pub fn destroy_cache(&self, cache: &Arc<ObjectCache>) -> AllocResult<()> {
        let removed = self.registry.lock().remove(cache.id);
        let Some(removed) = removed else {
            panic!("slab cache '{}': destroying an unregistered cache", cache.name);
        };
        debug_assert!(Arc::ptr_eq(&removed, cache));

        if !self.shrink_cache(cache) {
            error!("slab cache '{}': destroy with objects still in use", cache.name);
            self.registry.lock().restore(cache.id, removed);
            return Err(AllocError::CacheBusy);
        }
        Ok(())
    }

    /// Retune a cache's pocket geometry. The displaced objects of every CPU
    /// are pushed back to the slab lists through the rendezvous.
    pub fn tune(&self, cache: &ObjectCache, limit: usize, batchcount: usize) -> AllocResult<()> {
        if limit == 0 || batchcount == 0 || batchcount > limit {
            return Err(AllocError::InvalidParam);
        }
        {
            let mut inner = cache.inner.lock();
            inner.limit = limit;
            inner.batchcount = batchcount;
        }
        self.cpus.run_on_all_cpus(&mut |cpu| {
            let old = {
                let mut pocket = cache.pockets[cpu].lock();
                let old = pocket.take_all();
                pocket.set_params(limit, batchcount);
                old
            };
            self.free_block(cache, &old);
        });
        Ok(())
    }

    /// Reclaim memory under pressure: scan a bounded stretch of the
    /// registry from the rotating cursor, pick the cache with the most
    /// reclaimable pages and release half of its free slabs. Returns the
    /// number of pages given back; a fruitless scan returns 0.
    pub fn reap(&self, blocking: bool) -> usize {
        let mut registry = if blocking {
            self.registry.lock()
        } else {
            match self.registry.try_lock() {
                Some(guard) => guard,
                None => return 0,
            }
        };

        let candidates = registry.rotation(REAP_SCANLEN);
        let mut cursor_to = candidates.last().map(|(id, _)| *id);
        let mut best: Option<(Arc<ObjectCache>, usize)> = None;
        let mut best_pages = 0;

        for (id, cache) in &candidates {
            if cache.flags.contains(CacheFlags::NO_REAP) {
                continue;
            }
            // Give pocketed objects back so fully free slabs show up.
            for cpu in 0..self.cpus.cpu_count() {
                let objs = cache.pockets[cpu].lock().take_all();
                self.free_block(cache, &objs);
            }
            let full_free = cache.inner.lock().free.len();
            let mut pages = full_free << cache.order;
            // Avoid caches with constructors and multi-page slabs; they are
            // costly to regrow.
            if cache.ctor.is_some() {
                pages = (pages * 4 + 1) / 5;
            }
            if cache.order > 0 {
                pages = (pages * 4 + 1) / 5;
            }
            if pages > best_pages {
                best_pages = pages;
                best = Some((cache.clone(), full_free));
                if pages >= REAP_PERFECT {
                    cursor_to = Some(*id);
                    break;
                }
            }
        }

        if let Some(id) = cursor_to {
            registry.rotate_past(id);
        }
        let Some((cache, full_free)) = best else {
            return 0;
        };

        // Free only half of the free slabs.
        let target = (full_free + 1) / 2;
        let mut destroyed = 0;
        for _ in 0..target {
            let mgmt = {
                let mut inner = cache.inner.lock();
                match inner.free.pop_back() {
                    Some(mgmt) => {
                        #[cfg(feature = "tracking")]
                        {
                            inner.stats.reaped += 1;
                        }
                        mgmt
                    }
                    None => break,
                }
            };
            self.slab_destroy(&cache, mgmt);
            destroyed += 1;
        }
        destroyed << cache.order
    }

    /// Occupancy snapshot of every registered cache.
    pub fn cache_info(&self) -> Vec<CacheInfo> {
        let caches = self.registry.lock().all();
        let mut infos = Vec::with_capacity(caches.len());
        for cache in &caches {
            let inner = cache.inner.lock();
            let mut active_objs = inner.full.len() * cache.num;
            for view in inner.partial.iter() {
                debug_assert!(view.inuse() > 0 && view.inuse() < cache.num);
                active_objs += view.inuse();
            }
            #[cfg(feature = "debug-checks")]
            {
                for view in inner.full.iter() {
                    debug_assert_eq!(view.inuse(), cache.num);
                }
                for view in inner.free.iter() {
                    debug_assert_eq!(view.inuse(), 0);
                }
            }
            let active_slabs = inner.full.len() + inner.partial.len();
            let total_slabs = active_slabs + inner.free.len();
            infos.push(CacheInfo {
                name: cache.name,
                active_objs,
                total_objs: total_slabs * cache.num,
                obj_size: cache.object_size(),
                active_slabs,
                total_slabs,
                pages_per_slab: 1 << cache.order,
                pocket_limit: inner.limit,
                batchcount: inner.batchcount,
                #[cfg(feature = "tracking")]
                num_active: inner.stats.num_active,
                #[cfg(feature = "tracking")]
                high_mark: inner.stats.high_mark,
                #[cfg(feature = "tracking")]
                num_allocations: inner.stats.num_allocations,
                #[cfg(feature = "tracking")]
                grown: inner.stats.grown,
                #[cfg(feature = "tracking")]
                reaped: inner.stats.reaped,
                #[cfg(feature = "tracking")]
                errors: inner.stats.errors,
                #[cfg(feature = "tracking")]
                alloc_hit: cache.alloc_hit.load(Ordering::Relaxed),
                #[cfg(feature = "tracking")]
                alloc_miss: cache.alloc_miss.load(Ordering::Relaxed),
                #[cfg(feature = "tracking")]
                free_hit: cache.free_hit.load(Ordering::Relaxed),
                #[cfg(feature = "tracking")]
                free_miss: cache.free_miss.load(Ordering::Relaxed),
            });
        }
        infos
    }

    /// Render the cache listing.
    pub fn write_report(&self, w: &mut dyn core::fmt::Write) -> core::fmt::Result {
        report::render(&self.cache_info(), w)
    }

    fn alloc_raw(&self, cache: &ObjectCache, flags: AcquireFlags) -> AllocResult<usize> {
        let cpu = self.cpus.current_cpu();
        {
            let mut pocket = cache.pockets[cpu].lock();
            if let Some(raw) = pocket.pop() {
                #[cfg(feature = "tracking")]
                cache.count_alloc(true);
                return Ok(raw);
            }
        }
        #[cfg(feature = "tracking")]
        cache.count_alloc(false);

        // Constructors must not allocate from the cache they construct for.
        if cache.growing_cpu.load(Ordering::Relaxed) == cpu {
            panic!("slab cache '{}': constructor reentered its own cache", cache.name);
        }

        loop {
            {
                let mut pocket = cache.pockets[cpu].lock();
                self.refill_pocket(cache, &mut pocket);
                if let Some(raw) = pocket.pop() {
                    return Ok(raw);
                }
            }
            // Nothing in the lists either. Grow with every lock dropped so
            // the page provider may block, then retry the refill.
            if let Err(e) = self.cache_grow(cache, flags) {
                #[cfg(feature = "tracking")]
                {
                    cache.inner.lock().stats.errors += 1;
                }
                return Err(e);
            }
        }
    }

    /// Pull up to one batch of objects out of the slab lists into an empty
    /// pocket. Partial slabs are preferred so free ones stay reclaimable.
    fn refill_pocket(&self, cache: &ObjectCache, pocket: &mut CpuCache) {
        debug_assert_eq!(pocket.avail(), 0);
        let mut batch = pocket.batchcount();
        let mut inner = cache.inner.lock();

        while batch > 0 {
            let mgmt = match inner.partial.front().or_else(|| inner.free.front()) {
                Some(mgmt) => mgmt,
                None => break,
            };
            let mut view = SlabView::new(mgmt);
            #[cfg(feature = "debug-checks")]
            debug_assert_eq!(view.free_chain_len(cache.num), cache.num - view.inuse());

            let was_empty = view.is_empty();
            while batch > 0 {
                let Some(idx) = view.pop_free() else {
                    break;
                };
                pocket.push(view.obj_addr(idx, cache.obj_size));
                batch -= 1;
                #[cfg(feature = "tracking")]
                {
                    inner.stats.num_allocations += 1;
                    inner.stats.num_active += 1;
                    if inner.stats.num_active > inner.stats.high_mark {
                        inner.stats.high_mark = inner.stats.num_active;
                    }
                }
            }

            if was_empty {
                inner.free.remove(&mut view);
            } else {
                inner.partial.remove(&mut view);
            }
            if view.is_full() {
                inner.full.push_front(view);
            } else {
                inner.partial.push_front(view);
            }
        }
    }

    fn free_raw(&self, cache: &ObjectCache, user: usize) {
        let raw = self.debug_free_check(cache, user);
        let cpu = self.cpus.current_cpu();
        let mut pocket = cache.pockets[cpu].lock();
        if pocket.has_room() {
            #[cfg(feature = "tracking")]
            cache.count_free(true);
            pocket.push(raw);
            return;
        }
        #[cfg(feature = "tracking")]
        cache.count_free(false);
        // Flush the oldest batch back to the slab lists, then pocket the
        // object being freed.
        let batch = pocket.batchcount().min(pocket.avail());
        self.free_block(cache, &pocket.entries()[..batch]);
        pocket.discard_front(batch);
        pocket.push(raw);
    }

    /// Return objects to their slabs, moving each slab between the lists as
    /// its occupancy crosses the boundaries. A slab that becomes fully free
    /// is destroyed right away when another free slab already exists,
    /// bounding the free-slab count.
    fn free_block(&self, cache: &ObjectCache, objs: &[usize]) {
        if objs.is_empty() {
            return;
        }
        let mut doomed: Vec<usize> = Vec::new();
        {
            let mut inner = cache.inner.lock();
            for &raw in objs {
                let page = align_down(raw, PAGE_SIZE);
                let owner = self.page_owners.lock().get(&page).copied();
                let Some(owner) = owner else {
                    panic!("slab cache '{}': freeing untracked object {:#x}", cache.name, raw);
                };
                debug_assert_eq!(owner.cache, cache.id);
                let mut view = SlabView::new(owner.slab);
                let Some(idx) = view.obj_index(raw, cache.obj_size, cache.num) else {
                    panic!("slab cache '{}': {:#x} is not an object address", cache.name, raw);
                };
                if view.is_empty() {
                    panic!("slab cache '{}': double free of {:#x}", cache.name, raw);
                }

                if view.is_full() {
                    inner.full.remove(&mut view);
                } else {
                    inner.partial.remove(&mut view);
                }
                view.push_free(idx);
                #[cfg(feature = "tracking")]
                {
                    inner.stats.num_active -= 1;
                }

                if view.is_empty() {
                    if inner.free.is_empty() {
                        inner.free.push_front(view);
                    } else {
                        // Another free slab already exists; give this one
                        // back right away.
                        doomed.push(view.mgmt);
                    }
                } else {
                    // To the tail: maximum time for the remaining objects
                    // to be freed too.
                    inner.partial.push_back(view);
                }
            }
        }
        for mgmt in doomed {
            self.slab_destroy(cache, mgmt);
        }
    }

    /// Grow the cache by one slab. Runs without the cache spinlock held
    /// except for taking the color cursor and linking the finished slab.
    fn cache_grow(&self, cache: &ObjectCache, flags: AcquireFlags) -> AllocResult<()> {
        let color = {
            let mut inner = cache.inner.lock();
            let cur = inner.color_next;
            inner.color_next = cur + 1;
            if inner.color_next >= cache.color_range {
                inner.color_next = 0;
            }
            cur * cache.color_step
        };

        let pages = self.pages.acquire_pages(cache.order, flags)?;

        let (mgmt, objs) = match &cache.mgmt {
            MgmtPlacement::OffSlab(mgmt_cache) => match self.alloc_raw(mgmt_cache, flags) {
                Ok(mgmt) => (mgmt, pages + color),
                Err(e) => {
                    self.pages.release_pages(pages, cache.order);
                    return Err(e);
                }
            },
            MgmtPlacement::OnSlab => (pages + color, pages + color + cache.mgmt_size),
        };

        let mut view = SlabView::new(mgmt);
        view.init(pages, objs, cache.num);

        {
            let mut owners = self.page_owners.lock();
            for p in 0..(1usize << cache.order) {
                owners.insert(
                    pages + p * PAGE_SIZE,
                    PageOwner {
                        cache: cache.id,
                        slab: mgmt,
                    },
                );
            }
        }

        self.init_objects(cache, &view, flags);

        let mut inner = cache.inner.lock();
        inner.free.push_back(view);
        #[cfg(feature = "tracking")]
        {
            inner.stats.grown += 1;
        }
        Ok(())
    }

    /// Initialize every object slot of a fresh slab: instrumentation first,
    /// then the constructor. Constructors run without any lock held.
    fn init_objects(&self, cache: &ObjectCache, view: &SlabView, flags: AcquireFlags) {
        if cache.ctor.is_some() {
            cache
                .growing_cpu
                .store(self.cpus.current_cpu(), Ordering::Relaxed);
        }
        for i in 0..cache.num {
            let raw = view.obj_addr(i, cache.obj_size);
            #[cfg(feature = "debug-checks")]
            {
                use crate::slab::debug;
                if cache.flags.contains(CacheFlags::POISON) {
                    debug::poison_obj(
                        raw,
                        cache.obj_size,
                        cache.flags.contains(CacheFlags::RED_ZONE),
                    );
                }
                if cache.flags.contains(CacheFlags::RED_ZONE) {
                    debug::write_redzones(raw, cache.obj_size, debug::REDZONE_FREE);
                }
            }
            if let Some(ctor) = cache.ctor {
                // Poisoned objects are constructed at allocation time
                // instead; the pattern would wipe the constructed state.
                if !cache.flags.contains(CacheFlags::POISON) {
                    let mut cf = CtorFlags::CONSTRUCTOR;
                    if !flags.contains(AcquireFlags::BLOCKING) {
                        cf |= CtorFlags::ATOMIC;
                    }
                    ctor(nonnull(raw + cache.redzone_shift()), cf);
                }
            }
            #[cfg(feature = "debug-checks")]
            {
                use crate::slab::debug;
                if cache.flags.contains(CacheFlags::RED_ZONE)
                    && !debug::swap_redzones(
                        raw,
                        cache.obj_size,
                        debug::REDZONE_FREE,
                        debug::REDZONE_FREE,
                    )
                {
                    panic!(
                        "slab cache '{}': constructor wrote outside its object",
                        cache.name
                    );
                }
            }
        }
        if cache.ctor.is_some() {
            cache.growing_cpu.store(usize::MAX, Ordering::Relaxed);
        }
    }

    /// Destroy all the objects in a slab and release its memory. The slab
    /// must already be unlinked from the lists; no lock is held.
    fn slab_destroy(&self, cache: &ObjectCache, mgmt: usize) {
        let view = SlabView::new(mgmt);
        let pages = view.pages();

        for i in 0..cache.num {
            let raw = view.obj_addr(i, cache.obj_size);
            #[cfg(feature = "debug-checks")]
            {
                use crate::slab::debug;
                if cache.flags.contains(CacheFlags::POISON)
                    && !debug::check_poison(
                        raw,
                        cache.obj_size,
                        cache.flags.contains(CacheFlags::RED_ZONE),
                    )
                {
                    panic!(
                        "slab cache '{}': freed object {:#x} was modified",
                        cache.name, raw
                    );
                }
                if cache.flags.contains(CacheFlags::RED_ZONE)
                    && !debug::swap_redzones(
                        raw,
                        cache.obj_size,
                        debug::REDZONE_FREE,
                        debug::REDZONE_FREE,
                    )
                {
                    panic!(
                        "slab cache '{}': corrupt redzone in retiring slab at {:#x}",
                        cache.name, raw
                    );
                }
            }
            if let Some(dtor) = cache.dtor {
                // With poisoning the destructor already ran at free time.
                if !cache.flags.contains(CacheFlags::POISON) {
                    dtor(nonnull(raw + cache.redzone_shift()));
                }
            }
        }

        {
            let mut owners = self.page_owners.lock();
            for p in 0..(1usize << cache.order) {
                owners.remove(&(pages + p * PAGE_SIZE));
            }
        }
        self.pages.release_pages(pages, cache.order);

        if let MgmtPlacement::OffSlab(mgmt_cache) = &cache.mgmt {
            self.free_raw(mgmt_cache, mgmt);
        }
    }

    /// Flush every CPU's pocket through the rendezvous, each CPU returning
    /// its own objects, then release all fully free slabs.
    fn shrink_cache(&self, cache: &ObjectCache) -> bool {
        self.drain_pockets(cache);
        loop {
            let mgmt = { cache.inner.lock().free.pop_back() };
            match mgmt {
                Some(mgmt) => self.slab_destroy(cache, mgmt),
                None => break,
            }
        }
        let inner = cache.inner.lock();
        inner.full.is_empty() && inner.partial.is_empty()
    }

    fn drain_pockets(&self, cache: &ObjectCache) {
        self.cpus.run_on_all_cpus(&mut |cpu| {
            let objs = { cache.pockets[cpu].lock().take_all() };
            self.free_block(cache, &objs);
        });
    }

    /// Verify the object coming out of the allocation path and re-arm its
    /// instrumentation for the in-use state.
    #[cfg(feature = "debug-checks")]
    fn debug_alloc_fixup(&self, cache: &ObjectCache, raw: usize, flags: AcquireFlags) -> usize {
        use crate::slab::debug;
        if cache.flags.contains(CacheFlags::POISON)
            && !debug::check_poison(
                raw,
                cache.obj_size,
                cache.flags.contains(CacheFlags::RED_ZONE),
            )
        {
            panic!(
                "slab cache '{}': object {:#x} was written while free",
                cache.name, raw
            );
        }
        if cache.flags.contains(CacheFlags::RED_ZONE)
            && !debug::swap_redzones(
                raw,
                cache.obj_size,
                debug::REDZONE_FREE,
                debug::REDZONE_ALLOC,
            )
        {
            panic!(
                "slab cache '{}': corrupt redzone on allocation of {:#x}",
                cache.name, raw
            );
        }
        let user = raw + cache.redzone_shift();
        if cache.flags.contains(CacheFlags::POISON) {
            if let Some(ctor) = cache.ctor {
                let mut cf = CtorFlags::CONSTRUCTOR;
                if !flags.contains(AcquireFlags::BLOCKING) {
                    cf |= CtorFlags::ATOMIC;
                }
                ctor(nonnull(user), cf);
            }
        }
        user
    }

    #[cfg(not(feature = "debug-checks"))]
    fn debug_alloc_fixup(&self, _cache: &ObjectCache, raw: usize, _flags: AcquireFlags) -> usize {
        raw
    }

    /// Validate a pointer being freed: it must be an object of this cache,
    /// and its redzones must show it is currently allocated. Violations are
    /// fatal; the memory is already corrupt.
    #[cfg(feature = "debug-checks")]
    fn debug_free_check(&self, cache: &ObjectCache, user: usize) -> usize {
        use crate::slab::debug;
        let raw = user - cache.redzone_shift();
        let page = align_down(raw, PAGE_SIZE);
        let owner = self.page_owners.lock().get(&page).copied();
        let Some(owner) = owner else {
            panic!(
                "slab cache '{}': free of untracked pointer {:#x}",
                cache.name, user
            );
        };
        if owner.cache != cache.id {
            panic!(
                "slab cache '{}': {:#x} belongs to a different cache",
                cache.name, user
            );
        }
        let view = SlabView::new(owner.slab);
        if view.obj_index(raw, cache.obj_size, cache.num).is_none() {
            panic!(
                "slab cache '{}': {:#x} is not an object address",
                cache.name, user
            );
        }
        if cache.flags.contains(CacheFlags::RED_ZONE)
            && !debug::swap_redzones(
                raw,
                cache.obj_size,
                debug::REDZONE_ALLOC,
                debug::REDZONE_FREE,
            )
        {
            panic!(
                "slab cache '{}': double free or out-of-bounds write at {:#x}",
                cache.name, user
            );
        }
        if cache.flags.contains(CacheFlags::DEBUG_INITIAL) {
            if let Some(ctor) = cache.ctor {
                ctor(nonnull(user), CtorFlags::CONSTRUCTOR | CtorFlags::VERIFY);
            }
        }
        if cache.flags.contains(CacheFlags::POISON) {
            if let Some(dtor) = cache.dtor {
                dtor(nonnull(user));
            }
            debug::poison_obj(
                raw,
                cache.obj_size,
                cache.flags.contains(CacheFlags::RED_ZONE),
            );
        }
        raw
    }

    #[cfg(not(feature = "debug-checks"))]
    fn debug_free_check(&self, _cache: &ObjectCache, user: usize) -> usize {
        user
    }
}
