//! Object cache descriptors and slab geometry.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::AtomicUsize;
#[cfg(feature = "tracking")]
use core::sync::atomic::Ordering;

use kspin::SpinNoIrq;

use crate::flags::{CacheFlags, ObjectCtor, ObjectDtor};
use crate::list::SlabList;
use crate::percpu::CpuCache;
use crate::slab::{Bufctl, SlabMgmt};
#[cfg(feature = "debug-checks")]
use crate::BYTES_PER_WORD;
use crate::{align_up, CACHE_LINE_SIZE, MAX_SLAB_ORDER, PAGE_SIZE};

/// Stable index of a cache in the registry arena.
pub(crate) type CacheId = usize;

/// Where a cache keeps its slab management structures.
pub(crate) enum MgmtPlacement {
    /// Carved from the head of each slab's own page block.
    OnSlab,
    /// Allocated from a smaller general cache, so large-object slabs are
    /// not wasted on metadata.
    OffSlab(Arc<ObjectCache>),
}

/// One object size class: geometry, hooks, slab lists and per-CPU pockets.
pub struct ObjectCache {
    pub(crate) id: CacheId,
    pub(crate) name: &'static str,
    /// Padded object size, including redzone words when enabled.
    pub(crate) obj_size: usize,
    /// Pages per slab, as 2^order.
    pub(crate) order: usize,
    /// Objects per slab.
    pub(crate) num: usize,
    pub(crate) flags: CacheFlags,
    /// Number of distinct color offsets; 0 when the slab has no slack.
    pub(crate) color_range: usize,
    /// Step between successive color offsets.
    pub(crate) color_step: usize,
    pub(crate) mgmt: MgmtPlacement,
    /// Bytes occupied by an on-slab management structure (0 off-slab).
    pub(crate) mgmt_size: usize,
    pub(crate) ctor: Option<ObjectCtor>,
    pub(crate) dtor: Option<ObjectDtor>,
    /// CPU currently running this cache's constructors, or `usize::MAX`.
    /// An allocation from that CPU hitting the slow path means a
    /// constructor reentered its own cache.
    pub(crate) growing_cpu: AtomicUsize,
    pub(crate) inner: SpinNoIrq<CacheInner>,
    pub(crate) pockets: Vec<SpinNoIrq<CpuCache>>,
    #[cfg(feature = "tracking")]
    pub(crate) alloc_hit: AtomicUsize,
    #[cfg(feature = "tracking")]
    pub(crate) alloc_miss: AtomicUsize,
    #[cfg(feature = "tracking")]
    pub(crate) free_hit: AtomicUsize,
    #[cfg(feature = "tracking")]
    pub(crate) free_miss: AtomicUsize,
}

impl ObjectCache {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Usable object size, net of any redzone padding.
    pub fn object_size(&self) -> usize {
        self.obj_size - 2 * self.redzone_shift()
    }

    pub fn objects_per_slab(&self) -> usize {
        self.num
    }

    pub fn pages_per_slab(&self) -> usize {
        1 << self.order
    }

    pub fn flags(&self) -> CacheFlags {
        self.flags
    }

    /// Whether slab management lives outside the slab's own pages.
    pub fn is_off_slab(&self) -> bool {
        matches!(self.mgmt, MgmtPlacement::OffSlab(_))
    }

    /// Offset of the caller-visible payload within the padded object.
    #[cfg(feature = "debug-checks")]
    pub(crate) fn redzone_shift(&self) -> usize {
        if self.flags.contains(CacheFlags::RED_ZONE) {
            BYTES_PER_WORD
        } else {
            0
        }
    }

    #[cfg(not(feature = "debug-checks"))]
    pub(crate) fn redzone_shift(&self) -> usize {
        0
    }

    #[cfg(feature = "tracking")]
    pub(crate) fn count_alloc(&self, hit: bool) {
        if hit {
            self.alloc_hit.fetch_add(1, Ordering::Relaxed);
        } else {
            self.alloc_miss.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[cfg(feature = "tracking")]
    pub(crate) fn count_free(&self, hit: bool) {
        if hit {
            self.free_hit.fetch_add(1, Ordering::Relaxed);
        } else {
            self.free_miss.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// The non-constant members of a cache, protected by the cache spinlock.
pub(crate) struct CacheInner {
    pub(crate) full: SlabList,
    pub(crate) partial: SlabList,
    pub(crate) free: SlabList,
    /// Color offset for the next grown slab, round-robin over the range.
    pub(crate) color_next: usize,
    /// Cache-level pocket tunables; each pocket carries its own copy.
    pub(crate) limit: usize,
    pub(crate) batchcount: usize,
    #[cfg(feature = "tracking")]
    pub(crate) stats: CacheStats,
}

impl CacheInner {
    pub(crate) fn new(limit: usize, batchcount: usize) -> Self {
        Self {
            full: SlabList::new(),
            partial: SlabList::new(),
            free: SlabList::new(),
            color_next: 0,
            limit,
            batchcount,
            #[cfg(feature = "tracking")]
            stats: CacheStats::default(),
        }
    }
}

#[cfg(feature = "tracking")]
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct CacheStats {
    pub(crate) num_active: usize,
    pub(crate) num_allocations: usize,
    pub(crate) high_mark: usize,
    pub(crate) grown: usize,
    pub(crate) reaped: usize,
    pub(crate) errors: usize,
}

/// Slab geometry chosen for a cache at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Geometry {
    pub(crate) order: usize,
    pub(crate) num: usize,
    pub(crate) off_slab: bool,
    /// Size of the management allocation (aligned; 0 only if `num` is 0).
    pub(crate) mgmt_size: usize,
    /// Slack bytes usable as coloring range.
    pub(crate) left_over: usize,
}

/// Count the objects and the wasted bytes for a given slab order. With
/// on-slab management, the header and one bufctl per object share the slab.
pub(crate) fn slab_estimate(order: usize, obj_size: usize, on_slab: bool) -> (usize, usize) {
    let total = PAGE_SIZE << order;
    let (base, extra) = if on_slab {
        (
            core::mem::size_of::<SlabMgmt>(),
            core::mem::size_of::<Bufctl>(),
        )
    } else {
        (0, 0)
    };

    let mut num = 0;
    while (num + 1) * obj_size + align_up(base + (num + 1) * extra, CACHE_LINE_SIZE) <= total {
        num += 1;
    }

    let mgmt = align_up(base + num * extra, CACHE_LINE_SIZE);
    (num, total - num * obj_size - mgmt)
}

/// Pick the slab order for an object size.
///
/// Starts at order 0 and goes up while no object fits or more than 1/8 of
/// the slab is wasted, bounded by `break_order` and the absolute order
/// ceiling. Off-slab caches are additionally capped at `offslab_limit`
/// objects per slab; exceeding it steps one order back down. If the final
/// leftover can hold the management structure after all, management moves
/// back on-slab, saving the separate allocation at the cost of coloring
/// range.
pub(crate) fn compute_geometry(
    obj_size: usize,
    off_slab: bool,
    break_order: usize,
    offslab_limit: usize,
) -> Geometry {
    let mut off_slab = off_slab;
    let mut order = 0;
    let mut break_flag = false;
    let (mut num, mut left_over);

    loop {
        let (n, l) = slab_estimate(order, obj_size, !off_slab);
        num = n;
        left_over = l;
        if break_flag {
            break;
        }
        if order >= MAX_SLAB_ORDER {
            break;
        }
        if num == 0 {
            order += 1;
            continue;
        }
        if off_slab && num > offslab_limit && order > 0 {
            // This many objects would overrun the off-slab management
            // allocation; settle for one order less.
            order -= 1;
            break_flag = true;
            continue;
        }
        // Large slabs are hard on the page provider.
        if order >= break_order {
            break;
        }
        if left_over * 8 <= PAGE_SIZE << order {
            break; // acceptable internal fragmentation
        }
        order += 1;
    }

    let mgmt_size = SlabMgmt::aligned_size_for(num);
    if off_slab && left_over >= mgmt_size {
        off_slab = false;
        left_over -= mgmt_size;
    }

    Geometry {
        order,
        num,
        off_slab,
        mgmt_size,
        left_over,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_off_slab_packs_exactly() {
        // No management overhead: the whole slab is objects.
        assert_eq!(slab_estimate(0, 512, false), (8, 0));
        assert_eq!(slab_estimate(0, 4096, false), (1, 0));
        assert_eq!(slab_estimate(1, 4096, false), (2, 0));
    }

    #[test]
    fn test_estimate_on_slab_reserves_mgmt() {
        let header = core::mem::size_of::<SlabMgmt>();
        let bufctl = core::mem::size_of::<Bufctl>();
        let (num, left) = slab_estimate(0, 64, true);
        let mgmt = align_up(header + num * bufctl, CACHE_LINE_SIZE);
        assert!(num > 0);
        assert_eq!(num * 64 + mgmt + left, PAGE_SIZE);
        // one more object would not fit
        assert!((num + 1) * 64 + align_up(header + (num + 1) * bufctl, CACHE_LINE_SIZE) > PAGE_SIZE);
    }

    #[test]
    fn test_geometry_small_object_stays_order_zero() {
        let g = compute_geometry(64, false, 1, 0);
        assert_eq!(g.order, 0);
        assert!(!g.off_slab);
        assert!(g.num >= 48);
    }

    #[test]
    fn test_geometry_raises_order_until_object_fits() {
        let g = compute_geometry(PAGE_SIZE << 3, true, 1, 512);
        assert_eq!(g.order, 3);
        assert_eq!(g.num, 1);
        assert!(g.off_slab);
    }

    #[test]
    fn test_geometry_folds_mgmt_back_on_slab() {
        // 1/8 of the slab wasted off-slab leaves room for the management
        // structure, so it comes back on-slab.
        let obj = 4096 - 512;
        let g = compute_geometry(obj, true, 1, 512);
        assert_eq!(g.num, 1);
        assert!(!g.off_slab);
        assert!(g.left_over < 512);
    }

    #[test]
    fn test_geometry_honours_offslab_limit() {
        // 2112-byte objects waste more than 1/8 of every slab below the
        // break order, so the search climbs to order 2.
        let unlimited = compute_geometry(2112, true, 2, usize::MAX);
        assert_eq!(unlimited.order, 2);
        let capped = compute_geometry(2112, true, 2, unlimited.num - 1);
        assert!(capped.order < unlimited.order);
        assert!(capped.num < unlimited.num);
    }
}
