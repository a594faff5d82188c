//! Operator-facing cache listing.
//!
//! One line per cache: name, active and total objects, object size, active
//! and total slabs, pages per slab, then the pocket tunables. With the
//! `tracking` feature the line also carries the lifetime counters and the
//! pocket hit/miss figures.

use core::fmt;

/// Snapshot of one cache's occupancy, taken under its spinlock.
#[derive(Debug, Clone, Copy)]
pub struct CacheInfo {
    pub name: &'static str,
    pub active_objs: usize,
    pub total_objs: usize,
    pub obj_size: usize,
    pub active_slabs: usize,
    pub total_slabs: usize,
    pub pages_per_slab: usize,
    pub pocket_limit: usize,
    pub batchcount: usize,
    /// Running active-object counter; equals the walked `active_objs` at
    /// any quiescent point.
    #[cfg(feature = "tracking")]
    pub num_active: usize,
    #[cfg(feature = "tracking")]
    pub high_mark: usize,
    #[cfg(feature = "tracking")]
    pub num_allocations: usize,
    #[cfg(feature = "tracking")]
    pub grown: usize,
    #[cfg(feature = "tracking")]
    pub reaped: usize,
    #[cfg(feature = "tracking")]
    pub errors: usize,
    #[cfg(feature = "tracking")]
    pub alloc_hit: usize,
    #[cfg(feature = "tracking")]
    pub alloc_miss: usize,
    #[cfg(feature = "tracking")]
    pub free_hit: usize,
    #[cfg(feature = "tracking")]
    pub free_miss: usize,
}

pub(crate) fn render(infos: &[CacheInfo], w: &mut dyn fmt::Write) -> fmt::Result {
    write!(w, "slabinfo - version: 1.1")?;
    #[cfg(feature = "tracking")]
    write!(w, " (statistics)")?;
    writeln!(w)?;

    for info in infos {
        write!(
            w,
            "{:<17} {:6} {:6} {:6} {:4} {:4} {:4}",
            info.name,
            info.active_objs,
            info.total_objs,
            info.obj_size,
            info.active_slabs,
            info.total_slabs,
            info.pages_per_slab,
        )?;
        #[cfg(feature = "tracking")]
        write!(
            w,
            " : {:6} {:7} {:5} {:4} {:4}",
            info.high_mark, info.num_allocations, info.grown, info.reaped, info.errors,
        )?;
        write!(w, " : {:4} {:4}", info.pocket_limit, info.batchcount)?;
        #[cfg(feature = "tracking")]
        write!(
            w,
            " : {:6} {:6} {:6} {:6}",
            info.alloc_hit, info.alloc_miss, info.free_hit, info.free_miss,
        )?;
        writeln!(w)?;
    }
    Ok(())
}
