//! Flag sets for cache creation, page acquisition and constructor calls.

use core::ptr::NonNull;

use bitflags::bitflags;

bitflags! {
    /// Cache creation flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CacheFlags: u32 {
        /// Align the objects in this cache to a hardware cache line.
        const HWCACHE_ALIGN = 1 << 0;
        /// Don't automatically reap this cache under memory pressure.
        const NO_REAP = 1 << 1;
        /// Back this cache with DMA-capable pages.
        const DMA = 1 << 2;
        /// Fill free objects with a known test pattern to catch references
        /// to freed memory. Only honoured with the `debug-checks` feature.
        const POISON = 1 << 3;
        /// Place sentinel words around each object to catch buffer overruns
        /// and double frees. Only honoured with the `debug-checks` feature.
        const RED_ZONE = 1 << 4;
        /// Re-run the constructor in verify mode on every free so it can
        /// check the object's state. Requires a constructor; only honoured
        /// with the `debug-checks` feature.
        const DEBUG_INITIAL = 1 << 5;
    }
}

bitflags! {
    /// Flags passed down to the page provider.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AcquireFlags: u32 {
        /// The caller may sleep until pages become available.
        const BLOCKING = 1 << 0;
        /// The pages must be DMA-capable.
        const DMA = 1 << 1;
    }
}

bitflags! {
    /// Flags passed to an object constructor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CtorFlags: u32 {
        /// The object is being constructed.
        const CONSTRUCTOR = 1 << 0;
        /// The constructor must not sleep.
        const ATOMIC = 1 << 1;
        /// The object is being freed; verify its state instead of
        /// initializing it.
        const VERIFY = 1 << 2;
    }
}

/// Object constructor, run when a slab is grown (and again in verify mode
/// on free for [`CacheFlags::DEBUG_INITIAL`] caches).
///
/// Constructors are not allowed to allocate from the cache they construct
/// for; doing so is a fatal usage error.
pub type ObjectCtor = fn(NonNull<u8>, CtorFlags);

/// Object destructor, run before a slab's pages are handed back.
pub type ObjectDtor = fn(NonNull<u8>);
