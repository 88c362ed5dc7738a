//! Shared sizing constants for the allocator and ring fabric.
//!
//! Values mirror the defaults a real netmap kernel module ships with
//! (`netmap_kern.h`'s `NETMAP_BUF_SIZE`, `NETMAP_BUF_MAX_NUM`, and the
//! cache-line / page-size rounding used by `netmap_mem2.c`).

/// Cache-line size objects are rounded up to.
pub const CACHE_LINE: usize = 64;

/// Hard ceiling on a single cluster's size.
pub const MAX_CLUSTSIZE: usize = 4 * 1024 * 1024;

/// Fallback page size if `sysconf` cannot be queried.
pub const PAGE_SIZE_DEFAULT: usize = 4096;

/// Default number of packet buffers a BUF pool is provisioned with absent
/// an explicit override (mirrors netmap's historical default buffer count).
pub const NETMAP_BUF_MAX_NUM: u32 = 4096;

/// Default per-buffer size used by [`crate::config::DomainConfig::default`].
pub const DEFAULT_BUF_OBJSIZE: u32 = 2048;

/// The two buffer indices that are permanently reserved as fake TX/RX
/// scratch buffers.
pub const RESERVED_BUF_INDICES: u32 = 2;

/// Default interface-name field width mirrored from netmap's `IFNAMSIZ`.
pub const IFNAMSIZ: usize = 16;

/// Query the runtime page size via `sysconf(_SC_PAGESIZE)`, falling back to
/// [`PAGE_SIZE_DEFAULT`] if the platform call fails.
pub fn page_size() -> usize {
    // SAFETY: sysconf with a well-known, non-allocating name is always sound to call.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 {
        sz as usize
    } else {
        PAGE_SIZE_DEFAULT
    }
}
