//! The slab-style object pool.
//!
//! A [`Pool`] owns every object of one logical class (IF, RING, or BUF)
//! for a single [`crate::domain::MemoryDomain`]: a lookup table of
//! virtual/physical addresses, a free bitmap, and the physically
//! contiguous clusters the objects are carved from.

use std::fmt;

use log::{debug, warn};

use crate::consts::{page_size, CACHE_LINE, MAX_CLUSTSIZE, RESERVED_BUF_INDICES};
use crate::error::{Error, NmResult};

/// Which of the three pools in a domain this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    /// Pool backing `netmap_if` allocations.
    If,
    /// Pool backing `netmap_ring` allocations.
    Ring,
    /// Pool backing packet buffers.
    Buf,
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PoolKind::If => "if",
            PoolKind::Ring => "ring",
            PoolKind::Buf => "buf",
        };
        f.write_str(s)
    }
}

/// One object's lookup-table entry: its virtual and (simulated) physical address.
///
/// There is no real MMU in this model: `paddr` is
/// a deterministic per-cluster fake address, distinct across clusters,
/// that stands in for what `vtophys()` would return in the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LutEntry {
    /// Virtual address of the object, as an integer (kernel-side "pointer").
    pub vaddr: usize,
    /// Simulated physical address of the object.
    pub paddr: usize,
}

impl LutEntry {
    const NULL: LutEntry = LutEntry { vaddr: 0, paddr: 0 };
}

/// A physically contiguous, page-aligned allocation backing one cluster
/// of objects.
struct Cluster {
    ptr: *mut u8,
    len: usize,
    paddr_base: usize,
}

// SAFETY: the pool is always accessed behind a domain-owned mutex; the
// raw pointer is never aliased outside of that lock's critical section.
unsafe impl Send for Cluster {}

impl Drop for Cluster {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

/// Obtains the physically contiguous cluster backing, abstracted so tests
/// can inject allocation failure.
pub trait ClusterAllocator: Send + Sync {
    /// Attempt to obtain one cluster of `len` bytes, page-aligned.
    ///
    /// `cluster_index` is the 0-based index of the cluster within the
    /// current finalize attempt, and `paddr_base` is the fake physical
    /// base this cluster should report (see [`LutEntry`]).
    fn alloc_cluster(&self, cluster_index: usize, len: usize, paddr_base: usize) -> Option<()>;
}

/// Allocates clusters via anonymous, page-aligned `mmap` (the same
/// technique `xdpilone`'s `XskRing::map` uses for kernel-shared rings,
/// applied here to private, process-owned memory instead of a socket
/// mmap).
#[derive(Default)]
pub struct SystemClusterAllocator;

impl SystemClusterAllocator {
    fn mmap_cluster(len: usize) -> Option<*mut u8> {
        // SAFETY: standard anonymous mapping; length is non-zero and page-sized by construction.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            None
        } else {
            Some(ptr as *mut u8)
        }
    }
}

impl Pool {
    fn push_real_cluster(&mut self, len: usize, paddr_base: usize) -> bool {
        match SystemClusterAllocator::mmap_cluster(len) {
            Some(ptr) => {
                self.clusters.push(Cluster {
                    ptr,
                    len,
                    paddr_base,
                });
                true
            }
            None => false,
        }
    }
}

/// A fault-injecting allocator that models cluster scarcity: every cluster
/// at or after `fail_at` fails to allocate, so a `finalize` call can be
/// driven into its halve-and-retry degradation path.
pub struct FaultyClusterAllocator {
    /// 0-based cluster index at which allocation starts failing.
    pub fail_at: usize,
}

impl ClusterAllocator for FaultyClusterAllocator {
    fn alloc_cluster(&self, cluster_index: usize, _len: usize, _paddr_base: usize) -> Option<()> {
        if cluster_index >= self.fail_at {
            None
        } else {
            Some(())
        }
    }
}

impl ClusterAllocator for SystemClusterAllocator {
    fn alloc_cluster(&self, _cluster_index: usize, _len: usize, _paddr_base: usize) -> Option<()> {
        Some(())
    }
}

/// One of the three slab-style pools owned by a memory domain.
pub struct Pool {
    kind: PoolKind,
    objminsize: u32,
    objmaxsize: u32,
    nummin: u32,
    nummax: u32,

    /// Last-requested values, retained for no-op detection on reconfigure.
    r_objtotal: u32,
    r_objsize: u32,

    /// Configured (post-rounding) values.
    _objtotal: u32,
    _objsize: u32,

    clustentries: u32,
    clustsize: usize,
    numclusters: u32,

    /// Actual totals after finalize (may be smaller than `_objtotal` under
    /// allocation scarcity).
    objtotal: u32,
    memtotal: usize,

    clusters: Vec<Cluster>,
    lut: Vec<LutEntry>,
    bitmap: Vec<u32>,
    objfree: u32,

    finalized: bool,
}

impl Pool {
    /// Create an unconfigured pool of `kind` with the given size/count bounds.
    pub fn new(kind: PoolKind, objminsize: u32, objmaxsize: u32, nummin: u32, nummax: u32) -> Self {
        Pool {
            kind,
            objminsize,
            objmaxsize,
            nummin,
            nummax,
            r_objtotal: 0,
            r_objsize: 0,
            _objtotal: 0,
            _objsize: 0,
            clustentries: 0,
            clustsize: 0,
            numclusters: 0,
            objtotal: 0,
            memtotal: 0,
            clusters: Vec::new(),
            lut: Vec::new(),
            bitmap: Vec::new(),
            objfree: 0,
            finalized: false,
        }
    }

    /// Which pool class this is.
    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    /// True once `finalize` has succeeded and the pool has not since been reset.
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Configured object size, after cache-line rounding.
    pub fn objsize(&self) -> u32 {
        self._objsize
    }

    /// Requested object total before cluster-granularity rounding.
    pub fn requested_objtotal(&self) -> u32 {
        self.r_objtotal
    }

    /// Actual object total (post cluster rounding, possibly post-degradation).
    pub fn objtotal(&self) -> u32 {
        self.objtotal
    }

    /// Total bytes spanned by this pool's clusters.
    pub fn memtotal(&self) -> usize {
        self.memtotal
    }

    /// Number of objects per cluster.
    pub fn clustentries(&self) -> u32 {
        self.clustentries
    }

    /// Bytes per cluster.
    pub fn clustsize(&self) -> usize {
        self.clustsize
    }

    /// Number of clusters actually backing this pool.
    pub fn numclusters(&self) -> u32 {
        self.numclusters
    }

    /// Number of currently-free objects (mirrors bitmap popcount).
    pub fn objfree(&self) -> u32 {
        self.objfree
    }

    /// Whether `(objtotal, objsize)` is a no-op relative to the last request.
    pub fn is_noop_config(&self, objtotal: u32, objsize: u32) -> bool {
        self.r_objtotal == objtotal && self.r_objsize == objsize
    }

    /// Round `objsize` up to the next cache-line multiple, validate bounds,
    /// and compute cluster geometry.
    pub fn configure(&mut self, objtotal: u32, objsize: u32) -> NmResult<()> {
        self.r_objtotal = objtotal;
        self.r_objsize = objsize;

        let rounded = round_up(objsize as usize, CACHE_LINE) as u32;
        if rounded < self.objminsize || rounded > self.objmaxsize {
            return Err(Error::InvalidConfig(format!(
                "{} pool objsize {} (rounded {}) outside [{}, {}]",
                self.kind, objsize, rounded, self.objminsize, self.objmaxsize
            )));
        }
        if objtotal < self.nummin || objtotal > self.nummax {
            return Err(Error::InvalidConfig(format!(
                "{} pool objtotal {} outside [{}, {}]",
                self.kind, objtotal, self.nummin, self.nummax
            )));
        }

        let page = page_size();
        let clustentries = (1..=MAX_CLUSTSIZE / rounded as usize)
            .find(|i| (i * rounded as usize) % page == 0)
            .ok_or_else(|| {
                Error::InvalidConfig(format!(
                    "{} pool objsize {} admits no cluster geometry within {} bytes",
                    self.kind, rounded, MAX_CLUSTSIZE
                ))
            })? as u32;

        let clustsize = clustentries as usize * rounded as usize;
        let numclusters = div_ceil(objtotal, clustentries);

        self._objsize = rounded;
        self.clustentries = clustentries;
        self.clustsize = clustsize;
        self.numclusters = numclusters;
        self._objtotal = numclusters * clustentries;
        self.finalized = false;

        debug!(
            "{} pool configured: objsize={} clustentries={} numclusters={} objtotal={}",
            self.kind, self._objsize, clustentries, numclusters, self._objtotal
        );
        Ok(())
    }

    /// Allocate clusters and build the lookup table.
    ///
    /// Uses the system mmap-backed allocator; see [`Pool::finalize_with`]
    /// to inject cluster allocation failures for testing.
    pub fn finalize(&mut self) -> NmResult<()> {
        self.finalize_with(&SystemClusterAllocator)
    }

    /// As [`Pool::finalize`], but obtaining clusters through `alloc`.
    pub fn finalize_with(&mut self, alloc: &dyn ClusterAllocator) -> NmResult<()> {
        if self.finalized {
            return Ok(());
        }
        if self._objtotal == 0 {
            return Err(Error::InvalidConfig(format!("{} pool not configured", self.kind)));
        }

        self.clusters.clear();
        let target = self.numclusters;
        let mut succeeded = 0usize;
        for i in 0..target as usize {
            let paddr_base = i * self.clustsize;
            if alloc.alloc_cluster(i, self.clustsize, paddr_base).is_some()
                && self.push_real_cluster(self.clustsize, paddr_base)
            {
                succeeded += 1;
            } else {
                break;
            }
        }

        if succeeded < target as usize {
            if succeeded < 2 {
                self.clusters.clear();
                return Err(Error::OutOfMemory(format!(
                    "{} pool: only {} of {} clusters obtained, need at least 2",
                    self.kind, succeeded, target
                )));
            }
            warn!(
                "{} pool: cluster allocation scarce, degraded from {} to {} clusters",
                self.kind, target, succeeded
            );
            self.numclusters = succeeded as u32;
        }

        self.objtotal = self.numclusters * self.clustentries;
        self.memtotal = self.numclusters as usize * self.clustsize;

        self.lut = vec![LutEntry::NULL; self.objtotal as usize];
        for (ci, cluster) in self.clusters.iter().enumerate() {
            for j in 0..self.clustentries as usize {
                let idx = ci * self.clustentries as usize + j;
                let off = j * self._objsize as usize;
                self.lut[idx] = LutEntry {
                    vaddr: cluster.ptr as usize + off,
                    paddr: cluster.paddr_base + off,
                };
            }
        }

        self.init_bitmap()?;
        self.finalized = true;
        debug!(
            "{} pool finalized: objtotal={} memtotal={}",
            self.kind, self.objtotal, self.memtotal
        );
        Ok(())
    }

    /// Build the free bitmap from the lut.
    fn init_bitmap(&mut self) -> NmResult<()> {
        let words = div_ceil(self.objtotal, 32) as usize;
        self.bitmap = vec![0u32; words];
        for (i, entry) in self.lut.iter().enumerate() {
            if entry.vaddr != 0 {
                self.bitmap[i / 32] |= 1 << (i % 32);
            }
        }
        if self.kind == PoolKind::Buf {
            // indices 0 and 1 are permanently reserved fake scratch buffers.
            self.bitmap[0] &= !0b11;
        }
        self.objfree = self.bitmap.iter().map(|w| w.count_ones()).sum();
        if self.kind == PoolKind::Buf && self.objfree < RESERVED_BUF_INDICES {
            return Err(Error::OutOfMemory(
                "buf pool has fewer than 2 free objects after reserving scratch buffers".into(),
            ));
        }
        Ok(())
    }

    /// Scan the bitmap for a free object starting at `start` (a slot-index
    /// hint), allocate it, and return `(vaddr, index)`.
    pub fn allocate(&mut self, start: Option<u32>) -> NmResult<(usize, u32)> {
        if !self.finalized {
            return Err(Error::NotFinalized);
        }
        let nwords = self.bitmap.len();
        if nwords == 0 {
            return Err(Error::OutOfMemory(format!("{} pool exhausted", self.kind)));
        }
        let start_word = start.map(|s| (s / 32) as usize % nwords).unwrap_or(0);
        for offset in 0..nwords {
            let w = (start_word + offset) % nwords;
            let word = self.bitmap[w];
            if word != 0 {
                let bit = word.trailing_zeros() as usize;
                let idx = (w * 32 + bit) as u32;
                if idx >= self.objtotal {
                    continue;
                }
                self.bitmap[w] &= !(1 << bit);
                self.objfree -= 1;
                return Ok((self.lut[idx as usize].vaddr, idx));
            }
        }
        Err(Error::OutOfMemory(format!("{} pool exhausted", self.kind)))
    }

    /// Release object `idx` back to the pool.
    pub fn free_by_index(&mut self, idx: u32) -> NmResult<()> {
        if !self.finalized {
            return Err(Error::NotFinalized);
        }
        if idx >= self.objtotal || (self.kind == PoolKind::Buf && idx < RESERVED_BUF_INDICES) {
            return Err(Error::BadIndex {
                index: idx,
                objtotal: self.objtotal,
            });
        }
        let w = (idx / 32) as usize;
        let bit = idx % 32;
        if self.bitmap[w] & (1 << bit) != 0 {
            return Err(Error::DoubleFree(idx));
        }
        self.bitmap[w] |= 1 << bit;
        self.objfree += 1;
        Ok(())
    }

    /// Locate the cluster/slot owning `vaddr` and free it by index.
    pub fn free_by_address(&mut self, vaddr: usize) -> NmResult<()> {
        let idx = self.index_of_vaddr(vaddr)?;
        self.free_by_index(idx)
    }

    fn index_of_vaddr(&self, vaddr: usize) -> NmResult<u32> {
        for (ci, cluster) in self.clusters.iter().enumerate() {
            let base = cluster.ptr as usize;
            if vaddr >= base && vaddr < base + cluster.len {
                let within = vaddr - base;
                if within % self._objsize as usize != 0 {
                    return Err(Error::BadOffset);
                }
                let j = within / self._objsize as usize;
                return Ok((ci * self.clustentries as usize + j) as u32);
            }
        }
        Err(Error::BadOffset)
    }

    /// Convert a kernel virtual address inside this pool to a pool-relative
    /// byte offset.
    pub fn vaddr_to_offset(&self, vaddr: usize) -> NmResult<usize> {
        for cluster in &self.clusters {
            let base = cluster.ptr as usize;
            if vaddr >= base && vaddr < base + cluster.len {
                let ci_offset = self.cluster_pool_offset(cluster);
                return Ok(ci_offset + (vaddr - base));
            }
        }
        Err(Error::BadOffset)
    }

    /// As [`Pool::vaddr_to_offset`] but returns the simulated physical
    /// address instead, for the `ofstophys` domain operation.
    pub fn offset_to_paddr(&self, offset: usize) -> NmResult<usize> {
        if offset >= self.memtotal {
            return Err(Error::BadOffset);
        }
        let ci = offset / self.clustsize;
        let within = offset % self.clustsize;
        let cluster = self.clusters.get(ci).ok_or(Error::BadOffset)?;
        Ok(cluster.paddr_base + within)
    }

    /// Inverse of [`Pool::vaddr_to_offset`].
    pub fn offset_to_vaddr(&self, offset: usize) -> NmResult<usize> {
        if offset >= self.memtotal {
            return Err(Error::BadOffset);
        }
        let ci = offset / self.clustsize;
        let within = offset % self.clustsize;
        let cluster = self.clusters.get(ci).ok_or(Error::BadOffset)?;
        Ok(cluster.ptr as usize + within)
    }

    fn cluster_pool_offset(&self, cluster: &Cluster) -> usize {
        self.clusters
            .iter()
            .position(|c| c.ptr == cluster.ptr)
            .map(|i| i * self.clustsize)
            .unwrap_or(0)
    }

    /// Returns a raw, mutable view of object `idx`'s memory, `_objsize` bytes long.
    ///
    /// # Safety
    /// The caller must not retain the slice past the object's next free/realloc,
    /// and must not construct overlapping mutable views of the same index.
    pub unsafe fn object_bytes_mut(&self, idx: u32) -> &mut [u8] {
        let entry = self.lut[idx as usize];
        std::slice::from_raw_parts_mut(entry.vaddr as *mut u8, self._objsize as usize)
    }

    /// Read-only view of the lookup table, for the `get_lut` domain operation.
    pub fn lut(&self) -> &[LutEntry] {
        &self.lut
    }

    /// Rebuild the free bitmap from the current lut, marking every backed
    /// object free again (BUF pool's reserved indices 0/1 excluded). Used
    /// when a domain's `active` count falls to 1, to reclaim allocations
    /// leaked by a client that exited without freeing them.
    pub fn reinit_bitmap(&mut self) -> NmResult<()> {
        if !self.finalized {
            return Err(Error::NotFinalized);
        }
        self.init_bitmap()
    }

    /// Free all clusters, the lut, and the bitmap, and clear derived
    /// counters. Configured sizing (`_objsize`,
    /// `clustentries`, ...) is left untouched so a subsequent `configure`
    /// call can detect the no-op case; callers that want a full reset
    /// should call `configure` again regardless.
    pub fn reset(&mut self) {
        self.clusters.clear();
        self.lut.clear();
        self.bitmap.clear();
        self.objfree = 0;
        self.objtotal = 0;
        self.memtotal = 0;
        self.finalized = false;
    }
}

fn div_ceil(a: u32, b: u32) -> u32 {
    (a + b - 1) / b
}

fn round_up(a: usize, b: usize) -> usize {
    (a + b - 1) / b * b
}
