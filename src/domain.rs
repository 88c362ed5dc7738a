//! Memory domain: a named bundle of three pools with shared configuration,
//! reference counting, and an operations vtable.
//!
//! The registry's "circular doubly-linked list" is kept out
//! of this module on purpose — see [`crate::registry`] for why it is
//! re-expressed as an id→handle map instead of raw pointer cycles.

use std::sync::Mutex;

use bitflags::bitflags;
use log::{debug, warn};

use crate::abi::{if_block_size, ring_block_size, NetmapIfHeader, NetmapRingHeader, RingDir};
use crate::config::{DomainConfig, PoolBounds};
use crate::error::{Error, NmResult};
use crate::pool::{LutEntry, Pool, PoolKind};

bitflags! {
    /// Domain state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DomainFlags: u32 {
        /// Clusters allocated, luts and bitmaps built.
        const FINALIZED = 0b0001;
        /// Excluded from registry lookups, but still linked.
        const HIDDEN    = 0b0010;
        /// A private, per-adapter domain rather than the shared global one.
        const PRIVATE   = 0b0100;
        /// Backed by a non-owning (passthrough) region.
        const IO        = 0b1000;
    }
}

fn kind_idx(kind: PoolKind) -> usize {
    match kind {
        PoolKind::If => 0,
        PoolKind::Ring => 1,
        PoolKind::Buf => 2,
    }
}

/// Snapshot of a domain's identity and sizing, returned by `get_info`.
#[derive(Debug, Clone)]
pub struct DomainInfo {
    /// Process-unique id.
    pub nm_id: u16,
    /// Current state flags.
    pub flags: DomainFlags,
    /// Adopted IOMMU group, or `-1` if unassigned.
    pub iommu_group: i32,
    /// Current user count.
    pub active: u32,
    /// Lifetime handle count.
    pub refcount: u32,
    /// Per-pool `(requested, actual)` object totals, ordered `[IF, RING, BUF]`.
    pub pool_objtotal: [(u32, u32); 3],
    /// Per-pool configured object size, ordered `[IF, RING, BUF]`.
    pub pool_objsize: [u32; 3],
    /// Sum of all three pools' `memtotal` once finalized.
    pub nm_totalsize: usize,
}

/// Handle to an allocated `netmap_if` block: its pool address, and enough
/// bookkeeping to patch in ring offsets and eventually free it.
#[derive(Debug, Clone)]
pub struct IfHandle {
    /// Virtual address of the block in the IF pool.
    pub vaddr: usize,
    /// Index of the block within the IF pool (for free/bytes access).
    pub index: u32,
    /// Total `ring_ofs[]` entries, `(tx_rings + host) + (rx_rings + host)`.
    pub n_rings: usize,
    /// Non-host TX ring count the client requested.
    pub tx_rings: u32,
    /// Non-host RX ring count the client requested.
    pub rx_rings: u32,
}

/// Handle to an allocated `netmap_ring` block and the buffers backing its slots.
#[derive(Debug, Clone)]
pub struct RingHandle {
    /// Virtual address of the block in the RING pool.
    pub vaddr: usize,
    /// Index of the block within the RING pool.
    pub index: u32,
    /// Number of slots in this ring.
    pub num_slots: u32,
    /// BUF pool indices backing each slot (all `0` for a fake/host ring).
    pub buf_indices: Vec<u32>,
    /// Whether this is the fake host-stack ring.
    pub is_host: bool,
}

/// Operations every memory-domain variant (global or passthrough) provides.
///
/// `rings_create`/`rings_delete` here are the single-ring allocation
/// primitive; the per-kring iteration and `users`/`NEEDRING` gating lives
/// one layer up, in [`crate::ring`], which calls these once per kring
/// that actually needs a ring.
pub trait MemoryDomain: Send + Sync {
    /// Snapshot of one pool's lookup table.
    fn get_lut(&self, kind: PoolKind) -> NmResult<Vec<LutEntry>>;
    /// Snapshot of the domain's identity, flags, and sizing.
    fn get_info(&self) -> DomainInfo;
    /// Simulated physical address of the object at domain-global `offset`.
    fn ofstophys(&self, offset: usize) -> NmResult<usize>;
    /// Apply new pool sizes, resetting pools first if already finalized.
    fn config(&self, cfg: DomainConfig) -> NmResult<()>;
    /// Allocate clusters and build luts/bitmaps for all three pools.
    fn finalize(&self, iommu_group: i32) -> NmResult<()>;
    /// Decrement the active-user count, reclaiming leaks at the 1-to-0 edge.
    fn deref(&self);
    /// Tear down a domain that has reached refcount zero.
    fn delete(&self);
    /// Domain-global byte offset of an IF-pool virtual address.
    fn if_offset(&self, vaddr: usize) -> NmResult<usize>;
    /// Allocate and initialize a `netmap_if` block.
    fn if_new(&self, name: &str, tx_rings: u32, rx_rings: u32, host_rings: bool) -> NmResult<IfHandle>;
    /// Free a `netmap_if` block.
    fn if_delete(&self, ifh: &IfHandle) -> NmResult<()>;
    /// Allocate one `netmap_ring` block plus its slot buffers, and patch
    /// `ifh.ring_ofs[ring_slot]` to point at it.
    #[allow(clippy::too_many_arguments)]
    fn rings_create(
        &self,
        ifh: &mut IfHandle,
        ring_slot: usize,
        dir: RingDir,
        ringid: u16,
        num_slots: u32,
        is_host: bool,
    ) -> NmResult<RingHandle>;
    /// Free a ring block and its slot buffers.
    fn rings_delete(&self, rh: RingHandle) -> NmResult<()>;
}

struct Inner {
    pools: [Pool; 3],
    flags: DomainFlags,
    iommu_group: i32,
    refcount: u32,
    active: u32,
    lasterr: Option<Error>,
    requested: Option<(u32, u32, u32, u32, u32, u32)>,
}

fn configs_equal(a: DomainConfig, b: (u32, u32, u32, u32, u32, u32)) -> bool {
    (
        a.if_pool.objtotal,
        a.if_pool.objsize,
        a.ring_pool.objtotal,
        a.ring_pool.objsize,
        a.buf_pool.objtotal,
        a.buf_pool.objsize,
    ) == b
}

fn config_key(cfg: DomainConfig) -> (u32, u32, u32, u32, u32, u32) {
    (
        cfg.if_pool.objtotal,
        cfg.if_pool.objsize,
        cfg.ring_pool.objtotal,
        cfg.ring_pool.objsize,
        cfg.buf_pool.objtotal,
        cfg.buf_pool.objsize,
    )
}

/// The owning domain variant: pools carve their clusters directly out of
/// anonymous mmap'd memory.
pub struct GlobalDomain {
    nm_id: u16,
    inner: Mutex<Inner>,
}

impl GlobalDomain {
    /// Construct an un-configured domain with id `nm_id` and refcount 1.
    pub fn new(nm_id: u16) -> Self {
        let pools = [
            Pool::new(
                PoolKind::If,
                PoolBounds::for_kind(PoolKind::If).objminsize,
                PoolBounds::for_kind(PoolKind::If).objmaxsize,
                PoolBounds::for_kind(PoolKind::If).nummin,
                PoolBounds::for_kind(PoolKind::If).nummax,
            ),
            Pool::new(
                PoolKind::Ring,
                PoolBounds::for_kind(PoolKind::Ring).objminsize,
                PoolBounds::for_kind(PoolKind::Ring).objmaxsize,
                PoolBounds::for_kind(PoolKind::Ring).nummin,
                PoolBounds::for_kind(PoolKind::Ring).nummax,
            ),
            Pool::new(
                PoolKind::Buf,
                PoolBounds::for_kind(PoolKind::Buf).objminsize,
                PoolBounds::for_kind(PoolKind::Buf).objmaxsize,
                PoolBounds::for_kind(PoolKind::Buf).nummin,
                PoolBounds::for_kind(PoolKind::Buf).nummax,
            ),
        ];
        GlobalDomain {
            nm_id,
            inner: Mutex::new(Inner {
                pools,
                flags: DomainFlags::empty(),
                iommu_group: -1,
                refcount: 1,
                active: 0,
                lasterr: None,
                requested: None,
            }),
        }
    }

    /// This domain's process-unique id.
    pub fn nm_id(&self) -> u16 {
        self.nm_id
    }

    /// Increment the reference count.
    pub fn get(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.refcount += 1;
    }

    /// Decrement the reference count, returning `true` if it reached zero.
    pub fn put(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.refcount = inner.refcount.saturating_sub(1);
        inner.refcount == 0
    }

    fn pool_base_offset(inner: &Inner, kind: PoolKind) -> usize {
        match kind {
            PoolKind::If => 0,
            PoolKind::Ring => inner.pools[kind_idx(PoolKind::If)].memtotal(),
            PoolKind::Buf => {
                inner.pools[kind_idx(PoolKind::If)].memtotal()
                    + inner.pools[kind_idx(PoolKind::Ring)].memtotal()
            }
        }
    }

    fn do_config(inner: &mut Inner, cfg: DomainConfig) -> NmResult<()> {
        if inner.flags.contains(DomainFlags::FINALIZED) {
            for p in inner.pools.iter_mut() {
                p.reset();
            }
            inner.flags.remove(DomainFlags::FINALIZED);
        }
        let res = (|| -> NmResult<()> {
            inner.pools[kind_idx(PoolKind::If)].configure(cfg.if_pool.objtotal, cfg.if_pool.objsize)?;
            inner.pools[kind_idx(PoolKind::Ring)]
                .configure(cfg.ring_pool.objtotal, cfg.ring_pool.objsize)?;
            inner.pools[kind_idx(PoolKind::Buf)].configure(cfg.buf_pool.objtotal, cfg.buf_pool.objsize)?;
            Ok(())
        })();
        inner.lasterr = res.clone().err();
        res
    }
}

impl MemoryDomain for GlobalDomain {
    fn get_lut(&self, kind: PoolKind) -> NmResult<Vec<LutEntry>> {
        let inner = self.inner.lock().unwrap();
        if !inner.flags.contains(DomainFlags::FINALIZED) {
            return Err(Error::NotFinalized);
        }
        Ok(inner.pools[kind_idx(kind)].lut().to_vec())
    }

    fn get_info(&self) -> DomainInfo {
        let inner = self.inner.lock().unwrap();
        let nm_totalsize = inner.pools.iter().map(|p| p.memtotal()).sum();
        DomainInfo {
            nm_id: self.nm_id,
            flags: inner.flags,
            iommu_group: inner.iommu_group,
            active: inner.active,
            refcount: inner.refcount,
            pool_objtotal: [
                (
                    inner.pools[0].requested_objtotal(),
                    inner.pools[0].objtotal(),
                ),
                (
                    inner.pools[1].requested_objtotal(),
                    inner.pools[1].objtotal(),
                ),
                (
                    inner.pools[2].requested_objtotal(),
                    inner.pools[2].objtotal(),
                ),
            ],
            pool_objsize: [
                inner.pools[0].objsize(),
                inner.pools[1].objsize(),
                inner.pools[2].objsize(),
            ],
            nm_totalsize,
        }
    }

    fn ofstophys(&self, offset: usize) -> NmResult<usize> {
        let inner = self.inner.lock().unwrap();
        for kind in [PoolKind::If, PoolKind::Ring, PoolKind::Buf] {
            let base = Self::pool_base_offset(&inner, kind);
            let pool = &inner.pools[kind_idx(kind)];
            if offset >= base && offset < base + pool.memtotal() {
                return pool.offset_to_paddr(offset - base);
            }
        }
        Err(Error::BadOffset)
    }

    fn config(&self, cfg: DomainConfig) -> NmResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.active > 0 {
            warn!("domain {} config attempted while active={}", self.nm_id, inner.active);
            return match inner.lasterr.clone() {
                Some(e) => Err(e),
                None => Ok(()),
            };
        }
        let key = config_key(cfg);
        if let Some(prev) = inner.requested {
            if configs_equal(cfg, prev) {
                return match inner.lasterr.clone() {
                    Some(e) => Err(e),
                    None => Ok(()),
                };
            }
        }
        inner.requested = Some(key);
        Self::do_config(&mut inner, cfg)
    }

    fn finalize(&self, iommu_group: i32) -> NmResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.requested.is_none() {
            let cfg = DomainConfig::default();
            inner.requested = Some(config_key(cfg));
            Self::do_config(&mut inner, cfg)?;
        }
        if inner.flags.contains(DomainFlags::FINALIZED) {
            inner.active += 1;
            return Ok(());
        }
        if inner.iommu_group == -1 {
            inner.iommu_group = iommu_group;
        } else if inner.iommu_group != iommu_group {
            return Err(Error::GroupMismatch {
                domain_group: inner.iommu_group,
                adapter_group: iommu_group,
            });
        }

        let res = (|| -> NmResult<()> {
            for p in inner.pools.iter_mut() {
                p.finalize()?;
            }
            Ok(())
        })();

        match res {
            Ok(()) => {
                inner.flags.insert(DomainFlags::FINALIZED);
                inner.active += 1;
                debug!(
                    "domain {} finalized: totalsize={}",
                    self.nm_id,
                    inner.pools.iter().map(|p| p.memtotal()).sum::<usize>()
                );
                Ok(())
            }
            Err(e) => {
                for p in inner.pools.iter_mut() {
                    p.reset();
                }
                inner.lasterr = Some(e.clone());
                Err(e)
            }
        }
    }

    fn deref(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.active == 0 {
            return;
        }
        inner.active -= 1;
        if inner.active == 1 {
            for p in inner.pools.iter_mut() {
                if p.is_finalized() {
                    let _ = p.reinit_bitmap();
                }
            }
        }
        if inner.active == 0 {
            inner.iommu_group = -1;
        }
    }

    fn delete(&self) {
        let mut inner = self.inner.lock().unwrap();
        for p in inner.pools.iter_mut() {
            p.reset();
        }
        inner.flags.remove(DomainFlags::FINALIZED);
    }

    fn if_offset(&self, vaddr: usize) -> NmResult<usize> {
        let inner = self.inner.lock().unwrap();
        inner.pools[kind_idx(PoolKind::If)].vaddr_to_offset(vaddr)
    }

    fn if_new(&self, name: &str, tx_rings: u32, rx_rings: u32, host_rings: bool) -> NmResult<IfHandle> {
        let mut inner = self.inner.lock().unwrap();
        let host = if host_rings { 1 } else { 0 };
        let n_rings = (tx_rings + host) as usize + (rx_rings + host) as usize;
        let need = if_block_size(n_rings);
        if need > inner.pools[kind_idx(PoolKind::If)].objsize() as usize {
            return Err(Error::InvalidConfig(format!(
                "if block for {} rings needs {} bytes, if pool objsize is {}",
                n_rings,
                need,
                inner.pools[kind_idx(PoolKind::If)].objsize()
            )));
        }
        let (vaddr, index) = inner.pools[kind_idx(PoolKind::If)].allocate(None)?;
        // SAFETY: `vaddr`/`index` were just allocated from the IF pool and are
        // `objsize` bytes long, which we verified is >= `need` above.
        unsafe {
            let bytes = inner.pools[kind_idx(PoolKind::If)].object_bytes_mut(index);
            let hdr = NetmapIfHeader::named(name, tx_rings, rx_rings);
            std::ptr::write(bytes.as_mut_ptr() as *mut NetmapIfHeader, hdr);
            let ofs_ptr = bytes
                .as_mut_ptr()
                .add(core::mem::size_of::<NetmapIfHeader>()) as *mut i64;
            for i in 0..n_rings {
                std::ptr::write(ofs_ptr.add(i), 0i64);
            }
        }
        Ok(IfHandle {
            vaddr,
            index,
            n_rings,
            tx_rings,
            rx_rings,
        })
    }

    fn if_delete(&self, ifh: &IfHandle) -> NmResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.pools[kind_idx(PoolKind::If)].free_by_index(ifh.index)
    }

    fn rings_create(
        &self,
        ifh: &mut IfHandle,
        ring_slot: usize,
        dir: RingDir,
        ringid: u16,
        num_slots: u32,
        is_host: bool,
    ) -> NmResult<RingHandle> {
        let mut inner = self.inner.lock().unwrap();
        let need = ring_block_size(num_slots);
        if need > inner.pools[kind_idx(PoolKind::Ring)].objsize() as usize {
            return Err(Error::InvalidConfig(format!(
                "ring block for {} slots needs {} bytes, ring pool objsize is {}",
                num_slots,
                need,
                inner.pools[kind_idx(PoolKind::Ring)].objsize()
            )));
        }
        let (ring_vaddr, ring_index) = inner.pools[kind_idx(PoolKind::Ring)].allocate(None)?;

        let mut buf_indices = Vec::with_capacity(num_slots as usize);
        let alloc_res: NmResult<()> = (|| {
            for _ in 0..num_slots {
                if is_host {
                    buf_indices.push(0);
                } else {
                    let (_, idx) = inner.pools[kind_idx(PoolKind::Buf)].allocate(None)?;
                    buf_indices.push(idx);
                }
            }
            Ok(())
        })();
        if let Err(e) = alloc_res {
            for idx in buf_indices.drain(..) {
                if idx != 0 {
                    let _ = inner.pools[kind_idx(PoolKind::Buf)].free_by_index(idx);
                }
            }
            let _ = inner.pools[kind_idx(PoolKind::Ring)].free_by_index(ring_index);
            return Err(e);
        }

        let ring_local_ofs = inner.pools[kind_idx(PoolKind::Ring)].vaddr_to_offset(ring_vaddr)?;
        let ring_global_ofs = Self::pool_base_offset(&inner, PoolKind::Ring) + ring_local_ofs;
        let buf_base_global = Self::pool_base_offset(&inner, PoolKind::Buf);
        let buf_ofs = buf_base_global as i64 - ring_global_ofs as i64;
        let buf_objsize = inner.pools[kind_idx(PoolKind::Buf)].objsize();

        // SAFETY: `ring_index` was just allocated from the RING pool and is
        // `objsize` bytes long, verified >= `need` above.
        unsafe {
            let bytes = inner.pools[kind_idx(PoolKind::Ring)].object_bytes_mut(ring_index);
            let hdr = NetmapRingHeader {
                num_slots,
                buf_ofs,
                head: 0,
                cur: 0,
                tail: 0,
                nr_buf_size: buf_objsize,
                ringid,
                dir: dir as u16,
            };
            std::ptr::write(bytes.as_mut_ptr() as *mut NetmapRingHeader, hdr);
            let slot_ptr =
                bytes.as_mut_ptr().add(core::mem::size_of::<NetmapRingHeader>()) as *mut crate::abi::NetmapSlot;
            for (i, &buf_idx) in buf_indices.iter().enumerate() {
                std::ptr::write(
                    slot_ptr.add(i),
                    crate::abi::NetmapSlot {
                        buf_idx,
                        len: if is_host { 0 } else { buf_objsize as u16 },
                        flags: 0,
                    },
                );
            }
        }

        if ring_slot < ifh.n_rings {
            unsafe {
                let if_bytes = inner.pools[kind_idx(PoolKind::If)].object_bytes_mut(ifh.index);
                let if_local_ofs =
                    inner.pools[kind_idx(PoolKind::If)].vaddr_to_offset(ifh.vaddr)?;
                let if_global_ofs = if_local_ofs; // IF pool is at domain base 0.
                let ofs_ptr = if_bytes
                    .as_mut_ptr()
                    .add(core::mem::size_of::<NetmapIfHeader>()) as *mut i64;
                std::ptr::write(
                    ofs_ptr.add(ring_slot),
                    ring_global_ofs as i64 - if_global_ofs as i64,
                );
            }
        }

        Ok(RingHandle {
            vaddr: ring_vaddr,
            index: ring_index,
            num_slots,
            buf_indices,
            is_host,
        })
    }

    fn rings_delete(&self, rh: RingHandle) -> NmResult<()> {
        let mut inner = self.inner.lock().unwrap();
        for idx in rh.buf_indices {
            if idx != 0 {
                inner.pools[kind_idx(PoolKind::Buf)].free_by_index(idx)?;
            }
        }
        inner.pools[kind_idx(PoolKind::Ring)].free_by_index(rh.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_cfg() -> DomainConfig {
        DomainConfig {
            if_pool: crate::config::PoolConfig {
                objtotal: 4,
                objsize: 256,
            },
            ring_pool: crate::config::PoolConfig {
                objtotal: 4,
                objsize: 4096,
            },
            buf_pool: crate::config::PoolConfig {
                objtotal: 64,
                objsize: 2048,
            },
        }
    }

    #[test]
    fn finalize_reports_expected_totals() {
        let d = GlobalDomain::new(2);
        d.config(small_cfg()).unwrap();
        d.finalize(-1).unwrap();
        let info = d.get_info();
        assert!(info.flags.contains(DomainFlags::FINALIZED));
        assert_eq!(info.active, 1);
        assert!(info.nm_totalsize > 0);
    }

    #[test]
    fn second_finalize_just_bumps_active() {
        let d = GlobalDomain::new(2);
        d.config(small_cfg()).unwrap();
        d.finalize(7).unwrap();
        d.finalize(7).unwrap();
        assert_eq!(d.get_info().active, 2);
    }

    #[test]
    fn finalize_rejects_mismatched_iommu_group() {
        let d = GlobalDomain::new(2);
        d.config(small_cfg()).unwrap();
        d.finalize(7).unwrap();
        d.deref();
        // active is now 0, group cleared, so a different group is fine:
        d.finalize(9).unwrap();
        assert_eq!(d.get_info().iommu_group, 9);
    }

    #[test]
    fn config_while_active_is_silently_ignored() {
        let d = GlobalDomain::new(2);
        d.config(small_cfg()).unwrap();
        d.finalize(-1).unwrap();
        let before = d.get_info().pool_objtotal[2].1;

        let mut other = small_cfg();
        other.buf_pool.objtotal = 128;
        // Busy is defined as a silent no-op (spec.md §7), not a hard error.
        d.config(other).unwrap();

        assert_eq!(d.get_info().pool_objtotal[2].1, before);
    }

    #[test]
    fn if_new_and_rings_create_round_trip() {
        let d = GlobalDomain::new(2);
        d.config(small_cfg()).unwrap();
        d.finalize(-1).unwrap();
        let mut ifh = d.if_new("eth0", 1, 1, false).unwrap();
        let rh = d
            .rings_create(&mut ifh, 0, RingDir::Tx, 0, 8, false)
            .unwrap();
        assert_eq!(rh.num_slots, 8);
        assert_eq!(rh.buf_indices.len(), 8);
        assert!(rh.buf_indices.iter().all(|&i| i >= 2));
        d.rings_delete(rh).unwrap();
        d.if_delete(&ifh).unwrap();
    }

    #[test]
    fn ofstophys_and_if_offset_are_consistent() {
        let d = GlobalDomain::new(2);
        d.config(small_cfg()).unwrap();
        d.finalize(-1).unwrap();
        let ifh = d.if_new("eth0", 0, 0, false).unwrap();
        let offset = d.if_offset(ifh.vaddr).unwrap();
        assert!(d.ofstophys(offset).is_ok());
    }
}
