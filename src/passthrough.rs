//! The passthrough (ptnetmap guest) domain variant.
//!
//! Implements the same operations vtable as [`crate::domain::GlobalDomain`]
//! but over a region the guest does not own: a host-mapped PCI BAR. Exists
//! to show the allocator interface cleanly abstracting both an owning and a
//! non-owning memory domain.
//!
//! There is no real PCI BAR to map in a hosted binary, so `BarRegister`s
//! stand in for "what the device registers report" and `bar` stands in for
//! the host's already-mapped region; a real guest would `ioremap` the BAR
//! instead of owning the bytes, but the vtable contract is identical either
//! way.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::abi::{NetmapIfHeader, NetmapRingHeader, RingDir};
use crate::config::DomainConfig;
use crate::domain::{DomainFlags, DomainInfo, IfHandle, MemoryDomain, RingHandle};
use crate::error::{Error, NmResult};
use crate::pool::{LutEntry, PoolKind};

/// What the device registers report.
#[derive(Debug, Clone, Copy)]
pub struct BarRegisters {
    /// Per-buffer size reported by the host.
    pub buf_size: u32,
    /// Buffer count reported by the host.
    pub buf_count: u32,
    /// Byte offset of the buffer pool within the BAR.
    pub pool_offset: usize,
    /// Physical base address of the BAR, for `ofstophys`.
    pub base_paddr: usize,
}

struct PtInner {
    bar: Vec<u8>,
    regs: BarRegisters,
    lut: Vec<LutEntry>,
    flags: DomainFlags,
    iommu_group: i32,
    refcount: u32,
    active: u32,
    /// Adapter name → `nifp_offset` within the BAR, maintained by explicit
    /// `add_if_offset`/`remove_if_offset` calls.
    if_offsets: HashMap<String, usize>,
}

/// A guest-side domain backed by a host-owned BAR region.
pub struct PassthroughDomain {
    nm_id: u16,
    inner: Mutex<PtInner>,
}

impl PassthroughDomain {
    /// Construct a passthrough domain over `bar`, a host-mapped region of
    /// at least `regs.pool_offset + regs.buf_size*regs.buf_count` bytes.
    pub fn new(nm_id: u16, bar: Vec<u8>, regs: BarRegisters) -> Self {
        PassthroughDomain {
            nm_id,
            inner: Mutex::new(PtInner {
                bar,
                regs,
                lut: Vec::new(),
                flags: DomainFlags::IO,
                iommu_group: -1,
                refcount: 1,
                active: 0,
                if_offsets: HashMap::new(),
            }),
        }
    }

    /// This domain's process-unique id.
    pub fn nm_id(&self) -> u16 {
        self.nm_id
    }

    /// Register `name`'s `netmap_if` offset within the BAR, as supplied by
    /// the host side out-of-band.
    pub fn add_if_offset(&self, name: &str, offset: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.if_offsets.insert(name.to_string(), offset);
    }

    /// Remove a previously registered `netmap_if` offset.
    pub fn remove_if_offset(&self, name: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.if_offsets.remove(name);
    }

    fn bar_base_vaddr(inner: &PtInner) -> usize {
        inner.bar.as_ptr() as usize
    }
}

impl MemoryDomain for PassthroughDomain {
    fn get_lut(&self, kind: PoolKind) -> NmResult<Vec<LutEntry>> {
        let inner = self.inner.lock().unwrap();
        if !inner.flags.contains(DomainFlags::FINALIZED) {
            return Err(Error::NotFinalized);
        }
        match kind {
            // The guest has no local IF/RING pools: both live in the host's
            // region and are only ever reached through if_new/rings_create.
            PoolKind::If | PoolKind::Ring => Ok(Vec::new()),
            PoolKind::Buf => Ok(inner.lut.clone()),
        }
    }

    fn get_info(&self) -> DomainInfo {
        let inner = self.inner.lock().unwrap();
        DomainInfo {
            nm_id: self.nm_id,
            flags: inner.flags,
            iommu_group: inner.iommu_group,
            active: inner.active,
            refcount: inner.refcount,
            pool_objtotal: [
                (0, 0),
                (0, 0),
                (inner.regs.buf_count, inner.regs.buf_count),
            ],
            pool_objsize: [0, 0, inner.regs.buf_size],
            nm_totalsize: inner.regs.buf_count as usize * inner.regs.buf_size as usize,
        }
    }

    fn ofstophys(&self, offset: usize) -> NmResult<usize> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.regs.base_paddr + offset)
    }

    fn config(&self, _cfg: DomainConfig) -> NmResult<()> {
        // Configure is a no-op for passthrough: sizing is dictated by the
        // host's device registers, not by a local request.
        Ok(())
    }

    fn finalize(&self, iommu_group: i32) -> NmResult<()> {
        let mut inner = self.inner.lock().unwrap();
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

        let base = Self::bar_base_vaddr(&inner);
        let regs = inner.regs;
        if regs.pool_offset + regs.buf_count as usize * regs.buf_size as usize > inner.bar.len() {
            return Err(Error::OutOfMemory(
                "BAR too small for the buffer pool it advertises".into(),
            ));
        }
        let mut lut = Vec::with_capacity(regs.buf_count as usize);
        for i in 0..regs.buf_count as usize {
            let off = regs.pool_offset + i * regs.buf_size as usize;
            lut.push(LutEntry {
                vaddr: base + off,
                paddr: regs.base_paddr + off,
            });
        }
        inner.lut = lut;
        inner.flags.insert(DomainFlags::FINALIZED);
        inner.active += 1;
        Ok(())
    }

    fn deref(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.active == 0 {
            return;
        }
        inner.active -= 1;
        if inner.active == 0 {
            inner.iommu_group = -1;
        }
    }

    fn delete(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.lut.clear();
        inner.flags.remove(DomainFlags::FINALIZED);
    }

    fn if_offset(&self, vaddr: usize) -> NmResult<usize> {
        let inner = self.inner.lock().unwrap();
        let base = Self::bar_base_vaddr(&inner);
        if vaddr < base || vaddr >= base + inner.bar.len() {
            return Err(Error::BadOffset);
        }
        Ok(vaddr - base)
    }

    fn if_new(&self, name: &str, tx_rings: u32, rx_rings: u32, host_rings: bool) -> NmResult<IfHandle> {
        let inner = self.inner.lock().unwrap();
        let offset = *inner
            .if_offsets
            .get(name)
            .ok_or_else(|| Error::InvalidConfig(format!("no nifp offset registered for adapter {name}")))?;
        let host = if host_rings { 1 } else { 0 };
        let n_rings = (tx_rings + host) as usize + (rx_rings + host) as usize;
        Ok(IfHandle {
            vaddr: Self::bar_base_vaddr(&inner) + offset,
            index: u32::MAX,
            n_rings,
            tx_rings,
            rx_rings,
        })
    }

    fn if_delete(&self, _ifh: &IfHandle) -> NmResult<()> {
        // The guest never owned this memory; nothing to free.
        Ok(())
    }

    fn rings_create(
        &self,
        ifh: &mut IfHandle,
        ring_slot: usize,
        dir: RingDir,
        ringid: u16,
        _num_slots: u32,
        is_host: bool,
    ) -> NmResult<RingHandle> {
        let _ = (dir, ringid);
        if ring_slot >= ifh.n_rings {
            return Err(Error::BadOffset);
        }
        // SAFETY: `ifh.vaddr` points into the host-owned BAR at an offset
        // the host published; the host is trusted to keep `ring_ofs[]` and
        // the pointed-to `netmap_ring` header valid for the adapter's
        // lifetime.
        unsafe {
            let ofs_ptr = (ifh.vaddr + core::mem::size_of::<NetmapIfHeader>()) as *const i64;
            let rel_ofs = std::ptr::read(ofs_ptr.add(ring_slot));
            if rel_ofs == 0 {
                return Err(Error::BadOffset);
            }
            let ring_vaddr = (ifh.vaddr as i64 + rel_ofs) as usize;
            let hdr = std::ptr::read(ring_vaddr as *const NetmapRingHeader);
            Ok(RingHandle {
                vaddr: ring_vaddr,
                index: u32::MAX,
                num_slots: hdr.num_slots,
                buf_indices: Vec::new(),
                is_host,
            })
        }
    }

    fn rings_delete(&self, _rh: RingHandle) -> NmResult<()> {
        // `netmap_mem_pt_guest_rings_delete` is a no-op in the real kernel
        // module: the ring belongs to the host, so the guest just drops
        // its pointer.
        Ok(())
    }
}
