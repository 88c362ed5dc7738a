//! Per-adapter ring fabric: kernel-side kring descriptors and the
//! `netmap_if`/`netmap_ring`/`netmap_slot` construction that backs them.
//!
//! [`Kring`] is the kernel-side shadow of a `netmap_ring`; [`RingSet`]
//! drives the per-kring `if_new`/`rings_create`/`rings_delete` iteration,
//! calling into a [`MemoryDomain`]'s single-ring primitives of the same
//! name once per kring that actually needs one.

use std::sync::{Arc, Mutex, Weak};

use bitflags::bitflags;
use log::debug;

use crate::abi::RingDir;
use crate::domain::{IfHandle, MemoryDomain, RingHandle};
use crate::error::NmResult;

bitflags! {
    /// Per-kring mode flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct KringFlags: u32 {
        /// The ring is live and visible to userspace.
        const NETMAP_ON = 0b01;
        /// The peer requires this kring's ring to exist even with no local users.
        const NEEDRING  = 0b10;
    }
}

/// Kernel-side shadow of a `netmap_ring`.
pub struct Kring {
    /// Next slot the kernel will hand to hardware/user.
    pub nr_hwcur: u32,
    /// First slot not yet handed to user/kernel.
    pub nr_hwtail: u32,
    /// User-reported head.
    pub rhead: u32,
    /// User-reported cur.
    pub rcur: u32,
    /// User-reported tail.
    pub rtail: u32,
    /// Number of slots, once a ring is created (0 until then).
    pub nkr_num_slots: u32,
    /// Mode flags.
    pub flags: KringFlags,
    /// Count of userspace clients currently using this kring.
    pub users: u32,
    /// True for the fake host-stack ring.
    pub is_host: bool,
    /// This kring's slot in `netmap_if.ring_ofs[]` (tx entries first, then rx).
    pub ring_slot: usize,
    /// Direction.
    pub dir: RingDir,
    /// The allocated ring block, once `rings_create` has run for this kring.
    pub ring: Option<RingHandle>,
    /// Non-owning reference to the cross-linked peer kring. Resolved through [`Kring::peer`], which models
    /// the RCU read-side critical section as a short-lived upgraded handle.
    pub pipe: Option<Weak<Mutex<Kring>>>,
    /// Times `nm_notify` has fired for this kring.
    pub notify_count: u32,
}

impl Kring {
    /// A freshly constructed, not-yet-created kring for ring `ring_slot`.
    pub fn new(ring_slot: usize, dir: RingDir, is_host: bool) -> Self {
        Kring {
            nr_hwcur: 0,
            nr_hwtail: 0,
            rhead: 0,
            rcur: 0,
            rtail: 0,
            nkr_num_slots: 0,
            flags: KringFlags::empty(),
            users: 0,
            is_host,
            ring_slot,
            dir,
            ring: None,
            pipe: None,
            notify_count: 0,
        }
    }

    /// Resolve the peer kring for the duration of a critical section,
    /// returning `None` if the peer has been torn down.
    pub fn peer(&self) -> Option<PeerGuard> {
        self.pipe.as_ref().and_then(Weak::upgrade).map(PeerGuard)
    }

    /// Fire this kring's notify callback.
    pub fn notify(&mut self) {
        self.notify_count += 1;
    }
}

/// An owning handle to a peer kring, resolved for the lifetime of one
/// critical section.
pub struct PeerGuard(Arc<Mutex<Kring>>);

impl std::ops::Deref for PeerGuard {
    type Target = Mutex<Kring>;
    fn deref(&self) -> &Mutex<Kring> {
        &self.0
    }
}

/// Per-direction, per-adapter ring geometry request.
pub struct RingSetSpec {
    /// Interface name written into the `netmap_if` header.
    pub name: String,
    /// Non-host TX ring count.
    pub tx_rings: u32,
    /// Non-host RX ring count.
    pub rx_rings: u32,
    /// Descriptors per TX ring.
    pub tx_descs: u32,
    /// Descriptors per RX ring.
    pub rx_descs: u32,
    /// Whether a fake host-stack ring is appended to each direction.
    pub host_rings: bool,
}

/// One adapter's `netmap_if` plus its TX/RX krings.
pub struct RingSet {
    /// The allocated `netmap_if` block.
    pub ifh: IfHandle,
    /// TX krings, host ring last if `host_rings` was set.
    pub tx: Vec<Arc<Mutex<Kring>>>,
    /// RX krings, host ring last if `host_rings` was set.
    pub rx: Vec<Arc<Mutex<Kring>>>,
}

impl RingSet {
    /// Allocate the `netmap_if` block and construct (but do not yet back
    /// with memory) every kring.
    pub fn if_new(domain: &dyn MemoryDomain, spec: &RingSetSpec) -> NmResult<Self> {
        let ifh = domain.if_new(&spec.name, spec.tx_rings, spec.rx_rings, spec.host_rings)?;
        let host = if spec.host_rings { 1 } else { 0 };
        let tx_total = spec.tx_rings + host;
        let rx_total = spec.rx_rings + host;
        let tx = (0..tx_total)
            .map(|i| {
                Arc::new(Mutex::new(Kring::new(
                    i as usize,
                    RingDir::Tx,
                    i >= spec.tx_rings,
                )))
            })
            .collect();
        let rx = (0..rx_total)
            .map(|i| {
                Arc::new(Mutex::new(Kring::new(
                    tx_total as usize + i as usize,
                    RingDir::Rx,
                    i >= spec.rx_rings,
                )))
            })
            .collect();
        Ok(RingSet { ifh, tx, rx })
    }

    /// For every kring that has users or is flagged `NEEDRING` and does not
    /// yet have a ring, allocate one from the domain.
    pub fn rings_create(&mut self, domain: &dyn MemoryDomain, tx_descs: u32, rx_descs: u32) -> NmResult<()> {
        for k in &self.tx {
            Self::create_one(domain, &mut self.ifh, k, tx_descs)?;
        }
        for k in &self.rx {
            Self::create_one(domain, &mut self.ifh, k, rx_descs)?;
        }
        Ok(())
    }

    fn create_one(domain: &dyn MemoryDomain, ifh: &mut IfHandle, karc: &Arc<Mutex<Kring>>, ndesc: u32) -> NmResult<()> {
        let mut k = karc.lock().unwrap();
        if k.ring.is_some() {
            return Ok(());
        }
        if k.users == 0 && !k.flags.contains(KringFlags::NEEDRING) {
            return Ok(());
        }
        let num_slots = if k.is_host { 1 } else { ndesc };
        let ringid = k.ring_slot as u16;
        let rh = domain.rings_create(ifh, k.ring_slot, k.dir, ringid, num_slots, k.is_host)?;
        k.nkr_num_slots = rh.num_slots;
        k.nr_hwcur = 0;
        k.nr_hwtail = match k.dir {
            RingDir::Tx => rh.num_slots.saturating_sub(1),
            RingDir::Rx => 0,
        };
        k.ring = Some(rh);
        debug!("ring created: slot={} dir={:?} num_slots={}", k.ring_slot, k.dir, k.nkr_num_slots);
        Ok(())
    }

    /// Free every kring's ring whose `users == 0` and `NEEDRING` is clear;
    /// any other kring keeps its ring alive — this is how a peer can hold a
    /// ring alive across a local deregister.
    pub fn rings_delete(&mut self, domain: &dyn MemoryDomain) -> NmResult<()> {
        for k in self.tx.iter().chain(self.rx.iter()) {
            let mut k = k.lock().unwrap();
            if k.users > 0 || k.flags.contains(KringFlags::NEEDRING) {
                continue;
            }
            if let Some(rh) = k.ring.take() {
                domain.rings_delete(rh)?;
                k.nkr_num_slots = 0;
            }
        }
        Ok(())
    }

    /// Free the `netmap_if` block itself. Callers must have already torn
    /// down every kring's ring via [`RingSet::rings_delete`].
    pub fn if_delete(&self, domain: &dyn MemoryDomain) -> NmResult<()> {
        domain.if_delete(&self.ifh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DomainConfig;
    use crate::domain::GlobalDomain;

    fn small_cfg() -> DomainConfig {
        DomainConfig {
            if_pool: crate::config::PoolConfig {
                objtotal: 4,
                objsize: 256,
            },
            ring_pool: crate::config::PoolConfig {
                objtotal: 8,
                objsize: 4096,
            },
            buf_pool: crate::config::PoolConfig {
                objtotal: 64,
                objsize: 2048,
            },
        }
    }

    #[test]
    fn rings_create_skips_krings_with_no_users() {
        let d = GlobalDomain::new(2);
        d.config(small_cfg()).unwrap();
        d.finalize(-1).unwrap();
        let spec = RingSetSpec {
            name: "eth0".into(),
            tx_rings: 1,
            rx_rings: 1,
            tx_descs: 8,
            rx_descs: 8,
            host_rings: false,
        };
        let mut rs = RingSet::if_new(&d, &spec).unwrap();
        rs.rings_create(&d, 8, 8).unwrap();
        assert!(rs.tx[0].lock().unwrap().ring.is_none());
    }

    #[test]
    fn rings_create_backs_krings_with_users() {
        let d = GlobalDomain::new(2);
        d.config(small_cfg()).unwrap();
        d.finalize(-1).unwrap();
        let spec = RingSetSpec {
            name: "eth0".into(),
            tx_rings: 1,
            rx_rings: 1,
            tx_descs: 8,
            rx_descs: 8,
            host_rings: false,
        };
        let mut rs = RingSet::if_new(&d, &spec).unwrap();
        rs.tx[0].lock().unwrap().users = 1;
        rs.rings_create(&d, 8, 8).unwrap();
        assert_eq!(rs.tx[0].lock().unwrap().nkr_num_slots, 8);
        rs.tx[0].lock().unwrap().users = 0;
        rs.rings_delete(&d).unwrap();
        assert!(rs.tx[0].lock().unwrap().ring.is_none());
    }

    #[test]
    fn rings_delete_keeps_rings_still_needed() {
        let d = GlobalDomain::new(2);
        d.config(small_cfg()).unwrap();
        d.finalize(-1).unwrap();
        let spec = RingSetSpec {
            name: "eth0".into(),
            tx_rings: 1,
            rx_rings: 1,
            tx_descs: 8,
            rx_descs: 8,
            host_rings: false,
        };
        let mut rs = RingSet::if_new(&d, &spec).unwrap();
        rs.tx[0].lock().unwrap().flags.insert(KringFlags::NEEDRING);
        rs.rings_create(&d, 8, 8).unwrap();
        rs.rings_delete(&d).unwrap();
        assert!(rs.tx[0].lock().unwrap().ring.is_some());
    }
}
