//! The peer-pipe protocol: cross-linking two adapters' krings and the
//! txsync/rxsync slot-swap exchange between them.

use std::sync::atomic::{fence, Ordering};
use std::sync::{Arc, Mutex};

use crate::abi::{NetmapRingHeader, NetmapSlot};
use crate::domain::{MemoryDomain, RingHandle};
use crate::error::{Error, NmResult};
use crate::ring::{Kring, KringFlags, RingSet};

/// Cross-link two adapters so each kring's `pipe` points at its
/// counterpart: TX of `a` ↔ RX of `b`, and TX of `b` ↔ RX of `a`.
/// Idempotent: re-linking the same pair just overwrites the same weak
/// references.
pub fn cross_link(a: &RingSet, b: &RingSet) {
    let a_to_b = (a.ifh.tx_rings as usize).min(b.ifh.rx_rings as usize);
    for (ta, rb) in a.tx[..a_to_b].iter().zip(b.rx[..a_to_b].iter()) {
        link_pair(ta, rb);
    }
    let b_to_a = (b.ifh.tx_rings as usize).min(a.ifh.rx_rings as usize);
    for (tb, ra) in b.tx[..b_to_a].iter().zip(a.rx[..b_to_a].iter()) {
        link_pair(tb, ra);
    }
}

fn link_pair(x: &Arc<Mutex<Kring>>, y: &Arc<Mutex<Kring>>) {
    x.lock().unwrap().pipe = Some(Arc::downgrade(y));
    y.lock().unwrap().pipe = Some(Arc::downgrade(x));
}

/// `true` if any kring in `rs` is flagged `NEEDRING` by its peer.
fn krings_needed(rs: &RingSet) -> bool {
    rs.tx
        .iter()
        .chain(rs.rx.iter())
        .any(|k| k.lock().unwrap().flags.contains(KringFlags::NEEDRING))
}

/// Create `a`'s krings, then `b`'s (if not already created), then
/// cross-link the pair. Rolls back `a`'s krings if creating `b`'s fails.
pub fn krings_create(
    domain: &dyn MemoryDomain,
    a: &mut RingSet,
    b: &mut RingSet,
    tx_descs: u32,
    rx_descs: u32,
) -> NmResult<()> {
    a.rings_create(domain, tx_descs, rx_descs)?;
    if let Err(e) = b.rings_create(domain, tx_descs, rx_descs) {
        let _ = a.rings_delete(domain);
        return Err(e);
    }
    cross_link(a, b);
    Ok(())
}

/// No-op if the peer still needs `a`'s rings; otherwise deletes both sides'
/// krings.
pub fn krings_delete(domain: &dyn MemoryDomain, a: &mut RingSet, b: &mut RingSet) -> NmResult<()> {
    if krings_needed(a) {
        return Ok(());
    }
    a.rings_delete(domain)?;
    b.rings_delete(domain)?;
    Ok(())
}

/// Register the adapter's rings on: flags the peer's corresponding kring
/// `NEEDRING`, creates any ring the peer now requires, then marks every
/// local kring `NETMAP_ON`.
pub fn register_on(domain: &dyn MemoryDomain, rs: &mut RingSet, tx_descs: u32, rx_descs: u32) -> NmResult<()> {
    for k in rs.tx.iter().chain(rs.rx.iter()) {
        let peer = k.lock().unwrap().peer();
        if let Some(peer) = peer {
            peer.lock().unwrap().flags.insert(KringFlags::NEEDRING);
        }
        k.lock().unwrap().users += 1;
    }
    rs.rings_create(domain, tx_descs, rx_descs)?;
    for k in rs.tx.iter().chain(rs.rx.iter()) {
        k.lock().unwrap().flags.insert(KringFlags::NETMAP_ON);
    }
    Ok(())
}

/// Register the adapter's rings off. Idempotent: a kring already off is
/// left untouched, so a second call changes nothing.
pub fn register_off(domain: &dyn MemoryDomain, rs: &mut RingSet) -> NmResult<()> {
    for k in rs.tx.iter().chain(rs.rx.iter()) {
        let mut kk = k.lock().unwrap();
        if !kk.flags.contains(KringFlags::NETMAP_ON) {
            continue;
        }
        kk.flags.remove(KringFlags::NETMAP_ON);
        kk.users = kk.users.saturating_sub(1);
        let peer = kk.peer();
        drop(kk);
        if let Some(peer) = peer {
            peer.lock().unwrap().flags.remove(KringFlags::NEEDRING);
        }
    }
    rs.rings_delete(domain)
}

unsafe fn slot_ptr(rh: &RingHandle, i: u32) -> *mut NetmapSlot {
    (rh.vaddr + core::mem::size_of::<NetmapRingHeader>() + i as usize * core::mem::size_of::<NetmapSlot>())
        as *mut NetmapSlot
}

/// Exchange slot descriptors between `tx` and its cross-linked peer RX
/// kring, advancing both sides' indices. Returns
/// the number of slots exchanged; `0` if the carrier is down (no ring on
/// either side) or the peer has been torn down.
pub fn txsync(tx: &Arc<Mutex<Kring>>) -> NmResult<u32> {
    let peer = tx.lock().unwrap().peer();
    let Some(rx) = peer else {
        return Ok(0);
    };

    let mut t = tx.lock().unwrap();
    let mut r = rx.lock().unwrap();

    let (Some(t_ring), Some(r_ring)) = (t.ring.clone(), r.ring.clone()) else {
        return Ok(0);
    };

    let num_slots_t = t.nkr_num_slots;
    let num_slots_r = r.nkr_num_slots;
    let head = t.rhead;

    // Barrier 1: see the peer's latest hwcur release before reading it or
    // walking its slots.
    fence(Ordering::Acquire);

    let peer_hwtail_lim = (r.nr_hwcur + num_slots_r - 1) % num_slots_r;

    let mut nm_i = t.nr_hwcur;
    let mut nm_j = r.nr_hwtail;
    let mut n = 0u32;

    while nm_i != head && nm_j != peer_hwtail_lim {
        // SAFETY: both rings were allocated with at least `nkr_num_slots`
        // NetmapSlot entries immediately after their header, and remain
        // valid for as long as each kring holds `ring: Some(..)` (checked
        // just above, under this same lock).
        unsafe {
            std::ptr::swap(slot_ptr(&t_ring, nm_i), slot_ptr(&r_ring, nm_j));
        }
        nm_i = (nm_i + 1) % num_slots_t;
        nm_j = (nm_j + 1) % num_slots_r;
        n += 1;
    }

    // Barrier 2: slot contents must be visible before the peer observes hwtail advance.
    fence(Ordering::Release);
    t.nr_hwcur = nm_i;
    r.nr_hwtail = nm_j;
    // Barrier 3: publish hwtail/hwcur before reclaiming for the sender.
    fence(Ordering::Release);

    t.nr_hwtail = (t.nr_hwtail + n) % num_slots_t;

    if n > 0 {
        r.notify();
    }
    Ok(n)
}

/// Advance `r.nr_hwcur` to `r.rhead`, releasing consumed slots, and wake
/// the peer TX kring if anything changed.
pub fn rxsync(rx: &Arc<Mutex<Kring>>) -> NmResult<()> {
    let peer = rx.lock().unwrap().peer();
    let mut r = rx.lock().unwrap();
    let old = r.nr_hwcur;
    fence(Ordering::Release);
    r.nr_hwcur = r.rhead;
    let changed = r.nr_hwcur != old;
    drop(r);
    if changed {
        if let Some(peer) = peer {
            peer.lock().unwrap().notify();
        } else {
            return Err(Error::PeerNotFound("rxsync: no peer to notify".into()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::RingDir;
    use crate::config::DomainConfig;
    use crate::domain::GlobalDomain;
    use crate::ring::RingSetSpec;

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
                objtotal: 256,
                objsize: 2048,
            },
        }
    }

    fn peered_rings(d: &GlobalDomain) -> (RingSet, RingSet) {
        let spec_a = RingSetSpec {
            name: "pipe0{0".into(),
            tx_rings: 1,
            rx_rings: 1,
            tx_descs: 64,
            rx_descs: 64,
            host_rings: false,
        };
        let spec_b = RingSetSpec {
            name: "pipe0{1".into(),
            tx_rings: 1,
            rx_rings: 1,
            tx_descs: 64,
            rx_descs: 64,
            host_rings: false,
        };
        let mut a = RingSet::if_new(d, &spec_a).unwrap();
        let mut b = RingSet::if_new(d, &spec_b).unwrap();
        a.tx[0].lock().unwrap().users = 1;
        a.rx[0].lock().unwrap().users = 1;
        b.tx[0].lock().unwrap().users = 1;
        b.rx[0].lock().unwrap().users = 1;
        krings_create(d, &mut a, &mut b, 64, 64).unwrap();
        (a, b)
    }

    #[test]
    fn cross_link_is_symmetric() {
        let d = GlobalDomain::new(2);
        d.config(small_cfg()).unwrap();
        d.finalize(-1).unwrap();
        let (a, b) = peered_rings(&d);
        let peer_of_a_tx = a.tx[0].lock().unwrap().peer().unwrap();
        assert!(std::ptr::eq(&*peer_of_a_tx as *const _, &*b.rx[0] as *const _));
        let back = peer_of_a_tx.lock().unwrap().peer().unwrap();
        assert!(std::ptr::eq(&*back as *const _, &*a.tx[0] as *const _));
    }

    #[test]
    fn txsync_swaps_slots_and_notifies_peer_once() {
        let d = GlobalDomain::new(2);
        d.config(small_cfg()).unwrap();
        d.finalize(-1).unwrap();
        let (a, b) = peered_rings(&d);

        let tx_ring = a.tx[0].lock().unwrap().ring.clone().unwrap();
        let rx_ring = b.rx[0].lock().unwrap().ring.clone().unwrap();
        unsafe {
            for i in 0..4u32 {
                std::ptr::write(
                    slot_ptr(&tx_ring, i),
                    NetmapSlot {
                        buf_idx: 10 + i,
                        len: 2048,
                        flags: 0,
                    },
                );
                std::ptr::write(
                    slot_ptr(&rx_ring, i),
                    NetmapSlot {
                        buf_idx: 20 + i,
                        len: 2048,
                        flags: 0,
                    },
                );
            }
        }
        a.tx[0].lock().unwrap().rhead = 4;

        let n = txsync(&a.tx[0]).unwrap();
        assert_eq!(n, 4);

        unsafe {
            for i in 0..4u32 {
                let t = std::ptr::read(slot_ptr(&tx_ring, i));
                let r = std::ptr::read(slot_ptr(&rx_ring, i));
                assert_eq!(t.buf_idx, 20 + i);
                assert_eq!(r.buf_idx, 10 + i);
            }
        }
        assert_eq!(a.tx[0].lock().unwrap().nr_hwcur, 4);
        assert_eq!(b.rx[0].lock().unwrap().nr_hwtail, 4);
        assert_eq!(b.rx[0].lock().unwrap().notify_count, 1);
    }

    #[test]
    fn txsync_returns_zero_when_carrier_down() {
        let d = GlobalDomain::new(2);
        d.config(small_cfg()).unwrap();
        d.finalize(-1).unwrap();
        let spec_a = RingSetSpec {
            name: "pipe1{0".into(),
            tx_rings: 1,
            rx_rings: 1,
            tx_descs: 64,
            rx_descs: 64,
            host_rings: false,
        };
        let a = RingSet::if_new(&d, &spec_a).unwrap();
        // No peer cross-linked, no ring created: carrier is "down".
        assert_eq!(txsync(&a.tx[0]).unwrap(), 0);
    }

    #[test]
    fn register_off_twice_is_idempotent() {
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
        register_on(&d, &mut rs, 8, 8).unwrap();
        register_off(&d, &mut rs).unwrap();
        let users_after_first = rs.tx[0].lock().unwrap().users;
        let flags_after_first = rs.tx[0].lock().unwrap().flags;
        register_off(&d, &mut rs).unwrap();
        assert_eq!(rs.tx[0].lock().unwrap().users, users_after_first);
        assert_eq!(rs.tx[0].lock().unwrap().flags, flags_after_first);
    }

    #[test]
    fn krings_delete_is_no_op_while_peer_needs_ring() {
        let d = GlobalDomain::new(2);
        d.config(small_cfg()).unwrap();
        d.finalize(-1).unwrap();
        let (mut a, mut b) = peered_rings(&d);
        b.tx[0].lock().unwrap().flags.insert(KringFlags::NEEDRING);
        krings_delete(&d, &mut a, &mut b).unwrap();
        assert!(a.tx[0].lock().unwrap().ring.is_some());
    }

    #[test]
    fn ring_dir_round_trip_sanity() {
        assert_eq!(RingDir::Tx as u16, 0);
        assert_eq!(RingDir::Rx as u16, 1);
    }
}
