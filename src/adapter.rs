//! Lifecycle integration: attach/detach, idempotent ring creation across a
//! peer, and the IOMMU-group compatibility check.

use std::sync::Arc;

use crate::domain::MemoryDomain;
use crate::error::NmResult;
use crate::pipe;
use crate::ring::{RingSet, RingSetSpec};

/// A netmap-capable interface: a physical NIC, a virtual port, or one end
/// of a netmap pipe.
pub struct Adapter {
    name: String,
    domain: Arc<dyn MemoryDomain>,
    iommu_group: i32,
    tx_descs: u32,
    rx_descs: u32,
    rings: Option<RingSet>,
    attached: bool,
}

impl Adapter {
    /// Construct an adapter backed by `domain`, not yet attached.
    pub fn new(name: impl Into<String>, domain: Arc<dyn MemoryDomain>, iommu_group: i32) -> Self {
        Adapter {
            name: name.into(),
            domain,
            iommu_group,
            tx_descs: 0,
            rx_descs: 0,
            rings: None,
            attached: false,
        }
    }

    /// Interface name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this adapter currently has a ring set.
    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Attach to the memory domain: finalize it under this adapter's IOMMU
    /// group, then allocate the `netmap_if` block.
    /// Idempotent: calling twice on an already-attached adapter is a no-op.
    pub fn attach(&mut self, tx_rings: u32, rx_rings: u32, tx_descs: u32, rx_descs: u32, host_rings: bool) -> NmResult<()> {
        if self.attached {
            return Ok(());
        }
        self.domain.finalize(self.iommu_group)?;
        let spec = RingSetSpec {
            name: self.name.clone(),
            tx_rings,
            rx_rings,
            tx_descs,
            rx_descs,
            host_rings,
        };
        self.rings = Some(RingSet::if_new(self.domain.as_ref(), &spec)?);
        self.tx_descs = tx_descs;
        self.rx_descs = rx_descs;
        self.attached = true;
        Ok(())
    }

    /// Detach from the memory domain: free any remaining rings, free the
    /// `netmap_if` block, and deref the domain.
    /// Idempotent: detaching an already-detached adapter is a no-op.
    pub fn detach(&mut self) -> NmResult<()> {
        let Some(rings) = self.rings.take() else {
            return Ok(());
        };
        let mut rings = rings;
        rings.rings_delete(self.domain.as_ref())?;
        rings.if_delete(self.domain.as_ref())?;
        self.domain.deref();
        self.attached = false;
        Ok(())
    }

    /// Ring set, once attached.
    pub fn rings(&self) -> Option<&RingSet> {
        self.rings.as_ref()
    }

    /// Mutable ring set, once attached.
    pub fn rings_mut(&mut self) -> Option<&mut RingSet> {
        self.rings.as_mut()
    }

    /// Register this adapter's rings on, cross-linking with `peer` first if
    /// the two are not yet linked and creating any ring the peer now needs.
    pub fn register_on(&mut self, peer: Option<&mut Adapter>) -> NmResult<()> {
        let (tx_descs, rx_descs) = (self.tx_descs, self.rx_descs);
        let Some(rs) = self.rings.as_mut() else {
            return Ok(());
        };
        if let Some(peer) = peer {
            if let Some(peer_rs) = peer.rings.as_mut() {
                pipe::cross_link(rs, peer_rs);
            }
        }
        pipe::register_on(self.domain.as_ref(), rs, tx_descs, rx_descs)
    }

    /// Register this adapter's rings off.
    pub fn register_off(&mut self) -> NmResult<()> {
        let Some(rs) = self.rings.as_mut() else {
            return Ok(());
        };
        pipe::register_off(self.domain.as_ref(), rs)
    }

    /// Create this adapter's krings and its peer's, cross-linking them.
    /// Both adapters must already be attached.
    pub fn krings_create_with(&mut self, peer: &mut Adapter) -> NmResult<()> {
        let (tx_descs, rx_descs) = (self.tx_descs, self.rx_descs);
        let (Some(a), Some(b)) = (self.rings.as_mut(), peer.rings.as_mut()) else {
            return Ok(());
        };
        pipe::krings_create(self.domain.as_ref(), a, b, tx_descs, rx_descs)
    }
}
