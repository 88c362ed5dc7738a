//! A kernel-resident memory allocator and ring-fabric core for zero-copy
//! packet I/O, in the shape of `netmap`'s allocator and pipe/veth peer
//! protocol.
//!
//! # What this crate models
//!
//! - A three-pool slab allocator ([`pool`]) that carves `netmap_if`,
//!   `netmap_ring`, and packet-buffer objects out of physically contiguous,
//!   page-aligned clusters.
//! - A [`domain`] that bundles the three pools behind a shared
//!   configure/finalize/deref lifecycle and an operations vtable, with an
//!   owning ([`domain::GlobalDomain`]) and a non-owning
//!   ([`passthrough::PassthroughDomain`]) variant.
//! - A process-wide [`registry`] of domains keyed by a 16-bit id.
//! - A per-adapter [`ring`] fabric that allocates the `netmap_if` +
//!   `netmap_ring[]` + `netmap_slot[]` layout userspace would mmap.
//! - A [`pipe`] protocol that cross-links a pair of adapters' krings and
//!   exchanges packets by swapping slot descriptors under an explicit
//!   memory-barrier discipline, rather than copying bytes.
//! - [`adapter`] lifecycle glue: attach/detach, idempotent ring creation
//!   across a peer, and IOMMU-group compatibility checks.
//!
//! # Example
//!
//! ```
//! use netmap_core::prelude::*;
//!
//! let domain = GlobalDomain::new(2);
//! domain.config(DomainConfig::default()).unwrap();
//! domain.finalize(-1).unwrap();
//! let info = domain.get_info();
//! assert!(info.nm_totalsize > 0);
//! ```

#![warn(missing_docs)]

#[macro_use]
extern crate thiserror;

/// Shared sizing constants (cache line, page size, cluster ceiling, buffer defaults).
pub mod consts;
/// Error types for the allocator, domain, registry, and ring-fabric control plane.
pub mod error;
/// Bit-exact ABI layout of the shared memory region (`netmap_if`/`netmap_ring`/`netmap_slot`).
pub mod abi;
/// The slab-style object pool allocator.
pub mod pool;
/// Pool/domain/adapter configuration surfaces and their sizing formulas.
pub mod config;
/// Memory domain: pool bundle, lifecycle, and operations vtable.
pub mod domain;
/// The non-owning (passthrough/guest) domain variant.
pub mod passthrough;
/// Process-wide domain registry.
pub mod registry;
/// Per-adapter kring state and ring-fabric construction.
pub mod ring;
/// Peer-pipe cross-linking and txsync/rxsync.
pub mod pipe;
/// Adapter attach/detach lifecycle glue.
pub mod adapter;

pub use crate::error::{Error, NmResult};

/// Commonly used types, re-exported for convenience.
///
/// ```
/// use netmap_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::abi::{NetmapIfHeader, NetmapRingHeader, NetmapSlot, RingDir};
    pub use crate::adapter::Adapter;
    pub use crate::config::{AdapterConfig, DomainConfig, DomainConfigBuilder, PoolBounds, PoolConfig};
    pub use crate::domain::{DomainFlags, DomainInfo, GlobalDomain, IfHandle, MemoryDomain, RingHandle};
    pub use crate::error::{Error, NmResult};
    pub use crate::passthrough::{BarRegisters, PassthroughDomain};
    pub use crate::pool::{LutEntry, Pool, PoolKind};
    pub use crate::registry::DomainRegistry;
    pub use crate::ring::{Kring, KringFlags, RingSet, RingSetSpec};
}
