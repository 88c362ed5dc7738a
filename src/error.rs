//! Error types for the netmap allocator and ring-fabric core.

use thiserror::Error;

/// Result alias used throughout the crate's control-plane API.
pub type NmResult<T> = Result<T, Error>;

/// Errors produced by the allocator, domain, registry, and ring-fabric
/// control-plane operations.
///
/// Data-plane operations (`txsync`/`rxsync`) never return `Error`: per the
/// protocol they return a plain slot count and never block (see
/// [`crate::pipe`]).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A pool or domain configuration request was out of range.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Cluster, lut, or bitmap allocation failed.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// Two adapters attached to the same domain disagree on IOMMU group.
    #[error("iommu group mismatch: domain has group {domain_group}, adapter has {adapter_group}")]
    GroupMismatch {
        /// Group id already recorded on the domain.
        domain_group: i32,
        /// Group id the attaching adapter presented.
        adapter_group: i32,
    },

    /// A pipe/veth peer adapter could not be located.
    #[error("peer adapter not found: {0}")]
    PeerNotFound(String),

    /// A query was made against a domain or pool that has not been finalized.
    #[error("not finalized")]
    NotFinalized,

    /// A buffer index was freed twice.
    #[error("double free of index {0}")]
    DoubleFree(u32),

    /// An index was out of range, or was one of the two reserved scratch
    /// indices (0, 1) of the buffer pool.
    #[error("bad index {index} (objtotal={objtotal})")]
    BadIndex {
        /// The index that was rejected.
        index: u32,
        /// The pool's current object total, for context.
        objtotal: u32,
    },

    /// A virtual address or byte offset fell outside every pool's region.
    #[error("offset/address outside all pools")]
    BadOffset,

    /// A configuration change was attempted while the domain has active
    /// users; this is not a hard failure, it is a silent no-op that
    /// replays the last recorded error (if any).
    #[error("domain busy: {0} active user(s)")]
    Busy(u32),
}
