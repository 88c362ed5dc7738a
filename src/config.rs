//! Configuration surfaces for pools, domains, and private per-adapter
//! allocators.
//!
//! Follows the same fluent-builder idiom as `NetmapBuilder`: construct,
//! chain setters, call `build()`/`derive_pools()` to validate and
//! materialize.

use crate::abi::{NetmapRingHeader, NetmapSlot};
use crate::consts::{DEFAULT_BUF_OBJSIZE, NETMAP_BUF_MAX_NUM};
use crate::pool::PoolKind;

/// Per-object-size/count bounds a pool of a given [`PoolKind`] enforces.
#[derive(Debug, Clone, Copy)]
pub struct PoolBounds {
    /// Smallest permitted (pre-rounding) object size.
    pub objminsize: u32,
    /// Largest permitted object size.
    pub objmaxsize: u32,
    /// Smallest permitted object total.
    pub nummin: u32,
    /// Largest permitted object total.
    pub nummax: u32,
}

impl PoolBounds {
    /// Bounds used by the global domain for each pool kind.
    pub fn for_kind(kind: PoolKind) -> Self {
        match kind {
            PoolKind::If => PoolBounds {
                objminsize: 64,
                objmaxsize: 64 * 1024,
                nummin: 2,
                nummax: 1_000_000,
            },
            PoolKind::Ring => PoolBounds {
                objminsize: 64,
                objmaxsize: 4 * 1024 * 1024,
                nummin: 2,
                nummax: 1_000_000,
            },
            PoolKind::Buf => PoolBounds {
                objminsize: 64,
                objmaxsize: 64 * 1024,
                nummin: 4,
                nummax: 10_000_000,
            },
        }
    }
}

/// A single pool's requested `(objtotal, objsize)`.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Requested object count.
    pub objtotal: u32,
    /// Requested per-object size, before cache-line rounding.
    pub objsize: u32,
}

/// The three pool requests that make up one domain's configuration.
#[derive(Debug, Clone, Copy)]
pub struct DomainConfig {
    /// IF pool request.
    pub if_pool: PoolConfig,
    /// RING pool request.
    pub ring_pool: PoolConfig,
    /// BUF pool request.
    pub buf_pool: PoolConfig,
}

impl Default for DomainConfig {
    /// Defaults sized so `pool[IF].memtotal >= 100*1024`,
    /// `pool[RING].memtotal >= 200*9*4096`, and `pool[BUF]._objsize == 2048`
    /// with `pool[BUF]._objtotal >= NETMAP_BUF_MAX_NUM`.
    fn default() -> Self {
        DomainConfig {
            if_pool: PoolConfig {
                objtotal: 100,
                objsize: 1024,
            },
            ring_pool: PoolConfig {
                objtotal: 200,
                objsize: 9 * 4096,
            },
            buf_pool: PoolConfig {
                objtotal: NETMAP_BUF_MAX_NUM,
                objsize: DEFAULT_BUF_OBJSIZE,
            },
        }
    }
}

impl DomainConfig {
    /// Look up the request for a given pool kind.
    pub fn get(&self, kind: PoolKind) -> PoolConfig {
        match kind {
            PoolKind::If => self.if_pool,
            PoolKind::Ring => self.ring_pool,
            PoolKind::Buf => self.buf_pool,
        }
    }
}

/// Fluent builder over [`DomainConfig`], for hand-tuning a global domain's
/// pool sizes (as opposed to a private per-adapter allocator, which is
/// sized automatically by [`AdapterConfig::derive_pools`]).
#[derive(Debug, Clone, Copy, Default)]
pub struct DomainConfigBuilder {
    cfg: DomainConfig,
}

impl DomainConfigBuilder {
    /// Start from the crate defaults.
    pub fn new() -> Self {
        Self {
            cfg: DomainConfig::default(),
        }
    }

    /// Override the IF pool's `(objtotal, objsize)`.
    pub fn if_pool(mut self, objtotal: u32, objsize: u32) -> Self {
        self.cfg.if_pool = PoolConfig { objtotal, objsize };
        self
    }

    /// Override the RING pool's `(objtotal, objsize)`.
    pub fn ring_pool(mut self, objtotal: u32, objsize: u32) -> Self {
        self.cfg.ring_pool = PoolConfig { objtotal, objsize };
        self
    }

    /// Override the BUF pool's `(objtotal, objsize)`.
    pub fn buf_pool(mut self, objtotal: u32, objsize: u32) -> Self {
        self.cfg.buf_pool = PoolConfig { objtotal, objsize };
        self
    }

    /// Finish building.
    pub fn build(self) -> DomainConfig {
        self.cfg
    }
}

/// Per-adapter override from which a private allocator's three pool sizes
/// are derived.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdapterConfig {
    /// Requested non-host TX rings.
    pub tx_rings: u32,
    /// Descriptors per TX ring.
    pub tx_descs: u32,
    /// Requested non-host RX rings.
    pub rx_rings: u32,
    /// Descriptors per RX ring.
    pub rx_descs: u32,
    /// Extra buffers reserved beyond per-ring descriptors.
    pub extra_bufs: u32,
    /// Number of netmap pipes this adapter will host.
    pub n_pipes: u32,
}

impl AdapterConfig {
    /// Builder-style constructor with all-zero/default fields.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set ring counts and per-ring descriptor counts.
    pub fn rings(mut self, tx_rings: u32, tx_descs: u32, rx_rings: u32, rx_descs: u32) -> Self {
        self.tx_rings = tx_rings;
        self.tx_descs = tx_descs;
        self.rx_rings = rx_rings;
        self.rx_descs = rx_descs;
        self
    }

    /// Set the number of extra (unassigned) buffers to reserve.
    pub fn extra_bufs(mut self, n: u32) -> Self {
        self.extra_bufs = n;
        self
    }

    /// Set the number of netmap pipes hosted by this adapter.
    pub fn n_pipes(mut self, n: u32) -> Self {
        self.n_pipes = n;
        self
    }

    /// Derive the three pool sizes a private allocator needs to satisfy
    /// this adapter:
    ///
    /// ```text
    /// IF size   >= header + (tx_rings+rx_rings)*offset
    /// IF num    >= 2 + 4*n_pipes
    /// RING size >= header + max(tx_descs, rx_descs)*slot
    /// RING num  >= tx_rings + rx_rings + 8*n_pipes
    /// BUF num   >= (4*n_pipes+rx_rings)*rx_descs + (4*n_pipes+tx_rings)*tx_descs + 2 + extra_bufs
    /// ```
    pub fn derive_pools(&self) -> DomainConfig {
        let n_rings = self.tx_rings + self.rx_rings;
        let if_size = crate::abi::if_block_size(n_rings as usize) as u32;
        let if_num = 2 + 4 * self.n_pipes;

        let max_descs = self.tx_descs.max(self.rx_descs);
        let ring_size = core::mem::size_of::<NetmapRingHeader>() as u32
            + max_descs * core::mem::size_of::<NetmapSlot>() as u32;
        let ring_num = self.tx_rings + self.rx_rings + 8 * self.n_pipes;

        let buf_num = (4 * self.n_pipes + self.rx_rings) * self.rx_descs
            + (4 * self.n_pipes + self.tx_rings) * self.tx_descs
            + 2
            + self.extra_bufs;

        DomainConfig {
            if_pool: PoolConfig {
                objtotal: if_num,
                objsize: if_size,
            },
            ring_pool: PoolConfig {
                objtotal: ring_num,
                objsize: ring_size,
            },
            buf_pool: PoolConfig {
                objtotal: buf_num,
                objsize: DEFAULT_BUF_OBJSIZE,
            },
        }
    }
}
