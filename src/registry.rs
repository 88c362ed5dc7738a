//! Process-wide domain registry.
//!
//! A real kernel module threads this as a circular doubly-linked list so
//! that "next free id after the last-assigned one" falls out of list
//! traversal. This is modeled instead as an id→handle map plus a cursor
//! remembering the last-assigned id, which preserves the same "first gap
//! in the wrap-around sequence" assignment rule without unsafe intrusive
//! links.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::domain::{GlobalDomain, MemoryDomain};
use crate::error::{Error, NmResult};

/// Reserved: id `0` is never assigned.
const RESERVED_ID: u16 = 0;
/// The always-present sentinel global domain's id.
pub const GLOBAL_DOMAIN_ID: u16 = 1;

struct State {
    domains: HashMap<u16, Arc<dyn MemoryDomain>>,
    cursor: u16,
}

/// Process-wide registry of memory domains, guarded by a single mutex.
pub struct DomainRegistry {
    state: Mutex<State>,
}

impl Default for DomainRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DomainRegistry {
    /// Create a registry pre-populated with the sentinel global domain at
    /// id 1.
    pub fn new() -> Self {
        let mut domains: HashMap<u16, Arc<dyn MemoryDomain>> = HashMap::new();
        domains.insert(GLOBAL_DOMAIN_ID, Arc::new(GlobalDomain::new(GLOBAL_DOMAIN_ID)));
        DomainRegistry {
            state: Mutex::new(State {
                domains,
                cursor: GLOBAL_DOMAIN_ID,
            }),
        }
    }

    /// Register `domain` under a freshly assigned id, walking the
    /// wrap-around sequence from the cursor for the first gap. Fails with
    /// `OutOfMemory` if every id in `[1, u16::MAX]` is taken.
    pub fn insert(&self, domain: Arc<dyn MemoryDomain>) -> NmResult<u16> {
        let mut state = self.state.lock().unwrap();
        let start = state.cursor;
        let mut candidate = start;
        for _ in 0..u16::MAX {
            candidate = candidate.wrapping_add(1);
            if candidate == RESERVED_ID {
                candidate = candidate.wrapping_add(1);
            }
            if !state.domains.contains_key(&candidate) {
                state.domains.insert(candidate, domain);
                state.cursor = candidate;
                return Ok(candidate);
            }
        }
        Err(Error::OutOfMemory("no free domain id".into()))
    }

    /// Look up a domain by id, incrementing its reference count unless it
    /// is `HIDDEN`.
    pub fn lookup(&self, id: u16) -> NmResult<Arc<dyn MemoryDomain>> {
        let state = self.state.lock().unwrap();
        let domain = state
            .domains
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::PeerNotFound(format!("no domain with id {id}")))?;
        let info = domain.get_info();
        if info.flags.contains(crate::domain::DomainFlags::HIDDEN) {
            return Err(Error::PeerNotFound(format!("domain {id} is hidden")));
        }
        domain.get();
        Ok(domain)
    }

    /// Release one reference to domain `id`; if it drops to zero, call
    /// `delete` and remove it from the registry.
    pub fn release(&self, id: u16) {
        let mut state = self.state.lock().unwrap();
        let Some(domain) = state.domains.get(&id).cloned() else {
            return;
        };
        if domain.put() {
            domain.delete();
            state.domains.remove(&id);
        }
    }

    /// Number of domains currently registered.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().domains.len()
    }

    /// Whether the registry holds no domains (never true: the sentinel is
    /// always present).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Group the currently registered domain ids by their adopted IOMMU
    /// group. Domains with no group (`-1`) are omitted.
    pub fn group_by_iommu(&self) -> HashMap<i32, Vec<u16>> {
        let state = self.state.lock().unwrap();
        let mut groups: HashMap<i32, Vec<u16>> = HashMap::new();
        for (&id, domain) in state.domains.iter() {
            let info = domain.get_info();
            if info.iommu_group != -1 {
                groups.entry(info.iommu_group).or_default().push(id);
            }
        }
        groups
    }
}
