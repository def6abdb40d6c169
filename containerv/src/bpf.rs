//! Process-wide BPF-LSM manager.
//!
//! One manager is created at daemon startup and passed down explicitly;
//! concurrent containers share its map, which has a bounded capacity of
//! container slots. On kernels without BPF-LSM support (pre-5.7, or
//! built without `CONFIG_BPF_LSM`) the manager degrades to seccomp-only
//! enforcement and logs a warning once.

use std::collections::HashSet;
use std::fs;
use std::sync::Mutex;

use tracing::warn;

use crate::{Error, Result};

/// Enforcement mode the manager settled on at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enforcement {
    /// BPF-LSM programs plus seccomp.
    BpfLsm,
    /// Seccomp only (kernel lacks BPF-LSM).
    SeccompOnly,
}

/// Shared BPF state for all containers in the daemon.
#[derive(Debug)]
pub struct BpfManager {
    /// Active enforcement mode.
    enforcement: Enforcement,
    /// Map capacity, in containers.
    capacity: usize,
    /// Container ids currently holding map entries.
    slots: Mutex<HashSet<String>>,
}

/// Default shared-map capacity in container slots.
const DEFAULT_CAPACITY: usize = 64;

impl BpfManager {
    /// Probes the running kernel and initializes the manager.
    ///
    /// Called once at daemon startup; the result is passed down to every
    /// container create.
    pub fn init() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Initializes with an explicit slot capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let enforcement = if bpf_lsm_available() {
            Enforcement::BpfLsm
        } else {
            warn!("BPF-LSM unavailable; falling back to seccomp-only enforcement");
            Enforcement::SeccompOnly
        };
        Self {
            enforcement,
            capacity,
            slots: Mutex::new(HashSet::new()),
        }
    }

    /// Active enforcement mode.
    pub const fn enforcement(&self) -> Enforcement {
        self.enforcement
    }

    /// Reserves a map slot for a container.
    ///
    /// Each container consumes a fixed number of entries; the map is
    /// bounded, so reservation can fail when the daemon is full.
    pub fn reserve(&self, container_id: &str) -> Result<()> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| Error::Backend("bpf slot lock poisoned".into()))?;
        if slots.len() >= self.capacity && !slots.contains(container_id) {
            return Err(Error::BpfExhausted {
                capacity: self.capacity,
            });
        }
        slots.insert(container_id.to_owned());
        Ok(())
    }

    /// Releases a container's map slot.
    pub fn release(&self, container_id: &str) {
        if let Ok(mut slots) = self.slots.lock() {
            slots.remove(container_id);
        }
    }

    /// Explicit shutdown; verifies every slot was released.
    pub fn shutdown(self) {
        if let Ok(slots) = self.slots.lock()
            && !slots.is_empty()
        {
            warn!(leaked = slots.len(), "bpf slots leaked at shutdown");
        }
    }
}

/// Returns `true` when the running kernel has BPF-LSM active.
fn bpf_lsm_available() -> bool {
    fs::read_to_string("/sys/kernel/security/lsm")
        .map(|lsms| lsms.split(',').any(|l| l == "bpf"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_release_cycle() {
        let mgr = BpfManager::with_capacity(2);
        mgr.reserve("a").unwrap();
        mgr.reserve("b").unwrap();
        assert!(matches!(
            mgr.reserve("c"),
            Err(Error::BpfExhausted { capacity: 2 })
        ));
        mgr.release("a");
        mgr.reserve("c").unwrap();
    }

    #[test]
    fn reserve_is_idempotent_per_container() {
        let mgr = BpfManager::with_capacity(1);
        mgr.reserve("a").unwrap();
        mgr.reserve("a").unwrap();
    }
}
