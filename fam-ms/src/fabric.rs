//! Tracks which `fam_rdma::Key` the fabric provider issued for each
//! locally-hosted region, so RDMA data-path requests arriving from
//! clients or from CIS-directed copy/backup operations can be resolved
//! to a registered buffer (spec.md §4.2, Design Note §9).

use std::collections::HashMap;
use std::sync::Arc;

use fam_common::error::{FamError, FamResult};
use fam_rdma::provider::{FabricProvider, Key};
use parking_lot::RwLock;

pub struct FabricRegistry<P: FabricProvider> {
    node_id: u64,
    provider: Arc<P>,
    keys: RwLock<HashMap<u64, Key>>,
}

impl<P: FabricProvider> FabricRegistry<P> {
    pub fn new(node_id: u64, provider: Arc<P>) -> Self {
        FabricRegistry {
            node_id,
            provider,
            keys: RwLock::new(HashMap::new()),
        }
    }

    pub fn provider(&self) -> Arc<P> {
        Arc::clone(&self.provider)
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    /// Registers `len` bytes for `region_id` and remembers the key
    /// returned. Re-registering an already-known region replaces the
    /// old key (used by `resize_region`).
    pub fn register_region(&self, region_id: u64, len: usize) -> Key {
        let key = self.provider.register(self.node_id, len);
        self.keys.write().insert(region_id, key);
        key
    }

    pub fn deregister_region(&self, region_id: u64) {
        if let Some(key) = self.keys.write().remove(&region_id) {
            self.provider.deregister(self.node_id, key);
        }
    }

    pub fn key_for(&self, region_id: u64) -> FamResult<Key> {
        self.keys
            .read()
            .get(&region_id)
            .copied()
            .ok_or(FamError::RegionNotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fam_rdma::provider::LoopbackProvider;

    #[test]
    fn registering_a_region_makes_its_key_resolvable() {
        let registry = FabricRegistry::new(0, Arc::new(LoopbackProvider::new()));
        registry.register_region(1, 4096);
        assert!(registry.key_for(1).is_ok());
    }

    #[test]
    fn deregistering_forgets_the_key() {
        let registry = FabricRegistry::new(0, Arc::new(LoopbackProvider::new()));
        registry.register_region(1, 4096);
        registry.deregister_region(1);
        assert!(registry.key_for(1).is_err());
    }
}
