//! The Memory Server: local region storage, fabric registration
//! bookkeeping, the per-thread ATL worker pool, and the RPC-facing
//! atomic data-path service built on top of them (spec.md §2, §4).

pub mod admin;
pub mod allocator;
pub mod atl_pool;
pub mod fabric;
pub mod rpc_server;
pub mod service;

use std::path::PathBuf;
use std::sync::Arc;

use allocator::{RegionStore, StoreConfig};
use atl_pool::AtlPool;
use fabric::FabricRegistry;
use fam_common::error::FamResult;
use fam_common::model::DestroyStatus;
use fam_rdma::cas::CasLockTable;
use fam_rdma::provider::{AtomicOp, AtomicValue, FabricProvider};
use service::MemoryServerService;

pub struct MsConfig {
    pub node_id: u64,
    pub data_dir: PathBuf,
    pub num_atomic_threads: u32,
}

/// Bundles a memory server's state: local storage, fabric registration,
/// the ATL worker pool, and the RPC-facing service built from them.
pub struct MemoryServer<P: FabricProvider> {
    pub store: Arc<RegionStore>,
    pub fabric: FabricRegistry<P>,
    pub service: MemoryServerService,
}

impl<P: FabricProvider> MemoryServer<P> {
    pub fn start(config: MsConfig, provider: Arc<P>) -> FamResult<MemoryServer<P>> {
        let store = Arc::new(RegionStore::new(StoreConfig {
            data_dir: config.data_dir.clone(),
        }));
        let fabric = FabricRegistry::new(config.node_id, provider);
        let atl = AtlPool::start(&config.data_dir, config.num_atomic_threads, store.clone())?;
        let service = MemoryServerService {
            node_id: config.node_id,
            store: store.clone(),
            atl,
            cas_locks: CasLockTable::new(),
        };
        Ok(MemoryServer { store, fabric, service })
    }

    pub fn create_volatile_region(&self, region_id: u64, size: u64) -> FamResult<()> {
        self.store.create_volatile(region_id, size)?;
        self.fabric.register_region(region_id, size as usize);
        Ok(())
    }

    pub fn create_persistent_region(&self, region_id: u64, size: u64) -> FamResult<()> {
        self.store.create_persistent(region_id, size)?;
        self.fabric.register_region(region_id, size as usize);
        Ok(())
    }

    /// `RELEASED` deregisters the region from the fabric and frees its
    /// storage; `IN_USE` leaves both untouched so open clients keep working.
    pub fn destroy_region(&self, region_id: u64) -> FamResult<DestroyStatus> {
        let status = self.store.destroy(region_id)?;
        if status == DestroyStatus::Released {
            self.fabric.deregister_region(region_id);
        }
        Ok(status)
    }

    /// Grows this server's slice of a region and re-registers it with
    /// the fabric so existing clients' cached keys stay valid (the key
    /// itself may change; clients re-fetch it on next `open_region`).
    pub fn resize_region(&self, region_id: u64, new_size: u64) -> FamResult<()> {
        self.store.resize(region_id, new_size)?;
        self.fabric.register_region(region_id, new_size as usize);
        Ok(())
    }

    /// Server side of `open_region`: bumps the refcount that keeps this
    /// region's memory registered, and returns the fabric key a client
    /// caches in its `Fam_Region_Memory_Map`.
    pub fn open_region_handle(&self, region_id: u64) -> FamResult<u64> {
        self.store.open_handle(region_id)?;
        Ok(self.fabric.key_for(region_id)?.0)
    }

    pub fn close_region_handle(&self, region_id: u64) -> FamResult<()> {
        self.store.close_handle(region_id)
    }

    /// Direct fabric atomics against this server's own registered key —
    /// the part of the RDMA data path (spec.md §4.2) a memory server
    /// services itself rather than staging through the ATL, since
    /// single-word atomics need no crash-atomicity beyond what the NIC
    /// already guarantees.
    pub async fn atomic(&self, region_id: u64, offset: u64, op: AtomicOp, operand: AtomicValue) -> FamResult<()> {
        let key = self.fabric.key_for(region_id)?;
        self.fabric.provider().atomic(self.fabric.node_id(), key, offset, op, operand).await
    }

    pub async fn fetch_atomic(
        &self,
        region_id: u64,
        offset: u64,
        op: AtomicOp,
        operand: AtomicValue,
    ) -> FamResult<AtomicValue> {
        let key = self.fabric.key_for(region_id)?;
        self.fabric.provider().fetch_atomic(self.fabric.node_id(), key, offset, op, operand).await
    }

    pub async fn compare_atomic(
        &self,
        region_id: u64,
        offset: u64,
        expected: AtomicValue,
        desired: AtomicValue,
    ) -> FamResult<AtomicValue> {
        let key = self.fabric.key_for(region_id)?;
        self.fabric
            .provider()
            .compare_atomic(self.fabric.node_id(), key, offset, expected, desired)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fam_rdma::provider::LoopbackProvider;

    #[test]
    fn creating_a_region_registers_it_with_the_fabric() {
        let dir = tempfile::tempdir().unwrap();
        let server = MemoryServer::start(
            MsConfig {
                node_id: 0,
                data_dir: dir.path().to_path_buf(),
                num_atomic_threads: 1,
            },
            Arc::new(LoopbackProvider::new()),
        )
        .unwrap();
        server.create_volatile_region(1, 4096).unwrap();
        assert!(server.fabric.key_for(1).is_ok());
        assert_eq!(server.destroy_region(1).unwrap(), DestroyStatus::Released);
        assert!(server.fabric.key_for(1).is_err());
    }

    #[test]
    fn open_handle_blocks_destroy_until_closed() {
        let dir = tempfile::tempdir().unwrap();
        let server = MemoryServer::start(
            MsConfig {
                node_id: 0,
                data_dir: dir.path().to_path_buf(),
                num_atomic_threads: 1,
            },
            Arc::new(LoopbackProvider::new()),
        )
        .unwrap();
        server.create_volatile_region(1, 4096).unwrap();
        server.open_region_handle(1).unwrap();
        assert_eq!(server.destroy_region(1).unwrap(), DestroyStatus::InUse);
        assert!(server.fabric.key_for(1).is_ok());
        server.close_region_handle(1).unwrap();
        assert_eq!(server.destroy_region(1).unwrap(), DestroyStatus::Released);
    }

    #[test]
    fn resize_region_re_registers_the_grown_key() {
        let dir = tempfile::tempdir().unwrap();
        let server = MemoryServer::start(
            MsConfig {
                node_id: 0,
                data_dir: dir.path().to_path_buf(),
                num_atomic_threads: 1,
            },
            Arc::new(LoopbackProvider::new()),
        )
        .unwrap();
        server.create_volatile_region(1, 4096).unwrap();
        server.resize_region(1, 8192).unwrap();
        assert!(server.fabric.key_for(1).is_ok());
        assert_eq!(server.store.region_size(1).unwrap(), 8192);
    }

    #[tokio::test]
    async fn atomic_min_is_exposed_through_the_server() {
        let dir = tempfile::tempdir().unwrap();
        let server = MemoryServer::start(
            MsConfig {
                node_id: 0,
                data_dir: dir.path().to_path_buf(),
                num_atomic_threads: 1,
            },
            Arc::new(LoopbackProvider::new()),
        )
        .unwrap();
        server.create_volatile_region(1, 4096).unwrap();
        server.atomic(1, 0, AtomicOp::Swap, AtomicValue::I64(10)).await.unwrap();
        let prev = server.fetch_atomic(1, 0, AtomicOp::Min, AtomicValue::I64(3)).await.unwrap();
        assert_eq!(prev, AtomicValue::I64(10));
    }
}
