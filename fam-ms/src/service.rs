//! The memory server's RPC-facing surface: atomic control-plane ops
//! dispatch either onto the ATL (durable writes/scatter) or straight
//! onto `RegionStore` (gather/get, which the source's `recover_queue`
//! never replays, so they skip the queue entirely).

use std::sync::Arc;

use fam_atl::record::{AtomicMsg, GlobalDescriptor, MsgFlags};
use fam_common::error::{FamError, FamResult};
use fam_rdma::cas::CasLockTable;

use crate::allocator::RegionStore;
use crate::atl_pool::AtlPool;

fn encode_indexes(indexes: &[u64]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(indexes.len() * 8);
    for idx in indexes {
        buf.extend_from_slice(&idx.to_ne_bytes());
    }
    buf
}

/// Per-process memory-server state backing the `Cis`-facing atomic RPCs.
pub struct MemoryServerService {
    pub node_id: u64,
    pub store: Arc<RegionStore>,
    pub atl: AtlPool,
    pub cas_locks: CasLockTable,
}

impl MemoryServerService {
    pub fn put_atomic(&self, client_node_id: u64, region_id: u64, offset: u64, data: &[u8]) -> FamResult<()> {
        let queue = self.atl.queue_for(region_id);
        let mut msg = AtomicMsg::EMPTY;
        msg.client_node_id = client_node_id;
        msg.dst = GlobalDescriptor { region_id, offset };
        msg.size = data.len() as u64;
        msg.set_flags(MsgFlags::WRITE);
        queue.push(msg, Some(data), None)
    }

    pub fn get_atomic(&self, region_id: u64, offset: u64, len: usize) -> FamResult<Vec<u8>> {
        self.store.read(region_id, offset, len)
    }

    pub fn scatter_strided_atomic(
        &self,
        client_node_id: u64,
        region_id: u64,
        data: &[u8],
        first_element: u64,
        stride: u64,
        element_size: u64,
        nelements: u64,
    ) -> FamResult<()> {
        if element_size == 0 || nelements == 0 {
            return Err(FamError::OutOfRange);
        }
        if data.len() as u64 != element_size * nelements {
            return Err(FamError::OutOfRange);
        }
        let queue = self.atl.queue_for(region_id);
        let mut msg = AtomicMsg::EMPTY;
        msg.client_node_id = client_node_id;
        msg.dst = GlobalDescriptor { region_id, offset: 0 };
        msg.size = data.len() as u64;
        msg.first_element = first_element;
        msg.stride = stride;
        msg.element_size = element_size;
        msg.n_elements = nelements;
        msg.set_flags(MsgFlags::SCATTER_STRIDE);
        queue.push(msg, Some(data), None)
    }

    pub fn scatter_indexed_atomic(
        &self,
        client_node_id: u64,
        region_id: u64,
        data: &[u8],
        indexes: &[u64],
        element_size: u64,
    ) -> FamResult<()> {
        if element_size == 0 || indexes.is_empty() {
            return Err(FamError::OutOfRange);
        }
        if data.len() as u64 != element_size * indexes.len() as u64 {
            return Err(FamError::OutOfRange);
        }
        let queue = self.atl.queue_for(region_id);
        let mut msg = AtomicMsg::EMPTY;
        msg.client_node_id = client_node_id;
        msg.dst = GlobalDescriptor { region_id, offset: 0 };
        msg.size = data.len() as u64;
        msg.element_size = element_size;
        msg.n_elements = indexes.len() as u64;
        msg.set_flags(MsgFlags::SCATTER_INDEX);
        queue.push(msg, Some(data), Some(&encode_indexes(indexes)))
    }

    pub fn gather_strided_atomic(
        &self,
        region_id: u64,
        first_element: u64,
        stride: u64,
        element_size: u64,
        nelements: u64,
    ) -> FamResult<Vec<u8>> {
        let mut out = Vec::with_capacity((element_size * nelements) as usize);
        for i in 0..nelements {
            let offset = first_element + stride * i;
            out.extend(self.store.read(region_id, offset, element_size as usize)?);
        }
        Ok(out)
    }

    pub fn gather_indexed_atomic(&self, region_id: u64, indexes: &[u64], element_size: u64) -> FamResult<Vec<u8>> {
        let mut out = Vec::with_capacity(element_size as usize * indexes.len());
        for &offset in indexes {
            out.extend(self.store.read(region_id, offset, element_size as usize)?);
        }
        Ok(out)
    }

    pub async fn acquire_cas_lock(&self, region_id: u64, offset: u64) -> tokio::sync::OwnedMutexGuard<()> {
        self.cas_locks.lock(region_id, offset).await
    }

    pub fn release_cas_lock(&self, region_id: u64, offset: u64, guard: tokio::sync::OwnedMutexGuard<()>) {
        drop(guard);
        self.cas_locks.forget(region_id, offset);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::StoreConfig;

    fn service(dir: &std::path::Path) -> MemoryServerService {
        let store = Arc::new(RegionStore::new(StoreConfig {
            data_dir: dir.to_path_buf(),
        }));
        store.create_volatile(1, 1 << 16).unwrap();
        let atl = AtlPool::start(dir, 1, store.clone()).unwrap();
        MemoryServerService {
            node_id: 0,
            store,
            atl,
            cas_locks: CasLockTable::default(),
        }
    }

    #[tokio::test]
    async fn put_then_get_round_trips_through_the_atl() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        service.put_atomic(7, 1, 0, b"hello").unwrap();
        for _ in 0..200 {
            if !service.atl.queue_for(1).is_empty() {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                continue;
            }
            break;
        }
        let back = service.get_atomic(1, 0, 5).unwrap();
        assert_eq!(back, b"hello");
    }

    #[test]
    fn gather_strided_rejects_nothing_and_assembles_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        fam_atl::Destination::write(service.store.as_ref(), 1, 0, &[1u8; 4]).unwrap();
        fam_atl::Destination::write(service.store.as_ref(), 1, 8, &[2u8; 4]).unwrap();
        let out = service.gather_strided_atomic(1, 0, 8, 4, 2).unwrap();
        assert_eq!(out, vec![1, 1, 1, 1, 2, 2, 2, 2]);
    }
}
