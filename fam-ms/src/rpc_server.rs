//! Dispatches the internal MS protocol (`fam_rpc::internal::ms`) onto a
//! `MemoryServer`, so `fam-cis` can create/destroy regions, allocate
//! data items, and drive the atomic data path on a remote process.

use std::sync::Arc;

use async_trait::async_trait;
use fam_common::error::{FamError, FamResult};
use fam_common::model::DestroyStatus;
use fam_rdma::provider::{AtomicOp, AtomicValue, FabricProvider};
use fam_rpc::internal::{decode, encode, ms::*};
use fam_rpc::Dispatcher;

use crate::MemoryServer;

fn op_from_wire(op: AtomicOpWire) -> AtomicOp {
    match op {
        AtomicOpWire::Sum => AtomicOp::Sum,
        AtomicOpWire::Min => AtomicOp::Min,
        AtomicOpWire::Max => AtomicOp::Max,
        AtomicOpWire::Swap => AtomicOp::Swap,
    }
}

fn value_from_wire(value: AtomicValueWire) -> AtomicValue {
    match value {
        AtomicValueWire::I64(v) => AtomicValue::I64(v),
        AtomicValueWire::U64(v) => AtomicValue::U64(v),
        AtomicValueWire::F64Bits(bits) => AtomicValue::F64(f64::from_bits(bits)),
    }
}

fn value_to_wire(value: AtomicValue) -> AtomicValueWire {
    match value {
        AtomicValue::I64(v) => AtomicValueWire::I64(v),
        AtomicValue::U64(v) => AtomicValueWire::U64(v),
        AtomicValue::F64(v) => AtomicValueWire::F64Bits(v.to_bits()),
    }
}

pub struct MsDispatcher<P: FabricProvider> {
    pub server: Arc<MemoryServer<P>>,
}

#[async_trait]
impl<P: FabricProvider + 'static> Dispatcher for MsDispatcher<P> {
    async fn dispatch(&self, method: &str, payload: Vec<u8>) -> FamResult<Vec<u8>> {
        let server = &self.server;
        match method {
            CREATE_VOLATILE_REGION => {
                let req: CreateRegionRequest = decode(&payload)?;
                server.create_volatile_region(req.region_id, req.size)?;
                Ok(encode(&()))
            }
            CREATE_PERSISTENT_REGION => {
                let req: CreateRegionRequest = decode(&payload)?;
                server.create_persistent_region(req.region_id, req.size)?;
                Ok(encode(&()))
            }
            DESTROY_REGION => {
                let req: RegionIdRequest = decode(&payload)?;
                let status = server.destroy_region(req.region_id)?;
                let wire = match status {
                    DestroyStatus::Released => DestroyStatusWire::Released,
                    DestroyStatus::InUse => DestroyStatusWire::InUse,
                };
                Ok(encode(&DestroyStatusResponse { status: wire }))
            }
            RESIZE_REGION => {
                let req: ResizeRegionRequest = decode(&payload)?;
                server.resize_region(req.region_id, req.new_size)?;
                Ok(encode(&()))
            }
            OPEN_REGION_HANDLE => {
                let req: RegionIdRequest = decode(&payload)?;
                let key = server.open_region_handle(req.region_id)?;
                Ok(encode(&KeyU64Response { key }))
            }
            CLOSE_REGION_HANDLE => {
                let req: RegionIdRequest = decode(&payload)?;
                server.close_region_handle(req.region_id)?;
                Ok(encode(&()))
            }
            ATOMIC => {
                let req: AtomicRequest = decode(&payload)?;
                server
                    .atomic(req.region_id, req.offset, op_from_wire(req.op), value_from_wire(req.operand))
                    .await?;
                Ok(encode(&()))
            }
            FETCH_ATOMIC => {
                let req: AtomicRequest = decode(&payload)?;
                let value = server
                    .fetch_atomic(req.region_id, req.offset, op_from_wire(req.op), value_from_wire(req.operand))
                    .await?;
                Ok(encode(&AtomicValueResponse { value: value_to_wire(value) }))
            }
            COMPARE_ATOMIC => {
                let req: CompareAtomicRequest = decode(&payload)?;
                let value = server
                    .compare_atomic(req.region_id, req.offset, value_from_wire(req.expected), value_from_wire(req.desired))
                    .await?;
                Ok(encode(&AtomicValueResponse { value: value_to_wire(value) }))
            }
            ALLOCATE_ITEM => {
                let req: AllocateItemRequest = decode(&payload)?;
                let offset = server.store.allocate_item(req.region_id, req.size)?;
                Ok(encode(&OffsetResponse { offset }))
            }
            DEALLOCATE_ITEM => {
                let req: DeallocateItemRequest = decode(&payload)?;
                server.store.deallocate_item(req.region_id, req.offset, req.size)?;
                Ok(encode(&()))
            }
            PUT_ATOMIC => {
                let req: PutAtomicRequest = decode(&payload)?;
                server
                    .service
                    .put_atomic(req.client_node_id, req.region_id, req.offset, &req.data)?;
                Ok(encode(&()))
            }
            GET_ATOMIC => {
                let req: GetAtomicRequest = decode(&payload)?;
                let data = server.service.get_atomic(req.region_id, req.offset, req.len)?;
                Ok(encode(&DataResponse { data }))
            }
            SCATTER_STRIDED => {
                let req: ScatterStridedRequest = decode(&payload)?;
                server.service.scatter_strided_atomic(
                    req.client_node_id,
                    req.region_id,
                    &req.data,
                    req.first_element,
                    req.stride,
                    req.element_size,
                    req.nelements,
                )?;
                Ok(encode(&()))
            }
            SCATTER_INDEXED => {
                let req: ScatterIndexedRequest = decode(&payload)?;
                server.service.scatter_indexed_atomic(
                    req.client_node_id,
                    req.region_id,
                    &req.data,
                    &req.indexes,
                    req.element_size,
                )?;
                Ok(encode(&()))
            }
            GATHER_STRIDED => {
                let req: GatherStridedRequest = decode(&payload)?;
                let data = server.service.gather_strided_atomic(
                    req.region_id,
                    req.first_element,
                    req.stride,
                    req.element_size,
                    req.nelements,
                )?;
                Ok(encode(&DataResponse { data }))
            }
            GATHER_INDEXED => {
                let req: GatherIndexedRequest = decode(&payload)?;
                let data = server
                    .service
                    .gather_indexed_atomic(req.region_id, &req.indexes, req.element_size)?;
                Ok(encode(&DataResponse { data }))
            }
            REGION_KEY => {
                let req: RegionIdRequest = decode(&payload)?;
                let key = server.fabric.key_for(req.region_id)?;
                Ok(encode(&KeyResponse { key: key.0 }))
            }
            other => Err(FamError::Rpc(format!("unknown MS method {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MsConfig;
    use fam_rdma::provider::LoopbackProvider;

    async fn dispatcher(dir: &std::path::Path) -> MsDispatcher<LoopbackProvider> {
        let server = Arc::new(
            MemoryServer::start(
                MsConfig {
                    node_id: 0,
                    data_dir: dir.to_path_buf(),
                    num_atomic_threads: 1,
                },
                Arc::new(LoopbackProvider::new()),
            )
            .unwrap(),
        );
        MsDispatcher { server }
    }

    #[tokio::test]
    async fn create_region_then_get_atomic_after_put() {
        let dir = tempfile::tempdir().unwrap();
        let d = dispatcher(dir.path()).await;

        let create = encode(&CreateRegionRequest { region_id: 1, size: 4096 });
        d.dispatch(CREATE_VOLATILE_REGION, create).await.unwrap();

        let put = encode(&PutAtomicRequest {
            client_node_id: 9,
            region_id: 1,
            offset: 0,
            data: b"hey".to_vec(),
        });
        d.dispatch(PUT_ATOMIC, put).await.unwrap();

        for _ in 0..200 {
            if d.server.service.atl.queue_for(1).is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let get = encode(&GetAtomicRequest {
            region_id: 1,
            offset: 0,
            len: 3,
        });
        let resp = d.dispatch(GET_ATOMIC, get).await.unwrap();
        let resp: DataResponse = decode(&resp).unwrap();
        assert_eq!(resp.data, b"hey");
    }

    #[tokio::test]
    async fn unknown_method_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let d = dispatcher(dir.path()).await;
        let result = d.dispatch("Ms.Nonexistent", Vec::new()).await;
        assert!(matches!(result, Err(FamError::Rpc(_))));
    }
}
