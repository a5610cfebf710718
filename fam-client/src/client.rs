//! `FamClient`: the library surface an application links against.
//! Control-plane calls forward to the CIS coordinator's `fam.Cis`
//! protocol (the same prost messages `fam-cis::rpc_server` decodes);
//! the data path — put/get, scatter/gather, and the NIC atomics — is
//! issued directly against each memory server's internal `Ms.*`
//! protocol, never through CIS, per spec.md §2's "bypassing CIS for
//! data-path calls".

use std::collections::HashMap;
use std::sync::Arc;

use fam_common::config::FamConfig;
use fam_common::error::{FamError, FamResult};
use fam_common::model::{
    interleave_spans, DataItem, DataItemId, MemoryType, Mode, PermissionLevel, RedundancyLevel, Region, RegionId,
};
use fam_rdma::context::Context;
use fam_rdma::provider::{AtomicOp, AtomicValue};
use fam_rdma::timeout::RetryPolicy;
use fam_rpc::internal::ms;
use fam_rpc::{fam, DirectTransport, GrpcTransport, Transport};
use parking_lot::Mutex;
use prost::Message as ProstMessage;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::RwLock as AsyncRwLock;
use tracing::instrument;

use crate::handle::{OpenedItem, OpenedRegion};

fn op_to_wire(op: AtomicOp) -> ms::AtomicOpWire {
    match op {
        AtomicOp::Sum => ms::AtomicOpWire::Sum,
        AtomicOp::Min => ms::AtomicOpWire::Min,
        AtomicOp::Max => ms::AtomicOpWire::Max,
        AtomicOp::Swap => ms::AtomicOpWire::Swap,
    }
}

fn value_to_wire(value: AtomicValue) -> ms::AtomicValueWire {
    match value {
        AtomicValue::I64(v) => ms::AtomicValueWire::I64(v),
        AtomicValue::U64(v) => ms::AtomicValueWire::U64(v),
        AtomicValue::F64(v) => ms::AtomicValueWire::F64Bits(v.to_bits()),
    }
}

fn value_from_wire(value: ms::AtomicValueWire) -> AtomicValue {
    match value {
        ms::AtomicValueWire::I64(v) => AtomicValue::I64(v),
        ms::AtomicValueWire::U64(v) => AtomicValue::U64(v),
        ms::AtomicValueWire::F64Bits(bits) => AtomicValue::F64(f64::from_bits(bits)),
    }
}

fn memory_type_from_wire(value: u32) -> MemoryType {
    match value {
        1 => MemoryType::Persistent,
        _ => MemoryType::Volatile,
    }
}

fn memory_type_to_wire(value: MemoryType) -> u32 {
    match value {
        MemoryType::Volatile => 0,
        MemoryType::Persistent => 1,
    }
}

fn permission_level_from_wire(value: u32) -> PermissionLevel {
    match value {
        1 => PermissionLevel::DataItem,
        _ => PermissionLevel::Region,
    }
}

fn permission_level_to_wire(value: PermissionLevel) -> u32 {
    match value {
        PermissionLevel::Region => 0,
        PermissionLevel::DataItem => 1,
    }
}

fn region_from_info(info: fam::RegionInfo) -> Region {
    Region {
        region_id: RegionId(info.region_id),
        name: info.name,
        uid: info.uid,
        gid: info.gid,
        mode: Mode(info.mode),
        size: info.size,
        redundancy_level: RedundancyLevel::Raid1,
        memory_type: memory_type_from_wire(info.memory_type),
        interleave_enable: info.interleave_enable,
        permission_level: permission_level_from_wire(info.permission_level),
        memserver_ids: info.memserver_ids,
    }
}

fn item_from_info(info: fam::ItemInfo) -> DataItem {
    DataItem {
        dataitem_id: DataItemId(info.dataitem_id),
        region_id: RegionId(info.region_id),
        name: if info.name.is_empty() { None } else { Some(info.name) },
        offsets: info.offsets,
        size: info.size,
        interleave_size: info.interleave_size,
        uid: info.uid,
        gid: info.gid,
        mode: Mode(info.mode),
        permission_level: permission_level_from_wire(info.permission_level),
        memserver_ids: info.memserver_ids,
    }
}

fn dial(addr: &str, framework: &str) -> Arc<dyn Transport> {
    if framework == "direct" {
        Arc::new(DirectTransport::new(addr.to_string()))
    } else {
        Arc::new(GrpcTransport::new(addr.to_string()))
    }
}

async fn internal_call<Req: Serialize, Resp: DeserializeOwned>(
    transport: &dyn Transport,
    method: &str,
    req: &Req,
) -> FamResult<Resp> {
    let resp_bytes = transport.unary(method, fam_rpc::internal::encode(req)).await?;
    fam_rpc::internal::decode(&resp_bytes)
}

async fn cis_call<Req: ProstMessage, Resp: ProstMessage + Default>(
    transport: &dyn Transport,
    method: &str,
    req: &Req,
) -> FamResult<Resp> {
    let mut buf = Vec::with_capacity(req.encoded_len());
    req.encode(&mut buf).map_err(|e| FamError::Rpc(e.to_string()))?;
    let resp_bytes = transport.unary(method, buf).await?;
    Resp::decode(resp_bytes.as_slice()).map_err(|e| FamError::Rpc(format!("bad response: {e}")))
}

/// One client handle per application process: a CIS transport, a fixed
/// set of memory-server transports dialed at `connect` time, an RDMA
/// `Context` for `fence`/`quiet` bookkeeping, and the opened-region /
/// opened-item caches (spec.md §3, §5 "Lifecycle").
pub struct FamClient {
    cis: Arc<dyn Transport>,
    memservers: HashMap<u64, Arc<dyn Transport>>,
    rdma: Arc<Context>,
    open_regions: AsyncRwLock<HashMap<u64, OpenedRegion>>,
    open_items: Mutex<HashMap<u64, OpenedItem>>,
}

impl FamClient {
    /// `fam_initialize`: dials the CIS coordinator and every memory
    /// server named in the config's `memsrv_list` up front, so the data
    /// path never has to discover or connect a peer mid-call.
    pub fn connect(config: &FamConfig) -> FamResult<FamClient> {
        let cis = dial(&config.cis_addr, &config.rpc_framework_type);
        let mut memservers = HashMap::new();
        for entry in config.memservers()? {
            let transport = dial(&format!("{}:{}", entry.host, entry.port), &config.memsrv_interface_type);
            memservers.insert(entry.id, transport);
        }
        Ok(FamClient::from_transports(cis, memservers))
    }

    /// Builds a client directly from already-dialed transports; the
    /// in-process test harness uses this to wire up loopback `Transport`
    /// wrappers around `CisDispatcher`/`MsDispatcher` instead of real
    /// sockets.
    pub fn from_transports(cis: Arc<dyn Transport>, memservers: HashMap<u64, Arc<dyn Transport>>) -> FamClient {
        FamClient {
            cis,
            memservers,
            rdma: Arc::new(Context::new(0)),
            open_regions: AsyncRwLock::new(HashMap::new()),
            open_items: Mutex::new(HashMap::new()),
        }
    }

    fn ms(&self, node_id: u64) -> FamResult<Arc<dyn Transport>> {
        self.memservers.get(&node_id).cloned().ok_or(FamError::RpcClientNotFound)
    }

    /// `fam_finalize`: drops every cached region/item handle and waits
    /// for the local RDMA context to quiesce. Best-effort `close_region`
    /// per cached entry, the way the source's finalize walks its context
    /// list tearing down memory registrations one by one.
    pub async fn finalize(&self) -> FamResult<()> {
        let region_ids: Vec<u64> = self.open_regions.read().await.keys().copied().collect();
        for region_id in region_ids {
            let _ = self.close_region(region_id).await;
        }
        self.open_items.lock().clear();
        self.rdma.gate.write().await;
        Ok(())
    }

    // ---- control plane (forwarded to CIS) ---------------------------

    #[allow(clippy::too_many_arguments)]
    pub async fn create_region(
        &self,
        name: impl Into<String>,
        size: u64,
        mode: Mode,
        memory_type: MemoryType,
        interleave_enable: bool,
        permission_level: PermissionLevel,
        uid: u32,
        gid: u32,
    ) -> FamResult<(u64, u64)> {
        let resp: fam::CreateRegionResponse = cis_call(
            self.cis.as_ref(),
            fam_rpc::internal::cis::CREATE_REGION,
            &fam::CreateRegionRequest {
                name: name.into(),
                size,
                mode: mode.0,
                redundancy_level: 0,
                memory_type: memory_type_to_wire(memory_type),
                interleave_enable,
                permission_level: permission_level_to_wire(permission_level),
                uid,
                gid,
            },
        )
        .await?;
        Ok((resp.region_id, resp.offset))
    }

    pub async fn destroy_region(&self, region_id: u64, uid: u32, gid: u32) -> FamResult<()> {
        let _: fam::DestroyRegionResponse = cis_call(
            self.cis.as_ref(),
            fam_rpc::internal::cis::DESTROY_REGION,
            &fam::DestroyRegionRequest {
                region_id,
                memserver_id: 0,
                uid,
                gid,
            },
        )
        .await?;
        self.open_regions.write().await.remove(&region_id);
        Ok(())
    }

    pub async fn resize_region(&self, region_id: u64, nbytes: u64, uid: u32, gid: u32) -> FamResult<()> {
        let _: fam::ResizeRegionResponse = cis_call(
            self.cis.as_ref(),
            fam_rpc::internal::cis::RESIZE_REGION,
            &fam::ResizeRegionRequest { region_id, nbytes, uid, gid },
        )
        .await?;
        // A resize changes every per-server base size; the cached keys
        // are still valid (keys don't move), but callers should re-open
        // to see the new layout.
        Ok(())
    }

    /// Populates the per-region memory-map cache: one key per memory
    /// server the region spans, in `memserver_ids` order (spec.md §3).
    pub async fn open_region(&self, region_id: u64, uid: u32, gid: u32) -> FamResult<()> {
        let resp: fam::OpenRegionResponse = cis_call(
            self.cis.as_ref(),
            fam_rpc::internal::cis::OPEN_REGION,
            &fam::OpenRegionRequest { region_id, uid, gid },
        )
        .await?;
        self.open_regions.write().await.insert(
            region_id,
            OpenedRegion {
                region_id,
                memserver_ids: resp.memserver_ids,
                keys: resp.keys,
            },
        );
        Ok(())
    }

    /// Drops the refcount `open_region` raised; best-effort per spec.md
    /// §4.1's `close_region`.
    pub async fn close_region(&self, region_id: u64) -> FamResult<()> {
        let _: fam::CloseRegionResponse = cis_call(
            self.cis.as_ref(),
            fam_rpc::internal::cis::CLOSE_REGION,
            &fam::CloseRegionRequest { region_id },
        )
        .await?;
        self.open_regions.write().await.remove(&region_id);
        Ok(())
    }

    pub fn opened_region(&self, region_id: u64) -> Option<OpenedRegion> {
        self.open_regions.try_read().ok().and_then(|map| map.get(&region_id).cloned())
    }

    pub async fn allocate(
        &self,
        name: Option<String>,
        region_id: u64,
        size: u64,
        mode: Mode,
        uid: u32,
        gid: u32,
    ) -> FamResult<OpenedItem> {
        let resp: fam::AllocateResponse = cis_call(
            self.cis.as_ref(),
            fam_rpc::internal::cis::ALLOCATE,
            &fam::AllocateRequest {
                name: name.unwrap_or_default(),
                region_id,
                size,
                mode: mode.0,
                uid,
                gid,
            },
        )
        .await?;
        let item = DataItem {
            dataitem_id: DataItemId::synthesize(resp.memserver_ids[0], resp.offsets[0]),
            region_id: RegionId(resp.region_id),
            name: None,
            offsets: resp.offsets,
            size: size,
            interleave_size: resp.interleave_size,
            uid,
            gid,
            mode: Mode(resp.mode),
            permission_level: permission_level_from_wire(resp.permission_level),
            memserver_ids: resp.memserver_ids,
        };
        let opened = OpenedItem { item, keys: resp.keys };
        self.open_items.lock().insert(opened.item.dataitem_id.0, opened.clone());
        Ok(opened)
    }

    /// `dataitem_id` alone can't recover `region_id`/`offset` (the id only
    /// encodes the first server and a truncated offset), so this takes the
    /// `DataItem` itself — from `allocate`'s return value or `lookup_item`.
    pub async fn deallocate(&self, item: &DataItem, uid: u32, gid: u32) -> FamResult<()> {
        let _: fam::DeallocateResponse = cis_call(
            self.cis.as_ref(),
            fam_rpc::internal::cis::DEALLOCATE,
            &fam::DeallocateRequest {
                region_id: item.region_id.0,
                offset: item.offsets[0],
                memserver_id: item.memserver_ids[0],
                uid,
                gid,
            },
        )
        .await?;
        self.open_items.lock().remove(&item.dataitem_id.0);
        Ok(())
    }

    pub async fn change_region_permission(&self, region_id: u64, mode: Mode, uid: u32, gid: u32) -> FamResult<()> {
        let _: fam::ChangePermissionResponse = cis_call(
            self.cis.as_ref(),
            fam_rpc::internal::cis::CHANGE_REGION_PERMISSION,
            &fam::ChangeRegionPermissionRequest {
                region_id,
                mode: mode.0,
                uid,
                gid,
            },
        )
        .await?;
        Ok(())
    }

    pub async fn change_dataitem_permission(&self, region_id: u64, dataitem_id: u64, mode: Mode, uid: u32, gid: u32) -> FamResult<()> {
        let _: fam::ChangePermissionResponse = cis_call(
            self.cis.as_ref(),
            fam_rpc::internal::cis::CHANGE_DATAITEM_PERMISSION,
            &fam::ChangeDataitemPermissionRequest {
                region_id,
                dataitem_id,
                mode: mode.0,
                uid,
                gid,
            },
        )
        .await?;
        Ok(())
    }

    pub async fn lookup_region(&self, name: &str, uid: u32, gid: u32) -> FamResult<Region> {
        let resp: fam::LookupRegionResponse = cis_call(
            self.cis.as_ref(),
            fam_rpc::internal::cis::LOOKUP_REGION,
            &fam::LookupRegionRequest {
                name: name.to_string(),
                uid,
                gid,
            },
        )
        .await?;
        let info = resp.region_info.ok_or_else(|| FamError::RegionNotFound)?;
        Ok(region_from_info(info))
    }

    pub async fn lookup_item(&self, item_name: &str, region_name: &str, uid: u32, gid: u32) -> FamResult<DataItem> {
        let resp: fam::LookupItemResponse = cis_call(
            self.cis.as_ref(),
            fam_rpc::internal::cis::LOOKUP_ITEM,
            &fam::LookupItemRequest {
                item_name: item_name.to_string(),
                region_name: region_name.to_string(),
                uid,
                gid,
            },
        )
        .await?;
        let info = resp.item_info.ok_or_else(|| FamError::DataItemNotFound)?;
        Ok(item_from_info(info))
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn copy(
        &self,
        src_region_id: u64,
        src_offset: u64,
        dest_region_id: u64,
        dest_offset: u64,
        size: u64,
        uid: u32,
        gid: u32,
    ) -> FamResult<u64> {
        let resp: fam::WaitTokenResponse = cis_call(
            self.cis.as_ref(),
            fam_rpc::internal::cis::COPY,
            &fam::CopyRequest {
                src_region_id,
                src_offset,
                dest_region_id,
                dest_offset,
                size,
                uid,
                gid,
            },
        )
        .await?;
        Ok(resp.wait_token)
    }

    pub async fn backup(&self, region_id: u64, dataitem_id: u64, backup_name: &str, uid: u32, gid: u32) -> FamResult<u64> {
        let resp: fam::WaitTokenResponse = cis_call(
            self.cis.as_ref(),
            fam_rpc::internal::cis::BACKUP,
            &fam::BackupRequest {
                region_id,
                dataitem_id,
                backup_name: backup_name.to_string(),
                uid,
                gid,
            },
        )
        .await?;
        Ok(resp.wait_token)
    }

    pub async fn restore(&self, backup_name: &str, dest_region_id: u64, dest_dataitem_id: u64, uid: u32, gid: u32) -> FamResult<u64> {
        let resp: fam::WaitTokenResponse = cis_call(
            self.cis.as_ref(),
            fam_rpc::internal::cis::RESTORE,
            &fam::RestoreRequest {
                backup_name: backup_name.to_string(),
                dest_region_id,
                dest_dataitem_id,
                uid,
                gid,
            },
        )
        .await?;
        Ok(resp.wait_token)
    }

    pub async fn delete_backup(&self, backup_name: &str, uid: u32, gid: u32) -> FamResult<()> {
        let _: fam::DestroyRegionResponse = cis_call(
            self.cis.as_ref(),
            fam_rpc::internal::cis::DELETE_BACKUP,
            &fam::DeleteBackupRequest {
                backup_name: backup_name.to_string(),
                uid,
                gid,
            },
        )
        .await?;
        Ok(())
    }

    pub async fn wait_for(&self, wait_token: u64) -> FamResult<()> {
        let resp: fam::WaitForResponse =
            cis_call(self.cis.as_ref(), fam_rpc::internal::cis::WAIT_FOR, &fam::WaitForRequest { wait_token }).await?;
        if resp.done {
            Ok(())
        } else {
            Err(FamError::Timeout)
        }
    }

    pub async fn acquire_cas_lock(&self, region_id: u64, offset: u64) -> FamResult<u64> {
        let resp: fam::AcquireCasLockResponse = cis_call(
            self.cis.as_ref(),
            fam_rpc::internal::cis::ACQUIRE_CAS_LOCK,
            &fam::AcquireCasLockRequest { region_id, offset },
        )
        .await?;
        Ok(resp.lock_token)
    }

    pub async fn release_cas_lock(&self, lock_token: u64) -> FamResult<()> {
        let _: fam::CasLockResponse = cis_call(
            self.cis.as_ref(),
            fam_rpc::internal::cis::RELEASE_CAS_LOCK,
            &fam::ReleaseCasLockRequest { lock_token },
        )
        .await?;
        Ok(())
    }

    pub async fn get_memserverinfo_size(&self) -> FamResult<u64> {
        let resp: fam::MemserverInfoSizeResponse =
            cis_call(self.cis.as_ref(), fam_rpc::internal::cis::GET_MEMSERVER_INFO_SIZE, &fam::Empty {}).await?;
        Ok(resp.size)
    }

    pub async fn get_memserverinfo(&self) -> FamResult<Vec<u8>> {
        let resp: fam::MemserverInfoResponse =
            cis_call(self.cis.as_ref(), fam_rpc::internal::cis::GET_MEMSERVER_INFO, &fam::Empty {}).await?;
        Ok(resp.data)
    }

    // ---- data path (direct to MS, bypassing CIS) --------------------

    /// Raw, single-server put against `(region_id, offset)`; the spans a
    /// striped item maps to are computed by `put_item`.
    #[instrument(skip(self, data), fields(context = self.rdma.id))]
    pub async fn put(&self, region_id: u64, offset: u64, memserver_id: u64, data: Vec<u8>) -> FamResult<()> {
        let _gate = self.rdma.gate.read().await;
        self.rdma.mark_tx_posted();
        let transport = self.ms(memserver_id)?;
        let result: FamResult<()> = internal_call(
            transport.as_ref(),
            ms::PUT_ATOMIC,
            &ms::PutAtomicRequest {
                client_node_id: self.rdma.id,
                region_id,
                offset,
                data,
            },
        )
        .await;
        self.rdma.record_tx_completion(result.is_ok());
        result
    }

    #[instrument(skip(self), fields(context = self.rdma.id))]
    pub async fn get(&self, region_id: u64, offset: u64, memserver_id: u64, len: usize) -> FamResult<Vec<u8>> {
        let _gate = self.rdma.gate.read().await;
        self.rdma.mark_rx_posted();
        let transport = self.ms(memserver_id)?;
        let result: FamResult<ms::DataResponse> =
            internal_call(transport.as_ref(), ms::GET_ATOMIC, &ms::GetAtomicRequest { region_id, offset, len }).await;
        self.rdma.record_rx_completion(result.is_ok());
        result.map(|r| r.data)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn scatter_strided(
        &self,
        region_id: u64,
        memserver_id: u64,
        data: Vec<u8>,
        first_element: u64,
        stride: u64,
        element_size: u64,
        nelements: u64,
    ) -> FamResult<()> {
        let _gate = self.rdma.gate.read().await;
        self.rdma.mark_tx_posted();
        let transport = self.ms(memserver_id)?;
        let result: FamResult<()> = internal_call(
            transport.as_ref(),
            ms::SCATTER_STRIDED,
            &ms::ScatterStridedRequest {
                client_node_id: self.rdma.id,
                region_id,
                data,
                first_element,
                stride,
                element_size,
                nelements,
            },
        )
        .await;
        self.rdma.record_tx_completion(result.is_ok());
        result
    }

    pub async fn gather_strided(
        &self,
        region_id: u64,
        memserver_id: u64,
        first_element: u64,
        stride: u64,
        element_size: u64,
        nelements: u64,
    ) -> FamResult<Vec<u8>> {
        let _gate = self.rdma.gate.read().await;
        self.rdma.mark_rx_posted();
        let transport = self.ms(memserver_id)?;
        let result: FamResult<ms::DataResponse> = internal_call(
            transport.as_ref(),
            ms::GATHER_STRIDED,
            &ms::GatherStridedRequest {
                region_id,
                first_element,
                stride,
                element_size,
                nelements,
            },
        )
        .await;
        self.rdma.record_rx_completion(result.is_ok());
        result.map(|r| r.data)
    }

    pub async fn scatter_indexed(
        &self,
        region_id: u64,
        memserver_id: u64,
        data: Vec<u8>,
        indexes: Vec<u64>,
        element_size: u64,
    ) -> FamResult<()> {
        let _gate = self.rdma.gate.read().await;
        self.rdma.mark_tx_posted();
        let transport = self.ms(memserver_id)?;
        let result: FamResult<()> = internal_call(
            transport.as_ref(),
            ms::SCATTER_INDEXED,
            &ms::ScatterIndexedRequest {
                client_node_id: self.rdma.id,
                region_id,
                data,
                indexes,
                element_size,
            },
        )
        .await;
        self.rdma.record_tx_completion(result.is_ok());
        result
    }

    pub async fn gather_indexed(&self, region_id: u64, memserver_id: u64, indexes: Vec<u64>, element_size: u64) -> FamResult<Vec<u8>> {
        let _gate = self.rdma.gate.read().await;
        self.rdma.mark_rx_posted();
        let transport = self.ms(memserver_id)?;
        let result: FamResult<ms::DataResponse> = internal_call(
            transport.as_ref(),
            ms::GATHER_INDEXED,
            &ms::GatherIndexedRequest { region_id, indexes, element_size },
        )
        .await;
        self.rdma.record_rx_completion(result.is_ok());
        result.map(|r| r.data)
    }

    /// NIC-resident atomic op: non-fetching, so only tx bookkeeping
    /// applies (spec.md §4.2).
    pub async fn atomic(&self, region_id: u64, offset: u64, memserver_id: u64, op: AtomicOp, operand: AtomicValue) -> FamResult<()> {
        let _gate = self.rdma.gate.read().await;
        self.rdma.mark_tx_posted();
        let transport = self.ms(memserver_id)?;
        let result: FamResult<()> = internal_call(
            transport.as_ref(),
            ms::ATOMIC,
            &ms::AtomicRequest {
                region_id,
                offset,
                op: op_to_wire(op),
                operand: value_to_wire(operand),
            },
        )
        .await;
        self.rdma.record_tx_completion(result.is_ok());
        result
    }

    pub async fn fetch_atomic(
        &self,
        region_id: u64,
        offset: u64,
        memserver_id: u64,
        op: AtomicOp,
        operand: AtomicValue,
    ) -> FamResult<AtomicValue> {
        let _gate = self.rdma.gate.read().await;
        self.rdma.mark_tx_posted();
        let transport = self.ms(memserver_id)?;
        let result: FamResult<ms::AtomicValueResponse> = internal_call(
            transport.as_ref(),
            ms::FETCH_ATOMIC,
            &ms::AtomicRequest {
                region_id,
                offset,
                op: op_to_wire(op),
                operand: value_to_wire(operand),
            },
        )
        .await;
        self.rdma.record_tx_completion(result.is_ok());
        result.map(|r| value_from_wire(r.value))
    }

    /// `fam_fetch_subtract`: negates the subtrahend and dispatches as a
    /// `Sum`, refusing `i64::MIN` per the resolved open question
    /// (`fam_rdma::provider::fetch_subtract_operand`).
    pub async fn fetch_subtract(&self, region_id: u64, offset: u64, memserver_id: u64, subtrahend: i64) -> FamResult<AtomicValue> {
        let operand = fam_rdma::provider::fetch_subtract_operand(subtrahend)?;
        self.fetch_atomic(region_id, offset, memserver_id, AtomicOp::Sum, operand).await
    }

    pub async fn compare_atomic(
        &self,
        region_id: u64,
        offset: u64,
        memserver_id: u64,
        expected: AtomicValue,
        desired: AtomicValue,
    ) -> FamResult<AtomicValue> {
        let _gate = self.rdma.gate.read().await;
        self.rdma.mark_tx_posted();
        let transport = self.ms(memserver_id)?;
        let result: FamResult<ms::AtomicValueResponse> = internal_call(
            transport.as_ref(),
            ms::COMPARE_ATOMIC,
            &ms::CompareAtomicRequest {
                region_id,
                offset,
                expected: value_to_wire(expected),
                desired: value_to_wire(desired),
            },
        )
        .await;
        self.rdma.record_tx_completion(result.is_ok());
        result.map(|r| value_from_wire(r.value))
    }

    /// A local ordering barrier: blocks until every in-flight read-locked
    /// op posted before this call has released the gate (fam-rdma's
    /// `Endpoint::fence` does the same against a real fabric provider).
    pub async fn fence(&self) -> FamResult<()> {
        let _gate = self.rdma.gate.write().await;
        Ok(())
    }

    /// Drains in-flight ops and asserts the tx/rx books balance.
    pub async fn quiet(&self) -> FamResult<()> {
        let before = self.rdma.totals();
        let _gate = self.rdma.gate.write().await;
        if !self.rdma.is_quiesced() {
            return Err(FamError::Resource(1, "incomplete operations at quiet".into()));
        }
        if self.rdma.had_new_failure(before) {
            return Err(FamError::Resource(1, "new failures observed during quiet".into()));
        }
        Ok(())
    }

    // ---- item-level helpers: split across the interleave spans -------

    /// Writes `data` at `offset` within `item`, splitting across memory
    /// servers the same way `fam-cis::coordinator::write_item` does for
    /// its own internal callers, but going straight to each MS.
    pub async fn put_item(&self, item: &DataItem, offset: u64, data: &[u8]) -> FamResult<()> {
        let spans = interleave_spans(item.interleave_size, item.memserver_ids.len(), offset, data.len() as u64);
        let mut cursor = 0usize;
        for (server_index, local_offset, span_len) in spans {
            let server_id = item.memserver_ids[server_index];
            let base = item.offsets[server_index];
            let chunk = data[cursor..cursor + span_len as usize].to_vec();
            self.put(item.region_id.0, base + local_offset, server_id, chunk).await?;
            cursor += span_len as usize;
        }
        Ok(())
    }

    pub async fn get_item(&self, item: &DataItem, offset: u64, len: u64) -> FamResult<Vec<u8>> {
        let spans = interleave_spans(item.interleave_size, item.memserver_ids.len(), offset, len);
        let mut out = Vec::with_capacity(len as usize);
        for (server_index, local_offset, span_len) in spans {
            let server_id = item.memserver_ids[server_index];
            let base = item.offsets[server_index];
            let chunk = self.get(item.region_id.0, base + local_offset, server_id, span_len as usize).await?;
            out.extend(chunk);
        }
        Ok(out)
    }
}
