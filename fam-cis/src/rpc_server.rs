//! Dispatches the external, client-facing `fam.Cis` protocol (the
//! prost messages generated from `proto/fam.proto`) onto a
//! `CisCoordinator`, the way `fam-ms`/`fam-mds`'s dispatchers do for
//! their internal protocols — just decoding prost instead of JSON.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use fam_common::error::{FamError, FamResult};
use fam_common::model::{DataItem, MemoryType, Mode, PermissionLevel, Region, RedundancyLevel};
use fam_rpc::fam;
use fam_rpc::internal::cis::*;
use fam_rpc::Dispatcher;
use prost::Message;

use crate::coordinator::CisCoordinator;

fn decode<T: Message + Default>(bytes: &[u8]) -> FamResult<T> {
    T::decode(bytes).map_err(|e| FamError::Rpc(format!("bad external payload: {e}")))
}

fn encode<T: Message>(value: &T) -> Vec<u8> {
    let mut buf = Vec::with_capacity(value.encoded_len());
    value.encode(&mut buf).expect("external rpc payloads are always encodable");
    buf
}

fn memory_type_from_wire(value: u32) -> MemoryType {
    match value {
        1 => MemoryType::Persistent,
        _ => MemoryType::Volatile,
    }
}

fn permission_level_from_wire(value: u32) -> PermissionLevel {
    match value {
        1 => PermissionLevel::DataItem,
        _ => PermissionLevel::Region,
    }
}

fn permission_level_to_wire(level: PermissionLevel) -> u32 {
    match level {
        PermissionLevel::Region => 0,
        PermissionLevel::DataItem => 1,
    }
}

fn mode_to_wire(mode: Mode) -> u32 {
    mode.0
}

fn memory_type_to_wire(memory_type: MemoryType) -> u32 {
    match memory_type {
        MemoryType::Volatile => 0,
        MemoryType::Persistent => 1,
    }
}

fn redundancy_level_to_wire(level: RedundancyLevel) -> u32 {
    match level {
        RedundancyLevel::Raid1 => 0,
    }
}

fn region_info(region: &Region) -> fam::RegionInfo {
    fam::RegionInfo {
        region_id: region.region_id.0,
        name: region.name.clone(),
        size: region.size,
        mode: mode_to_wire(region.mode),
        uid: region.uid,
        gid: region.gid,
        memserver_ids: region.memserver_ids.clone(),
        redundancy_level: redundancy_level_to_wire(region.redundancy_level),
        memory_type: memory_type_to_wire(region.memory_type),
        interleave_enable: region.interleave_enable,
        permission_level: permission_level_to_wire(region.permission_level),
    }
}

fn item_info(item: &DataItem) -> fam::ItemInfo {
    fam::ItemInfo {
        dataitem_id: item.dataitem_id.0,
        region_id: item.region_id.0,
        name: item.name.clone().unwrap_or_default(),
        size: item.size,
        interleave_size: item.interleave_size,
        mode: mode_to_wire(item.mode),
        uid: item.uid,
        gid: item.gid,
        memserver_ids: item.memserver_ids.clone(),
        offsets: item.offsets.clone(),
        permission_level: permission_level_to_wire(item.permission_level),
    }
}

/// Backs the `Backup`/`Restore`/`DeleteBackup` RPCs; named backups live
/// as plain files under this directory, one per `backup_name`.
pub struct CisDispatcher {
    pub coordinator: Arc<CisCoordinator>,
    pub backup_dir: PathBuf,
}

#[async_trait]
impl Dispatcher for CisDispatcher {
    async fn dispatch(&self, method: &str, payload: Vec<u8>) -> FamResult<Vec<u8>> {
        let cis = &self.coordinator;
        match method {
            CREATE_REGION => {
                let req: fam::CreateRegionRequest = decode(&payload)?;
                let (region, offset) = cis
                    .create_region(
                        req.name,
                        req.size,
                        Mode(req.mode),
                        RedundancyLevel::Raid1,
                        memory_type_from_wire(req.memory_type),
                        req.interleave_enable,
                        permission_level_from_wire(req.permission_level),
                        req.uid,
                        req.gid,
                    )
                    .await?;
                Ok(encode(&fam::CreateRegionResponse {
                    status: None,
                    region_id: region.region_id.0,
                    offset,
                }))
            }
            DESTROY_REGION => {
                let req: fam::DestroyRegionRequest = decode(&payload)?;
                cis.destroy_region(req.region_id, req.uid, req.gid).await?;
                Ok(encode(&fam::DestroyRegionResponse { status: None }))
            }
            RESIZE_REGION => {
                let req: fam::ResizeRegionRequest = decode(&payload)?;
                cis.resize_region(req.region_id, req.nbytes, req.uid, req.gid).await?;
                Ok(encode(&fam::ResizeRegionResponse { status: None }))
            }
            OPEN_REGION => {
                let req: fam::OpenRegionRequest = decode(&payload)?;
                let (region, keys) = cis.open_region(req.region_id, req.uid, req.gid).await?;
                Ok(encode(&fam::OpenRegionResponse {
                    status: None,
                    memserver_ids: region.memserver_ids,
                    base_addresses: keys.clone(),
                    keys,
                }))
            }
            CLOSE_REGION => {
                let req: fam::CloseRegionRequest = decode(&payload)?;
                cis.close_region(req.region_id).await?;
                Ok(encode(&fam::CloseRegionResponse { status: None }))
            }
            ALLOCATE => {
                let req: fam::AllocateRequest = decode(&payload)?;
                let name = if req.name.is_empty() { None } else { Some(req.name) };
                let item = cis
                    .allocate(name, req.region_id, req.size, Mode(req.mode), req.uid, req.gid)
                    .await?;
                let keys = cis.item_memory_keys(&item).await?;
                Ok(encode(&fam::AllocateResponse {
                    status: None,
                    region_id: item.region_id.0,
                    used_memsrv_cnt: item.memserver_ids.len() as u32,
                    interleave_size: item.interleave_size,
                    permission_level: permission_level_to_wire(item.permission_level),
                    memserver_ids: item.memserver_ids.clone(),
                    offsets: item.offsets.clone(),
                    base_addresses: keys.clone(),
                    keys,
                    mode: mode_to_wire(item.mode),
                }))
            }
            DEALLOCATE => {
                let req: fam::DeallocateRequest = decode(&payload)?;
                // `offset`/`memserver_id` identify the item's first span; the
                // coordinator re-derives the full item from the catalog.
                let dataitem_id = fam_common::model::DataItemId::synthesize(req.memserver_id, req.offset).0;
                cis.deallocate(dataitem_id, req.uid, req.gid).await?;
                Ok(encode(&fam::DeallocateResponse { status: None }))
            }
            CHANGE_REGION_PERMISSION => {
                let req: fam::ChangeRegionPermissionRequest = decode(&payload)?;
                cis.change_region_permission(req.region_id, Mode(req.mode), req.uid, req.gid).await?;
                Ok(encode(&fam::ChangePermissionResponse { status: None }))
            }
            CHANGE_DATAITEM_PERMISSION => {
                let req: fam::ChangeDataitemPermissionRequest = decode(&payload)?;
                cis.change_dataitem_permission(req.dataitem_id, Mode(req.mode), req.uid, req.gid).await?;
                Ok(encode(&fam::ChangePermissionResponse { status: None }))
            }
            LOOKUP_REGION => {
                let req: fam::LookupRegionRequest = decode(&payload)?;
                let region = cis.lookup_region(&req.name, req.uid, req.gid).await?;
                Ok(encode(&fam::LookupRegionResponse {
                    status: None,
                    region_info: Some(region_info(&region)),
                }))
            }
            LOOKUP_ITEM => {
                let req: fam::LookupItemRequest = decode(&payload)?;
                let region = cis.lookup_region(&req.region_name, req.uid, req.gid).await?;
                let item = cis.lookup_item(region.region_id.0, &req.item_name).await?;
                Ok(encode(&fam::LookupItemResponse {
                    status: None,
                    item_info: Some(item_info(&item)),
                }))
            }
            COPY => {
                let req: fam::CopyRequest = decode(&payload)?;
                let token = cis.copy_async(
                    req.src_region_id,
                    req.src_offset,
                    req.dest_region_id,
                    req.dest_offset,
                    req.size,
                    req.uid,
                    req.gid,
                );
                Ok(encode(&fam::WaitTokenResponse { status: None, wait_token: token }))
            }
            BACKUP => {
                let req: fam::BackupRequest = decode(&payload)?;
                let token = cis.backup_async(req.dataitem_id, self.backup_dir.clone(), req.backup_name, req.uid, req.gid);
                Ok(encode(&fam::WaitTokenResponse { status: None, wait_token: token }))
            }
            RESTORE => {
                let req: fam::RestoreRequest = decode(&payload)?;
                let token = cis.restore_async(
                    self.backup_dir.clone(),
                    req.backup_name,
                    req.dest_dataitem_id,
                    req.uid,
                    req.gid,
                );
                Ok(encode(&fam::WaitTokenResponse { status: None, wait_token: token }))
            }
            DELETE_BACKUP => {
                let req: fam::DeleteBackupRequest = decode(&payload)?;
                cis.delete_backup(&self.backup_dir, &req.backup_name)?;
                Ok(encode(&fam::DestroyRegionResponse { status: None }))
            }
            WAIT_FOR => {
                let req: fam::WaitForRequest = decode(&payload)?;
                cis.wait_for(req.wait_token).await?;
                Ok(encode(&fam::WaitForResponse { status: None, done: true }))
            }
            ACQUIRE_CAS_LOCK => {
                let req: fam::AcquireCasLockRequest = decode(&payload)?;
                let token = cis.acquire_cas_lock(req.region_id, req.offset).await;
                Ok(encode(&fam::AcquireCasLockResponse {
                    status: None,
                    lock_token: token,
                }))
            }
            RELEASE_CAS_LOCK => {
                let req: fam::ReleaseCasLockRequest = decode(&payload)?;
                cis.release_cas_lock(req.lock_token)?;
                Ok(encode(&fam::CasLockResponse { status: None }))
            }
            GET_MEMSERVER_INFO_SIZE => {
                let size = cis.get_memserverinfo_size().await?;
                Ok(encode(&fam::MemserverInfoSizeResponse { status: None, size }))
            }
            GET_MEMSERVER_INFO => {
                let data = cis.get_memserverinfo().await?;
                Ok(encode(&fam::MemserverInfoResponse { status: None, data }))
            }
            PUT_ATOMIC => {
                let req: fam::PutAtomicRequest = decode(&payload)?;
                cis.put_atomic(req.region_id, req.offset, req.memserver_id, req.data).await?;
                Ok(encode(&fam::CasLockResponse { status: None }))
            }
            GET_ATOMIC => {
                let req: fam::GetAtomicRequest = decode(&payload)?;
                let data = cis.get_atomic(req.region_id, req.offset, req.memserver_id, req.size as usize).await?;
                Ok(encode(&fam::GetAtomicResponse { status: None, data }))
            }
            SCATTER_STRIDED_ATOMIC => {
                let req: fam::ScatterStridedAtomicRequest = decode(&payload)?;
                cis.scatter_strided_atomic(
                    req.region_id,
                    req.memserver_id,
                    req.data,
                    req.first_element,
                    req.stride,
                    req.element_size,
                    req.n_elements,
                )
                .await?;
                Ok(encode(&fam::CasLockResponse { status: None }))
            }
            GATHER_STRIDED_ATOMIC => {
                let req: fam::GatherStridedAtomicRequest = decode(&payload)?;
                let data = cis
                    .gather_strided_atomic(
                        req.region_id,
                        req.memserver_id,
                        req.first_element,
                        req.stride,
                        req.element_size,
                        req.n_elements,
                    )
                    .await?;
                Ok(encode(&fam::AtomicDataResponse { status: None, data }))
            }
            SCATTER_INDEXED_ATOMIC => {
                let req: fam::ScatterIndexedAtomicRequest = decode(&payload)?;
                cis.scatter_indexed_atomic(req.region_id, req.memserver_id, req.data, req.indexes, req.element_size)
                    .await?;
                Ok(encode(&fam::CasLockResponse { status: None }))
            }
            GATHER_INDEXED_ATOMIC => {
                let req: fam::GatherIndexedAtomicRequest = decode(&payload)?;
                let data = cis
                    .gather_indexed_atomic(req.region_id, req.memserver_id, req.indexes, req.element_size)
                    .await?;
                Ok(encode(&fam::AtomicDataResponse { status: None, data }))
            }
            other => Err(FamError::Rpc(format!("unknown Cis method {other}"))),
        }
    }
}
