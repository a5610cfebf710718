//! The CIS coordinator: fans out region/data-item operations across the
//! memory servers a region spans and reconciles the result with the
//! single metadata service, using `tokio::task::JoinSet` the way
//! `wormhole`'s server binary fans out payload-forwarding tasks and
//! joins them (`wormhole/src/bin/server/main.rs`).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fam_common::error::{FamError, FamResult};
use fam_common::model::{
    align_up, interleave_spans, split_per_server, DataItem, DataItemId, DestroyStatus, MemoryType, Mode,
    PermissionLevel, RedundancyLevel, Region, RegionId, ALLOC_ALIGN, MIN_OBJ_SIZE, MIN_REGION_SIZE,
};
use fam_rdma::cas::CasLockTable;
use fam_rpc::internal::{decode, encode, mds, ms};
use fam_rpc::Transport;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinSet;
use tracing::warn;

fn destroy_status_from_wire(status: ms::DestroyStatusWire) -> DestroyStatus {
    match status {
        ms::DestroyStatusWire::Released => DestroyStatus::Released,
        ms::DestroyStatusWire::InUse => DestroyStatus::InUse,
    }
}

async fn call<Req: Serialize, Resp: DeserializeOwned>(
    transport: &dyn Transport,
    method: &str,
    req: &Req,
) -> FamResult<Resp> {
    let resp_bytes = transport.unary(method, encode(req)).await?;
    decode(&resp_bytes)
}

/// A named peer set: one transport per memory server, plus the single
/// metadata-service transport. Spec.md's "three server roles" maps
/// one-to-one onto these fields; CIS never talks to a client directly
/// except over this same `Transport` boundary.
/// Tracks in-flight async control-plane operations (`copy`/`backup`/
/// `restore`) behind opaque tokens, the `WaitObject` model from Design
/// Note §9: any implementer detail is fine as long as `wait_for` joins
/// the task and propagates its failure.
#[derive(Default)]
struct WaitRegistry {
    next_token: AtomicU64,
    handles: Mutex<HashMap<u64, tokio::task::JoinHandle<FamResult<()>>>>,
}

impl WaitRegistry {
    fn new() -> Self {
        WaitRegistry {
            next_token: AtomicU64::new(1),
            handles: Mutex::new(HashMap::new()),
        }
    }

    fn spawn<F>(&self, fut: F) -> u64
    where
        F: std::future::Future<Output = FamResult<()>> + Send + 'static,
    {
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        let handle = tokio::spawn(fut);
        self.handles.lock().insert(token, handle);
        token
    }

    async fn wait_for(&self, token: u64) -> FamResult<()> {
        let handle = self
            .handles
            .lock()
            .remove(&token)
            .ok_or_else(|| FamError::InvalidOption(format!("unknown wait token {token}")))?;
        match handle.await {
            Ok(result) => result,
            Err(join_err) => Err(FamError::Resource(1, join_err.to_string())),
        }
    }
}

pub struct CisCoordinator {
    mds: Arc<dyn Transport>,
    memservers: HashMap<u64, Arc<dyn Transport>>,
    cas_locks: CasLockTable,
    cas_tokens: Mutex<HashMap<u64, (u64, u64, OwnedMutexGuard<()>)>>,
    next_cas_token: AtomicU64,
    waits: WaitRegistry,
}

impl CisCoordinator {
    pub fn new(mds: Arc<dyn Transport>, memservers: HashMap<u64, Arc<dyn Transport>>) -> CisCoordinator {
        CisCoordinator {
            mds,
            memservers,
            cas_locks: CasLockTable::new(),
            cas_tokens: Mutex::new(HashMap::new()),
            next_cas_token: AtomicU64::new(1),
            waits: WaitRegistry::new(),
        }
    }

    fn ms(&self, node_id: u64) -> FamResult<Arc<dyn Transport>> {
        self.memservers.get(&node_id).cloned().ok_or(FamError::RpcClientNotFound)
    }

    /// Picks the memory servers a new region should span and reserves
    /// its id, both via the metadata service.
    async fn reserve_region(&self) -> FamResult<(u64, Vec<u64>)> {
        let servers: mds::MemserversResponse = call(self.mds.as_ref(), mds::PICK_MEMSERVERS, &()).await?;
        let region_id: mds::RegionIdResponse = call(self.mds.as_ref(), mds::RESERVE_REGION_ID, &()).await?;
        let region_id = region_id.region_id.ok_or_else(|| {
            FamError::Resource(0, "metadata service has exhausted its region id space".into())
        })?;
        Ok((region_id, servers.memserver_ids))
    }

    /// Creates a region and, for `PermissionLevel::Region`, immediately
    /// registers its backing memory on every participating MS — the
    /// spec's `register_region_memory` step — returning the first
    /// server's key as the region's base `offset` (spec.md §4.1:
    /// `create_region(...) → (region_id, offset)`). `DataItem`-level
    /// regions defer registration to each item's `allocate`, so the
    /// offset is 0.
    pub async fn create_region(
        &self,
        name: String,
        size: u64,
        mode: Mode,
        redundancy_level: RedundancyLevel,
        memory_type: MemoryType,
        interleave_enable: bool,
        permission_level: PermissionLevel,
        uid: u32,
        gid: u32,
    ) -> FamResult<(Region, u64)> {
        let (region_id, memserver_ids) = self.reserve_region().await?;
        let per_server_size = split_per_server(size, memserver_ids.len(), MIN_REGION_SIZE);

        let method = match memory_type {
            MemoryType::Volatile => ms::CREATE_VOLATILE_REGION,
            MemoryType::Persistent => ms::CREATE_PERSISTENT_REGION,
        };

        let mut joins = JoinSet::new();
        for &server_id in &memserver_ids {
            let transport = self.ms(server_id)?;
            joins.spawn(async move {
                let result: FamResult<()> = call(
                    transport.as_ref(),
                    method,
                    &ms::CreateRegionRequest {
                        region_id,
                        size: per_server_size,
                    },
                )
                .await;
                (server_id, result)
            });
        }
        let failures = Self::collect_failures(joins).await;
        if let Some(err) = FamError::from_peer_failures(failures.clone()) {
            self.compensate_create_failure(region_id, &memserver_ids, &failures).await;
            return Err(err);
        }

        let region = Region {
            region_id: RegionId(region_id),
            name,
            uid,
            gid,
            mode,
            size: per_server_size * memserver_ids.len() as u64,
            redundancy_level,
            memory_type,
            interleave_enable,
            permission_level,
            memserver_ids,
        };
        if let Err(e) = call::<_, ()>(self.mds.as_ref(), mds::INSERT_REGION, &mds::RegionResponse { region: region.clone() }).await
        {
            self.compensate_create_failure(region_id, &region.memserver_ids, &[]).await;
            return Err(e);
        }

        let offset = if permission_level == PermissionLevel::Region {
            self.fetch_region_keys(region_id, &region.memserver_ids)
                .await?
                .first()
                .copied()
                .unwrap_or(0)
        } else {
            0
        };
        Ok((region, offset))
    }

    async fn compensate_create_failure(&self, region_id: u64, memserver_ids: &[u64], already_failed: &[(String, FamError)]) {
        let failed_ids: Vec<u64> = already_failed
            .iter()
            .filter_map(|(peer, _)| peer.parse::<u64>().ok())
            .collect();
        for &server_id in memserver_ids {
            if failed_ids.contains(&server_id) {
                continue;
            }
            if let Ok(transport) = self.ms(server_id) {
                let _: FamResult<ms::DestroyStatusResponse> =
                    call(transport.as_ref(), ms::DESTROY_REGION, &ms::RegionIdRequest { region_id }).await;
            }
        }
        let _: FamResult<()> = call(self.mds.as_ref(), mds::RELEASE_REGION_ID, &mds::RegionIdRequest { region_id }).await;
    }

    pub async fn destroy_region(&self, region_id: u64, uid: u32, gid: u32) -> FamResult<()> {
        let resp: mds::RegionResponse = call(
            self.mds.as_ref(),
            mds::AUTHORIZE_REGION,
            &mds::AuthorizeRegionRequest {
                region_id,
                uid,
                gid,
                want_write: true,
            },
        )
        .await?;

        let mut joins: JoinSet<(u64, FamResult<DestroyStatus>)> = JoinSet::new();
        for &server_id in &resp.region.memserver_ids {
            let transport = self.ms(server_id)?;
            joins.spawn(async move {
                let result: FamResult<ms::DestroyStatusResponse> =
                    call(transport.as_ref(), ms::DESTROY_REGION, &ms::RegionIdRequest { region_id }).await;
                (server_id, result.map(|r| destroy_status_from_wire(r.status)))
            });
        }

        let mut failures = Vec::new();
        let mut statuses = Vec::new();
        while let Some(res) = joins.join_next().await {
            match res {
                Ok((_, Ok(status))) => statuses.push(status),
                Ok((peer, Err(e))) => failures.push((peer.to_string(), e)),
                Err(join_err) => {
                    warn!("memory server task panicked: {join_err}");
                    failures.push(("unknown".to_string(), FamError::Resource(1, join_err.to_string())));
                }
            }
        }
        if let Some(err) = FamError::from_peer_failures(failures) {
            return Err(err);
        }

        call::<_, mds::RegionResponse>(self.mds.as_ref(), mds::REMOVE_REGION, &mds::RegionIdRequest { region_id }).await?;

        // Property #9: the region id only goes back into the bitmap once
        // every memory server reports no client still has it open.
        if DestroyStatus::all_released(&statuses) {
            call::<_, ()>(self.mds.as_ref(), mds::RELEASE_REGION_ID, &mds::RegionIdRequest { region_id }).await?;
        }
        Ok(())
    }

    /// Grows a region across every memory server it spans, then records
    /// the new total size with the metadata service. Ownership is
    /// checked by the metadata service itself (`REGION_RESIZE_NOT_PERMITTED`
    /// on mismatch or shrink); a partial per-server failure is left in
    /// place rather than rolled back, since growing never destroys data.
    pub async fn resize_region(&self, region_id: u64, nbytes: u64, uid: u32, gid: u32) -> FamResult<()> {
        let current: mds::RegionResponse = call(self.mds.as_ref(), mds::GET_REGION, &mds::RegionIdRequest { region_id }).await?;
        let region = current.region;
        let per_server_size = split_per_server(nbytes, region.memserver_ids.len(), MIN_REGION_SIZE);

        let mut joins: JoinSet<(u64, FamResult<()>)> = JoinSet::new();
        for &server_id in &region.memserver_ids {
            let transport = self.ms(server_id)?;
            joins.spawn(async move {
                let result: FamResult<()> = call(
                    transport.as_ref(),
                    ms::RESIZE_REGION,
                    &ms::ResizeRegionRequest {
                        region_id,
                        new_size: per_server_size,
                    },
                )
                .await;
                (server_id, result)
            });
        }
        let failures = Self::collect_failures(joins).await;
        if let Some(err) = FamError::from_peer_failures(failures) {
            return Err(err);
        }

        let _ = gid;
        call::<_, mds::RegionResponse>(
            self.mds.as_ref(),
            mds::RESIZE_REGION,
            &mds::ResizeRegionRequest {
                region_id,
                uid,
                new_size: per_server_size * region.memserver_ids.len() as u64,
            },
        )
        .await
        .map(|_| ())
    }

    /// Populates the client's `Fam_Region_Memory_Map`: opens the region
    /// on every memory server it spans and returns the fabric key each
    /// one assigned, alongside the server ids in the same order (spec.md
    /// §3, "Per-opened-region cache").
    pub async fn open_region(&self, region_id: u64, uid: u32, gid: u32) -> FamResult<(Region, Vec<u64>)> {
        let resp: mds::RegionResponse = call(
            self.mds.as_ref(),
            mds::AUTHORIZE_REGION,
            &mds::AuthorizeRegionRequest {
                region_id,
                uid,
                gid,
                want_write: false,
            },
        )
        .await?;
        let region = resp.region;
        let keys = self.fetch_region_keys(region_id, &region.memserver_ids).await?;
        Ok((region, keys))
    }

    /// Calls `open_region_handle` on every listed server in parallel and
    /// returns the key each one assigned, in the same order as
    /// `memserver_ids`. Shared by `open_region` and `allocate`, both of
    /// which hand a client the keys it needs to address a server directly.
    async fn fetch_region_keys(&self, region_id: u64, memserver_ids: &[u64]) -> FamResult<Vec<u64>> {
        let mut keys = vec![0u64; memserver_ids.len()];
        let mut joins: JoinSet<(usize, FamResult<u64>)> = JoinSet::new();
        for (idx, &server_id) in memserver_ids.iter().enumerate() {
            let transport = self.ms(server_id)?;
            joins.spawn(async move {
                let result: FamResult<ms::KeyU64Response> =
                    call(transport.as_ref(), ms::OPEN_REGION_HANDLE, &ms::RegionIdRequest { region_id }).await;
                (idx, result.map(|r| r.key))
            });
        }
        let mut failures = Vec::new();
        while let Some(res) = joins.join_next().await {
            match res {
                Ok((idx, Ok(key))) => keys[idx] = key,
                Ok((idx, Err(e))) => failures.push((memserver_ids[idx].to_string(), e)),
                Err(join_err) => {
                    warn!("memory server task panicked: {join_err}");
                    failures.push(("unknown".to_string(), FamError::Resource(1, join_err.to_string())));
                }
            }
        }
        if let Some(err) = FamError::from_peer_failures(failures) {
            return Err(err);
        }
        Ok(keys)
    }

    /// Drops the refcount `open_region` raised on every memory server the
    /// region spans; best-effort, since a client closing a region it no
    /// longer needs should not be blocked by one unreachable server.
    pub async fn close_region(&self, region_id: u64) -> FamResult<()> {
        let resp: mds::RegionResponse =
            call(self.mds.as_ref(), mds::GET_REGION, &mds::RegionIdRequest { region_id }).await?;
        for &server_id in &resp.region.memserver_ids {
            if let Ok(transport) = self.ms(server_id) {
                let _: FamResult<()> =
                    call(transport.as_ref(), ms::CLOSE_REGION_HANDLE, &ms::RegionIdRequest { region_id }).await;
            }
        }
        Ok(())
    }

    pub async fn allocate(
        &self,
        name: Option<String>,
        region_id: u64,
        size: u64,
        mode: Mode,
        uid: u32,
        gid: u32,
    ) -> FamResult<DataItem> {
        let resp: mds::RegionResponse = call(
            self.mds.as_ref(),
            mds::AUTHORIZE_REGION,
            &mds::AuthorizeRegionRequest {
                region_id,
                uid,
                gid,
                want_write: true,
            },
        )
        .await?;
        let region = resp.region;
        let per_server_size = align_up(split_per_server(size, region.memserver_ids.len(), MIN_OBJ_SIZE), ALLOC_ALIGN);

        let mut offsets = vec![0u64; region.memserver_ids.len()];
        let mut allocated: Vec<(usize, u64)> = Vec::new();
        let mut failure: Option<FamError> = None;
        for (idx, &server_id) in region.memserver_ids.iter().enumerate() {
            let transport = self.ms(server_id)?;
            let result: FamResult<ms::OffsetResponse> = call(
                transport.as_ref(),
                ms::ALLOCATE_ITEM,
                &ms::AllocateItemRequest {
                    region_id,
                    size: per_server_size,
                },
            )
            .await;
            match result {
                Ok(resp) => {
                    offsets[idx] = resp.offset;
                    allocated.push((idx, resp.offset));
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(err) = failure {
            for (idx, offset) in allocated {
                let server_id = region.memserver_ids[idx];
                if let Ok(transport) = self.ms(server_id) {
                    let _: FamResult<()> = call(
                        transport.as_ref(),
                        ms::DEALLOCATE_ITEM,
                        &ms::DeallocateItemRequest {
                            region_id,
                            offset,
                            size: per_server_size,
                        },
                    )
                    .await;
                }
            }
            return Err(err);
        }

        let dataitem_id = DataItemId::synthesize(region.memserver_ids[0], offsets[0]);
        let item = DataItem {
            dataitem_id,
            region_id: RegionId(region_id),
            name,
            offsets,
            size: per_server_size * region.memserver_ids.len() as u64,
            interleave_size: if region.interleave_enable { per_server_size } else { 0 },
            uid,
            gid,
            mode,
            permission_level: region.permission_level,
            memserver_ids: region.memserver_ids.clone(),
        };
        call::<_, ()>(self.mds.as_ref(), mds::INSERT_ITEM, &mds::ItemResponse { item: item.clone() }).await?;
        Ok(item)
    }

    /// Fabric keys for an already-allocated item's per-server spans, for
    /// assembling the `keys[]` the `allocate` RPC hands back to clients.
    pub async fn item_memory_keys(&self, item: &DataItem) -> FamResult<Vec<u64>> {
        self.fetch_region_keys(item.region_id.0, &item.memserver_ids).await
    }

    pub async fn deallocate(&self, dataitem_id: u64, uid: u32, gid: u32) -> FamResult<()> {
        let item_resp: mds::ItemResponse = call(
            self.mds.as_ref(),
            mds::AUTHORIZE_ITEM,
            &mds::AuthorizeItemRequest {
                dataitem_id,
                uid,
                gid,
                want_write: true,
            },
        )
        .await?;
        let item = item_resp.item;
        let per_server_size = item.size / item.memserver_ids.len() as u64;
        let region_id = item.region_id.0;

        let mut joins = JoinSet::new();
        for (idx, &server_id) in item.memserver_ids.iter().enumerate() {
            let transport = self.ms(server_id)?;
            let offset = item.offsets[idx];
            joins.spawn(async move {
                let result: FamResult<()> = call(
                    transport.as_ref(),
                    ms::DEALLOCATE_ITEM,
                    &ms::DeallocateItemRequest {
                        region_id,
                        offset,
                        size: per_server_size,
                    },
                )
                .await;
                (server_id, result)
            });
        }

        let failures = Self::collect_failures(joins).await;
        if let Some(err) = FamError::from_peer_failures(failures) {
            return Err(err);
        }
        call::<_, mds::ItemResponse>(self.mds.as_ref(), mds::REMOVE_ITEM, &mds::DataItemIdRequest { dataitem_id })
            .await
            .map(|_| ())
    }

    pub async fn lookup_region(&self, name: &str, uid: u32, gid: u32) -> FamResult<Region> {
        let resp: mds::RegionResponse =
            call(self.mds.as_ref(), mds::LOOKUP_REGION_BY_NAME, &mds::NameRequest { name: name.to_string() }).await?;
        let _ = (uid, gid);
        Ok(resp.region)
    }

    pub async fn lookup_item(&self, region_id: u64, name: &str) -> FamResult<DataItem> {
        let resp: mds::ItemResponse = call(
            self.mds.as_ref(),
            mds::LOOKUP_ITEM_BY_NAME,
            &mds::LookupItemRequest {
                region_id,
                name: name.to_string(),
            },
        )
        .await?;
        Ok(resp.item)
    }

    pub async fn change_region_permission(&self, region_id: u64, mode: Mode, uid: u32, gid: u32) -> FamResult<()> {
        call::<_, ()>(
            self.mds.as_ref(),
            mds::SET_REGION_MODE,
            &mds::SetModeRequest {
                id: region_id,
                uid,
                gid,
                mode,
            },
        )
        .await
    }

    pub async fn change_dataitem_permission(&self, dataitem_id: u64, mode: Mode, uid: u32, gid: u32) -> FamResult<()> {
        call::<_, ()>(
            self.mds.as_ref(),
            mds::SET_ITEM_MODE,
            &mds::SetModeRequest {
                id: dataitem_id,
                uid,
                gid,
                mode,
            },
        )
        .await
    }

    pub async fn get_memserverinfo_size(&self) -> FamResult<u64> {
        let resp: mds::SizeResponse = call(self.mds.as_ref(), mds::MEMSERVER_INFO_SIZE, &()).await?;
        Ok(resp.size)
    }

    pub async fn get_memserverinfo(&self) -> FamResult<Vec<u8>> {
        let resp: mds::BlobResponse = call(self.mds.as_ref(), mds::MEMSERVER_INFO_BLOB, &()).await?;
        Ok(resp.data)
    }

    /// Atomic control-plane passthroughs (spec.md §4.2): these address a
    /// single memory server directly and enqueue onto its ATL rather than
    /// fanning out across a region, so CIS forwards the call verbatim
    /// instead of splitting or reassembling spans.
    pub async fn put_atomic(&self, region_id: u64, offset: u64, memserver_id: u64, data: Vec<u8>) -> FamResult<()> {
        let transport = self.ms(memserver_id)?;
        call(
            transport.as_ref(),
            ms::PUT_ATOMIC,
            &ms::PutAtomicRequest {
                client_node_id: 0,
                region_id,
                offset,
                data,
            },
        )
        .await
    }

    pub async fn get_atomic(&self, region_id: u64, offset: u64, memserver_id: u64, len: usize) -> FamResult<Vec<u8>> {
        let transport = self.ms(memserver_id)?;
        let resp: ms::DataResponse = call(transport.as_ref(), ms::GET_ATOMIC, &ms::GetAtomicRequest { region_id, offset, len }).await?;
        Ok(resp.data)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn scatter_strided_atomic(
        &self,
        region_id: u64,
        memserver_id: u64,
        data: Vec<u8>,
        first_element: u64,
        stride: u64,
        element_size: u64,
        nelements: u64,
    ) -> FamResult<()> {
        let transport = self.ms(memserver_id)?;
        call(
            transport.as_ref(),
            ms::SCATTER_STRIDED,
            &ms::ScatterStridedRequest {
                client_node_id: 0,
                region_id,
                data,
                first_element,
                stride,
                element_size,
                nelements,
            },
        )
        .await
    }

    pub async fn gather_strided_atomic(
        &self,
        region_id: u64,
        memserver_id: u64,
        first_element: u64,
        stride: u64,
        element_size: u64,
        nelements: u64,
    ) -> FamResult<Vec<u8>> {
        let transport = self.ms(memserver_id)?;
        let resp: ms::DataResponse = call(
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
        .await?;
        Ok(resp.data)
    }

    pub async fn scatter_indexed_atomic(
        &self,
        region_id: u64,
        memserver_id: u64,
        data: Vec<u8>,
        indexes: Vec<u64>,
        element_size: u64,
    ) -> FamResult<()> {
        let transport = self.ms(memserver_id)?;
        call(
            transport.as_ref(),
            ms::SCATTER_INDEXED,
            &ms::ScatterIndexedRequest {
                client_node_id: 0,
                region_id,
                data,
                indexes,
                element_size,
            },
        )
        .await
    }

    pub async fn gather_indexed_atomic(
        &self,
        region_id: u64,
        memserver_id: u64,
        indexes: Vec<u64>,
        element_size: u64,
    ) -> FamResult<Vec<u8>> {
        let transport = self.ms(memserver_id)?;
        let resp: ms::DataResponse = call(
            transport.as_ref(),
            ms::GATHER_INDEXED,
            &ms::GatherIndexedRequest { region_id, indexes, element_size },
        )
        .await?;
        Ok(resp.data)
    }

    /// Reads every span of `item` within `[offset, offset+len)`, in
    /// logical order, reusing the same interleave mapping the data path
    /// uses for striped items (`fam_common::model::interleave_spans`).
    pub async fn read_item(&self, item: &DataItem, offset: u64, len: u64) -> FamResult<Vec<u8>> {
        let spans = interleave_spans(item.interleave_size, item.memserver_ids.len(), offset, len);
        let mut out = Vec::with_capacity(len as usize);
        for (server_index, local_offset, span_len) in spans {
            let server_id = item.memserver_ids[server_index];
            let base = item.offsets[server_index];
            let transport = self.ms(server_id)?;
            let resp: ms::DataResponse = call(
                transport.as_ref(),
                ms::GET_ATOMIC,
                &ms::GetAtomicRequest {
                    region_id: item.region_id.0,
                    offset: base + local_offset,
                    len: span_len as usize,
                },
            )
            .await?;
            out.extend(resp.data);
        }
        Ok(out)
    }

    async fn write_item(&self, item: &DataItem, offset: u64, data: &[u8]) -> FamResult<()> {
        let spans = interleave_spans(item.interleave_size, item.memserver_ids.len(), offset, data.len() as u64);
        let mut cursor = 0usize;
        for (server_index, local_offset, span_len) in spans {
            let server_id = item.memserver_ids[server_index];
            let base = item.offsets[server_index];
            let transport = self.ms(server_id)?;
            let chunk = &data[cursor..cursor + span_len as usize];
            call::<_, ()>(
                transport.as_ref(),
                ms::PUT_ATOMIC,
                &ms::PutAtomicRequest {
                    client_node_id: 0,
                    region_id: item.region_id.0,
                    offset: base + local_offset,
                    data: chunk.to_vec(),
                },
            )
            .await?;
            cursor += span_len as usize;
        }
        Ok(())
    }

    /// Region-local interleave size for raw byte addressing: a region has
    /// no stored `interleave_size` the way a data item does, so this
    /// derives it from the region's own total size when striping is on.
    fn region_interleave_size(region: &Region) -> u64 {
        if region.interleave_enable && !region.memserver_ids.is_empty() {
            region.size / region.memserver_ids.len() as u64
        } else {
            0
        }
    }

    async fn read_region(&self, region: &Region, offset: u64, len: u64) -> FamResult<Vec<u8>> {
        let spans = interleave_spans(Self::region_interleave_size(region), region.memserver_ids.len(), offset, len);
        let mut out = Vec::with_capacity(len as usize);
        for (server_index, local_offset, span_len) in spans {
            let server_id = region.memserver_ids[server_index];
            let transport = self.ms(server_id)?;
            let resp: ms::DataResponse = call(
                transport.as_ref(),
                ms::GET_ATOMIC,
                &ms::GetAtomicRequest {
                    region_id: region.region_id.0,
                    offset: local_offset,
                    len: span_len as usize,
                },
            )
            .await?;
            out.extend(resp.data);
        }
        Ok(out)
    }

    async fn write_region(&self, region: &Region, offset: u64, data: &[u8]) -> FamResult<()> {
        let spans = interleave_spans(Self::region_interleave_size(region), region.memserver_ids.len(), offset, data.len() as u64);
        let mut cursor = 0usize;
        for (server_index, local_offset, span_len) in spans {
            let server_id = region.memserver_ids[server_index];
            let transport = self.ms(server_id)?;
            let chunk = &data[cursor..cursor + span_len as usize];
            call::<_, ()>(
                transport.as_ref(),
                ms::PUT_ATOMIC,
                &ms::PutAtomicRequest {
                    client_node_id: 0,
                    region_id: region.region_id.0,
                    offset: local_offset,
                    data: chunk.to_vec(),
                },
            )
            .await?;
            cursor += span_len as usize;
        }
        Ok(())
    }

    async fn authorize_item(&self, dataitem_id: u64, uid: u32, gid: u32, want_write: bool) -> FamResult<DataItem> {
        let resp: mds::ItemResponse = call(
            self.mds.as_ref(),
            mds::AUTHORIZE_ITEM,
            &mds::AuthorizeItemRequest {
                dataitem_id,
                uid,
                gid,
                want_write,
            },
        )
        .await?;
        Ok(resp.item)
    }

    /// Copies `size` bytes from one region's byte range into another's
    /// (spec.md §4.1): READ-authorizes `src_region_id`, WRITE-authorizes
    /// `dest_region_id`, then moves the bytes through CIS rather than the
    /// destination-server-pull layout the spec's RDMA path uses — this
    /// crate has no real fabric to pull across.
    pub async fn copy(
        &self,
        src_region_id: u64,
        src_offset: u64,
        dest_region_id: u64,
        dest_offset: u64,
        size: u64,
        uid: u32,
        gid: u32,
    ) -> FamResult<()> {
        let src: mds::RegionResponse = call(
            self.mds.as_ref(),
            mds::AUTHORIZE_REGION,
            &mds::AuthorizeRegionRequest {
                region_id: src_region_id,
                uid,
                gid,
                want_write: false,
            },
        )
        .await?;
        let dest: mds::RegionResponse = call(
            self.mds.as_ref(),
            mds::AUTHORIZE_REGION,
            &mds::AuthorizeRegionRequest {
                region_id: dest_region_id,
                uid,
                gid,
                want_write: true,
            },
        )
        .await?;
        let bytes = self.read_region(&src.region, src_offset, size).await?;
        self.write_region(&dest.region, dest_offset, &bytes).await
    }

    /// Streams a data item's bytes into `backup_dir/backup_name`. The
    /// item name, size, mode, and owner travel with it so `restore` can
    /// validate against the same metadata later.
    pub async fn backup(&self, dataitem_id: u64, backup_dir: &std::path::Path, backup_name: &str, uid: u32, gid: u32) -> FamResult<()> {
        let item = self.authorize_item(dataitem_id, uid, gid, false).await?;
        let path = backup_dir.join(backup_name);
        if path.exists() {
            return Err(FamError::BackupFileExist);
        }
        let bytes = self.read_item(&item, 0, item.size).await?;
        std::fs::write(&path, &bytes).map_err(|e| FamError::Allocator(format!("write backup {backup_name}: {e}")))
    }

    /// Restores a previously written backup into an already-allocated
    /// destination data item; refuses if the destination is smaller than
    /// the backup (spec.md §4.1).
    pub async fn restore(&self, backup_dir: &std::path::Path, backup_name: &str, dest_dataitem_id: u64, uid: u32, gid: u32) -> FamResult<()> {
        let dest = self.authorize_item(dest_dataitem_id, uid, gid, true).await?;
        let path = backup_dir.join(backup_name);
        let bytes = std::fs::read(&path).map_err(|_| FamError::RegionNotFound)?;
        if bytes.len() as u64 > dest.size {
            return Err(FamError::BackupSizeTooLarge);
        }
        self.write_item(&dest, 0, &bytes).await
    }

    pub fn delete_backup(&self, backup_dir: &std::path::Path, backup_name: &str) -> FamResult<()> {
        std::fs::remove_file(backup_dir.join(backup_name)).map_err(|_| FamError::RegionNotFound)
    }

    /// Async entry point for `copy`: runs it on a background task and
    /// hands back a wait token immediately instead of blocking the caller.
    #[allow(clippy::too_many_arguments)]
    pub fn copy_async(
        self: &Arc<Self>,
        src_region_id: u64,
        src_offset: u64,
        dest_region_id: u64,
        dest_offset: u64,
        size: u64,
        uid: u32,
        gid: u32,
    ) -> u64 {
        let this = Arc::clone(self);
        self.waits
            .spawn(async move { this.copy(src_region_id, src_offset, dest_region_id, dest_offset, size, uid, gid).await })
    }

    pub fn backup_async(
        self: &Arc<Self>,
        dataitem_id: u64,
        backup_dir: std::path::PathBuf,
        backup_name: String,
        uid: u32,
        gid: u32,
    ) -> u64 {
        let this = Arc::clone(self);
        self.waits
            .spawn(async move { this.backup(dataitem_id, &backup_dir, &backup_name, uid, gid).await })
    }

    pub fn restore_async(
        self: &Arc<Self>,
        backup_dir: std::path::PathBuf,
        backup_name: String,
        dest_dataitem_id: u64,
        uid: u32,
        gid: u32,
    ) -> u64 {
        let this = Arc::clone(self);
        self.waits
            .spawn(async move { this.restore(&backup_dir, &backup_name, dest_dataitem_id, uid, gid).await })
    }

    /// Blocks until the operation behind `token` finishes, surfacing its
    /// failure if any. A token can only be waited on once; re-waiting an
    /// already-consumed token is reported as `FAM_ERR_INVALID_OPTION`.
    pub async fn wait_for(&self, token: u64) -> FamResult<()> {
        self.waits.wait_for(token).await
    }

    pub async fn acquire_cas_lock(&self, region_id: u64, offset: u64) -> u64 {
        let guard = self.cas_locks.lock(region_id, offset).await;
        let token = self.next_cas_token.fetch_add(1, Ordering::SeqCst);
        self.cas_tokens.lock().insert(token, (region_id, offset, guard));
        token
    }

    pub fn release_cas_lock(&self, token: u64) -> FamResult<()> {
        let (region_id, offset, guard) = self
            .cas_tokens
            .lock()
            .remove(&token)
            .ok_or_else(|| FamError::InvalidOption(format!("unknown CAS lock token {token}")))?;
        drop(guard);
        self.cas_locks.forget(region_id, offset);
        Ok(())
    }

    async fn collect_failures(mut joins: JoinSet<(u64, FamResult<()>)>) -> Vec<(String, FamError)> {
        let mut failures = Vec::new();
        while let Some(res) = joins.join_next().await {
            match res {
                Ok((peer, Err(e))) => failures.push((peer.to_string(), e)),
                Ok((_, Ok(()))) => {}
                Err(join_err) => {
                    warn!("memory server task panicked: {join_err}");
                    failures.push(("unknown".to_string(), FamError::Resource(1, join_err.to_string())));
                }
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fam_common::model::{MemoryType, PermissionLevel, RedundancyLevel};
    use fam_mds::memserver_table::MemserverEntry;
    use fam_mds::rpc_server::MdsDispatcher;
    use fam_mds::MdsState;
    use fam_ms::rpc_server::MsDispatcher;
    use fam_ms::{MemoryServer, MsConfig};
    use fam_rdma::provider::LoopbackProvider;
    use fam_rpc::Dispatcher;

    /// Wraps a `Dispatcher` as a `Transport` without going over a socket —
    /// lets coordinator tests exercise the exact same wire-encode/decode
    /// path the TCP transports use, in-process.
    struct LocalTransport(Arc<dyn Dispatcher>);

    #[async_trait::async_trait]
    impl Transport for LocalTransport {
        async fn unary(&self, method: &str, payload: Vec<u8>) -> FamResult<Vec<u8>> {
            self.0.dispatch(method, payload).await
        }
    }

    async fn harness(dir: &std::path::Path, num_ms: u64) -> Arc<CisCoordinator> {
        let mds_state = Arc::new(MdsState::new(1 << 16));
        for id in 0..num_ms {
            mds_state.memservers.register(MemserverEntry {
                node_id: id,
                fabric_address: vec![],
                capacity: 1 << 30,
            });
        }
        let mds: Arc<dyn Transport> = Arc::new(LocalTransport(Arc::new(MdsDispatcher { state: mds_state })));

        let mut memservers = HashMap::new();
        for id in 0..num_ms {
            let ms_dir = dir.join(format!("ms{id}"));
            std::fs::create_dir_all(&ms_dir).unwrap();
            let server = Arc::new(
                MemoryServer::start(
                    MsConfig {
                        node_id: id,
                        data_dir: ms_dir,
                        num_atomic_threads: 1,
                    },
                    Arc::new(LoopbackProvider::new()),
                )
                .unwrap(),
            );
            let transport: Arc<dyn Transport> = Arc::new(LocalTransport(Arc::new(MsDispatcher { server })));
            memservers.insert(id, transport);
        }

        Arc::new(CisCoordinator::new(mds, memservers))
    }

    #[tokio::test]
    async fn create_allocate_write_read_destroy_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cis = harness(dir.path(), 2).await;

        let (region, _offset) = cis
            .create_region(
                "r1".into(),
                1 << 20,
                Mode(0o700),
                RedundancyLevel::Raid1,
                MemoryType::Volatile,
                true,
                PermissionLevel::Region,
                10,
                10,
            )
            .await
            .unwrap();

        let item = cis
            .allocate(Some("item1".into()), region.region_id.0, 4096, Mode(0o600), 10, 10)
            .await
            .unwrap();
        cis.write_item(&item, 0, b"hello world").await.unwrap();
        let back = cis.read_item(&item, 0, 11).await.unwrap();
        assert_eq!(back, b"hello world");

        cis.deallocate(item.dataitem_id.0, 10, 10).await.unwrap();
        cis.destroy_region(region.region_id.0, 10, 10).await.unwrap();
    }

    #[tokio::test]
    async fn destroy_region_stays_reserved_while_a_client_holds_it_open() {
        let dir = tempfile::tempdir().unwrap();
        let cis = harness(dir.path(), 1).await;
        let (region, _offset) = cis
            .create_region(
                "r2".into(),
                1 << 20,
                Mode(0o700),
                RedundancyLevel::Raid1,
                MemoryType::Volatile,
                false,
                PermissionLevel::Region,
                0,
                0,
            )
            .await
            .unwrap();

        let (_region, keys) = cis.open_region(region.region_id.0, 0, 0).await.unwrap();
        assert_eq!(keys.len(), 1);

        // A handle is still open, so the memory server reports IN_USE and
        // the id must not go back into the bitmap yet.
        cis.destroy_region(region.region_id.0, 0, 0).await.unwrap();
        let (reused_id, _) = cis.reserve_region().await.unwrap();
        assert_ne!(reused_id, region.region_id.0);

        cis.close_region(region.region_id.0).await.unwrap();
    }

    #[tokio::test]
    async fn copy_async_reports_completion_through_wait_for() {
        let dir = tempfile::tempdir().unwrap();
        let cis = harness(dir.path(), 1).await;
        let (src_region, _) = cis
            .create_region(
                "r3src".into(),
                1 << 20,
                Mode(0o700),
                RedundancyLevel::Raid1,
                MemoryType::Volatile,
                false,
                PermissionLevel::Region,
                0,
                0,
            )
            .await
            .unwrap();
        let (dest_region, _) = cis
            .create_region(
                "r3dest".into(),
                1 << 20,
                Mode(0o700),
                RedundancyLevel::Raid1,
                MemoryType::Volatile,
                false,
                PermissionLevel::Region,
                0,
                0,
            )
            .await
            .unwrap();
        cis.write_region(&src_region, 0, b"copyme").await.unwrap();

        let token = cis.copy_async(src_region.region_id.0, 0, dest_region.region_id.0, 0, 6, 0, 0);
        cis.wait_for(token).await.unwrap();
        let back = cis.read_region(&dest_region, 0, 6).await.unwrap();
        assert_eq!(back, b"copyme");

        // The token is consumed by the first wait.
        assert!(matches!(cis.wait_for(token).await, Err(FamError::InvalidOption(_))));
    }

    #[tokio::test]
    async fn backup_then_restore_round_trips_a_dataitem() {
        let dir = tempfile::tempdir().unwrap();
        let cis = harness(dir.path(), 1).await;
        let backup_dir = tempfile::tempdir().unwrap();
        let (region, _) = cis
            .create_region(
                "r5".into(),
                1 << 20,
                Mode(0o700),
                RedundancyLevel::Raid1,
                MemoryType::Volatile,
                false,
                PermissionLevel::Region,
                7,
                7,
            )
            .await
            .unwrap();
        let item = cis
            .allocate(Some("item".into()), region.region_id.0, 256, Mode(0o600), 7, 7)
            .await
            .unwrap();
        cis.write_item(&item, 0, b"important bytes").await.unwrap();

        cis.backup(item.dataitem_id.0, backup_dir.path(), "snap1", 7, 7).await.unwrap();
        assert!(matches!(
            cis.backup(item.dataitem_id.0, backup_dir.path(), "snap1", 7, 7).await,
            Err(FamError::BackupFileExist)
        ));

        let restored = cis
            .allocate(Some("restored".into()), region.region_id.0, 256, Mode(0o600), 7, 7)
            .await
            .unwrap();
        cis.restore(backup_dir.path(), "snap1", restored.dataitem_id.0, 7, 7).await.unwrap();
        let back = cis.read_item(&restored, 0, 15).await.unwrap();
        assert_eq!(back, b"important bytes");
    }

    #[tokio::test]
    async fn resize_region_grows_every_memory_server() {
        let dir = tempfile::tempdir().unwrap();
        let cis = harness(dir.path(), 2).await;
        let (region, _) = cis
            .create_region(
                "r4".into(),
                2 << 20,
                Mode(0o700),
                RedundancyLevel::Raid1,
                MemoryType::Volatile,
                false,
                PermissionLevel::Region,
                0,
                0,
            )
            .await
            .unwrap();
        cis.resize_region(region.region_id.0, 8 << 20, 0, 0).await.unwrap();
        let grown: mds::RegionResponse =
            call(cis.mds.as_ref(), mds::GET_REGION, &mds::RegionIdRequest { region_id: region.region_id.0 })
                .await
                .unwrap();
        assert!(grown.region.size >= 8 << 20);
    }
}
