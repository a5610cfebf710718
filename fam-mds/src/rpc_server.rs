//! Dispatches the internal MDS protocol (`fam_rpc::internal::mds`) onto
//! `MdsState`, so a `fam-cis` coordinator running in a separate process
//! can reach the catalog, region-id bitmap, and memserver table over
//! `fam_rpc::Transport`.

use std::sync::Arc;

use async_trait::async_trait;
use fam_common::error::{FamError, FamResult};
use fam_rpc::internal::{decode, encode, mds::*};
use fam_rpc::Dispatcher;

use crate::memserver_table::MemserverEntry;
use crate::MdsState;

pub struct MdsDispatcher {
    pub state: Arc<MdsState>,
}

#[async_trait]
impl Dispatcher for MdsDispatcher {
    async fn dispatch(&self, method: &str, payload: Vec<u8>) -> FamResult<Vec<u8>> {
        let state = &self.state;
        match method {
            RESERVE_REGION_ID => Ok(encode(&RegionIdResponse {
                region_id: state.region_ids.reserve(),
            })),
            RELEASE_REGION_ID => {
                let req: RegionIdRequest = decode(&payload)?;
                state.region_ids.release(req.region_id);
                Ok(encode(&()))
            }
            INSERT_REGION => {
                let req: RegionResponse = decode(&payload)?;
                state.catalog.insert_region(req.region)?;
                Ok(encode(&()))
            }
            GET_REGION => {
                let req: RegionIdRequest = decode(&payload)?;
                let region = state.catalog.get_region(fam_common::model::RegionId(req.region_id))?;
                Ok(encode(&RegionResponse { region }))
            }
            LOOKUP_REGION_BY_NAME => {
                let req: NameRequest = decode(&payload)?;
                let region = state.catalog.lookup_region(&req.name)?;
                Ok(encode(&RegionResponse { region }))
            }
            REMOVE_REGION => {
                let req: RegionIdRequest = decode(&payload)?;
                let region = state.catalog.remove_region(fam_common::model::RegionId(req.region_id))?;
                Ok(encode(&RegionResponse { region }))
            }
            AUTHORIZE_REGION => {
                let req: AuthorizeRegionRequest = decode(&payload)?;
                let region = state.catalog.authorize_region(
                    fam_common::model::RegionId(req.region_id),
                    req.uid,
                    req.gid,
                    req.want_write,
                )?;
                Ok(encode(&RegionResponse { region }))
            }
            RESIZE_REGION => {
                let req: ResizeRegionRequest = decode(&payload)?;
                let region = state
                    .catalog
                    .resize_region(fam_common::model::RegionId(req.region_id), req.uid, req.new_size)?;
                Ok(encode(&RegionResponse { region }))
            }
            SET_REGION_MODE => {
                let req: SetModeRequest = decode(&payload)?;
                state
                    .catalog
                    .set_region_mode(fam_common::model::RegionId(req.id), req.uid, req.gid, req.mode)?;
                Ok(encode(&()))
            }
            INSERT_ITEM => {
                let req: ItemResponse = decode(&payload)?;
                state.catalog.insert_item(req.item)?;
                Ok(encode(&()))
            }
            AUTHORIZE_ITEM => {
                let req: AuthorizeItemRequest = decode(&payload)?;
                let item = state.catalog.authorize_item(
                    fam_common::model::DataItemId(req.dataitem_id),
                    req.uid,
                    req.gid,
                    req.want_write,
                )?;
                Ok(encode(&ItemResponse { item }))
            }
            LOOKUP_ITEM_BY_NAME => {
                let req: LookupItemRequest = decode(&payload)?;
                let item = state
                    .catalog
                    .lookup_item(fam_common::model::RegionId(req.region_id), &req.name)?;
                Ok(encode(&ItemResponse { item }))
            }
            REMOVE_ITEM => {
                let req: DataItemIdRequest = decode(&payload)?;
                let item = state.catalog.remove_item(fam_common::model::DataItemId(req.dataitem_id))?;
                Ok(encode(&ItemResponse { item }))
            }
            SET_ITEM_MODE => {
                let req: SetModeRequest = decode(&payload)?;
                state
                    .catalog
                    .set_item_mode(fam_common::model::DataItemId(req.id), req.uid, req.mode)?;
                Ok(encode(&()))
            }
            PICK_MEMSERVERS => {
                let memserver_ids = state.pick_memservers()?;
                Ok(encode(&MemserversResponse { memserver_ids }))
            }
            REGISTER_MEMSERVER => {
                let req: RegisterMemserverRequest = decode(&payload)?;
                state.memservers.register(MemserverEntry {
                    node_id: req.node_id,
                    fabric_address: req.fabric_address,
                    capacity: req.capacity,
                });
                Ok(encode(&()))
            }
            MEMSERVER_INFO_SIZE => Ok(encode(&SizeResponse {
                size: state.memservers.info_size(),
            })),
            MEMSERVER_INFO_BLOB => {
                let data = state.memservers.info_blob()?;
                Ok(encode(&BlobResponse { data }))
            }
            other => Err(FamError::Rpc(format!("unknown MDS method {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fam_common::model::{MemoryType, PermissionLevel, RedundancyLevel, RegionId};

    fn region(id: u64) -> fam_common::model::Region {
        fam_common::model::Region {
            region_id: RegionId(id),
            name: format!("r{id}"),
            uid: 0,
            gid: 0,
            mode: fam_common::model::Mode(0o700),
            size: 4096,
            redundancy_level: RedundancyLevel::Raid1,
            memory_type: MemoryType::Volatile,
            interleave_enable: false,
            permission_level: PermissionLevel::Region,
            memserver_ids: vec![0],
        }
    }

    #[tokio::test]
    async fn insert_then_lookup_region_round_trips_over_dispatch() {
        let dispatcher = MdsDispatcher {
            state: Arc::new(MdsState::new(16)),
        };
        let payload = encode(&RegionResponse { region: region(1) });
        dispatcher.dispatch(INSERT_REGION, payload).await.unwrap();

        let req = encode(&NameRequest { name: "r1".into() });
        let resp = dispatcher.dispatch(LOOKUP_REGION_BY_NAME, req).await.unwrap();
        let resp: RegionResponse = decode(&resp).unwrap();
        assert_eq!(resp.region.region_id.0, 1);
    }

    #[tokio::test]
    async fn unknown_method_is_reported_as_rpc_error() {
        let dispatcher = MdsDispatcher {
            state: Arc::new(MdsState::new(16)),
        };
        let result = dispatcher.dispatch("Mds.Nonexistent", Vec::new()).await;
        assert!(matches!(result, Err(FamError::Rpc(_))));
    }
}
