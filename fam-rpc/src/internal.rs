//! The internal MDS/MS wire contract: method names and JSON-encoded
//! request/response structs carried inside the same `Envelope`/
//! `EnvelopeResponse` framing the client-facing `fam` proto uses,
//! distinguished only by the method string a `Dispatcher` matches on.
//! Unlike the client-facing types (prost, matching the source's IDL),
//! this boundary is implementation-internal, so plain `serde_json` over
//! the existing `fam_common::model` types is the simpler choice.

use fam_common::error::FamResult;
use fam_common::model::{DataItem, Mode, Region};
use serde::{Deserialize, Serialize};

pub fn encode<T: Serialize>(value: &T) -> Vec<u8> {
    serde_json::to_vec(value).expect("internal rpc payloads are always serializable")
}

pub fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> FamResult<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| fam_common::error::FamError::Rpc(format!("bad internal payload: {e}")))
}

pub mod mds {
    use super::*;

    pub const RESERVE_REGION_ID: &str = "Mds.ReserveRegionId";
    pub const RELEASE_REGION_ID: &str = "Mds.ReleaseRegionId";
    pub const INSERT_REGION: &str = "Mds.InsertRegion";
    pub const GET_REGION: &str = "Mds.GetRegion";
    pub const LOOKUP_REGION_BY_NAME: &str = "Mds.LookupRegionByName";
    pub const REMOVE_REGION: &str = "Mds.RemoveRegion";
    pub const AUTHORIZE_REGION: &str = "Mds.AuthorizeRegion";
    pub const SET_REGION_MODE: &str = "Mds.SetRegionMode";
    pub const RESIZE_REGION: &str = "Mds.ResizeRegion";
    pub const INSERT_ITEM: &str = "Mds.InsertItem";
    pub const LOOKUP_ITEM_BY_NAME: &str = "Mds.LookupItemByName";
    pub const AUTHORIZE_ITEM: &str = "Mds.AuthorizeItem";
    pub const REMOVE_ITEM: &str = "Mds.RemoveItem";
    pub const SET_ITEM_MODE: &str = "Mds.SetItemMode";
    pub const PICK_MEMSERVERS: &str = "Mds.PickMemservers";
    pub const REGISTER_MEMSERVER: &str = "Mds.RegisterMemserver";
    pub const MEMSERVER_INFO_SIZE: &str = "Mds.MemserverInfoSize";
    pub const MEMSERVER_INFO_BLOB: &str = "Mds.MemserverInfoBlob";

    #[derive(Debug, Serialize, Deserialize)]
    pub struct RegionIdResponse {
        pub region_id: Option<u64>,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct RegionIdRequest {
        pub region_id: u64,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct RegionResponse {
        pub region: Region,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct NameRequest {
        pub name: String,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct AuthorizeRegionRequest {
        pub region_id: u64,
        pub uid: u32,
        pub gid: u32,
        pub want_write: bool,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct AuthorizeItemRequest {
        pub dataitem_id: u64,
        pub uid: u32,
        pub gid: u32,
        pub want_write: bool,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct ItemResponse {
        pub item: DataItem,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct ResizeRegionRequest {
        pub region_id: u64,
        pub uid: u32,
        pub new_size: u64,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct SetModeRequest {
        pub id: u64,
        pub uid: u32,
        pub gid: u32,
        pub mode: Mode,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct DataItemIdRequest {
        pub dataitem_id: u64,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct LookupItemRequest {
        pub region_id: u64,
        pub name: String,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct MemserversResponse {
        pub memserver_ids: Vec<u64>,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct RegisterMemserverRequest {
        pub node_id: u64,
        pub fabric_address: Vec<u8>,
        pub capacity: u64,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct SizeResponse {
        pub size: u64,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct BlobResponse {
        pub data: Vec<u8>,
    }
}

pub mod ms {
    use super::*;

    pub const CREATE_VOLATILE_REGION: &str = "Ms.CreateVolatileRegion";
    pub const CREATE_PERSISTENT_REGION: &str = "Ms.CreatePersistentRegion";
    pub const DESTROY_REGION: &str = "Ms.DestroyRegion";
    pub const RESIZE_REGION: &str = "Ms.ResizeRegion";
    pub const ALLOCATE_ITEM: &str = "Ms.AllocateItem";
    pub const DEALLOCATE_ITEM: &str = "Ms.DeallocateItem";
    pub const PUT_ATOMIC: &str = "Ms.PutAtomic";
    pub const GET_ATOMIC: &str = "Ms.GetAtomic";
    pub const SCATTER_STRIDED: &str = "Ms.ScatterStrided";
    pub const SCATTER_INDEXED: &str = "Ms.ScatterIndexed";
    pub const GATHER_STRIDED: &str = "Ms.GatherStrided";
    pub const GATHER_INDEXED: &str = "Ms.GatherIndexed";
    pub const REGION_KEY: &str = "Ms.RegionKey";
    pub const OPEN_REGION_HANDLE: &str = "Ms.OpenRegionHandle";
    pub const CLOSE_REGION_HANDLE: &str = "Ms.CloseRegionHandle";
    pub const ATOMIC: &str = "Ms.Atomic";
    pub const FETCH_ATOMIC: &str = "Ms.FetchAtomic";
    pub const COMPARE_ATOMIC: &str = "Ms.CompareAtomic";

    #[derive(Debug, Serialize, Deserialize)]
    pub struct KeyResponse {
        pub key: u64,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct CreateRegionRequest {
        pub region_id: u64,
        pub size: u64,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct RegionIdRequest {
        pub region_id: u64,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct ResizeRegionRequest {
        pub region_id: u64,
        pub new_size: u64,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct AllocateItemRequest {
        pub region_id: u64,
        pub size: u64,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct OffsetResponse {
        pub offset: u64,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct DeallocateItemRequest {
        pub region_id: u64,
        pub offset: u64,
        pub size: u64,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct PutAtomicRequest {
        pub client_node_id: u64,
        pub region_id: u64,
        pub offset: u64,
        pub data: Vec<u8>,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct GetAtomicRequest {
        pub region_id: u64,
        pub offset: u64,
        pub len: usize,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct DataResponse {
        pub data: Vec<u8>,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct ScatterStridedRequest {
        pub client_node_id: u64,
        pub region_id: u64,
        pub data: Vec<u8>,
        pub first_element: u64,
        pub stride: u64,
        pub element_size: u64,
        pub nelements: u64,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct ScatterIndexedRequest {
        pub client_node_id: u64,
        pub region_id: u64,
        pub data: Vec<u8>,
        pub indexes: Vec<u64>,
        pub element_size: u64,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct GatherStridedRequest {
        pub region_id: u64,
        pub first_element: u64,
        pub stride: u64,
        pub element_size: u64,
        pub nelements: u64,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct GatherIndexedRequest {
        pub region_id: u64,
        pub indexes: Vec<u64>,
        pub element_size: u64,
    }

    /// Wire-level status for `DESTROY_REGION`: whether this server still
    /// has an open handle on the region (spec.md §4.1, Property #9).
    #[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
    pub enum DestroyStatusWire {
        Released,
        InUse,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct DestroyStatusResponse {
        pub status: DestroyStatusWire,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct KeyU64Response {
        pub key: u64,
    }

    /// Wire encoding of `fam_rdma::provider::{AtomicOp, AtomicValue}`,
    /// kept independent of `fam-rdma` so `fam-rpc` stays a pure transport
    /// crate (Design Note §9: the coordinator only depends on capability
    /// traits, never on a sibling crate's internal types).
    #[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
    pub enum AtomicOpWire {
        Sum,
        Min,
        Max,
        Swap,
    }

    #[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
    pub enum AtomicValueWire {
        I64(i64),
        U64(u64),
        F64Bits(u64),
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct AtomicRequest {
        pub region_id: u64,
        pub offset: u64,
        pub op: AtomicOpWire,
        pub operand: AtomicValueWire,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct AtomicValueResponse {
        pub value: AtomicValueWire,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct CompareAtomicRequest {
        pub region_id: u64,
        pub offset: u64,
        pub expected: AtomicValueWire,
        pub desired: AtomicValueWire,
    }
}

/// Method names for the external, client-facing `fam.Cis` service. Unlike
/// `mds`/`ms`, the request/response types for this boundary are the
/// prost messages generated from `proto/fam.proto` (`crate::fam`), so this
/// module carries only the method-name constants a `Dispatcher`/`Transport`
/// pair matches on.
pub mod cis {
    pub const CREATE_REGION: &str = "Cis.CreateRegion";
    pub const DESTROY_REGION: &str = "Cis.DestroyRegion";
    pub const RESIZE_REGION: &str = "Cis.ResizeRegion";
    pub const OPEN_REGION: &str = "Cis.OpenRegion";
    pub const CLOSE_REGION: &str = "Cis.CloseRegion";
    pub const ALLOCATE: &str = "Cis.Allocate";
    pub const DEALLOCATE: &str = "Cis.Deallocate";
    pub const CHANGE_REGION_PERMISSION: &str = "Cis.ChangeRegionPermission";
    pub const CHANGE_DATAITEM_PERMISSION: &str = "Cis.ChangeDataitemPermission";
    pub const LOOKUP_REGION: &str = "Cis.LookupRegion";
    pub const LOOKUP_ITEM: &str = "Cis.LookupItem";
    pub const COPY: &str = "Cis.Copy";
    pub const BACKUP: &str = "Cis.Backup";
    pub const RESTORE: &str = "Cis.Restore";
    pub const DELETE_BACKUP: &str = "Cis.DeleteBackup";
    pub const WAIT_FOR: &str = "Cis.WaitFor";
    pub const ACQUIRE_CAS_LOCK: &str = "Cis.AcquireCasLock";
    pub const RELEASE_CAS_LOCK: &str = "Cis.ReleaseCasLock";
    pub const GET_MEMSERVER_INFO_SIZE: &str = "Cis.GetMemserverInfoSize";
    pub const GET_MEMSERVER_INFO: &str = "Cis.GetMemserverInfo";
    pub const PUT_ATOMIC: &str = "Cis.PutAtomic";
    pub const GET_ATOMIC: &str = "Cis.GetAtomic";
    pub const SCATTER_STRIDED_ATOMIC: &str = "Cis.ScatterStridedAtomic";
    pub const GATHER_STRIDED_ATOMIC: &str = "Cis.GatherStridedAtomic";
    pub const SCATTER_INDEXED_ATOMIC: &str = "Cis.ScatterIndexedAtomic";
    pub const GATHER_INDEXED_ATOMIC: &str = "Cis.GatherIndexedAtomic";
}
