//! The client-side caches populated by `open_region`/`allocate`/
//! `lookup_item`: spec.md §3's "per-opened-region cache" of memory-server
//! keys, kept here rather than re-fetched on every data-path call.

use fam_common::model::DataItem;

/// A region's `Fam_Region_Memory_Map`: the memory servers it spans, in
/// order, and the fabric key each one assigned on open (spec.md §3).
#[derive(Debug, Clone)]
pub struct OpenedRegion {
    pub region_id: u64,
    pub memserver_ids: Vec<u64>,
    pub keys: Vec<u64>,
}

/// A data item's per-server spans plus the keys needed to address them
/// directly, handed back by `allocate`/`lookup_item`.
#[derive(Debug, Clone)]
pub struct OpenedItem {
    pub item: DataItem,
    pub keys: Vec<u64>,
}
