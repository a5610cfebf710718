//! Live memory-server roster: who registered, their fabric addresses,
//! and the `memserverinfo` blob served to clients at region-open time
//! (spec.md §3.1, §6).

use std::collections::BTreeMap;

use fam_common::error::{FamError, FamResult};
use fam_common::wire::{self, MemserverInfoEntry};
use parking_lot::RwLock;

#[derive(Debug, Clone)]
pub struct MemserverEntry {
    pub node_id: u64,
    pub fabric_address: Vec<u8>,
    pub capacity: u64,
}

#[derive(Default)]
pub struct MemserverTable {
    servers: RwLock<BTreeMap<u64, MemserverEntry>>,
}

impl MemserverTable {
    pub fn new() -> Self {
        MemserverTable::default()
    }

    pub fn register(&self, entry: MemserverEntry) {
        self.servers.write().insert(entry.node_id, entry);
    }

    pub fn unregister(&self, node_id: u64) {
        self.servers.write().remove(&node_id);
    }

    pub fn node_ids(&self) -> Vec<u64> {
        self.servers.read().keys().copied().collect()
    }

    pub fn get(&self, node_id: u64) -> Option<MemserverEntry> {
        self.servers.read().get(&node_id).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.read().is_empty()
    }

    fn entries(&self) -> Vec<MemserverInfoEntry> {
        self.servers
            .read()
            .values()
            .map(|server| MemserverInfoEntry {
                node_id: server.node_id,
                fabric_address: server.fabric_address.clone(),
            })
            .collect()
    }

    /// Backs `get_memserverinfo_size`.
    pub fn info_size(&self) -> u64 {
        wire::encode(&self.entries()).len() as u64
    }

    /// Backs `get_memserverinfo`.
    pub fn info_blob(&self) -> FamResult<Vec<u8>> {
        if self.is_empty() {
            return Err(FamError::MemservListEmpty);
        }
        Ok(wire::encode(&self.entries()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(node_id: u64) -> MemserverEntry {
        MemserverEntry {
            node_id,
            fabric_address: vec![node_id as u8; 4],
            capacity: 1 << 30,
        }
    }

    #[test]
    fn info_blob_round_trips_through_wire_decode() {
        let table = MemserverTable::new();
        table.register(entry(0));
        table.register(entry(1));
        let blob = table.info_blob().unwrap();
        assert_eq!(blob.len() as u64, table.info_size());
        let decoded = wire::decode(&blob).unwrap();
        assert_eq!(decoded.len(), 2);
    }

    #[test]
    fn empty_table_reports_memserv_list_empty() {
        let table = MemserverTable::new();
        assert!(matches!(table.info_blob(), Err(FamError::MemservListEmpty)));
    }

    #[test]
    fn unregister_removes_entry() {
        let table = MemserverTable::new();
        table.register(entry(0));
        table.unregister(0);
        assert!(table.get(0).is_none());
    }
}
