//! The regions→data-items catalog: name uniqueness, the region→MS-set
//! mapping, and uid/gid/mode permission checks (spec.md §2, §3, §4.1).

use std::collections::HashMap;

use fam_common::error::{FamError, FamResult};
use fam_common::model::{DataItem, DataItemId, Mode, PermissionLevel, Region, RegionId};
use parking_lot::RwLock;

fn check_access(uid: u32, gid: u32, owner_uid: u32, owner_gid: u32, mode: Mode, want_write: bool) -> FamResult<()> {
    let is_owner = uid == owner_uid;
    let is_group = gid == owner_gid;
    let allowed = if want_write {
        mode.writable_by(is_owner, is_group)
    } else {
        mode.readable_by(is_owner, is_group)
    };
    if allowed {
        Ok(())
    } else {
        Err(FamError::NoPermission)
    }
}

#[derive(Default)]
struct Catalog {
    regions: HashMap<RegionId, Region>,
    regions_by_name: HashMap<String, RegionId>,
    items: HashMap<DataItemId, DataItem>,
    items_by_name: HashMap<(RegionId, String), DataItemId>,
}

/// Thread-safe front for the catalog; one instance per MDS process.
pub struct MetadataCatalog {
    inner: RwLock<Catalog>,
}

impl MetadataCatalog {
    pub fn new() -> Self {
        MetadataCatalog {
            inner: RwLock::new(Catalog::default()),
        }
    }

    pub fn insert_region(&self, region: Region) -> FamResult<()> {
        let mut catalog = self.inner.write();
        if catalog.regions_by_name.contains_key(&region.name) {
            return Err(FamError::InvalidOption(format!("region name {} already exists", region.name)));
        }
        catalog.regions_by_name.insert(region.name.clone(), region.region_id);
        catalog.regions.insert(region.region_id, region);
        Ok(())
    }

    pub fn get_region(&self, region_id: RegionId) -> FamResult<Region> {
        self.inner.read().regions.get(&region_id).cloned().ok_or(FamError::RegionNotFound)
    }

    pub fn lookup_region(&self, name: &str) -> FamResult<Region> {
        let catalog = self.inner.read();
        let id = catalog.regions_by_name.get(name).ok_or(FamError::RegionNotFound)?;
        catalog.regions.get(id).cloned().ok_or(FamError::RegionNotFound)
    }

    pub fn remove_region(&self, region_id: RegionId) -> FamResult<Region> {
        let mut catalog = self.inner.write();
        let region = catalog.regions.remove(&region_id).ok_or(FamError::RegionNotFound)?;
        catalog.regions_by_name.remove(&region.name);
        Ok(region)
    }

    pub fn insert_item(&self, item: DataItem) -> FamResult<()> {
        let mut catalog = self.inner.write();
        if let Some(name) = item.name.clone() {
            let key = (item.region_id, name);
            if catalog.items_by_name.contains_key(&key) {
                return Err(FamError::InvalidOption(format!("data item name {:?} already exists", key.1)));
            }
            catalog.items_by_name.insert(key, item.dataitem_id);
        }
        catalog.items.insert(item.dataitem_id, item);
        Ok(())
    }

    pub fn get_item(&self, id: DataItemId) -> FamResult<DataItem> {
        self.inner.read().items.get(&id).cloned().ok_or(FamError::DataItemNotFound)
    }

    pub fn lookup_item(&self, region_id: RegionId, name: &str) -> FamResult<DataItem> {
        let catalog = self.inner.read();
        let id = catalog
            .items_by_name
            .get(&(region_id, name.to_string()))
            .ok_or(FamError::DataItemNotFound)?;
        catalog.items.get(id).cloned().ok_or(FamError::DataItemNotFound)
    }

    pub fn remove_item(&self, id: DataItemId) -> FamResult<DataItem> {
        let mut catalog = self.inner.write();
        let item = catalog.items.remove(&id).ok_or(FamError::DataItemNotFound)?;
        if let Some(name) = &item.name {
            catalog.items_by_name.remove(&(item.region_id, name.clone()));
        }
        Ok(item)
    }

    pub fn set_region_mode(&self, region_id: RegionId, uid: u32, gid: u32, new_mode: Mode) -> FamResult<()> {
        let mut catalog = self.inner.write();
        let region = catalog.regions.get_mut(&region_id).ok_or(FamError::RegionNotFound)?;
        if region.uid != uid {
            return Err(FamError::RegionPermModifyNotPermitted);
        }
        region.mode = new_mode;
        let _ = gid;
        Ok(())
    }

    pub fn set_item_mode(&self, id: DataItemId, uid: u32, new_mode: Mode) -> FamResult<()> {
        let mut catalog = self.inner.write();
        let item = catalog.items.get_mut(&id).ok_or(FamError::DataItemNotFound)?;
        if item.uid != uid {
            return Err(FamError::ItemPermModifyNotPermitted);
        }
        item.mode = new_mode;
        Ok(())
    }

    /// Grows a region's recorded size. Only the owner may resize, and
    /// only upward — shrinking could strand already-allocated data items.
    pub fn resize_region(&self, region_id: RegionId, uid: u32, new_size: u64) -> FamResult<Region> {
        let mut catalog = self.inner.write();
        let region = catalog.regions.get_mut(&region_id).ok_or(FamError::RegionNotFound)?;
        if region.uid != uid || new_size < region.size {
            return Err(FamError::RegionResizeNotPermitted);
        }
        region.size = new_size;
        Ok(region.clone())
    }

    pub fn authorize_region(&self, region_id: RegionId, uid: u32, gid: u32, want_write: bool) -> FamResult<Region> {
        let region = self.get_region(region_id)?;
        check_access(uid, gid, region.uid, region.gid, region.mode, want_write)?;
        Ok(region)
    }

    pub fn authorize_item(&self, id: DataItemId, uid: u32, gid: u32, want_write: bool) -> FamResult<DataItem> {
        let item = self.get_item(id)?;
        match item.permission_level {
            PermissionLevel::DataItem => {
                check_access(uid, gid, item.uid, item.gid, item.mode, want_write)?;
            }
            PermissionLevel::Region => {
                self.authorize_region(item.region_id, uid, gid, want_write)?;
            }
        }
        Ok(item)
    }
}

impl Default for MetadataCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fam_common::model::{MemoryType, PermissionLevel, RedundancyLevel};

    fn region(id: u64, name: &str, uid: u32, mode: u32) -> Region {
        Region {
            region_id: RegionId(id),
            name: name.to_string(),
            uid,
            gid: uid,
            mode: Mode(mode),
            size: 1 << 20,
            redundancy_level: RedundancyLevel::Raid1,
            memory_type: MemoryType::Volatile,
            interleave_enable: true,
            permission_level: PermissionLevel::Region,
            memserver_ids: vec![0],
        }
    }

    #[test]
    fn duplicate_region_name_is_rejected() {
        let catalog = MetadataCatalog::new();
        catalog.insert_region(region(1, "a", 0, 0o700)).unwrap();
        let result = catalog.insert_region(region(2, "a", 0, 0o700));
        assert!(result.is_err());
    }

    #[test]
    fn non_owner_write_is_denied() {
        let catalog = MetadataCatalog::new();
        catalog.insert_region(region(1, "a", 10, 0o700)).unwrap();
        let result = catalog.authorize_region(RegionId(1), 20, 20, true);
        assert!(matches!(result, Err(FamError::NoPermission)));
    }

    #[test]
    fn owner_write_is_permitted() {
        let catalog = MetadataCatalog::new();
        catalog.insert_region(region(1, "a", 10, 0o700)).unwrap();
        assert!(catalog.authorize_region(RegionId(1), 10, 10, true).is_ok());
    }

    #[test]
    fn resize_region_requires_ownership_and_growth() {
        let catalog = MetadataCatalog::new();
        catalog.insert_region(region(1, "a", 10, 0o700)).unwrap();
        assert!(matches!(
            catalog.resize_region(RegionId(1), 99, 1 << 21),
            Err(FamError::RegionResizeNotPermitted)
        ));
        assert!(matches!(
            catalog.resize_region(RegionId(1), 10, 100),
            Err(FamError::RegionResizeNotPermitted)
        ));
        let resized = catalog.resize_region(RegionId(1), 10, 1 << 21).unwrap();
        assert_eq!(resized.size, 1 << 21);
    }

    #[test]
    fn mode_change_requires_ownership() {
        let catalog = MetadataCatalog::new();
        catalog.insert_region(region(1, "a", 10, 0o700)).unwrap();
        let result = catalog.set_region_mode(RegionId(1), 99, 99, Mode(0o777));
        assert!(matches!(result, Err(FamError::RegionPermModifyNotPermitted)));
    }
}
