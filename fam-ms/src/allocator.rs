//! Per-memory-server region storage and the data-item sub-allocator
//! carved out of each region, reusing `fam_atl::staging::StagingAllocator`
//! (its doc comment names this exact module as the intended consumer).
//! Volatile regions live in a plain `Vec<u8>`; persistent regions are
//! backed by `fam_atl::backing::MmapRegion`, the same mmap-over-file
//! primitive the ATL uses for its own durable state.

use std::collections::HashMap;
use std::path::PathBuf;

use std::sync::atomic::{AtomicU32, Ordering};

use fam_atl::backing::MmapRegion;
use fam_atl::staging::StagingAllocator;
use fam_atl::Destination;
use fam_common::error::{FamError, FamResult};
use fam_common::model::{align_up, DestroyStatus, ALLOC_ALIGN, MIN_OBJ_SIZE};
use parking_lot::{Mutex, RwLock};

enum Backing {
    Volatile(Mutex<Vec<u8>>),
    Persistent(Mutex<MmapRegion>),
}

impl Backing {
    fn write_at(&self, offset: u64, data: &[u8]) -> FamResult<()> {
        let start = offset as usize;
        let end = start + data.len();
        match self {
            Backing::Volatile(bytes) => {
                let mut bytes = bytes.lock();
                if end > bytes.len() {
                    return Err(FamError::OutOfRange);
                }
                bytes[start..end].copy_from_slice(data);
                Ok(())
            }
            Backing::Persistent(region) => {
                let mut region = region.lock();
                if end > region.len() {
                    return Err(FamError::OutOfRange);
                }
                region.as_mut_slice()[start..end].copy_from_slice(data);
                region.persist()
            }
        }
    }

    fn read_at(&self, offset: u64, len: usize) -> FamResult<Vec<u8>> {
        let start = offset as usize;
        let end = start + len;
        match self {
            Backing::Volatile(bytes) => {
                let bytes = bytes.lock();
                if end > bytes.len() {
                    return Err(FamError::OutOfRange);
                }
                Ok(bytes[start..end].to_vec())
            }
            Backing::Persistent(region) => {
                let region = region.lock();
                if end > region.len() {
                    return Err(FamError::OutOfRange);
                }
                Ok(region.as_slice()[start..end].to_vec())
            }
        }
    }

    fn len(&self) -> usize {
        match self {
            Backing::Volatile(bytes) => bytes.lock().len(),
            Backing::Persistent(region) => region.lock().len(),
        }
    }
}

struct RegionSlot {
    backing: Backing,
    sub_alloc: StagingAllocator,
    /// Number of clients currently holding this region open. A server-side
    /// refcount ensures memory stays registered while any client has the
    /// region open (spec.md §3, "Per-opened-region cache").
    open_handles: AtomicU32,
}

/// Where a memory server keeps its persistent region files.
pub struct StoreConfig {
    pub data_dir: PathBuf,
}

/// All regions resident on this memory server. Implements
/// `fam_atl::Destination` so a `QueueWorker` can apply durable writes
/// directly against it.
pub struct RegionStore {
    config: StoreConfig,
    regions: RwLock<HashMap<u64, RegionSlot>>,
}

impl RegionStore {
    pub fn new(config: StoreConfig) -> Self {
        RegionStore {
            config,
            regions: RwLock::new(HashMap::new()),
        }
    }

    pub fn create_volatile(&self, region_id: u64, size: u64) -> FamResult<()> {
        let mut regions = self.regions.write();
        if regions.contains_key(&region_id) {
            return Err(FamError::InvalidOption(format!("region {region_id} already exists locally")));
        }
        regions.insert(
            region_id,
            RegionSlot {
                backing: Backing::Volatile(Mutex::new(vec![0u8; size as usize])),
                sub_alloc: StagingAllocator::new(size as usize),
                open_handles: AtomicU32::new(0),
            },
        );
        Ok(())
    }

    pub fn create_persistent(&self, region_id: u64, size: u64) -> FamResult<()> {
        let mut regions = self.regions.write();
        if regions.contains_key(&region_id) {
            return Err(FamError::InvalidOption(format!("region {region_id} already exists locally")));
        }
        let path = self.config.data_dir.join(format!("region-{region_id}.bin"));
        let mmap = MmapRegion::open(&path, size as usize)?;
        regions.insert(
            region_id,
            RegionSlot {
                backing: Backing::Persistent(Mutex::new(mmap)),
                sub_alloc: StagingAllocator::new(size as usize),
                open_handles: AtomicU32::new(0),
            },
        );
        Ok(())
    }

    /// Increments the open-handle refcount, the server side of
    /// `open_region`'s "memory stays registered while any client has the
    /// region open" invariant.
    pub fn open_handle(&self, region_id: u64) -> FamResult<()> {
        let regions = self.regions.read();
        let slot = regions.get(&region_id).ok_or(FamError::RegionNotFound)?;
        slot.open_handles.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub fn close_handle(&self, region_id: u64) -> FamResult<()> {
        let regions = self.regions.read();
        let slot = regions.get(&region_id).ok_or(FamError::RegionNotFound)?;
        slot.open_handles.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1))).ok();
        Ok(())
    }

    /// Property #9: a region whose refcount is nonzero stays `InUse` and
    /// is not removed; the caller (CIS) only returns its id to the bitmap
    /// once every participating server reports `Released`.
    pub fn destroy(&self, region_id: u64) -> FamResult<DestroyStatus> {
        let mut regions = self.regions.write();
        let open = match regions.get(&region_id) {
            Some(slot) => slot.open_handles.load(Ordering::SeqCst),
            None => return Err(FamError::RegionNotFound),
        };
        if open > 0 {
            return Ok(DestroyStatus::InUse);
        }
        regions.remove(&region_id);
        Ok(DestroyStatus::Released)
    }

    /// Grows a region in place: volatile regions extend their backing
    /// `Vec`, persistent regions are rejected since `MmapRegion` is a
    /// fixed-size file mapping. Shrinking is never permitted — a smaller
    /// ceiling could strand live data-item allocations.
    pub fn resize(&self, region_id: u64, new_size: u64) -> FamResult<()> {
        let regions = self.regions.read();
        let slot = regions.get(&region_id).ok_or(FamError::RegionNotFound)?;
        let current = slot.backing.len() as u64;
        if new_size < current {
            return Err(FamError::RegionResizeNotPermitted);
        }
        match &slot.backing {
            Backing::Volatile(bytes) => {
                bytes.lock().resize(new_size as usize, 0);
            }
            Backing::Persistent(_) => return Err(FamError::RegionResizeNotPermitted),
        }
        slot.sub_alloc.grow(new_size as usize);
        Ok(())
    }

    pub fn region_size(&self, region_id: u64) -> FamResult<usize> {
        let regions = self.regions.read();
        let slot = regions.get(&region_id).ok_or(FamError::RegionNotFound)?;
        Ok(slot.backing.len())
    }

    /// Reserves a data-item's per-server allocation, aligned and floored
    /// per spec.md §3.
    pub fn allocate_item(&self, region_id: u64, requested_size: u64) -> FamResult<u64> {
        let regions = self.regions.read();
        let slot = regions.get(&region_id).ok_or(FamError::RegionNotFound)?;
        let size = align_up(requested_size, ALLOC_ALIGN).max(MIN_OBJ_SIZE);
        slot.sub_alloc.alloc(size as usize).map(|offset| offset as u64)
    }

    pub fn deallocate_item(&self, region_id: u64, offset: u64, size: u64) -> FamResult<()> {
        let regions = self.regions.read();
        let slot = regions.get(&region_id).ok_or(FamError::RegionNotFound)?;
        let aligned = align_up(size, ALLOC_ALIGN).max(MIN_OBJ_SIZE);
        slot.sub_alloc.dealloc(offset as usize, aligned as usize);
        Ok(())
    }

    pub fn read(&self, region_id: u64, offset: u64, len: usize) -> FamResult<Vec<u8>> {
        let regions = self.regions.read();
        let slot = regions.get(&region_id).ok_or(FamError::RegionNotFound)?;
        slot.backing.read_at(offset, len)
    }
}

impl Destination for RegionStore {
    fn write(&self, region_id: u64, offset: u64, data: &[u8]) -> FamResult<()> {
        let regions = self.regions.read();
        let slot = regions.get(&region_id).ok_or(FamError::RegionNotFound)?;
        slot.backing.write_at(offset, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volatile_round_trips_write_and_read() {
        let store = RegionStore::new(StoreConfig {
            data_dir: std::env::temp_dir(),
        });
        store.create_volatile(1, 4096).unwrap();
        Destination::write(&store, 1, 16, b"hello").unwrap();
        let back = store.read(1, 16, 5).unwrap();
        assert_eq!(back, b"hello");
    }

    #[test]
    fn allocate_item_is_aligned_and_floored() {
        let store = RegionStore::new(StoreConfig {
            data_dir: std::env::temp_dir(),
        });
        store.create_volatile(1, 1 << 20).unwrap();
        let off = store.allocate_item(1, 10).unwrap();
        assert_eq!(off, 0);
        let off2 = store.allocate_item(1, 10).unwrap();
        assert_eq!(off2, MIN_OBJ_SIZE);
    }

    #[test]
    fn persistent_region_survives_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let config = || StoreConfig {
            data_dir: dir.path().to_path_buf(),
        };
        {
            let store = RegionStore::new(config());
            store.create_persistent(7, 4096).unwrap();
            Destination::write(&store, 7, 0, b"durable").unwrap();
        }
        let store = RegionStore::new(config());
        store.create_persistent(7, 4096).unwrap();
        let back = store.read(7, 0, 7).unwrap();
        assert_eq!(back, b"durable");
    }

    #[test]
    fn unknown_region_is_rejected() {
        let store = RegionStore::new(StoreConfig {
            data_dir: std::env::temp_dir(),
        });
        let result = store.read(42, 0, 1);
        assert!(matches!(result, Err(FamError::RegionNotFound)));
    }

    #[test]
    fn resize_grows_volatile_region_and_rejects_shrink() {
        let store = RegionStore::new(StoreConfig {
            data_dir: std::env::temp_dir(),
        });
        store.create_volatile(1, 4096).unwrap();
        store.resize(1, 8192).unwrap();
        assert_eq!(store.region_size(1).unwrap(), 8192);
        let new_offset = store.allocate_item(1, 4096).unwrap();
        assert!(new_offset >= 4096);
        assert!(matches!(store.resize(1, 100), Err(FamError::RegionResizeNotPermitted)));
    }

    #[test]
    fn destroy_reports_in_use_while_a_handle_is_open() {
        let store = RegionStore::new(StoreConfig {
            data_dir: std::env::temp_dir(),
        });
        store.create_volatile(1, 4096).unwrap();
        store.open_handle(1).unwrap();
        assert_eq!(store.destroy(1).unwrap(), DestroyStatus::InUse);
        store.close_handle(1).unwrap();
        assert_eq!(store.destroy(1).unwrap(), DestroyStatus::Released);
        assert!(matches!(store.read(1, 0, 1), Err(FamError::RegionNotFound)));
    }
}
