//! Persistent byte storage for queue headers, message slots, and staged
//! write buffers, backed by `nix::sys::mman::mmap` over a regular file —
//! the same mmap surface the pack's own region allocator code uses
//! directly rather than going through a higher-level crate.

use std::fs::OpenOptions;
use std::num::NonZeroUsize;
use std::os::fd::AsFd;
use std::path::Path;
use std::ptr::NonNull;

use fam_common::error::{FamError, FamResult};
use nix::sys::mman::{mmap, msync, munmap, MapFlags, MsFlags, ProtFlags};

/// A fixed-size, file-backed mapping. `persist` issues an `msync` over
/// the whole region; callers that only touched a sub-range still pay
/// for the full sync, which is the same trade-off `openfam_persist`
/// makes in the source (it flushes cachelines for the touched range,
/// but the backing file is synced as a unit at the OS level here).
pub struct MmapRegion {
    ptr: NonNull<u8>,
    len: usize,
    _file: std::fs::File,
}

unsafe impl Send for MmapRegion {}
unsafe impl Sync for MmapRegion {}

impl MmapRegion {
    /// Opens (creating if needed) `path`, extends it to `len` bytes, and
    /// maps it read-write, shared.
    pub fn open(path: &Path, len: usize) -> FamResult<MmapRegion> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| FamError::Allocator(format!("open {}: {e}", path.display())))?;
        file.set_len(len as u64)
            .map_err(|e| FamError::Allocator(format!("set_len {}: {e}", path.display())))?;

        let ptr = unsafe {
            mmap(
                None,
                NonZeroUsize::new(len).ok_or(FamError::OutOfRange)?,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                file.as_fd(),
                0,
            )
        }
        .map_err(|e| FamError::Allocator(format!("mmap {}: {e}", path.display())))?;

        Ok(MmapRegion {
            ptr: ptr.cast(),
            len,
            _file: file,
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Flushes dirty pages to the backing file; called after every
    /// durability point the source marks with `openfam_persist`.
    pub fn persist(&self) -> FamResult<()> {
        unsafe { msync(self.ptr.cast(), self.len, MsFlags::MS_SYNC) }
            .map_err(|e| FamError::Allocator(format!("msync: {e}")))
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.ptr.cast(), self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_survive_persist_and_reopen_view() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region.bin");
        {
            let mut region = MmapRegion::open(&path, 4096).unwrap();
            region.as_mut_slice()[0..5].copy_from_slice(b"hello");
            region.persist().unwrap();
        }
        let region = MmapRegion::open(&path, 4096).unwrap();
        assert_eq!(&region.as_slice()[0..5], b"hello");
    }
}
