//! A private bump/free-list allocator over the ATL's own backing
//! region, used only to stage write payloads, scatter/gather index
//! lists, and message slots — the Rust equivalent of the source's
//! dedicated `ATOMIC_REGION_ID` allocations, kept separate from the
//! general-purpose memory-server allocator (`fam-ms::allocator`) so
//! `fam-atl` has no dependency on `fam-ms`.

use std::sync::atomic::{AtomicUsize, Ordering};

use fam_common::error::{FamError, FamResult};
use parking_lot::Mutex;

struct State {
    next_free: usize,
    free_list: Vec<(usize, usize)>,
}

pub struct StagingAllocator {
    capacity: AtomicUsize,
    state: Mutex<State>,
}

impl StagingAllocator {
    pub fn new(capacity: usize) -> Self {
        StagingAllocator {
            capacity: AtomicUsize::new(capacity),
            state: Mutex::new(State {
                next_free: 0,
                free_list: Vec::new(),
            }),
        }
    }

    /// First-fit over freed ranges, falling back to bumping the
    /// watermark; returns an error if neither has room.
    pub fn alloc(&self, len: usize) -> FamResult<usize> {
        let mut state = self.state.lock();
        if let Some(pos) = state.free_list.iter().position(|(_, l)| *l >= len) {
            let (offset, free_len) = state.free_list.remove(pos);
            if free_len > len {
                state.free_list.push((offset + len, free_len - len));
            }
            return Ok(offset);
        }
        let offset = state.next_free;
        if offset + len > self.capacity.load(Ordering::SeqCst) {
            return Err(FamError::RegionNoSpace);
        }
        state.next_free += len;
        Ok(offset)
    }

    pub fn dealloc(&self, offset: usize, len: usize) {
        let mut state = self.state.lock();
        state.free_list.push((offset, len));
    }

    /// Raises the allocator's ceiling for `resize_region`; never shrinks,
    /// since live allocations may already sit past a smaller request.
    pub fn grow(&self, new_capacity: usize) {
        self.capacity.fetch_max(new_capacity, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_freed_space() {
        let alloc = StagingAllocator::new(1024);
        let a = alloc.alloc(64).unwrap();
        alloc.dealloc(a, 64);
        let b = alloc.alloc(64).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn reports_out_of_space() {
        let alloc = StagingAllocator::new(16);
        assert!(alloc.alloc(8).is_ok());
        assert!(alloc.alloc(16).is_err());
    }
}
