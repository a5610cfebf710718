//! The atomic-write queue itself: a fixed-capacity ring of `AtomicMsg`
//! slots plus a staging allocator for payloads and index lists, grounded
//! on `atomicQueue::{create,push,read,pop,isQempty}` in
//! `atomic_queue.cpp`. Durability point: every header or slot mutation
//! is followed by an `MmapRegion::persist` call, mirroring the source's
//! `openfam_persist` calls at exactly the same points.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use fam_common::error::{FamError, FamResult};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::backing::MmapRegion;
use crate::record::{AtomicMsg, MsgFlags, QueueHeader};
use crate::staging::StagingAllocator;

fn header_ptr(region: &MmapRegion) -> *const QueueHeader {
    region.as_slice().as_ptr() as *const QueueHeader
}

fn read_header(region: &MmapRegion) -> QueueHeader {
    unsafe { header_ptr(region).read_unaligned() }
}

fn write_header(region: &mut MmapRegion, header: QueueHeader) {
    unsafe {
        (region.as_mut_slice().as_mut_ptr() as *mut QueueHeader).write_unaligned(header);
    }
}

fn slot_offset(index: u64) -> usize {
    index as usize * std::mem::size_of::<AtomicMsg>()
}

fn read_slot(region: &MmapRegion, index: u64) -> AtomicMsg {
    let offset = slot_offset(index);
    unsafe { (region.as_slice().as_ptr().add(offset) as *const AtomicMsg).read_unaligned() }
}

fn write_slot(region: &mut MmapRegion, index: u64, msg: AtomicMsg) {
    let offset = slot_offset(index);
    unsafe {
        (region.as_mut_slice().as_mut_ptr().add(offset) as *mut AtomicMsg).write_unaligned(msg);
    }
}

pub struct AtomicQueue {
    pub qid: u32,
    header: Mutex<MmapRegion>,
    slots: Mutex<MmapRegion>,
    staging: MmapRegion,
    staging_alloc: StagingAllocator,
    push_lock: Mutex<()>,
    not_empty: Notify,
    total_pushed: AtomicU64,
}

impl AtomicQueue {
    /// Opens (creating on first run) the three backing files for queue
    /// `qid`: the header, the fixed slot array, and the staging area for
    /// payloads/index lists.
    pub fn create(dir: &Path, qid: u32, capacity: u64, staging_capacity: usize) -> FamResult<AtomicQueue> {
        let header_path = dir.join(format!("atl-{qid}.header"));
        let slots_path = dir.join(format!("atl-{qid}.slots"));
        let staging_path = dir.join(format!("atl-{qid}.staging"));

        let mut header_region = MmapRegion::open(&header_path, std::mem::size_of::<QueueHeader>())?;
        let mut existing = read_header(&header_region);
        if existing.capacity == 0 {
            existing = QueueHeader {
                front: 0,
                rear: 0,
                size: 0,
                capacity,
            };
            write_header(&mut header_region, existing);
            header_region.persist()?;
        }

        let slots_region = MmapRegion::open(&slots_path, capacity as usize * std::mem::size_of::<AtomicMsg>())?;
        let staging = MmapRegion::open(&staging_path, staging_capacity)?;

        Ok(AtomicQueue {
            qid,
            header: Mutex::new(header_region),
            slots: Mutex::new(slots_region),
            staging,
            staging_alloc: StagingAllocator::new(staging_capacity),
            push_lock: Mutex::new(()),
            not_empty: Notify::new(),
            total_pushed: AtomicU64::new(0),
        })
    }

    pub fn is_empty(&self) -> bool {
        read_header(&self.header.lock()).size == 0
    }

    pub fn len(&self) -> u64 {
        read_header(&self.header.lock()).size
    }

    /// Enqueues `msg`. `data` is the write/scatter element payload —
    /// staged regardless of operation flags or size, since every
    /// `WRITE`/`SCATTER_STRIDE`/`SCATTER_INDEX` entry needs its bytes
    /// durable before the worker can apply them; `index_data` is the
    /// raw index buffer for `SCATTER_INDEX`/`GATHER_INDEX`. Both are
    /// staged before the queue lock is taken, matching the source's
    /// ordering (stage first, then serialize the enqueue).
    pub fn push(&self, mut msg: AtomicMsg, data: Option<&[u8]>, index_data: Option<&[u8]>) -> FamResult<()> {
        if let Some(data) = data {
            let offset = self.staging_alloc.alloc(data.len())?;
            self.write_staging(offset, data)?;
            msg.offset_buffer = offset as u64;
            let flags = msg.flags();
            msg.set_flags(flags | MsgFlags::CONTAIN_DATA | MsgFlags::BUFFER_ALLOCATED);
        }
        if let Some(index_data) = index_data {
            let flags = msg.flags();
            if flags.intersects(MsgFlags::SCATTER_INDEX | MsgFlags::GATHER_INDEX) {
                let offset = self.staging_alloc.alloc(index_data.len())?;
                self.write_staging(offset, index_data)?;
                msg.offset_index = offset as u64;
            }
        }

        let _guard = self.push_lock.lock();
        let (slot, was_empty) = {
            let header = read_header(&self.header.lock());
            if header.size >= header.capacity {
                return Err(FamError::RegionNoSpace);
            }
            (header.rear, header.size == 0)
        };

        // Persist the slot bytes before the header counts it as live: a
        // crash between these two writes leaves `size` unchanged, so
        // recovery never scans a slot that wasn't fully written.
        let mut slots_region = self.slots.lock();
        write_slot(&mut slots_region, slot, msg);
        slots_region.persist()?;
        drop(slots_region);

        let mut header_region = self.header.lock();
        let mut header = read_header(&header_region);
        header.rear = (header.rear + 1) % header.capacity;
        header.size += 1;
        write_header(&mut header_region, header);
        header_region.persist()?;
        drop(header_region);

        self.total_pushed.fetch_add(1, Ordering::Relaxed);
        if was_empty {
            self.not_empty.notify_one();
        }
        Ok(())
    }

    /// Peeks the message at the front of the queue without removing it.
    pub fn front(&self) -> Option<AtomicMsg> {
        let header = read_header(&self.header.lock());
        if header.size == 0 {
            return None;
        }
        Some(read_slot(&self.slots.lock(), header.front))
    }

    /// Mutates the message at the front of the queue in place (used to
    /// flip `WRITE_IN_PROGRESS`/`WRITE_COMPLETED` as the worker makes
    /// progress) and persists the slot immediately afterward.
    pub fn update_front<F>(&self, f: F) -> FamResult<AtomicMsg>
    where
        F: FnOnce(&mut AtomicMsg),
    {
        let header = read_header(&self.header.lock());
        if header.size == 0 {
            return Err(FamError::Unknown("update_front on empty atomic queue".into()));
        }
        let mut slots_region = self.slots.lock();
        let mut msg = read_slot(&slots_region, header.front);
        f(&mut msg);
        write_slot(&mut slots_region, header.front, msg);
        slots_region.persist()?;
        Ok(msg)
    }

    /// Removes the front message, clearing its slot. Callers must have
    /// already finished whatever deallocation the message's flags imply
    /// (`free_staged` below). Clears the slot and persists it before
    /// advancing/persisting the header, the same stage-before-commit
    /// ordering `push` uses.
    pub fn pop(&self) -> FamResult<()> {
        let slot = {
            let header = read_header(&self.header.lock());
            if header.size == 0 {
                return Err(FamError::Unknown("pop on empty atomic queue".into()));
            }
            header.front
        };

        let mut slots_region = self.slots.lock();
        write_slot(&mut slots_region, slot, AtomicMsg::EMPTY);
        slots_region.persist()?;
        drop(slots_region);

        let mut header_region = self.header.lock();
        let mut header = read_header(&header_region);
        header.front = (header.front + 1) % header.capacity;
        header.size -= 1;
        write_header(&mut header_region, header);
        header_region.persist()?;
        Ok(())
    }

    pub async fn wait_not_empty(&self) {
        if !self.is_empty() {
            return;
        }
        self.not_empty.notified().await;
    }

    pub fn read_staging(&self, offset: u64, len: u64) -> Vec<u8> {
        let start = offset as usize;
        let end = start + len as usize;
        self.staging.as_slice()[start..end].to_vec()
    }

    pub fn free_staged(&self, offset: u64, len: u64) {
        self.staging_alloc.dealloc(offset as usize, len as usize);
    }

    fn write_staging(&self, offset: usize, data: &[u8]) -> FamResult<()> {
        // SAFETY: `staging` is exclusively owned by this queue and the
        // staging allocator guarantees non-overlapping live ranges.
        let staging_mut = unsafe {
            let ptr = self.staging.as_slice().as_ptr() as *mut u8;
            std::slice::from_raw_parts_mut(ptr, self.staging.len())
        };
        staging_mut[offset..offset + data.len()].copy_from_slice(data);
        self.staging.persist()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::GlobalDescriptor;

    fn sample_msg(size: u64) -> AtomicMsg {
        let mut msg = AtomicMsg::EMPTY;
        msg.set_flags(MsgFlags::WRITE | MsgFlags::WRITE_IN_PROGRESS);
        msg.dst = GlobalDescriptor { region_id: 1, offset: 0 };
        msg.size = size;
        msg
    }

    #[test]
    fn push_then_pop_round_trips_message() {
        let dir = tempfile::tempdir().unwrap();
        let queue = AtomicQueue::create(dir.path(), 0, 4, 4096).unwrap();
        assert!(queue.is_empty());

        let msg = sample_msg(5);
        queue.push(msg, Some(b"hello"), None).unwrap();
        assert_eq!(queue.len(), 1);

        let front = queue.front().unwrap();
        assert!(front.flags().contains(MsgFlags::CONTAIN_DATA));
        let payload = queue.read_staging(front.offset_buffer, front.size);
        assert_eq!(payload, b"hello");

        queue.pop().unwrap();
        assert!(queue.is_empty());
    }

    #[test]
    fn queue_rejects_push_past_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let queue = AtomicQueue::create(dir.path(), 0, 2, 4096).unwrap();
        queue.push(sample_msg(1), None, None).unwrap();
        queue.push(sample_msg(1), None, None).unwrap();
        let result = queue.push(sample_msg(1), None, None);
        assert!(matches!(result, Err(FamError::RegionNoSpace)));
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let queue = AtomicQueue::create(dir.path(), 3, 4, 4096).unwrap();
            queue.push(sample_msg(1), None, None).unwrap();
        }
        let queue = AtomicQueue::create(dir.path(), 3, 4, 4096).unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn wait_not_empty_returns_once_pushed() {
        let dir = tempfile::tempdir().unwrap();
        let queue = std::sync::Arc::new(AtomicQueue::create(dir.path(), 0, 4, 4096).unwrap());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue.wait_not_empty().await;
            })
        };
        tokio::task::yield_now().await;
        queue.push(sample_msg(1), None, None).unwrap();
        waiter.await.unwrap();
    }
}
