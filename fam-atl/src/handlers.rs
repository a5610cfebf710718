//! Pure apply logic for each queued operation kind, shared by the
//! worker loop and the crash-recovery pass. Every handler here assumes
//! its staged buffer is already resident (the memory server's data-path
//! handler resolves the RDMA read from the client before ever calling
//! `AtomicQueue::push`), which collapses the source's two-phase
//! "allocate buffer, fabric_read, then apply" sequence into a single
//! durable-apply step — the queue's only job in this workspace is the
//! crash-atomic write to the destination data item, not orchestrating
//! the client round trip.

use fam_common::error::{FamError, FamResult};

use crate::destination::Destination;
use crate::record::AtomicMsg;

pub fn apply_write(msg: &AtomicMsg, buffer: &[u8], destination: &dyn Destination) -> FamResult<()> {
    destination.write(msg.dst.region_id, msg.dst.offset + msg.offset, buffer)
}

pub fn apply_scatter_index(
    msg: &AtomicMsg,
    buffer: &[u8],
    indexes: &[u64],
    destination: &dyn Destination,
) -> FamResult<()> {
    let element_size = msg.element_size as usize;
    if indexes.len() as u64 != msg.n_elements {
        return Err(FamError::OutOfRange);
    }
    for (i, &index) in indexes.iter().enumerate() {
        let src = i * element_size;
        let dest_offset = msg.dst.offset + index * msg.element_size;
        destination.write(msg.dst.region_id, dest_offset, &buffer[src..src + element_size])?;
    }
    Ok(())
}

pub fn apply_scatter_stride(msg: &AtomicMsg, buffer: &[u8], destination: &dyn Destination) -> FamResult<()> {
    let element_size = msg.element_size as usize;
    for i in 0..msg.n_elements {
        let src = (i as usize) * element_size;
        let dest_offset = msg.dst.offset + (msg.first_element + msg.stride * i) * msg.element_size;
        destination.write(msg.dst.region_id, dest_offset, &buffer[src..src + element_size])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::GlobalDescriptor;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    struct FakeDestination {
        writes: Mutex<HashMap<(u64, u64), Vec<u8>>>,
    }

    impl Destination for FakeDestination {
        fn write(&self, region_id: u64, offset: u64, data: &[u8]) -> FamResult<()> {
            self.writes.lock().insert((region_id, offset), data.to_vec());
            Ok(())
        }
    }

    fn msg() -> AtomicMsg {
        let mut m = AtomicMsg::EMPTY;
        m.dst = GlobalDescriptor { region_id: 9, offset: 100 };
        m
    }

    #[test]
    fn scatter_index_places_elements_at_requested_slots() {
        let dest = FakeDestination { writes: Mutex::new(HashMap::new()) };
        let mut m = msg();
        m.element_size = 4;
        m.n_elements = 2;
        let buffer = [1u8, 2, 3, 4, 5, 6, 7, 8];
        apply_scatter_index(&m, &buffer, &[2, 0], &dest).unwrap();
        let writes = dest.writes.lock();
        assert_eq!(writes.get(&(9, 100 + 2 * 4)).unwrap(), &[1, 2, 3, 4]);
        assert_eq!(writes.get(&(9, 100)).unwrap(), &[5, 6, 7, 8]);
    }

    #[test]
    fn scatter_stride_uses_first_element_and_stride() {
        let dest = FakeDestination { writes: Mutex::new(HashMap::new()) };
        let mut m = msg();
        m.element_size = 2;
        m.n_elements = 3;
        m.first_element = 1;
        m.stride = 2;
        let buffer = [9u8, 9, 8, 8, 7, 7];
        apply_scatter_stride(&m, &buffer, &dest).unwrap();
        let writes = dest.writes.lock();
        assert_eq!(writes.get(&(9, 100 + 1 * 2)).unwrap(), &[9, 9]);
        assert_eq!(writes.get(&(9, 100 + 3 * 2)).unwrap(), &[8, 8]);
        assert_eq!(writes.get(&(9, 100 + 5 * 2)).unwrap(), &[7, 7]);
    }

    #[test]
    fn scatter_index_rejects_mismatched_index_count() {
        let dest = FakeDestination { writes: Mutex::new(HashMap::new()) };
        let mut m = msg();
        m.element_size = 4;
        m.n_elements = 3;
        let result = apply_scatter_index(&m, &[0; 12], &[0, 1], &dest);
        assert!(result.is_err());
    }
}
