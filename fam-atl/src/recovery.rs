//! Startup crash-recovery pass, grounded on `recover_queue` in
//! `atomic_queue.cpp`: walk every still-queued entry, redo any write
//! left `WRITE_IN_PROGRESS`, and pop everything else. A handful of
//! consecutive failures (matching the source's hard-coded retry count
//! of 5) disables the queue rather than looping forever.

use fam_common::error::{FamError, FamResult};
use tracing::{error, info, warn};

use crate::destination::Destination;
use crate::handlers::{apply_scatter_index, apply_scatter_stride, apply_write};
use crate::queue::AtomicQueue;
use crate::record::MsgFlags;

const MAX_RECOVERY_RETRIES: u32 = 5;

fn decode_indexes(bytes: &[u8]) -> Vec<u64> {
    bytes
        .chunks_exact(8)
        .map(|c| u64::from_ne_bytes(c.try_into().unwrap()))
        .collect()
}

/// Replays every incomplete write found in `queue` against
/// `destination`. Returns `Ok(())` once the queue is fully drained of
/// recoverable entries, or `Err` (after `MAX_RECOVERY_RETRIES`
/// consecutive failures) to signal the caller should disable this
/// queue's worker rather than serve requests against unrecovered state.
pub fn recover(queue: &AtomicQueue, destination: &dyn Destination) -> FamResult<()> {
    let mut retries = 0u32;

    while let Some(msg) = queue.front() {
        let flags = msg.flags();
        let result: FamResult<()> = if flags.contains(MsgFlags::WRITE_IN_PROGRESS) {
            if flags.contains(MsgFlags::WRITE) {
                let buffer = queue.read_staging(msg.offset_buffer, msg.size);
                apply_write(&msg, &buffer, destination)
            } else if flags.contains(MsgFlags::SCATTER_INDEX) {
                let buffer_len = msg.n_elements * msg.element_size;
                let buffer = queue.read_staging(msg.offset_buffer, buffer_len);
                let index_bytes = queue.read_staging(msg.offset_index, msg.n_elements * 8);
                apply_scatter_index(&msg, &buffer, &decode_indexes(&index_bytes), destination)
            } else if flags.contains(MsgFlags::SCATTER_STRIDE) {
                let buffer_len = msg.n_elements * msg.element_size;
                let buffer = queue.read_staging(msg.offset_buffer, buffer_len);
                apply_scatter_stride(&msg, &buffer, destination)
            } else {
                Ok(())
            }
        } else {
            Ok(())
        };

        match result {
            Ok(()) => {
                if flags.contains(MsgFlags::BUFFER_ALLOCATED) {
                    queue.free_staged(msg.offset_buffer, msg.size.max(msg.n_elements * msg.element_size));
                    if flags.intersects(MsgFlags::SCATTER_INDEX | MsgFlags::GATHER_INDEX) {
                        queue.free_staged(msg.offset_index, msg.n_elements * 8);
                    }
                }
                queue.pop()?;
                retries = 0;
            }
            Err(e) => {
                retries += 1;
                warn!(qid = queue.qid, retries, "recovery entry failed: {e}");
                if retries >= MAX_RECOVERY_RETRIES {
                    error!(qid = queue.qid, "recovery exceeded retry budget, disabling queue");
                    return Err(FamError::Resource(1, format!("atl recovery failed for queue {}", queue.qid)));
                }
            }
        }
    }

    info!(qid = queue.qid, "recovery complete, queue empty");
    Ok(())
}
