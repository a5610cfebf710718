//! The per-queue processing thread, grounded on `process_queue` in
//! `atomic_queue.cpp`: recover on startup, then loop popping and
//! applying messages, blocking on the queue's not-empty signal when
//! there is nothing to do (the `pthread_cond_wait` on `empty[qId]` in
//! the source, here a `tokio::sync::Notify`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fam_common::error::FamResult;
use tracing::{error, info, instrument, warn};

use crate::destination::Destination;
use crate::handlers::{apply_scatter_index, apply_scatter_stride, apply_write};
use crate::queue::AtomicQueue;
use crate::record::MsgFlags;
use crate::recovery;

fn decode_indexes(bytes: &[u8]) -> Vec<u64> {
    bytes
        .chunks_exact(8)
        .map(|c| u64::from_ne_bytes(c.try_into().unwrap()))
        .collect()
}

/// One worker owns exactly one queue for the lifetime of the memory
/// server process. `disabled` mirrors the source's `numAtomicThreads =
/// 0` escape hatch: once recovery fails, the worker stops picking up
/// new work and callers should reject further ATL-backed requests.
pub struct QueueWorker {
    pub queue: Arc<AtomicQueue>,
    destination: Arc<dyn Destination>,
    disabled: AtomicBool,
}

impl QueueWorker {
    pub fn new(queue: Arc<AtomicQueue>, destination: Arc<dyn Destination>) -> QueueWorker {
        QueueWorker {
            queue,
            destination,
            disabled: AtomicBool::new(false),
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    #[instrument(skip(self), fields(qid = self.queue.qid))]
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!("recovering incomplete transactions");
        if let Err(e) = recovery::recover(&self.queue, self.destination.as_ref()) {
            error!("recovery failed, disabling queue: {e}");
            self.disabled.store(true, Ordering::SeqCst);
            return;
        }
        info!("recovery complete, worker starting");

        loop {
            tokio::select! {
                _ = self.queue.wait_not_empty() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("worker shutting down");
                        return;
                    }
                }
            }

            while let Some(msg) = self.queue.front() {
                if let Err(e) = self.process_one() {
                    warn!("failed to process queued entry: {e}");
                    break;
                }
                let _ = msg;
            }
        }
    }

    fn process_one(&self) -> FamResult<()> {
        let msg = self.queue.update_front(|m| {
            let flags = m.flags();
            m.set_flags(flags | MsgFlags::WRITE_IN_PROGRESS);
        })?;
        let flags = msg.flags();

        let result = if flags.contains(MsgFlags::WRITE) {
            let buffer = self.queue.read_staging(msg.offset_buffer, msg.size);
            apply_write(&msg, &buffer, self.destination.as_ref())
        } else if flags.contains(MsgFlags::SCATTER_INDEX) {
            let buffer_len = msg.n_elements * msg.element_size;
            let buffer = self.queue.read_staging(msg.offset_buffer, buffer_len);
            let index_bytes = self.queue.read_staging(msg.offset_index, msg.n_elements * 8);
            apply_scatter_index(&msg, &buffer, &decode_indexes(&index_bytes), self.destination.as_ref())
        } else if flags.contains(MsgFlags::SCATTER_STRIDE) {
            let buffer_len = msg.n_elements * msg.element_size;
            let buffer = self.queue.read_staging(msg.offset_buffer, buffer_len);
            apply_scatter_stride(&msg, &buffer, self.destination.as_ref())
        } else {
            // ATOMIC_READ / GATHER_*: resolved synchronously by the
            // data-path handler before ever reaching the queue.
            Ok(())
        };

        result?;

        self.queue.update_front(|m| {
            let flags = m.flags();
            m.set_flags((flags | MsgFlags::WRITE_COMPLETED) & !MsgFlags::WRITE_IN_PROGRESS);
        })?;

        if flags.contains(MsgFlags::BUFFER_ALLOCATED) {
            self.queue
                .free_staged(msg.offset_buffer, msg.size.max(msg.n_elements * msg.element_size));
            if flags.intersects(MsgFlags::SCATTER_INDEX | MsgFlags::GATHER_INDEX) {
                self.queue.free_staged(msg.offset_index, msg.n_elements * 8);
            }
        }

        self.queue.pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{AtomicMsg, GlobalDescriptor};
    use fam_common::error::FamError;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    struct RecordingDestination {
        writes: Mutex<HashMap<(u64, u64), Vec<u8>>>,
    }

    impl Destination for RecordingDestination {
        fn write(&self, region_id: u64, offset: u64, data: &[u8]) -> FamResult<()> {
            self.writes.lock().insert((region_id, offset), data.to_vec());
            Ok(())
        }
    }

    fn push_write(queue: &AtomicQueue, region_id: u64, offset: u64, data: &[u8]) {
        let mut msg = AtomicMsg::EMPTY;
        msg.set_flags(MsgFlags::WRITE);
        msg.dst = GlobalDescriptor { region_id, offset };
        msg.size = data.len() as u64;
        queue.push(msg, Some(data), None).unwrap();
    }

    #[tokio::test]
    async fn worker_applies_queued_write_and_drains_queue() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(AtomicQueue::create(dir.path(), 0, 4, 4096).unwrap());
        push_write(&queue, 1, 16, b"payload");

        let destination = Arc::new(RecordingDestination { writes: Mutex::new(HashMap::new()) });
        let worker = Arc::new(QueueWorker::new(queue.clone(), destination.clone()));
        let (tx, rx) = tokio::sync::watch::channel(false);

        let handle = tokio::spawn(worker.clone().run(rx));
        // give the worker a moment to drain, then shut it down
        for _ in 0..50 {
            if queue.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(queue.is_empty());
        assert_eq!(destination.writes.lock().get(&(1, 16)).unwrap(), b"payload");
        assert!(!worker.is_disabled());
    }

    #[test]
    fn recovery_replays_interrupted_write() {
        let dir = tempfile::tempdir().unwrap();
        let queue = AtomicQueue::create(dir.path(), 1, 4, 4096).unwrap();
        let mut msg = AtomicMsg::EMPTY;
        msg.set_flags(MsgFlags::WRITE | MsgFlags::WRITE_IN_PROGRESS | MsgFlags::BUFFER_ALLOCATED);
        msg.dst = GlobalDescriptor { region_id: 2, offset: 8 };
        msg.size = 4;
        queue.push(msg, Some(b"abcd"), None).unwrap();

        let destination = RecordingDestination { writes: Mutex::new(HashMap::new()) };
        recovery::recover(&queue, &destination).unwrap();

        assert!(queue.is_empty());
        assert_eq!(destination.writes.lock().get(&(2, 8)).unwrap(), b"abcd");
    }

    #[test]
    fn recovery_disables_queue_after_retry_budget() {
        struct FailingDestination;
        impl Destination for FailingDestination {
            fn write(&self, _region_id: u64, _offset: u64, _data: &[u8]) -> FamResult<()> {
                Err(FamError::Allocator("boom".into()))
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let queue = AtomicQueue::create(dir.path(), 2, 4, 4096).unwrap();
        let mut msg = AtomicMsg::EMPTY;
        msg.set_flags(MsgFlags::WRITE | MsgFlags::WRITE_IN_PROGRESS | MsgFlags::BUFFER_ALLOCATED);
        msg.dst = GlobalDescriptor { region_id: 2, offset: 8 };
        msg.size = 4;
        queue.push(msg, Some(b"abcd"), None).unwrap();

        let result = recovery::recover(&queue, &FailingDestination);
        assert!(result.is_err());
    }
}
