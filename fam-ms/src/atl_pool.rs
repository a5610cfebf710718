//! Wires up one `fam_atl::AtomicQueue`/`QueueWorker` pair per configured
//! ATL thread (the source's `numAtomicThreads`), all sharing the memory
//! server's `RegionStore` as their `Destination`.

use std::path::Path;
use std::sync::Arc;

use fam_atl::{AtomicQueue, Destination, QueueWorker};
use fam_common::error::FamResult;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const DEFAULT_QUEUE_CAPACITY: u64 = 1024;
const DEFAULT_STAGING_CAPACITY: usize = 64 * 1024 * 1024;

pub struct AtlPool {
    workers: Vec<Arc<QueueWorker>>,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl AtlPool {
    /// Opens `num_threads` queues under `dir` and spawns their workers.
    pub fn start(dir: &Path, num_threads: u32, destination: Arc<dyn Destination>) -> FamResult<AtlPool> {
        std::fs::create_dir_all(dir)
            .map_err(|e| fam_common::error::FamError::Allocator(format!("create {dir:?}: {e}")))?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut workers = Vec::with_capacity(num_threads as usize);
        let mut handles = Vec::with_capacity(num_threads as usize);

        for qid in 0..num_threads {
            let queue = Arc::new(AtomicQueue::create(
                dir,
                qid,
                DEFAULT_QUEUE_CAPACITY,
                DEFAULT_STAGING_CAPACITY,
            )?);
            let worker = Arc::new(QueueWorker::new(queue, Arc::clone(&destination)));
            let handle = tokio::spawn(Arc::clone(&worker).run(shutdown_rx.clone()));
            workers.push(worker);
            handles.push(handle);
        }

        Ok(AtlPool {
            workers,
            shutdown_tx,
            handles,
        })
    }

    /// Picks the queue a new message should land on: round-robin by
    /// region id, matching the source's `qId = regionId % numAtomicThreads`.
    pub fn queue_for(&self, region_id: u64) -> Arc<AtomicQueue> {
        let idx = (region_id as usize) % self.workers.len();
        Arc::clone(&self.workers[idx].queue)
    }

    pub fn any_disabled(&self) -> bool {
        self.workers.iter().any(|w| w.is_disabled())
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::{RegionStore, StoreConfig};

    #[tokio::test]
    async fn pool_distributes_queues_by_region_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RegionStore::new(StoreConfig {
            data_dir: dir.path().to_path_buf(),
        }));
        let pool = AtlPool::start(dir.path(), 2, store).unwrap();
        let q0 = pool.queue_for(0);
        let q2 = pool.queue_for(2);
        assert_eq!(q0.qid, q2.qid);
        let q1 = pool.queue_for(1);
        assert_ne!(q0.qid, q1.qid);
        pool.shutdown().await;
    }
}
