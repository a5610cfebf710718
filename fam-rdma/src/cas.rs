//! The named per-region CAS-lock service from Design Note §9: because a
//! real NIC's atomic-compare-and-swap primitive is limited to 64-bit
//! words, wider (128-bit) compare-and-swap is emulated at the memory
//! server by taking a named mutex keyed on `(region_id, offset)` around
//! a plain read-compare-write, rather than by a lock-free NIC op.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

pub type LockKey = (u64, u64);

#[derive(Default)]
pub struct CasLockTable {
    locks: Mutex<HashMap<LockKey, Arc<AsyncMutex<()>>>>,
}

impl CasLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: LockKey) -> Arc<AsyncMutex<()>> {
        self.locks.lock().entry(key).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    /// Acquires the named lock for `(region_id, offset)`. The returned
    /// guard holds the table entry alive even if a concurrent caller for
    /// a different key causes the backing map to grow.
    pub async fn lock(&self, region_id: u64, offset: u64) -> OwnedMutexGuard<()> {
        let entry = self.entry((region_id, offset));
        entry.lock_owned().await
    }

    /// Drops the table entry for a key once it is known to have no more
    /// waiters, so long-lived servers don't accumulate one entry per
    /// distinct offset ever touched.
    pub fn forget(&self, region_id: u64, offset: u64) {
        let mut locks = self.locks.lock();
        if let Some(entry) = locks.get(&(region_id, offset)) {
            // only safe to drop when nobody else holds a clone
            if Arc::strong_count(entry) == 1 {
                locks.remove(&(region_id, offset));
            }
        }
    }
}

/// Performs a 128-bit compare-and-swap emulation: `expected`/`desired`
/// are each two 64-bit limbs (low, high). Returns the prior value
/// regardless of whether the swap took place, matching the 64-bit
/// primitive's contract in `provider::FabricProvider::compare_atomic`.
pub fn cas128_apply(current: (u64, u64), expected: (u64, u64), desired: (u64, u64)) -> (u64, u64) {
    if current == expected {
        desired
    } else {
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lock_serializes_same_key() {
        let table = Arc::new(CasLockTable::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let t1 = {
            let table = table.clone();
            let order = order.clone();
            tokio::spawn(async move {
                let _g = table.lock(1, 64).await;
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                order.lock().push(1);
            })
        };
        let t2 = {
            let table = table.clone();
            let order = order.clone();
            tokio::spawn(async move {
                let _g = table.lock(1, 64).await;
                order.lock().push(2);
            })
        };

        let _ = tokio::join!(t1, t2);
        assert_eq!(order.lock().len(), 2);
    }

    #[test]
    fn cas128_leaves_value_unchanged_on_mismatch() {
        let current = (1, 2);
        let result = cas128_apply(current, (9, 9), (5, 5));
        assert_eq!(result, current);
    }

    #[test]
    fn cas128_swaps_on_match() {
        let current = (1, 2);
        let result = cas128_apply(current, (1, 2), (5, 5));
        assert_eq!(result, (5, 5));
    }
}
