//! The fabric provider boundary. Real deployments plug in a libfabric FFI
//! binding here; since none is in the example pack this crate ships a
//! loopback, in-process implementation used by the dev single-node
//! deployment and by every test in this workspace. The trait is the exact
//! seam Design Note §9 calls for ("Dynamic dispatch over RPC frameworks" —
//! the same capability-trait treatment applies one layer down, to the
//! fabric transport itself).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use fam_common::error::{FamError, FamResult};
use parking_lot::{Mutex, RwLock};

/// A 64-bit fabric-side token identifying a registered memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicOp {
    Sum,
    Min,
    Max,
    Swap,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AtomicValue {
    I64(i64),
    U64(u64),
    F64(f64),
}

impl AtomicValue {
    pub fn to_le_bytes(self) -> [u8; 8] {
        match self {
            AtomicValue::I64(v) => v.to_le_bytes(),
            AtomicValue::U64(v) => v.to_le_bytes(),
            AtomicValue::F64(v) => v.to_le_bytes(),
        }
    }

    fn from_le_bytes(bytes: [u8; 8], like: AtomicValue) -> AtomicValue {
        match like {
            AtomicValue::I64(_) => AtomicValue::I64(i64::from_le_bytes(bytes)),
            AtomicValue::U64(_) => AtomicValue::U64(u64::from_le_bytes(bytes)),
            AtomicValue::F64(_) => AtomicValue::F64(f64::from_le_bytes(bytes)),
        }
    }

    /// Applies `op` with `self` as the NIC-resident value and `operand`
    /// as the incoming argument, returning the new resident value.
    pub fn apply(self, op: AtomicOp, operand: AtomicValue) -> AtomicValue {
        match (self, operand, op) {
            (AtomicValue::I64(a), AtomicValue::I64(b), AtomicOp::Sum) => AtomicValue::I64(a.wrapping_add(b)),
            (AtomicValue::I64(a), AtomicValue::I64(b), AtomicOp::Min) => AtomicValue::I64(a.min(b)),
            (AtomicValue::I64(a), AtomicValue::I64(b), AtomicOp::Max) => AtomicValue::I64(a.max(b)),
            (_, b, AtomicOp::Swap) => b,
            (AtomicValue::U64(a), AtomicValue::U64(b), AtomicOp::Sum) => AtomicValue::U64(a.wrapping_add(b)),
            (AtomicValue::U64(a), AtomicValue::U64(b), AtomicOp::Min) => AtomicValue::U64(a.min(b)),
            (AtomicValue::U64(a), AtomicValue::U64(b), AtomicOp::Max) => AtomicValue::U64(a.max(b)),
            (AtomicValue::F64(a), AtomicValue::F64(b), AtomicOp::Sum) => AtomicValue::F64(a + b),
            (AtomicValue::F64(a), AtomicValue::F64(b), AtomicOp::Min) => AtomicValue::F64(a.min(b)),
            (AtomicValue::F64(a), AtomicValue::F64(b), AtomicOp::Max) => AtomicValue::F64(a.max(b)),
            _ => self,
        }
    }
}

/// `fam_fetch_subtract` on signed types negates the addend before
/// dispatching to `Sum`. The source negates unconditionally, which is
/// undefined for `i64::MIN`; this resolves spec.md §9 open question 2 by
/// refusing that input outright rather than wrapping.
pub fn fetch_subtract_operand(subtrahend: i64) -> FamResult<AtomicValue> {
    if subtrahend == i64::MIN {
        return Err(FamError::OutOfRange);
    }
    Ok(AtomicValue::I64(-subtrahend))
}

#[async_trait]
pub trait FabricProvider: Send + Sync {
    /// Registers `len` bytes of memory on `peer` and returns its key.
    fn register(&self, peer: u64, len: usize) -> Key;

    fn deregister(&self, peer: u64, key: Key);

    async fn write(&self, peer: u64, key: Key, remote_offset: u64, data: &[u8]) -> FamResult<()>;

    async fn read(&self, peer: u64, key: Key, remote_offset: u64, len: usize) -> FamResult<Vec<u8>>;

    async fn atomic(
        &self,
        peer: u64,
        key: Key,
        remote_offset: u64,
        op: AtomicOp,
        operand: AtomicValue,
    ) -> FamResult<()>;

    /// Returns the pre-update value.
    async fn fetch_atomic(
        &self,
        peer: u64,
        key: Key,
        remote_offset: u64,
        op: AtomicOp,
        operand: AtomicValue,
    ) -> FamResult<AtomicValue>;

    /// Returns the pre-update value regardless of whether the swap took
    /// place, matching the source's compare-and-swap contract.
    async fn compare_atomic(
        &self,
        peer: u64,
        key: Key,
        remote_offset: u64,
        expected: AtomicValue,
        desired: AtomicValue,
    ) -> FamResult<AtomicValue>;
}

struct Buffer {
    bytes: Mutex<Vec<u8>>,
}

/// In-process fabric: every "peer" is just a namespace of registered
/// buffers. Reads/writes/atomics operate directly on them. Used for the
/// single-node dev deployment and for every property/scenario test in
/// this workspace.
#[derive(Default)]
pub struct LoopbackProvider {
    buffers: RwLock<HashMap<(u64, Key), Arc<Buffer>>>,
    next_key: Mutex<u64>,
}

impl LoopbackProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn lookup(&self, peer: u64, key: Key) -> FamResult<Arc<Buffer>> {
        self.buffers
            .read()
            .get(&(peer, key))
            .cloned()
            .ok_or_else(|| FamError::Libfabric(format!("unregistered key {key:?} on peer {peer}")))
    }
}

#[async_trait]
impl FabricProvider for LoopbackProvider {
    fn register(&self, peer: u64, len: usize) -> Key {
        let mut next_key = self.next_key.lock();
        let key = Key(*next_key);
        *next_key += 1;
        self.buffers.write().insert(
            (peer, key),
            Arc::new(Buffer {
                bytes: Mutex::new(vec![0u8; len]),
            }),
        );
        key
    }

    fn deregister(&self, peer: u64, key: Key) {
        self.buffers.write().remove(&(peer, key));
    }

    async fn write(&self, peer: u64, key: Key, remote_offset: u64, data: &[u8]) -> FamResult<()> {
        let buffer = self.lookup(peer, key)?;
        let mut bytes = buffer.bytes.lock();
        let start = remote_offset as usize;
        let end = start + data.len();
        if end > bytes.len() {
            return Err(FamError::OutOfRange);
        }
        bytes[start..end].copy_from_slice(data);
        Ok(())
    }

    async fn read(&self, peer: u64, key: Key, remote_offset: u64, len: usize) -> FamResult<Vec<u8>> {
        let buffer = self.lookup(peer, key)?;
        let bytes = buffer.bytes.lock();
        let start = remote_offset as usize;
        let end = start + len;
        if end > bytes.len() {
            return Err(FamError::OutOfRange);
        }
        Ok(bytes[start..end].to_vec())
    }

    async fn atomic(
        &self,
        peer: u64,
        key: Key,
        remote_offset: u64,
        op: AtomicOp,
        operand: AtomicValue,
    ) -> FamResult<()> {
        self.fetch_atomic(peer, key, remote_offset, op, operand)
            .await
            .map(|_| ())
    }

    async fn fetch_atomic(
        &self,
        peer: u64,
        key: Key,
        remote_offset: u64,
        op: AtomicOp,
        operand: AtomicValue,
    ) -> FamResult<AtomicValue> {
        let buffer = self.lookup(peer, key)?;
        let mut bytes = buffer.bytes.lock();
        let start = remote_offset as usize;
        if start + 8 > bytes.len() {
            return Err(FamError::OutOfRange);
        }
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes[start..start + 8]);
        let current = AtomicValue::from_le_bytes(raw, operand);
        let updated = current.apply(op, operand);
        bytes[start..start + 8].copy_from_slice(&updated.to_le_bytes());
        Ok(current)
    }

    /// Overlapping atomics to the same word are serialized by holding the
    /// buffer's byte-slice lock across the whole read-compare-write, the
    /// same guarantee spec.md §4.2 asks of the NIC for same-word atomics.
    async fn compare_atomic(
        &self,
        peer: u64,
        key: Key,
        remote_offset: u64,
        expected: AtomicValue,
        desired: AtomicValue,
    ) -> FamResult<AtomicValue> {
        let buffer = self.lookup(peer, key)?;
        let mut bytes = buffer.bytes.lock();
        let start = remote_offset as usize;
        if start + 8 > bytes.len() {
            return Err(FamError::OutOfRange);
        }
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes[start..start + 8]);
        let current = AtomicValue::from_le_bytes(raw, expected);
        if current.to_le_bytes() == expected.to_le_bytes() {
            bytes[start..start + 8].copy_from_slice(&desired.to_le_bytes());
        }
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let provider = LoopbackProvider::new();
        let key = provider.register(0, 64);
        provider.write(0, key, 8, b"hello").await.unwrap();
        let back = provider.read(0, key, 8, 5).await.unwrap();
        assert_eq!(back, b"hello");
    }

    #[tokio::test]
    async fn unregistered_key_is_rejected() {
        let provider = LoopbackProvider::new();
        let result = provider.write(0, Key(999), 0, b"x").await;
        assert!(matches!(result, Err(FamError::Libfabric(_))));
    }

    #[tokio::test]
    async fn min_max_atomics_are_monotone() {
        let provider = LoopbackProvider::new();
        let key = provider.register(0, 64);
        provider
            .write(0, key, 0, &AtomicValue::I64(10).to_le_bytes())
            .await
            .unwrap();
        provider
            .atomic(0, key, 0, AtomicOp::Min, AtomicValue::I64(20))
            .await
            .unwrap();
        let back = provider.read(0, key, 0, 8).await.unwrap();
        assert_eq!(i64::from_le_bytes(back.try_into().unwrap()), 10);

        provider
            .atomic(0, key, 0, AtomicOp::Max, AtomicValue::I64(99))
            .await
            .unwrap();
        let back = provider.read(0, key, 0, 8).await.unwrap();
        assert_eq!(i64::from_le_bytes(back.try_into().unwrap()), 99);
    }

    #[tokio::test]
    async fn compare_swap_semantics() {
        let provider = LoopbackProvider::new();
        let key = provider.register(0, 64);
        provider
            .write(0, key, 0, &AtomicValue::I64(5).to_le_bytes())
            .await
            .unwrap();

        let prev = provider
            .compare_atomic(0, key, 0, AtomicValue::I64(5), AtomicValue::I64(7))
            .await
            .unwrap();
        assert_eq!(prev, AtomicValue::I64(5));
        let back = provider.read(0, key, 0, 8).await.unwrap();
        assert_eq!(i64::from_le_bytes(back.try_into().unwrap()), 7);

        // mismatched expected leaves value unchanged, returns prior value
        let prev = provider
            .compare_atomic(0, key, 0, AtomicValue::I64(5), AtomicValue::I64(100))
            .await
            .unwrap();
        assert_eq!(prev, AtomicValue::I64(7));
        let back = provider.read(0, key, 0, 8).await.unwrap();
        assert_eq!(i64::from_le_bytes(back.try_into().unwrap()), 7);
    }

    #[test]
    fn fetch_subtract_refuses_int_min() {
        assert!(fetch_subtract_operand(i64::MIN).is_err());
        assert!(fetch_subtract_operand(5).is_ok());
    }
}
