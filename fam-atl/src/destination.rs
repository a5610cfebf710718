//! The write target the queue's worker and recovery pass apply
//! completed messages to. A memory server's own allocator-backed memory
//! is *local* to the process handling the queue (the client reaches it
//! over RDMA; the server applies the write with a plain memcpy), so
//! this is a synchronous trait rather than an `async_trait` — it is
//! implemented by `fam-ms::allocator` and injected here to keep
//! `fam-atl` free of a dependency on `fam-ms`.

use fam_common::error::FamResult;

pub trait Destination: Send + Sync {
    fn write(&self, region_id: u64, offset: u64, data: &[u8]) -> FamResult<()>;
}
