//! The RDMA data path: endpoint contexts, completion-queue demultiplexing,
//! the write/read/atomic primitive set, scatter/gather addressing, and the
//! per-region CAS-lock service memory servers use to emulate wide
//! compare-and-swap. `provider::FabricProvider` is the seam a real
//! libfabric binding plugs into; `provider::LoopbackProvider` is the
//! in-process stand-in this workspace tests and runs against.

pub mod cas;
pub mod context;
pub mod ops;
pub mod provider;
pub mod scatter;
pub mod timeout;

pub use context::Context;
pub use ops::Endpoint;
pub use provider::{AtomicOp, AtomicValue, FabricProvider, Key, LoopbackProvider};
pub use timeout::RetryPolicy;
