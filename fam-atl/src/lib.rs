//! The persistent atomic-write queue (ATL): durable, crash-recoverable
//! staging for writes and scatter operations a memory server must apply
//! exactly once even across a mid-write crash. One `AtomicQueue` plus
//! `QueueWorker` pair is created per worker thread a memory server
//! configures (`numAtomicThreads`); `Destination` is the seam the
//! memory server's own allocator plugs into.

pub mod backing;
pub mod destination;
pub mod handlers;
pub mod queue;
pub mod record;
pub mod recovery;
pub mod staging;
pub mod worker;

pub use destination::Destination;
pub use queue::AtomicQueue;
pub use record::{AtomicMsg, GlobalDescriptor, MsgFlags, QueueHeader};
pub use worker::QueueWorker;
