//! The FAM client library (spec.md §2, §4, §5): resolves a name to an
//! *opened region* that caches per-MS memory registrations, then issues
//! RDMA-style operations directly to MS endpoints, bypassing CIS for the
//! data path. Control-plane calls (create/destroy/allocate/lookup/copy/
//! backup/...) go through the CIS coordinator over the same `Transport`
//! boundary `fam-cis` itself uses.

pub mod client;
pub mod handle;

pub use client::FamClient;
pub use handle::{OpenedItem, OpenedRegion};
