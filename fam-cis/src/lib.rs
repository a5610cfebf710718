//! The Client Interface Service: a stateless coordinator that fans a
//! client's region/data-item requests out across the memory servers a
//! region spans, reconciles the result with the metadata service, and
//! runs compensating cleanup on partial failure (spec.md §4.1).

pub mod admin;
pub mod coordinator;
pub mod rpc_server;

pub use coordinator::CisCoordinator;
