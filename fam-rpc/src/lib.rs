//! Wire schemas for the client-facing control-plane RPCs and the
//! `Transport` capability trait (Design Note §9) the coordinator and
//! client library depend on instead of a concrete RPC framework.

pub mod internal;
pub mod transport;

pub mod fam {
    include!(concat!(env!("OUT_DIR"), "/fam.rs"));
}

pub use transport::{serve_direct, serve_grpc, Dispatcher, DirectTransport, GrpcTransport, Transport, TransportPool};
