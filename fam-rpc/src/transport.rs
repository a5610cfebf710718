//! The `Transport` capability trait from Design Note §9: CIS (and MS/
//! MDS clients) depend only on `unary`, never on which RPC framework
//! backs it. Two implementations exist, matching `rpc_framework_type`
//! ∈ {`grpc`, `direct`} from the configuration surface: `GrpcTransport`
//! frames a prost-encoded `Envelope` the way `wormhole::rpc` frames its
//! protobuf messages (`BytesMut` + a big-endian `u32` length prefix);
//! `DirectTransport` frames a bincode-encoded envelope the way
//! `wormhole-attach::protocol::Message` does. Both are otherwise
//! identical TCP unary-call clients.

use std::collections::HashMap;

use async_trait::async_trait;
use bincode::config::Configuration;
use fam_common::error::{FamError, FamResult};
use prost::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::trace;

use crate::fam::{Envelope, EnvelopeResponse};

#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends `method` with an already-encoded `payload` and returns the
    /// peer's already-encoded response payload, or the `FamError` it
    /// reported.
    async fn unary(&self, method: &str, payload: Vec<u8>) -> FamResult<Vec<u8>>;
}

async fn write_framed(stream: &mut TcpStream, bytes: &[u8]) -> FamResult<()> {
    let len = u32::try_from(bytes.len()).map_err(|_| FamError::Rpc("payload too large".into()))?;
    stream
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|e| FamError::Rpc(e.to_string()))?;
    stream.write_all(bytes).await.map_err(|e| FamError::Rpc(e.to_string()))?;
    Ok(())
}

async fn read_framed(stream: &mut TcpStream) -> FamResult<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    stream
        .read_exact(&mut len_bytes)
        .await
        .map_err(|e| FamError::Rpc(e.to_string()))?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await.map_err(|e| FamError::Rpc(e.to_string()))?;
    Ok(buf)
}

fn envelope_response_to_result(resp: EnvelopeResponse) -> FamResult<Vec<u8>> {
    if resp.ok {
        Ok(resp.payload)
    } else {
        Err(decode_error(&resp.error_kind, resp.error_message))
    }
}

/// Maps a wire-carried error kind name back to a `FamError` variant.
/// Unknown kinds degrade to `Unknown` rather than panicking — a future
/// server may report a kind this client predates.
fn decode_error(kind: &str, message: String) -> FamError {
    match kind {
        "RegionNotFound" => FamError::RegionNotFound,
        "DataItemNotFound" => FamError::DataItemNotFound,
        "RegionNotCreated" => FamError::RegionNotCreated,
        "DataItemNotCreated" => FamError::DataItemNotCreated,
        "RegionNoSpace" => FamError::RegionNoSpace,
        "BackupFileExist" => FamError::BackupFileExist,
        "BackupSizeTooLarge" => FamError::BackupSizeTooLarge,
        "NoPermission" => FamError::NoPermission,
        "RegionPermModifyNotPermitted" => FamError::RegionPermModifyNotPermitted,
        "ItemPermModifyNotPermitted" => FamError::ItemPermModifyNotPermitted,
        "RegionResizeNotPermitted" => FamError::RegionResizeNotPermitted,
        "OutOfRange" => FamError::OutOfRange,
        "RpcClientNotFound" => FamError::RpcClientNotFound,
        "MemservListEmpty" => FamError::MemservListEmpty,
        "Timeout" => FamError::Timeout,
        "NoPerm" => FamError::NoPerm,
        _ => FamError::Unknown(message),
    }
}

pub fn error_kind_name(error: &FamError) -> &'static str {
    match error {
        FamError::RegionNotFound => "RegionNotFound",
        FamError::DataItemNotFound => "DataItemNotFound",
        FamError::RegionNotCreated => "RegionNotCreated",
        FamError::DataItemNotCreated => "DataItemNotCreated",
        FamError::RegionNoSpace => "RegionNoSpace",
        FamError::BackupFileExist => "BackupFileExist",
        FamError::BackupSizeTooLarge => "BackupSizeTooLarge",
        FamError::NoPermission => "NoPermission",
        FamError::RegionPermModifyNotPermitted => "RegionPermModifyNotPermitted",
        FamError::ItemPermModifyNotPermitted => "ItemPermModifyNotPermitted",
        FamError::RegionResizeNotPermitted => "RegionResizeNotPermitted",
        FamError::OutOfRange => "OutOfRange",
        FamError::RpcClientNotFound => "RpcClientNotFound",
        FamError::MemservListEmpty => "MemservListEmpty",
        FamError::Timeout => "Timeout",
        FamError::NoPerm => "NoPerm",
        _ => "Unknown",
    }
}

/// Connects fresh per call; the client pool above this layer is
/// expected to reuse `Transport` instances, not sockets, matching how
/// `fam-cis`/`fam-client` hold one long-lived client handle per peer.
pub struct GrpcTransport {
    addr: String,
}

impl GrpcTransport {
    pub fn new(addr: impl Into<String>) -> Self {
        GrpcTransport { addr: addr.into() }
    }
}

#[async_trait]
impl Transport for GrpcTransport {
    async fn unary(&self, method: &str, payload: Vec<u8>) -> FamResult<Vec<u8>> {
        let mut stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| FamError::Rpc(format!("connect {}: {e}", self.addr)))?;

        let envelope = Envelope {
            method: method.to_string(),
            payload,
        };
        let mut buf = Vec::with_capacity(envelope.encoded_len());
        envelope.encode(&mut buf).map_err(|e| FamError::Rpc(e.to_string()))?;
        write_framed(&mut stream, &buf).await?;
        trace!(method, "grpc-style unary call sent");

        let resp_bytes = read_framed(&mut stream).await?;
        let resp = EnvelopeResponse::decode(resp_bytes.as_slice()).map_err(|e| FamError::Rpc(e.to_string()))?;
        envelope_response_to_result(resp)
    }
}

const BINCODE_CONFIG: Configuration = bincode::config::standard();

#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
struct DirectEnvelope {
    method: String,
    payload: Vec<u8>,
}

#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
struct DirectEnvelopeResponse {
    ok: bool,
    error_kind: String,
    error_message: String,
    payload: Vec<u8>,
}

pub struct DirectTransport {
    addr: String,
}

impl DirectTransport {
    pub fn new(addr: impl Into<String>) -> Self {
        DirectTransport { addr: addr.into() }
    }
}

#[async_trait]
impl Transport for DirectTransport {
    async fn unary(&self, method: &str, payload: Vec<u8>) -> FamResult<Vec<u8>> {
        let mut stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| FamError::Rpc(format!("connect {}: {e}", self.addr)))?;

        let envelope = DirectEnvelope {
            method: method.to_string(),
            payload,
        };
        let buf = bincode::encode_to_vec(&envelope, BINCODE_CONFIG).map_err(|e| FamError::Rpc(e.to_string()))?;
        write_framed(&mut stream, &buf).await?;
        trace!(method, "direct unary call sent");

        let resp_bytes = read_framed(&mut stream).await?;
        let (resp, _): (DirectEnvelopeResponse, usize) =
            bincode::decode_from_slice(&resp_bytes, BINCODE_CONFIG).map_err(|e| FamError::Rpc(e.to_string()))?;
        if resp.ok {
            Ok(resp.payload)
        } else {
            Err(decode_error(&resp.error_kind, resp.error_message))
        }
    }
}

/// A fixed, pre-resolved set of named peer transports — the RPC client
/// pool a coordinator or client library holds one of per remote role
/// (one per MS, one for MDS).
#[derive(Default)]
pub struct TransportPool {
    peers: Mutex<HashMap<u64, std::sync::Arc<dyn Transport>>>,
}

impl TransportPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, peer_id: u64, transport: std::sync::Arc<dyn Transport>) {
        self.peers.lock().await.insert(peer_id, transport);
    }

    pub async fn get(&self, peer_id: u64) -> FamResult<std::sync::Arc<dyn Transport>> {
        self.peers.lock().await.get(&peer_id).cloned().ok_or(FamError::RpcClientNotFound)
    }
}

/// Server-side counterpart of `Transport`: given a method name and an
/// already-decoded request payload, produce the encoded response or the
/// `FamError` to report. Implemented once per role (MS, MDS) and handed
/// to `serve_grpc`/`serve_direct`, which only handle framing.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, method: &str, payload: Vec<u8>) -> FamResult<Vec<u8>>;
}

async fn accept_loop<F, Fut>(addr: std::net::SocketAddr, handle_conn: F) -> FamResult<()>
where
    F: Fn(TcpStream) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| FamError::Rpc(format!("bind {addr}: {e}")))?;
    loop {
        let (stream, _) = listener
            .accept()
            .await
            .map_err(|e| FamError::Rpc(format!("accept: {e}")))?;
        tokio::spawn(handle_conn(stream));
    }
}

/// Serves prost-`Envelope`-framed unary calls, the counterpart of
/// `GrpcTransport`.
pub async fn serve_grpc(addr: std::net::SocketAddr, dispatcher: std::sync::Arc<dyn Dispatcher>) -> FamResult<()> {
    accept_loop(addr, move |mut stream| {
        let dispatcher = dispatcher.clone();
        async move {
            loop {
                let bytes = match read_framed(&mut stream).await {
                    Ok(bytes) => bytes,
                    Err(_) => return,
                };
                let envelope = match Envelope::decode(bytes.as_slice()) {
                    Ok(env) => env,
                    Err(_) => return,
                };
                let resp = match dispatcher.dispatch(&envelope.method, envelope.payload).await {
                    Ok(payload) => EnvelopeResponse {
                        ok: true,
                        error_kind: String::new(),
                        error_message: String::new(),
                        payload,
                    },
                    Err(e) => EnvelopeResponse {
                        ok: false,
                        error_kind: error_kind_name(&e).to_string(),
                        error_message: e.to_string(),
                        payload: Vec::new(),
                    },
                };
                let mut buf = Vec::with_capacity(resp.encoded_len());
                if resp.encode(&mut buf).is_err() {
                    return;
                }
                if write_framed(&mut stream, &buf).await.is_err() {
                    return;
                }
            }
        }
    })
    .await
}

/// Serves bincode-`DirectEnvelope`-framed unary calls, the counterpart
/// of `DirectTransport`.
pub async fn serve_direct(addr: std::net::SocketAddr, dispatcher: std::sync::Arc<dyn Dispatcher>) -> FamResult<()> {
    accept_loop(addr, move |mut stream| {
        let dispatcher = dispatcher.clone();
        async move {
            loop {
                let bytes = match read_framed(&mut stream).await {
                    Ok(bytes) => bytes,
                    Err(_) => return,
                };
                let envelope: DirectEnvelope = match bincode::decode_from_slice(&bytes, BINCODE_CONFIG) {
                    Ok((env, _)) => env,
                    Err(_) => return,
                };
                let resp = match dispatcher.dispatch(&envelope.method, envelope.payload).await {
                    Ok(payload) => DirectEnvelopeResponse {
                        ok: true,
                        error_kind: String::new(),
                        error_message: String::new(),
                        payload,
                    },
                    Err(e) => DirectEnvelopeResponse {
                        ok: false,
                        error_kind: error_kind_name(&e).to_string(),
                        error_message: e.to_string(),
                        payload: Vec::new(),
                    },
                };
                let buf = match bincode::encode_to_vec(&resp, BINCODE_CONFIG) {
                    Ok(buf) => buf,
                    Err(_) => return,
                };
                if write_framed(&mut stream, &buf).await.is_err() {
                    return;
                }
            }
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_round_trips_through_decode() {
        let kinds = [
            FamError::RegionNotFound,
            FamError::OutOfRange,
            FamError::BackupFileExist,
        ];
        for kind in kinds {
            let name = error_kind_name(&kind);
            let decoded = decode_error(name, "msg".into());
            assert_eq!(decoded, kind);
        }
    }

    #[tokio::test]
    async fn transport_pool_reports_missing_peer() {
        let pool = TransportPool::new();
        let result = pool.get(42).await;
        assert!(matches!(result, Err(FamError::RpcClientNotFound)));
    }

    struct EchoDispatcher;

    #[async_trait]
    impl Dispatcher for EchoDispatcher {
        async fn dispatch(&self, method: &str, payload: Vec<u8>) -> FamResult<Vec<u8>> {
            if method == "fail" {
                return Err(FamError::RegionNotFound);
            }
            Ok(payload)
        }
    }

    #[tokio::test]
    async fn grpc_transport_round_trips_against_serve_grpc() {
        let addr: std::net::SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
        let bound = listener.local_addr().unwrap();
        drop(listener);

        let dispatcher: std::sync::Arc<dyn Dispatcher> = std::sync::Arc::new(EchoDispatcher);
        tokio::spawn(serve_grpc(bound, dispatcher));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let client = GrpcTransport::new(bound.to_string());
        let resp = client.unary("echo", b"hi".to_vec()).await.unwrap();
        assert_eq!(resp, b"hi");

        let err = client.unary("fail", Vec::new()).await.unwrap_err();
        assert_eq!(err, FamError::RegionNotFound);
    }

    #[tokio::test]
    async fn direct_transport_round_trips_against_serve_direct() {
        let addr: std::net::SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
        let bound = listener.local_addr().unwrap();
        drop(listener);

        let dispatcher: std::sync::Arc<dyn Dispatcher> = std::sync::Arc::new(EchoDispatcher);
        tokio::spawn(serve_direct(bound, dispatcher));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let client = DirectTransport::new(bound.to_string());
        let resp = client.unary("echo", b"hi".to_vec()).await.unwrap();
        assert_eq!(resp, b"hi");
    }
}
