use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

/// The single sum-type of error kinds shared by every layer of the service.
/// Every variant here doubles as a wire value (see `fam-rpc`'s status
/// envelope) and a locally-thrown failure, per the propagation rule: the
/// layer that can take compensating action handles its kind, everything
/// else surfaces to the client.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FamError {
    // configuration
    #[error("invalid configuration option: {0}")]
    InvalidOption(String),

    // resource / lookup
    #[error("region not found")]
    RegionNotFound,
    #[error("data item not found")]
    DataItemNotFound,
    #[error("region not created")]
    RegionNotCreated,
    #[error("data item not created")]
    DataItemNotCreated,
    #[error("region has no space")]
    RegionNoSpace,
    #[error("backup already exists")]
    BackupFileExist,
    #[error("backup is larger than destination")]
    BackupSizeTooLarge,

    // authorization
    #[error("no permission")]
    NoPermission,
    #[error("region permission modify not permitted")]
    RegionPermModifyNotPermitted,
    #[error("item permission modify not permitted")]
    ItemPermModifyNotPermitted,
    #[error("region resize not permitted")]
    RegionResizeNotPermitted,

    // bounds / argument
    #[error("out of range")]
    OutOfRange,

    // RPC plumbing
    #[error("rpc failure: {0}")]
    Rpc(String),
    #[error("rpc client not found")]
    RpcClientNotFound,
    #[error("memory server list is empty")]
    MemservListEmpty,
    #[error("allocator failure: {0}")]
    Allocator(String),

    // data path
    #[error("fabric provider error: {0}")]
    Libfabric(String),
    #[error("fabric access denied")]
    NoPerm,
    #[error("{0} peer(s) failed: {1}")]
    Resource(usize, String),
    #[error("operation timed out")]
    Timeout,
    #[error("unknown error: {0}")]
    Unknown(String),
}

impl FamError {
    /// Multi-peer aggregation policy from the error handling design:
    /// exactly one failure is re-raised verbatim, two or more collapse
    /// into a single `Resource` summary.
    pub fn from_peer_failures(failures: Vec<(String, FamError)>) -> Option<FamError> {
        match failures.len() {
            0 => None,
            1 => Some(failures.into_iter().next().unwrap().1),
            n => {
                let summary = failures
                    .iter()
                    .map(|(peer, err)| format!("{peer}: {err}"))
                    .collect::<Vec<_>>()
                    .join("; ");
                Some(FamError::Resource(n, summary))
            }
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            FamError::NoPermission
            | FamError::NoPerm
            | FamError::RegionPermModifyNotPermitted
            | FamError::ItemPermModifyNotPermitted
            | FamError::RegionResizeNotPermitted => StatusCode::FORBIDDEN,
            FamError::RegionNotFound
            | FamError::DataItemNotFound
            | FamError::RegionNotCreated
            | FamError::DataItemNotCreated => StatusCode::NOT_FOUND,
            FamError::OutOfRange | FamError::InvalidOption(_) | FamError::BackupSizeTooLarge => {
                StatusCode::BAD_REQUEST
            }
            FamError::BackupFileExist => StatusCode::CONFLICT,
            FamError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for FamError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("request failed: {}", self);
        }
        let body = Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

pub type FamResult<T> = Result<T, FamError>;
