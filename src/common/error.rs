//! Error types for fleetkv

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Storage Errors ===
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bucket not found: {0}")]
    BucketNotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("Corrupted snapshot: {0}")]
    Corrupted(String),

    #[error("Checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    // === Membership Errors ===
    #[error("No available peers")]
    NoAvailablePeers,

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // === Replication Errors ===
    #[error("Replication to {peer} failed: {reason}")]
    Replication { peer: String, reason: String },

    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    // === Network Errors ===
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::ConnectionFailed(_)
                | Error::NoAvailablePeers
                | Error::Replication { .. }
        )
    }

    /// Convert to gRPC status for RPC responses
    pub fn to_grpc_status(&self) -> tonic::Status {
        use tonic::Code;
        match self {
            Error::NotFound(_) | Error::BucketNotFound(_) => {
                tonic::Status::new(Code::NotFound, self.to_string())
            }
            Error::AlreadyExists(_) => tonic::Status::new(Code::AlreadyExists, self.to_string()),
            Error::InvalidArgument(_) | Error::Decode(_) | Error::InvalidConfig(_) => {
                tonic::Status::new(Code::InvalidArgument, self.to_string())
            }
            Error::Corrupted(_) | Error::ChecksumMismatch { .. } => {
                tonic::Status::new(Code::DataLoss, self.to_string())
            }
            Error::NoAvailablePeers | Error::ConnectionFailed(_) | Error::Replication { .. } => {
                tonic::Status::new(Code::Unavailable, self.to_string())
            }
            Error::FailedPrecondition(_) => {
                tonic::Status::new(Code::FailedPrecondition, self.to_string())
            }
            Error::Timeout(_) => tonic::Status::new(Code::DeadlineExceeded, self.to_string()),
            Error::Grpc(status) => status.clone(),
            _ => tonic::Status::new(Code::Internal, self.to_string()),
        }
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::NotFound(_) | Error::BucketNotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidArgument(_) | Error::Decode(_) => StatusCode::BAD_REQUEST,
            Error::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            Error::NoAvailablePeers | Error::ConnectionFailed(_) | Error::Replication { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<tonic::transport::Error> for Error {
    fn from(e: tonic::transport::Error) -> Self {
        Error::ConnectionFailed(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Decode(e.to_string())
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Internal(e.to_string())
    }
}
