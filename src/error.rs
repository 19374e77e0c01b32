use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

/// Error kinds shared by the control channel and the query engines.
///
/// Every fallible operation in this crate surfaces one of these; transient
/// producer hiccups (a missed telemetry sample, a dropped event) are *not*
/// errors and instead yield absent metric values.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ServiceError {
    #[error("control pipe unavailable: {0}")]
    PipeUnavailable(String),

    #[error("client/service build mismatch (client {client}, service {service})")]
    VersionMismatch { client: String, service: String },

    #[error("no session has been opened on this connection")]
    SessionNotOpen,

    #[error("process {0} is already being tracked")]
    AlreadyTrackingProcess(u32),

    #[error("process {0} is not a valid tracking target")]
    InvalidPid(u32),

    #[error("malformed query: {0}")]
    QueryMalformed(String),

    #[error("value out of range: {0}")]
    OutOfRange(String),

    #[error("request not valid for the current session mode")]
    ModeMismatch,

    #[error("not a valid event trace log file: {0}")]
    InvalidEtlFile(String),

    #[error("service error: {0}")]
    Service(String),
}

pub type Result<T> = std::result::Result<T, ServiceError>;
