//! Error conversion utilities for CRI.

use privrt_core::error::AdapterError;
use tonic::Status;

/// Convert an AdapterError to a gRPC Status.
pub fn adapter_error_to_status(err: AdapterError) -> Status {
    match err {
        AdapterError::ConfigConversion(msg) => Status::invalid_argument(msg),
        AdapterError::EngineConnect { endpoint, message } => {
            Status::unavailable(format!("{}: {}", endpoint, message))
        }
        AdapterError::CgroupDriverMismatch { .. } => Status::failed_precondition(err.to_string()),
        AdapterError::SessionNotFound(msg) => Status::not_found(msg),
        AdapterError::IoError(e) if e.kind() == std::io::ErrorKind::TimedOut => {
            Status::deadline_exceeded(e.to_string())
        }
        other => Status::internal(other.to_string()),
    }
}
