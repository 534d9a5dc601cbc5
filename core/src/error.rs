use thiserror::Error;

/// privrt error types
#[derive(Error, Debug)]
pub enum AdapterError {
    /// Orchestrator defaults could not be converted into the internal shape
    #[error("Configuration conversion failed: {0}")]
    ConfigConversion(String),

    /// The engine control endpoint could not be reached.
    ///
    /// The adapter has no degraded mode without its engine, so this is
    /// classified as fatal (see [`AdapterError::is_fatal`]).
    #[error("Failed to connect to engine at {endpoint}: {message}")]
    EngineConnect { endpoint: String, message: String },

    /// An engine API request failed after the connection was established
    #[error("Engine request failed: {0}")]
    EngineQuery(String),

    /// The engine manages cgroups with a different driver than the adapter
    #[error(
        "misconfiguration: adapter cgroup driver {adapter:?} is different from engine cgroup driver {engine:?}"
    )]
    CgroupDriverMismatch { adapter: String, engine: String },

    /// The engine-backed runtime service could not be built
    #[error("Failed to construct runtime service: {0}")]
    ServiceConstruction(String),

    /// The streaming listener failed to start or stopped accepting
    #[error("Streaming server on {addr} failed: {message}")]
    StreamingListen { addr: String, message: String },

    /// A streaming token was unknown, already used or expired
    #[error("Streaming session not found: {0}")]
    SessionNotFound(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl AdapterError {
    /// Whether the error leaves the whole process without a usable runtime.
    ///
    /// Hosting code is expected to terminate on fatal errors; the library
    /// itself never exits the process.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AdapterError::EngineConnect { .. } | AdapterError::StreamingListen { .. }
        )
    }
}

impl From<serde_json::Error> for AdapterError {
    fn from(err: serde_json::Error) -> Self {
        AdapterError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for AdapterError {
    fn from(err: serde_yaml::Error) -> Self {
        AdapterError::SerializationError(err.to_string())
    }
}

/// Result type alias for privrt operations
pub type Result<T> = std::result::Result<T, AdapterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cgroup_driver_mismatch_names_both_drivers() {
        let error = AdapterError::CgroupDriverMismatch {
            adapter: "cgroupfs".to_string(),
            engine: "systemd".to_string(),
        };
        let msg = error.to_string();
        assert!(msg.contains("\"cgroupfs\""));
        assert!(msg.contains("\"systemd\""));
        assert!(msg.starts_with("misconfiguration"));
    }

    #[test]
    fn test_engine_connect_display() {
        let error = AdapterError::EngineConnect {
            endpoint: "unix:///var/run/docker.sock".to_string(),
            message: "No such file or directory".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Failed to connect to engine at unix:///var/run/docker.sock: No such file or directory"
        );
    }

    #[test]
    fn test_fatal_classification() {
        assert!(AdapterError::EngineConnect {
            endpoint: "e".to_string(),
            message: "m".to_string(),
        }
        .is_fatal());
        assert!(AdapterError::StreamingListen {
            addr: "127.0.0.1:1".to_string(),
            message: "in use".to_string(),
        }
        .is_fatal());
        assert!(!AdapterError::ConfigConversion("x".to_string()).is_fatal());
        assert!(!AdapterError::CgroupDriverMismatch {
            adapter: "a".to_string(),
            engine: "b".to_string(),
        }
        .is_fatal());
        assert!(!AdapterError::ServiceConstruction("x".to_string()).is_fatal());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let error: AdapterError = io_error.into();
        assert!(matches!(error, AdapterError::IoError(_)));
        assert!(error.to_string().contains("missing"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_error = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let error: AdapterError = json_error.into();
        assert!(matches!(error, AdapterError::SerializationError(_)));
    }
}
