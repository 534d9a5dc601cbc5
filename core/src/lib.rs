//! privrt Core - Configuration and error types
//!
//! Shared by the runtime adapter and its hosting binary.

pub mod config;
pub mod error;

// Re-export commonly used types
pub use config::{
    CgroupDriver, Cidr, ExecHandler, HairpinMode, KubeletDefaults, RuntimeConfig, StreamingConfig,
};
pub use error::{AdapterError, Result};

/// privrt version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
