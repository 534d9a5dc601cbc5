//! privrt CRI - privileged container runtime adapter.
//!
//! Exposes a local container engine as an alternative CRI runtime for
//! sandboxes that need host access:
//! - Runtime calls → engine-backed service (Docker Engine API over a Unix socket)
//! - Exec / Attach / PortForward → streaming server supervised in the background

pub mod alternative;
pub mod assembler;
pub mod cri_api;
pub mod docker_service;
pub mod engine;
pub mod error;
pub mod http;
pub mod legacy_host;
pub mod network;
pub mod privileged;
pub mod streaming;
pub mod supervisor;

pub use privileged::PrivilegedRuntime;
