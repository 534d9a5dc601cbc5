//! Adapter configuration.
//!
//! `KubeletDefaults` is the external, serde-friendly shape carrying the
//! orchestrator defaults the adapter depends on. It is converted once into the
//! validated `RuntimeConfig` consumed downstream.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AdapterError, Result};

/// Default engine control endpoint.
pub const DEFAULT_ENGINE_ENDPOINT: &str = "unix:///var/run/docker.sock";

/// Default pod sandbox (infra container) image.
pub const DEFAULT_POD_SANDBOX_IMAGE: &str = "gcr.io/google_containers/pause-amd64:3.0";

/// Orchestrator defaults relevant to the adapter.
///
/// Field names follow the kubelet configuration file. Missing keys in a YAML
/// overlay keep their default value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KubeletDefaults {
    /// Hairpin mode for the network plugin.
    pub hairpin_mode: String,

    /// Traffic to addresses outside this range is masqueraded.
    #[serde(rename = "nonMasqueradeCIDR")]
    pub non_masquerade_cidr: String,

    /// Timeout for engine requests, in seconds.
    pub runtime_request_timeout_seconds: u64,

    /// Image pulls without progress for this long are cancelled, in seconds.
    pub image_pull_progress_deadline_seconds: u64,

    /// Image used for pod sandbox containers.
    pub pod_sandbox_image: String,

    /// Directory holding seccomp profiles.
    pub seccomp_profile_root: String,

    /// Cgroup the runtime is placed in (empty = unmanaged).
    pub runtime_cgroups: String,

    /// Engine control endpoint.
    pub docker_endpoint: String,

    /// Exec handler name (`native` or `nsenter`).
    pub docker_exec_handler_name: String,

    /// Disable PID namespace sharing between containers of a pod.
    #[serde(rename = "dockerDisableSharedPID")]
    pub docker_disable_shared_pid: bool,
}

impl Default for KubeletDefaults {
    fn default() -> Self {
        Self {
            hairpin_mode: HairpinMode::PromiscuousBridge.as_str().to_string(),
            non_masquerade_cidr: "10.0.0.0/8".to_string(),
            runtime_request_timeout_seconds: 120,
            image_pull_progress_deadline_seconds: 60,
            pod_sandbox_image: DEFAULT_POD_SANDBOX_IMAGE.to_string(),
            seccomp_profile_root: "/var/lib/kubelet/seccomp".to_string(),
            runtime_cgroups: String::new(),
            docker_endpoint: DEFAULT_ENGINE_ENDPOINT.to_string(),
            docker_exec_handler_name: ExecHandler::Native.as_str().to_string(),
            docker_disable_shared_pid: true,
        }
    }
}

impl KubeletDefaults {
    /// Parse a YAML overlay on top of the defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load a YAML overlay from a file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            AdapterError::ConfigConversion(format!(
                "Failed to read kubelet config {}: {}",
                path.display(),
                e
            ))
        })?;
        tracing::debug!(path = %path.display(), "Loading kubelet defaults overlay");
        Self::from_yaml_str(&contents)
    }

    /// Convert into the validated internal configuration.
    pub fn convert(&self) -> Result<RuntimeConfig> {
        if self.runtime_request_timeout_seconds == 0 {
            return Err(AdapterError::ConfigConversion(
                "runtimeRequestTimeoutSeconds must be greater than 0".to_string(),
            ));
        }
        if self.image_pull_progress_deadline_seconds == 0 {
            return Err(AdapterError::ConfigConversion(
                "imagePullProgressDeadlineSeconds must be greater than 0".to_string(),
            ));
        }
        if self.pod_sandbox_image.trim().is_empty() {
            return Err(AdapterError::ConfigConversion(
                "podSandboxImage must not be empty".to_string(),
            ));
        }

        let runtime_cgroups = match self.runtime_cgroups.trim() {
            "" => None,
            cgroup => Some(cgroup.to_string()),
        };

        Ok(RuntimeConfig {
            hairpin_mode: self.hairpin_mode.parse()?,
            non_masquerade_cidr: self.non_masquerade_cidr.parse()?,
            runtime_request_timeout: Duration::from_secs(self.runtime_request_timeout_seconds),
            image_pull_progress_deadline: Duration::from_secs(
                self.image_pull_progress_deadline_seconds,
            ),
            pod_sandbox_image: self.pod_sandbox_image.clone(),
            seccomp_profile_root: PathBuf::from(&self.seccomp_profile_root),
            runtime_cgroups,
            engine_endpoint: self.docker_endpoint.clone(),
            exec_handler: self.docker_exec_handler_name.parse()?,
            disable_shared_pid: self.docker_disable_shared_pid,
        })
    }
}

/// Validated runtime configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    pub hairpin_mode: HairpinMode,
    pub non_masquerade_cidr: Cidr,
    pub runtime_request_timeout: Duration,
    pub image_pull_progress_deadline: Duration,
    pub pod_sandbox_image: String,
    pub seccomp_profile_root: PathBuf,
    pub runtime_cgroups: Option<String>,
    /// Endpoint used when the caller does not supply one.
    pub engine_endpoint: String,
    pub exec_handler: ExecHandler,
    pub disable_shared_pid: bool,
}

/// How the network plugin handles hairpin traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HairpinMode {
    /// Put the container bridge in promiscuous mode.
    PromiscuousBridge,
    /// Set the hairpin flag on container veth interfaces.
    HairpinVeth,
    /// No hairpin handling.
    None,
}

impl HairpinMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            HairpinMode::PromiscuousBridge => "promiscuous-bridge",
            HairpinMode::HairpinVeth => "hairpin-veth",
            HairpinMode::None => "none",
        }
    }
}

impl fmt::Display for HairpinMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HairpinMode {
    type Err = AdapterError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "promiscuous-bridge" => Ok(HairpinMode::PromiscuousBridge),
            "hairpin-veth" => Ok(HairpinMode::HairpinVeth),
            "none" => Ok(HairpinMode::None),
            other => Err(AdapterError::ConfigConversion(format!(
                "Unknown hairpin mode: '{}'. Expected: promiscuous-bridge, hairpin-veth, none",
                other
            ))),
        }
    }
}

/// An IP network in CIDR notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    pub addr: IpAddr,
    pub prefix_len: u8,
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

impl FromStr for Cidr {
    type Err = AdapterError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || AdapterError::ConfigConversion(format!("Invalid CIDR: '{}'", s));

        let (addr, prefix) = s.split_once('/').ok_or_else(invalid)?;
        let addr: IpAddr = addr.parse().map_err(|_| invalid())?;
        let prefix_len: u8 = prefix.parse().map_err(|_| invalid())?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if prefix_len > max {
            return Err(invalid());
        }

        Ok(Cidr { addr, prefix_len })
    }
}

/// Mechanism used to run exec sessions inside containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecHandler {
    /// Engine-native exec API.
    Native,
    /// `nsenter` into the container namespaces.
    Nsenter,
}

impl ExecHandler {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecHandler::Native => "native",
            ExecHandler::Nsenter => "nsenter",
        }
    }
}

impl FromStr for ExecHandler {
    type Err = AdapterError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "native" => Ok(ExecHandler::Native),
            "nsenter" => Ok(ExecHandler::Nsenter),
            other => Err(AdapterError::ConfigConversion(format!(
                "Unknown exec handler: '{}'. Expected: native, nsenter",
                other
            ))),
        }
    }
}

/// Cgroup management driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupDriver {
    /// Direct cgroupfs manipulation.
    Cgroupfs,
    /// Delegation to systemd.
    Systemd,
}

impl CgroupDriver {
    pub fn as_str(&self) -> &'static str {
        match self {
            CgroupDriver::Cgroupfs => "cgroupfs",
            CgroupDriver::Systemd => "systemd",
        }
    }
}

impl fmt::Display for CgroupDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CgroupDriver {
    type Err = AdapterError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cgroupfs" => Ok(CgroupDriver::Cgroupfs),
            "systemd" => Ok(CgroupDriver::Systemd),
            other => Err(AdapterError::ConfigConversion(format!(
                "Unknown cgroup driver: '{}'. Expected: cgroupfs, systemd",
                other
            ))),
        }
    }
}

/// Remote command sub-protocols offered to clients, newest first.
pub const DEFAULT_REMOTE_COMMAND_PROTOCOLS: &[&str] = &[
    "v4.channel.k8s.io",
    "v3.channel.k8s.io",
    "v2.channel.k8s.io",
    "channel.k8s.io",
];

/// Port-forward sub-protocols offered to clients.
pub const DEFAULT_PORT_FORWARD_PROTOCOLS: &[&str] = &["portforward.k8s.io"];

/// Streaming server configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamingConfig {
    /// Address the streaming listener binds to.
    pub addr: SocketAddr,

    /// Base URL advertised in session URLs (defaults to `http://{addr}`).
    pub base_url: Option<String>,

    /// Idle sessions are closed after this long.
    pub stream_idle_timeout: Duration,

    /// Registered sessions must be opened within this window.
    pub stream_creation_timeout: Duration,

    pub supported_remote_command_protocols: Vec<String>,

    pub supported_port_forward_protocols: Vec<String>,
}

impl StreamingConfig {
    /// Streaming configuration with default session policy.
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            base_url: None,
            stream_idle_timeout: Duration::from_secs(4 * 60 * 60),
            stream_creation_timeout: Duration::from_secs(30),
            supported_remote_command_protocols: DEFAULT_REMOTE_COMMAND_PROTOCOLS
                .iter()
                .map(|p| p.to_string())
                .collect(),
            supported_port_forward_protocols: DEFAULT_PORT_FORWARD_PROTOCOLS
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }

    /// Base URL for session URLs, without a trailing slash.
    pub fn url_base(&self) -> String {
        self.url_base_for(self.addr)
    }

    /// Base URL for a listener bound to `bound`.
    ///
    /// An explicit `base_url` wins. Otherwise the bound port is used and a
    /// wildcard host is replaced by the loopback address of its family.
    pub fn url_base_for(&self, bound: SocketAddr) -> String {
        if let Some(base) = &self.base_url {
            return base.trim_end_matches('/').to_string();
        }
        let host = match bound.ip() {
            IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
            ip => ip,
        };
        format!("http://{}", SocketAddr::new(host, bound.port()))
    }
}
