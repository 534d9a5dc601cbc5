//! Network plugin settings for pod sandboxes.

use std::path::{Path, PathBuf};

use privrt_core::config::{Cidr, HairpinMode, RuntimeConfig};

use crate::legacy_host::{LegacyHost, LegacyHostBinding};

/// Network plugin used for pod sandboxes.
pub const NETWORK_PLUGIN_NAME: &str = "cni";

/// MTU configured on pod interfaces.
pub const NETWORK_PLUGIN_MTU: u32 = 1460;

/// Settings handed to the pod-sandbox network plugin.
#[derive(Debug, Clone)]
pub struct NetworkPluginSettings {
    pub hairpin_mode: HairpinMode,
    pub non_masquerade_cidr: Cidr,
    pub plugin_name: String,
    /// Directory holding CNI network configurations.
    pub plugin_conf_dir: PathBuf,
    /// Directory holding CNI plugin binaries.
    pub plugin_bin_dir: PathBuf,
    pub mtu: u32,
    pub legacy_host: LegacyHostBinding,
}

impl NetworkPluginSettings {
    /// Build settings from converted defaults and the caller's CNI directories.
    ///
    /// No legacy host is bound.
    pub fn new(config: &RuntimeConfig, cni_net_dir: &Path, cni_plugin_dir: &Path) -> Self {
        Self {
            hairpin_mode: config.hairpin_mode,
            non_masquerade_cidr: config.non_masquerade_cidr,
            plugin_name: NETWORK_PLUGIN_NAME.to_string(),
            plugin_conf_dir: cni_net_dir.to_path_buf(),
            plugin_bin_dir: cni_plugin_dir.to_path_buf(),
            mtu: NETWORK_PLUGIN_MTU,
            legacy_host: LegacyHostBinding::Absent,
        }
    }

    pub fn with_legacy_host(mut self, legacy_host: LegacyHostBinding) -> Self {
        self.legacy_host = legacy_host;
        self
    }

    pub fn legacy_host(&self) -> &dyn LegacyHost {
        self.legacy_host.host()
    }

    /// Whether host ports and bandwidth shaping can be honoured.
    pub fn supports_host_ports(&self) -> bool {
        self.legacy_host().supports_legacy_features()
    }

    /// Whether the CNI config directory holds at least one network config.
    pub async fn has_network_config(&self) -> bool {
        let Ok(mut entries) = tokio::fs::read_dir(&self.plugin_conf_dir).await else {
            return false;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if matches!(
                entry.path().extension().and_then(|ext| ext.to_str()),
                Some("conf") | Some("conflist") | Some("json")
            ) {
                return true;
            }
        }
        false
    }
}
