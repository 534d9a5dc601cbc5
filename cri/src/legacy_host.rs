//! Legacy host integration for the network plugin layer.
//!
//! The network plugin may consult a legacy host for pod lookups and for
//! host-port / bandwidth-shaping support. This runtime has no such
//! integration, so [`LegacyHostBinding::Absent`] resolves to
//! [`NoOpLegacyHost`], which reports every lookup as absent and declines
//! legacy features.

use std::fmt;
use std::sync::Arc;

use crate::cri_api::RuntimeService;

/// Reference to a pod known to the legacy host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodRef {
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

/// Handle to the orchestrator API client owned by a legacy host.
pub trait KubeClient: Send + Sync {
    /// API server the client talks to.
    fn api_server(&self) -> &str;
}

/// Capability set the network plugin layer requires from its host.
pub trait LegacyHost: Send + Sync {
    fn pod_by_name(&self, namespace: &str, name: &str) -> Option<PodRef>;

    fn kube_client(&self) -> Option<Arc<dyn KubeClient>>;

    fn runtime(&self) -> Option<Arc<dyn RuntimeService>>;

    /// `false` means host port mapping and bandwidth shaping are unavailable.
    fn supports_legacy_features(&self) -> bool;
}

/// Legacy host that knows nothing and supports nothing.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NoOpLegacyHost;

impl LegacyHost for NoOpLegacyHost {
    fn pod_by_name(&self, _namespace: &str, _name: &str) -> Option<PodRef> {
        None
    }

    fn kube_client(&self) -> Option<Arc<dyn KubeClient>> {
        None
    }

    fn runtime(&self) -> Option<Arc<dyn RuntimeService>> {
        None
    }

    fn supports_legacy_features(&self) -> bool {
        false
    }
}

static NO_OP_LEGACY_HOST: NoOpLegacyHost = NoOpLegacyHost;

/// Legacy host handed to the network plugin: a real one, or none.
#[derive(Clone, Default)]
pub enum LegacyHostBinding {
    Present(Arc<dyn LegacyHost>),
    #[default]
    Absent,
}

impl LegacyHostBinding {
    /// The host to call; [`NoOpLegacyHost`] when absent.
    pub fn host(&self) -> &dyn LegacyHost {
        match self {
            LegacyHostBinding::Present(host) => host.as_ref(),
            LegacyHostBinding::Absent => &NO_OP_LEGACY_HOST,
        }
    }

    pub fn is_present(&self) -> bool {
        matches!(self, LegacyHostBinding::Present(_))
    }
}

impl fmt::Debug for LegacyHostBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LegacyHostBinding::Present(_) => f.write_str("LegacyHostBinding::Present(..)"),
            LegacyHostBinding::Absent => f.write_str("LegacyHostBinding::Absent"),
        }
    }
}
