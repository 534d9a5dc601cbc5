//! Alternative-runtime routing.
//!
//! Sandboxes that need the host (privileged, host namespaces, or the
//! OS-container annotation) are served by the privileged runtime; all other
//! sandboxes go to the node's default runtime.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;

use crate::cri_api::RuntimeService;

/// Identity of the privileged runtime variant.
pub const PRIVILEGED_RUNTIME_NAME: &str = "privileged runtime";

/// Annotation keys for runtime selection.
pub const OS_CONTAINER_ANNOTATION: &str = "runtime.privrt.io/os-container";

/// A runtime that can stand in for the default one on selected sandboxes.
pub trait AlternativeRuntime: RuntimeService {
    /// Compiled-in identity of the runtime.
    fn service_name(&self) -> &str;
}

/// The parts of a pod sandbox config that decide where it runs.
#[derive(Debug, Clone, Default)]
pub struct SandboxProfile {
    pub annotations: HashMap<String, String>,
    pub privileged: bool,
    pub host_network: bool,
    pub host_pid: bool,
    pub host_ipc: bool,
}

/// Whether a sandbox must run on the privileged runtime.
pub fn is_privileged_sandbox(profile: &SandboxProfile) -> bool {
    let os_container = profile
        .annotations
        .get(OS_CONTAINER_ANNOTATION)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    os_container
        || profile.privileged
        || profile.host_network
        || profile.host_pid
        || profile.host_ipc
}

/// Routes sandboxes to the default runtime or a registered alternative.
pub struct RuntimeSelector {
    default: Arc<dyn RuntimeService>,
    alternatives: DashMap<String, Arc<dyn RuntimeService>>,
    /// sandbox id → alternative runtime name
    sandboxes: DashMap<String, String>,
}

impl RuntimeSelector {
    pub fn new(default: Arc<dyn RuntimeService>) -> Self {
        Self {
            default,
            alternatives: DashMap::new(),
            sandboxes: DashMap::new(),
        }
    }

    /// Register an alternative runtime under its service name.
    pub fn register<R: AlternativeRuntime>(&self, runtime: Arc<R>) {
        let name = runtime.service_name().to_string();
        tracing::info!(runtime = %name, "Registered alternative runtime");
        self.alternatives.insert(name, runtime);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn RuntimeService>> {
        self.alternatives.get(name).map(|r| Arc::clone(r.value()))
    }

    fn select_name(&self, profile: &SandboxProfile) -> Option<&'static str> {
        if is_privileged_sandbox(profile) && self.alternatives.contains_key(PRIVILEGED_RUNTIME_NAME)
        {
            Some(PRIVILEGED_RUNTIME_NAME)
        } else {
            None
        }
    }

    /// Runtime that should serve a new sandbox with this profile.
    pub fn select(&self, profile: &SandboxProfile) -> Arc<dyn RuntimeService> {
        self.select_name(profile)
            .and_then(|name| self.get(name))
            .unwrap_or_else(|| Arc::clone(&self.default))
    }

    /// Select a runtime for a new sandbox and remember the choice.
    pub fn remember(&self, sandbox_id: &str, profile: &SandboxProfile) -> Arc<dyn RuntimeService> {
        if let Some(name) = self.select_name(profile) {
            tracing::debug!(sandbox_id, runtime = name, "Sandbox routed to alternative runtime");
            self.sandboxes
                .insert(sandbox_id.to_string(), name.to_string());
        }
        self.select(profile)
    }

    /// Runtime serving an existing sandbox. Unknown sandboxes use the default.
    pub fn route(&self, sandbox_id: &str) -> Arc<dyn RuntimeService> {
        self.sandboxes
            .get(sandbox_id)
            .and_then(|name| self.get(name.value()))
            .unwrap_or_else(|| Arc::clone(&self.default))
    }

    pub fn forget(&self, sandbox_id: &str) {
        self.sandboxes.remove(sandbox_id);
    }
}
