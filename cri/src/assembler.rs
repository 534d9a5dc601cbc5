//! Runtime configuration assembly.
//!
//! Resolves orchestrator defaults, connects to the engine, checks that the
//! engine and the adapter agree on the cgroup driver, and builds the network
//! plugin settings. Runs once, before any service is started.

use std::path::PathBuf;
use std::sync::Arc;

use privrt_core::config::{KubeletDefaults, RuntimeConfig, StreamingConfig};
use privrt_core::error::{AdapterError, Result};

use crate::engine::{EngineClient, EngineConnector};
use crate::network::NetworkPluginSettings;

/// Caller-supplied construction parameters.
#[derive(Debug, Clone)]
pub struct RuntimeParams {
    /// Engine endpoint; the configured default endpoint is used when `None`.
    pub endpoint: Option<String>,
    pub streaming: StreamingConfig,
    pub cni_net_dir: PathBuf,
    pub cni_plugin_dir: PathBuf,
    /// Cgroup driver the adapter is configured with.
    pub cgroup_driver: String,
    /// Storage root for the engine-backed service.
    pub root_dir: PathBuf,
    /// Orchestrator defaults to convert.
    pub defaults: KubeletDefaults,
}

/// Outcome of comparing the adapter's cgroup driver with the engine's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupDriverAgreement {
    /// The engine reports the same driver.
    Agreed,
    /// The engine reports no driver; the adapter's choice governs.
    EngineUnset,
}

/// Compare the adapter's cgroup driver with the one the engine reports.
pub fn check_cgroup_driver(adapter: &str, engine: &str) -> Result<CgroupDriverAgreement> {
    if engine.is_empty() {
        return Ok(CgroupDriverAgreement::EngineUnset);
    }
    if engine != adapter {
        return Err(AdapterError::CgroupDriverMismatch {
            adapter: adapter.to_string(),
            engine: engine.to_string(),
        });
    }
    Ok(CgroupDriverAgreement::Agreed)
}

/// Validated configuration plus a live engine connection.
pub struct AssembledRuntime {
    pub config: RuntimeConfig,
    pub client: Arc<dyn EngineClient>,
    pub network: NetworkPluginSettings,
    pub cgroup_driver: String,
    pub driver_agreement: CgroupDriverAgreement,
}

/// Run configuration assembly end to end.
///
/// Errors are returned as distinct [`AdapterError`] variants and never
/// retried. A failed connection is reported as the fatal
/// [`AdapterError::EngineConnect`].
pub async fn assemble(
    params: &RuntimeParams,
    connector: &dyn EngineConnector,
) -> Result<AssembledRuntime> {
    let config = params.defaults.convert()?;

    let endpoint = params
        .endpoint
        .as_deref()
        .filter(|e| !e.is_empty())
        .unwrap_or(config.engine_endpoint.as_str())
        .to_string();

    let client = connector
        .connect(
            &endpoint,
            config.runtime_request_timeout,
            config.image_pull_progress_deadline,
        )
        .await?;

    let info = client.info().await.map_err(|e| match e {
        AdapterError::EngineQuery(msg) => {
            AdapterError::EngineQuery(format!("failed to get info from engine: {}", msg))
        }
        other => other,
    })?;

    let driver_agreement = check_cgroup_driver(&params.cgroup_driver, &info.cgroup_driver)?;
    match driver_agreement {
        CgroupDriverAgreement::EngineUnset => tracing::warn!(
            cgroup_driver = %params.cgroup_driver,
            "No cgroup driver is set in the engine, using the adapter configuration"
        ),
        CgroupDriverAgreement::Agreed => tracing::debug!(
            cgroup_driver = %params.cgroup_driver,
            "Engine cgroup driver matches"
        ),
    }

    let network = NetworkPluginSettings::new(&config, &params.cni_net_dir, &params.cni_plugin_dir);

    Ok(AssembledRuntime {
        config,
        client,
        network,
        cgroup_driver: params.cgroup_driver.clone(),
        driver_agreement,
    })
}
