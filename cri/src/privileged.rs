//! Privileged runtime facade.
//!
//! Construction runs strictly in order: assemble configuration, build the
//! engine-backed service, start streaming. Any failure aborts construction
//! and nothing started so far is kept. Once built, every runtime-interface
//! call is delegated to the engine-backed service.

use std::path::Path;
use std::sync::Arc;

use tonic::{Request, Response, Status};

use privrt_core::config::{KubeletDefaults, StreamingConfig};
use privrt_core::error::Result;

use crate::alternative::{AlternativeRuntime, PRIVILEGED_RUNTIME_NAME};
use crate::assembler::{assemble, CgroupDriverAgreement, RuntimeParams};
use crate::cri_api::*;
use crate::docker_service::{DockerService, ServiceOptions};
use crate::engine::{DockerConnector, EngineClient, EngineConnector};
use crate::network::NetworkPluginSettings;
use crate::streaming::StreamingHandler;
use crate::supervisor::StreamingSupervisor;

/// An engine-backed runtime service that also serves streaming sessions.
pub trait EngineRuntime: RuntimeService + StreamingHandler {
    fn into_streaming_handler(self: Arc<Self>) -> Arc<dyn StreamingHandler>;
}

impl<T: RuntimeService + StreamingHandler> EngineRuntime for T {
    fn into_streaming_handler(self: Arc<Self>) -> Arc<dyn StreamingHandler> {
        self
    }
}

/// Builds the engine-backed service from a live engine connection.
pub trait ServiceBuilder: Send + Sync {
    fn build(
        &self,
        client: Arc<dyn EngineClient>,
        options: ServiceOptions,
    ) -> Result<Arc<dyn EngineRuntime>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DockerServiceBuilder;

impl ServiceBuilder for DockerServiceBuilder {
    fn build(
        &self,
        client: Arc<dyn EngineClient>,
        options: ServiceOptions,
    ) -> Result<Arc<dyn EngineRuntime>> {
        Ok(Arc::new(DockerService::new(client, options)?))
    }
}

/// Starts the streaming listener for a built service.
pub trait StreamingLauncher: Send + Sync {
    fn launch(
        &self,
        config: &StreamingConfig,
        handler: Arc<dyn StreamingHandler>,
    ) -> StreamingSupervisor;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SupervisorLauncher;

impl StreamingLauncher for SupervisorLauncher {
    fn launch(
        &self,
        config: &StreamingConfig,
        handler: Arc<dyn StreamingHandler>,
    ) -> StreamingSupervisor {
        StreamingSupervisor::start(config, handler)
    }
}

/// Collaborators used during construction.
#[derive(Clone)]
pub struct RuntimeDeps {
    pub connector: Arc<dyn EngineConnector>,
    pub builder: Arc<dyn ServiceBuilder>,
    pub launcher: Arc<dyn StreamingLauncher>,
}

impl Default for RuntimeDeps {
    fn default() -> Self {
        Self {
            connector: Arc::new(DockerConnector),
            builder: Arc::new(DockerServiceBuilder),
            launcher: Arc::new(SupervisorLauncher),
        }
    }
}

/// Container-engine-backed runtime for sandboxes that need host access.
pub struct PrivilegedRuntime {
    service: Arc<dyn EngineRuntime>,
    streaming: StreamingSupervisor,
    network: NetworkPluginSettings,
    driver_agreement: CgroupDriverAgreement,
}

impl PrivilegedRuntime {
    /// Build a privileged runtime with the default orchestrator settings.
    ///
    /// `endpoint` falls back to the default engine endpoint when `None`.
    /// Must be called from within a tokio runtime.
    pub async fn new(
        endpoint: Option<&str>,
        streaming_config: StreamingConfig,
        cni_net_dir: &Path,
        cni_plugin_dir: &Path,
        cgroup_driver: &str,
        root_dir: &Path,
    ) -> Result<Self> {
        Self::from_params(RuntimeParams {
            endpoint: endpoint.map(str::to_string),
            streaming: streaming_config,
            cni_net_dir: cni_net_dir.to_path_buf(),
            cni_plugin_dir: cni_plugin_dir.to_path_buf(),
            cgroup_driver: cgroup_driver.to_string(),
            root_dir: root_dir.to_path_buf(),
            defaults: KubeletDefaults::default(),
        })
        .await
    }

    pub async fn from_params(params: RuntimeParams) -> Result<Self> {
        Self::with_deps(params, RuntimeDeps::default()).await
    }

    /// Build with explicit collaborators.
    pub async fn with_deps(params: RuntimeParams, deps: RuntimeDeps) -> Result<Self> {
        let assembled = assemble(&params, deps.connector.as_ref()).await?;

        let options = ServiceOptions {
            seccomp_profile_root: assembled.config.seccomp_profile_root.clone(),
            pod_sandbox_image: assembled.config.pod_sandbox_image.clone(),
            streaming: params.streaming.clone(),
            runtime_request_timeout: assembled.config.runtime_request_timeout,
            network: assembled.network.clone(),
            runtime_cgroups: assembled.config.runtime_cgroups.clone(),
            cgroup_driver: assembled.cgroup_driver.clone(),
            exec_handler: assembled.config.exec_handler,
            root_dir: params.root_dir.clone(),
            disable_shared_pid: assembled.config.disable_shared_pid,
        };
        let service = deps.builder.build(assembled.client, options)?;

        let streaming = deps
            .launcher
            .launch(&params.streaming, Arc::clone(&service).into_streaming_handler());

        tracing::info!(
            runtime = PRIVILEGED_RUNTIME_NAME,
            streaming_addr = %params.streaming.addr,
            cgroup_driver = %params.cgroup_driver,
            "Privileged runtime ready"
        );

        Ok(Self {
            service,
            streaming,
            network: assembled.network,
            driver_agreement: assembled.driver_agreement,
        })
    }

    pub fn service_name(&self) -> &'static str {
        PRIVILEGED_RUNTIME_NAME
    }

    pub fn cgroup_driver_agreement(&self) -> CgroupDriverAgreement {
        self.driver_agreement
    }

    pub fn network(&self) -> &NetworkPluginSettings {
        &self.network
    }

    pub fn streaming(&self) -> &StreamingSupervisor {
        &self.streaming
    }

    /// Stop the streaming listener.
    pub async fn shutdown(&mut self) {
        self.streaming.shutdown().await;
    }
}

#[tonic::async_trait]
impl RuntimeService for PrivilegedRuntime {
    async fn version(
        &self,
        request: Request<VersionRequest>,
    ) -> std::result::Result<Response<VersionResponse>, Status> {
        self.service.version(request).await
    }

    async fn status(
        &self,
        request: Request<StatusRequest>,
    ) -> std::result::Result<Response<StatusResponse>, Status> {
        self.service.status(request).await
    }

    async fn update_runtime_config(
        &self,
        request: Request<UpdateRuntimeConfigRequest>,
    ) -> std::result::Result<Response<UpdateRuntimeConfigResponse>, Status> {
        self.service.update_runtime_config(request).await
    }

    async fn exec_sync(
        &self,
        request: Request<ExecSyncRequest>,
    ) -> std::result::Result<Response<ExecSyncResponse>, Status> {
        self.service.exec_sync(request).await
    }

    async fn exec(
        &self,
        request: Request<ExecRequest>,
    ) -> std::result::Result<Response<ExecResponse>, Status> {
        self.service.exec(request).await
    }

    async fn attach(
        &self,
        request: Request<AttachRequest>,
    ) -> std::result::Result<Response<AttachResponse>, Status> {
        self.service.attach(request).await
    }

    async fn port_forward(
        &self,
        request: Request<PortForwardRequest>,
    ) -> std::result::Result<Response<PortForwardResponse>, Status> {
        self.service.port_forward(request).await
    }
}

impl AlternativeRuntime for PrivilegedRuntime {
    fn service_name(&self) -> &str {
        PRIVILEGED_RUNTIME_NAME
    }
}
