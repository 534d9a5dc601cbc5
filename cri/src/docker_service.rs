//! Engine-backed CRI RuntimeService.
//!
//! Serves the runtime-interface calls against the container engine and acts
//! as the streaming handler for the sessions it hands out:
//! - Exec / Attach → engine exec / attach, hijacked and bridged to kubelet
//! - PortForward → `socat` exec inside the sandbox container

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tonic::{Request, Response, Status};

use privrt_core::config::{CgroupDriver, ExecHandler, StreamingConfig};
use privrt_core::error::{AdapterError, Result};

use crate::cri_api::*;
use crate::engine::{demux_output, AttachOptions, EngineClient, ExecConfig, Hijacked};
use crate::error::adapter_error_to_status;
use crate::http::send_response;
use crate::network::NetworkPluginSettings;
use crate::streaming::{
    bridge, negotiate_protocol, send_upgrade, SessionCache, SessionKind, StreamRequest,
    StreamingHandler, StreamingSession,
};

/// Runtime name reported by `Version`.
pub const ENGINE_RUNTIME_NAME: &str = "docker";

/// CRI API version implemented by this service.
pub const KUBE_API_VERSION: &str = "0.1.0";

/// Header carrying the requested sub-protocols of a streaming client.
const STREAM_PROTOCOL_HEADER: &str = "x-stream-protocol-version";

/// Header selecting a single port on a port-forward connection.
const PORT_HEADER: &str = "port";

/// How many times `ExecSync` inspects an exec that still reports running.
const EXEC_INSPECT_MAX_TRIES: u32 = 5;

/// Pause between exec inspections.
const EXEC_INSPECT_INTERVAL: Duration = Duration::from_millis(100);

/// Everything the engine-backed service needs besides its engine connection.
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub seccomp_profile_root: PathBuf,
    pub pod_sandbox_image: String,
    pub streaming: StreamingConfig,
    /// Used for `ExecSync` calls that carry no timeout of their own.
    pub runtime_request_timeout: Duration,
    pub network: NetworkPluginSettings,
    pub runtime_cgroups: Option<String>,
    pub cgroup_driver: String,
    pub exec_handler: ExecHandler,
    /// Storage root for runtime state.
    pub root_dir: PathBuf,
    pub disable_shared_pid: bool,
}

/// Engine-backed implementation of the CRI RuntimeService.
pub struct DockerService {
    client: Arc<dyn EngineClient>,
    options: ServiceOptions,
    cgroup_driver: CgroupDriver,
    sessions: SessionCache,
    /// Pod CIDR pushed by kubelet through `UpdateRuntimeConfig`.
    pod_cidr: RwLock<Option<String>>,
    /// Address the streaming listener actually bound to.
    streaming_addr: RwLock<Option<SocketAddr>>,
}

impl DockerService {
    /// Create a new DockerService.
    ///
    /// Fails with [`AdapterError::ServiceConstruction`] for an unknown cgroup
    /// driver, an unsupported exec handler, or an unusable root directory.
    pub fn new(client: Arc<dyn EngineClient>, options: ServiceOptions) -> Result<Self> {
        let cgroup_driver: CgroupDriver = options
            .cgroup_driver
            .parse()
            .map_err(|e: AdapterError| AdapterError::ServiceConstruction(e.to_string()))?;

        if options.exec_handler != ExecHandler::Native {
            return Err(AdapterError::ServiceConstruction(format!(
                "exec handler '{}' is not supported, use 'native'",
                options.exec_handler.as_str()
            )));
        }

        std::fs::create_dir_all(&options.root_dir).map_err(|e| {
            AdapterError::ServiceConstruction(format!(
                "failed to create root directory {}: {}",
                options.root_dir.display(),
                e
            ))
        })?;

        tracing::info!(
            endpoint = %client.endpoint(),
            cgroup_driver = %cgroup_driver,
            root_dir = %options.root_dir.display(),
            sandbox_image = %options.pod_sandbox_image,
            "Engine-backed runtime service created"
        );

        Ok(Self {
            client,
            sessions: SessionCache::new(options.streaming.stream_creation_timeout),
            options,
            cgroup_driver,
            pod_cidr: RwLock::new(None),
            streaming_addr: RwLock::new(None),
        })
    }

    pub fn cgroup_driver(&self) -> CgroupDriver {
        self.cgroup_driver
    }

    pub fn options(&self) -> &ServiceOptions {
        &self.options
    }

    pub fn pod_cidr(&self) -> Option<String> {
        self.pod_cidr.read().clone()
    }

    /// Register a streaming session and return the URL for kubelet to connect to.
    fn register(&self, session: StreamingSession) -> String {
        let kind = session.kind;
        let token = self.sessions.insert(session);
        let base = match *self.streaming_addr.read() {
            Some(bound) => self.options.streaming.url_base_for(bound),
            None => self.options.streaming.url_base(),
        };
        format!("{}/{}/{}", base, kind.as_path(), token)
    }

    fn exec_sync_timeout(&self, requested: i64) -> Duration {
        if requested > 0 {
            Duration::from_secs(requested as u64)
        } else {
            self.options.runtime_request_timeout
        }
    }

    /// Inspect a finished exec until the engine stops reporting it as running.
    async fn wait_exec_exit(&self, exec_id: &str) -> Result<i32> {
        for attempt in 1..=EXEC_INSPECT_MAX_TRIES {
            let inspect = self.client.inspect_exec(exec_id).await?;
            if !inspect.running {
                return Ok(inspect.exit_code.unwrap_or(-1));
            }
            if attempt < EXEC_INSPECT_MAX_TRIES {
                tokio::time::sleep(EXEC_INSPECT_INTERVAL).await;
            }
        }
        Err(AdapterError::EngineQuery(format!(
            "exec {} still running after {} inspections",
            exec_id, EXEC_INSPECT_MAX_TRIES
        )))
    }

    /// Start the engine side of a consumed session.
    async fn open_engine_stream(
        &self,
        session: &StreamingSession,
        request: &StreamRequest,
    ) -> Result<Hijacked> {
        match session.kind {
            SessionKind::Exec => {
                let exec_id = self
                    .client
                    .create_exec(
                        &session.container_id,
                        &ExecConfig {
                            cmd: session.cmd.clone(),
                            attach_stdin: session.stdin,
                            attach_stdout: session.stdout,
                            attach_stderr: session.stderr,
                            tty: session.tty,
                        },
                    )
                    .await?;
                self.client.start_exec(&exec_id, session.tty).await
            }
            SessionKind::Attach => {
                self.client
                    .attach(
                        &session.container_id,
                        AttachOptions {
                            stdin: session.stdin,
                            stdout: session.stdout,
                            stderr: session.stderr,
                        },
                    )
                    .await
            }
            SessionKind::PortForward => {
                let port = forward_port(session, request.header(PORT_HEADER))?;
                let exec_id = self
                    .client
                    .create_exec(
                        &session.container_id,
                        &ExecConfig {
                            cmd: vec![
                                "socat".to_string(),
                                "-".to_string(),
                                format!("TCP4:localhost:{}", port),
                            ],
                            attach_stdin: true,
                            attach_stdout: true,
                            attach_stderr: false,
                            tty: false,
                        },
                    )
                    .await?;
                self.client.start_exec(&exec_id, false).await
            }
        }
    }
}

/// Choose the port to forward: the `Port` header if given, else the first
/// registered port. The header must name a valid port, and a registered one
/// when any were registered.
fn forward_port(session: &StreamingSession, header: Option<&str>) -> Result<i32> {
    let invalid = |msg: String| AdapterError::EngineQuery(msg);

    match header {
        Some(value) => {
            let port: i32 = value
                .trim()
                .parse()
                .map_err(|_| invalid(format!("invalid port header '{}'", value)))?;
            if !(1..=65535).contains(&port) {
                return Err(invalid(format!("invalid port {}", port)));
            }
            if !session.ports.is_empty() && !session.ports.contains(&port) {
                return Err(invalid(format!("port {} was not requested", port)));
            }
            Ok(port)
        }
        None => session
            .ports
            .first()
            .copied()
            .ok_or_else(|| invalid("no ports specified".to_string())),
    }
}

fn validate_port(port: i32) -> std::result::Result<(), Status> {
    if !(1..=65535).contains(&port) {
        return Err(Status::invalid_argument(format!("invalid port {}", port)));
    }
    Ok(())
}

#[tonic::async_trait]
impl RuntimeService for DockerService {
    // ── Version ──────────────────────────────────────────────────────

    async fn version(
        &self,
        _request: Request<VersionRequest>,
    ) -> std::result::Result<Response<VersionResponse>, Status> {
        let v = self.client.version().await.map_err(adapter_error_to_status)?;
        Ok(Response::new(VersionResponse {
            version: KUBE_API_VERSION.to_string(),
            runtime_name: ENGINE_RUNTIME_NAME.to_string(),
            runtime_version: v.version,
            runtime_api_version: v.api_version,
        }))
    }

    // ── Status ───────────────────────────────────────────────────────

    async fn status(
        &self,
        request: Request<StatusRequest>,
    ) -> std::result::Result<Response<StatusResponse>, Status> {
        let req = request.into_inner();

        let runtime_ready = match self.client.ping().await {
            Ok(()) => RuntimeCondition {
                r#type: "RuntimeReady".to_string(),
                status: true,
                reason: String::new(),
                message: String::new(),
            },
            Err(e) => RuntimeCondition {
                r#type: "RuntimeReady".to_string(),
                status: false,
                reason: "DockerDaemonNotReady".to_string(),
                message: e.to_string(),
            },
        };

        let network_ready = if self.options.network.has_network_config().await {
            RuntimeCondition {
                r#type: "NetworkReady".to_string(),
                status: true,
                reason: String::new(),
                message: String::new(),
            }
        } else {
            RuntimeCondition {
                r#type: "NetworkReady".to_string(),
                status: false,
                reason: "NetworkPluginNotReady".to_string(),
                message: format!(
                    "{}: no network config found in {}",
                    self.options.network.plugin_name,
                    self.options.network.plugin_conf_dir.display()
                ),
            }
        };

        let mut info = HashMap::new();
        if req.verbose {
            info.insert("cgroupDriver".to_string(), self.cgroup_driver.to_string());
            info.insert(
                "networkPlugin".to_string(),
                self.options.network.plugin_name.clone(),
            );
            info.insert(
                "sandboxImage".to_string(),
                self.options.pod_sandbox_image.clone(),
            );
            if let Some(cidr) = self.pod_cidr() {
                info.insert("podCIDR".to_string(), cidr);
            }
        }

        Ok(Response::new(StatusResponse {
            status: Some(RuntimeStatus {
                conditions: vec![runtime_ready, network_ready],
            }),
            info,
        }))
    }

    async fn update_runtime_config(
        &self,
        request: Request<UpdateRuntimeConfigRequest>,
    ) -> std::result::Result<Response<UpdateRuntimeConfigResponse>, Status> {
        let req = request.into_inner();
        let cidr = req
            .runtime_config
            .and_then(|c| c.network_config)
            .map(|n| n.pod_cidr)
            .filter(|c| !c.is_empty());

        if let Some(cidr) = cidr {
            tracing::info!(pod_cidr = %cidr, "CRI UpdateRuntimeConfig");
            *self.pod_cidr.write() = Some(cidr);
        }
        Ok(Response::new(UpdateRuntimeConfigResponse {}))
    }

    // ── Exec / Attach / PortForward ─────────────────────────────────

    async fn exec_sync(
        &self,
        request: Request<ExecSyncRequest>,
    ) -> std::result::Result<Response<ExecSyncResponse>, Status> {
        let req = request.into_inner();
        if req.container_id.is_empty() {
            return Err(Status::invalid_argument("container id required"));
        }
        if req.cmd.is_empty() {
            return Err(Status::invalid_argument("command required"));
        }

        tracing::info!(container_id = %req.container_id, "CRI ExecSync");

        let exec_id = self
            .client
            .create_exec(
                &req.container_id,
                &ExecConfig {
                    cmd: req.cmd.clone(),
                    attach_stdin: false,
                    attach_stdout: true,
                    attach_stderr: true,
                    tty: false,
                },
            )
            .await
            .map_err(adapter_error_to_status)?;

        let Hijacked {
            mut stream,
            mut buffered,
        } = self
            .client
            .start_exec(&exec_id, false)
            .await
            .map_err(adapter_error_to_status)?;

        let timeout = self.exec_sync_timeout(req.timeout);
        tokio::time::timeout(timeout, stream.read_to_end(&mut buffered))
            .await
            .map_err(|_| {
                Status::deadline_exceeded(format!(
                    "command {:?} timed out after {:?}",
                    req.cmd, timeout
                ))
            })?
            .map_err(|e| Status::internal(e.to_string()))?;

        let (stdout, stderr) = demux_output(&buffered);
        let exit_code = self
            .wait_exec_exit(&exec_id)
            .await
            .map_err(adapter_error_to_status)?;

        Ok(Response::new(ExecSyncResponse {
            stdout,
            stderr,
            exit_code,
        }))
    }

    async fn exec(
        &self,
        request: Request<ExecRequest>,
    ) -> std::result::Result<Response<ExecResponse>, Status> {
        let req = request.into_inner();
        if req.container_id.is_empty() {
            return Err(Status::invalid_argument("container id required"));
        }
        if req.cmd.is_empty() {
            return Err(Status::invalid_argument("command required"));
        }
        if !(req.stdin || req.stdout || req.stderr) {
            return Err(Status::invalid_argument(
                "one of stdin, stdout, or stderr must be set",
            ));
        }
        if req.tty && req.stderr {
            return Err(Status::invalid_argument("tty and stderr cannot both be set"));
        }

        tracing::info!(container_id = %req.container_id, tty = req.tty, "CRI Exec");

        let url = self.register(StreamingSession {
            kind: SessionKind::Exec,
            container_id: req.container_id,
            cmd: req.cmd,
            tty: req.tty,
            stdin: req.stdin,
            stdout: req.stdout,
            stderr: req.stderr,
            ports: vec![],
        });
        Ok(Response::new(ExecResponse { url }))
    }

    async fn attach(
        &self,
        request: Request<AttachRequest>,
    ) -> std::result::Result<Response<AttachResponse>, Status> {
        let req = request.into_inner();
        if req.container_id.is_empty() {
            return Err(Status::invalid_argument("container id required"));
        }
        if !(req.stdin || req.stdout || req.stderr) {
            return Err(Status::invalid_argument(
                "one of stdin, stdout, or stderr must be set",
            ));
        }

        tracing::info!(container_id = %req.container_id, "CRI Attach");

        let url = self.register(StreamingSession {
            kind: SessionKind::Attach,
            container_id: req.container_id,
            cmd: vec![],
            tty: req.tty,
            stdin: req.stdin,
            stdout: req.stdout,
            stderr: req.stderr,
            ports: vec![],
        });
        Ok(Response::new(AttachResponse { url }))
    }

    async fn port_forward(
        &self,
        request: Request<PortForwardRequest>,
    ) -> std::result::Result<Response<PortForwardResponse>, Status> {
        let req = request.into_inner();
        if req.pod_sandbox_id.is_empty() {
            return Err(Status::invalid_argument("sandbox id required"));
        }
        for port in &req.port {
            validate_port(*port)?;
        }

        tracing::info!(sandbox_id = %req.pod_sandbox_id, ports = ?req.port, "CRI PortForward");

        let url = self.register(StreamingSession {
            kind: SessionKind::PortForward,
            container_id: req.pod_sandbox_id,
            cmd: vec![],
            tty: false,
            stdin: true,
            stdout: true,
            stderr: false,
            ports: req.port,
        });
        Ok(Response::new(PortForwardResponse { url }))
    }
}

#[async_trait]
impl StreamingHandler for DockerService {
    async fn serve_stream(&self, request: StreamRequest, mut stream: TcpStream) -> Result<()> {
        // Look up and consume the session
        let session = match self.sessions.consume(&request.token) {
            Ok(session) if session.kind == request.kind => session,
            _ => {
                send_response(&mut stream, 404, "Session not found or expired").await?;
                return Ok(());
            }
        };

        let supported = match session.kind {
            SessionKind::PortForward => &self.options.streaming.supported_port_forward_protocols,
            _ => &self.options.streaming.supported_remote_command_protocols,
        };
        let protocol = match negotiate_protocol(request.header(STREAM_PROTOCOL_HEADER), supported)
        {
            Ok(protocol) => protocol,
            Err(requested) => {
                let msg = format!(
                    "unsupported streaming protocols: {} (supported: {})",
                    requested,
                    supported.join(", ")
                );
                send_response(&mut stream, 403, &msg).await?;
                return Ok(());
            }
        };

        if session.kind == SessionKind::PortForward {
            if let Err(e) = forward_port(&session, request.header(PORT_HEADER)) {
                send_response(&mut stream, 400, &e.to_string()).await?;
                return Ok(());
            }
        }

        tracing::info!(
            peer = %request.peer,
            kind = session.kind.as_path(),
            container_id = %session.container_id,
            "Streaming session started"
        );

        let engine = match self.open_engine_stream(&session, &request).await {
            Ok(engine) => engine,
            Err(e) => {
                send_response(&mut stream, 502, &e.to_string()).await?;
                return Err(e);
            }
        };

        send_upgrade(&mut stream, protocol.as_deref()).await?;
        bridge(
            stream,
            request.buffered,
            engine.stream,
            engine.buffered,
            self.options.streaming.stream_idle_timeout,
        )
        .await?;

        tracing::debug!(container_id = %session.container_id, "Streaming session finished");
        Ok(())
    }

    fn listening(&self, addr: SocketAddr) {
        *self.streaming_addr.write() = Some(addr);
    }
}
