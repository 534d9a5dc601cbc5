//! Container engine client over the engine's Unix control socket.
//!
//! Speaks the Docker Engine HTTP API. Each request opens a fresh connection;
//! exec and attach hijack the connection and hand the raw stream back to the
//! caller.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;

use privrt_core::error::{AdapterError, Result};

use crate::http::{read_body, read_head};

/// Engine system information (`GET /info`), reduced to what the adapter reads.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EngineInfo {
    /// Cgroup driver the engine manages containers with; empty if unset.
    #[serde(default)]
    pub cgroup_driver: String,
    #[serde(default)]
    pub server_version: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "ID", default)]
    pub id: String,
    #[serde(default)]
    pub docker_root_dir: String,
}

/// Engine version information (`GET /version`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EngineVersion {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub arch: String,
}

/// Exec instance configuration (`POST /containers/{id}/exec`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecConfig {
    pub cmd: Vec<String>,
    pub attach_stdin: bool,
    pub attach_stdout: bool,
    pub attach_stderr: bool,
    pub tty: bool,
}

/// Exec instance state (`GET /exec/{id}/json`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecInspect {
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct IdResponse {
    id: String,
}

/// Attach options (`POST /containers/{id}/attach`).
#[derive(Debug, Clone, Copy, Default)]
pub struct AttachOptions {
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
}

/// A connection taken over from the engine after an upgrade.
///
/// `buffered` holds stream bytes that arrived together with the response head.
#[derive(Debug)]
pub struct Hijacked {
    pub stream: UnixStream,
    pub buffered: Vec<u8>,
}

/// Operations the adapter needs from the container engine.
#[async_trait]
pub trait EngineClient: Send + Sync {
    /// Endpoint this client talks to.
    fn endpoint(&self) -> &str;

    async fn ping(&self) -> Result<()>;

    async fn info(&self) -> Result<EngineInfo>;

    async fn version(&self) -> Result<EngineVersion>;

    /// Create an exec instance, returning its id.
    async fn create_exec(&self, container_id: &str, config: &ExecConfig) -> Result<String>;

    /// Start an exec instance and hijack its I/O stream.
    async fn start_exec(&self, exec_id: &str, tty: bool) -> Result<Hijacked>;

    async fn inspect_exec(&self, exec_id: &str) -> Result<ExecInspect>;

    /// Attach to a container's main process and hijack its I/O stream.
    async fn attach(&self, container_id: &str, options: AttachOptions) -> Result<Hijacked>;
}

/// Opens engine connections.
#[async_trait]
pub trait EngineConnector: Send + Sync {
    async fn connect(
        &self,
        endpoint: &str,
        request_timeout: Duration,
        image_pull_progress_deadline: Duration,
    ) -> Result<Arc<dyn EngineClient>>;
}

/// Connector producing [`DockerClient`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct DockerConnector;

#[async_trait]
impl EngineConnector for DockerConnector {
    async fn connect(
        &self,
        endpoint: &str,
        request_timeout: Duration,
        image_pull_progress_deadline: Duration,
    ) -> Result<Arc<dyn EngineClient>> {
        let client =
            DockerClient::connect(endpoint, request_timeout, image_pull_progress_deadline).await?;
        Ok(Arc::new(client))
    }
}

/// Docker Engine API client over a Unix socket.
#[derive(Debug, Clone)]
pub struct DockerClient {
    endpoint: String,
    socket_path: PathBuf,
    request_timeout: Duration,
    image_pull_progress_deadline: Duration,
}

impl DockerClient {
    /// Connect to the engine, verifying it answers a ping within the
    /// request timeout.
    ///
    /// Any failure is reported as [`AdapterError::EngineConnect`].
    pub async fn connect(
        endpoint: &str,
        request_timeout: Duration,
        image_pull_progress_deadline: Duration,
    ) -> Result<Self> {
        let connect_error = |message: String| AdapterError::EngineConnect {
            endpoint: endpoint.to_string(),
            message,
        };

        let socket_path = parse_endpoint(endpoint).map_err(connect_error)?;
        let client = Self {
            endpoint: endpoint.to_string(),
            socket_path,
            request_timeout,
            image_pull_progress_deadline,
        };

        client
            .ping()
            .await
            .map_err(|e| connect_error(e.to_string()))?;

        tracing::info!(endpoint = %endpoint, "Connected to container engine");
        Ok(client)
    }

    /// Path of the engine's Unix socket.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn image_pull_progress_deadline(&self) -> Duration {
        self.image_pull_progress_deadline
    }

    async fn open(&self) -> Result<UnixStream> {
        UnixStream::connect(&self.socket_path).await.map_err(|e| {
            AdapterError::EngineQuery(format!(
                "cannot connect to {}: {}",
                self.socket_path.display(),
                e
            ))
        })
    }

    /// Issue a request and return status and body.
    async fn request(
        &self,
        method: &str,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<(u16, Vec<u8>)> {
        let fut = async {
            let mut stream = self.open().await?;
            stream
                .write_all(encode_request(method, path, body, None)?.as_bytes())
                .await?;

            let (head, rest) = read_head(&mut stream).await?;
            let status = head.status().ok_or_else(|| {
                AdapterError::EngineQuery(format!("malformed status line: {}", head.start_line))
            })?;
            let body = read_body(&mut stream, &head, rest).await?;
            Ok::<_, AdapterError>((status, body))
        };

        tokio::time::timeout(self.request_timeout, fut)
            .await
            .map_err(|_| {
                AdapterError::EngineQuery(format!(
                    "{} {} timed out after {:?}",
                    method, path, self.request_timeout
                ))
            })?
    }

    /// Issue a request and decode a JSON response, treating non-2xx as errors.
    async fn request_json<T>(
        &self,
        method: &str,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        let (status, bytes) = self.request(method, path, body).await?;
        if !(200..300).contains(&status) {
            return Err(engine_status_error(method, path, status, &bytes));
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Issue an upgrade request and take over the connection.
    async fn hijack(
        &self,
        method: &str,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<Hijacked> {
        let fut = async {
            let mut stream = self.open().await?;
            stream
                .write_all(encode_request(method, path, body, Some("tcp"))?.as_bytes())
                .await?;

            let (head, buffered) = read_head(&mut stream).await?;
            match head.status() {
                Some(101) | Some(200) => Ok::<_, AdapterError>(Hijacked { stream, buffered }),
                Some(status) => {
                    let bytes = read_body(&mut stream, &head, buffered)
                        .await
                        .unwrap_or_default();
                    Err(engine_status_error(method, path, status, &bytes))
                }
                None => Err(AdapterError::EngineQuery(format!(
                    "malformed status line: {}",
                    head.start_line
                ))),
            }
        };

        tokio::time::timeout(self.request_timeout, fut)
            .await
            .map_err(|_| {
                AdapterError::EngineQuery(format!(
                    "{} {} timed out after {:?}",
                    method, path, self.request_timeout
                ))
            })?
    }
}

#[async_trait]
impl EngineClient for DockerClient {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn ping(&self) -> Result<()> {
        let (status, body) = self.request("GET", "/_ping", None).await?;
        if status != 200 {
            return Err(engine_status_error("GET", "/_ping", status, &body));
        }
        Ok(())
    }

    async fn info(&self) -> Result<EngineInfo> {
        self.request_json("GET", "/info", None).await
    }

    async fn version(&self) -> Result<EngineVersion> {
        self.request_json("GET", "/version", None).await
    }

    async fn create_exec(&self, container_id: &str, config: &ExecConfig) -> Result<String> {
        let body = serde_json::to_value(config)?;
        let path = format!("/containers/{}/exec", container_id);
        let resp: IdResponse = self.request_json("POST", &path, Some(&body)).await?;
        Ok(resp.id)
    }

    async fn start_exec(&self, exec_id: &str, tty: bool) -> Result<Hijacked> {
        let body = serde_json::json!({ "Detach": false, "Tty": tty });
        let path = format!("/exec/{}/start", exec_id);
        self.hijack("POST", &path, Some(&body)).await
    }

    async fn inspect_exec(&self, exec_id: &str) -> Result<ExecInspect> {
        let path = format!("/exec/{}/json", exec_id);
        self.request_json("GET", &path, None).await
    }

    async fn attach(&self, container_id: &str, options: AttachOptions) -> Result<Hijacked> {
        let path = format!(
            "/containers/{}/attach?stream=1&stdin={}&stdout={}&stderr={}",
            container_id, options.stdin as u8, options.stdout as u8, options.stderr as u8,
        );
        self.hijack("POST", &path, None).await
    }
}

/// Resolve an endpoint to a Unix socket path.
///
/// Accepts `unix:///path` and bare absolute paths.
pub fn parse_endpoint(endpoint: &str) -> std::result::Result<PathBuf, String> {
    if let Some(path) = endpoint.strip_prefix("unix://") {
        if path.is_empty() {
            return Err("empty unix socket path".to_string());
        }
        return Ok(PathBuf::from(path));
    }
    if endpoint.starts_with('/') {
        return Ok(PathBuf::from(endpoint));
    }
    match endpoint.split_once("://") {
        Some((scheme, _)) => Err(format!("unsupported endpoint scheme '{}'", scheme)),
        None => Err(format!("invalid endpoint '{}'", endpoint)),
    }
}

fn encode_request(
    method: &str,
    path: &str,
    body: Option<&serde_json::Value>,
    upgrade: Option<&str>,
) -> Result<String> {
    let mut request = format!("{} {} HTTP/1.1\r\nHost: docker\r\n", method, path);
    match upgrade {
        Some(proto) => {
            request.push_str("Connection: Upgrade\r\n");
            request.push_str(&format!("Upgrade: {}\r\n", proto));
        }
        None => request.push_str("Connection: close\r\n"),
    }

    match body {
        Some(body) => {
            let body = serde_json::to_string(body)?;
            request.push_str("Content-Type: application/json\r\n");
            request.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
            request.push_str(&body);
        }
        None => request.push_str("\r\n"),
    }
    Ok(request)
}

fn engine_status_error(method: &str, path: &str, status: u16, body: &[u8]) -> AdapterError {
    #[derive(Deserialize)]
    struct EngineMessage {
        message: String,
    }

    let message = serde_json::from_slice::<EngineMessage>(body)
        .map(|m| m.message)
        .unwrap_or_else(|_| String::from_utf8_lossy(body).trim().to_string());
    AdapterError::EngineQuery(format!("{} {} returned {}: {}", method, path, status, message))
}

/// Split the engine's multiplexed stdout/stderr stream.
///
/// Frames are `[stream, 0, 0, 0, len(u32 BE)]` followed by `len` bytes;
/// stream 1 is stdout, 2 is stderr. A truncated trailing frame is dropped.
pub fn demux_output(data: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut pos = 0;

    while pos + 8 <= data.len() {
        let kind = data[pos];
        let len = u32::from_be_bytes([data[pos + 4], data[pos + 5], data[pos + 6], data[pos + 7]])
            as usize;
        let start = pos + 8;
        let end = (start + len).min(data.len());
        match kind {
            2 => stderr.extend_from_slice(&data[start..end]),
            _ => stdout.extend_from_slice(&data[start..end]),
        }
        pos = start + len;
    }

    (stdout, stderr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoint() {
        assert_eq!(
            parse_endpoint("unix:///var/run/docker.sock").unwrap(),
            PathBuf::from("/var/run/docker.sock")
        );
        assert_eq!(
            parse_endpoint("/run/docker.sock").unwrap(),
            PathBuf::from("/run/docker.sock")
        );
        assert!(parse_endpoint("unix://").is_err());
        assert!(parse_endpoint("tcp://127.0.0.1:2375")
            .unwrap_err()
            .contains("tcp"));
        assert!(parse_endpoint("docker.sock").is_err());
    }

    #[test]
    fn test_encode_request_with_body() {
        let body = serde_json::json!({"Tty": true});
        let req = encode_request("POST", "/exec/1/start", Some(&body), Some("tcp")).unwrap();
        assert!(req.starts_with("POST /exec/1/start HTTP/1.1\r\n"));
        assert!(req.contains("Upgrade: tcp\r\n"));
        assert!(req.contains("Content-Length: 12\r\n"));
        assert!(req.ends_with("{\"Tty\":true}"));
    }

    #[test]
    fn test_encode_request_without_body() {
        let req = encode_request("GET", "/info", None, None).unwrap();
        assert!(req.contains("Connection: close\r\n"));
        assert!(req.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_engine_info_deserialize() {
        let json = r#"{"ID":"abc","CgroupDriver":"systemd","ServerVersion":"24.0.7","Containers":3}"#;
        let info: EngineInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.cgroup_driver, "systemd");
        assert_eq!(info.id, "abc");
        assert_eq!(info.server_version, "24.0.7");
    }

    #[test]
    fn test_engine_info_missing_driver() {
        let info: EngineInfo = serde_json::from_str("{}").unwrap();
        assert!(info.cgroup_driver.is_empty());
    }

    #[test]
    fn test_exec_config_wire_names() {
        let config = ExecConfig {
            cmd: vec!["ls".to_string()],
            attach_stdout: true,
            ..Default::default()
        };
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["Cmd"][0], "ls");
        assert_eq!(json["AttachStdout"], true);
        assert_eq!(json["Tty"], false);
    }

    #[test]
    fn test_engine_status_error_uses_message() {
        let err = engine_status_error("GET", "/info", 500, br#"{"message":"boom"}"#);
        assert_eq!(err.to_string(), "Engine request failed: GET /info returned 500: boom");

        let err = engine_status_error("GET", "/info", 404, b"page not found\n");
        assert!(err.to_string().ends_with("page not found"));
    }

    #[test]
    fn test_demux_output() {
        let mut data = vec![1, 0, 0, 0, 0, 0, 0, 3];
        data.extend_from_slice(b"out");
        data.extend_from_slice(&[2, 0, 0, 0, 0, 0, 0, 3]);
        data.extend_from_slice(b"err");
        data.extend_from_slice(&[1, 0, 0, 0, 0, 0, 0, 1]);
        data.extend_from_slice(b"!");

        let (stdout, stderr) = demux_output(&data);
        assert_eq!(stdout, b"out!");
        assert_eq!(stderr, b"err");
    }

    #[test]
    fn test_demux_truncated_frame() {
        let data = vec![1, 0, 0, 0, 0, 0, 0, 10, b'a', b'b'];
        let (stdout, stderr) = demux_output(&data);
        assert_eq!(stdout, b"ab");
        assert!(stderr.is_empty());
    }

    #[tokio::test]
    async fn test_connect_missing_socket_is_engine_connect() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = format!("unix://{}", dir.path().join("missing.sock").display());
        let err = DockerClient::connect(&endpoint, Duration::from_secs(1), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::EngineConnect { .. }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_connect_unsupported_scheme() {
        let err = DockerClient::connect(
            "tcp://127.0.0.1:2375",
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AdapterError::EngineConnect { .. }));
    }
}
