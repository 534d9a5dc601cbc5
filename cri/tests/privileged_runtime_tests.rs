//! Privileged runtime integration tests.
//!
//! Runs the runtime against a fake container engine serving the Docker
//! Engine API on a Unix socket in a temporary directory:
//!
//! 1. Cgroup driver agreement decides whether construction succeeds
//! 2. An unreachable engine is a fatal connect error
//! 3. ExecSync and streaming exec go through the engine's exec API
//! 4. A streaming bind failure surfaces as a fault, not a process exit

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tonic::Request;

use privrt_core::config::StreamingConfig;
use privrt_core::error::AdapterError;
use privrt_cri::assembler::CgroupDriverAgreement;
use privrt_cri::cri_api::*;
use privrt_cri::http::{read_body, read_head};
use privrt_cri::PrivilegedRuntime;

/// Fake engine: answers ping/info/version and runs one canned exec.
struct FakeEngine {
    endpoint: String,
    exec_cmds: Arc<Mutex<Vec<Vec<String>>>>,
    _dir: tempfile::TempDir,
}

impl FakeEngine {
    fn start(cgroup_driver: &'static str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("docker.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let exec_cmds = Arc::new(Mutex::new(Vec::new()));

        let cmds = Arc::clone(&exec_cmds);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let cmds = Arc::clone(&cmds);
                tokio::spawn(handle_engine_conn(stream, cgroup_driver, cmds));
            }
        });

        Self {
            endpoint: format!("unix://{}", socket.display()),
            exec_cmds,
            _dir: dir,
        }
    }
}

async fn respond(stream: &mut UnixStream, status: u16, body: &str) {
    let resp = format!(
        "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    let _ = stream.write_all(resp.as_bytes()).await;
}

fn frame(stream: u8, data: &[u8]) -> Vec<u8> {
    let mut out = vec![stream, 0, 0, 0];
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(data);
    out
}

async fn handle_engine_conn(
    mut stream: UnixStream,
    cgroup_driver: &'static str,
    cmds: Arc<Mutex<Vec<Vec<String>>>>,
) {
    let Ok((head, rest)) = read_head(&mut stream).await else {
        return;
    };
    let body = if head.content_length().is_some() {
        read_body(&mut stream, &head, rest).await.unwrap_or_default()
    } else {
        Vec::new()
    };
    let Some((method, path)) = head.request_target() else {
        return;
    };
    let (method, path) = (method.to_string(), path.to_string());

    match (method.as_str(), path.as_str()) {
        ("GET", "/_ping") => respond(&mut stream, 200, "OK").await,
        ("GET", "/info") => {
            let info = serde_json::json!({
                "CgroupDriver": cgroup_driver,
                "ServerVersion": "24.0.7",
                "ID": "fake-engine",
            });
            respond(&mut stream, 200, &info.to_string()).await
        }
        ("GET", "/version") => {
            respond(
                &mut stream,
                200,
                r#"{"Version":"24.0.7","ApiVersion":"1.43"}"#,
            )
            .await
        }
        ("POST", p) if p.starts_with("/containers/") && p.ends_with("/exec") => {
            let config: serde_json::Value = serde_json::from_slice(&body).unwrap_or_default();
            let cmd: Vec<String> = config["Cmd"]
                .as_array()
                .map(|a| {
                    a.iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();
            cmds.lock().push(cmd);
            respond(&mut stream, 201, r#"{"Id":"exec-1"}"#).await
        }
        ("POST", "/exec/exec-1/start") => {
            let mut out = b"HTTP/1.1 101 UPGRADED\r\nConnection: Upgrade\r\nUpgrade: tcp\r\n\r\n"
                .to_vec();
            out.extend(frame(1, b"hello\n"));
            out.extend(frame(2, b"oops\n"));
            let _ = stream.write_all(&out).await;
            let _ = stream.shutdown().await;
        }
        ("GET", "/exec/exec-1/json") => {
            respond(&mut stream, 200, r#"{"Running":false,"ExitCode":3}"#).await
        }
        _ => respond(&mut stream, 404, r#"{"message":"page not found"}"#).await,
    }
}

/// An address nothing listens on once this returns.
fn free_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

async fn build(
    endpoint: &str,
    streaming: StreamingConfig,
    cgroup_driver: &str,
    root_dir: &Path,
) -> privrt_core::error::Result<PrivilegedRuntime> {
    PrivilegedRuntime::new(
        Some(endpoint),
        streaming,
        &root_dir.join("net.d"),
        Path::new("/opt/cni/bin"),
        cgroup_driver,
        &root_dir.join("state"),
    )
    .await
}

#[tokio::test]
async fn test_driver_mismatch_fails_and_starts_nothing() {
    let engine = FakeEngine::start("systemd");
    let root = tempfile::tempdir().unwrap();
    let addr = free_addr();

    let err = build(
        &engine.endpoint,
        StreamingConfig::new(addr),
        "cgroupfs",
        root.path(),
    )
    .await
    .err()
    .unwrap();

    assert!(matches!(err, AdapterError::CgroupDriverMismatch { .. }));
    let msg = err.to_string();
    assert!(msg.contains("cgroupfs"));
    assert!(msg.contains("systemd"));
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_engine_without_driver_is_accepted() {
    let engine = FakeEngine::start("");
    let root = tempfile::tempdir().unwrap();

    let mut runtime = build(
        &engine.endpoint,
        StreamingConfig::new("127.0.0.1:0".parse().unwrap()),
        "cgroupfs",
        root.path(),
    )
    .await
    .unwrap();

    assert_eq!(runtime.service_name(), "privileged runtime");
    assert_eq!(
        runtime.cgroup_driver_agreement(),
        CgroupDriverAgreement::EngineUnset
    );
    assert_eq!(runtime.network().plugin_name, "cni");
    assert_eq!(runtime.network().mtu, 1460);
    assert!(root.path().join("state").is_dir());
    runtime.streaming().wait_listening().await.unwrap();
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_engine_is_fatal() {
    let root = tempfile::tempdir().unwrap();
    let endpoint = format!("unix://{}", root.path().join("missing.sock").display());
    let addr = free_addr();

    let err = build(&endpoint, StreamingConfig::new(addr), "cgroupfs", root.path())
        .await
        .err()
        .unwrap();

    assert!(matches!(err, AdapterError::EngineConnect { .. }));
    assert!(err.is_fatal());
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_version_and_status_from_engine() {
    let engine = FakeEngine::start("cgroupfs");
    let root = tempfile::tempdir().unwrap();
    let mut runtime = build(
        &engine.endpoint,
        StreamingConfig::new("127.0.0.1:0".parse().unwrap()),
        "cgroupfs",
        root.path(),
    )
    .await
    .unwrap();

    let version = runtime
        .version(Request::new(VersionRequest::default()))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(version.runtime_name, "docker");
    assert_eq!(version.runtime_version, "24.0.7");
    assert_eq!(version.runtime_api_version, "1.43");

    let status = runtime
        .status(Request::new(StatusRequest::default()))
        .await
        .unwrap()
        .into_inner();
    let conditions = status.status.unwrap().conditions;
    assert_eq!(conditions[0].r#type, "RuntimeReady");
    assert!(conditions[0].status);
    assert!(!conditions[1].status);

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_exec_sync_demultiplexes_output() {
    let engine = FakeEngine::start("cgroupfs");
    let root = tempfile::tempdir().unwrap();
    let mut runtime = build(
        &engine.endpoint,
        StreamingConfig::new("127.0.0.1:0".parse().unwrap()),
        "cgroupfs",
        root.path(),
    )
    .await
    .unwrap();

    let resp = runtime
        .exec_sync(Request::new(ExecSyncRequest {
            container_id: "c1".to_string(),
            cmd: vec!["cat".to_string(), "/etc/hostname".to_string()],
            timeout: 5,
        }))
        .await
        .unwrap()
        .into_inner();

    assert_eq!(resp.stdout, b"hello\n");
    assert_eq!(resp.stderr, b"oops\n");
    assert_eq!(resp.exit_code, 3);
    assert_eq!(
        engine.exec_cmds.lock()[0],
        vec!["cat".to_string(), "/etc/hostname".to_string()]
    );

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_streaming_exec_end_to_end() {
    let engine = FakeEngine::start("cgroupfs");
    let root = tempfile::tempdir().unwrap();
    let mut runtime = build(
        &engine.endpoint,
        StreamingConfig::new("127.0.0.1:0".parse().unwrap()),
        "cgroupfs",
        root.path(),
    )
    .await
    .unwrap();
    let addr = runtime.streaming().wait_listening().await.unwrap();

    let url = runtime
        .exec(Request::new(ExecRequest {
            container_id: "c1".to_string(),
            cmd: vec!["sh".to_string()],
            stdout: true,
            stderr: true,
            ..Default::default()
        }))
        .await
        .unwrap()
        .into_inner()
        .url;
    assert!(url.starts_with(&format!("http://{}/exec/", addr)));
    let (_, token) = url.split_once("/exec/").unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    let req = format!(
        "POST /exec/{} HTTP/1.1\r\nHost: node\r\nX-Stream-Protocol-Version: v4.channel.k8s.io\r\n\r\n",
        token
    );
    client.write_all(req.as_bytes()).await.unwrap();

    let mut received = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut received))
        .await
        .unwrap()
        .unwrap();
    let received = String::from_utf8_lossy(&received);

    assert!(received.starts_with("HTTP/1.1 101 Switching Protocols"));
    assert!(received.contains("X-Stream-Protocol-Version: v4.channel.k8s.io"));
    assert!(received.contains("hello\n"));
    assert_eq!(engine.exec_cmds.lock()[0], vec!["sh".to_string()]);

    // Tokens are single-use
    let mut again = TcpStream::connect(addr).await.unwrap();
    again.write_all(req.as_bytes()).await.unwrap();
    let mut resp = String::new();
    again.read_to_string(&mut resp).await.unwrap();
    assert!(resp.starts_with("HTTP/1.1 404"));

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_streaming_rejects_unsupported_protocol() {
    let engine = FakeEngine::start("cgroupfs");
    let root = tempfile::tempdir().unwrap();
    let mut runtime = build(
        &engine.endpoint,
        StreamingConfig::new("127.0.0.1:0".parse().unwrap()),
        "cgroupfs",
        root.path(),
    )
    .await
    .unwrap();
    let addr = runtime.streaming().wait_listening().await.unwrap();

    let url = runtime
        .attach(Request::new(AttachRequest {
            container_id: "c1".to_string(),
            stdout: true,
            ..Default::default()
        }))
        .await
        .unwrap()
        .into_inner()
        .url;
    let (_, token) = url.split_once("/attach/").unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    let req = format!(
        "POST /attach/{} HTTP/1.1\r\nX-Stream-Protocol-Version: v9.channel.example\r\n\r\n",
        token
    );
    client.write_all(req.as_bytes()).await.unwrap();
    let mut resp = String::new();
    client.read_to_string(&mut resp).await.unwrap();
    assert!(resp.starts_with("HTTP/1.1 403"));
    assert!(engine.exec_cmds.lock().is_empty());

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_streaming_bind_failure_is_a_fault() {
    let engine = FakeEngine::start("cgroupfs");
    let root = tempfile::tempdir().unwrap();
    let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = taken.local_addr().unwrap();

    // Construction itself succeeds; the listener fails in the background
    let runtime = build(
        &engine.endpoint,
        StreamingConfig::new(addr),
        "cgroupfs",
        root.path(),
    )
    .await
    .unwrap();

    let fault = tokio::time::timeout(Duration::from_secs(5), runtime.streaming().fault())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fault.addr, addr);

    let err: AdapterError = fault.into();
    assert!(err.is_fatal());
}

