//! privrt - privileged CRI runtime binary.
//!
//! Validates the engine configuration, builds the privileged runtime and
//! serves streaming sessions until interrupted. Exits with status 1 when the
//! engine is unreachable or the streaming listener fails.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use privrt_core::config::{KubeletDefaults, StreamingConfig};
use privrt_core::error::AdapterError;

use privrt_cri::assembler::RuntimeParams;
use privrt_cri::PrivilegedRuntime;

/// privrt privileged runtime
#[derive(Parser, Debug)]
#[command(name = "privrt", about = "Privileged container runtime adapter")]
struct Args {
    /// Engine control endpoint (defaults to the configured engine endpoint).
    #[arg(long)]
    runtime_endpoint: Option<String>,

    /// Address the streaming server listens on.
    #[arg(long, default_value = "127.0.0.1:10010")]
    streaming_addr: SocketAddr,

    /// Base URL advertised for streaming sessions.
    #[arg(long)]
    streaming_base_url: Option<String>,

    /// Directory holding CNI network configurations.
    #[arg(long, default_value = "/etc/cni/net.d")]
    cni_net_dir: PathBuf,

    /// Directory holding CNI plugin binaries.
    #[arg(long, default_value = "/opt/cni/bin")]
    cni_plugin_dir: PathBuf,

    /// Cgroup driver (cgroupfs or systemd); must match the engine.
    #[arg(long, default_value = "cgroupfs")]
    cgroup_driver: String,

    /// Directory for runtime state.
    #[arg(long, default_value = "/var/lib/privrt")]
    root_dir: PathBuf,

    /// YAML file overriding the orchestrator defaults.
    #[arg(long)]
    kubelet_config: Option<String>,
}

fn expand_home(path: &str) -> PathBuf {
    if path.starts_with('~') {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        home.join(path.strip_prefix("~/").unwrap_or(path))
    } else {
        PathBuf::from(path)
    }
}

fn load_defaults(path: Option<&Path>) -> anyhow::Result<KubeletDefaults> {
    match path {
        Some(path) => KubeletDefaults::load(path)
            .with_context(|| format!("Failed to load kubelet config {}", path.display())),
        None => Ok(KubeletDefaults::default()),
    }
}

fn exit_if_fatal(err: &AdapterError) {
    if err.is_fatal() {
        tracing::error!(error = %err, "Fatal error, exiting");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let kubelet_config = args.kubelet_config.as_deref().map(expand_home);
    let defaults = load_defaults(kubelet_config.as_deref())?;

    let mut streaming = StreamingConfig::new(args.streaming_addr);
    streaming.base_url = args.streaming_base_url.clone();

    tracing::info!(
        endpoint = args.runtime_endpoint.as_deref().unwrap_or("<default>"),
        streaming_addr = %args.streaming_addr,
        cgroup_driver = %args.cgroup_driver,
        root_dir = %args.root_dir.display(),
        "Starting privrt privileged runtime"
    );

    let params = RuntimeParams {
        endpoint: args.runtime_endpoint,
        streaming,
        cni_net_dir: args.cni_net_dir,
        cni_plugin_dir: args.cni_plugin_dir,
        cgroup_driver: args.cgroup_driver,
        root_dir: args.root_dir,
        defaults,
    };

    let mut runtime = match PrivilegedRuntime::from_params(params).await {
        Ok(runtime) => runtime,
        Err(e) => {
            exit_if_fatal(&e);
            return Err(e).context("Failed to create privileged runtime");
        }
    };

    if let Err(e) = runtime.streaming().wait_listening().await {
        exit_if_fatal(&e);
        return Err(e.into());
    }

    tracing::info!(runtime = runtime.service_name(), "Runtime ready");

    let interrupted = tokio::select! {
        _ = tokio::signal::ctrl_c() => true,
        fault = runtime.streaming().fault() => {
            if let Some(fault) = fault {
                exit_if_fatal(&fault.into());
            }
            false
        }
    };

    if interrupted {
        tracing::info!("Shutting down");
        runtime.shutdown().await;
    }

    Ok(())
}
