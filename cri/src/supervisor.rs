//! Streaming server supervision.
//!
//! Runs the streaming listener on its own task and publishes its state on a
//! watch channel. A listener failure is terminal: it is logged and surfaced
//! as a [`StreamingFault`], never restarted. Whether the process exits is up
//! to the hosting code.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use privrt_core::config::StreamingConfig;
use privrt_core::error::{AdapterError, Result};

use crate::streaming::{ListenerState, StreamingFault, StreamingHandler, StreamingServer};

/// Handle to the running streaming listener.
pub struct StreamingSupervisor {
    addr: SocketAddr,
    state_rx: watch::Receiver<ListenerState>,
    shutdown_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl StreamingSupervisor {
    /// Start the listener in the background and return immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: &StreamingConfig, handler: Arc<dyn StreamingHandler>) -> Self {
        let server = StreamingServer::new(config, handler);
        let addr = server.addr();
        let (state_tx, state_rx) = watch::channel(ListenerState::Starting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            match server.serve(&state_tx, shutdown_rx).await {
                Ok(()) => {
                    state_tx.send_replace(ListenerState::Stopped);
                }
                Err(e) => {
                    tracing::error!(
                        addr = %addr,
                        error = %e,
                        "Failed to start streaming server for privileged runtime"
                    );
                    let message = match e {
                        AdapterError::StreamingListen { message, .. } => message,
                        other => other.to_string(),
                    };
                    state_tx.send_replace(ListenerState::Failed(StreamingFault { addr, message }));
                }
            }
        });

        Self {
            addr,
            state_rx,
            shutdown_tx,
            handle: Some(handle),
        }
    }

    /// Configured bind address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> ListenerState {
        self.state_rx.borrow().clone()
    }

    /// Wait until the listener is bound, returning the bound address.
    pub async fn wait_listening(&self) -> Result<SocketAddr> {
        let mut rx = self.state_rx.clone();
        let state = rx
            .wait_for(|s| !matches!(s, ListenerState::Starting))
            .await
            .map(|s| s.clone())
            .unwrap_or(ListenerState::Stopped);

        match state {
            ListenerState::Listening(addr) => Ok(addr),
            ListenerState::Failed(fault) => Err(fault.into()),
            ListenerState::Starting | ListenerState::Stopped => Err(AdapterError::StreamingListen {
                addr: self.addr.to_string(),
                message: "listener stopped before binding".to_string(),
            }),
        }
    }

    /// Resolve once the listener has terminally failed.
    ///
    /// Returns `None` if the listener stopped cleanly through [`shutdown`].
    ///
    /// [`shutdown`]: StreamingSupervisor::shutdown
    pub async fn fault(&self) -> Option<StreamingFault> {
        let mut rx = self.state_rx.clone();
        let state = rx
            .wait_for(|s| matches!(s, ListenerState::Failed(_) | ListenerState::Stopped))
            .await
            .map(|s| s.clone())
            .ok()?;
        match state {
            ListenerState::Failed(fault) => Some(fault),
            _ => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Stop accepting connections and wait for the listener task.
    ///
    /// Connections already handed to the handler run to completion on their
    /// own tasks.
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Streaming listener task ended abnormally");
            }
        }
    }
}

impl Drop for StreamingSupervisor {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
