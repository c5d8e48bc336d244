//! Port forwarding utilities for SQL connections.
//!
//! Provides `PortForward`, which uses kube-rs native port-forwarding to reach
//! a CockroachDB pod's SQL port from outside the cluster. This is how the
//! operator talks SQL to the database when it is not running in-cluster
//! (local development, tests).
//!
//! When a `PortForward` goes out of scope the forwarding stops (RAII).

use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Errors that can occur during port forwarding
#[derive(Error, Debug)]
pub enum PortForwardError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Port forward stream unavailable")]
    StreamUnavailable,

    #[error("Port forward join error: {0}")]
    JoinError(String),
}

impl From<PortForwardError> for crate::controller::Error {
    fn from(e: PortForwardError) -> Self {
        match e {
            PortForwardError::Kube(inner) => crate::controller::Error::Kube(inner),
            PortForwardError::Io(inner) => crate::controller::Error::Io(inner),
            other => crate::controller::Error::Transient(other.to_string()),
        }
    }
}

/// RAII wrapper for a port-forward to a single pod.
///
/// When this struct is dropped, the forward stops.
pub struct PortForward {
    local_port: u16,
    shutdown_tx: Option<oneshot::Sender<()>>,
    _handle: JoinHandle<()>,
    cleanup_initiated: AtomicBool,
}

impl PortForward {
    /// Start a port-forward to a pod's port. If `local_port` is None, an
    /// available port is picked automatically.
    pub async fn start(
        client: Client,
        namespace: &str,
        pod_name: &str,
        remote_port: u16,
        local_port: Option<u16>,
    ) -> Result<Self, PortForwardError> {
        let local_port = match local_port {
            Some(p) => p,
            None => get_available_port()?,
        };

        tracing::debug!(
            namespace = namespace,
            pod = %pod_name,
            local_port = local_port,
            remote_port = remote_port,
            "Starting port-forward"
        );

        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let ns = namespace.to_string();
        let pod = pod_name.to_string();

        let handle = tokio::spawn(async move {
            if let Err(e) =
                run_port_forward(client, &ns, &pod, local_port, remote_port, shutdown_rx).await
            {
                tracing::warn!(error = %e, "Port forward error");
            }
        });

        // Give the listener a moment to bind
        tokio::time::sleep(Duration::from_millis(100)).await;

        tracing::info!(
            local_port = local_port,
            pod = %pod_name,
            "Port-forward established"
        );

        Ok(Self {
            local_port,
            shutdown_tx: Some(shutdown_tx),
            _handle: handle,
            cleanup_initiated: AtomicBool::new(false),
        })
    }

    /// Get the local port that is forwarding to the pod
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Stop the port-forward
    pub fn stop(&mut self) {
        if self.cleanup_initiated.swap(true, Ordering::SeqCst) {
            return;
        }

        tracing::debug!(local_port = self.local_port, "Stopping port-forward");

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for PortForward {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Accept loop for the local listener
async fn run_port_forward(
    client: Client,
    namespace: &str,
    pod_name: &str,
    local_port: u16,
    remote_port: u16,
    mut shutdown_rx: oneshot::Receiver<()>,
) -> Result<(), PortForwardError> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);

    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", local_port)).await?;

    tracing::debug!(local_port = local_port, "Port forward listener started");

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                tracing::debug!("Port forward shutdown requested");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        tracing::trace!(client_addr = %addr, "New port forward connection");

                        let pods = pods.clone();
                        let pod_name = pod_name.to_string();

                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(
                                pods,
                                &pod_name,
                                remote_port,
                                stream
                            ).await {
                                tracing::warn!(error = %e, "Port forward connection error");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Port forward accept error");
                    }
                }
            }
        }
    }

    Ok(())
}

/// Handle a single port-forward connection
#[allow(clippy::indexing_slicing)] // Safe: n is always <= buf.len() after read()
async fn handle_connection(
    pods: Api<Pod>,
    pod_name: &str,
    remote_port: u16,
    mut local_stream: TcpStream,
) -> Result<(), PortForwardError> {
    let mut pf = pods.portforward(pod_name, &[remote_port]).await?;

    let upstream = pf
        .take_stream(remote_port)
        .ok_or(PortForwardError::StreamUnavailable)?;

    let (mut local_read, mut local_write) = local_stream.split();
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let client_to_server = async {
        let mut buf = [0u8; 8192];
        loop {
            let n = local_read.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            upstream_write.write_all(&buf[..n]).await?;
        }
        upstream_write.shutdown().await?;
        Ok::<_, std::io::Error>(())
    };

    let server_to_client = async {
        let mut buf = [0u8; 8192];
        loop {
            let n = upstream_read.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            local_write.write_all(&buf[..n]).await?;
        }
        local_write.shutdown().await?;
        Ok::<_, std::io::Error>(())
    };

    // Run both directions concurrently
    let _ = tokio::try_join!(client_to_server, server_to_client);

    pf.join()
        .await
        .map_err(|e| PortForwardError::JoinError(e.to_string()))?;

    Ok(())
}

/// Find an available local port by binding to port 0
pub fn get_available_port() -> Result<u16, PortForwardError> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    Ok(port)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_get_available_port() {
        let port = get_available_port().expect("should find port");
        assert!(port > 0);
    }

    #[test]
    fn test_error_conversion() {
        let err: crate::controller::Error = PortForwardError::StreamUnavailable.into();
        assert!(err.is_retryable());
    }
}
