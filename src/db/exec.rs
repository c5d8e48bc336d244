//! Command execution inside database pods.
//!
//! Decommission runs through the `cockroach` binary inside the pod rather
//! than SQL, so this module wraps `pods/exec` with output capture.

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams};
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::controller::{Error, Result};

/// Captured output of an exec.
#[derive(Clone, Debug, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Run a command in a pod container and capture stdout/stderr. Non-success
/// termination is an error carrying stderr.
pub async fn exec_in_pod(
    pods: &Api<Pod>,
    pod_name: &str,
    container: &str,
    command: Vec<String>,
) -> Result<ExecOutput> {
    debug!(pod = pod_name, command = ?command, "executing command in pod");

    let params = AttachParams {
        container: Some(container.to_string()),
        stdout: true,
        stderr: true,
        stdin: false,
        tty: false,
        ..Default::default()
    };

    let mut attached = pods.exec(pod_name, command, &params).await?;

    let mut stdout = String::new();
    if let Some(mut reader) = attached.stdout() {
        reader
            .read_to_string(&mut stdout)
            .await
            .map_err(Error::Io)?;
    }

    let mut stderr = String::new();
    if let Some(mut reader) = attached.stderr() {
        reader
            .read_to_string(&mut stderr)
            .await
            .map_err(Error::Io)?;
    }

    let status = attached.take_status();
    if let Some(status_future) = status {
        if let Some(status) = status_future.await {
            if status.status.as_deref() != Some("Success") {
                return Err(Error::Transient(format!(
                    "command failed in pod {pod_name}: {}",
                    if stderr.is_empty() {
                        status.message.unwrap_or_default()
                    } else {
                        stderr.clone()
                    }
                )));
            }
        }
    }

    Ok(ExecOutput { stdout, stderr })
}

/// Build the `cockroach` invocation prefix with the right security flags.
pub fn cockroach_cmd(secure: bool, args: &[&str]) -> Vec<String> {
    let mut cmd = vec!["./cockroach".to_string()];
    cmd.extend(args.iter().map(|s| s.to_string()));
    if secure {
        cmd.push(format!("--certs-dir={}", crate::cluster::CERTS_DIR));
    } else {
        cmd.push("--insecure".to_string());
    }
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cockroach_cmd_secure() {
        let cmd = cockroach_cmd(true, &["node", "status", "--format=csv"]);
        assert_eq!(
            cmd,
            vec![
                "./cockroach",
                "node",
                "status",
                "--format=csv",
                "--certs-dir=cockroach-certs"
            ]
        );
    }

    #[test]
    fn test_cockroach_cmd_insecure() {
        let cmd = cockroach_cmd(false, &["node", "decommission", "4"]);
        assert!(cmd.contains(&"--insecure".to_string()));
        assert!(!cmd.iter().any(|a| a.starts_with("--certs-dir")));
    }
}
