//! Command execution inside pgbouncer pods
//!
//! The running proxy does not watch its config file, so the operator reads
//! the mounted file back and issues `RELOAD` on the admin console through
//! the pod exec subresource.

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use crate::resources::common::{ADMIN_USER, PGBOUNCER_CONTAINER, config_file_path};

/// Errors that can occur while executing a command in a pod
#[derive(Error, Debug)]
pub enum ExecError {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to execute command in pod {pod}: {message}")]
    ExecFailed { pod: String, message: String },

    #[error("Unexpected RELOAD output from pod {pod}: {output:?}")]
    UnexpectedReloadOutput { pod: String, output: String },
}

pub type ExecResult<T> = std::result::Result<T, ExecError>;

/// Build the admin console command that makes pgbouncer re-read its config
pub fn reload_command(listen_port: i32, admin_password: &str) -> Vec<String> {
    vec![
        "env".to_string(),
        format!("PGPASSWORD={}", admin_password),
        "psql".to_string(),
        "--host=127.0.0.1".to_string(),
        format!("--port={}", listen_port),
        format!("--username={}", ADMIN_USER),
        ADMIN_USER.to_string(),
        "--command=RELOAD".to_string(),
    ]
}

/// Check the stdout of the RELOAD command
pub fn is_reload_success(stdout: &str) -> bool {
    stdout.trim() == "RELOAD"
}

/// Read the config file the pod currently has mounted
pub async fn read_live_config(pods: &Api<Pod>, pod_name: &str) -> ExecResult<String> {
    let command = vec!["cat".to_string(), config_file_path()];
    exec_command_in_pod(pods, pod_name, command).await
}

/// Issue RELOAD on the admin console of a pod
pub async fn reload_pgbouncer(
    pods: &Api<Pod>,
    pod_name: &str,
    listen_port: i32,
    admin_password: &str,
) -> ExecResult<()> {
    let stdout =
        exec_command_in_pod(pods, pod_name, reload_command(listen_port, admin_password)).await?;

    if is_reload_success(&stdout) {
        Ok(())
    } else {
        Err(ExecError::UnexpectedReloadOutput {
            pod: pod_name.to_string(),
            output: stdout,
        })
    }
}

/// Execute a command in the pgbouncer container and return its stdout
async fn exec_command_in_pod(
    pods: &Api<Pod>,
    pod_name: &str,
    command: Vec<String>,
) -> ExecResult<String> {
    debug!(pod = %pod_name, command = %command.first().map(String::as_str).unwrap_or_default(), "Executing command in pod");

    let attach_params = AttachParams {
        container: Some(PGBOUNCER_CONTAINER.to_string()),
        stdin: false,
        stdout: true,
        stderr: true,
        tty: false,
        ..Default::default()
    };

    let mut attached = pods.exec(pod_name, command, &attach_params).await?;

    let stdout = attached.stdout().ok_or_else(|| ExecError::ExecFailed {
        pod: pod_name.to_string(),
        message: "Failed to get stdout from exec".to_string(),
    })?;
    let stderr = attached.stderr().ok_or_else(|| ExecError::ExecFailed {
        pod: pod_name.to_string(),
        message: "Failed to get stderr from exec".to_string(),
    })?;

    let (stdout_output, stderr_output) = tokio::join!(read_stream(stdout), read_stream(stderr));
    let stdout_output = stdout_output?;
    let stderr_output = stderr_output?;

    let status = attached.take_status().ok_or_else(|| ExecError::ExecFailed {
        pod: pod_name.to_string(),
        message: "Failed to get status from exec".to_string(),
    })?;

    if let Some(status) = status.await
        && status.status.as_deref() != Some("Success")
    {
        let message = if stderr_output.is_empty() {
            format!("Command failed with status: {:?}", status.message)
        } else {
            stderr_output
        };
        return Err(ExecError::ExecFailed {
            pod: pod_name.to_string(),
            message,
        });
    }

    Ok(stdout_output)
}

async fn read_stream<R: AsyncRead + Unpin>(mut reader: R) -> ExecResult<String> {
    let mut buffer = Vec::new();
    reader.read_to_end(&mut buffer).await?;
    Ok(String::from_utf8_lossy(&buffer).to_string())
}
