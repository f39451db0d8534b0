//! Reloading pgbouncer after a config change
//!
//! The kubelet propagates ConfigMap updates into running pods with a delay.
//! Each Running pod is polled until its mounted `pgbouncer.ini` matches the
//! rendered text, then pgbouncer is told to `RELOAD` through its admin
//! console. All pods share one deadline.

use std::future::Future;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::{Api, Client, ResourceExt};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::controller::error::Result;
use crate::crd::PgBouncer;
use crate::resources::exec::{ExecResult, read_live_config, reload_pgbouncer};
use crate::resources::statefulset::pod_selector;

/// How often the mounted config is re-read
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Outcome of syncing every Running pod
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LiveSyncReport {
    pub reloaded: Vec<String>,
    /// The mounted file never matched before the deadline
    pub timed_out: Vec<String>,
    /// The file matched but `RELOAD` failed
    pub reload_failed: Vec<String>,
}

impl LiveSyncReport {
    pub fn is_complete(&self) -> bool {
        self.timed_out.is_empty() && self.reload_failed.is_empty()
    }
}

/// Poll `read` until it returns `desired` or `deadline` passes.
///
/// Read errors (a restarting pod, a transient exec failure) count as a
/// mismatch and are retried on the next tick.
pub async fn wait_for_config<F, Fut>(
    desired: &str,
    interval: Duration,
    deadline: Instant,
    mut read: F,
) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ExecResult<String>>,
{
    loop {
        match read().await {
            Ok(live) if live == desired => return true,
            Ok(_) => debug!("Mounted config not updated yet"),
            Err(e) => debug!(error = %e, "Reading mounted config failed, retrying"),
        }

        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}

fn is_running(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|phase| phase == "Running")
}

/// Wait for every Running pod to see `ini`, then reload it.
///
/// Never fails on a timeout; the report says which pods were left behind.
pub async fn sync_live_config(
    client: &Client,
    pgbouncer: &PgBouncer,
    ini: &str,
    admin_password: &str,
    timeout: Duration,
) -> Result<LiveSyncReport> {
    let pods: Api<Pod> =
        Api::namespaced(client.clone(), &pgbouncer.namespace().unwrap_or_default());
    let running: Vec<String> = pods
        .list(&ListParams::default().labels(&pod_selector(pgbouncer)))
        .await?
        .items
        .iter()
        .filter(|p| is_running(p))
        .map(ResourceExt::name_any)
        .collect();

    let deadline = Instant::now() + timeout;
    let port = pgbouncer.listen_port();
    let mut report = LiveSyncReport::default();

    for pod in running {
        let matched =
            wait_for_config(ini, POLL_INTERVAL, deadline, || read_live_config(&pods, &pod)).await;
        if !matched {
            warn!(pod = %pod, timeout = ?timeout, "Mounted config did not match before the deadline");
            report.timed_out.push(pod);
            continue;
        }

        match reload_pgbouncer(&pods, &pod, port, admin_password).await {
            Ok(()) => {
                info!(pod = %pod, "Reloaded pgbouncer");
                report.reloaded.push(pod);
            }
            Err(e) => {
                warn!(pod = %pod, error = %e, "pgbouncer reload failed");
                report.reload_failed.push(pod);
            }
        }
    }

    Ok(report)
}
