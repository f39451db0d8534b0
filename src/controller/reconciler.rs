//! Reconciliation logic for PgBouncer resources
//!
//! Each pass validates the spec, writes every owned object in a fixed order
//! and then waits for the StatefulSet to report all replicas ready. Every
//! step is idempotent, so a pass that fails halfway is finished by the next.

use std::sync::Arc;
use std::time::{Duration, Instant};

use k8s_openapi::api::apps::v1::StatefulSet;
use kube::api::{Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Api, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use crate::controller::context::Context;
use crate::controller::error::{BackoffConfig, Error, Result};
use crate::controller::state_machine::{
    PgBouncerEvent, PgBouncerStateMachine, TransitionContext, TransitionResult, entry_event,
};
use crate::controller::status::{StatusManager, spec_changed};
use crate::controller::termination::run_termination;
use crate::controller::validation::{fetch_version, validate_spec};
use crate::crd::{PgBouncer, PgBouncerPhase, PgBouncerVersion};
use crate::resources::common::{FIELD_MANAGER, offshoot_name};
use crate::resources::config::auth_file_path;
use crate::resources::{
    Verb, app_binding, configmap, live_sync, monitor, pdb, rbac, secret, service, statefulset,
};

/// Finalizer name for cleanup
pub const FINALIZER: &str = "pgbouncer-operator.smoketurner.com/finalizer";

/// Requeue interval once everything is in place
const STEADY_STATE_REQUEUE: Duration = Duration::from_secs(300);

/// Requeue interval while replicas are catching up
const NOT_READY_REQUEUE: Duration = Duration::from_secs(30);

fn object_key(pgbouncer: &PgBouncer) -> String {
    format!(
        "{}/{}",
        pgbouncer.namespace().unwrap_or_default(),
        pgbouncer.name_any()
    )
}

/// Main reconciliation function
#[instrument(skip(pgbouncer, ctx), fields(name = %pgbouncer.name_any(), namespace = pgbouncer.namespace().unwrap_or_default()))]
pub async fn reconcile(pgbouncer: Arc<PgBouncer>, ctx: Arc<Context>) -> Result<Action> {
    let ns = pgbouncer.namespace().unwrap_or_default();
    let name = pgbouncer.name_any();
    let start = Instant::now();

    info!("Reconciling PgBouncer");

    let result = if pgbouncer.metadata.deletion_timestamp.is_some() {
        handle_deletion(&pgbouncer, &ctx).await
    } else {
        reconcile_pgbouncer(&pgbouncer, &ctx).await
    };

    if let Some(health) = &ctx.health_state {
        match &result {
            Ok(_) => health
                .metrics
                .record_reconcile(&ns, &name, start.elapsed().as_secs_f64()),
            Err(_) => health.metrics.record_error(&ns, &name),
        }
    }

    match result {
        Ok(action) => {
            ctx.retries.reset(&object_key(&pgbouncer));
            debug!("Reconciliation completed");
            Ok(action)
        }
        Err(e) => {
            error!(error = %e, "Reconciliation failed");
            Err(e)
        }
    }
}

/// Error policy for the controller with exponential backoff
pub fn error_policy(pgbouncer: Arc<PgBouncer>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = object_key(&pgbouncer);
    let attempt = ctx.retries.record_failure(&key, error);
    let delay = BackoffConfig::default().delay_for_error(error, attempt);

    if error.is_retryable() {
        warn!(pgbouncer = %key, attempt, error = %error, "Retryable error, requeuing in {:?}", delay);
    } else {
        error!(pgbouncer = %key, attempt, error = %error, "Non-retryable error, requeuing in {:?}", delay);
    }

    Action::requeue(delay)
}

async fn reconcile_pgbouncer(pgbouncer: &PgBouncer, ctx: &Context) -> Result<Action> {
    if !has_finalizer(pgbouncer) {
        add_finalizer(pgbouncer, ctx).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    let status = StatusManager::new(pgbouncer, ctx);
    let machine = PgBouncerStateMachine::new();
    let desired = pgbouncer.replicas();
    let mut phase = pgbouncer.phase();
    let changed = spec_changed(pgbouncer);

    if let Some(event) = entry_event(phase, false, changed) {
        let result = machine.transition(phase, event, &TransitionContext::new(0, desired));
        if let TransitionResult::Success { to, description, .. } = &result {
            info!(from = %phase, to = %to, "{}", description);
            status.set_provisioning().await?;
        }
        phase = result.phase(phase);
    }

    if phase == PgBouncerPhase::Failed {
        debug!("Spec unchanged since it was rejected, waiting for an update");
        return Ok(Action::await_change());
    }

    let mut defaulted = pgbouncer.clone();
    defaulted.set_defaults();

    let version = fetch_version(&ctx.client, &defaulted).await?;
    if let Err(e) = validate_spec(&defaulted, version.as_ref()) {
        return fail_on_user_error(pgbouncer, ctx, phase, e).await;
    }
    // Checked by validate_spec
    let Some(version) = version else {
        return Err(Error::MissingObjectKey("spec.version"));
    };

    if let Err(e) = apply_resources(&defaulted, &version, ctx).await {
        if e.is_user_error() {
            return fail_on_user_error(pgbouncer, ctx, phase, e).await;
        }
        return Err(e);
    }

    if phase == PgBouncerPhase::Provisioning {
        let result = machine.transition(
            phase,
            PgBouncerEvent::ResourcesApplied,
            &TransitionContext::new(0, desired),
        );
        phase = result.phase(phase);
    }

    if phase == PgBouncerPhase::Running {
        return check_replicas(pgbouncer, ctx, &machine).await;
    }

    status.set_initializing(0, desired).await?;
    let ready = statefulset::wait_for_ready(&ctx.client, &defaulted, ctx.config.readiness_timeout)
        .await?;
    record_replicas(pgbouncer, ctx, desired, ready);

    let result = machine.transition(
        phase,
        PgBouncerEvent::AllReplicasReady,
        &TransitionContext::new(ready, desired),
    );
    match result {
        TransitionResult::Success { .. } => {
            status.set_running(ready).await?;
            ctx.normal_event(
                pgbouncer,
                "Ready",
                "Reconcile",
                format!("{} of {} replicas ready", ready, desired),
            )
            .await;
            Ok(Action::requeue(STEADY_STATE_REQUEUE))
        }
        other => {
            debug!(result = ?other, "PgBouncer not running yet");
            Ok(Action::requeue(NOT_READY_REQUEUE))
        }
    }
}

/// Write every owned object in dependency order
async fn apply_resources(
    pgbouncer: &PgBouncer,
    version: &PgBouncerVersion,
    ctx: &Context,
) -> Result<()> {
    let client = &ctx.client;
    let ns = pgbouncer.namespace().unwrap_or_default();
    let governing = ctx.config.governing_service.as_str();

    service::check_governing_collision(pgbouncer, governing)?;
    let verb = service::ensure_governing_service(client, governing, &ns).await?;
    debug!(service = governing, %verb, "Governing service");

    let verb = rbac::ensure_rbac(client, pgbouncer).await?;
    debug!(%verb, "RBAC");

    let auth = secret::ensure_default_secret(client, pgbouncer).await?;
    debug!(verb = %auth.verb, "Auth secret");
    if auth.user_secret_missing {
        ctx.warning_event(
            pgbouncer,
            "UserSecretMissing",
            "Reconcile",
            "Referenced user list secret does not exist; only the admin user can log in",
        )
        .await;
    }

    let (verb, ini) =
        configmap::ensure_config_map(client, pgbouncer, &auth_file_path(auth.has_user_list))
            .await?;
    debug!(%verb, "ConfigMap");
    if verb == Verb::Patched {
        sync_config(pgbouncer, ctx, &ini, &auth.admin_password).await?;
    }

    let verb = statefulset::ensure_statefulset(client, pgbouncer, version, governing, &auth.auth_hash)
        .await?;
    if verb != Verb::Unchanged {
        info!(%verb, "StatefulSet");
    }

    let verb = service::ensure_primary_service(client, pgbouncer).await?;
    debug!(%verb, "Primary service");
    let verb = service::ensure_stats_service(client, pgbouncer).await?;
    debug!(%verb, "Stats service");
    let verb = app_binding::ensure_app_binding(client, pgbouncer).await?;
    debug!(%verb, "AppBinding");
    let verb = pdb::ensure_pdb(client, pgbouncer).await?;
    debug!(%verb, "PodDisruptionBudget");

    match monitor::ensure_monitor(client, pgbouncer).await {
        Ok(verb) => debug!(%verb, "ServiceMonitor"),
        Err(Error::InvalidConfig(message)) => {
            ctx.warning_event(pgbouncer, "MonitorUnavailable", "Reconcile", message.clone())
                .await;
            return Err(Error::InvalidConfig(message));
        }
        Err(e) => return Err(e),
    }

    Ok(())
}

/// Push a changed pgbouncer.ini into running pods
async fn sync_config(pgbouncer: &PgBouncer, ctx: &Context, ini: &str, admin_password: &str) -> Result<()> {
    let report = live_sync::sync_live_config(
        &ctx.client,
        pgbouncer,
        ini,
        admin_password,
        ctx.config.config_sync_timeout,
    )
    .await?;

    if let Some(health) = &ctx.health_state {
        health.metrics.record_live_sync(
            &pgbouncer.namespace().unwrap_or_default(),
            &pgbouncer.name_any(),
            &report,
        );
    }

    if report.is_complete() {
        if !report.reloaded.is_empty() {
            ctx.normal_event(
                pgbouncer,
                "ConfigReloaded",
                "Reload",
                format!("Reloaded pods {}", report.reloaded.join(", ")),
            )
            .await;
        }
    } else {
        warn!(
            timed_out = ?report.timed_out,
            reload_failed = ?report.reload_failed,
            "Live config sync incomplete"
        );
        ctx.warning_event(
            pgbouncer,
            "ConfigSyncIncomplete",
            "Reload",
            format!(
                "Config not reloaded in pods: timed out {:?}, reload failed {:?}",
                report.timed_out, report.reload_failed
            ),
        )
        .await;
    }
    Ok(())
}

/// Steady state: only look at replica readiness
async fn check_replicas(
    pgbouncer: &PgBouncer,
    ctx: &Context,
    machine: &PgBouncerStateMachine,
) -> Result<Action> {
    let api: Api<StatefulSet> =
        Api::namespaced(ctx.client.clone(), &pgbouncer.namespace().unwrap_or_default());
    let desired = pgbouncer.replicas();
    let ready = api
        .get_opt(&offshoot_name(pgbouncer))
        .await?
        .as_ref()
        .map(statefulset::ready_replicas)
        .unwrap_or(0);
    record_replicas(pgbouncer, ctx, desired, ready);

    let result = machine.transition(
        PgBouncerPhase::Running,
        PgBouncerEvent::ReplicasNotReady,
        &TransitionContext::new(ready, desired),
    );
    if let TransitionResult::Success { description, .. } = result {
        warn!(ready, desired, "{}", description);
        StatusManager::new(pgbouncer, ctx)
            .set_initializing(ready, desired)
            .await?;
        return Ok(Action::requeue(NOT_READY_REQUEUE));
    }

    Ok(Action::requeue(STEADY_STATE_REQUEUE))
}

fn record_replicas(pgbouncer: &PgBouncer, ctx: &Context, desired: i32, ready: i32) {
    if let Some(health) = &ctx.health_state {
        health.metrics.set_replicas(
            &pgbouncer.namespace().unwrap_or_default(),
            &pgbouncer.name_any(),
            desired.into(),
            ready.into(),
        );
    }
}

/// Report a spec problem and park the object until it changes
async fn fail_on_user_error(
    pgbouncer: &PgBouncer,
    ctx: &Context,
    phase: PgBouncerPhase,
    e: Error,
) -> Result<Action> {
    let reason = match e {
        Error::NameCollision(_) => "NameCollision",
        _ => "ValidationFailed",
    };
    warn!(error = %e, "Spec rejected");
    if let Some(health) = &ctx.health_state {
        health.metrics.record_rejection(
            &pgbouncer.namespace().unwrap_or_default(),
            &pgbouncer.name_any(),
            reason,
        );
    }
    ctx.warning_event(pgbouncer, reason, "Reconcile", e.to_string())
        .await;

    let result = PgBouncerStateMachine::new().transition(
        phase,
        PgBouncerEvent::ValidationFailed,
        &TransitionContext::new(0, pgbouncer.replicas()),
    );
    if matches!(result, TransitionResult::Success { .. }) {
        StatusManager::new(pgbouncer, ctx)
            .set_failed(reason, &e.to_string())
            .await?;
    }
    Ok(Action::await_change())
}

/// Check if the finalizer is present
fn has_finalizer(pgbouncer: &PgBouncer) -> bool {
    pgbouncer.finalizers().iter().any(|f| f == FINALIZER)
}

async fn add_finalizer(pgbouncer: &PgBouncer, ctx: &Context) -> Result<()> {
    let api: Api<PgBouncer> =
        Api::namespaced(ctx.client.clone(), &pgbouncer.namespace().unwrap_or_default());
    let mut finalizers = pgbouncer.finalizers().to_vec();
    finalizers.push(FINALIZER.to_string());

    let patch = serde_json::json!({
        "metadata": {
            "resourceVersion": pgbouncer.resource_version(),
            "finalizers": finalizers
        }
    });
    api.patch(
        &pgbouncer.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;

    info!("Added finalizer");
    Ok(())
}

async fn remove_finalizer(pgbouncer: &PgBouncer, ctx: &Context) -> Result<()> {
    let api: Api<PgBouncer> =
        Api::namespaced(ctx.client.clone(), &pgbouncer.namespace().unwrap_or_default());
    let remaining: Vec<&String> = pgbouncer
        .finalizers()
        .iter()
        .filter(|f| *f != FINALIZER)
        .collect();

    let patch = serde_json::json!({
        "metadata": {
            "resourceVersion": pgbouncer.resource_version(),
            "finalizers": remaining
        }
    });
    api.patch(
        &pgbouncer.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;

    info!("Removed finalizer");
    Ok(())
}

/// Run the termination policy, then let the API server finish the delete
async fn handle_deletion(pgbouncer: &PgBouncer, ctx: &Context) -> Result<Action> {
    if !has_finalizer(pgbouncer) {
        return Ok(Action::await_change());
    }

    let phase = pgbouncer.phase();
    let result = PgBouncerStateMachine::new().transition(
        phase,
        PgBouncerEvent::DeletionRequested,
        &TransitionContext::new(0, pgbouncer.replicas()),
    );
    if matches!(result, TransitionResult::Success { .. }) {
        StatusManager::new(pgbouncer, ctx).set_terminating().await?;
    }

    let plan = run_termination(&ctx.client, pgbouncer).await?;
    debug!(?plan, "Termination policy applied");
    ctx.normal_event(
        pgbouncer,
        "Terminated",
        "Delete",
        format!(
            "Termination policy {} applied",
            pgbouncer.termination_policy()
        ),
    )
    .await;

    remove_finalizer(pgbouncer, ctx).await?;
    ctx.retries.reset(&object_key(pgbouncer));
    Ok(Action::await_change())
}
