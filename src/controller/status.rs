//! Status and conditions management for PgBouncer resources
//!
//! This module provides utilities for managing Kubernetes-style conditions
//! and updating the status subresource.

use chrono::Utc;
use kube::api::{Patch, PatchParams};
use kube::{Api, ResourceExt};
use sha2::{Digest, Sha256};

use crate::controller::Context;
use crate::controller::error::Result;
use crate::crd::{Condition, PgBouncer, PgBouncerPhase, PgBouncerSpec, PgBouncerStatus};
use crate::resources::common::FIELD_MANAGER;

/// Standard condition types following Kubernetes conventions
pub mod condition_types {
    /// All replicas are ready and serving the current config
    pub const READY: &str = "Ready";
    /// Owned objects are being created or rolled out
    pub const PROGRESSING: &str = "Progressing";
    /// The spec passed validation
    pub const CONFIG_VALID: &str = "ConfigurationValid";
}

/// Condition status values
pub mod condition_status {
    pub const TRUE: &str = "True";
    pub const FALSE: &str = "False";
    pub const UNKNOWN: &str = "Unknown";
}

/// Builder for creating and updating status conditions
pub struct ConditionBuilder {
    conditions: Vec<Condition>,
    generation: Option<i64>,
}

impl ConditionBuilder {
    pub fn new(generation: Option<i64>) -> Self {
        Self {
            conditions: Vec::new(),
            generation,
        }
    }

    pub fn from_existing(existing: Vec<Condition>, generation: Option<i64>) -> Self {
        Self {
            conditions: existing,
            generation,
        }
    }

    /// Set a condition, updating if it exists or adding if it doesn't.
    ///
    /// `lastTransitionTime` only moves when the status flips.
    pub fn set_condition(mut self, type_: &str, status: &str, reason: &str, message: &str) -> Self {
        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == type_) {
            if existing.status != status {
                existing.status = status.to_string();
                existing.last_transition_time = Utc::now().to_rfc3339();
            }
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            existing.observed_generation = self.generation;
        } else {
            self.conditions.push(Condition {
                type_: type_.to_string(),
                status: status.to_string(),
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: Utc::now().to_rfc3339(),
                observed_generation: self.generation,
            });
        }
        self
    }

    pub fn ready(self, is_ready: bool, reason: &str, message: &str) -> Self {
        self.set_condition(condition_types::READY, bool_status(is_ready), reason, message)
    }

    pub fn progressing(self, is_progressing: bool, reason: &str, message: &str) -> Self {
        self.set_condition(
            condition_types::PROGRESSING,
            bool_status(is_progressing),
            reason,
            message,
        )
    }

    pub fn config_valid(self, is_valid: bool, reason: &str, message: &str) -> Self {
        self.set_condition(
            condition_types::CONFIG_VALID,
            bool_status(is_valid),
            reason,
            message,
        )
    }

    pub fn build(self) -> Vec<Condition> {
        self.conditions
    }
}

fn bool_status(value: bool) -> &'static str {
    if value {
        condition_status::TRUE
    } else {
        condition_status::FALSE
    }
}

/// Status manager for PgBouncer resources
pub struct StatusManager<'a> {
    pgbouncer: &'a PgBouncer,
    ctx: &'a Context,
}

impl<'a> StatusManager<'a> {
    pub fn new(pgbouncer: &'a PgBouncer, ctx: &'a Context) -> Self {
        Self { pgbouncer, ctx }
    }

    fn conditions(&self) -> ConditionBuilder {
        let existing = self
            .pgbouncer
            .status
            .as_ref()
            .map(|s| s.conditions.clone())
            .unwrap_or_default();
        ConditionBuilder::from_existing(existing, self.pgbouncer.metadata.generation)
    }

    fn existing(&self) -> PgBouncerStatus {
        self.pgbouncer.status.clone().unwrap_or_default()
    }

    /// Write the status subresource
    pub async fn update(&self, status: PgBouncerStatus) -> Result<()> {
        let api: Api<PgBouncer> = Api::namespaced(
            self.ctx.client.clone(),
            &self.pgbouncer.namespace().unwrap_or_default(),
        );

        let patch = serde_json::json!({
            "status": status
        });

        api.patch_status(
            &self.pgbouncer.name_any(),
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;

        Ok(())
    }

    pub async fn set_provisioning(&self) -> Result<()> {
        let conditions = self
            .conditions()
            .ready(false, "Provisioning", "Owned objects are being applied")
            .progressing(true, "Provisioning", "Owned objects are being applied")
            .build();

        self.update(PgBouncerStatus {
            phase: PgBouncerPhase::Provisioning,
            reason: None,
            conditions,
            ..self.existing()
        })
        .await
    }

    pub async fn set_initializing(&self, ready_replicas: i32, desired_replicas: i32) -> Result<()> {
        let message = format!("{}/{} replicas ready", ready_replicas, desired_replicas);
        let conditions = self
            .conditions()
            .ready(false, "WaitingForReplicas", &message)
            .progressing(true, "RollingOut", &message)
            .config_valid(true, "Validated", "Spec is valid")
            .build();

        self.update(PgBouncerStatus {
            phase: PgBouncerPhase::Initializing,
            reason: None,
            conditions,
            ..self.existing()
        })
        .await
    }

    /// Mark the PgBouncer running and record what was reconciled
    pub async fn set_running(&self, ready_replicas: i32) -> Result<()> {
        let message = format!("{} replicas ready", ready_replicas);
        let conditions = self
            .conditions()
            .ready(true, "AllReplicasReady", &message)
            .progressing(false, "Stable", "PgBouncer is stable")
            .config_valid(true, "Validated", "Spec is valid")
            .build();

        self.update(PgBouncerStatus {
            phase: PgBouncerPhase::Running,
            observed_generation: self.pgbouncer.metadata.generation,
            observed_spec_hash: Some(spec_hash(&self.pgbouncer.spec)),
            reason: None,
            conditions,
        })
        .await
    }

    pub async fn set_failed(&self, reason: &str, message: &str) -> Result<()> {
        let conditions = self
            .conditions()
            .ready(false, reason, message)
            .progressing(false, "Failed", message)
            .config_valid(false, reason, message)
            .build();

        // Recording the rejected generation keeps the object parked until it changes
        self.update(PgBouncerStatus {
            phase: PgBouncerPhase::Failed,
            observed_generation: self.pgbouncer.metadata.generation,
            observed_spec_hash: Some(spec_hash(&self.pgbouncer.spec)),
            reason: Some(message.to_string()),
            conditions,
        })
        .await
    }

    pub async fn set_terminating(&self) -> Result<()> {
        let conditions = self
            .conditions()
            .ready(false, "Terminating", "PgBouncer is being deleted")
            .progressing(true, "Terminating", "Running termination policy")
            .build();

        self.update(PgBouncerStatus {
            phase: PgBouncerPhase::Terminating,
            reason: None,
            conditions,
            ..self.existing()
        })
        .await
    }
}

/// Stable hex digest of a spec
pub fn spec_hash(spec: &PgBouncerSpec) -> String {
    // Serialization of plain structs and BTreeMaps cannot fail
    let bytes = serde_json::to_vec(spec).unwrap_or_default();
    Sha256::digest(&bytes)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Whether the spec differs from the one last reconciled to Running or rejected
pub fn spec_changed(pgbouncer: &PgBouncer) -> bool {
    let Some(status) = pgbouncer.status.as_ref() else {
        return true;
    };

    let generation_changed = match (pgbouncer.metadata.generation, status.observed_generation) {
        (Some(current), Some(observed)) => current != observed,
        _ => true,
    };
    let hash_changed = status
        .observed_spec_hash
        .as_deref()
        .is_none_or(|observed| observed != spec_hash(&pgbouncer.spec));

    generation_changed || hash_changed
}
