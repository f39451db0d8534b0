//! Unit tests for admission defaulting and validation policies

use std::collections::BTreeMap;

use pgbouncer_operator::crd::{PodTemplate, PodTemplateSpec, TerminationPolicy};
use pgbouncer_operator::webhooks::{
    AdmissionRequest, AdmissionReview, Operation, ValidationContext, default_patch, mutate,
    validate_all,
};
use kube::core::DynamicObject;

use crate::common::*;

fn admission_request(operation: &str, object: serde_json::Value) -> AdmissionRequest<DynamicObject> {
    let review: AdmissionReview<DynamicObject> = serde_json::from_value(serde_json::json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "request": {
            "uid": "4b2c9a1e",
            "kind": {"group": "pgbouncer-operator.smoketurner.com", "version": "v1alpha2", "kind": "PgBouncer"},
            "resource": {"group": "pgbouncer-operator.smoketurner.com", "version": "v1alpha2", "resource": "pgbouncers"},
            "operation": operation,
            "name": "pool",
            "namespace": "demo",
            "userInfo": {},
            "object": object,
            "dryRun": false
        }
    }))
    .unwrap();
    review.try_into().unwrap()
}

fn with_node_selector(pb: &mut pgbouncer_operator::PgBouncer, zone: &str) {
    pb.spec.pod_template = Some(PodTemplate {
        spec: Some(PodTemplateSpec {
            node_selector: BTreeMap::from([("zone".to_string(), zone.to_string())]),
            ..Default::default()
        }),
        ..Default::default()
    });
}

mod mutation_tests {
    use super::*;

    fn patch_paths(patch: &json_patch::Patch) -> Vec<String> {
        serde_json::to_value(patch)
            .unwrap()
            .as_array()
            .unwrap()
            .iter()
            .map(|op| op["path"].as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_defaults_fill_missing_fields() {
        let pb = PgBouncerBuilder::new("pool", "demo")
            .without_replicas()
            .with_database("app", "app", "pg")
            .build();
        let patch = default_patch(&pb, Some("demo")).unwrap();
        let paths = patch_paths(&patch);

        assert!(paths.iter().any(|p| p == "/spec/replicas"));
        assert!(paths.iter().any(|p| p == "/spec/terminationPolicy"));
        assert!(paths.iter().any(|p| p.starts_with("/spec/connectionPool")));
        assert!(
            paths
                .iter()
                .any(|p| p.starts_with("/spec/databases/0/appBindingRef"))
        );
    }

    #[test]
    fn test_set_fields_are_kept() {
        let pb = PgBouncerBuilder::new("pool", "demo")
            .with_replicas(3)
            .with_termination_policy(TerminationPolicy::WipeOut)
            .build();
        let paths = patch_paths(&default_patch(&pb, Some("demo")).unwrap());
        assert!(!paths.iter().any(|p| p == "/spec/replicas"));
        assert!(!paths.iter().any(|p| p == "/spec/terminationPolicy"));
    }

    #[test]
    fn test_mutate_skips_delete() {
        let object = serde_json::json!({
            "apiVersion": "pgbouncer-operator.smoketurner.com/v1alpha2",
            "kind": "PgBouncer",
            "metadata": {"name": "pool", "namespace": "demo"},
            "spec": {"version": "1.17.0"}
        });
        let response = mutate(&admission_request("DELETE", object));
        assert!(response.allowed);
        assert!(response.patch.is_none());
    }
}

mod policy_tests {
    use super::*;

    #[test]
    fn test_valid_create_is_allowed() {
        let pb = PgBouncerBuilder::new("pool", "demo").build();
        let version = test_version(TEST_VERSION, false);
        let ctx = ValidationContext::new(Operation::Create, &pb).with_version(Some(&version));
        assert!(validate_all(&ctx).allowed);
    }

    #[test]
    fn test_unknown_version_is_denied() {
        let pb = PgBouncerBuilder::new("pool", "demo").with_version("0.0.1").build();
        let ctx = ValidationContext::new(Operation::Create, &pb);
        let result = validate_all(&ctx);
        assert!(!result.allowed);
        assert_eq!(result.reason.as_deref(), Some("InvalidSpec"));
    }

    #[test]
    fn test_missing_user_secret_is_denied() {
        let pb = PgBouncerBuilder::new("pool", "demo")
            .with_user_list_secret("users")
            .build();
        let version = test_version(TEST_VERSION, false);
        let ctx = ValidationContext::new(Operation::Create, &pb)
            .with_version(Some(&version))
            .with_user_secret(Some(false));
        let result = validate_all(&ctx);
        assert_eq!(result.reason.as_deref(), Some("UserSecretNotFound"));
    }

    #[test]
    fn test_missing_user_secret_is_fine_without_auth_file() {
        let pb = PgBouncerBuilder::new("pool", "demo")
            .with_user_list_secret("users")
            .with_auth_type("any")
            .build();
        let version = test_version(TEST_VERSION, false);
        let ctx = ValidationContext::new(Operation::Create, &pb)
            .with_version(Some(&version))
            .with_user_secret(Some(false));
        assert!(validate_all(&ctx).allowed);
    }

    #[test]
    fn test_node_selector_change_is_denied() {
        let mut old = PgBouncerBuilder::new("pool", "demo").build();
        with_node_selector(&mut old, "a");
        let mut new = old.clone();
        with_node_selector(&mut new, "b");
        new.spec.replicas = Some(3);

        let version = test_version(TEST_VERSION, false);
        let ctx = ValidationContext::new(Operation::Update, &new)
            .with_old(Some(&old))
            .with_version(Some(&version));
        let result = validate_all(&ctx);
        assert_eq!(result.reason.as_deref(), Some("ImmutableFieldChanged"));
        assert!(
            result
                .message
                .unwrap()
                .contains("spec.podTemplate.spec.nodeSelector")
        );
    }

    #[test]
    fn test_mutable_update_is_allowed() {
        let old = PgBouncerBuilder::new("pool", "demo").build();
        let new = PgBouncerBuilder::new("pool", "demo").with_replicas(5).build();
        let version = test_version(TEST_VERSION, false);
        let ctx = ValidationContext::new(Operation::Update, &new)
            .with_old(Some(&old))
            .with_version(Some(&version));
        assert!(validate_all(&ctx).allowed);
    }

    #[test]
    fn test_do_not_terminate_blocks_delete() {
        let pb = PgBouncerBuilder::new("pool", "demo")
            .with_termination_policy(TerminationPolicy::DoNotTerminate)
            .build();
        let result = validate_all(&ValidationContext::new(Operation::Delete, &pb));
        assert!(!result.allowed);
        assert_eq!(result.reason.as_deref(), Some("DeletionBlocked"));

        let pb = PgBouncerBuilder::new("pool", "demo")
            .with_termination_policy(TerminationPolicy::Pause)
            .build();
        assert!(validate_all(&ValidationContext::new(Operation::Delete, &pb)).allowed);
    }

    #[test]
    fn test_delete_skips_spec_checks() {
        // An invalid spec must still be deletable
        let pb = PgBouncerBuilder::new("pool", "demo")
            .with_version("gone")
            .with_replicas(0)
            .build();
        assert!(validate_all(&ValidationContext::new(Operation::Delete, &pb)).allowed);
    }
}
