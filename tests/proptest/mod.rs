// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Property-based tests for PgBouncer rendering, defaulting and validation
//!
//! These tests use proptest to generate random configurations and verify that:
//! 1. Rendering pgbouncer.ini is deterministic and never panics
//! 2. Defaulting is idempotent (a defaulted object needs no further patch)
//! 3. The state machine never panics on any event sequence
//! 4. Generated objects track the requested replica count

use std::collections::HashMap;

use proptest::prelude::*;

use pgbouncer_operator::PgBouncer;
use pgbouncer_operator::controller::state_machine::{
    PgBouncerEvent, PgBouncerStateMachine, TransitionContext,
};
use pgbouncer_operator::controller::validation::validate_spec;
use pgbouncer_operator::crd::{
    AppBindingReference, ConnectionPoolSpec, DatabaseSpec, ImageSpec, PgBouncerPhase,
    PgBouncerSpec, PgBouncerVersion, PgBouncerVersionSpec, PoolMode, TerminationPolicy,
};
use pgbouncer_operator::resources::config::{Upstream, auth_file_path, render_pgbouncer_ini};
use pgbouncer_operator::resources::{pdb, statefulset};
use pgbouncer_operator::webhooks::default_patch;

const VERSION: &str = "1.17.0";

fn catalog_entry() -> PgBouncerVersion {
    PgBouncerVersion::new(
        VERSION,
        PgBouncerVersionSpec {
            version: VERSION.to_string(),
            server: ImageSpec {
                image: format!("pgbouncer:{}", VERSION),
            },
            exporter: ImageSpec {
                image: "pgbouncer-exporter:v0.1.1".to_string(),
            },
            deprecated: false,
        },
    )
}

fn pgbouncer(spec: PgBouncerSpec) -> PgBouncer {
    let mut pb = PgBouncer::new("pool", spec);
    pb.metadata.namespace = Some("demo".to_string());
    pb.metadata.uid = Some("pool-uid".to_string());
    pb
}

// =============================================================================
// Strategy generators
// =============================================================================

fn pool_mode() -> impl Strategy<Value = Option<PoolMode>> {
    prop_oneof![
        Just(None),
        Just(Some(PoolMode::Session)),
        Just(Some(PoolMode::Transaction)),
        Just(Some(PoolMode::Statement)),
    ]
}

fn termination_policy() -> impl Strategy<Value = Option<TerminationPolicy>> {
    prop_oneof![
        Just(None),
        Just(Some(TerminationPolicy::DoNotTerminate)),
        Just(Some(TerminationPolicy::Pause)),
        Just(Some(TerminationPolicy::Delete)),
        Just(Some(TerminationPolicy::WipeOut)),
    ]
}

fn optional_size() -> impl Strategy<Value = Option<i64>> {
    prop_oneof![Just(None), (0..=1000i64).prop_map(Some)]
}

fn connection_pool() -> impl Strategy<Value = Option<ConnectionPoolSpec>> {
    prop::option::of(
        (
            prop::option::of(1024..=65535i32),
            pool_mode(),
            prop_oneof![
                Just(None),
                Just(Some("md5".to_string())),
                Just(Some("scram-sha-256".to_string())),
                Just(Some("any".to_string())),
            ],
            optional_size(),
            optional_size(),
            prop::collection::vec("[a-z_]{3,12}", 0..3),
        )
            .prop_map(
                |(port, pool_mode, auth_type, max_client, default_pool, ignored)| {
                    ConnectionPoolSpec {
                        port,
                        pool_mode,
                        auth_type,
                        max_client_connections: max_client,
                        default_pool_size: default_pool,
                        ignore_startup_parameters: ignored,
                        ..Default::default()
                    }
                },
            ),
    )
}

/// Databases with unique aliases, each pointing at one of a few bindings
fn databases() -> impl Strategy<Value = Vec<DatabaseSpec>> {
    prop::collection::btree_map("db_[a-z]{1,6}", ("[a-z]{1,8}", 0..3usize), 0..5).prop_map(|map| {
        map.into_iter()
            .map(|(alias, (database_name, binding))| DatabaseSpec {
                alias,
                database_name,
                app_binding_ref: AppBindingReference {
                    name: format!("binding-{}", binding),
                    namespace: None,
                },
                ..Default::default()
            })
            .collect()
    })
}

fn valid_spec() -> impl Strategy<Value = PgBouncerSpec> {
    (
        prop::option::of(1..=20i32),
        connection_pool(),
        databases(),
        termination_policy(),
    )
        .prop_map(|(replicas, connection_pool, databases, termination_policy)| {
            PgBouncerSpec {
                version: VERSION.to_string(),
                replicas,
                connection_pool,
                databases,
                termination_policy,
                ..Default::default()
            }
        })
}

fn phase() -> impl Strategy<Value = PgBouncerPhase> {
    prop_oneof![
        Just(PgBouncerPhase::Pending),
        Just(PgBouncerPhase::Provisioning),
        Just(PgBouncerPhase::Initializing),
        Just(PgBouncerPhase::Running),
        Just(PgBouncerPhase::Failed),
        Just(PgBouncerPhase::Terminating),
    ]
}

fn event() -> impl Strategy<Value = PgBouncerEvent> {
    prop_oneof![
        Just(PgBouncerEvent::Observed),
        Just(PgBouncerEvent::SpecChanged),
        Just(PgBouncerEvent::ResourcesApplied),
        Just(PgBouncerEvent::AllReplicasReady),
        Just(PgBouncerEvent::ReplicasNotReady),
        Just(PgBouncerEvent::ValidationFailed),
        Just(PgBouncerEvent::DeletionRequested),
    ]
}

fn upstreams() -> HashMap<(String, String), Upstream> {
    (0..2)
        .map(|i| {
            (
                ("demo".to_string(), format!("binding-{}", i)),
                Upstream::Service {
                    host: format!("pg-{}.demo.svc", i),
                    port: 5432,
                },
            )
        })
        .collect()
}

fn render(pb: &PgBouncer) -> String {
    let table = upstreams();
    render_pgbouncer_ini(
        pb,
        |ns, name| table.get(&(ns.to_string(), name.to_string())).cloned(),
        &auth_file_path(false),
    )
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_render_is_deterministic(spec in valid_spec()) {
        let pb = pgbouncer(spec);
        prop_assert_eq!(render(&pb), render(&pb));
    }

    #[test]
    fn prop_render_lists_only_resolvable_databases(spec in valid_spec()) {
        let pb = pgbouncer(spec);
        let ini = render(&pb);
        for db in &pb.spec.databases {
            let line = format!("\n{} = ", db.alias);
            let resolvable = db.app_binding_ref.name != "binding-2";
            prop_assert_eq!(ini.contains(&line), resolvable, "alias {}", db.alias);
        }
    }

    #[test]
    fn prop_render_always_ignores_extra_float_digits(spec in valid_spec()) {
        let ini = render(&pgbouncer(spec));
        prop_assert!(ini.contains("ignore_startup_parameters = extra_float_digits"));
        prop_assert_eq!(ini.matches("extra_float_digits").count(), 1);
    }

    #[test]
    fn prop_defaulting_is_idempotent(spec in valid_spec()) {
        let mut pb = pgbouncer(spec);
        pb.set_defaults();
        let patch = default_patch(&pb, Some("demo")).unwrap();
        prop_assert!(patch.0.is_empty(), "unexpected patch {:?}", patch);
    }

    #[test]
    fn prop_defaulted_spec_passes_validation(spec in valid_spec()) {
        let mut pb = pgbouncer(spec);
        pb.set_defaults();
        prop_assert!(validate_spec(&pb, Some(&catalog_entry())).is_ok());
    }

    #[test]
    fn prop_validation_deterministic(spec in valid_spec()) {
        let pb = pgbouncer(spec);
        let version = catalog_entry();
        let first = validate_spec(&pb, Some(&version)).is_ok();
        let second = validate_spec(&pb, Some(&version)).is_ok();
        prop_assert_eq!(first, second);
    }

    #[test]
    fn prop_state_machine_no_panic(phase in phase(), event in event(), ready in 0..5i32, desired in 1..5i32) {
        let sm = PgBouncerStateMachine::new();
        let result = sm.transition(phase, event, &TransitionContext::new(ready, desired));
        let next = result.phase(phase);
        if !sm.can_transition(phase, event) {
            prop_assert_eq!(next, phase);
        }
    }

    #[test]
    fn prop_statefulset_replicas_match(replicas in 1..=50i32) {
        let pb = pgbouncer(PgBouncerSpec {
            version: VERSION.to_string(),
            replicas: Some(replicas),
            ..Default::default()
        });
        let sts = statefulset::generate_statefulset(&pb, &catalog_entry(), "pgbouncer", "hash");
        prop_assert_eq!(sts.spec.unwrap().replicas, Some(replicas));
    }

    #[test]
    fn prop_pdb_only_above_one_replica(replicas in 1..=20i32) {
        let pb = pgbouncer(PgBouncerSpec {
            version: VERSION.to_string(),
            replicas: Some(replicas),
            ..Default::default()
        });
        prop_assert_eq!(pdb::generate_pdb(&pb).is_some(), replicas > 1);
    }
}
