//! Unit tests for termination policies

use pgbouncer_operator::controller::{TerminationPlan, termination_plan};
use pgbouncer_operator::crd::TerminationPolicy;

use crate::common::*;

mod termination_plan_tests {
    use super::*;

    #[test]
    fn test_default_policy_is_delete() {
        let pb = PgBouncerBuilder::new("pool", "demo").build();
        assert_eq!(pb.termination_policy(), TerminationPolicy::Delete);
        assert_eq!(
            termination_plan(pb.termination_policy()),
            TerminationPlan {
                orphan_secret: true,
                orphan_config_map: false,
                delete_secret: false,
            }
        );
    }

    #[test]
    fn test_every_policy_has_a_plan() {
        let cases = [
            (TerminationPolicy::Pause, true, true, false),
            (TerminationPolicy::Delete, true, false, false),
            (TerminationPolicy::DoNotTerminate, true, false, false),
            (TerminationPolicy::WipeOut, false, false, true),
        ];
        for (policy, orphan_secret, orphan_config_map, delete_secret) in cases {
            assert_eq!(
                termination_plan(policy),
                TerminationPlan {
                    orphan_secret,
                    orphan_config_map,
                    delete_secret,
                },
                "policy {}",
                policy
            );
        }
    }

    #[test]
    fn test_secret_is_never_both_kept_and_deleted() {
        for policy in [
            TerminationPolicy::Pause,
            TerminationPolicy::Delete,
            TerminationPolicy::DoNotTerminate,
            TerminationPolicy::WipeOut,
        ] {
            let plan = termination_plan(policy);
            assert!(!(plan.orphan_secret && plan.delete_secret));
        }
    }
}
