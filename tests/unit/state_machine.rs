//! Additional unit tests for phase transitions

use pgbouncer_operator::controller::state_machine::{
    PgBouncerEvent, PgBouncerStateMachine, TransitionContext, TransitionResult, entry_event,
};
use pgbouncer_operator::crd::PgBouncerPhase;

mod transition_context_tests {
    use super::*;

    #[test]
    fn test_all_replicas_ready() {
        assert!(TransitionContext::new(3, 3).all_replicas_ready());
        assert!(TransitionContext::new(4, 3).all_replicas_ready());
        assert!(!TransitionContext::new(2, 3).all_replicas_ready());
    }
}

mod lifecycle_tests {
    use super::*;

    fn step(
        sm: &PgBouncerStateMachine,
        phase: PgBouncerPhase,
        event: PgBouncerEvent,
        ctx: TransitionContext,
    ) -> PgBouncerPhase {
        sm.transition(phase, event, &ctx).phase(phase)
    }

    #[test]
    fn test_happy_path_reaches_running() {
        let sm = PgBouncerStateMachine::new();
        let ready = TransitionContext::new(2, 2);

        let phase = step(&sm, PgBouncerPhase::Pending, PgBouncerEvent::Observed, ready);
        assert_eq!(phase, PgBouncerPhase::Provisioning);
        let phase = step(&sm, phase, PgBouncerEvent::ResourcesApplied, ready);
        assert_eq!(phase, PgBouncerPhase::Initializing);
        let phase = step(&sm, phase, PgBouncerEvent::AllReplicasReady, ready);
        assert_eq!(phase, PgBouncerPhase::Running);
    }

    #[test]
    fn test_spec_change_reprovisions() {
        let sm = PgBouncerStateMachine::new();
        let ctx = TransitionContext::new(1, 1);
        assert_eq!(
            step(&sm, PgBouncerPhase::Running, PgBouncerEvent::SpecChanged, ctx),
            PgBouncerPhase::Provisioning
        );
        assert_eq!(
            step(&sm, PgBouncerPhase::Failed, PgBouncerEvent::SpecChanged, ctx),
            PgBouncerPhase::Provisioning
        );
    }

    #[test]
    fn test_lost_replica_returns_to_initializing() {
        let sm = PgBouncerStateMachine::new();
        assert_eq!(
            step(
                &sm,
                PgBouncerPhase::Running,
                PgBouncerEvent::ReplicasNotReady,
                TransitionContext::new(1, 3)
            ),
            PgBouncerPhase::Initializing
        );
    }

    #[test]
    fn test_guard_blocks_premature_running() {
        let sm = PgBouncerStateMachine::new();
        let result = sm.transition(
            PgBouncerPhase::Initializing,
            PgBouncerEvent::AllReplicasReady,
            &TransitionContext::new(1, 3),
        );
        assert!(matches!(result, TransitionResult::GuardFailed { .. }));
        assert_eq!(
            result.phase(PgBouncerPhase::Initializing),
            PgBouncerPhase::Initializing
        );
    }

    #[test]
    fn test_validation_failure_from_active_phases() {
        let sm = PgBouncerStateMachine::new();
        for phase in [
            PgBouncerPhase::Pending,
            PgBouncerPhase::Provisioning,
            PgBouncerPhase::Initializing,
            PgBouncerPhase::Running,
        ] {
            assert!(sm.can_transition(phase, PgBouncerEvent::ValidationFailed));
        }
        assert!(!sm.can_transition(PgBouncerPhase::Terminating, PgBouncerEvent::ValidationFailed));
    }

    #[test]
    fn test_terminating_is_final() {
        let sm = PgBouncerStateMachine::new();
        assert!(sm.valid_events(PgBouncerPhase::Terminating).is_empty());

        let result = sm.transition(
            PgBouncerPhase::Terminating,
            PgBouncerEvent::Observed,
            &TransitionContext::new(0, 1),
        );
        assert_eq!(
            result,
            TransitionResult::InvalidTransition {
                current: PgBouncerPhase::Terminating,
                event: PgBouncerEvent::Observed,
            }
        );
    }

    #[test]
    fn test_deletion_from_every_live_phase() {
        let sm = PgBouncerStateMachine::new();
        for phase in [
            PgBouncerPhase::Pending,
            PgBouncerPhase::Provisioning,
            PgBouncerPhase::Initializing,
            PgBouncerPhase::Running,
            PgBouncerPhase::Failed,
        ] {
            assert_eq!(
                step(&sm, phase, PgBouncerEvent::DeletionRequested, TransitionContext::new(0, 1)),
                PgBouncerPhase::Terminating
            );
        }
    }
}

mod entry_event_tests {
    use super::*;

    #[test]
    fn test_deletion_wins() {
        assert_eq!(
            entry_event(PgBouncerPhase::Running, true, true),
            Some(PgBouncerEvent::DeletionRequested)
        );
    }

    #[test]
    fn test_pending_is_observed() {
        assert_eq!(
            entry_event(PgBouncerPhase::Pending, false, false),
            Some(PgBouncerEvent::Observed)
        );
    }

    #[test]
    fn test_failed_waits_for_spec_change() {
        assert_eq!(entry_event(PgBouncerPhase::Failed, false, false), None);
        assert_eq!(
            entry_event(PgBouncerPhase::Failed, false, true),
            Some(PgBouncerEvent::SpecChanged)
        );
    }

    #[test]
    fn test_failed_is_not_retried_without_change() {
        let sm = PgBouncerStateMachine::new();
        assert!(!sm.can_transition(PgBouncerPhase::Failed, PgBouncerEvent::Observed));
        assert!(sm.can_transition(PgBouncerPhase::Failed, PgBouncerEvent::SpecChanged));
    }

    #[test]
    fn test_running_without_change_has_no_entry_event() {
        assert_eq!(entry_event(PgBouncerPhase::Running, false, false), None);
        assert_eq!(
            entry_event(PgBouncerPhase::Running, false, true),
            Some(PgBouncerEvent::SpecChanged)
        );
    }
}
