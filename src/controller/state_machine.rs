//! Finite state machine for the PgBouncer lifecycle
//!
//! ```text
//!  "" ──Observed──▶ Provisioning ──ResourcesApplied──▶ Initializing ──AllReplicasReady──▶ Running
//!                        ▲                                   │  ▲                            │
//!                        └────────────SpecChanged────────────┘  └──────ReplicasNotReady──────┤
//!                        ▲                                                                   │
//!                        └─────────────────────────────SpecChanged───────────────────────────┘
//! ```
//!
//! Any live phase moves to `Failed` on a validation error and to
//! `Terminating` once deletion is requested. `Failed` is left only through
//! `SpecChanged`.

use std::fmt;

use crate::crd::PgBouncerPhase;

/// Events that trigger phase transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PgBouncerEvent {
    /// The controller picked the object up, or retries it after a failure
    Observed,
    /// Generation or spec hash differs from what was last reconciled
    SpecChanged,
    /// Every owned object was written
    ResourcesApplied,
    /// All desired replicas are ready
    AllReplicasReady,
    /// Some replicas stopped being ready
    ReplicasNotReady,
    /// The spec failed validation
    ValidationFailed,
    /// Deletion timestamp has been set
    DeletionRequested,
}

impl fmt::Display for PgBouncerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PgBouncerEvent::Observed => write!(f, "Observed"),
            PgBouncerEvent::SpecChanged => write!(f, "SpecChanged"),
            PgBouncerEvent::ResourcesApplied => write!(f, "ResourcesApplied"),
            PgBouncerEvent::AllReplicasReady => write!(f, "AllReplicasReady"),
            PgBouncerEvent::ReplicasNotReady => write!(f, "ReplicasNotReady"),
            PgBouncerEvent::ValidationFailed => write!(f, "ValidationFailed"),
            PgBouncerEvent::DeletionRequested => write!(f, "DeletionRequested"),
        }
    }
}

/// Replica counts consulted by guards
#[derive(Debug, Clone, Copy)]
pub struct TransitionContext {
    pub ready_replicas: i32,
    pub desired_replicas: i32,
}

impl TransitionContext {
    pub fn new(ready_replicas: i32, desired_replicas: i32) -> Self {
        Self {
            ready_replicas,
            desired_replicas,
        }
    }

    pub fn all_replicas_ready(&self) -> bool {
        self.ready_replicas >= self.desired_replicas
    }
}

#[derive(Debug)]
struct Transition {
    from: PgBouncerPhase,
    to: PgBouncerPhase,
    event: PgBouncerEvent,
    description: &'static str,
}

impl Transition {
    const fn new(
        from: PgBouncerPhase,
        to: PgBouncerPhase,
        event: PgBouncerEvent,
        description: &'static str,
    ) -> Self {
        Self {
            from,
            to,
            event,
            description,
        }
    }
}

/// Result of attempting a state transition
#[derive(Debug, PartialEq, Eq)]
pub enum TransitionResult {
    Success {
        from: PgBouncerPhase,
        to: PgBouncerPhase,
        event: PgBouncerEvent,
        description: &'static str,
    },
    InvalidTransition {
        current: PgBouncerPhase,
        event: PgBouncerEvent,
    },
    GuardFailed {
        from: PgBouncerPhase,
        to: PgBouncerPhase,
        event: PgBouncerEvent,
        reason: String,
    },
}

impl TransitionResult {
    /// Phase after the attempt; unchanged unless the transition succeeded
    pub fn phase(&self, current: PgBouncerPhase) -> PgBouncerPhase {
        match self {
            TransitionResult::Success { to, .. } => *to,
            _ => current,
        }
    }
}

pub struct PgBouncerStateMachine {
    transitions: Vec<Transition>,
}

impl Default for PgBouncerStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl PgBouncerStateMachine {
    pub fn new() -> Self {
        use PgBouncerEvent as E;
        use PgBouncerPhase as P;

        let mut transitions = vec![
            Transition::new(P::Pending, P::Provisioning, E::Observed, "Started provisioning"),
            Transition::new(P::Failed, P::Provisioning, E::SpecChanged, "Spec fixed, provisioning"),
            Transition::new(
                P::Running,
                P::Provisioning,
                E::SpecChanged,
                "Spec changed, reprovisioning",
            ),
            Transition::new(
                P::Initializing,
                P::Provisioning,
                E::SpecChanged,
                "Spec changed while initializing",
            ),
            Transition::new(
                P::Provisioning,
                P::Initializing,
                E::ResourcesApplied,
                "Objects applied, waiting for pods",
            ),
            Transition::new(
                P::Initializing,
                P::Running,
                E::AllReplicasReady,
                "All replicas ready",
            ),
            Transition::new(
                P::Running,
                P::Initializing,
                E::ReplicasNotReady,
                "Replicas no longer ready",
            ),
        ];

        for from in [P::Pending, P::Provisioning, P::Initializing, P::Running] {
            transitions.push(Transition::new(
                from,
                P::Failed,
                E::ValidationFailed,
                "Spec failed validation",
            ));
        }
        for from in [
            P::Pending,
            P::Provisioning,
            P::Initializing,
            P::Running,
            P::Failed,
        ] {
            transitions.push(Transition::new(
                from,
                P::Terminating,
                E::DeletionRequested,
                "Deletion requested",
            ));
        }

        Self { transitions }
    }

    pub fn transition(
        &self,
        current: PgBouncerPhase,
        event: PgBouncerEvent,
        ctx: &TransitionContext,
    ) -> TransitionResult {
        let Some(t) = self
            .transitions
            .iter()
            .find(|t| t.from == current && t.event == event)
        else {
            return TransitionResult::InvalidTransition { current, event };
        };

        match self.check_guard(t, ctx) {
            Some(reason) => TransitionResult::GuardFailed {
                from: t.from,
                to: t.to,
                event,
                reason,
            },
            None => TransitionResult::Success {
                from: t.from,
                to: t.to,
                event,
                description: t.description,
            },
        }
    }

    pub fn can_transition(&self, from: PgBouncerPhase, event: PgBouncerEvent) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == from && t.event == event)
    }

    pub fn valid_events(&self, state: PgBouncerPhase) -> Vec<PgBouncerEvent> {
        self.transitions
            .iter()
            .filter(|t| t.from == state)
            .map(|t| t.event)
            .collect()
    }

    fn check_guard(&self, transition: &Transition, ctx: &TransitionContext) -> Option<String> {
        match transition.event {
            PgBouncerEvent::AllReplicasReady if !ctx.all_replicas_ready() => Some(format!(
                "Not all replicas ready: {}/{}",
                ctx.ready_replicas, ctx.desired_replicas
            )),
            PgBouncerEvent::ReplicasNotReady if ctx.all_replicas_ready() => Some(format!(
                "All replicas ready: {}/{}",
                ctx.ready_replicas, ctx.desired_replicas
            )),
            _ => None,
        }
    }
}

/// The event that starts a reconcile pass
pub fn entry_event(
    current: PgBouncerPhase,
    has_deletion_timestamp: bool,
    spec_changed: bool,
) -> Option<PgBouncerEvent> {
    if has_deletion_timestamp {
        return Some(PgBouncerEvent::DeletionRequested);
    }
    match current {
        PgBouncerPhase::Pending => Some(PgBouncerEvent::Observed),
        PgBouncerPhase::Running | PgBouncerPhase::Initializing | PgBouncerPhase::Failed
            if spec_changed =>
        {
            Some(PgBouncerEvent::SpecChanged)
        }
        _ => None,
    }
}
