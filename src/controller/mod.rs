pub mod context;
pub mod error;
pub mod index;
pub mod reconciler;
pub mod state_machine;
pub mod status;
pub mod termination;
pub mod validation;

pub use context::{Context, ControllerConfig, DEFAULT_GOVERNING_SERVICE};
pub use error::{BackoffConfig, Error, ErrorContext, Result, RetryTracker};
pub use index::{app_binding_mapper, secret_mapper};
pub use reconciler::{FINALIZER, error_policy, reconcile};
pub use state_machine::{PgBouncerEvent, PgBouncerStateMachine, TransitionContext, TransitionResult};
pub use status::{ConditionBuilder, StatusManager, spec_changed, spec_hash};
pub use termination::{TerminationPlan, termination_plan};
pub use validation::{MIN_REPLICAS, fetch_version, validate_spec};
