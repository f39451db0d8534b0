mod app_binding;
mod pgbouncer;
mod pgbouncer_version;

pub use app_binding::*;
pub use pgbouncer::*;
pub use pgbouncer_version::*;
