pub mod app_binding;
pub mod common;
pub mod config;
pub mod configmap;
pub mod exec;
pub mod live_sync;
pub mod monitor;
pub mod pdb;
pub mod rbac;
pub mod secret;
pub mod service;
pub mod statefulset;

pub use common::{API_VERSION, FIELD_MANAGER, KIND, Verb, owner_reference, standard_labels};
