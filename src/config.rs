//! Command line and environment configuration

use std::time::Duration;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

use crate::controller::{ControllerConfig, DEFAULT_GOVERNING_SERVICE};
use crate::health::HEALTH_PORT;
use crate::webhooks::{WEBHOOK_CERT_PATH, WEBHOOK_KEY_PATH, WEBHOOK_PORT};

#[derive(Parser, Debug)]
#[command(name = "pgbouncer-operator", version, about = "Kubernetes operator for PgBouncer")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the controller, webhooks and health server
    Run(OperatorConfig),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Args, Clone, Debug)]
pub struct OperatorConfig {
    /// Only watch this namespace; all namespaces when unset
    #[arg(long, env = "WATCH_NAMESPACE")]
    pub namespace: Option<String>,

    #[arg(long, env = "ENABLE_WEBHOOKS", default_value_t = true, action = ArgAction::Set)]
    pub enable_webhooks: bool,

    #[arg(long, env = "WEBHOOK_PORT", default_value_t = WEBHOOK_PORT)]
    pub webhook_port: u16,

    /// PEM certificate for the webhook server
    #[arg(long, env = "WEBHOOK_CERT", default_value = WEBHOOK_CERT_PATH)]
    pub webhook_cert: String,

    /// PEM private key for the webhook server
    #[arg(long, env = "WEBHOOK_KEY", default_value = WEBHOOK_KEY_PATH)]
    pub webhook_key: String,

    #[arg(long, env = "ENABLE_LEADER_ELECTION", default_value_t = true, action = ArgAction::Set)]
    pub enable_leader_election: bool,

    #[arg(long, env = "LEASE_NAME", default_value = "pgbouncer-operator-leader")]
    pub lease_name: String,

    /// Headless Service shared by every PgBouncer StatefulSet in a namespace
    #[arg(long, env = "GOVERNING_SERVICE", default_value = DEFAULT_GOVERNING_SERVICE)]
    pub governing_service: String,

    /// Maximum number of concurrent reconciles
    #[arg(long, env = "WORKERS", default_value_t = 4)]
    pub workers: u16,

    /// Seconds to wait for pods to see a changed pgbouncer.ini
    #[arg(long, env = "CONFIG_SYNC_TIMEOUT", default_value_t = 120)]
    pub config_sync_timeout: u64,

    /// Seconds to wait for the StatefulSet to become ready
    #[arg(long, env = "READINESS_TIMEOUT", default_value_t = 300)]
    pub readiness_timeout: u64,

    #[arg(long, env = "HEALTH_PORT", default_value_t = HEALTH_PORT)]
    pub health_port: u16,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl OperatorConfig {
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            governing_service: self.governing_service.clone(),
            config_sync_timeout: Duration::from_secs(self.config_sync_timeout),
            readiness_timeout: Duration::from_secs(self.readiness_timeout),
        }
    }
}
