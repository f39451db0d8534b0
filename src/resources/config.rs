//! pgbouncer.ini rendering
//!
//! Rendering is pure: AppBindings are resolved by the caller and handed in
//! through a lookup closure, so the same inputs always produce the same text.

use kube::ResourceExt;
use tracing::warn;

use crate::crd::{AppBinding, PgBouncer, PoolMode};
use crate::resources::common::{ADMIN_USER, SECRETS_MOUNT_PATH};
use crate::resources::secret::{ADMIN_SECRET_KEY, USER_LIST_SECRET_KEY};

/// Fixed paths inside the container
pub const LOG_FILE: &str = "/tmp/pgbouncer.log";
pub const PID_FILE: &str = "/tmp/pgbouncer.pid";

/// Port used when an AppBinding service omits one
pub const DEFAULT_UPSTREAM_PORT: i32 = 5432;

/// Always ignored so JDBC clients can connect
const EXTRA_FLOAT_DIGITS: &str = "extra_float_digits";

/// Where an upstream database can be reached
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Upstream {
    /// `host=<host> port=<port>`
    Service { host: String, port: i32 },
    /// A connection string published verbatim by the AppBinding
    Url(String),
}

impl Upstream {
    /// Resolve the upstream an AppBinding points at
    pub fn from_app_binding(app_binding: &AppBinding) -> Option<Self> {
        let client_config = &app_binding.spec.client_config;
        if let Some(service) = &client_config.service {
            let namespace = app_binding.namespace().unwrap_or_default();
            return Some(Upstream::Service {
                host: format!("{}.{}.svc", service.name, namespace),
                port: service.port.unwrap_or(DEFAULT_UPSTREAM_PORT),
            });
        }
        client_config
            .url
            .as_ref()
            .filter(|url| !url.is_empty())
            .map(|url| Upstream::Url(url.clone()))
    }
}

/// Path of the auth file pgbouncer reads.
///
/// The merged user list is used when one exists, otherwise the file with
/// only the admin line.
pub fn auth_file_path(has_user_list: bool) -> String {
    let key = if has_user_list {
        USER_LIST_SECRET_KEY
    } else {
        ADMIN_SECRET_KEY
    };
    format!("{}/{}", SECRETS_MOUNT_PATH, key)
}

/// Render the complete pgbouncer.ini for a PgBouncer.
///
/// `lookup` receives the AppBinding namespace and name of each database
/// entry. Entries it cannot resolve are left out of the [databases] section.
pub fn render_pgbouncer_ini<F>(pgbouncer: &PgBouncer, lookup: F, auth_file: &str) -> String
where
    F: Fn(&str, &str) -> Option<Upstream>,
{
    let own_namespace = pgbouncer.namespace().unwrap_or_default();
    let mut lines = vec!["[databases]".to_string()];

    for db in &pgbouncer.spec.databases {
        let namespace = db
            .app_binding_ref
            .namespace
            .as_deref()
            .filter(|ns| !ns.is_empty())
            .unwrap_or(&own_namespace);

        let Some(upstream) = lookup(namespace, &db.app_binding_ref.name) else {
            warn!(
                alias = %db.alias,
                app_binding = %db.app_binding_ref.name,
                namespace = %namespace,
                "AppBinding not resolvable, skipping database entry"
            );
            continue;
        };

        let mut line = match upstream {
            Upstream::Service { host, port } => format!(
                "{} = host={} port={} dbname={}",
                db.alias, host, port, db.database_name
            ),
            Upstream::Url(url) => format!("{} = {} dbname={}", db.alias, url, db.database_name),
        };
        if let Some(user) = db.username.as_deref().filter(|u| !u.is_empty()) {
            line.push_str(&format!(" user={}", user));
        }
        if let Some(password) = db.password.as_deref().filter(|p| !p.is_empty()) {
            line.push_str(&format!(" password={}", password));
        }
        lines.push(line);
    }

    lines.push(String::new());
    lines.push("[pgbouncer]".to_string());
    lines.push(format!("logfile = {}", LOG_FILE));
    lines.push(format!("pidfile = {}", PID_FILE));
    if pgbouncer.uses_auth_file() {
        lines.push(format!("auth_file = {}", auth_file));
    }

    let pool = pgbouncer.spec.connection_pool.clone().unwrap_or_default();

    push_number(&mut lines, "listen_port", pool.port.map(i64::from));
    push_text(&mut lines, "listen_addr", pool.listen_address.as_deref());
    push_text(
        &mut lines,
        "pool_mode",
        pool.pool_mode.map(|m: PoolMode| m.to_string()).as_deref(),
    );

    let mut ignored = vec![EXTRA_FLOAT_DIGITS.to_string()];
    ignored.extend(
        pool.ignore_startup_parameters
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty() && *p != EXTRA_FLOAT_DIGITS)
            .map(str::to_string),
    );
    lines.push(format!("ignore_startup_parameters = {}", ignored.join(",")));

    push_number(&mut lines, "max_client_conn", pool.max_client_connections);
    push_number(&mut lines, "max_db_connections", pool.max_db_connections);
    push_number(&mut lines, "max_user_connections", pool.max_user_connections);
    push_number(&mut lines, "min_pool_size", pool.min_pool_size);
    push_number(&mut lines, "default_pool_size", pool.default_pool_size);
    push_number(&mut lines, "reserve_pool_size", pool.reserve_pool_size);
    push_number(
        &mut lines,
        "reserve_pool_timeout",
        pool.reserve_pool_timeout_seconds,
    );
    push_number(&mut lines, "stats_period", pool.stats_period_seconds);
    push_text(&mut lines, "auth_type", pool.auth_type.as_deref());
    push_text(&mut lines, "auth_user", pool.auth_user.as_deref());

    let mut admins = vec![ADMIN_USER.to_string()];
    admins.extend(
        pool.admin_users
            .iter()
            .filter(|u| !u.is_empty() && u.as_str() != ADMIN_USER)
            .cloned(),
    );
    lines.push(format!("admin_users = {}", admins.join(",")));

    let mut ini = lines.join("\n");
    ini.push('\n');
    ini
}

// Zero means "use the pgbouncer default" and is left out
fn push_number(lines: &mut Vec<String>, key: &str, value: Option<i64>) {
    if let Some(v) = value.filter(|v| *v != 0) {
        lines.push(format!("{} = {}", key, v));
    }
}

fn push_text(lines: &mut Vec<String>, key: &str, value: Option<&str>) {
    if let Some(v) = value.filter(|v| !v.is_empty()) {
        lines.push(format!("{} = {}", key, v));
    }
}
