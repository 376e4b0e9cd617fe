//! Operator configuration sourced from the environment
//!
//! Every value has a default; malformed values are logged and ignored so a
//! typo in a deployment manifest never prevents the operator from starting.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::controller::error::BackoffConfig;

/// Default PostgreSQL image
pub const DEFAULT_POSTGRES_IMAGE: &str = "ghcr.io/cloudnative-pg/postgresql:16";

/// Default PgBouncer image
pub const DEFAULT_PGBOUNCER_IMAGE: &str = "public.ecr.aws/bitnami/pgbouncer:latest";

#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Image used for instances and bootstrap jobs
    pub postgres_image: String,
    /// Image used for pooler deployments
    pub pgbouncer_image: String,
    /// Delay used for "retry now" while a cluster is converging
    pub converging_requeue: Duration,
    /// Backoff for externally caused failures
    pub backoff: BackoffConfig,
    /// `backoffLimit` of bootstrap jobs
    pub bootstrap_backoff_limit: i32,
    /// Restrict the controllers to one namespace
    pub watch_namespace: Option<String>,
    /// Port of the health and metrics server
    pub health_port: u16,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            postgres_image: DEFAULT_POSTGRES_IMAGE.to_string(),
            pgbouncer_image: DEFAULT_PGBOUNCER_IMAGE.to_string(),
            converging_requeue: Duration::from_secs(5),
            backoff: BackoffConfig::default(),
            bootstrap_backoff_limit: 0,
            watch_namespace: None,
            health_port: 8080,
        }
    }
}

impl OperatorConfig {
    /// Build the configuration from `PGO_*` environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let backoff = BackoffConfig {
            initial_delay: Duration::from_secs(parse_env(
                "PGO_BACKOFF_INITIAL_SECS",
                defaults.backoff.initial_delay.as_secs(),
            )),
            max_delay: Duration::from_secs(parse_env(
                "PGO_BACKOFF_MAX_SECS",
                defaults.backoff.max_delay.as_secs(),
            )),
            ..defaults.backoff
        };

        Self {
            postgres_image: from_env_default("PGO_POSTGRES_IMAGE", &defaults.postgres_image),
            pgbouncer_image: from_env_default("PGO_PGBOUNCER_IMAGE", &defaults.pgbouncer_image),
            converging_requeue: Duration::from_secs(parse_env(
                "PGO_CONVERGING_REQUEUE_SECS",
                defaults.converging_requeue.as_secs(),
            )),
            backoff,
            bootstrap_backoff_limit: parse_env(
                "PGO_BOOTSTRAP_BACKOFF_LIMIT",
                defaults.bootstrap_backoff_limit,
            ),
            watch_namespace: env::var("PGO_WATCH_NAMESPACE")
                .ok()
                .filter(|ns| !ns.is_empty()),
            health_port: parse_env("HEALTH_PORT", defaults.health_port),
        }
    }
}

// Source the variable from the env - use default if not set
fn from_env_default(var: &str, default: &str) -> String {
    env::var(var).unwrap_or_else(|_| default.to_owned())
}

fn parse_env<T>(var: &str, default: T) -> T
where
    T: FromStr + std::fmt::Display + Copy,
{
    match env::var(var) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(variable = var, value = %raw, "Ignoring malformed value, using default {}", default);
            default
        }),
        Err(_) => default,
    }
}
