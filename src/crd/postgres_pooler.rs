use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::Condition;

/// PostgresPooler is the Schema for the postgrespoolers API
///
/// A pooler runs a Deployment of PgBouncer processes in front of one role of
/// a PostgresCluster. It only reads the cluster; it never mutates it.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "postgres-operator.smoketurner.com",
    version = "v1alpha1",
    kind = "PostgresPooler",
    plural = "postgrespoolers",
    shortname = "pgp",
    namespaced,
    status = "PostgresPoolerStatus",
    printcolumn = r#"{"name":"Cluster", "type":"string", "jsonPath":".spec.cluster.name"}"#,
    printcolumn = r#"{"name":"Type", "type":"string", "jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"Instances", "type":"integer", "jsonPath":".spec.instances"}"#,
    printcolumn = r#"{"name":"Ready", "type":"integer", "jsonPath":".status.instances"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PostgresPoolerSpec {
    /// The cluster this pooler routes to (same namespace)
    pub cluster: LocalObjectReference,

    /// Which cluster role receives the traffic
    #[serde(rename = "type", default)]
    pub type_: PoolerType,

    /// Number of PgBouncer replicas
    #[serde(default = "default_pooler_instances")]
    pub instances: i32,

    /// PgBouncer configuration
    #[serde(default)]
    pub pgbouncer: PgBouncerSpec,
}

fn default_pooler_instances() -> i32 {
    1
}

/// Reference to an object in the same namespace
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Default)]
pub struct LocalObjectReference {
    pub name: String,
}

/// Cluster role targeted by a pooler
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PoolerType {
    /// Primary (read-write)
    #[default]
    Rw,
    /// Replicas only (read-only)
    Ro,
    /// Any instance (read)
    R,
}

impl PoolerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolerType::Rw => "rw",
            PoolerType::Ro => "ro",
            PoolerType::R => "r",
        }
    }
}

impl std::fmt::Display for PoolerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// PgBouncer pooling mode
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PoolMode {
    #[default]
    Session,
    Transaction,
    Statement,
}

impl PoolMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolMode::Session => "session",
            PoolMode::Transaction => "transaction",
            PoolMode::Statement => "statement",
        }
    }
}

impl std::fmt::Display for PoolMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PoolMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "session" => Ok(PoolMode::Session),
            "transaction" => Ok(PoolMode::Transaction),
            "statement" => Ok(PoolMode::Statement),
            other => Err(format!("unknown pool mode: {}", other)),
        }
    }
}

/// PgBouncer connection pooling configuration
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PgBouncerSpec {
    /// Pool mode: session, transaction, or statement
    #[serde(default)]
    pub pool_mode: PoolMode,

    /// Additional pgbouncer.ini parameters
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
}

/// Status of the PostgresPooler
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PostgresPoolerStatus {
    /// Ready PgBouncer replicas
    #[serde(default)]
    pub instances: i32,

    /// Service endpoint the pooler forwards to
    #[serde(default)]
    pub target_endpoint: Option<String>,

    /// Pool mode currently deployed
    #[serde(default)]
    pub pool_mode: Option<PoolMode>,

    /// Observed generation of the resource
    #[serde(default)]
    pub observed_generation: Option<i64>,

    /// Kubernetes-style conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,
}
