//! Naming and labelling conventions shared by every generated resource
//!
//! Child names are a pure function of the owner name and the ordinal or role,
//! so a reconciliation pass can always rediscover the children of a cluster
//! without keeping an index. Labels carry the same identity and let the
//! reconciler list every child of an owner as a cross-check.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};

use crate::crd::PoolerType;

/// API version for the operator CRDs
pub const API_VERSION: &str = "postgres-operator.smoketurner.com/v1alpha1";

/// Operator field manager name
pub const FIELD_MANAGER: &str = "pgcluster-operator";

pub const LABEL_NAME: &str = "app.kubernetes.io/name";
pub const LABEL_COMPONENT: &str = "app.kubernetes.io/component";
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const LABEL_CLUSTER: &str = "postgres-operator.smoketurner.com/cluster";
pub const LABEL_POOLER: &str = "postgres-operator.smoketurner.com/pooler";
pub const LABEL_OWNER_KIND: &str = "postgres-operator.smoketurner.com/owner-kind";
pub const LABEL_INSTANCE: &str = "postgres-operator.smoketurner.com/instance";
pub const LABEL_ROLE: &str = "postgres-operator.smoketurner.com/role";

/// Volume claim annotation recording durable bootstrap success
pub const ANNOTATION_PVC_STATUS: &str = "postgres-operator.smoketurner.com/pvc-status";
pub const PVC_STATUS_INITIALIZING: &str = "initializing";
pub const PVC_STATUS_READY: &str = "ready";

/// Component of a child resource, stored in `app.kubernetes.io/component`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Instance,
    Bootstrap,
    Pooler,
    Service,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Instance => "instance",
            Component::Bootstrap => "bootstrap",
            Component::Pooler => "pooler",
            Component::Service => "service",
        }
    }
}

/// Replication role of an instance, stored in the role label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceRole {
    Primary,
    Replica,
}

impl InstanceRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceRole::Primary => "primary",
            InstanceRole::Replica => "replica",
        }
    }
}

/// How a bootstrap job initializes its volume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapMethod {
    /// Create a fresh data directory (first instance)
    Initdb,
    /// Clone the data directory from the primary
    Join,
}

impl BootstrapMethod {
    pub fn for_ordinal(ordinal: i32) -> Self {
        if ordinal == 1 {
            BootstrapMethod::Initdb
        } else {
            BootstrapMethod::Join
        }
    }

    pub fn suffix(&self) -> &'static str {
        match self {
            BootstrapMethod::Initdb => "initdb",
            BootstrapMethod::Join => "join",
        }
    }
}

/// Name of the instance (and its volume claim) for an ordinal
pub fn instance_name(cluster_name: &str, ordinal: i32) -> String {
    format!("{}-{}", cluster_name, ordinal)
}

/// Name of the bootstrap job for an ordinal
pub fn job_name(cluster_name: &str, ordinal: i32) -> String {
    format!(
        "{}-{}-{}",
        cluster_name,
        ordinal,
        BootstrapMethod::for_ordinal(ordinal).suffix()
    )
}

/// Name of the cluster service serving a role
pub fn service_name(cluster_name: &str, role: PoolerType) -> String {
    format!("{}-{}", cluster_name, role.as_str())
}

/// In-cluster endpoint for a role of a cluster
pub fn service_endpoint(cluster_name: &str, role: PoolerType) -> String {
    service_name(cluster_name, role)
}

/// Inverse of [`instance_name`]; `None` for names this cluster would never derive
pub fn parse_instance_ordinal(cluster_name: &str, name: &str) -> Option<i32> {
    let rest = name.strip_prefix(cluster_name)?.strip_prefix('-')?;
    let ordinal = parse_ordinal(rest)?;
    Some(ordinal)
}

/// Inverse of [`job_name`]
pub fn parse_job_ordinal(cluster_name: &str, name: &str) -> Option<i32> {
    let rest = name.strip_prefix(cluster_name)?.strip_prefix('-')?;
    let (ordinal, suffix) = rest.split_once('-')?;
    let ordinal = parse_ordinal(ordinal)?;
    (BootstrapMethod::for_ordinal(ordinal).suffix() == suffix).then_some(ordinal)
}

/// Parse a canonical positive ordinal (no sign, no leading zeros)
fn parse_ordinal(s: &str) -> Option<i32> {
    if s.is_empty() || s.starts_with('0') || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse::<i32>().ok().filter(|n| *n >= 1)
}

/// Generate a controller owner reference for any operator-owned resource
///
/// Child resources carry this reference so the platform garbage collector
/// reclaims them when the owner is deleted.
pub fn owner_reference<K>(owner: &K) -> OwnerReference
where
    K: Resource<DynamicType = ()>,
{
    OwnerReference {
        api_version: K::api_version(&()).to_string(),
        kind: K::kind(&()).to_string(),
        name: owner.name_any(),
        uid: owner.meta().uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Labels shared by every child of a PostgresCluster
pub fn standard_labels(cluster_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_NAME.to_string(), cluster_name.to_string()),
        (LABEL_MANAGED_BY.to_string(), FIELD_MANAGER.to_string()),
        (LABEL_CLUSTER.to_string(), cluster_name.to_string()),
        (LABEL_OWNER_KIND.to_string(), "PostgresCluster".to_string()),
    ])
}

/// Labels for a cluster child of a given component
pub fn component_labels(cluster_name: &str, component: Component) -> BTreeMap<String, String> {
    let mut labels = standard_labels(cluster_name);
    labels.insert(LABEL_COMPONENT.to_string(), component.as_str().to_string());
    labels
}

/// Labels for the resources belonging to one ordinal
pub fn instance_labels(
    cluster_name: &str,
    ordinal: i32,
    component: Component,
) -> BTreeMap<String, String> {
    let mut labels = component_labels(cluster_name, component);
    labels.insert(LABEL_INSTANCE.to_string(), ordinal.to_string());
    labels
}

/// Selector matching every child of a given component
pub fn component_selector(cluster_name: &str, component: Component) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_CLUSTER.to_string(), cluster_name.to_string()),
        (LABEL_COMPONENT.to_string(), component.as_str().to_string()),
    ])
}

/// Labels for the resources of a PostgresPooler
pub fn pooler_labels(pooler_name: &str, cluster_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_NAME.to_string(), pooler_name.to_string()),
        (LABEL_MANAGED_BY.to_string(), FIELD_MANAGER.to_string()),
        (LABEL_COMPONENT.to_string(), Component::Pooler.as_str().to_string()),
        (LABEL_POOLER.to_string(), pooler_name.to_string()),
        (LABEL_OWNER_KIND.to_string(), "PostgresPooler".to_string()),
        (LABEL_CLUSTER.to_string(), cluster_name.to_string()),
    ])
}

/// Render a label map as a Kubernetes label selector string
pub fn selector_string(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}
