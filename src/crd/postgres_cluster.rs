use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// PostgresCluster is the Schema for the postgresclusters API
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[kube(
    group = "postgres-operator.smoketurner.com",
    version = "v1alpha1",
    kind = "PostgresCluster",
    plural = "postgresclusters",
    shortname = "pgc",
    namespaced,
    status = "PostgresClusterStatus",
    printcolumn = r#"{"name":"Instances", "type":"integer", "jsonPath":".spec.instances"}"#,
    printcolumn = r#"{"name":"Ready", "type":"integer", "jsonPath":".status.readyInstances"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Primary", "type":"string", "jsonPath":".status.currentPrimary"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PostgresClusterSpec {
    /// Number of PostgreSQL instances. Ordinals 1..=instances are managed.
    #[serde(default = "default_instances")]
    pub instances: i32,

    /// Storage configuration for the per-instance data volumes
    pub storage: StorageConfiguration,

    /// Secrets holding the CA and leaf certificates mounted by every instance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificates: Option<CertificatesConfiguration>,

    /// Monitoring configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitoring: Option<MonitoringConfiguration>,

    /// PostgreSQL image override (defaults to the operator configured image)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_name: Option<String>,
}

fn default_instances() -> i32 {
    1
}

/// Storage configuration for PostgreSQL data volumes
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfiguration {
    /// Storage class name (uses default if not specified)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,

    /// Size of each volume claim (e.g., "1G", "10Gi")
    pub size: String,
}

/// Names of the secrets holding certificate material
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct CertificatesConfiguration {
    /// Secret containing the CA used to sign the server certificate
    #[serde(rename = "serverCASecret")]
    pub server_ca_secret: String,

    /// Secret containing the CA used to verify client certificates
    #[serde(rename = "clientCASecret")]
    pub client_ca_secret: String,

    /// Secret containing the server leaf certificate and key
    #[serde(
        rename = "serverTLSSecret",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub server_tls_secret: Option<String>,

    /// Secret containing the streaming replication client certificate
    #[serde(
        rename = "replicationTLSSecret",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub replication_tls_secret: Option<String>,
}

/// Monitoring configuration
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringConfiguration {
    /// ConfigMaps holding custom metric queries, tracked by resource version
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_queries_config_map: Vec<String>,
}

/// Status of the PostgresCluster
///
/// Optional fields are serialized as `null` so a merge patch clears them.
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PostgresClusterStatus {
    /// Aggregated lifecycle phase
    #[serde(default)]
    pub phase: ClusterPhase,

    /// Human readable explanation of the phase
    #[serde(default)]
    pub phase_reason: Option<String>,

    /// Number of live instance processes
    #[serde(default)]
    pub instances: i32,

    /// Number of instances reporting ready
    #[serde(default)]
    pub ready_instances: i32,

    /// Per-ordinal lifecycle detail
    #[serde(default)]
    pub instances_status: Vec<InstanceStatus>,

    /// Resource versions of the tracked certificate secrets
    #[serde(default)]
    pub secrets_resource_version: SecretsResourceVersion,

    /// Resource versions of the tracked config maps
    #[serde(default)]
    pub config_map_resource_version: ConfigMapResourceVersion,

    /// Certificate configuration confirmed present when status was written
    #[serde(default)]
    pub certificates: Option<CertificatesConfiguration>,

    /// Instance currently designated primary, when ready
    #[serde(default)]
    pub current_primary: Option<String>,

    /// Instance the operator labels as primary
    #[serde(default)]
    pub target_primary: Option<String>,

    /// Ready replicas eligible for promotion
    #[serde(default)]
    pub failover_candidates: Vec<String>,

    /// Volume claims beyond the desired ordinal range (never deleted)
    #[serde(default, rename = "danglingPVC")]
    pub dangling_pvc: Vec<String>,

    /// Labelled objects whose names do not follow the naming convention
    #[serde(default)]
    pub unexpected_objects: Vec<String>,

    /// Most recent bootstrap job failure
    #[serde(default)]
    pub last_bootstrap_failure: Option<BootstrapFailure>,

    /// Observed generation of the resource
    #[serde(default)]
    pub observed_generation: Option<i64>,

    /// Kubernetes-style conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Resource versions of the certificate secrets, one watermark per role
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecretsResourceVersion {
    #[serde(default, rename = "serverCAVersion")]
    pub server_ca_version: Option<String>,

    #[serde(default, rename = "clientCAVersion")]
    pub client_ca_version: Option<String>,

    #[serde(default)]
    pub server_secret_version: Option<String>,

    #[serde(default)]
    pub replication_secret_version: Option<String>,
}

/// Resource versions of tracked config maps, keyed by config map name
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMapResourceVersion {
    #[serde(default)]
    pub metrics: BTreeMap<String, String>,
}

/// Lifecycle detail for one ordinal
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    pub name: String,
    pub ordinal: i32,
    pub phase: InstancePhase,
    pub readiness: InstanceReadiness,
    /// The instance mounts a certificate that rotated since it was created
    #[serde(default)]
    pub refresh_pending: bool,
    #[serde(default)]
    pub message: Option<String>,
}

/// Record of a failed bootstrap job
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapFailure {
    pub instance: String,
    pub job: String,
    pub message: String,
}

/// Cluster lifecycle phase
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq)]
pub enum ClusterPhase {
    /// Nothing observed yet
    #[default]
    Pending,
    /// Volume claims are being created
    Provisioning,
    /// Bootstrap jobs are initializing volumes
    Bootstrapping,
    /// Instance processes are starting
    Starting,
    /// Every desired instance is ready
    Healthy,
    /// Some instances are ready, some are not
    Degraded,
    /// At least one bootstrap failed and needs manual intervention
    Failed,
    /// The spec is invalid; no action is taken until it is corrected
    ConfigurationError,
}

impl std::fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterPhase::Pending => write!(f, "Pending"),
            ClusterPhase::Provisioning => write!(f, "Provisioning"),
            ClusterPhase::Bootstrapping => write!(f, "Bootstrapping"),
            ClusterPhase::Starting => write!(f, "Starting"),
            ClusterPhase::Healthy => write!(f, "Healthy"),
            ClusterPhase::Degraded => write!(f, "Degraded"),
            ClusterPhase::Failed => write!(f, "Failed"),
            ClusterPhase::ConfigurationError => write!(f, "ConfigurationError"),
        }
    }
}

/// Lifecycle state of a single ordinal, derived from its volume, job and process
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, PartialOrd, Ord)]
pub enum InstancePhase {
    NoVolume,
    VolumeProvisioned,
    Bootstrapping,
    Bootstrapped,
    Ready,
    Failed,
}

impl std::fmt::Display for InstancePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstancePhase::NoVolume => write!(f, "NoVolume"),
            InstancePhase::VolumeProvisioned => write!(f, "VolumeProvisioned"),
            InstancePhase::Bootstrapping => write!(f, "Bootstrapping"),
            InstancePhase::Bootstrapped => write!(f, "Bootstrapped"),
            InstancePhase::Ready => write!(f, "Ready"),
            InstancePhase::Failed => write!(f, "Failed"),
        }
    }
}

/// Readiness of an instance process as reported by the platform
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum InstanceReadiness {
    /// Not yet scheduled or started
    Pending,
    /// Started, readiness condition false
    Starting,
    /// Readiness condition true
    Ready,
    /// The process terminated unsuccessfully
    Failed,
    /// No process and no bootstrap evidence
    Unknown,
}

impl std::fmt::Display for InstanceReadiness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceReadiness::Pending => write!(f, "Pending"),
            InstanceReadiness::Starting => write!(f, "Starting"),
            InstanceReadiness::Ready => write!(f, "Ready"),
            InstanceReadiness::Failed => write!(f, "Failed"),
            InstanceReadiness::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition: True, False, or Unknown
    pub status: String,

    /// Reason for the condition's last transition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    pub last_transition_time: String,

    /// Generation observed when condition was set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}
