//! Status and conditions for PostgresCluster and PostgresPooler resources
//!
//! Status is always rebuilt from a freshly observed snapshot. Conditions keep
//! their transition time while their status is unchanged, so rebuilding the
//! status of a converged cluster yields exactly the stored status and no
//! write is issued.

use std::collections::BTreeMap;

use chrono::Utc;
use kube::ResourceExt;

use crate::controller::bootstrap::BootstrapPlan;
use crate::controller::certificates::LiveSecretVersions;
use crate::controller::instances::{InstancePlan, instance_phase};
use crate::controller::storage::VolumePlan;
use crate::crd::{
    ClusterPhase, Condition, ConfigMapResourceVersion, InstancePhase, InstanceReadiness,
    InstanceStatus, PostgresCluster, PostgresClusterStatus,
};
use crate::resources::common::instance_name;

/// Standard condition types following Kubernetes conventions
pub mod condition_types {
    /// Every desired instance is ready
    pub const READY: &str = "Ready";
    /// The resource is converging towards its desired state
    pub const PROGRESSING: &str = "Progressing";
    /// Some instances are unavailable or failed
    pub const DEGRADED: &str = "Degraded";
    /// The spec passed validation
    pub const CONFIG_VALID: &str = "ConfigurationValid";
    /// Every configured certificate secret exists
    pub const CERTIFICATES_READY: &str = "CertificatesReady";
    /// The cluster referenced by a pooler exists
    pub const CLUSTER_FOUND: &str = "ClusterFound";
}

/// Condition status values
pub mod condition_status {
    pub const TRUE: &str = "True";
    pub const FALSE: &str = "False";
    pub const UNKNOWN: &str = "Unknown";
}

/// Builder for creating and updating status conditions
pub struct ConditionBuilder {
    conditions: Vec<Condition>,
    generation: Option<i64>,
}

impl ConditionBuilder {
    /// Create a new condition builder
    pub fn new(generation: Option<i64>) -> Self {
        Self {
            conditions: Vec::new(),
            generation,
        }
    }

    /// Create from existing conditions
    pub fn from_existing(existing: Vec<Condition>, generation: Option<i64>) -> Self {
        Self {
            conditions: existing,
            generation,
        }
    }

    /// Set a condition, updating if it exists or adding if it doesn't
    pub fn set_condition(mut self, type_: &str, status: &str, reason: &str, message: &str) -> Self {
        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == type_) {
            // Transition time only moves when the status flips
            if existing.status != status {
                existing.status = status.to_string();
                existing.last_transition_time = Utc::now().to_rfc3339();
            }
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            existing.observed_generation = self.generation;
        } else {
            self.conditions.push(Condition {
                type_: type_.to_string(),
                status: status.to_string(),
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: Utc::now().to_rfc3339(),
                observed_generation: self.generation,
            });
        }
        self
    }

    fn set_bool(self, type_: &str, value: bool, reason: &str, message: &str) -> Self {
        let status = if value {
            condition_status::TRUE
        } else {
            condition_status::FALSE
        };
        self.set_condition(type_, status, reason, message)
    }

    /// Set the Ready condition
    pub fn ready(self, is_ready: bool, reason: &str, message: &str) -> Self {
        self.set_bool(condition_types::READY, is_ready, reason, message)
    }

    /// Set the Progressing condition
    pub fn progressing(self, is_progressing: bool, reason: &str, message: &str) -> Self {
        self.set_bool(condition_types::PROGRESSING, is_progressing, reason, message)
    }

    /// Set the Degraded condition
    pub fn degraded(self, is_degraded: bool, reason: &str, message: &str) -> Self {
        self.set_bool(condition_types::DEGRADED, is_degraded, reason, message)
    }

    /// Set the ConfigurationValid condition
    pub fn config_valid(self, is_valid: bool, reason: &str, message: &str) -> Self {
        self.set_bool(condition_types::CONFIG_VALID, is_valid, reason, message)
    }

    /// Set the CertificatesReady condition
    pub fn certificates_ready(self, is_ready: bool, reason: &str, message: &str) -> Self {
        self.set_bool(condition_types::CERTIFICATES_READY, is_ready, reason, message)
    }

    /// Set the ClusterFound condition
    pub fn cluster_found(self, found: bool, reason: &str, message: &str) -> Self {
        self.set_bool(condition_types::CLUSTER_FOUND, found, reason, message)
    }

    /// Build the conditions list
    pub fn build(self) -> Vec<Condition> {
        self.conditions
    }
}

/// Check if the cluster spec has changed by comparing observed generation
pub fn spec_changed(cluster: &PostgresCluster) -> bool {
    let current_generation = cluster.metadata.generation;
    let observed_generation = cluster.status.as_ref().and_then(|s| s.observed_generation);

    match (current_generation, observed_generation) {
        (Some(current), Some(observed)) => current != observed,
        (Some(_), None) => true, // Never observed, needs reconciliation
        _ => true,               // No generation, always reconcile
    }
}

/// Everything observed in one snapshot that feeds the cluster status
pub struct ClusterObservation<'a> {
    pub volumes: &'a VolumePlan,
    pub bootstrap: &'a BootstrapPlan,
    pub instances: &'a InstancePlan,
    pub secrets: &'a LiveSecretVersions,
    pub config_maps: &'a BTreeMap<String, String>,
    pub unexpected: Vec<String>,
}

/// Per-ordinal lifecycle detail for `1..=spec.instances`
pub fn instance_statuses(cluster: &PostgresCluster, obs: &ClusterObservation) -> Vec<InstanceStatus> {
    let cluster_name = cluster.name_any();
    (1..=cluster.spec.instances)
        .map(|ordinal| {
            let has_volume = obs.volumes.provisioned.contains_key(&ordinal);
            let bootstrap = obs
                .bootstrap
                .states
                .get(&ordinal)
                .cloned()
                .unwrap_or(crate::controller::bootstrap::BootstrapState::NotApplicable);
            let pod = obs.instances.pods.get(&ordinal);
            let (phase, mut message) = instance_phase(has_volume, &bootstrap, pod);

            let readiness = match pod {
                Some(pod) => pod.readiness,
                None if bootstrap.is_succeeded() => InstanceReadiness::Pending,
                None => InstanceReadiness::Unknown,
            };
            if pod.is_none() && obs.instances.waiting_for_certificates.contains(&ordinal) {
                message = Some("waiting for certificate secrets".to_string());
            }
            if obs.volumes.terminating.contains(&ordinal) {
                message = Some("volume claim terminating".to_string());
            }

            InstanceStatus {
                name: instance_name(&cluster_name, ordinal),
                ordinal,
                phase,
                readiness,
                refresh_pending: pod.is_some_and(|p| p.stale),
                message,
            }
        })
        .collect()
}

/// Aggregate phase of the cluster and a human readable reason
pub fn derive_phase(
    statuses: &[InstanceStatus],
    bootstrap_failed: bool,
) -> (ClusterPhase, String) {
    let count = |phase: InstancePhase| statuses.iter().filter(|s| s.phase == phase).count();
    let desired = statuses.len();
    let ready = count(InstancePhase::Ready);

    if bootstrap_failed {
        let failed: Vec<_> = statuses
            .iter()
            .filter(|s| s.phase == InstancePhase::Failed)
            .map(|s| s.name.as_str())
            .collect();
        return (
            ClusterPhase::Failed,
            format!("bootstrap failed for {}", failed.join(", ")),
        );
    }
    if desired > 0 && ready == desired {
        return (
            ClusterPhase::Healthy,
            format!("{} of {} instances ready", ready, desired),
        );
    }
    if ready > 0 {
        return (
            ClusterPhase::Degraded,
            format!("{} of {} instances ready", ready, desired),
        );
    }
    if count(InstancePhase::Bootstrapped) > 0 || count(InstancePhase::Failed) > 0 {
        return (ClusterPhase::Starting, "starting instances".to_string());
    }
    if count(InstancePhase::Bootstrapping) > 0 || count(InstancePhase::VolumeProvisioned) > 0 {
        return (
            ClusterPhase::Bootstrapping,
            "initializing data volumes".to_string(),
        );
    }
    (
        ClusterPhase::Provisioning,
        "provisioning volume claims".to_string(),
    )
}

/// Build the cluster status from one observed snapshot
pub fn build_cluster_status(
    cluster: &PostgresCluster,
    obs: &ClusterObservation,
) -> PostgresClusterStatus {
    let cluster_name = cluster.name_any();
    let generation = cluster.metadata.generation;
    let existing = cluster.status.clone().unwrap_or_default();

    let statuses = instance_statuses(cluster, obs);
    let bootstrap_failed = !obs.bootstrap.failures.is_empty();
    let (phase, reason) = derive_phase(&statuses, bootstrap_failed);

    let ready_names: Vec<String> = statuses
        .iter()
        .filter(|s| s.phase == InstancePhase::Ready)
        .map(|s| s.name.clone())
        .collect();
    let target_primary = obs
        .instances
        .target_primary
        .map(|o| instance_name(&cluster_name, o));
    let current_primary = target_primary
        .clone()
        .filter(|name| ready_names.contains(name));
    let failover_candidates = ready_names
        .iter()
        .filter(|name| Some(*name) != target_primary.as_ref())
        .cloned()
        .collect();

    let certs_configured = cluster.spec.certificates.is_some();
    let certs_present = obs.secrets.complete();
    let (certs_reason, certs_message) = match (certs_configured, certs_present) {
        (false, _) => ("NotConfigured", "No certificate secrets configured".to_string()),
        (true, true) => ("SecretsPresent", "All certificate secrets exist".to_string()),
        (true, false) => (
            "SecretsMissing",
            format!("Missing secrets: {}", obs.secrets.missing.join(", ")),
        ),
    };

    let healthy = phase == ClusterPhase::Healthy;
    let degraded = matches!(phase, ClusterPhase::Degraded | ClusterPhase::Failed);
    let progressing = !healthy && phase != ClusterPhase::Failed;
    let conditions = ConditionBuilder::from_existing(existing.conditions, generation)
        .ready(
            healthy,
            if healthy { "ClusterReady" } else { "NotReady" },
            &reason,
        )
        .progressing(
            progressing,
            if progressing { "Converging" } else { "Stable" },
            &reason,
        )
        .degraded(
            degraded,
            if degraded { "InstancesUnavailable" } else { "Healthy" },
            &reason,
        )
        .config_valid(true, "Valid", "Spec passed validation")
        .certificates_ready(certs_present, certs_reason, &certs_message)
        .build();

    let mut unexpected = obs.unexpected.clone();
    unexpected.sort();

    PostgresClusterStatus {
        phase,
        phase_reason: Some(reason),
        instances: obs.instances.live() as i32,
        ready_instances: ready_names.len() as i32,
        instances_status: statuses,
        secrets_resource_version: obs.secrets.watermark(),
        config_map_resource_version: ConfigMapResourceVersion {
            metrics: obs.config_maps.clone(),
        },
        certificates: cluster
            .spec
            .certificates
            .clone()
            .filter(|_| certs_present),
        current_primary,
        target_primary,
        failover_candidates,
        dangling_pvc: obs.volumes.dangling.clone(),
        unexpected_objects: unexpected,
        last_bootstrap_failure: obs.bootstrap.failures.first().cloned(),
        observed_generation: generation,
        conditions,
    }
}

/// Status for a spec that failed validation
///
/// Everything but the phase and conditions is carried over; nothing was
/// observed or changed this pass.
pub fn configuration_error_status(
    cluster: &PostgresCluster,
    message: &str,
) -> PostgresClusterStatus {
    let generation = cluster.metadata.generation;
    let existing = cluster.status.clone().unwrap_or_default();
    let conditions = ConditionBuilder::from_existing(existing.conditions.clone(), generation)
        .ready(false, "ConfigurationError", message)
        .progressing(false, "ConfigurationError", message)
        .config_valid(false, "ValidationFailed", message)
        .build();

    PostgresClusterStatus {
        phase: ClusterPhase::ConfigurationError,
        phase_reason: Some(message.to_string()),
        observed_generation: generation,
        conditions,
        ..existing
    }
}
