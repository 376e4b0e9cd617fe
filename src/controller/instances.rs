//! Instance lifecycle: one pod per bootstrapped ordinal
//!
//! Readiness is classified purely from what the platform reports on the pod,
//! so the same snapshot always yields the same classification.
//!
//! Pods mounting rotated certificates are refreshed one at a time: replicas
//! first (highest ordinal first), the target primary last, and only while
//! every other instance is ready.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

use crate::config::OperatorConfig;
use crate::controller::bootstrap::BootstrapState;
use crate::controller::certificates::{LiveSecretVersions, pod_is_stale};
use crate::crd::{InstancePhase, InstanceReadiness, PostgresCluster};
use crate::resources::common::{InstanceRole, LABEL_ROLE, parse_instance_ordinal};
use crate::resources::pod::generate_instance_pod;

/// Classify a pod from its reported phase and conditions
pub fn classify_readiness(pod: &Pod) -> InstanceReadiness {
    let Some(status) = pod.status.as_ref() else {
        return InstanceReadiness::Pending;
    };
    match status.phase.as_deref() {
        Some("Failed") | Some("Succeeded") => InstanceReadiness::Failed,
        Some("Running") => {
            let ready = status.conditions.as_ref().is_some_and(|conds| {
                conds.iter().any(|c| {
                    (c.type_ == "Ready" || c.type_ == "ContainersReady") && c.status == "True"
                })
            });
            if ready {
                InstanceReadiness::Ready
            } else {
                InstanceReadiness::Starting
            }
        }
        _ => InstanceReadiness::Pending,
    }
}

/// What was observed about the pod of one ordinal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodObservation {
    pub name: String,
    pub readiness: InstanceReadiness,
    /// Mounts certificate material older than the live secrets
    pub stale: bool,
    pub terminating: bool,
}

impl PodObservation {
    pub fn is_available(&self) -> bool {
        self.readiness == InstanceReadiness::Ready && !self.stale && !self.terminating
    }
}

/// Lifecycle phase and message of one ordinal
pub fn instance_phase(
    has_volume: bool,
    bootstrap: &BootstrapState,
    pod: Option<&PodObservation>,
) -> (InstancePhase, Option<String>) {
    if !has_volume {
        return (
            InstancePhase::NoVolume,
            Some("waiting for volume claim".to_string()),
        );
    }
    match bootstrap {
        BootstrapState::NotApplicable => (InstancePhase::NoVolume, None),
        BootstrapState::NeedsJob => (InstancePhase::VolumeProvisioned, None),
        BootstrapState::JobRunning => (InstancePhase::Bootstrapping, None),
        BootstrapState::JobFailed(message) => (
            InstancePhase::Failed,
            Some(format!("bootstrap failed: {}", message)),
        ),
        BootstrapState::JobSucceeded => match pod {
            None => (InstancePhase::Bootstrapped, None),
            Some(pod) if pod.terminating => (
                InstancePhase::Bootstrapped,
                Some("instance terminating".to_string()),
            ),
            Some(pod) if pod.stale => (
                InstancePhase::Bootstrapped,
                Some("certificate rotated, refresh pending".to_string()),
            ),
            Some(pod) => match pod.readiness {
                InstanceReadiness::Ready => (InstancePhase::Ready, None),
                InstanceReadiness::Failed => (
                    InstancePhase::Failed,
                    Some("instance process failed".to_string()),
                ),
                _ => (InstancePhase::Bootstrapped, None),
            },
        },
    }
}

/// Instance decisions for one pass
#[derive(Debug, Clone, Default)]
pub struct InstancePlan {
    pub to_create: Vec<Pod>,
    pub to_delete: Vec<String>,
    /// Pods whose role label must change
    pub to_relabel: Vec<Pod>,
    /// Stale pod deleted this pass so it is recreated with fresh certificates
    pub refresh: Option<String>,
    /// In-range pods, by ordinal
    pub pods: BTreeMap<i32, PodObservation>,
    pub target_primary: Option<i32>,
    /// Bootstrapped ordinals held back because certificate secrets are missing
    pub waiting_for_certificates: Vec<i32>,
    pub unexpected: Vec<String>,
}

impl InstancePlan {
    /// Ordinals whose pod is ready and current
    pub fn ready(&self) -> BTreeSet<i32> {
        self.pods
            .iter()
            .filter(|(_, pod)| pod.is_available())
            .map(|(ordinal, _)| *ordinal)
            .collect()
    }

    /// Live in-range pods
    pub fn live(&self) -> usize {
        self.pods.values().filter(|p| !p.terminating).count()
    }
}

/// Pick the target primary among the ordinals that have or will have a pod
///
/// The previous target is kept while it is still live, which avoids moving
/// the role when a lower ordinal reappears.
fn choose_target(
    previous: Option<i32>,
    live: &BTreeSet<i32>,
    creating: &BTreeSet<i32>,
) -> Option<i32> {
    if let Some(previous) = previous.filter(|p| live.contains(p)) {
        return Some(previous);
    }
    live.iter().next().or_else(|| creating.iter().next()).copied()
}

fn role_for(ordinal: i32, target: Option<i32>) -> InstanceRole {
    if Some(ordinal) == target {
        InstanceRole::Primary
    } else {
        InstanceRole::Replica
    }
}

/// Plan pods for the bootstrapped ordinals
///
/// `bootstrapped` holds the ordinals with bootstrap evidence in the pass-start
/// snapshot. `previous_target` is the target primary recorded in status.
pub fn ensure_instances(
    cluster: &PostgresCluster,
    bootstrapped: &BTreeSet<i32>,
    pods: &[Pod],
    secrets: &LiveSecretVersions,
    previous_target: Option<i32>,
    config: &OperatorConfig,
) -> InstancePlan {
    let cluster_name = cluster.name_any();
    let desired = cluster.spec.instances;
    let mut plan = InstancePlan::default();
    let mut live_pods = BTreeMap::new();

    for pod in pods {
        let name = pod.name_any();
        let terminating = pod.metadata.deletion_timestamp.is_some();
        match parse_instance_ordinal(&cluster_name, &name) {
            Some(ordinal) if ordinal <= desired => {
                plan.pods.insert(
                    ordinal,
                    PodObservation {
                        name,
                        readiness: classify_readiness(pod),
                        stale: pod_is_stale(pod, secrets),
                        terminating,
                    },
                );
                live_pods.insert(ordinal, pod);
            }
            // Scale-down removes compute, never storage
            Some(_) => {
                if !terminating {
                    plan.to_delete.push(name);
                }
            }
            None => plan.unexpected.push(name),
        }
    }

    let mut creating = BTreeSet::new();
    for ordinal in bootstrapped.iter().copied().filter(|o| *o <= desired) {
        if plan.pods.contains_key(&ordinal) {
            continue;
        }
        if secrets.complete() {
            creating.insert(ordinal);
        } else {
            plan.waiting_for_certificates.push(ordinal);
        }
    }

    // Failed processes never recover under restartPolicy Always; recreate them
    let failed: BTreeSet<i32> = plan
        .pods
        .iter()
        .filter(|(_, p)| !p.terminating && p.readiness == InstanceReadiness::Failed)
        .map(|(ordinal, _)| *ordinal)
        .collect();

    let live: BTreeSet<i32> = plan
        .pods
        .iter()
        .filter(|(ordinal, p)| !p.terminating && !failed.contains(*ordinal))
        .map(|(ordinal, _)| *ordinal)
        .collect();
    let target = choose_target(previous_target, &live, &creating);
    plan.target_primary = target;

    let annotations = secrets.pod_annotations();
    for ordinal in &creating {
        plan.to_create.push(generate_instance_pod(
            cluster,
            *ordinal,
            role_for(*ordinal, target),
            annotations.clone(),
            config,
        ));
    }

    for ordinal in &failed {
        if let Some(pod) = plan.pods.get(ordinal) {
            plan.to_delete.push(pod.name.clone());
        }
    }

    for ordinal in &live {
        let Some(pod) = live_pods.get(ordinal) else {
            continue;
        };
        let role = role_for(*ordinal, target).as_str();
        if pod.labels().get(LABEL_ROLE).map(String::as_str) != Some(role) {
            let mut relabeled = (*pod).clone();
            relabeled
                .labels_mut()
                .insert(LABEL_ROLE.to_string(), role.to_string());
            relabeled.status = None;
            plan.to_relabel.push(relabeled);
        }
    }

    plan.refresh = pick_refresh(&plan, bootstrapped, desired, secrets, target);
    if let Some(ref name) = plan.refresh {
        plan.to_relabel.retain(|p| p.name_any() != *name);
        plan.to_delete.push(name.clone());
    }
    plan
}

/// Choose at most one stale pod to delete this pass
fn pick_refresh(
    plan: &InstancePlan,
    bootstrapped: &BTreeSet<i32>,
    desired: i32,
    secrets: &LiveSecretVersions,
    target: Option<i32>,
) -> Option<String> {
    if !secrets.complete() {
        return None;
    }
    // Failed pods are already being replaced and pick up fresh certificates
    let stale: Vec<i32> = plan
        .pods
        .iter()
        .filter(|(_, p)| p.stale && !p.terminating && !plan.to_delete.contains(&p.name))
        .map(|(ordinal, _)| *ordinal)
        .collect();
    if stale.is_empty() {
        return None;
    }

    // Instances unavailable for reasons other than staleness
    let mut busy: BTreeSet<i32> = plan
        .pods
        .iter()
        .filter(|(_, p)| p.terminating || p.readiness != InstanceReadiness::Ready)
        .map(|(ordinal, _)| *ordinal)
        .collect();
    busy.extend(
        bootstrapped
            .iter()
            .filter(|o| **o <= desired && !plan.pods.contains_key(*o)),
    );

    let candidate = match busy.len() {
        0 => stale
            .iter()
            .rev()
            .find(|o| Some(**o) != target)
            .or_else(|| stale.first())
            .copied(),
        // The only unavailable instance is itself stale; replacing it costs nothing
        1 => busy.iter().next().copied().filter(|o| stale.contains(o)),
        _ => None,
    };
    candidate.and_then(|o| plan.pods.get(&o).map(|p| p.name.clone()))
}
