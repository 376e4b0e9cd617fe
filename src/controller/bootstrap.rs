//! Bootstrap job management
//!
//! Every ordinal with a volume gets exactly one bootstrap job unless there is
//! evidence the volume was already initialized. Failed jobs are reported and
//! left in place; retrying could corrupt a partially initialized volume.
//! Deleting the failed job re-arms the ordinal.
//!
//! Success is durable. The first pass that observes a succeeded job marks the
//! volume claim, and a live instance pod counts as evidence too, so deleting
//! the job never leads to a second bootstrap.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::ResourceExt;

use crate::config::OperatorConfig;
use crate::controller::storage::VolumePlan;
use crate::crd::{BootstrapFailure, PostgresCluster};
use crate::resources::common::{instance_name, parse_instance_ordinal, parse_job_ordinal};
use crate::resources::job::generate_bootstrap_job;
use crate::resources::pvc::{mark_pvc_ready, pvc_is_ready};

/// Bootstrap state of one ordinal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapState {
    /// No volume yet
    NotApplicable,
    /// Volume exists, no job and no evidence of initialization
    NeedsJob,
    JobRunning,
    JobSucceeded,
    /// Terminal until the job is removed externally
    JobFailed(String),
}

impl BootstrapState {
    pub fn is_succeeded(&self) -> bool {
        matches!(self, BootstrapState::JobSucceeded)
    }
}

/// What a job object reports about its run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Running,
    Succeeded,
    Failed(String),
}

/// Classify a job from its status
///
/// Success is `succeeded >= 1` or a true `Complete` condition. Failure is a
/// true `Failed` condition, or more failed pods than the backoff limit allows.
pub fn job_outcome(job: &Job) -> JobOutcome {
    let Some(status) = job.status.as_ref() else {
        return JobOutcome::Running;
    };
    let condition = |type_: &str| {
        status
            .conditions
            .as_ref()
            .and_then(|conds| conds.iter().find(|c| c.type_ == type_ && c.status == "True"))
    };

    if status.succeeded.unwrap_or(0) >= 1 || condition("Complete").is_some() {
        return JobOutcome::Succeeded;
    }
    if let Some(failed) = condition("Failed") {
        let message = failed
            .message
            .clone()
            .or_else(|| failed.reason.clone())
            .unwrap_or_else(|| "bootstrap job failed".to_string());
        return JobOutcome::Failed(message);
    }

    let backoff_limit = job.spec.as_ref().and_then(|s| s.backoff_limit).unwrap_or(6);
    let failed = status.failed.unwrap_or(0);
    if failed > backoff_limit {
        return JobOutcome::Failed(format!("{} failed attempts", failed));
    }
    JobOutcome::Running
}

/// Decide the bootstrap state of one ordinal
///
/// Evidence of completed initialization wins over whatever the job reports,
/// which makes success one-way.
pub fn ensure_bootstrap(
    has_volume: bool,
    has_completed_bootstrap: bool,
    job: Option<&JobOutcome>,
) -> BootstrapState {
    if !has_volume {
        return BootstrapState::NotApplicable;
    }
    if has_completed_bootstrap {
        return BootstrapState::JobSucceeded;
    }
    match job {
        None => BootstrapState::NeedsJob,
        Some(JobOutcome::Running) => BootstrapState::JobRunning,
        Some(JobOutcome::Succeeded) => BootstrapState::JobSucceeded,
        Some(JobOutcome::Failed(message)) => BootstrapState::JobFailed(message.clone()),
    }
}

/// Bootstrap decisions for every ordinal
#[derive(Debug, Clone, Default)]
pub struct BootstrapPlan {
    pub states: BTreeMap<i32, BootstrapState>,
    pub to_create: Vec<Job>,
    /// Claims to annotate as initialized
    pub to_mark: Vec<PersistentVolumeClaim>,
    /// Jobs for ordinals beyond the desired range
    pub to_delete: Vec<String>,
    /// In-range jobs still present, by ordinal
    pub jobs: BTreeMap<i32, String>,
    pub failures: Vec<BootstrapFailure>,
    pub unexpected: Vec<String>,
}

impl BootstrapPlan {
    /// Ordinals whose volume is known to hold an initialized database
    pub fn bootstrapped(&self) -> BTreeSet<i32> {
        self.states
            .iter()
            .filter(|(_, state)| state.is_succeeded())
            .map(|(ordinal, _)| *ordinal)
            .collect()
    }
}

/// Plan bootstrap jobs for the ordinals with a usable volume
pub fn plan_bootstrap(
    cluster: &PostgresCluster,
    volumes: &VolumePlan,
    jobs: &[Job],
    pods: &[Pod],
    config: &OperatorConfig,
) -> BootstrapPlan {
    let cluster_name = cluster.name_any();
    let desired = cluster.spec.instances;
    let mut plan = BootstrapPlan::default();

    let mut live_jobs = BTreeMap::new();
    for job in jobs {
        let name = job.name_any();
        match parse_job_ordinal(&cluster_name, &name) {
            Some(ordinal) if ordinal <= desired => {
                live_jobs.insert(ordinal, job);
            }
            Some(_) => {
                if job.metadata.deletion_timestamp.is_none() {
                    plan.to_delete.push(name);
                }
            }
            None => plan.unexpected.push(name),
        }
    }

    let pod_ordinals: BTreeSet<i32> = pods
        .iter()
        .filter_map(|pod| parse_instance_ordinal(&cluster_name, &pod.name_any()))
        .collect();

    for ordinal in 1..=desired {
        let pvc = volumes.provisioned.get(&ordinal);
        let job = live_jobs.get(&ordinal);
        let outcome = job.map(|j| job_outcome(j));
        let evidence = pvc.is_some_and(pvc_is_ready) || pod_ordinals.contains(&ordinal);

        let state = ensure_bootstrap(pvc.is_some(), evidence, outcome.as_ref());
        match &state {
            BootstrapState::NeedsJob => {
                plan.to_create
                    .push(generate_bootstrap_job(cluster, ordinal, config));
            }
            BootstrapState::JobSucceeded => {
                if let Some(pvc) = pvc.filter(|p| !pvc_is_ready(p)) {
                    plan.to_mark.push(mark_pvc_ready(pvc));
                }
            }
            BootstrapState::JobFailed(message) => {
                plan.failures.push(BootstrapFailure {
                    instance: instance_name(&cluster_name, ordinal),
                    job: job.map(|j| j.name_any()).unwrap_or_default(),
                    message: message.clone(),
                });
            }
            BootstrapState::NotApplicable | BootstrapState::JobRunning => {}
        }
        if let Some(job) = job {
            plan.jobs.insert(ordinal, job.name_any());
        }
        plan.states.insert(ordinal, state);
    }

    plan.to_delete.sort();
    plan.unexpected.sort();
    plan
}
