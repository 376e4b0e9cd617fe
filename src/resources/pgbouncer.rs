//! PgBouncer deployments for PostgresPooler resources
//!
//! Each pooler runs a Deployment of PgBouncer processes forwarding to one
//! cluster service. The Bitnami image is configured entirely through
//! environment variables, so no config map is generated.
//!
//! The pod template carries the convergence-relevant settings as annotations.
//! The reconciler compares those (plus the replica count) against the live
//! deployment, which keeps platform-injected fields out of the diff.
//!
//! Reference: https://www.pgbouncer.org/

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{
    Affinity, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, PodAffinityTerm,
    PodAntiAffinity, PodSpec, PodTemplateSpec, Probe, SecurityContext, TCPSocketAction, Volume,
    VolumeMount, WeightedPodAffinityTerm,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::config::OperatorConfig;
use crate::crd::{PoolMode, PostgresPooler};
use crate::resources::common::{
    Component, LABEL_COMPONENT, LABEL_POOLER, owner_reference, pooler_labels,
};
use crate::resources::pod::POSTGRES_PORT;

/// PgBouncer listen port
pub const PGBOUNCER_PORT: i32 = 6432;

pub const ANNOTATION_POOL_MODE: &str = "postgres-operator.smoketurner.com/pool-mode";
pub const ANNOTATION_TARGET_ENDPOINT: &str = "postgres-operator.smoketurner.com/target-endpoint";
pub const ANNOTATION_PARAMETERS: &str = "postgres-operator.smoketurner.com/pgbouncer-parameters";

/// The fields of a pooler deployment that decide whether it has converged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentFingerprint {
    pub replicas: i32,
    pub pool_mode: Option<PoolMode>,
    pub target_endpoint: Option<String>,
    pub parameters: Option<String>,
}

impl DeploymentFingerprint {
    /// Extract the fingerprint of a deployment
    ///
    /// Absent replicas count as 1, the platform default.
    pub fn of(deployment: &Deployment) -> Self {
        let spec = deployment.spec.as_ref();
        let annotations = spec
            .and_then(|s| s.template.metadata.as_ref())
            .and_then(|m| m.annotations.as_ref());
        let annotation = |key: &str| annotations.and_then(|a| a.get(key)).cloned();

        Self {
            replicas: spec.and_then(|s| s.replicas).unwrap_or(1),
            pool_mode: annotation(ANNOTATION_POOL_MODE).and_then(|m| m.parse().ok()),
            target_endpoint: annotation(ANNOTATION_TARGET_ENDPOINT),
            parameters: annotation(ANNOTATION_PARAMETERS),
        }
    }
}

/// Render PgBouncer parameters as a stable `key=value` list
fn render_parameters(parameters: &BTreeMap<String, String>) -> String {
    parameters
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Selector of the pods of a pooler; immutable once the deployment exists
fn pooler_selector(pooler_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_POOLER.to_string(), pooler_name.to_string()),
        (LABEL_COMPONENT.to_string(), Component::Pooler.as_str().to_string()),
    ])
}

/// Generate anti-affinity for PgBouncer pods
fn generate_pgbouncer_anti_affinity(pooler_name: &str) -> Affinity {
    Affinity {
        pod_anti_affinity: Some(PodAntiAffinity {
            preferred_during_scheduling_ignored_during_execution: Some(vec![
                WeightedPodAffinityTerm {
                    weight: 100,
                    pod_affinity_term: PodAffinityTerm {
                        label_selector: Some(LabelSelector {
                            match_labels: Some(pooler_selector(pooler_name)),
                            ..Default::default()
                        }),
                        topology_key: "kubernetes.io/hostname".to_string(),
                        ..Default::default()
                    },
                },
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

/// Generate the PgBouncer Deployment for a pooler
///
/// `target_endpoint` is the cluster service resolved for the pooler type.
pub fn generate_pooler_deployment(
    pooler: &PostgresPooler,
    target_endpoint: &str,
    config: &OperatorConfig,
) -> Deployment {
    let pooler_name = pooler.name_any();
    let cluster_name = &pooler.spec.cluster.name;
    let labels = pooler_labels(&pooler_name, cluster_name);
    let pgbouncer = &pooler.spec.pgbouncer;
    let pool_mode = pgbouncer.pool_mode;

    let mut template_labels = labels.clone();
    template_labels.extend(pooler_selector(&pooler_name));

    let mut annotations = BTreeMap::from([
        (ANNOTATION_POOL_MODE.to_string(), pool_mode.to_string()),
        (
            ANNOTATION_TARGET_ENDPOINT.to_string(),
            target_endpoint.to_string(),
        ),
    ]);
    if !pgbouncer.parameters.is_empty() {
        annotations.insert(
            ANNOTATION_PARAMETERS.to_string(),
            render_parameters(&pgbouncer.parameters),
        );
    }

    // Bitnami PgBouncer image needs writable directories for initialization
    let volumes = vec![
        Volume {
            name: "pgbouncer-config".to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
        Volume {
            name: "pgbouncer-tmp".to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
    ];
    let volume_mounts = vec![
        VolumeMount {
            name: "pgbouncer-config".to_string(),
            mount_path: "/opt/bitnami/pgbouncer/conf".to_string(),
            ..Default::default()
        },
        VolumeMount {
            name: "pgbouncer-tmp".to_string(),
            mount_path: "/opt/bitnami/pgbouncer/tmp".to_string(),
            ..Default::default()
        },
    ];

    let mut env_vars = vec![
        env("PGBOUNCER_DATABASE", "*"),
        env("PGBOUNCER_PORT", PGBOUNCER_PORT.to_string()),
        env("POSTGRESQL_HOST", target_endpoint),
        env("POSTGRESQL_PORT", POSTGRES_PORT.to_string()),
        env("POSTGRESQL_USERNAME", "postgres"),
        env("PGBOUNCER_POOL_MODE", pool_mode.as_str()),
    ];
    for (key, value) in &pgbouncer.parameters {
        env_vars.push(env(
            &format!("PGBOUNCER_{}", key.to_uppercase()),
            value.clone(),
        ));
    }

    let tcp_probe = |initial_delay: i32, failure_threshold: i32| Probe {
        tcp_socket: Some(TCPSocketAction {
            port: IntOrString::Int(PGBOUNCER_PORT),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay),
        period_seconds: Some(10),
        timeout_seconds: Some(5),
        success_threshold: Some(1),
        failure_threshold: Some(failure_threshold),
        ..Default::default()
    };

    let container = Container {
        name: "pgbouncer".to_string(),
        image: Some(config.pgbouncer_image.clone()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        ports: Some(vec![ContainerPort {
            container_port: PGBOUNCER_PORT,
            name: Some("pgbouncer".to_string()),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        env: Some(env_vars),
        volume_mounts: Some(volume_mounts),
        readiness_probe: Some(tcp_probe(5, 3)),
        liveness_probe: Some(tcp_probe(30, 6)),
        security_context: Some(SecurityContext {
            run_as_user: Some(1001), // bitnami pgbouncer user
            run_as_group: Some(1001),
            run_as_non_root: Some(true),
            allow_privilege_escalation: Some(false),
            ..Default::default()
        }),
        ..Default::default()
    };

    Deployment {
        metadata: ObjectMeta {
            name: Some(pooler_name.clone()),
            namespace: pooler.namespace(),
            labels: Some(labels),
            owner_references: Some(vec![owner_reference(pooler)]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(pooler.spec.instances),
            selector: LabelSelector {
                match_labels: Some(pooler_selector(&pooler_name)),
                ..Default::default()
            },
            strategy: Some(DeploymentStrategy {
                type_: Some("RollingUpdate".to_string()),
                ..Default::default()
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(template_labels),
                    annotations: Some(annotations),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(volumes),
                    termination_grace_period_seconds: Some(10),
                    affinity: Some(generate_pgbouncer_anti_affinity(&pooler_name)),
                    security_context: Some(k8s_openapi::api::core::v1::PodSecurityContext {
                        fs_group: Some(1001),
                        run_as_user: Some(1001),
                        run_as_group: Some(1001),
                        seccomp_profile: Some(k8s_openapi::api::core::v1::SeccompProfile {
                            type_: "RuntimeDefault".to_string(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Replace the convergence-relevant fields of a live deployment
///
/// Everything else on the live object (resource version, platform
/// annotations, defaulted fields) is preserved.
pub fn apply_desired(desired: &Deployment, live: &Deployment) -> Deployment {
    let mut updated = live.clone();
    updated.status = None;
    if let (Some(desired_spec), Some(live_spec)) = (desired.spec.as_ref(), updated.spec.as_mut())
    {
        live_spec.replicas = desired_spec.replicas;
        live_spec.template.spec = desired_spec.template.spec.clone();
        let desired_meta = desired_spec.template.metadata.clone().unwrap_or_default();
        let live_meta = live_spec.template.metadata.get_or_insert_with(ObjectMeta::default);
        let live_annotations = live_meta.annotations.get_or_insert_with(BTreeMap::new);
        live_annotations.remove(ANNOTATION_PARAMETERS);
        live_annotations.extend(desired_meta.annotations.unwrap_or_default());
        live_meta
            .labels
            .get_or_insert_with(BTreeMap::new)
            .extend(desired_meta.labels.unwrap_or_default());
    } else {
        updated.spec = desired.spec.clone();
    }
    updated
}
