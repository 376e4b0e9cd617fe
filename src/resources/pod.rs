//! Instance pods running the PostgreSQL server process
//!
//! One pod per bootstrapped ordinal, mounting that ordinal's volume claim and
//! the certificate secrets configured on the cluster.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, ExecAction, PersistentVolumeClaimVolumeSource, Pod,
    PodSecurityContext, PodSpec, Probe, SecretVolumeSource, SecurityContext, Volume, VolumeMount,
};
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::config::OperatorConfig;
use crate::crd::{CertificatesConfiguration, PostgresCluster};
use crate::resources::common::{
    Component, InstanceRole, LABEL_ROLE, instance_labels, instance_name, owner_reference,
};
use crate::resources::job::{DATA_MOUNT_PATH, PGDATA, postgres_image};

/// PostgreSQL listen port
pub const POSTGRES_PORT: i32 = 5432;

const SERVER_CA_PATH: &str = "/tls/server-ca";
const CLIENT_CA_PATH: &str = "/tls/client-ca";
const SERVER_TLS_PATH: &str = "/tls/server";
const REPLICATION_TLS_PATH: &str = "/tls/replication";

/// Secret volumes for every configured certificate secret
fn certificate_volumes(certs: &CertificatesConfiguration) -> Vec<(Volume, VolumeMount)> {
    let mut secrets = vec![
        ("server-ca", certs.server_ca_secret.clone(), SERVER_CA_PATH),
        ("client-ca", certs.client_ca_secret.clone(), CLIENT_CA_PATH),
    ];
    if let Some(ref secret) = certs.server_tls_secret {
        secrets.push(("server-tls", secret.clone(), SERVER_TLS_PATH));
    }
    if let Some(ref secret) = certs.replication_tls_secret {
        secrets.push(("replication-tls", secret.clone(), REPLICATION_TLS_PATH));
    }

    secrets
        .into_iter()
        .map(|(volume, secret, path)| {
            (
                Volume {
                    name: volume.to_string(),
                    secret: Some(SecretVolumeSource {
                        secret_name: Some(secret),
                        default_mode: Some(0o600),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                VolumeMount {
                    name: volume.to_string(),
                    mount_path: path.to_string(),
                    read_only: Some(true),
                    ..Default::default()
                },
            )
        })
        .collect()
}

fn server_args(certs: Option<&CertificatesConfiguration>) -> Vec<String> {
    let mut args = vec!["postgres".to_string(), "-D".to_string(), PGDATA.to_string()];
    if let Some(certs) = certs {
        args.extend([
            "-c".to_string(),
            format!("ssl_ca_file={}/ca.crt", CLIENT_CA_PATH),
        ]);
        if certs.server_tls_secret.is_some() {
            args.extend([
                "-c".to_string(),
                "ssl=on".to_string(),
                "-c".to_string(),
                format!("ssl_cert_file={}/tls.crt", SERVER_TLS_PATH),
                "-c".to_string(),
                format!("ssl_key_file={}/tls.key", SERVER_TLS_PATH),
            ]);
        }
    }
    args
}

/// Generate the instance pod for an ordinal
///
/// `annotations` carries the certificate versions the pod is created
/// against; a later mismatch with the live secrets marks it for refresh.
pub fn generate_instance_pod(
    cluster: &PostgresCluster,
    ordinal: i32,
    role: InstanceRole,
    annotations: BTreeMap<String, String>,
    config: &OperatorConfig,
) -> Pod {
    let cluster_name = cluster.name_any();
    let name = instance_name(&cluster_name, ordinal);

    let mut labels = instance_labels(&cluster_name, ordinal, Component::Instance);
    labels.insert(LABEL_ROLE.to_string(), role.as_str().to_string());

    let mut volumes = vec![Volume {
        name: "pgdata".to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: name.clone(),
            read_only: Some(false),
        }),
        ..Default::default()
    }];
    let mut volume_mounts = vec![VolumeMount {
        name: "pgdata".to_string(),
        mount_path: DATA_MOUNT_PATH.to_string(),
        ..Default::default()
    }];

    let certs = cluster.spec.certificates.as_ref();
    if let Some(certs) = certs {
        for (volume, mount) in certificate_volumes(certs) {
            volumes.push(volume);
            volume_mounts.push(mount);
        }
    }

    let readiness_probe = Probe {
        exec: Some(ExecAction {
            command: Some(vec![
                "pg_isready".to_string(),
                "-h".to_string(),
                "localhost".to_string(),
                "-p".to_string(),
                POSTGRES_PORT.to_string(),
            ]),
        }),
        initial_delay_seconds: Some(5),
        period_seconds: Some(10),
        timeout_seconds: Some(5),
        failure_threshold: Some(3),
        ..Default::default()
    };

    let container = Container {
        name: "postgres".to_string(),
        image: Some(postgres_image(cluster, config)),
        image_pull_policy: Some("IfNotPresent".to_string()),
        args: Some(server_args(certs)),
        ports: Some(vec![ContainerPort {
            container_port: POSTGRES_PORT,
            name: Some("postgresql".to_string()),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        env: Some(vec![EnvVar {
            name: "PGDATA".to_string(),
            value: Some(PGDATA.to_string()),
            ..Default::default()
        }]),
        volume_mounts: Some(volume_mounts),
        readiness_probe: Some(readiness_probe),
        security_context: Some(SecurityContext {
            run_as_non_root: Some(true),
            allow_privilege_escalation: Some(false),
            ..Default::default()
        }),
        ..Default::default()
    };

    Pod {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: cluster.namespace(),
            labels: Some(labels),
            annotations: (!annotations.is_empty()).then_some(annotations),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            hostname: Some(name),
            containers: vec![container],
            volumes: Some(volumes),
            restart_policy: Some("Always".to_string()),
            termination_grace_period_seconds: Some(30),
            security_context: Some(PodSecurityContext {
                run_as_user: Some(26),
                run_as_group: Some(26),
                fs_group: Some(26),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}
