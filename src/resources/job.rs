//! Bootstrap jobs that initialize a data volume
//!
//! Ordinal 1 runs `initdb` to create a new data directory. Every other
//! ordinal clones the primary with `pg_basebackup` through the read-write
//! service.

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec,
    SecretVolumeSource, SecurityContext, Volume, VolumeMount,
};
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::config::OperatorConfig;
use crate::crd::{PoolerType, PostgresCluster};
use crate::resources::common::{
    BootstrapMethod, Component, instance_labels, instance_name, job_name, owner_reference,
    service_endpoint,
};

/// Mount point of the data volume
pub const DATA_MOUNT_PATH: &str = "/var/lib/postgresql/data";

/// Data directory inside the volume
pub const PGDATA: &str = "/var/lib/postgresql/data/pgdata";

/// Mount point of the replication client certificate
const REPLICATION_TLS_PATH: &str = "/tls/replication";

/// Image used for a cluster's instances and jobs
pub fn postgres_image(cluster: &PostgresCluster, config: &OperatorConfig) -> String {
    cluster
        .spec
        .image_name
        .clone()
        .unwrap_or_else(|| config.postgres_image.clone())
}

fn bootstrap_command(cluster_name: &str, method: BootstrapMethod, tls: bool) -> Vec<String> {
    let script = match method {
        BootstrapMethod::Initdb => format!(
            "test -f {pgdata}/PG_VERSION || initdb --pgdata={pgdata} --auth-local=peer --auth-host=scram-sha-256",
            pgdata = PGDATA
        ),
        BootstrapMethod::Join => {
            let sslmode = if tls {
                format!(
                    " sslmode=verify-ca sslcert={dir}/tls.crt sslkey={dir}/tls.key sslrootcert={dir}/ca.crt",
                    dir = REPLICATION_TLS_PATH
                )
            } else {
                String::new()
            };
            format!(
                "test -f {pgdata}/PG_VERSION || pg_basebackup --pgdata={pgdata} --wal-method=stream --write-recovery-conf --dbname='host={host} user=streaming_replica{sslmode}'",
                pgdata = PGDATA,
                host = service_endpoint(cluster_name, PoolerType::Rw),
                sslmode = sslmode
            )
        }
    };
    vec!["/bin/sh".to_string(), "-c".to_string(), script]
}

/// Generate the bootstrap job for an ordinal
pub fn generate_bootstrap_job(
    cluster: &PostgresCluster,
    ordinal: i32,
    config: &OperatorConfig,
) -> Job {
    let cluster_name = cluster.name_any();
    let method = BootstrapMethod::for_ordinal(ordinal);
    let labels = instance_labels(&cluster_name, ordinal, Component::Bootstrap);

    let mut volumes = vec![Volume {
        name: "pgdata".to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: instance_name(&cluster_name, ordinal),
            read_only: Some(false),
        }),
        ..Default::default()
    }];
    let mut volume_mounts = vec![VolumeMount {
        name: "pgdata".to_string(),
        mount_path: DATA_MOUNT_PATH.to_string(),
        ..Default::default()
    }];

    let replication_secret = cluster
        .spec
        .certificates
        .as_ref()
        .and_then(|c| c.replication_tls_secret.clone());
    let tls = method == BootstrapMethod::Join && replication_secret.is_some();
    if let (true, Some(secret)) = (tls, replication_secret) {
        volumes.push(Volume {
            name: "replication-tls".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret),
                default_mode: Some(0o600),
                ..Default::default()
            }),
            ..Default::default()
        });
        volume_mounts.push(VolumeMount {
            name: "replication-tls".to_string(),
            mount_path: REPLICATION_TLS_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        });
    }

    let container = Container {
        name: "bootstrap".to_string(),
        image: Some(postgres_image(cluster, config)),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(bootstrap_command(&cluster_name, method, tls)),
        env: Some(vec![EnvVar {
            name: "PGDATA".to_string(),
            value: Some(PGDATA.to_string()),
            ..Default::default()
        }]),
        volume_mounts: Some(volume_mounts),
        security_context: Some(SecurityContext {
            run_as_non_root: Some(true),
            allow_privilege_escalation: Some(false),
            ..Default::default()
        }),
        ..Default::default()
    };

    Job {
        metadata: ObjectMeta {
            name: Some(job_name(&cluster_name, ordinal)),
            namespace: cluster.namespace(),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(config.bootstrap_backoff_limit),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    containers: vec![container],
                    volumes: Some(volumes),
                    security_context: Some(k8s_openapi::api::core::v1::PodSecurityContext {
                        run_as_user: Some(26),
                        run_as_group: Some(26),
                        fs_group: Some(26),
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
