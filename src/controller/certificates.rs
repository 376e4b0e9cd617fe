//! Certificate lifecycle bookkeeping
//!
//! The operator never issues certificates. It records the resource version of
//! every configured certificate secret in status and compares it with the live
//! secret on each pass. A changed version means the secret was rotated
//! externally.
//!
//! Instance pods are annotated with the versions they were created against,
//! so a pod mounting outdated material can be identified without reading the
//! secret contents.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

use crate::crd::{
    CertificatesConfiguration, ConfigMapResourceVersion, PostgresCluster, SecretsResourceVersion,
};

/// Role a tracked secret plays for the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SecretRole {
    ServerCa,
    ClientCa,
    ServerTls,
    ReplicationTls,
}

impl SecretRole {
    /// Pod annotation holding the version a pod was created against
    pub fn annotation(&self) -> &'static str {
        match self {
            SecretRole::ServerCa => "postgres-operator.smoketurner.com/server-ca-version",
            SecretRole::ClientCa => "postgres-operator.smoketurner.com/client-ca-version",
            SecretRole::ServerTls => "postgres-operator.smoketurner.com/server-tls-version",
            SecretRole::ReplicationTls => {
                "postgres-operator.smoketurner.com/replication-tls-version"
            }
        }
    }
}

/// A secret the cluster depends on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedSecret {
    pub role: SecretRole,
    pub name: String,
}

/// Every secret named in the certificate configuration
pub fn tracked_secrets(certs: Option<&CertificatesConfiguration>) -> Vec<TrackedSecret> {
    let Some(certs) = certs else {
        return Vec::new();
    };
    let mut secrets = vec![
        TrackedSecret {
            role: SecretRole::ServerCa,
            name: certs.server_ca_secret.clone(),
        },
        TrackedSecret {
            role: SecretRole::ClientCa,
            name: certs.client_ca_secret.clone(),
        },
    ];
    if let Some(ref name) = certs.server_tls_secret {
        secrets.push(TrackedSecret {
            role: SecretRole::ServerTls,
            name: name.clone(),
        });
    }
    if let Some(ref name) = certs.replication_tls_secret {
        secrets.push(TrackedSecret {
            role: SecretRole::ReplicationTls,
            name: name.clone(),
        });
    }
    secrets
}

/// Every config map named in the monitoring configuration
pub fn tracked_config_maps(cluster: &PostgresCluster) -> Vec<String> {
    let mut names: Vec<String> = cluster
        .spec
        .monitoring
        .as_ref()
        .map(|m| m.custom_queries_config_map.clone())
        .unwrap_or_default();
    names.sort();
    names.dedup();
    names
}

/// Live resource versions keyed by role, for the secrets that exist
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveSecretVersions {
    pub versions: BTreeMap<SecretRole, String>,
    pub names: BTreeMap<SecretRole, String>,
    pub missing: Vec<String>,
}

impl LiveSecretVersions {
    /// Pair the tracked secrets with the versions observed this pass
    ///
    /// `observed` maps secret name to resource version for secrets that exist.
    pub fn observe(tracked: &[TrackedSecret], observed: &BTreeMap<String, String>) -> Self {
        let mut live = Self::default();
        for secret in tracked {
            live.names.insert(secret.role, secret.name.clone());
            match observed.get(&secret.name) {
                Some(version) => {
                    live.versions.insert(secret.role, version.clone());
                }
                None => live.missing.push(secret.name.clone()),
            }
        }
        live
    }

    /// Whether every tracked secret exists
    pub fn complete(&self) -> bool {
        self.missing.is_empty()
    }

    /// Status watermark for these versions
    pub fn watermark(&self) -> SecretsResourceVersion {
        SecretsResourceVersion {
            server_ca_version: self.versions.get(&SecretRole::ServerCa).cloned(),
            client_ca_version: self.versions.get(&SecretRole::ClientCa).cloned(),
            server_secret_version: self.versions.get(&SecretRole::ServerTls).cloned(),
            replication_secret_version: self.versions.get(&SecretRole::ReplicationTls).cloned(),
        }
    }

    /// Annotations stamped on a pod created against these versions
    pub fn pod_annotations(&self) -> BTreeMap<String, String> {
        self.versions
            .iter()
            .map(|(role, version)| (role.annotation().to_string(), version.clone()))
            .collect()
    }
}

fn recorded_version(watermark: &SecretsResourceVersion, role: SecretRole) -> Option<&String> {
    match role {
        SecretRole::ServerCa => watermark.server_ca_version.as_ref(),
        SecretRole::ClientCa => watermark.client_ca_version.as_ref(),
        SecretRole::ServerTls => watermark.server_secret_version.as_ref(),
        SecretRole::ReplicationTls => watermark.replication_secret_version.as_ref(),
    }
}

/// Names of the secrets whose live version differs from the recorded watermark
///
/// A secret with no recorded watermark is a first observation, not a
/// rotation. Once the new version is written to status the secret drops out
/// of the set, so each version change is reported exactly once.
pub fn check_rotation(
    watermark: &SecretsResourceVersion,
    live: &LiveSecretVersions,
) -> BTreeSet<String> {
    live.versions
        .iter()
        .filter(|(role, version)| {
            recorded_version(watermark, **role).is_some_and(|recorded| recorded != *version)
        })
        .filter_map(|(role, _)| live.names.get(role).cloned())
        .collect()
}

/// Names of the config maps whose live version differs from the watermark
pub fn check_config_map_rotation(
    watermark: &ConfigMapResourceVersion,
    live: &BTreeMap<String, String>,
) -> BTreeSet<String> {
    live.iter()
        .filter(|(name, version)| {
            watermark
                .metrics
                .get(*name)
                .is_some_and(|recorded| recorded != *version)
        })
        .map(|(name, _)| name.clone())
        .collect()
}

/// Whether a pod mounts certificate material older than the live secrets
///
/// Missing annotations count as stale: the pod predates the secret being
/// configured or tracked.
pub fn pod_is_stale(pod: &Pod, live: &LiveSecretVersions) -> bool {
    let annotations = pod.annotations();
    live.versions
        .iter()
        .any(|(role, version)| annotations.get(role.annotation()) != Some(version))
}
