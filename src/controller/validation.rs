//! Validation of PostgresCluster and PostgresPooler specs
//!
//! A spec that fails validation is an irrecoverable configuration error: the
//! reconciler reports it in status and takes no mutating action until the
//! spec is corrected.

use kube::ResourceExt;

use crate::controller::error::{Error, Result};
use crate::crd::{PostgresCluster, PostgresPooler};

/// Minimum number of instances
pub const MIN_INSTANCES: i32 = 1;

/// Longest cluster name whose derived child names stay valid DNS labels
pub const MAX_CLUSTER_NAME_LENGTH: usize = 50;

/// Validate the cluster spec
pub fn validate_spec(cluster: &PostgresCluster) -> Result<()> {
    validate_name(&cluster.name_any())?;
    validate_instances(cluster.spec.instances)?;
    validate_storage(&cluster.spec.storage.size)?;
    validate_certificates(cluster)?;
    validate_monitoring(cluster)?;
    Ok(())
}

fn validate_name(name: &str) -> Result<()> {
    if name.len() > MAX_CLUSTER_NAME_LENGTH {
        return Err(Error::ValidationError(format!(
            "cluster name {} is longer than {} characters",
            name, MAX_CLUSTER_NAME_LENGTH
        )));
    }
    Ok(())
}

/// Validate instance count
fn validate_instances(instances: i32) -> Result<()> {
    if instances < MIN_INSTANCES {
        return Err(Error::ValidationError(format!(
            "instance count {} is below minimum {}",
            instances, MIN_INSTANCES
        )));
    }

    Ok(())
}

/// Validate a storage size as a Kubernetes quantity (e.g. "1G", "10Gi", "1.5Ti")
fn validate_storage(size: &str) -> Result<()> {
    const SUFFIXES: [&str; 13] = [
        "Ki", "Mi", "Gi", "Ti", "Pi", "Ei", "k", "M", "G", "T", "P", "E", "",
    ];

    let suffix = SUFFIXES
        .iter()
        .find(|s| size.ends_with(*s))
        .copied()
        .unwrap_or_default();
    let number = &size[..size.len() - suffix.len()];

    let valid = !number.is_empty()
        && number.bytes().all(|b| b.is_ascii_digit() || b == b'.')
        && number.matches('.').count() <= 1
        && number.parse::<f64>().is_ok_and(|n| n > 0.0);
    if !valid {
        return Err(Error::ValidationError(format!(
            "invalid storage size: {:?}",
            size
        )));
    }
    Ok(())
}

fn validate_certificates(cluster: &PostgresCluster) -> Result<()> {
    let Some(certs) = cluster.spec.certificates.as_ref() else {
        return Ok(());
    };
    let names = [
        ("serverCASecret", Some(&certs.server_ca_secret)),
        ("clientCASecret", Some(&certs.client_ca_secret)),
        ("serverTLSSecret", certs.server_tls_secret.as_ref()),
        ("replicationTLSSecret", certs.replication_tls_secret.as_ref()),
    ];
    for (field, name) in names {
        if name.is_some_and(|n| n.trim().is_empty()) {
            return Err(Error::ValidationError(format!(
                "certificates.{} must not be empty",
                field
            )));
        }
    }
    Ok(())
}

fn validate_monitoring(cluster: &PostgresCluster) -> Result<()> {
    let names = cluster
        .spec
        .monitoring
        .as_ref()
        .map(|m| m.custom_queries_config_map.as_slice())
        .unwrap_or_default();
    if names.iter().any(|n| n.trim().is_empty()) {
        return Err(Error::ValidationError(
            "monitoring.customQueriesConfigMap entries must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// Validate the pooler spec
pub fn validate_pooler_spec(pooler: &PostgresPooler) -> Result<()> {
    if pooler.spec.cluster.name.trim().is_empty() {
        return Err(Error::ValidationError(
            "cluster.name must not be empty".to_string(),
        ));
    }
    if pooler.spec.instances < 0 {
        return Err(Error::ValidationError(format!(
            "pooler instance count {} must not be negative",
            pooler.spec.instances
        )));
    }
    Ok(())
}
