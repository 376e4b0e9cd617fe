//! Reconciliation passes for PostgresPooler against an in-memory store

use pgcluster_operator::controller::error::{Error, Requeue};
use pgcluster_operator::controller::store::{ChildKind, ObjectKey};
use pgcluster_operator::crd::{PoolMode, PoolerType};
use pgcluster_operator::resources::pgbouncer::DeploymentFingerprint;

use crate::common::*;

/// A converged single instance cluster named `pg`
async fn converged_cluster(harness: &Harness) -> ObjectKey {
    let key = harness
        .store
        .put_cluster(create_test_cluster("pg", "default", 1));
    harness.converge(&key).await;
    key
}

fn fingerprint(harness: &Harness, name: &str) -> DeploymentFingerprint {
    let deployment = harness
        .store
        .object(ChildKind::Deployment, "default", name)
        .and_then(|o| o.into_deployment())
        .unwrap();
    DeploymentFingerprint::of(&deployment)
}

fn condition_status(harness: &Harness, key: &ObjectKey, type_: &str) -> Option<String> {
    harness
        .store
        .pooler_status(key)
        .conditions
        .iter()
        .find(|c| c.type_ == type_)
        .map(|c| c.status.clone())
}

mod deployment_tests {
    use super::*;

    #[tokio::test]
    async fn test_pooler_deployment_points_at_primary() {
        let harness = Harness::new();
        converged_cluster(&harness).await;
        let key = harness.store.put_pooler(
            PostgresPoolerBuilder::new("pg-pooler", "default", "pg")
                .with_type(PoolerType::Rw)
                .with_instances(2)
                .with_pool_mode(PoolMode::Session)
                .build(),
        );

        let report = harness.pooler_pass(&key).await.unwrap();
        assert_eq!(
            harness.store.child_mutations(),
            vec![Call::Create(ChildKind::Deployment, "pg-pooler".to_string())]
        );
        assert_eq!(report.requeue, Requeue::Now);

        let fp = fingerprint(&harness, "pg-pooler");
        assert_eq!(fp.replicas, 2);
        assert_eq!(fp.pool_mode, Some(PoolMode::Session));
        assert_eq!(fp.target_endpoint.as_deref(), Some("pg-rw"));

        harness.store.ready_deployments("default");
        let report = harness.pooler_pass(&key).await.unwrap();
        assert!(report.applied.is_empty());
        assert_eq!(report.requeue, Requeue::Never);

        let status = harness.store.pooler_status(&key);
        assert_eq!(status.instances, 2);
        assert_eq!(status.pool_mode, Some(PoolMode::Session));
        assert_eq!(status.target_endpoint.as_deref(), Some("pg-rw"));
        assert_eq!(condition_status(&harness, &key, "Ready").as_deref(), Some("True"));
        assert_eq!(
            condition_status(&harness, &key, "ClusterFound").as_deref(),
            Some("True")
        );
    }

    #[tokio::test]
    async fn test_pooler_type_selects_service() {
        let harness = Harness::new();
        converged_cluster(&harness).await;
        let ro = harness.store.put_pooler(
            PostgresPoolerBuilder::new("pg-ro-pooler", "default", "pg")
                .with_type(PoolerType::Ro)
                .build(),
        );
        let r = harness.store.put_pooler(
            PostgresPoolerBuilder::new("pg-r-pooler", "default", "pg")
                .with_type(PoolerType::R)
                .build(),
        );

        harness.pooler_pass(&ro).await.unwrap();
        harness.pooler_pass(&r).await.unwrap();
        assert_eq!(
            fingerprint(&harness, "pg-ro-pooler").target_endpoint.as_deref(),
            Some("pg-ro")
        );
        assert_eq!(
            fingerprint(&harness, "pg-r-pooler").target_endpoint.as_deref(),
            Some("pg-r")
        );
    }

    #[tokio::test]
    async fn test_converged_pooler_makes_no_calls() {
        let harness = Harness::new();
        converged_cluster(&harness).await;
        let key = harness
            .store
            .put_pooler(create_test_pooler("pg-pooler", "default", "pg"));
        harness.pooler_pass(&key).await.unwrap();
        harness.store.ready_deployments("default");
        harness.pooler_pass(&key).await.unwrap();

        let report = harness.pooler_pass(&key).await.unwrap();
        assert_eq!(report.requeue, Requeue::Never);
        assert!(harness.store.calls().is_empty(), "{:?}", harness.store.calls());
    }

    #[tokio::test]
    async fn test_platform_annotations_do_not_trigger_update() {
        let harness = Harness::new();
        converged_cluster(&harness).await;
        let key = harness
            .store
            .put_pooler(create_test_pooler("pg-pooler", "default", "pg"));
        harness.pooler_pass(&key).await.unwrap();
        harness.store.ready_deployments("default");

        harness.store.annotate_deployment(
            "default",
            "pg-pooler",
            "kubectl.kubernetes.io/restartedAt",
            "2024-01-01T00:00:00Z",
        );
        let report = harness.pooler_pass(&key).await.unwrap();
        assert!(report.applied.is_empty());
        assert!(harness.store.child_mutations().is_empty());
    }

    #[tokio::test]
    async fn test_spec_change_updates_in_place() {
        let harness = Harness::new();
        converged_cluster(&harness).await;
        let key = harness
            .store
            .put_pooler(create_test_pooler("pg-pooler", "default", "pg"));
        harness.pooler_pass(&key).await.unwrap();
        harness.store.annotate_deployment(
            "default",
            "pg-pooler",
            "kubectl.kubernetes.io/restartedAt",
            "2024-01-01T00:00:00Z",
        );

        harness.store.put_pooler(
            PostgresPoolerBuilder::new("pg-pooler", "default", "pg")
                .with_instances(3)
                .with_pool_mode(PoolMode::Transaction)
                .with_parameter("max_client_conn", "500")
                .build(),
        );
        let report = harness.pooler_pass(&key).await.unwrap();
        assert_eq!(
            harness.store.child_mutations(),
            vec![Call::Replace(ChildKind::Deployment, "pg-pooler".to_string())]
        );
        assert_eq!(report.requeue, Requeue::Now);

        let fp = fingerprint(&harness, "pg-pooler");
        assert_eq!(fp.replicas, 3);
        assert_eq!(fp.pool_mode, Some(PoolMode::Transaction));
        assert_eq!(fp.parameters.as_deref(), Some("max_client_conn=500"));

        let deployment = harness
            .store
            .object(ChildKind::Deployment, "default", "pg-pooler")
            .unwrap();
        assert!(
            deployment
                .meta()
                .annotations
                .as_ref()
                .is_some_and(|a| a.contains_key("kubectl.kubernetes.io/restartedAt"))
        );
    }

    #[tokio::test]
    async fn test_pooler_not_ready_until_replicas_ready() {
        let harness = Harness::new();
        converged_cluster(&harness).await;
        let key = harness.store.put_pooler(
            PostgresPoolerBuilder::new("pg-pooler", "default", "pg")
                .with_instances(2)
                .build(),
        );
        harness.pooler_pass(&key).await.unwrap();

        let report = harness.pooler_pass(&key).await.unwrap();
        assert!(report.applied.is_empty());
        assert_eq!(report.requeue, Requeue::Now);
        assert_eq!(harness.store.pooler_status(&key).instances, 0);
        assert_eq!(condition_status(&harness, &key, "Ready").as_deref(), Some("False"));
    }
}

mod missing_cluster_tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_cluster_is_reported_and_retried() {
        let harness = Harness::new();
        let key = harness
            .store
            .put_pooler(create_test_pooler("pg-pooler", "default", "pg"));

        let err = harness.pooler_pass(&key).await.unwrap_err();
        assert!(matches!(err, Error::ClusterNotFound(_)));
        assert!(err.is_retryable());
        assert!(harness.store.child_mutations().is_empty());
        assert_eq!(
            condition_status(&harness, &key, "ClusterFound").as_deref(),
            Some("False")
        );

        converged_cluster(&harness).await;
        harness.pooler_pass(&key).await.unwrap();
        assert_eq!(
            harness.store.child_mutations(),
            vec![Call::Create(ChildKind::Deployment, "pg-pooler".to_string())]
        );
        assert_eq!(
            condition_status(&harness, &key, "ClusterFound").as_deref(),
            Some("True")
        );
    }

    #[tokio::test]
    async fn test_pooler_never_mutates_its_cluster() {
        let harness = Harness::new();
        let cluster_key = converged_cluster(&harness).await;
        let before = harness.store.cluster(&cluster_key).unwrap();
        let key = harness
            .store
            .put_pooler(create_test_pooler("pg-pooler", "default", "pg"));

        harness.pooler_pass(&key).await.unwrap();
        harness.store.ready_deployments("default");
        harness.pooler_pass(&key).await.unwrap();
        let after = harness.store.cluster(&cluster_key).unwrap();
        assert_eq!(after.metadata.resource_version, before.metadata.resource_version);
        assert_eq!(after.status, before.status);
    }
}

mod validation_tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_pooler_reports_configuration_error() {
        let harness = Harness::new();
        converged_cluster(&harness).await;
        let key = harness.store.put_pooler(
            PostgresPoolerBuilder::new("pg-pooler", "default", "")
                .with_instances(1)
                .build(),
        );

        let report = harness.pooler_pass(&key).await.unwrap();
        assert_eq!(report.requeue, Requeue::Never);
        assert!(harness.store.child_mutations().is_empty());
        let status = harness.store.pooler_status(&key);
        let ready = status.conditions.iter().find(|c| c.type_ == "Ready").unwrap();
        assert_eq!(ready.status, "False");
        assert_eq!(ready.reason, "ConfigurationError");
    }
}
