pub mod bootstrap;
pub mod certificates;
pub mod cluster_reconciler;
pub mod context;
pub mod error;
pub mod instances;
pub mod pooler_reconciler;
pub mod status;
pub mod storage;
pub mod store;
pub mod validation;

pub use cluster_reconciler::{
    ClusterPlan, ClusterSnapshot, PassReport, error_policy, plan_cluster, reconcile,
    reconcile_cluster,
};
pub use context::Context;
pub use error::{BackoffConfig, Error, Requeue, Result};
pub use pooler_reconciler::{
    PoolerAction, PoolerReport, ensure_pooler_deployment, pooler_error_policy, reconcile_pooler,
    reconcile_pooler_resource,
};
pub use status::{ConditionBuilder, spec_changed};
pub use store::{ChildKind, ChildObject, KubeStore, Mutation, ObjectKey, ObjectStore};
pub use validation::{MIN_INSTANCES, validate_pooler_spec, validate_spec};
