//! Print the CustomResourceDefinitions served by the operator
//!
//! `cargo run --bin crdgen > deploy/crds.yaml`

use kube::CustomResourceExt;

use pgcluster_operator::crd::{PostgresCluster, PostgresPooler};

fn main() -> Result<(), serde_yaml::Error> {
    let cluster = serde_yaml::to_string(&PostgresCluster::crd())?;
    let pooler = serde_yaml::to_string(&PostgresPooler::crd())?;
    print!("{}---\n{}", cluster, pooler);
    Ok(())
}
