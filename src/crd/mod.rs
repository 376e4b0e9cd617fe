mod postgres_cluster;
mod postgres_pooler;

pub use postgres_cluster::*;
pub use postgres_pooler::*;
