pub mod common;
pub mod job;
pub mod pgbouncer;
pub mod pod;
pub mod pvc;
pub mod service;

pub use common::{API_VERSION, FIELD_MANAGER, owner_reference, standard_labels};
