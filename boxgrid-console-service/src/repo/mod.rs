pub mod task;
pub mod worker_credential;
pub mod worker_node;

pub use boxgrid_common::repo::RepoError;
