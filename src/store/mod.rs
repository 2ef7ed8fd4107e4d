pub mod cluster;
pub mod list;

pub use cluster::ClusterStore;
pub use list::ClusterListStore;
