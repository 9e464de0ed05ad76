pub mod cluster;
pub mod duplicate;
pub mod kmeans;
pub mod similarity;

pub use cluster::{ClusterBuilder, ClusterConfig};
pub use duplicate::DuplicateDetector;
