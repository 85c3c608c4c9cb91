pub mod cluster;
pub mod memory;
pub mod similarity;

pub use cluster::{Cluster, ClusterError, ClusteringOutcome, MemoryClusterer, TimeSpan};
pub use memory::{Memory, MemoryType, ProcessingStatus, UnknownVariant};
