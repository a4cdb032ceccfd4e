mod buf;
mod cluster;
mod cluster_index;
mod geometry;

pub(crate) use cluster::Entry;
pub(crate) use cluster_index::{ClusterIndex, Clusters};
pub(crate) use geometry::{ClusterId, Geometry};
