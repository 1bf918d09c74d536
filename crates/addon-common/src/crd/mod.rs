//! Typed API resources the framework reconciles
//!
//! These are the `open-cluster-management.io` resources the hub and spoke
//! processes read and write. The framework defines them with kube's derive
//! so both processes share one set of types and one schema.

mod addon;
mod cluster;
mod types;
mod work;

pub use addon::{
    ClusterManagementAddOn, ClusterManagementAddOnSpec, ConfigCoordinates, ManagedClusterAddOn,
    ManagedClusterAddOnSpec, ManagedClusterAddOnStatus,
};
pub use cluster::{ManagedCluster, ManagedClusterSpec};
pub use types::{set_condition, Condition, ConditionStatus};
pub use work::{manifests_equal, Manifest, ManifestWork, ManifestWorkSpec, ManifestsTemplate};
