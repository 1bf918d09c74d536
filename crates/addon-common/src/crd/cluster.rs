//! ManagedCluster resource definition
//!
//! A ManagedCluster represents one spoke cluster federated by the hub. The
//! resource is cluster-scoped; a namespace of the same name on the hub holds
//! that cluster's per-cluster objects (add-ons, envelopes, heartbeat lease).

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::DEFAULT_LEASE_DURATION_SECONDS;

/// Specification for a ManagedCluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cluster.open-cluster-management.io",
    version = "v1",
    kind = "ManagedCluster",
    plural = "managedclusters"
)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterSpec {
    /// How often (seconds) the spoke is expected to renew its hub lease.
    /// Zero means unset; observers fall back to the 60 s default.
    #[serde(default)]
    pub lease_duration_seconds: i32,
}

impl ManagedCluster {
    /// The lease duration to use for liveness checks, applying the
    /// backward-compatible default when the field was never mutated in.
    pub fn effective_lease_duration_seconds(&self) -> i32 {
        if self.spec.lease_duration_seconds == 0 {
            DEFAULT_LEASE_DURATION_SECONDS
        } else {
            self.spec.lease_duration_seconds
        }
    }
}
