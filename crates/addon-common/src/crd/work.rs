//! ManifestWork resource definition
//!
//! A ManifestWork is the delivery envelope addressed to a spoke cluster: its
//! payload is a list of raw manifests an external applier materialises on the
//! spoke. The deploy reconcilers own these envelopes and compare payloads
//! element-wise to decide whether an update is needed.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// One opaque manifest in an envelope payload, kept as raw JSON
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(transparent)]
pub struct Manifest(pub serde_json::Value);

/// The workload carried by an envelope
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManifestsTemplate {
    /// Raw manifests to apply on the spoke, in order
    #[serde(default)]
    pub manifests: Vec<Manifest>,
}

/// Specification for a ManifestWork
#[derive(
    CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq,
)]
#[kube(
    group = "work.open-cluster-management.io",
    version = "v1",
    kind = "ManifestWork",
    plural = "manifestworks",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ManifestWorkSpec {
    /// The manifests to be delivered
    #[serde(default)]
    pub workload: ManifestsTemplate,
}

/// Element-wise payload equality between two manifest lists
pub fn manifests_equal(new: &[Manifest], old: &[Manifest]) -> bool {
    if new.len() != old.len() {
        return false;
    }
    new.iter().zip(old.iter()).all(|(a, b)| a.0 == b.0)
}
