//! ManagedClusterAddOn and ClusterManagementAddOn resource definitions
//!
//! `ManagedClusterAddOn` is the per-(cluster, add-on) record: the hub writes
//! configuration onto its annotations, finalizers gate teardown, and the
//! liveness observers write the `Available`/`Degraded` conditions into its
//! status. `ClusterManagementAddOn` is the per-add-on singleton whose
//! existence registers the add-on with the control plane.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;
use crate::annotations;

/// Specification for a ManagedClusterAddOn
///
/// Configuration travels on annotations, not the spec: the hub config
/// annotator owns the annotation set and the spoke reads it back.
#[derive(
    CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq,
)]
#[kube(
    group = "addon.open-cluster-management.io",
    version = "v1alpha1",
    kind = "ManagedClusterAddOn",
    plural = "managedclusteraddons",
    namespaced,
    status = "ManagedClusterAddOnStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterAddOnSpec {}

/// Status for a ManagedClusterAddOn
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterAddOnStatus {
    /// Conditions representing agent liveness as observed from hub and spoke
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl ManagedClusterAddOn {
    /// Read one of the config annotations the hub wrote
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }

    /// Whether identity registration is enabled for this add-on
    pub fn registration_enabled(&self) -> bool {
        self.annotation(annotations::ENABLE_REGISTRATION) == Some("true")
    }

    /// The namespace the agent is installed into on the spoke
    pub fn install_namespace(&self) -> Option<&str> {
        self.annotation(annotations::INSTALL_NAMESPACE)
            .filter(|ns| !ns.is_empty())
    }

    /// Whether the object carries a deletion timestamp
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}

/// Coordinates of the optional configuration custom resource for an add-on
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigCoordinates {
    /// CRD name of the configuration resource
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub crd_name: String,

    /// Name of the configuration resource instance
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cr_name: String,
}

/// Specification for a ClusterManagementAddOn
#[derive(
    CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq,
)]
#[kube(
    group = "addon.open-cluster-management.io",
    version = "v1alpha1",
    kind = "ClusterManagementAddOn",
    plural = "clustermanagementaddons"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterManagementAddOnSpec {
    /// Where to find the add-on's configuration custom resource, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_on_configuration: Option<ConfigCoordinates>,
}
