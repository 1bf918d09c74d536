//! Shared types and helpers for the addon framework.
//!
//! The framework manages add-ons across a hub cluster and a fleet of managed
//! (spoke) clusters. This crate holds the pieces both processes need: the
//! typed API resources, condition/status helpers, agent identity naming, the
//! supplier traits an add-on implements, and client construction utilities.

pub mod agent;
pub mod crd;
pub mod error;
pub mod identity;
pub mod kube_utils;
pub mod status;

pub use error::Error;

/// Label on delivery envelopes linking them to the add-on that owns them.
pub const ADDON_WORK_LABEL: &str = "open-cluster-management.io/addon-name";

/// Label on agent CSRs carrying the requesting cluster's name.
pub const CLUSTER_NAME_LABEL: &str = "open-cluster-management.io/cluster-name";

/// Label on the agent heartbeat lease, value is the add-on name.
pub const ADDON_LEASE_LABEL: &str = "open-cluster-management-addon";

/// Label on the per-cluster hub heartbeat lease, value is the cluster name.
pub const HUB_LEASE_CLUSTER_LABEL: &str = "addon.open-cluster-management.io/cluster-name";

/// Finalizer held by the deploy reconciler until delivery envelopes are gone.
pub const DEPLOY_FINALIZER: &str = "addon.open-cluster-management.io/work-cleanup";

/// Finalizer held by the registration deploy reconciler until hub RBAC is gone.
pub const REGISTRATION_FINALIZER: &str = "addon.open-cluster-management.io/registration-cleanup";

/// Finalizer held by the hub managed-cluster reconciler.
pub const MANAGED_CLUSTER_FINALIZER: &str =
    "cluster.open-cluster-management.io/addon-resource-cleanup";

/// Finalizer held by the spoke certificate manager.
pub const SPOKE_REGISTRATION_FINALIZER: &str = "addonregistration.open-cluster-management.io";

/// Name of the per-cluster heartbeat lease the spoke renews on the hub.
pub const HUB_LEASE_NAME: &str = "addon-lease";

/// Default signer for agent client certificates.
pub const DEFAULT_SIGNER: &str = "kubernetes.io/kube-apiserver-client";

/// Annotation keys written onto the `ManagedClusterAddOn` by the hub and
/// read back by the spoke.
pub mod annotations {
    pub const SIGNER: &str = "signer";
    pub const INSTALL_NAMESPACE: &str = "installNamespace";
    pub const BOOTSTRAP_SECRET: &str = "bootstrapSecret";
    pub const ENABLE_REGISTRATION: &str = "enable_registration";
}

/// A stale lease is one not renewed within this many lease durations.
pub const LEASE_DURATION_TIMES: i32 = 5;

/// Lease duration assumed when a cluster does not declare one.
pub const DEFAULT_LEASE_DURATION_SECONDS: i32 = 60;

/// Name of the agent heartbeat lease for an add-on.
pub fn addon_lease_name(addon_name: &str) -> String {
    format!("open-cluster-management-addon-{addon_name}")
}

/// Name of the bootstrap kubeconfig secret delivered to the spoke.
pub fn bootstrap_secret_name(addon_name: &str) -> String {
    format!("{addon_name}-bootstrap-kubeconfig")
}

/// Name of the identity secret the spoke persists issued credentials into.
pub fn hub_kubeconfig_secret_name(addon_name: &str) -> String {
    format!("{addon_name}-hub-kubeconfig")
}

/// Name of the deploy delivery envelope for an add-on.
pub fn deploy_work_name(addon_name: &str) -> String {
    format!("addon-{addon_name}-deploy")
}

/// Name of the registration delivery envelope for an add-on.
pub fn registration_work_name(addon_name: &str) -> String {
    format!("addon-{addon_name}-registration-agent")
}
