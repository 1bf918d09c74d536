//! The supplier interface an add-on implements
//!
//! An add-on hands the framework plain values: a manifest supplier and,
//! when registration is enabled, the bootstrap kubeconfig and hub RBAC
//! suppliers. CSR approval checks are bare function values so suppliers
//! and the manager hold no references to each other.

use std::sync::Arc;

use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::core::DynamicObject;

use crate::crd::ManagedCluster;
use crate::Error;

/// Supplies the agent workload manifests for one spoke cluster.
///
/// `config` is the add-on's configuration custom resource when one is
/// registered, passed through as an opaque object for the supplier to
/// interpret at this boundary.
pub trait AgentAddon: Send + Sync {
    /// Manifests to deliver to the managed cluster, as raw JSON objects
    fn agent_manifests(
        &self,
        cluster: &ManagedCluster,
        config: Option<&DynamicObject>,
    ) -> Result<Vec<serde_json::Value>, Error>;
}

/// Additional suppliers required when agent registration is enabled
pub trait AgentAddonRegistration: AgentAddon {
    /// Role and role binding granted to the agent group in the cluster
    /// namespace on the hub. Either may be absent.
    fn agent_hub_rbac(
        &self,
        cluster: &ManagedCluster,
        group: &str,
    ) -> (Option<Role>, Option<RoleBinding>);

    /// The bootstrap kubeconfig the agent uses for its first CSR.
    /// An empty result means the add-on ships no bootstrap credentials.
    fn agent_bootstrap_kubeconfig(&self, cluster: &ManagedCluster) -> Result<Vec<u8>, Error>;
}

/// A pure predicate deciding whether a brand-new CSR may be auto-approved
pub type CsrApproveCheck = Arc<dyn Fn(&CertificateSigningRequest) -> bool + Send + Sync>;
