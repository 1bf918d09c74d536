//! Agent identity naming conventions
//!
//! The subject of every agent client certificate encodes the (cluster,
//! add-on, agent) triple. The hub CSR approver and the spoke certificate
//! manager must agree on these exact shapes, so they live here.

/// The organization every agent of an add-on on a cluster belongs to
pub fn agent_group(cluster_name: &str, addon_name: &str) -> String {
    format!("system:open-cluster-management:cluster:{cluster_name}:addon:{addon_name}")
}

/// The user (certificate CommonName) of a single agent instance
pub fn agent_user(cluster_name: &str, addon_name: &str, agent_name: &str) -> String {
    format!("{}:agent:{agent_name}", agent_group(cluster_name, addon_name))
}

/// Generate-name stem for an agent's CSRs
pub fn csr_generate_name(cluster_name: &str, addon_name: &str) -> String {
    format!("addon-{addon_name}-{cluster_name}-")
}

/// Name prefix that identifies all CSRs belonging to an add-on
pub fn csr_name_prefix(addon_name: &str) -> String {
    format!("addon-{addon_name}-")
}
