//! Managed cluster admission
//!
//! When a cluster joins the fleet the hub prepares its namespace and the
//! cluster-scoped RBAC its spoke agents use to reach add-on resources. Both
//! are removed again on finalizer-gated cluster deletion (the namespace is
//! intentionally retained, other controllers still drain it).

use std::sync::Arc;

use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use kube::core::ObjectMeta;
use tracing::{debug, info};

use addon_common::crd::ManagedCluster;
use addon_common::{Error, MANAGED_CLUSTER_FINALIZER};

use crate::client::HubClient;

/// Context for the managed cluster reconciler
pub struct ManagedClusterContext {
    pub client: Arc<dyn HubClient>,
}

/// Name shared by the per-cluster agent cluster role and binding
pub fn cluster_rbac_name(cluster_name: &str) -> String {
    format!("open-cluster-management:managedcluster:addon:{cluster_name}")
}

/// Reconcile one managed cluster's hub-side resources
pub async fn sync(ctx: &ManagedClusterContext, cluster_name: &str) -> Result<(), Error> {
    debug!(cluster = %cluster_name, "Reconciling managed cluster");

    let Some(cluster) = ctx.client.get_cluster(cluster_name).await? else {
        return Ok(());
    };

    let deleting = cluster.metadata.deletion_timestamp.is_some();
    if !deleting && !has_finalizer(&cluster) {
        let mut updated = cluster;
        updated
            .metadata
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(MANAGED_CLUSTER_FINALIZER.to_string());
        return ctx.client.update_cluster(&updated).await;
    }

    if deleting {
        let rbac_name = cluster_rbac_name(cluster_name);
        ctx.client.delete_cluster_role(&rbac_name).await?;
        ctx.client.delete_cluster_role_binding(&rbac_name).await?;
        return remove_finalizer(ctx, cluster).await;
    }

    ctx.client.apply_namespace(cluster_name).await?;
    let (role, binding) = cluster_agent_rbac(cluster_name);
    ctx.client.apply_cluster_role(&role).await?;
    ctx.client.apply_cluster_role_binding(&binding).await?;
    info!(cluster = %cluster_name, "Managed cluster resources applied");
    Ok(())
}

/// RBAC letting the cluster's agents read and report on their add-ons
fn cluster_agent_rbac(cluster_name: &str) -> (ClusterRole, ClusterRoleBinding) {
    let name = cluster_rbac_name(cluster_name);
    let role = ClusterRole {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            ..Default::default()
        },
        rules: Some(vec![
            PolicyRule {
                api_groups: Some(vec!["addon.open-cluster-management.io".to_string()]),
                resources: Some(vec![
                    "managedclusteraddons".to_string(),
                    "managedclusteraddons/status".to_string(),
                ]),
                verbs: vec![
                    "get".to_string(),
                    "list".to_string(),
                    "watch".to_string(),
                    "update".to_string(),
                    "patch".to_string(),
                ],
                ..Default::default()
            },
            PolicyRule {
                api_groups: Some(vec!["coordination.k8s.io".to_string()]),
                resources: Some(vec!["leases".to_string()]),
                verbs: vec!["get".to_string(), "create".to_string(), "update".to_string()],
                ..Default::default()
            },
        ]),
        ..Default::default()
    };
    let binding = ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name,
        },
        subjects: Some(vec![Subject {
            api_group: Some("rbac.authorization.k8s.io".to_string()),
            kind: "Group".to_string(),
            name: format!("system:open-cluster-management:cluster:{cluster_name}"),
            ..Default::default()
        }]),
    };
    (role, binding)
}

async fn remove_finalizer(ctx: &ManagedClusterContext, cluster: ManagedCluster) -> Result<(), Error> {
    let Some(finalizers) = &cluster.metadata.finalizers else {
        return Ok(());
    };
    let kept: Vec<String> = finalizers
        .iter()
        .filter(|f| f.as_str() != MANAGED_CLUSTER_FINALIZER)
        .cloned()
        .collect();
    if kept.len() == finalizers.len() {
        return Ok(());
    }

    let mut updated = cluster;
    updated.metadata.finalizers = (!kept.is_empty()).then_some(kept);
    ctx.client.update_cluster(&updated).await
}

fn has_finalizer(cluster: &ManagedCluster) -> bool {
    cluster
        .metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|x| x == MANAGED_CLUSTER_FINALIZER))
}
