//! Agent deploy reconciler
//!
//! Materialises the add-on's agent manifests into a delivery envelope
//! addressed to each managed cluster, and drives the finalizer-gated
//! teardown path: while envelopes labelled for the add-on still exist the
//! add-on cannot leave storage.

use std::collections::BTreeMap;
use std::sync::Arc;

use kube::core::ObjectMeta;
use tracing::{debug, info};

use addon_common::agent::AgentAddon;
use addon_common::crd::{
    manifests_equal, ManagedClusterAddOn, Manifest, ManifestWork, ManifestWorkSpec,
    ManifestsTemplate,
};
use addon_common::{deploy_work_name, Error, ADDON_WORK_LABEL, DEPLOY_FINALIZER};

use crate::client::HubClient;

/// Context for the deploy reconciler
pub struct DeployContext {
    pub client: Arc<dyn HubClient>,
    pub addon_name: String,
    pub agent_addon: Arc<dyn AgentAddon>,
}

/// Reconcile the deploy state of the add-on on one cluster
pub async fn sync(ctx: &DeployContext, cluster_name: &str) -> Result<(), Error> {
    debug!(addon = %ctx.addon_name, cluster = %cluster_name, "Reconciling addon deploy");

    let Some(cluster) = ctx.client.get_cluster(cluster_name).await? else {
        return Ok(());
    };
    let Some(addon) = ctx.client.get_addon(cluster_name, &ctx.addon_name).await? else {
        return Ok(());
    };

    if !addon.is_deleting() && !has_finalizer(&addon) {
        let mut updated = addon;
        updated
            .metadata
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(DEPLOY_FINALIZER.to_string());
        // the update event re-triggers this reconcile with the finalizer set
        return ctx.client.update_addon(&updated).await;
    }

    if addon.is_deleting() {
        remove_addon_works(ctx, cluster_name).await?;
        return remove_finalizer(ctx, addon).await;
    }

    let Some(cluster_management) = ctx.client.get_cluster_management(&ctx.addon_name).await? else {
        return Err(Error::internal(
            "agent-deploy",
            format!("ClusterManagementAddOn {} not registered yet", ctx.addon_name),
        ));
    };

    let config = match cluster_management
        .spec
        .add_on_configuration
        .as_ref()
        .filter(|c| !c.crd_name.is_empty() && !c.cr_name.is_empty())
    {
        Some(coordinates) => {
            let found = ctx
                .client
                .get_addon_config(cluster_name, &coordinates.cr_name)
                .await?;
            if found.is_none() {
                return Err(Error::internal(
                    "agent-deploy",
                    format!(
                        "configuration resource {}/{} not found",
                        cluster_name, coordinates.cr_name
                    ),
                ));
            }
            found
        }
        None => None,
    };

    let objects = ctx
        .agent_addon
        .agent_manifests(&cluster, config.as_ref())?;
    let Some(work) = build_deploy_work(&ctx.addon_name, cluster_name, objects) else {
        return Ok(());
    };

    apply_work(ctx.client.as_ref(), work).await
}

/// Create the envelope, or update it when the payload changed
pub(crate) async fn apply_work(client: &dyn HubClient, work: ManifestWork) -> Result<(), Error> {
    let namespace = work.metadata.namespace.clone().unwrap_or_default();
    let name = work.metadata.name.clone().unwrap_or_default();

    let Some(existing) = client.get_work(&namespace, &name).await? else {
        info!(work = %name, cluster = %namespace, "Creating delivery envelope");
        return client.create_work(&work).await;
    };

    if manifests_equal(
        &work.spec.workload.manifests,
        &existing.spec.workload.manifests,
    ) {
        return Ok(());
    }

    let mut updated = work;
    updated.metadata.resource_version = existing.metadata.resource_version.clone();
    info!(work = %name, cluster = %namespace, "Updating delivery envelope payload");
    client.update_work(&updated).await
}

/// Build the deploy envelope; `None` when the supplier produced nothing
fn build_deploy_work(
    addon_name: &str,
    cluster_name: &str,
    objects: Vec<serde_json::Value>,
) -> Option<ManifestWork> {
    if objects.is_empty() {
        return None;
    }

    let labels: BTreeMap<String, String> =
        [(ADDON_WORK_LABEL.to_string(), addon_name.to_string())].into();
    Some(ManifestWork {
        metadata: ObjectMeta {
            name: Some(deploy_work_name(addon_name)),
            namespace: Some(cluster_name.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: ManifestWorkSpec {
            workload: ManifestsTemplate {
                manifests: objects.into_iter().map(Manifest).collect(),
            },
        },
    })
}

/// Delete the add-on's envelopes; errors retryably while any still exist
async fn remove_addon_works(ctx: &DeployContext, cluster_name: &str) -> Result<(), Error> {
    let works = ctx
        .client
        .list_addon_works(cluster_name, &ctx.addon_name)
        .await?;
    if works.is_empty() {
        return Ok(());
    }

    for work in &works {
        if work.metadata.deletion_timestamp.is_none() {
            let name = work.metadata.name.clone().unwrap_or_default();
            ctx.client.delete_work(cluster_name, &name).await?;
        }
    }

    Err(Error::PendingCleanup {
        addon: ctx.addon_name.clone(),
        remaining: works.len(),
    })
}

async fn remove_finalizer(ctx: &DeployContext, addon: ManagedClusterAddOn) -> Result<(), Error> {
    let Some(finalizers) = &addon.metadata.finalizers else {
        return Ok(());
    };
    let kept: Vec<String> = finalizers
        .iter()
        .filter(|f| f.as_str() != DEPLOY_FINALIZER)
        .cloned()
        .collect();
    if kept.len() == finalizers.len() {
        return Ok(());
    }

    let mut updated = addon;
    updated.metadata.finalizers = (!kept.is_empty()).then_some(kept);
    ctx.client.update_addon(&updated).await
}

fn has_finalizer(addon: &ManagedClusterAddOn) -> bool {
    addon
        .metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|x| x == DEPLOY_FINALIZER))
}
