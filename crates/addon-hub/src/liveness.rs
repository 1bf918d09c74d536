//! Hub-side liveness observation
//!
//! Each spoke renews a per-cluster `addon-lease` on the hub. This reconciler
//! creates the lease when a cluster is first seen and, once the lease goes
//! stale past the grace period, flips every add-on of that cluster to
//! `Available = Unknown`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::core::ObjectMeta;
use kube::ResourceExt;
use tracing::{debug, info};

use addon_common::crd::{Condition, ConditionStatus, ManagedCluster};
use addon_common::{Error, HUB_LEASE_CLUSTER_LABEL, HUB_LEASE_NAME, LEASE_DURATION_TIMES};

use crate::client::HubClient;

/// How often every cluster is re-evaluated regardless of lease events
pub const RESYNC: Duration = Duration::from_secs(5 * 60);

/// Context for the liveness reconciler
pub struct LivenessContext {
    pub client: Arc<dyn HubClient>,
}

/// Evaluate the heartbeat lease of one cluster
pub async fn sync(ctx: &LivenessContext, cluster_name: &str) -> Result<(), Error> {
    let Some(cluster) = ctx.client.get_cluster(cluster_name).await? else {
        return Ok(());
    };

    let Some(lease) = ctx.client.get_lease(cluster_name, HUB_LEASE_NAME).await? else {
        info!(cluster = %cluster_name, "Creating hub heartbeat lease");
        ctx.client
            .create_lease(&initial_lease(cluster_name))
            .await?;
        // freshly created: the grace check waits for the next pass
        return Ok(());
    };

    if lease_is_fresh(&lease, cluster.effective_lease_duration_seconds()) {
        debug!(cluster = %cluster_name, "Hub lease fresh");
        return Ok(());
    }

    for addon in ctx.client.list_addons(cluster_name).await? {
        let updated = ctx
            .client
            .update_addon_condition(
                cluster_name,
                &addon.name_any(),
                Condition::new(
                    "Available",
                    ConditionStatus::Unknown,
                    "AddonManagerUpdateStopped",
                    "Addon manager stopped updating its lease.",
                ),
            )
            .await?;
        if updated {
            info!(
                cluster = %cluster_name,
                addon = %addon.name_any(),
                "Addon availability set to Unknown, hub lease is stale"
            );
        }
    }
    Ok(())
}

/// Whether the lease was renewed within its grace period
pub fn lease_is_fresh(lease: &Lease, lease_duration_seconds: i32) -> bool {
    let grace =
        chrono::Duration::seconds((LEASE_DURATION_TIMES * lease_duration_seconds) as i64);
    match lease.spec.as_ref().and_then(|s| s.renew_time.as_ref()) {
        Some(renew_time) => Utc::now() < renew_time.0 + grace,
        None => false,
    }
}

fn initial_lease(cluster_name: &str) -> Lease {
    let labels: BTreeMap<String, String> = [(
        HUB_LEASE_CLUSTER_LABEL.to_string(),
        cluster_name.to_string(),
    )]
    .into();
    Lease {
        metadata: ObjectMeta {
            name: Some(HUB_LEASE_NAME.to_string()),
            namespace: Some(cluster_name.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(LeaseSpec {
            holder_identity: Some(HUB_LEASE_NAME.to_string()),
            renew_time: Some(MicroTime(Utc::now())),
            ..Default::default()
        }),
    }
}
