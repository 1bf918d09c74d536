//! Add-on agent liveness observation on the spoke
//!
//! Each add-on agent renews a labelled lease in its install namespace. This
//! observer derives the add-on's `Degraded` condition from the freshest of
//! those leases and reports it back to the hub.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::coordination::v1::Lease;
use kube::ResourceExt;
use tracing::{debug, info};

use addon_common::crd::{Condition, ConditionStatus};
use addon_common::{
    addon_lease_name, annotations, Error, ADDON_LEASE_LABEL, DEFAULT_LEASE_DURATION_SECONDS,
    LEASE_DURATION_TIMES,
};

use crate::client::{HubApi, SpokeClient};

/// How often every add-on's leases are re-evaluated
pub const RESYNC: Duration = Duration::from_secs(60);

/// Context for the add-on lease observer
pub struct LeaseObserverContext {
    pub spoke: Arc<dyn SpokeClient>,
    pub hub: Arc<dyn HubApi>,
    pub cluster_name: String,
}

/// Evaluate agent liveness for every add-on of this cluster
pub async fn sync(ctx: &LeaseObserverContext) -> Result<(), Error> {
    for addon in ctx.hub.list_addons(&ctx.cluster_name).await? {
        let addon_name = addon.name_any();
        let mut leases = ctx
            .spoke
            .list_leases_by_label(&format!("{ADDON_LEASE_LABEL}={addon_name}"))
            .await?;

        if leases.is_empty() {
            // agents predating the lease label only have the named lease
            if let Some(namespace) = addon.annotation(annotations::INSTALL_NAMESPACE) {
                if let Some(lease) = ctx
                    .spoke
                    .get_lease(namespace, &addon_lease_name(&addon_name))
                    .await?
                {
                    leases.push(lease);
                }
            }
        }

        let condition = derive_condition(&leases);
        let updated = ctx
            .hub
            .update_addon_condition(&ctx.cluster_name, &addon_name, condition)
            .await?;
        if updated {
            info!(
                addon = %addon_name,
                cluster = %ctx.cluster_name,
                "Addon degraded condition updated from agent leases"
            );
        } else {
            debug!(addon = %addon_name, "Addon degraded condition unchanged");
        }
    }
    Ok(())
}

/// Degraded condition from the observed agent leases.
///
/// One fresh lease is enough for a healthy verdict; an agent reporting
/// from any namespace proves the add-on alive.
pub fn derive_condition(leases: &[Lease]) -> Condition {
    if leases.is_empty() {
        return Condition::new(
            "Degraded",
            ConditionStatus::True,
            "AddonLeaseNotFound",
            "Addon agent is not found.",
        );
    }

    let grace = chrono::Duration::seconds(
        (LEASE_DURATION_TIMES * DEFAULT_LEASE_DURATION_SECONDS) as i64,
    );
    let now = Utc::now();
    let any_fresh = leases.iter().any(|lease| {
        lease
            .spec
            .as_ref()
            .and_then(|s| s.renew_time.as_ref())
            .is_some_and(|renew| now < renew.0 + grace)
    });

    if any_fresh {
        Condition::new(
            "Degraded",
            ConditionStatus::False,
            "ManagedClusterLeaseUpdated",
            "Addon agent is updating its lease.",
        )
    } else {
        Condition::new(
            "Degraded",
            ConditionStatus::True,
            "AddonLeaseUpdateStopped",
            "Addon agent stopped updating its lease.",
        )
    }
}
