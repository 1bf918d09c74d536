//! Cluster management registration
//!
//! Ensures the per-add-on `ClusterManagementAddOn` singleton exists. Its
//! existence registers the add-on with the control plane; the deploy
//! reconciler reads configuration coordinates off it. The check re-runs on a
//! long resync so a manually deleted singleton converges back.

use std::sync::Arc;
use std::time::Duration;

use kube::core::ObjectMeta;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use addon_common::crd::{ClusterManagementAddOn, ClusterManagementAddOnSpec};
use addon_common::Error;

use crate::client::HubClient;

/// How often the singleton is re-checked
pub const RESYNC: Duration = Duration::from_secs(60 * 60);

/// Create the `ClusterManagementAddOn` for the add-on when it is absent
pub async fn ensure_cluster_management(
    client: &dyn HubClient,
    addon_name: &str,
) -> Result<(), Error> {
    if client.get_cluster_management(addon_name).await?.is_some() {
        debug!(addon = %addon_name, "ClusterManagementAddOn present");
        return Ok(());
    }

    let addon = ClusterManagementAddOn {
        metadata: ObjectMeta {
            name: Some(addon_name.to_string()),
            ..Default::default()
        },
        spec: ClusterManagementAddOnSpec::default(),
    };
    client.create_cluster_management(&addon).await?;
    info!(addon = %addon_name, "Created ClusterManagementAddOn");
    Ok(())
}

/// Run the ensure loop until the token fires
pub async fn run(client: Arc<dyn HubClient>, addon_name: String, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(RESYNC);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = ensure_cluster_management(client.as_ref(), &addon_name).await {
                    warn!(addon = %addon_name, error = %e, "Failed to ensure ClusterManagementAddOn");
                }
            }
            _ = shutdown.cancelled() => return,
        }
    }
}
