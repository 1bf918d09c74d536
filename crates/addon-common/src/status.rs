//! Retry-on-conflict status updates for ManagedClusterAddOn
//!
//! Every liveness observer funnels its condition writes through here so the
//! read-modify-write against resource-versioned storage is in one place.
//! Conflicts are absorbed by re-reading and re-applying; a no-op merge is
//! never written.

use std::time::Duration;

use kube::api::{Api, PostParams};

use crate::crd::{set_condition, Condition, ManagedClusterAddOn};
use crate::Error;

const MAX_CONFLICT_RETRIES: u32 = 5;
const CONFLICT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Merge a condition into the add-on's status, retrying on conflict.
///
/// Returns whether a write happened. An add-on that disappeared mid-update
/// is treated as success: the watch will not re-deliver a deleted object.
pub async fn update_addon_condition(
    api: &Api<ManagedClusterAddOn>,
    addon_name: &str,
    condition: Condition,
) -> Result<bool, Error> {
    let mut attempt = 0;
    loop {
        let Some(mut addon) = api.get_opt(addon_name).await? else {
            return Ok(false);
        };

        let mut status = addon.status.clone().unwrap_or_default();
        if !set_condition(&mut status.conditions, condition.clone()) {
            return Ok(false);
        }
        addon.status = Some(status);
        addon.metadata.managed_fields = None;

        let bytes = serde_json::to_vec(&addon).map_err(|e| {
            Error::serialization_for_kind("ManagedClusterAddOn", e.to_string())
        })?;
        match api.replace_status(addon_name, &PostParams::default(), bytes).await {
            Ok(_) => return Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 409 && attempt < MAX_CONFLICT_RETRIES => {
                attempt += 1;
                tokio::time::sleep(CONFLICT_RETRY_DELAY).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}
