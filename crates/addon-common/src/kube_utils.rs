//! Kubernetes client construction helpers

use std::path::Path;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};

use crate::Error;

/// Create a kube client from an optional kubeconfig path.
///
/// With no path, the in-cluster/default environment configuration is used.
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::configuration(format!("failed to read kubeconfig: {e}"))
            })?;
            client_from_kubeconfig(kubeconfig).await
        }
        None => Client::try_default()
            .await
            .map_err(|e| Error::configuration(format!("failed to create client: {e}"))),
    }
}

/// Create a kube client from raw kubeconfig bytes, e.g. a secret payload
pub async fn create_client_from_bytes(bytes: &[u8]) -> Result<Client, Error> {
    let kubeconfig: Kubeconfig = serde_yaml::from_slice(bytes)
        .map_err(|e| Error::configuration(format!("failed to parse kubeconfig: {e}")))?;
    client_from_kubeconfig(kubeconfig).await
}

async fn client_from_kubeconfig(kubeconfig: Kubeconfig) -> Result<Client, Error> {
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::configuration(format!("failed to load kubeconfig: {e}")))?;
    Client::try_from(config)
        .map_err(|e| Error::configuration(format!("failed to create client: {e}")))
}
