//! Spoke-side storage access
//!
//! The spoke process talks to two trust domains: its own cluster (secrets,
//! agent leases) and the hub (add-ons, CSRs, the per-cluster heartbeat
//! lease). Each surface is a trait so tests mock storage; the CSR surface
//! is separate because it exists twice, once over bootstrap credentials and
//! once over the issued identity.

use async_trait::async_trait;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, ListParams, PostParams};
use kube::{Client, ResourceExt};

#[cfg(test)]
use mockall::automock;

use addon_common::crd::{Condition, ManagedClusterAddOn};
use addon_common::{status, Error};

/// Local-cluster operations
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SpokeClient: Send + Sync {
    /// Get a secret
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error>;

    /// Create a secret
    async fn create_secret(&self, secret: &Secret) -> Result<(), Error>;

    /// Replace a secret
    async fn update_secret(&self, secret: &Secret) -> Result<(), Error>;

    /// Get a lease
    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Option<Lease>, Error>;

    /// List leases across namespaces by label selector
    async fn list_leases_by_label(&self, selector: &str) -> Result<Vec<Lease>, Error>;
}

/// Hub-cluster add-on operations available to the spoke
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HubApi: Send + Sync {
    /// Get an add-on in the cluster namespace
    async fn get_addon(
        &self,
        cluster: &str,
        name: &str,
    ) -> Result<Option<ManagedClusterAddOn>, Error>;

    /// List add-ons in the cluster namespace
    async fn list_addons(&self, cluster: &str) -> Result<Vec<ManagedClusterAddOn>, Error>;

    /// Replace an add-on (finalizer updates)
    async fn update_addon(&self, addon: &ManagedClusterAddOn) -> Result<(), Error>;

    /// Merge a condition into an add-on's status with conflict retries
    async fn update_addon_condition(
        &self,
        cluster: &str,
        addon_name: &str,
        condition: Condition,
    ) -> Result<bool, Error>;
}

/// Certificate signing request surface on the hub
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CsrApi: Send + Sync {
    /// Create a CSR; the server assigns the generated name
    async fn create_csr(
        &self,
        csr: &CertificateSigningRequest,
    ) -> Result<CertificateSigningRequest, Error>;

    /// Get a CSR by name
    async fn get_csr(&self, name: &str) -> Result<Option<CertificateSigningRequest>, Error>;
}

/// Lease read-modify-write surface, bindable to either trust domain
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LeaseApi: Send + Sync {
    /// Get a lease
    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Option<Lease>, Error>;

    /// Create a lease
    async fn create_lease(&self, lease: &Lease) -> Result<(), Error>;

    /// Replace a lease
    async fn update_lease(&self, lease: &Lease) -> Result<(), Error>;
}

/// Real local-cluster client
pub struct SpokeClientImpl {
    client: Client,
}

impl SpokeClientImpl {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SpokeClient for SpokeClientImpl {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_secret(&self, secret: &Secret) -> Result<(), Error> {
        let namespace = secret.namespace().ok_or_else(|| {
            Error::internal("spoke-client", "secret without a namespace")
        })?;
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        api.create(&PostParams::default(), secret).await?;
        Ok(())
    }

    async fn update_secret(&self, secret: &Secret) -> Result<(), Error> {
        let namespace = secret.namespace().ok_or_else(|| {
            Error::internal("spoke-client", "secret without a namespace")
        })?;
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        api.replace(&secret.name_any(), &PostParams::default(), secret)
            .await?;
        Ok(())
    }

    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Option<Lease>, Error> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_leases_by_label(&self, selector: &str) -> Result<Vec<Lease>, Error> {
        let api: Api<Lease> = Api::all(self.client.clone());
        let params = ListParams::default().labels(selector);
        Ok(api.list(&params).await?.items)
    }
}

/// Real hub add-on client
pub struct HubApiImpl {
    client: Client,
}

impl HubApiImpl {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn addons(&self, namespace: &str) -> Api<ManagedClusterAddOn> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl HubApi for HubApiImpl {
    async fn get_addon(
        &self,
        cluster: &str,
        name: &str,
    ) -> Result<Option<ManagedClusterAddOn>, Error> {
        Ok(self.addons(cluster).get_opt(name).await?)
    }

    async fn list_addons(&self, cluster: &str) -> Result<Vec<ManagedClusterAddOn>, Error> {
        Ok(self.addons(cluster).list(&ListParams::default()).await?.items)
    }

    async fn update_addon(&self, addon: &ManagedClusterAddOn) -> Result<(), Error> {
        let namespace = addon.namespace().ok_or_else(|| {
            Error::internal("spoke-client", "add-on without a namespace")
        })?;
        self.addons(&namespace)
            .replace(&addon.name_any(), &PostParams::default(), addon)
            .await?;
        Ok(())
    }

    async fn update_addon_condition(
        &self,
        cluster: &str,
        addon_name: &str,
        condition: Condition,
    ) -> Result<bool, Error> {
        status::update_addon_condition(&self.addons(cluster), addon_name, condition).await
    }
}

/// Real hub CSR client
pub struct CsrApiImpl {
    client: Client,
}

impl CsrApiImpl {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CsrApi for CsrApiImpl {
    async fn create_csr(
        &self,
        csr: &CertificateSigningRequest,
    ) -> Result<CertificateSigningRequest, Error> {
        let api: Api<CertificateSigningRequest> = Api::all(self.client.clone());
        Ok(api.create(&PostParams::default(), csr).await?)
    }

    async fn get_csr(&self, name: &str) -> Result<Option<CertificateSigningRequest>, Error> {
        let api: Api<CertificateSigningRequest> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }
}

/// Real lease client over either trust domain
pub struct LeaseApiImpl {
    client: Client,
}

impl LeaseApiImpl {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LeaseApi for LeaseApiImpl {
    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Option<Lease>, Error> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_lease(&self, lease: &Lease) -> Result<(), Error> {
        let namespace = lease.namespace().ok_or_else(|| {
            Error::internal("spoke-client", "lease without a namespace")
        })?;
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &namespace);
        api.create(&PostParams::default(), lease).await?;
        Ok(())
    }

    async fn update_lease(&self, lease: &Lease) -> Result<(), Error> {
        let namespace = lease.namespace().ok_or_else(|| {
            Error::internal("spoke-client", "lease without a namespace")
        })?;
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &namespace);
        api.replace(&lease.name_any(), &PostParams::default(), lease)
            .await?;
        Ok(())
    }
}
