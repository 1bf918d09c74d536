//! Single-tenant CSR-based certificate rotation
//!
//! A [`ClientCertController`] keeps one agent identity alive against the
//! hub: when the persisted identity is missing, wrong, or past its renewal
//! window it files a CSR, waits for approval and signing, and persists the
//! issued credentials back into the identity secret. The same controller
//! serves both phases of the lifecycle; only the credentials behind its
//! CSR surface differ (bootstrap versus issued).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::certificates::v1::{
    CertificateSigningRequest, CertificateSigningRequestSpec,
};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::core::ObjectMeta;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use addon_common::{identity, Error, CLUSTER_NAME_LABEL};

use crate::certificate::{
    build_kubeconfig, identity_secret_data, identity_secret_is_valid, CertificateInfo,
    TLS_CERT_KEY,
};
use crate::client::{CsrApi, SpokeClient};

/// How often the rotation loop re-examines its state
const TICK: Duration = Duration::from_secs(1);

/// Static configuration of one certificate controller
#[derive(Clone)]
pub struct ClientCertConfig {
    pub cluster_name: String,
    pub agent_name: String,
    pub addon_name: String,
    pub signer: String,
    pub secret_namespace: String,
    pub secret_name: String,
    /// Hub API server URL embedded into the persisted kubeconfig
    pub hub_server: String,
    /// Base64 CA bundle for the hub, when it is not publicly trusted
    pub hub_ca_data: Option<String>,
}

/// A CSR filed but not yet signed; the private key never leaves memory
struct InFlightRequest {
    csr_name: String,
    key_pem: String,
}

/// Drives one agent identity through request, issuance and persistence
pub struct ClientCertController {
    config: ClientCertConfig,
    csr_api: Arc<dyn CsrApi>,
    spoke: Arc<dyn SpokeClient>,
    in_flight: Option<InFlightRequest>,
}

impl ClientCertController {
    pub fn new(
        config: ClientCertConfig,
        csr_api: Arc<dyn CsrApi>,
        spoke: Arc<dyn SpokeClient>,
    ) -> Self {
        Self {
            config,
            csr_api,
            spoke,
            in_flight: None,
        }
    }

    /// Run the rotation loop until the token fires
    pub async fn run(mut self, token: CancellationToken) {
        debug!(
            addon = %self.config.addon_name,
            agent = %self.config.agent_name,
            "Client certificate controller started"
        );
        loop {
            if let Err(e) = self.step().await {
                warn!(
                    addon = %self.config.addon_name,
                    error = %e,
                    "Certificate rotation step failed"
                );
            }
            tokio::select! {
                _ = tokio::time::sleep(TICK) => {}
                _ = token.cancelled() => {
                    debug!(addon = %self.config.addon_name, "Client certificate controller stopped");
                    return;
                }
            }
        }
    }

    /// One pass of the rotation state machine.
    ///
    /// Idle while the persisted identity is valid and outside its renewal
    /// window; otherwise files a CSR, then waits for issuance, then
    /// persists the credentials.
    pub async fn step(&mut self) -> Result<(), Error> {
        let secret = self
            .spoke
            .get_secret(&self.config.secret_namespace, &self.config.secret_name)
            .await?;

        match &self.in_flight {
            None => {
                if let Some(secret) = &secret {
                    if self.identity_is_current(secret) {
                        return Ok(());
                    }
                }
                self.request_certificate().await
            }
            Some(request) => {
                let Some(csr) = self.csr_api.get_csr(&request.csr_name).await? else {
                    // the request vanished; file a fresh one next tick
                    warn!(csr = %request.csr_name, "In-flight CSR disappeared");
                    self.in_flight = None;
                    return Ok(());
                };
                let Some(certificate) = csr
                    .status
                    .as_ref()
                    .and_then(|s| s.certificate.clone())
                    .filter(|c| !c.0.is_empty())
                else {
                    debug!(csr = %request.csr_name, "Waiting for CSR approval and signing");
                    return Ok(());
                };
                self.persist_identity(secret, certificate.0).await
            }
        }
    }

    fn identity_is_current(&self, secret: &Secret) -> bool {
        if !identity_secret_is_valid(secret, &self.config.cluster_name, &self.config.agent_name) {
            return false;
        }
        let fresh = secret
            .data
            .as_ref()
            .and_then(|d| d.get(TLS_CERT_KEY))
            .and_then(|cert| CertificateInfo::from_pem(&cert.0).ok())
            .is_some_and(|info| !info.needs_rotation());
        fresh
    }

    async fn request_certificate(&mut self) -> Result<(), Error> {
        let (request_pem, key_pem) = crate::certificate::generate_csr(
            &self.config.cluster_name,
            &self.config.addon_name,
            &self.config.agent_name,
        )?;

        let labels: BTreeMap<String, String> = [(
            CLUSTER_NAME_LABEL.to_string(),
            self.config.cluster_name.clone(),
        )]
        .into();
        let csr = CertificateSigningRequest {
            metadata: ObjectMeta {
                generate_name: Some(identity::csr_generate_name(
                    &self.config.cluster_name,
                    &self.config.addon_name,
                )),
                labels: Some(labels),
                ..Default::default()
            },
            spec: CertificateSigningRequestSpec {
                request: ByteString(request_pem.into_bytes()),
                signer_name: self.config.signer.clone(),
                usages: Some(vec![
                    "digital signature".to_string(),
                    "key encipherment".to_string(),
                    "client auth".to_string(),
                ]),
                ..Default::default()
            },
            status: None,
        };

        let created = self.csr_api.create_csr(&csr).await?;
        info!(
            addon = %self.config.addon_name,
            csr = %created.name_any(),
            "Filed certificate signing request"
        );
        self.in_flight = Some(InFlightRequest {
            csr_name: created.name_any(),
            key_pem,
        });
        Ok(())
    }

    async fn persist_identity(
        &mut self,
        existing: Option<Secret>,
        certificate_pem: Vec<u8>,
    ) -> Result<(), Error> {
        let request = self
            .in_flight
            .as_ref()
            .ok_or_else(|| Error::internal("client-cert", "no in-flight request to persist"))?;

        let kubeconfig =
            build_kubeconfig(&self.config.hub_server, self.config.hub_ca_data.as_deref())?;
        let data = identity_secret_data(
            kubeconfig,
            certificate_pem,
            request.key_pem.clone().into_bytes(),
            &self.config.cluster_name,
            &self.config.agent_name,
        );

        match existing {
            Some(mut secret) => {
                secret.data = Some(data);
                self.spoke.update_secret(&secret).await?;
            }
            None => {
                let secret = Secret {
                    metadata: ObjectMeta {
                        name: Some(self.config.secret_name.clone()),
                        namespace: Some(self.config.secret_namespace.clone()),
                        ..Default::default()
                    },
                    data: Some(data),
                    ..Default::default()
                };
                self.spoke.create_secret(&secret).await?;
            }
        }

        info!(
            addon = %self.config.addon_name,
            agent = %self.config.agent_name,
            secret = %self.config.secret_name,
            "Persisted issued hub identity"
        );
        self.in_flight = None;
        Ok(())
    }
}
