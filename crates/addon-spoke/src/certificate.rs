//! Certificate inspection and identity-secret validation
//!
//! The spoke persists its issued hub identity into a secret holding a
//! kubeconfig, the TLS keypair and the (cluster, agent) naming. This module
//! decides whether that persisted identity is usable: all keys present, the
//! certificate subject embedding the expected identity, and the certificate
//! inside its validity window. Rotation starts at 80% of the lifetime.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use x509_parser::prelude::*;

use addon_common::{identity, Error};

/// Identity secret keys
pub const KUBECONFIG_KEY: &str = "kubeconfig";
pub const TLS_CERT_KEY: &str = "tls.crt";
pub const TLS_KEY_KEY: &str = "tls.key";
pub const CLUSTER_NAME_KEY: &str = "cluster-name";
pub const AGENT_NAME_KEY: &str = "agent-name";

/// Rotation threshold as a fraction of certificate lifetime
pub const ROTATION_THRESHOLD: f64 = 0.80;

/// Parsed validity and subject data of a client certificate
#[derive(Debug, Clone)]
pub struct CertificateInfo {
    /// When the certificate becomes valid (Unix timestamp)
    pub not_before: i64,
    /// When the certificate expires (Unix timestamp)
    pub not_after: i64,
    /// Subject common name
    pub common_name: String,
}

impl CertificateInfo {
    /// Parse certificate info from PEM-encoded certificate bytes
    pub fn from_pem(pem_data: &[u8]) -> Result<Self, Error> {
        let block = ::pem::parse(pem_data)
            .map_err(|e| Error::certificate(format!("failed to parse PEM: {e}")))?;
        Self::from_der(block.contents())
    }

    /// Parse certificate info from DER-encoded certificate bytes
    pub fn from_der(der: &[u8]) -> Result<Self, Error> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| Error::certificate(format!("failed to parse certificate: {e}")))?;

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or("")
            .to_string();

        Ok(Self {
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
            common_name,
        })
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    /// Whether the current time falls inside the validity window
    pub fn is_valid_now(&self) -> bool {
        let now = Self::now();
        self.not_before <= now && now < self.not_after
    }

    /// Whether the certificate passed the rotation threshold of its lifetime
    pub fn needs_rotation(&self) -> bool {
        let lifetime = (self.not_after - self.not_before) as f64;
        if lifetime <= 0.0 {
            return true;
        }
        let age = (Self::now() - self.not_before) as f64;
        age / lifetime >= ROTATION_THRESHOLD
    }
}

/// Extract the (cluster, agent) pair from an agent certificate common name.
///
/// The CN convention is
/// `system:open-cluster-management:cluster:<cluster>:addon:<addon>:agent:<agent>`.
pub fn cluster_agent_names(common_name: &str) -> Option<(String, String)> {
    let rest = common_name.strip_prefix("system:open-cluster-management:cluster:")?;
    let (cluster, rest) = rest.split_once(":addon:")?;
    let (_, agent) = rest.split_once(":agent:")?;
    if cluster.is_empty() || agent.is_empty() {
        return None;
    }
    Some((cluster.to_string(), agent.to_string()))
}

/// Read the agent name persisted in an identity secret, if any
pub fn agent_name_from_secret(secret: &Secret) -> Option<String> {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(AGENT_NAME_KEY))
        .and_then(|v| String::from_utf8(v.0.clone()).ok())
        .filter(|name| !name.is_empty())
}

/// Whether a persisted identity secret is usable for (cluster, agent).
///
/// Valid means: kubeconfig, keypair and agent name all present, the
/// certificate issued to exactly this (cluster, agent) pair, and the
/// certificate inside its validity window.
pub fn identity_secret_is_valid(secret: &Secret, cluster_name: &str, agent_name: &str) -> bool {
    let Some(data) = secret.data.as_ref() else {
        return false;
    };
    let present = |key: &str| data.get(key).is_some_and(|v| !v.0.is_empty());
    if !present(KUBECONFIG_KEY) || !present(TLS_KEY_KEY) || !present(AGENT_NAME_KEY) {
        return false;
    }
    let Some(cert_data) = data.get(TLS_CERT_KEY).filter(|v| !v.0.is_empty()) else {
        return false;
    };

    let Ok(info) = CertificateInfo::from_pem(&cert_data.0) else {
        return false;
    };
    let Some((cert_cluster, cert_agent)) = cluster_agent_names(&info.common_name) else {
        return false;
    };
    if cert_cluster != cluster_name || cert_agent != agent_name {
        return false;
    }

    info.is_valid_now()
}

/// Assemble the kubeconfig persisted next to the issued keypair.
///
/// The client certificate and key are referenced as sibling files named
/// after the secret keys, so a pod mounting the secret gets a working
/// config without rewriting it on every rotation.
pub fn build_kubeconfig(hub_server: &str, hub_ca_data: Option<&str>) -> Result<Vec<u8>, Error> {
    let mut cluster = serde_json::json!({ "server": hub_server });
    if let Some(ca) = hub_ca_data {
        cluster["certificate-authority-data"] = serde_json::Value::String(ca.to_string());
    }
    let kubeconfig = serde_json::json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{ "name": "default-cluster", "cluster": cluster }],
        "users": [{
            "name": "default-auth",
            "user": {
                "client-certificate": TLS_CERT_KEY,
                "client-key": TLS_KEY_KEY,
            },
        }],
        "contexts": [{
            "name": "default-context",
            "context": { "cluster": "default-cluster", "user": "default-auth" },
        }],
        "current-context": "default-context",
    });

    serde_yaml::to_string(&kubeconfig)
        .map(String::into_bytes)
        .map_err(|e| Error::serialization_for_kind("Kubeconfig", e.to_string()))
}

/// Build the identity secret payload for a freshly issued certificate
pub fn identity_secret_data(
    kubeconfig: Vec<u8>,
    cert_pem: Vec<u8>,
    key_pem: Vec<u8>,
    cluster_name: &str,
    agent_name: &str,
) -> BTreeMap<String, k8s_openapi::ByteString> {
    use k8s_openapi::ByteString;
    [
        (KUBECONFIG_KEY.to_string(), ByteString(kubeconfig)),
        (TLS_CERT_KEY.to_string(), ByteString(cert_pem)),
        (TLS_KEY_KEY.to_string(), ByteString(key_pem)),
        (
            CLUSTER_NAME_KEY.to_string(),
            ByteString(cluster_name.as_bytes().to_vec()),
        ),
        (
            AGENT_NAME_KEY.to_string(),
            ByteString(agent_name.as_bytes().to_vec()),
        ),
    ]
    .into()
}

/// Generate a keypair and a PEM certificate request for the agent identity
pub fn generate_csr(
    cluster_name: &str,
    addon_name: &str,
    agent_name: &str,
) -> Result<(String, String), Error> {
    use rcgen::{CertificateParams, DistinguishedName, DnType, DnValue, KeyPair};

    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(identity::agent_group(cluster_name, addon_name)),
    );
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(identity::agent_user(cluster_name, addon_name, agent_name)),
    );
    let mut params = CertificateParams::default();
    params.distinguished_name = dn;

    let key = KeyPair::generate()
        .map_err(|e| Error::certificate(format!("key generation failed: {e}")))?;
    let request = params
        .serialize_request(&key)
        .map_err(|e| Error::certificate(format!("request generation failed: {e}")))?;
    let request_pem = request
        .pem()
        .map_err(|e| Error::certificate(format!("request encoding failed: {e}")))?;
    Ok((request_pem, key.serialize_pem()))
}
