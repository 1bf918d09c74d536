//! Error types for the addon framework
//!
//! Errors carry context fields (cluster, add-on names) to aid debugging in
//! production. Reconcilers return these to the controller runtime, which
//! requeues retryable failures with backoff.

use thiserror::Error;

/// Main error type for hub and spoke reconcilers
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The add-on's delivery envelopes are still being deleted
    #[error("{remaining} delivery envelope(s) of addon {addon} still being deleted")]
    PendingCleanup {
        /// Add-on whose envelopes are mid-deletion
        addon: String,
        /// Number of envelopes that still exist
        remaining: usize,
    },

    /// The manifest supplier returned an error
    #[error("manifest supplier error for addon {addon}: {message}")]
    Supplier {
        /// Add-on whose supplier failed
        addon: String,
        /// Description of what failed
        message: String,
    },

    /// Certificate or CSR material could not be generated or parsed
    #[error("certificate error: {message}")]
    Certificate {
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Invalid configuration supplied at startup
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of what is invalid
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "cert-manager", "lease")
        context: String,
    },
}

impl Error {
    /// Create a supplier error for an add-on
    pub fn supplier(addon: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Supplier {
            addon: addon.into(),
            message: msg.into(),
        }
    }

    /// Create a certificate error with the given message
    pub fn certificate(msg: impl Into<String>) -> Self {
        Self::Certificate {
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a configuration error with the given message
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Configuration and serialization errors are not retryable (require a
    /// fix). Kubernetes errors depend on the status code. Pending cleanup is
    /// always retryable: the next pass re-checks whether envelopes are gone.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409 && ae.code != 429
                )
            }
            Error::PendingCleanup { .. } => true,
            Error::Supplier { .. } => true,
            Error::Certificate { .. } => false,
            Error::Serialization { .. } => false,
            Error::Configuration { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// True for an optimistic-concurrency conflict (HTTP 409)
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 409)
    }

    /// True when the server reported the object missing (HTTP 404)
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 404)
    }
}
