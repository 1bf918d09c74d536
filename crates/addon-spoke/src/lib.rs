//! Spoke-side agent for the addon framework
//!
//! Runs next to the add-on agents on a managed cluster. Three concerns:
//! the certificate manager drives each registered add-on through identity
//! bootstrap and rotation against the hub; the lease observer derives each
//! add-on's `Degraded` condition from its agent heartbeat leases; and the
//! hub lease renewer keeps this cluster's heartbeat alive so the hub keeps
//! trusting the reported conditions. [`lease::AddonHeartbeat`] is the
//! renewer an add-on agent embeds on its own side.

pub mod agent;
pub mod cert_manager;
pub mod certificate;
pub mod client;
pub mod client_cert;
pub mod lease;
pub mod lease_observer;

pub use agent::SpokeAgentOptions;
