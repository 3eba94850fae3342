//! Synapse Operator Library
//!
//! Core functionality for the Synapse operator: the `Synapse` custom
//! resource, builders for its dependent resources, homeserver.yaml
//! rendering and fingerprinting, and the reconciliation engine.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub mod builders;
pub mod homeserver;
pub mod keys;
pub mod reconciler;
pub mod store;

/// Synapse Custom Resource Definition
///
/// Desired state of a single managed Synapse homeserver instance.
///
/// # Example
///
/// ```yaml
/// apiVersion: matrix.slrz.net/v1alpha1
/// kind: Synapse
/// metadata:
///   name: example
///   namespace: default
/// spec:
///   serverName: example.com
///   reportStats: false
/// ```
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "matrix.slrz.net",
    version = "v1alpha1",
    kind = "Synapse",
    plural = "synapses",
    namespaced,
    status = "SynapseStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct SynapseSpec {
    /// The synapse server's public DNS name. Must be non-empty.
    pub server_name: String,
    /// Enables anonymous statistics reporting.
    pub report_stats: bool,
    /// Container image used for running Synapse. Falls back to the
    /// operator's pinned default image if not specified.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// Observed state of a Synapse resource.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SynapseStatus {
    /// Name of the ConfigMap holding the homeserver configuration file(s).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map_name: Option<String>,
    /// Name of the Secret storing the server's signing key as well as
    /// other secrets used by synapse.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
}
