//! MachineClass Custom Resource Definition
//!
//! A MachineClass carries the provider-specific VM recipe (instance type,
//! image, network wiring) as an opaque blob plus a reference to the secret
//! holding provider credentials. The core never interprets the blob; it is
//! handed to the driver verbatim.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Reference to the Secret holding provider credentials and user data.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecretRef {
    /// Secret name
    pub name: String,

    /// Secret namespace; defaults to the class's namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Specification for a MachineClass
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "machine.sapcloud.io",
    version = "v1alpha1",
    kind = "MachineClass",
    plural = "machineclasses",
    shortname = "mcc",
    namespaced,
    printcolumn = r#"{"name":"Provider","type":"string","jsonPath":".spec.provider"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MachineClassSpec {
    /// Name of the provider driver this class targets (e.g. "aws")
    pub provider: String,

    /// Opaque provider-specific VM configuration, passed to the driver
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_spec: Option<serde_json::Value>,

    /// Credentials secret reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretRef>,
}
