use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A named unit of authorization logic, either inline rego source or a
/// reference to a packaged policy artifact.
///
/// Exactly one of `rego` and `image` must be set; admission rejects
/// everything else.
#[derive(Clone, Debug, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "opas.polimi.it",
    version = "v1alpha1",
    kind = "Policy",
    status = "PolicyStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct PolicySpec {
    /// Inline rego source pushed to engines as-is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rego: Option<String>,

    /// Reference to a packaged policy artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PolicyStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}
