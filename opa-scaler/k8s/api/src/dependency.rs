use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Declares that a named policy must be in effect for a named consumer
/// service. The controller schedules the policy onto an engine and reports
/// progress through `status`.
#[derive(Clone, Debug, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "opas.polimi.it",
    version = "v1alpha1",
    kind = "Dependency",
    status = "DependencyStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct DependencySpec {
    #[schemars(length(min = 1, max = 63))]
    pub service_name: String,

    #[schemars(length(min = 1, max = 63))]
    pub policy_name: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DependencyStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Whether the policy is scheduled on one of the engines in
    /// `engine_name`.
    #[serde(default)]
    pub deployed: bool,

    /// Engines the policy has been scheduled onto. May be set before the
    /// policy is actually deployed.
    #[serde(default)]
    pub engine_name: Vec<String>,
}
