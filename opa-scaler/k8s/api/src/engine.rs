use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Image run by engines that do not specify one.
pub const DEFAULT_ENGINE_IMAGE: &str = "openpolicyagent/opa:latest-envoy";

/// One logical OPA runtime instance, realized as a Deployment/Service pair
/// named after the engine.
#[derive(Clone, Debug, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "opas.polimi.it",
    version = "v1alpha1",
    kind = "OpaEngine",
    status = "OpaEngineStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct OpaEngineSpec {
    /// Container image for the OPA runtime.
    #[serde(default = "default_image")]
    pub image: String,

    /// Number of replicas backing this engine.
    #[serde(default = "default_replicas")]
    #[schemars(range(min = 1))]
    pub replicas: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    #[schemars(length(min = 1))]
    pub instance_name: String,

    /// Policies this engine is expected to load, by name.
    #[serde(default)]
    pub policies: Vec<String>,
}

/// Most recently observed state of an engine.
///
/// Condition types are `Available`, `Progressing` and `Degraded`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OpaEngineStatus {
    /// Policies confirmed loaded in the running engine.
    #[serde(default)]
    pub policies: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

fn default_image() -> String {
    DEFAULT_ENGINE_IMAGE.to_string()
}

fn default_replicas() -> i32 {
    1
}
