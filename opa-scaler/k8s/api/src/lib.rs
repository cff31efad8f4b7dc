#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod conditions;
mod dependency;
mod engine;
mod policy;

pub use self::dependency::{Dependency, DependencySpec, DependencyStatus};
pub use self::engine::{OpaEngine, OpaEngineSpec, OpaEngineStatus, DEFAULT_ENGINE_IMAGE};
pub use self::policy::{Policy, PolicySpec, PolicyStatus};

pub use k8s_openapi::{
    api::{
        self,
        apps::v1::{Deployment, DeploymentSpec},
        core::v1::{
            Container, HTTPGetAction, PodSpec, PodTemplateSpec, Probe, ResourceRequirements,
            Service, ServicePort, ServiceSpec,
        },
    },
    apimachinery::{
        self,
        pkg::{
            apis::meta::v1::{Condition, LabelSelector, OwnerReference, Time},
            util::intstr::IntOrString,
        },
    },
};
pub use kube::{
    api::{
        Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams, Resource,
        ResourceExt,
    },
    error::ErrorResponse,
    Client, Error,
};

/// API group shared by the opa-scaler resources.
pub const API_GROUP: &str = "opas.polimi.it";

/// Finalizer held on an OpaEngine until its child Deployment and Service
/// have been deleted.
pub const ENGINE_FINALIZER: &str = "opa-scaler.polimi.it/oe-finalizer";
