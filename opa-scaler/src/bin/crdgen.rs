//! Prints the opa-scaler CustomResourceDefinitions as YAML.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use anyhow::Result;
use kube::CustomResourceExt;
use opa_scaler_k8s_api::{Dependency, OpaEngine, Policy};

fn main() -> Result<()> {
    for crd in [Policy::crd(), OpaEngine::crd(), Dependency::crd()] {
        println!("---");
        print!("{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
