use anyhow::Result;
use k8s_openapi::api::coordination::v1 as coordv1;
use kube::api::{ObjectMeta, PatchParams};
use opa_scaler_k8s_api::{Api, Deployment, Resource};
use std::sync::Arc;
use tokio::{sync::watch, time};

const LEASE_DURATION: time::Duration = time::Duration::from_secs(30);
const LEASE_NAME: &str = "opa-scaler-write";
const RENEW_GRACE_PERIOD: time::Duration = time::Duration::from_secs(1);
const FIELD_MANAGER: &str = "opa-scaler";

pub async fn init<T>(
    runtime: &kubert::Runtime<T>,
    namespace: &str,
    deployment_name: &str,
    claimant: &str,
) -> Result<watch::Receiver<Arc<kubert::lease::Claim>>> {
    let params = kubert::LeaseParams {
        name: LEASE_NAME.to_string(),
        namespace: namespace.to_string(),
        claimant: claimant.to_string(),
        lease_duration: LEASE_DURATION,
        renew_grace_period: RENEW_GRACE_PERIOD,
        field_manager: Some(FIELD_MANAGER.into()),
    };

    // The Lease is owned by the controller Deployment when one is resolvable
    // so that it is reaped with the installation.
    let deployments = Api::<Deployment>::namespaced(runtime.client(), namespace);
    let owner = match deployments.get_opt(deployment_name).await {
        Ok(Some(deployment)) => deployment.controller_owner_ref(&()),
        Ok(None) => {
            tracing::debug!(%deployment_name, "Controller deployment not found");
            None
        }
        Err(error) => {
            tracing::warn!(%error, "Failed to fetch controller deployment");
            None
        }
    };

    let lease = coordv1::Lease {
        metadata: ObjectMeta {
            name: Some(params.name.clone()),
            namespace: Some(params.namespace.clone()),
            // Specifying a resource version of "0" means that we will
            // only create the Lease if it does not already exist.
            resource_version: Some("0".to_string()),
            owner_references: owner.map(|owner| vec![owner]),
            labels: Some(
                [
                    (
                        "app.kubernetes.io/part-of".to_string(),
                        "opa-scaler".to_string(),
                    ),
                    (
                        "app.kubernetes.io/managed-by".to_string(),
                        "opa-scaler-operator".to_string(),
                    ),
                ]
                .into_iter()
                .collect(),
            ),
            ..Default::default()
        },
        spec: None,
    };
    let patch = kube::api::Patch::Apply(lease);
    let patch_params = PatchParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    };
    let api = Api::<coordv1::Lease>::namespaced(runtime.client(), namespace);

    // An individual request may time out or hit a transient error, so we try
    // up to 3 times with a brief pause.
    let mut tries = 3;
    loop {
        tries -= 1;
        let error = match api.patch(LEASE_NAME, &patch_params, &patch).await {
            Ok(lease) => {
                tracing::info!(?lease, "Created Lease");
                break;
            }
            Err(kube::Error::Api(error)) if error.code >= 500 => anyhow::Error::new(error),
            Err(kube::Error::Api(error)) => {
                tracing::debug!(?error, "Lease already exists");
                break;
            }
            Err(error) => anyhow::Error::new(error),
        };
        if tries == 0 {
            anyhow::bail!(error);
        }
        tracing::warn!(%error, "Failed to create Lease, retrying in 1s...");
        time::sleep(time::Duration::from_secs(1)).await;
    }

    let (claim, _task) = runtime.spawn_lease(params).await?;
    Ok(claim)
}
