//! OpaEngine reconciliation: drives each engine toward a running
//! Deployment/Service pair and keeps the runtime's loaded-policy set in sync
//! with the engine's spec.

use crate::{
    is_conflict, is_not_found, update_status_with, update_with, Ctx, Error, Result,
    NON_LEADER_REQUEUE,
};
use kube::runtime::controller::Action;
use opa_scaler_k8s_api::{
    self as k8s,
    conditions::{self, condition},
    Api, Condition, Container, DeleteParams, Deployment, DeploymentSpec, HTTPGetAction,
    IntOrString, LabelSelector, ObjectMeta, OwnerReference, PodSpec, PodTemplateSpec, PostParams,
    Probe, Resource, ResourceExt, Service, ServicePort, ServiceSpec, ENGINE_FINALIZER,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{debug, info, warn};

const MANAGEMENT_PORT: i32 = 8181;

pub async fn reconcile(engine: Arc<k8s::OpaEngine>, ctx: Arc<Ctx>) -> Result<Action> {
    if !ctx.is_leader() {
        return Ok(Action::requeue(NON_LEADER_REQUEUE));
    }

    let namespace = engine
        .namespace()
        .ok_or(Error::MissingMeta("metadata.namespace"))?;
    let name = engine.name_any();
    let engines: Api<k8s::OpaEngine> = Api::namespaced(ctx.client.clone(), &namespace);

    // First reconciliation: record that we have started before anything can
    // fail.
    if engine
        .status
        .as_ref()
        .map_or(true, |s| s.conditions.is_empty())
    {
        info!(%namespace, %name, "First reconciliation of OPA engine");
        if let Err(error) = update_condition(
            &engines,
            &name,
            condition(
                conditions::AVAILABLE,
                conditions::STATUS_UNKNOWN,
                conditions::REASON_RECONCILING,
                "Starting reconciliation of the OpaEngine",
            ),
        )
        .await
        {
            warn!(%error, "Unable to add condition to OpaEngine");
            return Ok(Action::requeue(Duration::from_secs(1)));
        }
    }

    if engine.metadata.deletion_timestamp.is_none() {
        if !engine.finalizers().iter().any(|f| f == ENGINE_FINALIZER) {
            info!(%namespace, %name, "Adding finalizer to OpaEngine");
            update_with(&engines, &name, |engine| {
                let finalizers = engine.metadata.finalizers.get_or_insert_with(Vec::new);
                if finalizers.iter().any(|f| f == ENGINE_FINALIZER) {
                    return false;
                }
                finalizers.push(ENGINE_FINALIZER.to_string());
                true
            })
            .await?;
        }
    } else {
        if engine.finalizers().iter().any(|f| f == ENGINE_FINALIZER) {
            delete_children(&ctx, &namespace, &name).await?;

            info!(%namespace, %name, "Removing finalizer from OpaEngine");
            update_with(&engines, &name, |engine| {
                match engine.metadata.finalizers.as_mut() {
                    Some(finalizers) => {
                        let before = finalizers.len();
                        finalizers.retain(|f| f != ENGINE_FINALIZER);
                        finalizers.len() != before
                    }
                    None => false,
                }
            })
            .await?;
        }

        debug!(%namespace, %name, "OpaEngine is being deleted");
        return Ok(Action::await_change());
    }

    let owner = engine
        .controller_owner_ref(&())
        .ok_or(Error::MissingMeta("metadata.uid"))?;

    let services: Api<Service> = Api::namespaced(ctx.client.clone(), &namespace);
    if services.get_opt(&name).await?.is_none() {
        let service = service_for(&engine, owner.clone());
        info!(%namespace, %name, "Creating Service");
        match services.create(&PostParams::default(), &service).await {
            Ok(_) => {}
            // Another worker won the race; the next pass observes it.
            Err(error) if is_conflict(&error) => {}
            Err(error) => {
                warn!(%namespace, %name, %error, "Unable to create Service for OpaEngine");
                update_condition(
                    &engines,
                    &name,
                    condition(
                        conditions::DEGRADED,
                        conditions::STATUS_TRUE,
                        conditions::REASON_SERVICE_ERROR,
                        "Unable to create Service for OpaEngine",
                    ),
                )
                .await?;
                return Err(error.into());
            }
        }
    }

    let deployments: Api<Deployment> = Api::namespaced(ctx.client.clone(), &namespace);
    let deployment = match deployments.get_opt(&name).await? {
        Some(deployment) => deployment,
        None => {
            let deployment = deployment_for(&engine, owner);
            info!(%namespace, %name, "Creating Deployment");
            match deployments.create(&PostParams::default(), &deployment).await {
                Ok(_) => {
                    // Give the replicas a chance to come up before syncing
                    // policies.
                    return Ok(Action::requeue(Duration::from_secs(5)));
                }
                Err(error) if is_conflict(&error) => {
                    return Ok(Action::requeue(Duration::from_secs(5)));
                }
                Err(error) => {
                    warn!(%namespace, %name, %error, "Unable to create Deployment for OpaEngine");
                    update_condition(
                        &engines,
                        &name,
                        condition(
                            conditions::DEGRADED,
                            conditions::STATUS_TRUE,
                            conditions::REASON_DEPLOYMENT_ERROR,
                            "Unable to create Deployment for OpaEngine",
                        ),
                    )
                    .await?;
                    return Err(error.into());
                }
            }
        }
    };

    let desired = deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let available = deployment
        .status
        .as_ref()
        .and_then(|s| s.available_replicas)
        .unwrap_or(0);
    if available == desired {
        update_condition(
            &engines,
            &name,
            condition(
                conditions::AVAILABLE,
                conditions::STATUS_TRUE,
                conditions::REASON_AVAILABLE,
                "OpaEngine is available",
            ),
        )
        .await?;
        sync_policies(&ctx, &engines, &engine, &namespace, &name).await?;
    } else {
        update_condition(
            &engines,
            &name,
            condition(
                conditions::AVAILABLE,
                conditions::STATUS_FALSE,
                conditions::REASON_UNAVAILABLE,
                "OpaEngine is not available",
            ),
        )
        .await?;
    }

    Ok(Action::await_change())
}

pub fn error_policy(engine: Arc<k8s::OpaEngine>, error: &Error, _ctx: Arc<Ctx>) -> Action {
    warn!(name = %engine.name_any(), %error, "OpaEngine reconciliation failed");
    Action::requeue(Duration::from_secs(1))
}

/// Deletes the child Deployment and Service ahead of finalizer removal. A
/// child that is already gone counts as deleted.
async fn delete_children(ctx: &Ctx, namespace: &str, name: &str) -> Result<()> {
    let deployments: Api<Deployment> = Api::namespaced(ctx.client.clone(), namespace);
    match deployments.delete(name, &DeleteParams::default()).await {
        Ok(_) => {}
        Err(error) if is_not_found(&error) => {}
        Err(error) => {
            warn!(%namespace, %name, %error, "Unable to delete Deployment for OpaEngine");
            return Err(error.into());
        }
    }

    let services: Api<Service> = Api::namespaced(ctx.client.clone(), namespace);
    match services.delete(name, &DeleteParams::default()).await {
        Ok(_) => {}
        Err(error) if is_not_found(&error) => {}
        Err(error) => {
            warn!(%namespace, %name, %error, "Unable to delete Service for OpaEngine");
            return Err(error.into());
        }
    }

    Ok(())
}

/// Reconciles the runtime's loaded policies against the engine's spec,
/// recording progress in status.policies as pushes and deletes succeed.
async fn sync_policies(
    ctx: &Ctx,
    engines: &Api<k8s::OpaEngine>,
    engine: &k8s::OpaEngine,
    namespace: &str,
    name: &str,
) -> Result<()> {
    let observed = engine
        .status
        .as_ref()
        .map(|s| s.policies.clone())
        .unwrap_or_default();
    let (to_add, to_remove) = opa_scaler_opa::diff(&engine.spec.policies, &observed);
    let url = format!("http://{name}.{namespace}.svc.cluster.local:{MANAGEMENT_PORT}");
    debug!(
        ?to_add,
        ?to_remove,
        spec = ?engine.spec.policies,
        status = ?observed,
        "Policy situation"
    );

    if !to_add.is_empty() {
        let policies: Api<k8s::Policy> = Api::namespaced(ctx.client.clone(), namespace);
        let mut batch = Vec::with_capacity(to_add.len());
        for policy_name in &to_add {
            let policy = match policies.get(policy_name).await {
                Ok(policy) => policy,
                Err(error) => {
                    warn!(%namespace, %name, policy = %policy_name, %error, "Unable to fetch Policy");
                    return Err(error.into());
                }
            };
            match policy.spec.rego {
                Some(rego) => batch.push((policy_name.clone(), rego)),
                None => {
                    // Image-packaged policies have no source to push over the
                    // management API; nothing to retry until the Policy changes.
                    tracing::error!(
                        %namespace, %name, policy = %policy_name,
                        "Policy has no rego source and cannot be pushed"
                    );
                }
            }
        }

        match ctx.opa.push_policies(&url, &batch).await {
            Ok(added) => {
                info!(%namespace, %name, ?added, "Added policies");
                record_loaded(engines, name, &added, &[]).await?;
            }
            Err(incomplete) => {
                warn!(%namespace, %name, error = %incomplete, "Unable to add policies");
                if !incomplete.done.is_empty() {
                    record_loaded(engines, name, &incomplete.done, &[]).await?;
                }
                return Err(incomplete.into());
            }
        }
    }

    if !to_remove.is_empty() {
        match ctx.opa.delete_policies(&url, &to_remove).await {
            Ok(removed) => {
                info!(%namespace, %name, ?removed, "Removed policies");
                record_loaded(engines, name, &[], &removed).await?;
            }
            Err(incomplete) => {
                warn!(%namespace, %name, error = %incomplete, "Unable to remove policies");
                if !incomplete.done.is_empty() {
                    record_loaded(engines, name, &[], &incomplete.done).await?;
                }
                return Err(incomplete.into());
            }
        }
    }

    Ok(())
}

/// Folds freshly pushed and deleted policy names into status.policies.
async fn record_loaded(
    engines: &Api<k8s::OpaEngine>,
    name: &str,
    added: &[String],
    removed: &[String],
) -> Result<()> {
    update_status_with(engines, name, |engine| {
        let status = engine.status.get_or_insert_with(Default::default);
        let mut changed = false;
        for policy in added {
            if !status.policies.contains(policy) {
                status.policies.push(policy.clone());
                changed = true;
            }
        }
        let before = status.policies.len();
        status.policies.retain(|p| !removed.contains(p));
        changed || status.policies.len() != before
    })
    .await?;
    Ok(())
}

async fn update_condition(
    engines: &Api<k8s::OpaEngine>,
    name: &str,
    new: Condition,
) -> Result<()> {
    let changed = update_status_with(engines, name, |engine| {
        let status = engine.status.get_or_insert_with(Default::default);
        conditions::set_condition(&mut status.conditions, new.clone())
    })
    .await?;
    if changed {
        info!(
            condition = %new.type_,
            status = %new.status,
            reason = %new.reason,
            "Adding condition"
        );
    }
    Ok(())
}

pub(crate) fn engine_labels(engine: &k8s::OpaEngine) -> BTreeMap<String, String> {
    [
        ("app.kubernetes.io/name", engine.name_any()),
        (
            "app.kubernetes.io/instance",
            engine.spec.instance_name.clone(),
        ),
        ("app.kubernetes.io/component", "opa-engine".to_string()),
        ("app.kubernetes.io/part-of", "opa-scaler".to_string()),
        (
            "app.kubernetes.io/managed-by",
            "opa-scaler-operator".to_string(),
        ),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

fn http_probe(path: &str) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::Int(MANAGEMENT_PORT),
            ..Default::default()
        }),
        initial_delay_seconds: Some(5),
        period_seconds: Some(3),
        ..Default::default()
    }
}

fn deployment_for(engine: &k8s::OpaEngine, owner: OwnerReference) -> Deployment {
    let labels = engine_labels(engine);
    let replicas = if engine.spec.replicas == 0 {
        1
    } else {
        engine.spec.replicas
    };

    Deployment {
        metadata: ObjectMeta {
            name: Some(engine.name_any()),
            namespace: engine.namespace(),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "opa".to_string(),
                        image: Some(engine.spec.image.clone()),
                        args: Some(
                            ["run", "--server", "--addr", ":8181", "--log-level", "debug"]
                                .into_iter()
                                .map(String::from)
                                .collect(),
                        ),
                        liveness_probe: Some(http_probe("/health")),
                        readiness_probe: Some(http_probe("/health?bundle=true")),
                        resources: engine.spec.resources.clone(),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn service_for(engine: &k8s::OpaEngine, owner: OwnerReference) -> Service {
    let labels = engine_labels(engine);

    Service {
        metadata: ObjectMeta {
            name: Some(engine.name_any()),
            namespace: engine.namespace(),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(labels),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port: MANAGEMENT_PORT,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opa_scaler_k8s_api::{OpaEngine, OpaEngineSpec};

    fn test_engine(policies: &[&str]) -> OpaEngine {
        let mut engine = OpaEngine::new(
            "default",
            OpaEngineSpec {
                image: "openpolicyagent/opa:test".to_string(),
                replicas: 2,
                resources: None,
                instance_name: "primary".to_string(),
                policies: policies.iter().map(|p| p.to_string()).collect(),
            },
        );
        engine.metadata.namespace = Some("ns-1".to_string());
        engine.metadata.uid = Some("uid-1".to_string());
        engine
    }

    fn owner_for(engine: &OpaEngine) -> OwnerReference {
        engine.controller_owner_ref(&()).unwrap()
    }

    #[test]
    fn labels_identify_the_engine_instance() {
        let labels = engine_labels(&test_engine(&[]));
        assert_eq!(labels["app.kubernetes.io/name"], "default");
        assert_eq!(labels["app.kubernetes.io/instance"], "primary");
        assert_eq!(labels["app.kubernetes.io/component"], "opa-engine");
        assert_eq!(labels["app.kubernetes.io/part-of"], "opa-scaler");
        assert_eq!(labels["app.kubernetes.io/managed-by"], "opa-scaler-operator");
    }

    #[test]
    fn deployment_runs_the_opa_server() {
        let engine = test_engine(&[]);
        let deployment = deployment_for(&engine, owner_for(&engine));

        assert_eq!(deployment.metadata.name.as_deref(), Some("default"));
        assert_eq!(deployment.metadata.namespace.as_deref(), Some("ns-1"));
        let spec = deployment.spec.unwrap();
        assert_eq!(spec.replicas, Some(2));
        assert_eq!(spec.selector.match_labels, Some(engine_labels(&engine)));

        let container = &spec.template.spec.unwrap().containers[0];
        assert_eq!(container.name, "opa");
        assert_eq!(container.image.as_deref(), Some("openpolicyagent/opa:test"));
        assert_eq!(
            container.args.as_ref().unwrap(),
            &["run", "--server", "--addr", ":8181", "--log-level", "debug"]
        );

        let liveness = container.liveness_probe.as_ref().unwrap();
        let get = liveness.http_get.as_ref().unwrap();
        assert_eq!(get.path.as_deref(), Some("/health"));
        assert_eq!(get.port, IntOrString::Int(8181));
        assert_eq!(liveness.initial_delay_seconds, Some(5));
        assert_eq!(liveness.period_seconds, Some(3));

        let readiness = container.readiness_probe.as_ref().unwrap();
        assert_eq!(
            readiness.http_get.as_ref().unwrap().path.as_deref(),
            Some("/health?bundle=true")
        );
    }

    #[test]
    fn deployment_defaults_zero_replicas_to_one() {
        let mut engine = test_engine(&[]);
        engine.spec.replicas = 0;
        let deployment = deployment_for(&engine, owner_for(&engine));
        assert_eq!(deployment.spec.unwrap().replicas, Some(1));
    }

    #[test]
    fn children_are_owned_by_the_engine() {
        let engine = test_engine(&[]);
        let deployment = deployment_for(&engine, owner_for(&engine));
        let service = service_for(&engine, owner_for(&engine));

        for child_owners in [
            deployment.metadata.owner_references.unwrap(),
            service.metadata.owner_references.unwrap(),
        ] {
            assert_eq!(child_owners.len(), 1);
            let owner = &child_owners[0];
            assert_eq!(owner.kind, "OpaEngine");
            assert_eq!(owner.name, "default");
            assert_eq!(owner.controller, Some(true));
        }
    }

    #[test]
    fn service_exposes_the_management_port() {
        let engine = test_engine(&[]);
        let service = service_for(&engine, owner_for(&engine));

        let spec = service.spec.unwrap();
        assert_eq!(spec.selector, Some(engine_labels(&engine)));
        let ports = spec.ports.unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].name.as_deref(), Some("http"));
        assert_eq!(ports[0].port, 8181);
    }
}
