//! Dependency reconciliation: guarantees that the named policy is scheduled
//! onto some engine, creating the first engine on demand and splitting an
//! engine's policy set when its budget is exceeded.

use crate::{
    is_conflict, update_status_with, update_with, Ctx, Error, Result, NON_LEADER_REQUEUE,
};
use kube::runtime::controller::Action;
use opa_scaler_k8s_api::{
    self as k8s,
    conditions::{self, condition},
    Api, Condition, ListParams, OpaEngineSpec, PostParams, ResourceExt,
};
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{debug, info, warn};

pub async fn reconcile(dependency: Arc<k8s::Dependency>, ctx: Arc<Ctx>) -> Result<Action> {
    if !ctx.is_leader() {
        return Ok(Action::requeue(NON_LEADER_REQUEUE));
    }

    let namespace = dependency
        .namespace()
        .ok_or(Error::MissingMeta("metadata.namespace"))?;
    let name = dependency.name_any();
    let policy_name = dependency.spec.policy_name.clone();
    let dependencies: Api<k8s::Dependency> = Api::namespaced(ctx.client.clone(), &namespace);

    if dependency
        .status
        .as_ref()
        .map_or(true, |s| s.conditions.is_empty())
    {
        if let Err(error) = update_condition(
            &dependencies,
            &name,
            condition(
                conditions::AVAILABLE,
                conditions::STATUS_UNKNOWN,
                conditions::REASON_DEPENDENCY_NOT_READY,
                "Dependency is not ready",
            ),
        )
        .await
        {
            warn!(%namespace, %name, %error, "Unable to set default conditions");
            return Ok(Action::requeue(Duration::from_secs(1)));
        }
        info!(%namespace, %name, "Default conditions set");
    }

    if dependency.status.as_ref().is_some_and(|s| s.deployed) {
        debug!(%namespace, %name, "Dependency already deployed");
        return Ok(Action::await_change());
    }

    let policies: Api<k8s::Policy> = Api::namespaced(ctx.client.clone(), &namespace);
    match policies.get_opt(&policy_name).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            update_condition(
                &dependencies,
                &name,
                condition(
                    conditions::AVAILABLE,
                    conditions::STATUS_FALSE,
                    conditions::REASON_POLICY_NOT_FOUND,
                    "Policy not found",
                ),
            )
            .await?;
            info!(%namespace, %name, policy = %policy_name, "Policy not found");
            return Ok(Action::requeue(Duration::from_secs(10)));
        }
        Err(error) => {
            warn!(%namespace, %name, %error, "Unable to fetch Policy");
            return Ok(Action::requeue(Duration::from_secs(1)));
        }
    }

    // Re-check engines this dependency was already scheduled onto. An engine
    // that disappeared leaves a stale entry, which is skipped so the policy
    // is placed again below.
    let engines: Api<k8s::OpaEngine> = Api::namespaced(ctx.client.clone(), &namespace);
    let placements = dependency
        .status
        .as_ref()
        .map(|s| s.engine_name.clone())
        .unwrap_or_default();
    debug!(%namespace, %name, ?placements, "Checking scheduled engines");
    for engine_name in &placements {
        match engines.get_opt(engine_name).await? {
            Some(engine) if engine.spec.policies.iter().any(|p| p == &policy_name) => {
                info!(%namespace, %name, engine = %engine_name, "Policy already deployed");
                update_condition(
                    &dependencies,
                    &name,
                    condition(
                        conditions::AVAILABLE,
                        conditions::STATUS_TRUE,
                        conditions::REASON_POLICY_DEPLOYED,
                        "Policy already scheduled",
                    ),
                )
                .await?;
                update_status_with(&dependencies, &name, |dependency| {
                    let status = dependency.status.get_or_insert_with(Default::default);
                    if status.deployed {
                        return false;
                    }
                    status.deployed = true;
                    true
                })
                .await?;
                return Ok(Action::await_change());
            }
            Some(_) | None => {}
        }
    }

    info!(%namespace, %name, "Policy not scheduled, checking for policy engine");
    let engine_list = engines.list(&ListParams::default()).await?;
    if engine_list.items.is_empty() {
        let engine = default_engine(&ctx.default_engine_image, &namespace, &policy_name);
        match engines.create(&PostParams::default(), &engine).await {
            Ok(_) => {}
            Err(error) if is_conflict(&error) => {
                // Lost a race to create the default engine; place into it on
                // the next pass.
                return Ok(Action::requeue(Duration::from_secs(1)));
            }
            Err(error) => {
                warn!(%namespace, %name, %error, "Unable to create OpaEngine");
                return Err(error.into());
            }
        }
        info!(%namespace, %name, "OpaEngine created");
        update_condition(
            &dependencies,
            &name,
            condition(
                conditions::AVAILABLE,
                conditions::STATUS_FALSE,
                conditions::REASON_SCHEDULED,
                "Dependency scheduled in default engine",
            ),
        )
        .await?;
        record_placement(&dependencies, &name, "default").await?;
    } else {
        let target = &engine_list.items[0];
        add_policy_to_engine(&ctx, &engines, target, &namespace, &policy_name).await?;
        update_condition(
            &dependencies,
            &name,
            condition(
                conditions::AVAILABLE,
                conditions::STATUS_TRUE,
                conditions::REASON_POLICY_SCHEDULED,
                "Policy scheduled in existing engine",
            ),
        )
        .await?;
        record_placement(&dependencies, &name, &target.name_any()).await?;
    }

    Ok(Action::await_change())
}

pub fn error_policy(dependency: Arc<k8s::Dependency>, error: &Error, _ctx: Arc<Ctx>) -> Action {
    warn!(name = %dependency.name_any(), %error, "Dependency reconciliation failed");
    Action::requeue(Duration::from_secs(1))
}

/// How a policy lands on an engine that may be at its budget.
#[derive(Debug, PartialEq, Eq)]
enum Placement {
    /// The combined list stays within the budget.
    Append(Vec<String>),
    /// The combined list exceeds the budget: `moved` goes to a spill engine
    /// and the original keeps `keep`.
    Split {
        keep: Vec<String>,
        moved: Vec<String>,
    },
}

fn plan_placement(current: &[String], policy: &str, limit: usize, spill: usize) -> Placement {
    let mut combined = current.to_vec();
    combined.push(policy.to_string());
    if combined.len() <= limit {
        return Placement::Append(combined);
    }
    let moved = combined.len().min(spill);
    let keep = combined.len() - moved;
    Placement::Split {
        keep: combined[..keep].to_vec(),
        moved: combined[keep..].to_vec(),
    }
}

async fn add_policy_to_engine(
    ctx: &Ctx,
    engines: &Api<k8s::OpaEngine>,
    engine: &k8s::OpaEngine,
    namespace: &str,
    policy_name: &str,
) -> Result<()> {
    let engine_name = engine.name_any();
    let plan = plan_placement(
        &engine.spec.policies,
        policy_name,
        ctx.engine_policy_limit,
        ctx.engine_spill_count,
    );

    match plan {
        Placement::Append(_) => {
            update_with(engines, &engine_name, |engine| {
                if engine.spec.policies.iter().any(|p| p == policy_name) {
                    return false;
                }
                engine.spec.policies.push(policy_name.to_string());
                true
            })
            .await?;
            Ok(())
        }
        Placement::Split { keep, moved } => {
            let spill_name = format!("{engine_name}-part2");
            let spill = new_engine(
                &ctx.default_engine_image,
                namespace,
                &spill_name,
                moved.clone(),
            );
            match engines.create(&PostParams::default(), &spill).await {
                Ok(_) => {
                    info!(
                        engine = %engine_name,
                        new_engine = %spill_name,
                        policies = ?moved,
                        "Created OpaEngine for splitting"
                    );
                    update_with(engines, &engine_name, |engine| {
                        let before = engine.spec.policies.len();
                        engine.spec.policies.retain(|p| !moved.contains(p));
                        engine.spec.policies.len() != before
                    })
                    .await?;
                    Ok(())
                }
                Err(error) if is_conflict(&error) => {
                    info!(
                        engine = %engine_name,
                        new_engine = %spill_name,
                        "OpaEngine already exists, likely due to concurrent request"
                    );
                    // Another worker performed the split; recompute what the
                    // original keeps by intersection rather than by position.
                    update_with(engines, &engine_name, |engine| {
                        let before = engine.spec.policies.len();
                        engine.spec.policies.retain(|p| keep.contains(p));
                        engine.spec.policies.len() != before
                    })
                    .await?;
                    Ok(())
                }
                Err(error) => {
                    warn!(engine = %engine_name, %error, "Unable to create OpaEngine for splitting");
                    Err(error.into())
                }
            }
        }
    }
}

fn default_engine(image: &str, namespace: &str, policy_name: &str) -> k8s::OpaEngine {
    new_engine(image, namespace, "default", vec![policy_name.to_string()])
}

fn new_engine(
    image: &str,
    namespace: &str,
    name: &str,
    policies: Vec<String>,
) -> k8s::OpaEngine {
    let mut engine = k8s::OpaEngine::new(
        name,
        OpaEngineSpec {
            image: image.to_string(),
            replicas: 1,
            resources: None,
            instance_name: name.to_string(),
            policies,
        },
    );
    engine.metadata.namespace = Some(namespace.to_string());
    engine
}

async fn record_placement(
    dependencies: &Api<k8s::Dependency>,
    name: &str,
    engine_name: &str,
) -> Result<()> {
    update_status_with(dependencies, name, |dependency| {
        let status = dependency.status.get_or_insert_with(Default::default);
        if status.engine_name.iter().any(|e| e == engine_name) {
            return false;
        }
        status.engine_name.push(engine_name.to_string());
        true
    })
    .await?;
    info!(engine = %engine_name, "Status updated");
    Ok(())
}

async fn update_condition(
    dependencies: &Api<k8s::Dependency>,
    name: &str,
    new: Condition,
) -> Result<()> {
    update_status_with(dependencies, name, |dependency| {
        let status = dependency.status.get_or_insert_with(Default::default);
        conditions::set_condition(&mut status.conditions, new.clone())
    })
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn placement_appends_while_under_the_budget() {
        let plan = plan_placement(&names(&["p1", "p2"]), "p3", 7, 5);
        assert_eq!(plan, Placement::Append(names(&["p1", "p2", "p3"])));
    }

    #[test]
    fn placement_appends_exactly_at_the_budget() {
        let current = names(&["p1", "p2", "p3", "p4", "p5", "p6"]);
        let plan = plan_placement(&current, "p7", 7, 5);
        assert_eq!(
            plan,
            Placement::Append(names(&["p1", "p2", "p3", "p4", "p5", "p6", "p7"]))
        );
    }

    #[test]
    fn placement_splits_the_tail_past_the_budget() {
        let current = names(&["p1", "p2", "p3", "p4", "p5", "p6", "p7"]);
        let plan = plan_placement(&current, "p8", 7, 5);
        assert_eq!(
            plan,
            Placement::Split {
                keep: names(&["p1", "p2", "p3"]),
                moved: names(&["p4", "p5", "p6", "p7", "p8"]),
            }
        );
    }

    #[test]
    fn split_never_exceeds_the_budget_on_either_side() {
        let current = names(&["p1", "p2", "p3", "p4", "p5", "p6", "p7"]);
        if let Placement::Split { keep, moved } = plan_placement(&current, "p8", 7, 5) {
            assert!(keep.len() <= 7);
            assert!(moved.len() <= 7);
            assert_eq!(keep.len() + moved.len(), 8);
        } else {
            panic!("expected a split");
        }
    }

    #[test]
    fn split_moves_the_whole_list_when_it_is_shorter_than_the_spill() {
        let plan = plan_placement(&names(&["p1", "p2"]), "p3", 2, 5);
        assert_eq!(
            plan,
            Placement::Split {
                keep: vec![],
                moved: names(&["p1", "p2", "p3"]),
            }
        );
    }

    #[test]
    fn default_engine_carries_the_policy() {
        let engine = default_engine("openpolicyagent/opa:test", "ns-1", "p1");
        assert_eq!(engine.metadata.name.as_deref(), Some("default"));
        assert_eq!(engine.metadata.namespace.as_deref(), Some("ns-1"));
        assert_eq!(engine.spec.instance_name, "default");
        assert_eq!(engine.spec.replicas, 1);
        assert_eq!(engine.spec.image, "openpolicyagent/opa:test");
        assert_eq!(engine.spec.policies, names(&["p1"]));
    }

    #[test]
    fn spill_engine_is_named_after_the_original() {
        let engine = new_engine(
            "openpolicyagent/opa:test",
            "ns-1",
            "default-part2",
            names(&["p4", "p5"]),
        );
        assert_eq!(engine.metadata.name.as_deref(), Some("default-part2"));
        assert_eq!(engine.spec.instance_name, "default-part2");
        assert_eq!(engine.spec.policies, names(&["p4", "p5"]));
    }
}
