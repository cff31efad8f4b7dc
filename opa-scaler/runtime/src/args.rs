use crate::{admission::Admission, lease};
use anyhow::{bail, Result};
use clap::Parser;
use futures::prelude::*;
use kube::runtime::{controller::Controller, reflector::ObjectRef, watcher};
use kube::ResourceExt;
use opa_scaler_k8s_api::{Api, Dependency, Deployment, OpaEngine, Policy, Service};
use opa_scaler_k8s_controller::{dependency, engine, Ctx};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tracing::{debug, info_span, warn, Instrument};

/// Children created by the Engine controller carry this label, which bounds
/// the owned-object watches.
const MANAGED_BY_SELECTOR: &str = "app.kubernetes.io/managed-by=opa-scaler-operator";

#[derive(Debug, Parser)]
#[clap(name = "opa-scaler", about = "A controller for fleets of OPA engines")]
pub struct Args {
    #[clap(long, default_value = "opa_scaler=info,warn", env = "OPA_SCALER_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    server: kubert::ServerArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Disables the admission controller server.
    #[clap(long)]
    admission_controller_disabled: bool,

    /// Enables lease-based leader election between controller replicas.
    #[clap(long)]
    leader_elect: bool,

    #[clap(long, default_value = "opa-scaler-controller")]
    controller_deployment_name: String,

    #[clap(long, default_value = "opa-scaler-system")]
    controller_namespace: String,

    /// Image given to engines created on demand.
    #[clap(long, default_value = opa_scaler_k8s_api::DEFAULT_ENGINE_IMAGE)]
    default_engine_image: String,

    /// Maximum number of policies a single engine may carry.
    #[clap(long, default_value = "7")]
    engine_policy_limit: usize,

    /// Number of policies moved to a spill engine when the limit trips.
    #[clap(long, default_value = "5")]
    engine_spill_count: usize,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            server,
            admission_controller_disabled,
            leader_elect,
            controller_deployment_name,
            controller_namespace,
            default_engine_image,
            engine_policy_limit,
            engine_spill_count,
        } = self;

        let server = if admission_controller_disabled {
            None
        } else {
            Some(server)
        };

        let prom = <Registry>::default();
        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .with_optional_server(server)
            .build()
            .await?;

        let (claimant, claims) = if leader_elect {
            let hostname = std::env::var("HOSTNAME")
                .expect("Failed to fetch `HOSTNAME` environment variable");
            let claims = lease::init(
                &runtime,
                &controller_namespace,
                &controller_deployment_name,
                &hostname,
            )
            .await?;
            (hostname, Some(claims))
        } else {
            (String::new(), None)
        };

        let client = runtime.client();
        let ctx = Arc::new(Ctx {
            client: client.clone(),
            opa: opa_scaler_opa::Client::new(),
            claims,
            claimant,
            default_engine_image,
            engine_policy_limit,
            engine_spill_count,
        });

        let shutdown = runtime.shutdown_handle();

        let engines = Controller::new(
            Api::<OpaEngine>::all(client.clone()),
            watcher::Config::default(),
        );
        let engine_store = engines.store();
        let engines = engines
            .owns(
                Api::<Deployment>::all(client.clone()),
                watcher::Config::default().labels(MANAGED_BY_SELECTOR),
            )
            .owns(
                Api::<Service>::all(client.clone()),
                watcher::Config::default().labels(MANAGED_BY_SELECTOR),
            )
            // A Policy event re-queues every engine that references it.
            .watches(
                Api::<Policy>::all(client.clone()),
                watcher::Config::default(),
                move |policy| {
                    let namespace = policy.namespace();
                    let name = policy.name_any();
                    engine_store
                        .state()
                        .into_iter()
                        .filter(|engine| {
                            engine.namespace() == namespace
                                && engine.spec.policies.iter().any(|p| *p == name)
                        })
                        .map(|engine| ObjectRef::from_obj(engine.as_ref()))
                        .collect::<Vec<_>>()
                },
            )
            .graceful_shutdown_on(shutdown.clone().signaled().map(|_| ()))
            .run(engine::reconcile, engine::error_policy, ctx.clone())
            .for_each(|reconciled| async move {
                match reconciled {
                    Ok((engine, _)) => debug!(name = %engine.name, "Reconciled OpaEngine"),
                    Err(error) => warn!(%error, "OpaEngine reconciliation failed"),
                }
            });
        tokio::spawn(engines.instrument(info_span!("opaengines")));

        let dependencies = Controller::new(
            Api::<Dependency>::all(client.clone()),
            watcher::Config::default(),
        )
        .graceful_shutdown_on(shutdown.signaled().map(|_| ()))
        .run(dependency::reconcile, dependency::error_policy, ctx)
        .for_each(|reconciled| async move {
            match reconciled {
                Ok((dependency, _)) => {
                    debug!(name = %dependency.name, "Reconciled Dependency")
                }
                Err(error) => warn!(%error, "Dependency reconciliation failed"),
            }
        });
        tokio::spawn(dependencies.instrument(info_span!("dependencies")));

        let runtime = runtime.spawn_server(|| Admission::new());

        // Block the main thread on the shutdown signal. Once it fires, wait
        // for the background tasks to complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}
