//! Reconcilers for the OpaEngine and Dependency resources.
//!
//! Both loops are level-triggered: each pass reads the current state of one
//! object, applies whatever writes bring it closer to its spec, and relies
//! on the next invocation to continue from wherever this one stopped. All
//! durable state lives in the cluster API; the controllers hold none.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod dependency;
pub mod engine;

use kube::api::{Api, PostParams};
use kube::Resource;
use serde::{de::DeserializeOwned, Serialize};
use std::{fmt::Debug, sync::Arc};
use tokio::sync::watch;
use tokio::time::{self, Duration};

/// Shared context handed to every reconcile invocation.
#[derive(Clone)]
pub struct Ctx {
    pub client: kube::Client,
    pub opa: opa_scaler_opa::Client,

    /// Leader-election claims; `None` when leader election is disabled.
    pub claims: Option<watch::Receiver<Arc<kubert::lease::Claim>>>,
    pub claimant: String,

    /// Image given to engines created by the Dependency controller.
    pub default_engine_image: String,
    /// An engine's spec.policies may not grow beyond this size.
    pub engine_policy_limit: usize,
    /// Number of policies moved onto the spill engine when the limit trips.
    pub engine_spill_count: usize,
}

impl Ctx {
    pub fn is_leader(&self) -> bool {
        match &self.claims {
            Some(claims) => claims.borrow().is_current_for(&self.claimant),
            None => true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Opa(#[from] opa_scaler_opa::Incomplete),

    #[error(transparent)]
    Serialize(#[from] serde_json::Error),

    #[error("object is missing {0}")]
    MissingMeta(&'static str),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// How long a non-leading replica waits before re-checking its claim.
pub(crate) const NON_LEADER_REQUEUE: Duration = Duration::from_secs(15);

const CONFLICT_RETRIES: u32 = 5;
const CONFLICT_BACKOFF: Duration = Duration::from_millis(10);

pub(crate) fn is_conflict(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(rsp) if rsp.code == 409)
}

pub(crate) fn is_not_found(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(rsp) if rsp.code == 404)
}

/// Read-modify-write on an object's status subresource, retrying version
/// conflicts from a fresh read. `mutate` returns false to skip the write.
/// Returns whether a write happened.
pub(crate) async fn update_status_with<K, F>(api: &Api<K>, name: &str, mutate: F) -> Result<bool>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug,
    F: Fn(&mut K) -> bool,
{
    let mut tries = CONFLICT_RETRIES;
    let mut backoff = CONFLICT_BACKOFF;
    loop {
        let mut obj = api.get(name).await?;
        if !mutate(&mut obj) {
            return Ok(false);
        }
        match api
            .replace_status(name, &PostParams::default(), serde_json::to_vec(&obj)?)
            .await
        {
            Ok(_) => return Ok(true),
            Err(error) if is_conflict(&error) && tries > 0 => {
                tries -= 1;
                time::sleep(backoff).await;
                backoff *= 2;
            }
            Err(error) => return Err(error.into()),
        }
    }
}

/// Read-modify-write on an object's spec/metadata, with the same conflict
/// handling as [`update_status_with`].
pub(crate) async fn update_with<K, F>(api: &Api<K>, name: &str, mutate: F) -> Result<bool>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug,
    F: Fn(&mut K) -> bool,
{
    let mut tries = CONFLICT_RETRIES;
    let mut backoff = CONFLICT_BACKOFF;
    loop {
        let mut obj = api.get(name).await?;
        if !mutate(&mut obj) {
            return Ok(false);
        }
        match api.replace(name, &PostParams::default(), &obj).await {
            Ok(_) => return Ok(true),
            Err(error) if is_conflict(&error) && tries > 0 => {
                tries -= 1;
                time::sleep(backoff).await;
                backoff *= 2;
            }
            Err(error) => return Err(error.into()),
        }
    }
}
