use anyhow::{bail, Result};
use futures::future;
use http_body_util::BodyExt;
use hyper::{http, Request, Response};
use kube::{core::DynamicObject, Resource, ResourceExt};
use opa_scaler_k8s_api::{
    Dependency, DependencySpec, OpaEngine, OpaEngineSpec, Policy, PolicySpec,
};
use serde::de::DeserializeOwned;
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::{info, trace, warn};

#[derive(Clone, Default)]
pub struct Admission {}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Request(#[from] hyper::Error),

    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),
}

type Review = kube::core::admission::AdmissionReview<DynamicObject>;
type AdmissionRequest = kube::core::admission::AdmissionRequest<DynamicObject>;
type AdmissionResponse = kube::core::admission::AdmissionResponse;

trait Validate<T> {
    fn validate(&self, spec: T) -> Result<()>;
}

type Body = http_body_util::Full<bytes::Bytes>;

// === impl Admission ===

impl tower::Service<Request<hyper::body::Incoming>> for Admission {
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<hyper::body::Incoming>) -> Self::Future {
        trace!(?req);
        if req.method() != http::Method::POST || req.uri().path() != "/" {
            return Box::pin(future::ok(
                Response::builder()
                    .status(http::StatusCode::NOT_FOUND)
                    .body(Body::default())
                    .expect("not found response must be valid"),
            ));
        }

        let admission = self.clone();
        Box::pin(async move {
            use bytes::Buf;
            let bytes = req.into_body().collect().await?.to_bytes();
            let review: Review = match serde_json::from_reader(bytes.reader()) {
                Ok(review) => review,
                Err(error) => {
                    warn!(%error, "Failed to parse request body");
                    return json_response(AdmissionResponse::invalid(error).into_review());
                }
            };
            trace!(?review);

            let rsp = match review.try_into() {
                Ok(req) => admission.admit(req),
                Err(error) => {
                    warn!(%error, "Invalid admission request");
                    AdmissionResponse::invalid(error)
                }
            };
            json_response(rsp.into_review())
        })
    }
}

impl Admission {
    pub fn new() -> Self {
        Self {}
    }

    fn admit(self, req: AdmissionRequest) -> AdmissionResponse {
        if is_kind::<Policy>(&req) {
            return self.admit_spec::<PolicySpec>(req);
        }

        if is_kind::<OpaEngine>(&req) {
            return self.admit_spec::<OpaEngineSpec>(req);
        }

        if is_kind::<Dependency>(&req) {
            return self.admit_spec::<DependencySpec>(req);
        }

        AdmissionResponse::invalid(format_args!(
            "unsupported resource type: {}.{}.{}",
            req.kind.group, req.kind.version, req.kind.kind
        ))
    }

    fn admit_spec<T>(self, req: AdmissionRequest) -> AdmissionResponse
    where
        T: DeserializeOwned,
        Self: Validate<T>,
    {
        let rsp = AdmissionResponse::from(&req);

        let kind = req.kind.kind.clone();
        let (obj, spec) = match parse_spec::<T>(req) {
            Ok(spec) => spec,
            Err(error) => {
                info!(%error, "Failed to parse {} spec", kind);
                return rsp.deny(error);
            }
        };

        let ns = obj.namespace().unwrap_or_default();
        let name = obj.name_any();
        if let Err(error) = self.validate(spec) {
            info!(%error, %ns, %name, %kind, "Denied");
            return rsp.deny(error);
        }

        rsp
    }
}

fn is_kind<T>(req: &AdmissionRequest) -> bool
where
    T: Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();
    req.kind.group.eq_ignore_ascii_case(&T::group(&dt))
        && req.kind.kind.eq_ignore_ascii_case(&T::kind(&dt))
}

fn json_response(rsp: Review) -> Result<Response<Body>, Error> {
    let bytes = serde_json::to_vec(&rsp)?;
    Ok(Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .expect("admission review response must be valid"))
}

fn parse_spec<T: DeserializeOwned>(req: AdmissionRequest) -> Result<(DynamicObject, T)> {
    let obj = req
        .object
        .ok_or_else(|| anyhow::anyhow!("admission request missing 'object'"))?;

    let spec = {
        let data = obj
            .data
            .get("spec")
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("admission request missing 'spec'"))?;
        serde_json::from_value(data)?
    };

    Ok((obj, spec))
}

impl Validate<PolicySpec> for Admission {
    fn validate(&self, spec: PolicySpec) -> Result<()> {
        match (&spec.rego, &spec.image) {
            (Some(_), Some(_)) => bail!("only one of rego and image may be set"),
            (None, None) => bail!("one of rego and image must be set"),
            _ => Ok(()),
        }
    }
}

impl Validate<OpaEngineSpec> for Admission {
    fn validate(&self, spec: OpaEngineSpec) -> Result<()> {
        if spec.instance_name.is_empty() {
            bail!("instanceName must not be empty");
        }

        if spec.replicas < 1 {
            bail!("replicas must be at least 1");
        }

        let mut seen = BTreeSet::new();
        for policy in &spec.policies {
            if !seen.insert(policy) {
                bail!("policies must not contain duplicates: {}", policy);
            }
        }

        Ok(())
    }
}

impl Validate<DependencySpec> for Admission {
    fn validate(&self, spec: DependencySpec) -> Result<()> {
        for (field, value) in [
            ("serviceName", &spec.service_name),
            ("policyName", &spec.policy_name),
        ] {
            if value.is_empty() || value.len() > 63 {
                bail!("{} must be between 1 and 63 characters", field);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn admission() -> Admission {
        Admission::new()
    }

    #[test]
    fn policy_must_set_exactly_one_source() {
        assert!(admission()
            .validate(PolicySpec {
                rego: Some("package t".to_string()),
                image: None,
            })
            .is_ok());
        assert!(admission()
            .validate(PolicySpec {
                rego: None,
                image: Some("registry.local/policy:1".to_string()),
            })
            .is_ok());
        assert!(admission()
            .validate(PolicySpec {
                rego: Some("package t".to_string()),
                image: Some("registry.local/policy:1".to_string()),
            })
            .is_err());
        assert!(admission()
            .validate(PolicySpec {
                rego: None,
                image: None,
            })
            .is_err());
    }

    #[test]
    fn engine_rejects_duplicate_policies() {
        let spec = OpaEngineSpec {
            image: "opa".to_string(),
            replicas: 1,
            resources: None,
            instance_name: "default".to_string(),
            policies: vec!["p1".to_string(), "p1".to_string()],
        };
        assert!(admission().validate(spec).is_err());
    }

    #[test]
    fn engine_requires_an_instance_name_and_a_replica() {
        let spec = OpaEngineSpec {
            image: "opa".to_string(),
            replicas: 1,
            resources: None,
            instance_name: String::new(),
            policies: vec![],
        };
        assert!(admission().validate(spec).is_err());

        let spec = OpaEngineSpec {
            image: "opa".to_string(),
            replicas: 0,
            resources: None,
            instance_name: "default".to_string(),
            policies: vec![],
        };
        assert!(admission().validate(spec).is_err());
    }

    #[test]
    fn dependency_names_are_bounded() {
        let spec = DependencySpec {
            service_name: "svc".to_string(),
            policy_name: "p".repeat(64),
        };
        assert!(admission().validate(spec).is_err());

        let spec = DependencySpec {
            service_name: "svc".to_string(),
            policy_name: "p1".to_string(),
        };
        assert!(admission().validate(spec).is_ok());
    }
}
