//! Client for the OPA policy management HTTP API.
//!
//! An engine exposes `PUT`/`DELETE /v1/policies/{name}` on its management
//! port. Batch operations here are order-preserving and, on failure, report
//! the prefix of names that had already succeeded so that callers can record
//! partial progress before retrying.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use reqwest::{header, StatusCode};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("request for policy {name} failed: {source}")]
    Request {
        name: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to {verb} policy {name}: {status}\n{body}")]
    Status {
        verb: &'static str,
        name: String,
        status: StatusCode,
        body: String,
    },
}

/// A halted batch: the names in `done` succeeded before `error` stopped the
/// remainder.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct Incomplete {
    pub done: Vec<String>,
    #[source]
    pub error: Error,
}

/// Computes the add/remove sets between a desired and an observed policy
/// list. Both outputs preserve the order of their source sequence.
pub fn diff(desired: &[String], observed: &[String]) -> (Vec<String>, Vec<String>) {
    let to_add = desired
        .iter()
        .filter(|name| !observed.iter().any(|o| o == *name))
        .cloned()
        .collect();
    let to_remove = observed
        .iter()
        .filter(|name| !desired.iter().any(|d| d == *name))
        .cloned()
        .collect();
    (to_add, to_remove)
}

#[derive(Clone, Debug, Default)]
pub struct Client {
    http: reqwest::Client,
}

impl Client {
    pub fn new() -> Self {
        Self::default()
    }

    /// PUTs each `(name, source)` pair against the engine's management API,
    /// halting at the first failure.
    pub async fn push_policies(
        &self,
        base_url: &str,
        policies: &[(String, String)],
    ) -> Result<Vec<String>, Incomplete> {
        let mut added = Vec::with_capacity(policies.len());
        debug!(count = policies.len(), "Pushing policies");
        for (name, source) in policies {
            let rsp = self
                .http
                .put(format!("{base_url}/v1/policies/{name}"))
                .header(header::CONTENT_TYPE, "text/plain")
                .body(source.clone())
                .send()
                .await
                .map_err(|source| Incomplete {
                    done: added.clone(),
                    error: Error::Request {
                        name: name.clone(),
                        source,
                    },
                })?;
            let status = rsp.status();
            debug!(%name, %status, "Pushed policy");
            if status != StatusCode::OK {
                let body = rsp.text().await.unwrap_or_default();
                return Err(Incomplete {
                    done: added,
                    error: Error::Status {
                        verb: "push",
                        name: name.clone(),
                        status,
                        body,
                    },
                });
            }
            added.push(name.clone());
        }
        Ok(added)
    }

    /// DELETEs each named policy, halting at the first failure.
    pub async fn delete_policies(
        &self,
        base_url: &str,
        names: &[String],
    ) -> Result<Vec<String>, Incomplete> {
        let mut removed = Vec::with_capacity(names.len());
        for name in names {
            let rsp = self
                .http
                .delete(format!("{base_url}/v1/policies/{name}"))
                .send()
                .await
                .map_err(|source| Incomplete {
                    done: removed.clone(),
                    error: Error::Request {
                        name: name.clone(),
                        source,
                    },
                })?;
            let status = rsp.status();
            debug!(%name, %status, "Deleted policy");
            if status != StatusCode::OK {
                let body = rsp.text().await.unwrap_or_default();
                return Err(Incomplete {
                    done: removed,
                    error: Error::Status {
                        verb: "delete",
                        name: name.clone(),
                        status,
                        body,
                    },
                });
            }
            removed.push(name.clone());
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::put;
    use axum::Router;
    use std::sync::{Arc, Mutex};

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn diff_of_identical_lists_is_empty() {
        let desired = names(&["policy1", "policy2"]);
        let (to_add, to_remove) = diff(&desired, &desired);
        assert!(to_add.is_empty());
        assert!(to_remove.is_empty());
    }

    #[test]
    fn diff_against_empty_observed_adds_everything() {
        let desired = names(&["policy1", "policy2"]);
        let (to_add, to_remove) = diff(&desired, &[]);
        assert_eq!(to_add, desired);
        assert!(to_remove.is_empty());
    }

    #[test]
    fn diff_against_empty_desired_removes_everything() {
        let observed = names(&["policy1", "policy2"]);
        let (to_add, to_remove) = diff(&[], &observed);
        assert!(to_add.is_empty());
        assert_eq!(to_remove, observed);
    }

    #[test]
    fn diff_preserves_source_order_for_mixed_changes() {
        let desired = names(&["policy1", "policy2"]);
        let observed = names(&["policy2", "policy3"]);
        let (to_add, to_remove) = diff(&desired, &observed);
        assert_eq!(to_add, names(&["policy1"]));
        assert_eq!(to_remove, names(&["policy3"]));
    }

    /// Stand-in for the engine's management API: records requests, and
    /// rejects any policy named in `reject`.
    #[derive(Clone, Default)]
    struct Fixture {
        puts: Arc<Mutex<Vec<(String, String, String)>>>,
        deletes: Arc<Mutex<Vec<String>>>,
        reject: Arc<Mutex<Option<String>>>,
    }

    async fn put_policy(
        State(fixture): State<Fixture>,
        Path(name): Path<String>,
        headers: HeaderMap,
        body: String,
    ) -> (StatusCode, String) {
        if fixture.reject.lock().unwrap().as_deref() == Some(name.as_str()) {
            return (StatusCode::BAD_REQUEST, "rego_parse_error".to_string());
        }
        let content_type = headers
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        fixture.puts.lock().unwrap().push((name, content_type, body));
        (StatusCode::OK, "{}".to_string())
    }

    async fn delete_policy(
        State(fixture): State<Fixture>,
        Path(name): Path<String>,
    ) -> (StatusCode, String) {
        if fixture.reject.lock().unwrap().as_deref() == Some(name.as_str()) {
            return (StatusCode::NOT_FOUND, "storage_not_found_error".to_string());
        }
        fixture.deletes.lock().unwrap().push(name);
        (StatusCode::OK, "{}".to_string())
    }

    async fn serve(fixture: Fixture) -> String {
        let app = Router::new()
            .route("/v1/policies/:name", put(put_policy).delete(delete_policy))
            .with_state(fixture);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn push_sends_plain_text_bodies_in_order() {
        let fixture = Fixture::default();
        let url = serve(fixture.clone()).await;

        let batch = vec![
            ("policy1".to_string(), "package a".to_string()),
            ("policy2".to_string(), "package b".to_string()),
        ];
        let added = Client::new().push_policies(&url, &batch).await.unwrap();
        assert_eq!(added, names(&["policy1", "policy2"]));

        let puts = fixture.puts.lock().unwrap();
        assert_eq!(puts.len(), 2);
        assert_eq!(puts[0].0, "policy1");
        assert_eq!(puts[0].1, "text/plain");
        assert_eq!(puts[0].2, "package a");
        assert_eq!(puts[1].0, "policy2");
    }

    #[tokio::test]
    async fn push_halts_at_the_first_rejection() {
        let fixture = Fixture::default();
        *fixture.reject.lock().unwrap() = Some("policy2".to_string());
        let url = serve(fixture.clone()).await;

        let batch = vec![
            ("policy1".to_string(), "package a".to_string()),
            ("policy2".to_string(), "bogus".to_string()),
            ("policy3".to_string(), "package c".to_string()),
        ];
        let err = Client::new().push_policies(&url, &batch).await.unwrap_err();
        assert_eq!(err.done, names(&["policy1"]));
        let message = err.to_string();
        assert!(message.contains("policy2"), "{message}");
        assert!(message.contains("400"), "{message}");
        assert!(message.contains("rego_parse_error"), "{message}");

        // policy3 was never attempted.
        assert_eq!(fixture.puts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_reports_the_removed_prefix_on_failure() {
        let fixture = Fixture::default();
        *fixture.reject.lock().unwrap() = Some("policy2".to_string());
        let url = serve(fixture.clone()).await;

        let err = Client::new()
            .delete_policies(&url, &names(&["policy1", "policy2", "policy3"]))
            .await
            .unwrap_err();
        assert_eq!(err.done, names(&["policy1"]));
        assert_eq!(*fixture.deletes.lock().unwrap(), names(&["policy1"]));
    }

    #[tokio::test]
    async fn delete_removes_every_policy_on_success() {
        let fixture = Fixture::default();
        let url = serve(fixture.clone()).await;

        let removed = Client::new()
            .delete_policies(&url, &names(&["policy1", "policy2"]))
            .await
            .unwrap();
        assert_eq!(removed, names(&["policy1", "policy2"]));
    }
}
