//! Provider speaking a plain JSON CRUD protocol over HTTP.
//!
//! Routes: `POST /{kind}` creates, `GET /{kind}/{id}` reads,
//! `PUT /{kind}/{id}` updates, `DELETE /{kind}/{id}` deletes. Bodies are
//! attribute maps in, [`RemoteObject`] out. Response status maps onto the
//! provider error taxonomy, which is what drives retry classification.

use super::{Provider, RemoteObject};
use crate::error::ProviderError;
use crate::value::Value;
use std::collections::BTreeMap;

const USER_AGENT: &str = concat!("strata/", env!("CARGO_PKG_VERSION"));

pub struct HttpProvider {
    agent: ureq::Agent,
    endpoint: String,
    token: Option<String>,
}

impl HttpProvider {
    pub fn new(endpoint: &str, token: Option<String>) -> Self {
        Self {
            agent: ureq::Agent::new_with_defaults(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
        }
    }

    fn url(&self, kind: &str, id: Option<&str>) -> String {
        match id {
            Some(id) => format!("{}/{kind}/{id}", self.endpoint),
            None => format!("{}/{kind}", self.endpoint),
        }
    }

    fn bearer(&self) -> Option<String> {
        self.token.as_ref().map(|token| format!("Bearer {token}"))
    }
}

fn map_err(error: ureq::Error) -> ProviderError {
    match error {
        ureq::Error::StatusCode(code) => ProviderError::from_status(code),
        other => ProviderError::Unavailable {
            message: other.to_string(),
        },
    }
}

impl Provider for HttpProvider {
    fn create(
        &self,
        kind: &str,
        attrs: &BTreeMap<String, Value>,
    ) -> Result<RemoteObject, ProviderError> {
        let mut request = self
            .agent
            .post(&self.url(kind, None))
            .header("User-Agent", USER_AGENT);
        if let Some(bearer) = self.bearer() {
            request = request.header("Authorization", &bearer);
        }
        let object = request
            .send_json(attrs)
            .map_err(map_err)?
            .body_mut()
            .read_json()
            .map_err(map_err)?;
        Ok(object)
    }

    fn read(&self, kind: &str, id: &str) -> Result<RemoteObject, ProviderError> {
        let mut request = self
            .agent
            .get(&self.url(kind, Some(id)))
            .header("User-Agent", USER_AGENT);
        if let Some(bearer) = self.bearer() {
            request = request.header("Authorization", &bearer);
        }
        let object = request
            .call()
            .map_err(map_err)?
            .body_mut()
            .read_json()
            .map_err(map_err)?;
        Ok(object)
    }

    fn update(
        &self,
        kind: &str,
        id: &str,
        attrs: &BTreeMap<String, Value>,
    ) -> Result<RemoteObject, ProviderError> {
        let mut request = self
            .agent
            .put(&self.url(kind, Some(id)))
            .header("User-Agent", USER_AGENT);
        if let Some(bearer) = self.bearer() {
            request = request.header("Authorization", &bearer);
        }
        let object = request
            .send_json(attrs)
            .map_err(map_err)?
            .body_mut()
            .read_json()
            .map_err(map_err)?;
        Ok(object)
    }

    fn delete(&self, kind: &str, id: &str) -> Result<(), ProviderError> {
        let mut request = self
            .agent
            .delete(&self.url(kind, Some(id)))
            .header("User-Agent", USER_AGENT);
        if let Some(bearer) = self.bearer() {
            request = request.header("Authorization", &bearer);
        }
        request.call().map_err(map_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_layout() {
        let provider = HttpProvider::new("https://store.example/api/", None);
        assert_eq!(provider.url("svc", None), "https://store.example/api/svc");
        assert_eq!(
            provider.url("svc", Some("svc-1")),
            "https://store.example/api/svc/svc-1"
        );
    }

    #[test]
    fn test_status_mapping_drives_retry() {
        assert!(map_err(ureq::Error::StatusCode(429)).is_transient());
        assert!(map_err(ureq::Error::StatusCode(503)).is_transient());
        assert!(!map_err(ureq::Error::StatusCode(404)).is_transient());
        assert!(matches!(
            map_err(ureq::Error::StatusCode(404)),
            ProviderError::NotFound { .. }
        ));
    }
}
