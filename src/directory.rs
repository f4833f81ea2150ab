use crate::{
    error::{ExchangeError, Result},
    Did,
};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileView {
    pub did: Did,
    #[serde(default)]
    pub handle: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

/// Identity lookups: where a DID's repository lives, which key it signs with, and how it
/// presents itself.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DirectoryResolver: Send + Sync {
    /// Base URL of the repository host serving `did`.
    async fn resolve_endpoint(&self, did: &str) -> Result<String>;

    /// The DID's signing key as a `did:key`, if it publishes one.
    async fn resolve_signing_key(&self, did: &str) -> Result<Option<String>>;

    async fn resolve_handle(&self, handle: &str) -> Result<Did>;

    async fn profile(&self, did: &str) -> Result<Option<ProfileView>>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DidDocument {
    #[serde(default)]
    service: Vec<DidService>,
    #[serde(default)]
    verification_method: Vec<VerificationMethod>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DidService {
    id: String,
    #[serde(rename = "type", default)]
    kind: String,
    service_endpoint: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerificationMethod {
    id: String,
    #[serde(default)]
    public_key_multibase: Option<String>,
}

impl DidDocument {
    fn pds_endpoint(&self) -> Option<String> {
        self.service
            .iter()
            .find(|s| s.id.ends_with("#atproto_pds") || s.kind == "AtprotoPersonalDataServer")
            .and_then(|s| s.service_endpoint.as_str().map(str::to_string))
    }

    fn signing_key(&self) -> Option<String> {
        self.verification_method
            .iter()
            .find(|m| m.id.ends_with("#atproto"))
            .or_else(|| self.verification_method.first())
            .and_then(|m| m.public_key_multibase.clone())
            .map(|multibase| format!("did:key:{}", multibase))
    }
}

#[derive(Debug, Deserialize)]
struct ResolveHandleResponse {
    did: Did,
}

/// did:plc through the PLC directory, did:web through `.well-known/did.json`, handles and
/// profiles through the appview.
pub struct PlcDirectory {
    client: Client,
    plc_url: String,
    appview_url: String,
}

impl PlcDirectory {
    pub fn new(plc_url: String, appview_url: String) -> Self {
        Self::with_client(plc_url, appview_url, Client::new())
    }

    pub fn with_client(plc_url: String, appview_url: String, client: Client) -> Self {
        Self {
            client,
            plc_url: plc_url.trim_end_matches('/').to_string(),
            appview_url: appview_url.trim_end_matches('/').to_string(),
        }
    }

    fn document_url(&self, did: &str) -> Result<String> {
        if did.starts_with("did:plc:") {
            Ok(format!("{}/{}", self.plc_url, did))
        } else if let Some(host) = did.strip_prefix("did:web:") {
            Ok(format!("https://{}/.well-known/did.json", host))
        } else {
            Err(ExchangeError::Directory(format!("Unsupported DID method: {}", did)))
        }
    }

    async fn document(&self, did: &str) -> Result<DidDocument> {
        let response = self.client.get(&self.document_url(did)?).send().await?;

        if !response.status().is_success() {
            return Err(ExchangeError::Directory(format!(
                "DID document for {} returned {}",
                did,
                response.status()
            )));
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl DirectoryResolver for PlcDirectory {
    async fn resolve_endpoint(&self, did: &str) -> Result<String> {
        self.document(did)
            .await?
            .pds_endpoint()
            .ok_or_else(|| ExchangeError::Directory(format!("No repository host published for {}", did)))
    }

    async fn resolve_signing_key(&self, did: &str) -> Result<Option<String>> {
        if did.starts_with("did:key:") {
            return Ok(Some(did.to_string()));
        }
        Ok(self.document(did).await?.signing_key())
    }

    async fn resolve_handle(&self, handle: &str) -> Result<Did> {
        let response = self
            .client
            .get(&format!("{}/xrpc/com.atproto.identity.resolveHandle", self.appview_url))
            .query(&[("handle", handle)])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ExchangeError::NotFound(format!("Handle {}", handle)));
        }

        let resolved: ResolveHandleResponse = response.json().await?;
        Ok(resolved.did)
    }

    async fn profile(&self, did: &str) -> Result<Option<ProfileView>> {
        let response = self
            .client
            .get(&format!("{}/xrpc/app.bsky.actor.getProfile", self.appview_url))
            .query(&[("actor", did)])
            .send()
            .await?;

        if !response.status().is_success() {
            debug!(did, status = %response.status(), "Profile unavailable");
            return Ok(None);
        }

        Ok(Some(response.json().await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_did_document_parsing() {
        let document: DidDocument = serde_json::from_value(json!({
            "id": "did:plc:alice",
            "verificationMethod": [{
                "id": "did:plc:alice#atproto",
                "type": "Multikey",
                "publicKeyMultibase": "z6MkexampleKey"
            }],
            "service": [{
                "id": "#atproto_pds",
                "type": "AtprotoPersonalDataServer",
                "serviceEndpoint": "https://pds.example.com"
            }]
        }))
        .unwrap();

        assert_eq!(document.pds_endpoint().as_deref(), Some("https://pds.example.com"));
        assert_eq!(document.signing_key().as_deref(), Some("did:key:z6MkexampleKey"));
    }

    #[test]
    fn test_document_urls() {
        let directory = PlcDirectory::new("https://plc.example/".into(), "https://appview.example".into());
        assert_eq!(
            directory.document_url("did:plc:abc").unwrap(),
            "https://plc.example/did:plc:abc"
        );
        assert_eq!(
            directory.document_url("did:web:example.com").unwrap(),
            "https://example.com/.well-known/did.json"
        );
        assert!(directory.document_url("did:foo:bar").is_err());
    }
}
