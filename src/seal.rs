//! Seals: signed provenance envelopes attached to every item copy.
//!
//! A seal binds the trust-sensitive fields of an item to the repository that holds it.
//! Anyone can check a seal offline given the issuer's public key, so a copy that was moved
//! to another repository or edited after issuance is detected without asking anybody.

use crate::{
    cache::IssuerKeyCache,
    directory::DirectoryResolver,
    error::{ExchangeError, Result},
    keys,
    model::Item,
    Did,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Trust-sensitive item fields covered by a seal. Absent fields are not checked.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SealInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obtained_from: Option<Did>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_creator: Option<Did>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealPayload {
    #[serde(default)]
    pub info: SealInfo,
    #[serde(rename = "iss")]
    pub issuer: Did,
    #[serde(rename = "sub")]
    pub subject: Did,
    #[serde(rename = "iat")]
    pub issued_at: i64,
    #[serde(rename = "jti")]
    pub nonce: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SealEnvelope {
    pub signed_payload: String,
    pub signature: String,
    #[serde(rename = "issuerDid", default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<Did>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SealVerification {
    pub is_valid: bool,
    pub is_tampered: bool,
    pub is_stolen: bool,
    pub reason: Option<String>,
    pub trusted_payload: Option<SealPayload>,
}

impl SealVerification {
    fn valid(payload: SealPayload) -> Self {
        Self {
            is_valid: true,
            is_tampered: false,
            is_stolen: false,
            reason: None,
            trusted_payload: Some(payload),
        }
    }

    fn unsealed() -> Self {
        Self {
            is_valid: false,
            is_tampered: false,
            is_stolen: false,
            reason: Some("Item carries no seal".to_string()),
            trusted_payload: None,
        }
    }

    fn tampered(reason: String) -> Self {
        Self {
            is_valid: false,
            is_tampered: true,
            is_stolen: false,
            reason: Some(reason),
            trusted_payload: None,
        }
    }

    fn stolen(reason: String) -> Self {
        Self {
            is_stolen: true,
            ..Self::tampered(reason)
        }
    }

    /// The trusted payload, or the failure as an error that keeps stolen and tampered apart.
    pub fn into_trusted(self) -> Result<SealPayload> {
        let reason = self
            .reason
            .unwrap_or_else(|| "Seal did not verify".to_string());

        match self.trusted_payload {
            Some(payload) if self.is_valid => Ok(payload),
            _ if self.is_stolen || self.is_tampered => Err(ExchangeError::IntegrityViolation {
                stolen: self.is_stolen,
                reason,
            }),
            _ => Err(ExchangeError::VerificationFailure(reason)),
        }
    }
}

pub struct SealVerifier {
    trusted_issuers: HashSet<Did>,
    directory: Arc<dyn DirectoryResolver>,
    keys: Arc<IssuerKeyCache>,
    cdn_base: String,
}

impl SealVerifier {
    pub fn new(
        trusted_issuers: impl IntoIterator<Item = Did>,
        directory: Arc<dyn DirectoryResolver>,
        keys: Arc<IssuerKeyCache>,
        cdn_base: String,
    ) -> Self {
        Self {
            trusted_issuers: trusted_issuers.into_iter().collect(),
            directory,
            keys,
            cdn_base,
        }
    }

    pub fn trusts(&self, issuer: &str) -> bool {
        self.trusted_issuers.contains(issuer)
    }

    pub async fn verify(&self, item: &Item, holder: &str) -> SealVerification {
        let Some(envelope) = item.seal() else {
            return SealVerification::unsealed();
        };

        let payload: SealPayload = match serde_json::from_str(&envelope.signed_payload) {
            Ok(payload) => payload,
            Err(e) => return SealVerification::tampered(format!("Unreadable seal payload: {}", e)),
        };

        if payload.subject != holder {
            return SealVerification::stolen(format!(
                "Sealed for {} but held by {}",
                payload.subject, holder
            ));
        }

        if !self.trusts(&payload.issuer) {
            return SealVerification::tampered(format!("Unknown issuer {}", payload.issuer));
        }

        let mismatches = field_mismatches(&payload.info, item, &self.cdn_base);
        if !mismatches.is_empty() {
            return SealVerification::tampered(format!(
                "Record differs from seal: {}",
                mismatches.join("; ")
            ));
        }

        let key = match self.issuer_key(&payload.issuer).await {
            Ok(key) => key,
            Err(e) => return SealVerification::tampered(format!("Issuer key unavailable: {}", e)),
        };

        let signature = match decode_signature(&envelope.signature) {
            Ok(signature) => signature,
            Err(e) => return SealVerification::tampered(format!("Malformed signature: {}", e)),
        };

        match key.verify(envelope.signed_payload.as_bytes(), &signature) {
            Ok(()) => SealVerification::valid(payload),
            Err(_) => SealVerification::tampered("Signature does not match payload".to_string()),
        }
    }

    async fn issuer_key(&self, issuer: &str) -> Result<VerifyingKey> {
        if let Some(key) = self.keys.get(issuer) {
            return Ok(key);
        }

        let did_key = self
            .directory
            .resolve_signing_key(issuer)
            .await?
            .ok_or_else(|| ExchangeError::Directory(format!("{} publishes no signing key", issuer)))?;
        let key = keys::decode_did_key(&did_key)?;

        debug!(issuer, "Cached issuer key");
        self.keys.insert(issuer, key);
        Ok(key)
    }
}

fn decode_signature(encoded: &str) -> Result<Signature> {
    let bytes = STANDARD.decode(encoded.trim())?;
    Ok(Signature::from_slice(&bytes)?)
}

fn field_mismatches(info: &SealInfo, item: &Item, cdn_base: &str) -> Vec<String> {
    let image = item.image_url(cdn_base);
    let checks = [
        ("model", info.model.as_deref(), Some(item.model.as_str())),
        ("image", info.image.as_deref(), image.as_deref()),
        ("obtainedFrom", info.obtained_from.as_deref(), item.obtained_from.as_deref()),
        ("originalCreator", info.original_creator.as_deref(), Some(item.original_owner.as_str())),
        ("name", info.name.as_deref(), item.name.as_deref()),
        ("message", info.message.as_deref(), item.message.as_deref()),
    ];

    checks
        .into_iter()
        .filter_map(|(field, sealed, actual)| match sealed {
            Some(sealed) if actual != Some(sealed) => Some(format!(
                "{} sealed as {:?} but record has {:?}",
                field, sealed, actual
            )),
            _ => None,
        })
        .collect()
}

#[async_trait]
pub trait SigningAuthority: Send + Sync {
    /// Seal `info` for the repository `holder`.
    async fn sign(&self, holder: &str, info: &SealInfo) -> Result<SealEnvelope>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignSealPayload {
    #[serde(default)]
    pub info: SealInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignSealRequest {
    pub user_did: Did,
    pub payload: SignSealPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignSealResponse {
    pub signed_payload: String,
    pub signature: String,
    pub issuer_did: Did,
}

impl From<SignSealResponse> for SealEnvelope {
    fn from(response: SignSealResponse) -> Self {
        Self {
            signed_payload: response.signed_payload,
            signature: response.signature,
            issuer: Some(response.issuer_did),
        }
    }
}

/// Remote authority speaking the `sign-seal` protocol.
pub struct HttpSigningAuthority {
    endpoint: String,
    client: Client,
    access_token: Option<String>,
}

impl HttpSigningAuthority {
    pub fn new(endpoint: String) -> Self {
        Self::with_client(endpoint, Client::new())
    }

    pub fn with_client(endpoint: String, client: Client) -> Self {
        Self {
            endpoint,
            client,
            access_token: None,
        }
    }

    pub fn with_access_token(mut self, token: String) -> Self {
        self.access_token = Some(token);
        self
    }
}

#[async_trait]
impl SigningAuthority for HttpSigningAuthority {
    async fn sign(&self, holder: &str, info: &SealInfo) -> Result<SealEnvelope> {
        let request = SignSealRequest {
            user_did: holder.to_string(),
            payload: SignSealPayload { info: info.clone() },
        };

        let mut builder = self.client.post(&self.endpoint).json(&request);
        if let Some(token) = &self.access_token {
            builder = builder.bearer_auth(token);
        }
        let response = builder.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ExchangeError::Signing(format!(
                "Authority returned {}: {}",
                status, body
            )));
        }

        let signed: SignSealResponse = response.json().await?;
        Ok(signed.into())
    }
}

/// In-process authority holding the Ed25519 key. Its DID is the `did:key` of that key.
pub struct LocalSigningAuthority {
    key: SigningKey,
    did: Did,
}

impl LocalSigningAuthority {
    pub fn new(key: SigningKey) -> Self {
        let did = keys::encode_did_key(&key.verifying_key());
        Self { key, did }
    }

    pub fn from_hex(hex_key: Option<&str>) -> Result<Self> {
        let hex_key = hex_key
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| ExchangeError::Config("Issuer private key is not configured".to_string()))?;
        Ok(Self::new(keys::signing_key_from_hex(hex_key)?))
    }

    pub fn generate() -> Self {
        Self::new(keys::generate_signing_key())
    }

    pub fn did(&self) -> &str {
        &self.did
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.key.to_bytes())
    }
}

#[async_trait]
impl SigningAuthority for LocalSigningAuthority {
    async fn sign(&self, holder: &str, info: &SealInfo) -> Result<SealEnvelope> {
        if !holder.starts_with("did:") {
            return Err(ExchangeError::Validation(format!("Holder is not a DID: {}", holder)));
        }

        let payload = SealPayload {
            info: info.clone(),
            issuer: self.did.clone(),
            subject: holder.to_string(),
            issued_at: Utc::now().timestamp(),
            nonce: uuid::Uuid::new_v4().to_string(),
        };
        let signed_payload = serde_json::to_string(&payload)?;
        let signature = self.key.sign(signed_payload.as_bytes());

        Ok(SealEnvelope {
            signed_payload,
            signature: STANDARD.encode(signature.to_bytes()),
            issuer: Some(self.did.clone()),
        })
    }
}

/// Issues seals through the configured authority and checks them with the verifier.
pub struct SealEngine {
    verifier: SealVerifier,
    authority: Arc<dyn SigningAuthority>,
}

impl SealEngine {
    pub fn new(verifier: SealVerifier, authority: Arc<dyn SigningAuthority>) -> Self {
        Self { verifier, authority }
    }

    pub async fn issue(&self, holder: &str, info: &SealInfo) -> Result<SealEnvelope> {
        self.authority.sign(holder, info).await
    }

    pub async fn verify(&self, item: &Item, holder: &str) -> SealVerification {
        self.verifier.verify(item, holder).await
    }

    pub fn verifier(&self) -> &SealVerifier {
        &self.verifier
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::MockDirectoryResolver;

    const CDN: &str = "https://cdn.example/img";
    const AVATAR: &str = "https://cdn.example/avatar/alice.jpg";

    fn directory_for(authority: &LocalSigningAuthority, expected_lookups: usize) -> MockDirectoryResolver {
        let did_key = authority.did().to_string();
        let mut directory = MockDirectoryResolver::new();
        directory
            .expect_resolve_signing_key()
            .times(expected_lookups)
            .returning(move |_| Ok(Some(did_key.clone())));
        directory
    }

    fn verifier(authority: &LocalSigningAuthority, directory: MockDirectoryResolver) -> SealVerifier {
        SealVerifier::new(
            vec![authority.did().to_string()],
            Arc::new(directory),
            Arc::new(IssuerKeyCache::default()),
            CDN.to_string(),
        )
    }

    async fn sealed_item(authority: &LocalSigningAuthority, holder: &str) -> Item {
        let info = SealInfo {
            model: Some("default".to_string()),
            image: Some(AVATAR.to_string()),
            ..Default::default()
        };
        let envelope = authority.sign(holder, &info).await.unwrap();
        Item::self_minted(holder, Some(AVATAR.to_string()), envelope)
    }

    #[tokio::test]
    async fn test_issue_then_verify() {
        let authority = LocalSigningAuthority::generate();
        let verifier = verifier(&authority, directory_for(&authority, 1));
        let item = sealed_item(&authority, "did:plc:alice").await;

        let result = verifier.verify(&item, "did:plc:alice").await;
        assert!(result.is_valid, "{:?}", result.reason);

        let payload = result.into_trusted().unwrap();
        assert_eq!(payload.subject, "did:plc:alice");
        assert_eq!(payload.issuer, authority.did());
    }

    #[tokio::test]
    async fn test_wrong_holder_is_stolen() {
        let authority = LocalSigningAuthority::generate();
        let verifier = verifier(&authority, directory_for(&authority, 0));
        let item = sealed_item(&authority, "did:plc:alice").await;

        let result = verifier.verify(&item, "did:plc:mallory").await;
        assert!(!result.is_valid);
        assert!(result.is_stolen);
        assert!(result.is_tampered);

        match result.into_trusted() {
            Err(ExchangeError::IntegrityViolation { stolen, .. }) => assert!(stolen),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_edited_fields_are_all_reported() {
        let authority = LocalSigningAuthority::generate();
        let verifier = verifier(&authority, directory_for(&authority, 0));
        let mut item = sealed_item(&authority, "did:plc:alice").await;
        item.model = "rare".to_string();
        item.image = Some(crate::model::ImageRef::Url("https://elsewhere/x.png".to_string()));

        let result = verifier.verify(&item, "did:plc:alice").await;
        assert!(result.is_tampered);
        assert!(!result.is_stolen);
        let reason = result.reason.unwrap();
        assert!(reason.contains("model"));
        assert!(reason.contains("image"));
    }

    #[tokio::test]
    async fn test_every_sealed_field_is_checked() {
        let authority = LocalSigningAuthority::generate();
        let verifier = verifier(&authority, directory_for(&authority, 1));
        let info = SealInfo {
            model: Some("cat".to_string()),
            image: Some(AVATAR.to_string()),
            obtained_from: Some("did:plc:alice".to_string()),
            original_creator: Some("did:plc:alice".to_string()),
            name: Some("Alice".to_string()),
            message: Some("enjoy".to_string()),
        };
        let envelope = authority.sign("did:plc:bob", &info).await.unwrap();
        let mut copy = Item::self_minted("did:plc:alice", Some(AVATAR.to_string()), envelope);
        copy.model = "cat".to_string();
        copy.obtained_from = Some("did:plc:alice".to_string());
        copy.name = Some("Alice".to_string());
        copy.message = Some("enjoy".to_string());

        let result = verifier.verify(&copy, "did:plc:bob").await;
        assert!(result.is_valid, "{:?}", result.reason);

        let edits: Vec<(&str, Box<dyn Fn(&mut Item)>)> = vec![
            ("obtainedFrom", Box::new(|item: &mut Item| item.obtained_from = Some("did:plc:mallory".to_string()))),
            ("originalCreator", Box::new(|item: &mut Item| item.original_owner = "did:plc:mallory".to_string())),
            ("name", Box::new(|item: &mut Item| item.name = Some("Mallory".to_string()))),
            ("message", Box::new(|item: &mut Item| item.message = None)),
        ];

        for (field, edit) in edits {
            let mut edited = copy.clone();
            edit(&mut edited);

            let result = verifier.verify(&edited, "did:plc:bob").await;
            assert!(result.is_tampered, "{} edit went unnoticed", field);
            assert!(!result.is_stolen);
            let reason = result.reason.unwrap();
            assert!(reason.contains(&format!("{} sealed as", field)), "{}", reason);
        }
    }

    #[tokio::test]
    async fn test_unsealed_item_is_invalid_but_not_tampered() {
        let authority = LocalSigningAuthority::generate();
        let verifier = verifier(&authority, directory_for(&authority, 0));
        let mut item = sealed_item(&authority, "did:plc:alice").await;
        item.signature = None;

        let result = verifier.verify(&item, "did:plc:alice").await;
        assert!(!result.is_valid);
        assert!(!result.is_tampered);
        assert!(matches!(
            result.into_trusted(),
            Err(ExchangeError::VerificationFailure(_))
        ));
    }

    #[tokio::test]
    async fn test_unreadable_payload_and_unknown_issuer() {
        let trusted = LocalSigningAuthority::generate();
        let rogue = LocalSigningAuthority::generate();
        let verifier = verifier(&trusted, directory_for(&trusted, 0));

        let mut garbled = sealed_item(&trusted, "did:plc:alice").await;
        garbled.signed_payload = Some("{not json".to_string());
        assert!(verifier.verify(&garbled, "did:plc:alice").await.is_tampered);

        let foreign = sealed_item(&rogue, "did:plc:alice").await;
        let result = verifier.verify(&foreign, "did:plc:alice").await;
        assert!(result.is_tampered);
        assert!(result.reason.unwrap().contains("Unknown issuer"));
    }

    #[tokio::test]
    async fn test_forged_signature_is_tampered() {
        let trusted = LocalSigningAuthority::generate();
        let rogue = LocalSigningAuthority::generate();
        let verifier = verifier(&trusted, directory_for(&trusted, 1));

        let mut item = sealed_item(&trusted, "did:plc:alice").await;
        let payload = item.signed_payload.clone().unwrap();
        let forged = rogue.key.sign(payload.as_bytes());
        item.signature = Some(STANDARD.encode(forged.to_bytes()));

        let result = verifier.verify(&item, "did:plc:alice").await;
        assert!(result.is_tampered);
        assert_eq!(result.reason.as_deref(), Some("Signature does not match payload"));
    }

    #[tokio::test]
    async fn test_issuer_key_is_resolved_once() {
        let authority = LocalSigningAuthority::generate();
        let verifier = verifier(&authority, directory_for(&authority, 1));

        for holder in ["did:plc:alice", "did:plc:bob", "did:plc:carol"] {
            let item = sealed_item(&authority, holder).await;
            assert!(verifier.verify(&item, holder).await.is_valid);
        }
    }

    #[tokio::test]
    async fn test_unresolvable_issuer_key() {
        let authority = LocalSigningAuthority::generate();
        let mut directory = MockDirectoryResolver::new();
        directory
            .expect_resolve_signing_key()
            .returning(|_| Ok(None));
        let verifier = verifier(&authority, directory);

        let item = sealed_item(&authority, "did:plc:alice").await;
        let result = verifier.verify(&item, "did:plc:alice").await;
        assert!(result.is_tampered);
        assert!(result.reason.unwrap().contains("Issuer key unavailable"));
    }

    #[test]
    fn test_missing_private_key_is_a_config_error() {
        assert!(matches!(
            LocalSigningAuthority::from_hex(None),
            Err(ExchangeError::Config(_))
        ));
        assert!(matches!(
            LocalSigningAuthority::from_hex(Some("not-hex")),
            Err(ExchangeError::Config(_))
        ));

        let authority = LocalSigningAuthority::generate();
        let restored = LocalSigningAuthority::from_hex(Some(&authority.secret_hex())).unwrap();
        assert_eq!(restored.did(), authority.did());
    }
}
