//! Process-lifetime memo caches shared by the services.
//!
//! Entries are never invalidated implicitly; `RuntimeCaches::reset` clears everything.

use crate::{
    model::{ItemIdentity, StrongRef},
    Did,
};
use ed25519_dalek::VerifyingKey;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct IssuerKeyCache {
    keys: RwLock<HashMap<Did, VerifyingKey>>,
}

impl IssuerKeyCache {
    pub fn get(&self, issuer: &str) -> Option<VerifyingKey> {
        self.keys.read().get(issuer).copied()
    }

    pub fn insert(&self, issuer: &str, key: VerifyingKey) {
        self.keys.write().insert(issuer.to_string(), key);
    }

    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }

    pub fn reset(&self) {
        self.keys.write().clear();
    }
}

#[derive(Debug, Default)]
pub struct RegistryCache {
    hub_did: RwLock<Option<Did>>,
}

impl RegistryCache {
    pub fn get(&self) -> Option<Did> {
        self.hub_did.read().clone()
    }

    pub fn set(&self, did: &str) {
        *self.hub_did.write() = Some(did.to_string());
    }

    pub fn reset(&self) {
        *self.hub_did.write() = None;
    }
}

/// Item identity to the location of its originally minted copy.
#[derive(Debug, Default)]
pub struct CanonicalLocationCache {
    locations: RwLock<HashMap<ItemIdentity, StrongRef>>,
}

impl CanonicalLocationCache {
    pub fn get(&self, identity: &ItemIdentity) -> Option<StrongRef> {
        self.locations.read().get(identity).cloned()
    }

    pub fn insert(&self, identity: ItemIdentity, location: StrongRef) {
        self.locations.write().insert(identity, location);
    }

    pub fn len(&self) -> usize {
        self.locations.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.read().is_empty()
    }

    pub fn reset(&self) {
        self.locations.write().clear();
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeCaches {
    pub issuer_keys: Arc<IssuerKeyCache>,
    pub registry: Arc<RegistryCache>,
    pub canonical: Arc<CanonicalLocationCache>,
}

impl RuntimeCaches {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self) {
        self.issuer_keys.reset();
        self.registry.reset();
        self.canonical.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_signing_key;
    use crate::model::RecordRef;

    #[test]
    fn test_reset_clears_every_cache() {
        let caches = RuntimeCaches::new();
        let shared = caches.clone();

        caches
            .issuer_keys
            .insert("did:key:issuer", generate_signing_key().verifying_key());
        caches.registry.set("did:plc:hub");
        caches.canonical.insert(
            ItemIdentity {
                subject: "did:plc:alice".into(),
                original_owner: "did:plc:alice".into(),
                model: "default".into(),
                shape: None,
            },
            StrongRef {
                uri: RecordRef::new("did:plc:alice", "blue.atsumeat.sticker", "1"),
                cid: "cid".into(),
            },
        );

        assert_eq!(shared.issuer_keys.len(), 1);
        assert_eq!(shared.registry.get().as_deref(), Some("did:plc:hub"));

        shared.reset();
        assert!(caches.issuer_keys.is_empty());
        assert!(caches.registry.get().is_none());
        assert!(caches.canonical.is_empty());
    }
}
