//! In-process network implementing every collaborator seam.
//!
//! All parties sharing one `MemoryNetwork` see the same repositories, backlinks and
//! identities. Each party writes through its own `Session` view, which refuses writes to
//! any other repository; handles opened through the connector are read-only.

use crate::{
    backlinks::{BacklinkIndex, BacklinkPage, BacklinkRecord},
    context::{ExchangeContext, ExchangeSettings, Session},
    directory::{DirectoryResolver, ProfileView},
    error::{ExchangeError, Result},
    model::RecordRef,
    repository::{RecordPage, RepositoryConnector, RepositoryStore, StoredRecord, WriteResult},
    seal::SigningAuthority,
    Did,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const BACKLINK_PAGE_SIZE: usize = 50;

#[derive(Debug, Clone)]
struct Entry {
    rkey: String,
    cid: String,
    value: Value,
}

/// collection -> entries sorted by rkey
type Repository = BTreeMap<String, Vec<Entry>>;

#[derive(Debug, Default)]
struct Identities {
    handles: HashMap<String, Did>,
    profiles: HashMap<Did, ProfileView>,
    signing_keys: HashMap<Did, String>,
}

#[derive(Debug, Default)]
struct Faults {
    offline: HashSet<Did>,
    latency: HashMap<Did, Duration>,
    hydrate_backlinks: bool,
}

#[derive(Debug, Default)]
struct NetworkInner {
    repos: RwLock<BTreeMap<Did, Repository>>,
    identities: RwLock<Identities>,
    faults: RwLock<Faults>,
    next_rkey: AtomicU64,
    writes: AtomicU64,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

/// A view on the shared repositories. `writer` is the only repository it may modify.
#[derive(Debug, Clone)]
pub struct MemoryRepository {
    inner: Arc<NetworkInner>,
    writer: Option<Did>,
    bypass_faults: bool,
}

fn content_hash(value: &Value) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    format!("bafy{}", hex::encode(&digest[..16]))
}

fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.trim_start_matches('.')
        .split('.')
        .try_fold(value, |current, segment| current.get(segment))
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writable session for `did`.
    pub fn session(&self, did: &str) -> Session {
        Session::new(
            did,
            Arc::new(MemoryRepository {
                inner: self.inner.clone(),
                writer: Some(did.to_string()),
                bypass_faults: false,
            }),
        )
    }

    /// Read-only cached view unaffected by host outages.
    pub fn reader(&self) -> Arc<dyn RepositoryStore> {
        Arc::new(MemoryRepository {
            inner: self.inner.clone(),
            writer: None,
            bypass_faults: true,
        })
    }

    pub fn context(
        &self,
        authority: Arc<dyn SigningAuthority>,
        trusted_issuers: Vec<Did>,
        settings: ExchangeSettings,
    ) -> ExchangeContext {
        ExchangeContext::new(
            Arc::new(self.clone()),
            Arc::new(self.clone()),
            Arc::new(self.clone()),
            authority,
            trusted_issuers,
            settings,
        )
        .with_fallback_reader(self.reader())
    }

    pub fn register_profile(&self, profile: ProfileView) {
        let mut identities = self.inner.identities.write();
        if !profile.handle.is_empty() {
            identities
                .handles
                .insert(profile.handle.clone(), profile.did.clone());
        }
        identities.profiles.insert(profile.did.clone(), profile);
    }

    pub fn register_handle(&self, handle: &str, did: &str) {
        self.inner
            .identities
            .write()
            .handles
            .insert(handle.to_string(), did.to_string());
    }

    pub fn register_signing_key(&self, did: &str, did_key: &str) {
        self.inner
            .identities
            .write()
            .signing_keys
            .insert(did.to_string(), did_key.to_string());
    }

    pub fn set_offline(&self, did: &str, offline: bool) {
        let mut faults = self.inner.faults.write();
        if offline {
            faults.offline.insert(did.to_string());
        } else {
            faults.offline.remove(did);
        }
    }

    pub fn set_latency(&self, did: &str, latency: Duration) {
        self.inner
            .faults
            .write()
            .latency
            .insert(did.to_string(), latency);
    }

    /// When enabled, backlink results carry the linking record's value.
    pub fn set_hydrated_backlinks(&self, hydrate: bool) {
        self.inner.faults.write().hydrate_backlinks = hydrate;
    }

    /// Snapshot of a collection, newest first.
    pub fn records(&self, did: &str, collection: &str) -> Vec<StoredRecord> {
        let repos = self.inner.repos.read();
        repos
            .get(did)
            .and_then(|repo| repo.get(collection))
            .map(|entries| {
                entries
                    .iter()
                    .rev()
                    .map(|entry| StoredRecord {
                        uri: RecordRef::new(did, collection, entry.rkey.as_str()),
                        cid: entry.cid.clone(),
                        value: entry.value.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Total successful writes across all repositories.
    pub fn write_count(&self) -> u64 {
        self.inner.writes.load(Ordering::SeqCst)
    }
}

impl MemoryRepository {
    async fn reach(&self, owner: &str) -> Result<()> {
        if self.bypass_faults {
            return Ok(());
        }

        let (offline, latency) = {
            let faults = self.inner.faults.read();
            (faults.offline.contains(owner), faults.latency.get(owner).copied())
        };

        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if offline {
            return Err(ExchangeError::Repository(format!("Host of {} is unreachable", owner)));
        }
        Ok(())
    }

    fn authorize_write(&self, owner: &str) -> Result<()> {
        match &self.writer {
            Some(writer) if writer == owner => Ok(()),
            _ => Err(ExchangeError::Repository(format!(
                "Not authorized to write to {}",
                owner
            ))),
        }
    }

    fn store(&self, owner: &str, collection: &str, rkey: String, value: Value, swap: Option<&str>) -> Result<WriteResult> {
        let cid = content_hash(&value);
        let mut repos = self.inner.repos.write();
        let entries = repos
            .entry(owner.to_string())
            .or_default()
            .entry(collection.to_string())
            .or_default();

        match entries.binary_search_by(|entry| entry.rkey.cmp(&rkey)) {
            Ok(index) => {
                if let Some(swap) = swap {
                    if entries[index].cid != swap {
                        return Err(ExchangeError::Repository(format!(
                            "Swap mismatch on {}/{}/{}",
                            owner, collection, rkey
                        )));
                    }
                }
                entries[index].cid = cid.clone();
                entries[index].value = value;
            }
            Err(index) => {
                if swap.is_some() {
                    return Err(ExchangeError::Repository(format!(
                        "Swap mismatch on missing record {}/{}/{}",
                        owner, collection, rkey
                    )));
                }
                entries.insert(
                    index,
                    Entry {
                        rkey: rkey.clone(),
                        cid: cid.clone(),
                        value,
                    },
                );
            }
        }

        self.inner.writes.fetch_add(1, Ordering::SeqCst);
        Ok(WriteResult {
            uri: RecordRef::new(owner, collection, rkey),
            cid,
        })
    }
}

#[async_trait]
impl RepositoryStore for MemoryRepository {
    async fn list_records(
        &self,
        owner: &str,
        collection: &str,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<RecordPage> {
        self.reach(owner).await?;
        let limit = limit.max(1) as usize;

        let repos = self.inner.repos.read();
        let newest_first: Vec<&Entry> = repos
            .get(owner)
            .and_then(|repo| repo.get(collection))
            .map(|entries| {
                entries
                    .iter()
                    .rev()
                    .filter(|entry| cursor.map_or(true, |c| entry.rkey.as_str() < c))
                    .collect()
            })
            .unwrap_or_default();

        let has_more = newest_first.len() > limit;
        let records: Vec<StoredRecord> = newest_first
            .into_iter()
            .take(limit)
            .map(|entry| StoredRecord {
                uri: RecordRef::new(owner, collection, entry.rkey.as_str()),
                cid: entry.cid.clone(),
                value: entry.value.clone(),
            })
            .collect();
        let cursor = if has_more {
            records.last().map(|record| record.uri.rkey.clone())
        } else {
            None
        };

        Ok(RecordPage { records, cursor })
    }

    async fn get_record(&self, owner: &str, collection: &str, rkey: &str) -> Result<StoredRecord> {
        self.reach(owner).await?;
        let uri = RecordRef::new(owner, collection, rkey);

        let repos = self.inner.repos.read();
        repos
            .get(owner)
            .and_then(|repo| repo.get(collection))
            .and_then(|entries| entries.iter().find(|entry| entry.rkey == rkey))
            .map(|entry| StoredRecord {
                uri: uri.clone(),
                cid: entry.cid.clone(),
                value: entry.value.clone(),
            })
            .ok_or_else(|| ExchangeError::NotFound(uri.to_string()))
    }

    async fn create_record(&self, owner: &str, collection: &str, value: Value) -> Result<WriteResult> {
        self.authorize_write(owner)?;
        self.reach(owner).await?;
        let rkey = format!("{:013}", self.inner.next_rkey.fetch_add(1, Ordering::SeqCst) + 1);
        self.store(owner, collection, rkey, value, None)
    }

    async fn put_record(
        &self,
        owner: &str,
        collection: &str,
        rkey: &str,
        value: Value,
        swap: Option<&str>,
    ) -> Result<WriteResult> {
        self.authorize_write(owner)?;
        self.reach(owner).await?;
        self.store(owner, collection, rkey.to_string(), value, swap)
    }

    async fn delete_record(&self, owner: &str, collection: &str, rkey: &str) -> Result<()> {
        self.authorize_write(owner)?;
        self.reach(owner).await?;

        let mut repos = self.inner.repos.write();
        if let Some(entries) = repos.get_mut(owner).and_then(|repo| repo.get_mut(collection)) {
            let before = entries.len();
            entries.retain(|entry| entry.rkey != rkey);
            if entries.len() != before {
                self.inner.writes.fetch_add(1, Ordering::SeqCst);
            }
        }
        Ok(())
    }
}

impl RepositoryConnector for MemoryNetwork {
    fn open(&self, _endpoint: &str) -> Arc<dyn RepositoryStore> {
        Arc::new(MemoryRepository {
            inner: self.inner.clone(),
            writer: None,
            bypass_faults: false,
        })
    }
}

#[async_trait]
impl BacklinkIndex for MemoryNetwork {
    async fn get_backlinks(
        &self,
        subject: &str,
        source: &str,
        cursor: Option<&str>,
    ) -> Result<BacklinkPage> {
        let (collection, path) = source
            .split_once(':')
            .ok_or_else(|| ExchangeError::Backlinks(format!("Malformed source {}", source)))?;
        let offset: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
        let hydrate = self.inner.faults.read().hydrate_backlinks;

        let repos = self.inner.repos.read();
        let matching: Vec<BacklinkRecord> = repos
            .iter()
            .flat_map(|(did, repo)| {
                repo.get(collection)
                    .into_iter()
                    .flatten()
                    .filter(|entry| {
                        lookup_path(&entry.value, path).and_then(Value::as_str) == Some(subject)
                    })
                    .map(move |entry| BacklinkRecord {
                        did: Some(did.clone()),
                        collection: Some(collection.to_string()),
                        rkey: Some(entry.rkey.clone()),
                        uri: None,
                        cid: hydrate.then(|| entry.cid.clone()),
                        value: hydrate.then(|| entry.value.clone()),
                    })
            })
            .collect();

        let next = offset + BACKLINK_PAGE_SIZE;
        let cursor = (matching.len() > next).then(|| next.to_string());
        let records = matching
            .into_iter()
            .skip(offset)
            .take(BACKLINK_PAGE_SIZE)
            .collect();

        Ok(BacklinkPage { records, cursor })
    }
}

#[async_trait]
impl DirectoryResolver for MemoryNetwork {
    async fn resolve_endpoint(&self, did: &str) -> Result<String> {
        if !did.starts_with("did:") {
            return Err(ExchangeError::Directory(format!("Not a DID: {}", did)));
        }
        Ok(format!("memory://{}", did))
    }

    async fn resolve_signing_key(&self, did: &str) -> Result<Option<String>> {
        if did.starts_with("did:key:") {
            return Ok(Some(did.to_string()));
        }
        Ok(self.inner.identities.read().signing_keys.get(did).cloned())
    }

    async fn resolve_handle(&self, handle: &str) -> Result<Did> {
        self.inner
            .identities
            .read()
            .handles
            .get(handle)
            .cloned()
            .ok_or_else(|| ExchangeError::NotFound(format!("Handle {}", handle)))
    }

    async fn profile(&self, did: &str) -> Result<Option<ProfileView>> {
        Ok(self.inner.identities.read().profiles.get(did).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_listing_is_newest_first_and_paginated() {
        let network = MemoryNetwork::new();
        let alice = network.session("did:plc:alice");

        for n in 0..5 {
            alice
                .store
                .create_record("did:plc:alice", "test.collection", json!({ "n": n }))
                .await
                .unwrap();
        }

        let first = alice
            .store
            .list_records("did:plc:alice", "test.collection", None, 2)
            .await
            .unwrap();
        assert_eq!(first.records[0].value["n"], 4);
        assert_eq!(first.records[1].value["n"], 3);

        let second = alice
            .store
            .list_records("did:plc:alice", "test.collection", first.cursor.as_deref(), 2)
            .await
            .unwrap();
        assert_eq!(second.records[0].value["n"], 2);

        let all = crate::repository::list_all(alice.store.as_ref(), "did:plc:alice", "test.collection", 2)
            .await
            .unwrap();
        assert_eq!(all.len(), 5);
    }

    #[tokio::test]
    async fn test_views_cannot_write_to_other_repositories() {
        let network = MemoryNetwork::new();
        let alice = network.session("did:plc:alice");
        let opened = network.open("memory://did:plc:bob");

        assert!(alice
            .store
            .create_record("did:plc:bob", "test.collection", json!({}))
            .await
            .is_err());
        assert!(opened
            .create_record("did:plc:bob", "test.collection", json!({}))
            .await
            .is_err());
        assert_eq!(network.write_count(), 0);
    }

    #[tokio::test]
    async fn test_swap_guard() {
        let network = MemoryNetwork::new();
        let alice = network.session("did:plc:alice");
        let written = alice
            .store
            .create_record("did:plc:alice", "test.collection", json!({ "v": 1 }))
            .await
            .unwrap();

        let updated = alice
            .store
            .put_record("did:plc:alice", "test.collection", &written.uri.rkey, json!({ "v": 2 }), Some(&written.cid))
            .await
            .unwrap();
        assert_ne!(updated.cid, written.cid);

        let stale = alice
            .store
            .put_record("did:plc:alice", "test.collection", &written.uri.rkey, json!({ "v": 3 }), Some(&written.cid))
            .await;
        assert!(stale.is_err());
    }

    #[tokio::test]
    async fn test_backlinks_follow_json_paths() {
        let network = MemoryNetwork::new();
        let alice = network.session("did:plc:alice");
        alice
            .store
            .create_record("did:plc:alice", "test.like", json!({ "subject": { "uri": "at://x/y/z" } }))
            .await
            .unwrap();
        alice
            .store
            .create_record("did:plc:alice", "test.like", json!({ "subject": { "uri": "at://other/y/z" } }))
            .await
            .unwrap();

        let page = network
            .get_backlinks("at://x/y/z", "test.like:subject.uri", None)
            .await
            .unwrap();
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.records[0].did.as_deref(), Some("did:plc:alice"));
        assert!(page.records[0].value.is_none());

        network.set_hydrated_backlinks(true);
        let page = network
            .get_backlinks("at://x/y/z", "test.like:.subject.uri", None)
            .await
            .unwrap();
        assert!(page.records[0].value.is_some());
    }

    #[tokio::test]
    async fn test_offline_host_is_unreachable_except_through_reader() {
        let network = MemoryNetwork::new();
        let bob = network.session("did:plc:bob");
        let written = bob
            .store
            .create_record("did:plc:bob", "test.collection", json!({}))
            .await
            .unwrap();

        network.set_offline("did:plc:bob", true);
        let opened = network.open("memory://did:plc:bob");
        assert!(opened
            .get_record("did:plc:bob", "test.collection", &written.uri.rkey)
            .await
            .is_err());
        assert!(network
            .reader()
            .get_record("did:plc:bob", "test.collection", &written.uri.rkey)
            .await
            .is_ok());
    }
}
