use crate::{
    backlinks::{BacklinkIndex, BacklinkRecord, ConstellationClient},
    cache::RuntimeCaches,
    config::AppConfig,
    directory::{DirectoryResolver, PlcDirectory},
    error::{ExchangeError, Result},
    matcher::MatcherSettings,
    model::{decode_item, Item, ItemIdentity, RecordRef, STICKER_COLLECTION},
    repository::{list_all, RepositoryConnector, RepositoryStore, StoredRecord, XrpcConnector, XrpcRepository},
    seal::{HttpSigningAuthority, LocalSigningAuthority, SealEngine, SealVerifier, SigningAuthority},
    Did,
};
use reqwest::Client;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct ExchangeSettings {
    pub page_size: u32,
    pub cdn_base: String,
    pub hub_handle: String,
    pub matcher: MatcherSettings,
    pub app_origin: Option<String>,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            page_size: 50,
            cdn_base: "https://cdn.bsky.app/img/feed_fullsize/plain".to_string(),
            hub_handle: "suibari.com".to_string(),
            matcher: MatcherSettings::default(),
            app_origin: None,
        }
    }
}

/// The authenticated party: its DID and a writable handle on its own repository.
#[derive(Clone)]
pub struct Session {
    pub did: Did,
    pub store: Arc<dyn RepositoryStore>,
}

impl Session {
    pub fn new(did: impl Into<Did>, store: Arc<dyn RepositoryStore>) -> Self {
        Self {
            did: did.into(),
            store,
        }
    }

    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let did = config.session_did()?.to_string();
        let client = Client::builder().timeout(config.request_timeout()).build()?;

        let mut store = XrpcRepository::with_client(config.session.service.clone(), client);
        if let Some(token) = &config.session.access_token {
            store = store.with_access_token(token.clone());
        }

        Ok(Self::new(did, Arc::new(store)))
    }
}

/// Collaborators and settings shared by every service.
#[derive(Clone)]
pub struct ExchangeContext {
    pub directory: Arc<dyn DirectoryResolver>,
    pub connector: Arc<dyn RepositoryConnector>,
    pub backlinks: Arc<dyn BacklinkIndex>,
    pub seals: Arc<SealEngine>,
    pub caches: RuntimeCaches,
    pub settings: ExchangeSettings,
    /// Cached read endpoint consulted when an author's own host cannot be read.
    pub fallback_reader: Option<Arc<dyn RepositoryStore>>,
}

impl ExchangeContext {
    pub fn new(
        directory: Arc<dyn DirectoryResolver>,
        connector: Arc<dyn RepositoryConnector>,
        backlinks: Arc<dyn BacklinkIndex>,
        authority: Arc<dyn SigningAuthority>,
        trusted_issuers: Vec<Did>,
        settings: ExchangeSettings,
    ) -> Self {
        let caches = RuntimeCaches::new();
        let verifier = SealVerifier::new(
            trusted_issuers,
            directory.clone(),
            caches.issuer_keys.clone(),
            settings.cdn_base.clone(),
        );

        Self {
            directory,
            connector,
            backlinks,
            seals: Arc::new(SealEngine::new(verifier, authority)),
            caches,
            settings,
            fallback_reader: None,
        }
    }

    pub fn with_fallback_reader(mut self, reader: Arc<dyn RepositoryStore>) -> Self {
        self.fallback_reader = Some(reader);
        self
    }

    /// HTTP collaborators as configured. A configured issuer key selects the in-process
    /// authority and implicitly trusts it.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.request_timeout()).build()?;
        let mut trusted = config.authority.trusted_issuers.clone();

        let authority: Arc<dyn SigningAuthority> = match config.authority.private_key_hex.as_deref() {
            Some(hex_key) => {
                let local = LocalSigningAuthority::from_hex(Some(hex_key))?;
                info!(issuer = local.did(), "Using in-process signing authority");
                trusted.push(local.did().to_string());
                Arc::new(local)
            }
            None => {
                let mut remote =
                    HttpSigningAuthority::with_client(config.authority.endpoint.clone(), client.clone());
                if let Some(token) = &config.session.access_token {
                    remote = remote.with_access_token(token.clone());
                }
                Arc::new(remote)
            }
        };

        let settings = ExchangeSettings {
            page_size: config.page_size(),
            cdn_base: config.network.cdn_base.clone(),
            hub_handle: config.registry.hub_handle.clone(),
            matcher: config.matcher_settings(),
            app_origin: config.exchange.app_origin.clone(),
        };

        let context = Self::new(
            Arc::new(PlcDirectory::with_client(
                config.network.plc_directory.clone(),
                config.network.appview.clone(),
                client.clone(),
            )),
            Arc::new(XrpcConnector::new(client.clone())),
            Arc::new(ConstellationClient::with_client(config.network.backlinks.clone(), client.clone())),
            authority,
            trusted,
            settings,
        );

        Ok(context.with_fallback_reader(Arc::new(XrpcRepository::with_client(
            config.network.appview.clone(),
            client,
        ))))
    }

    pub async fn open_repository(&self, did: &str) -> Result<Arc<dyn RepositoryStore>> {
        let endpoint = self.directory.resolve_endpoint(did).await?;
        Ok(self.connector.open(&endpoint))
    }

    pub async fn fetch_item(&self, store: &dyn RepositoryStore, uri: &RecordRef) -> Result<(StoredRecord, Item)> {
        if !uri.is_in(STICKER_COLLECTION) {
            return Err(ExchangeError::InvalidInput(format!("{} is not an item", uri)));
        }
        let record = store.get_record(&uri.owner, &uri.collection, &uri.rkey).await?;
        let item = decode_item(record.value.clone())?;
        Ok((record, item))
    }

    /// The record behind a backlink: the hydrated value when present, otherwise the author's
    /// host, then the fallback reader.
    pub async fn fetch_linked_record(&self, link: &BacklinkRecord) -> Result<StoredRecord> {
        let uri = link
            .record_ref()
            .ok_or_else(|| ExchangeError::Backlinks("Backlink without a record reference".to_string()))?;

        if let Some(value) = &link.value {
            return Ok(StoredRecord {
                uri,
                cid: link.cid.clone().unwrap_or_default(),
                value: value.clone(),
            });
        }

        let direct = match self.open_repository(&uri.owner).await {
            Ok(store) => store.get_record(&uri.owner, &uri.collection, &uri.rkey).await,
            Err(e) => Err(e),
        };

        match (direct, &self.fallback_reader) {
            (Ok(record), _) => Ok(record),
            (Err(e), Some(fallback)) => {
                debug!(uri = %uri, error = %e, "Reading linked record through fallback");
                fallback.get_record(&uri.owner, &uri.collection, &uri.rkey).await
            }
            (Err(e), None) => Err(e),
        }
    }

    /// Identities of every item `owner` holds. Undecodable records are ignored.
    pub async fn held_identities(&self, store: &dyn RepositoryStore, owner: &str) -> Result<HashSet<ItemIdentity>> {
        let records = list_all(store, owner, STICKER_COLLECTION, self.settings.page_size).await?;
        Ok(records
            .into_iter()
            .filter_map(|record| decode_item(record.value).ok())
            .map(|item| item.identity())
            .collect())
    }
}
