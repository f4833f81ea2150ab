use crate::{
    backlinks::{collect_backlinks, distinct_authors, source_path},
    context::{ExchangeContext, Session},
    directory::ProfileView,
    error::{ExchangeError, Result},
    model::{
        decode_item, ImageRef, Item, Like, RecordRef, StrongRef, CONFIG_COLLECTION, DEFAULT_MODEL,
        STICKER_COLLECTION, STICKER_LIKE_COLLECTION, TRANSACTION_COLLECTION,
    },
    registry::Registry,
    repository::{find_first, list_all, RepositoryStore},
    seal::SealInfo,
    Did,
};
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

const MAX_LIKERS_SHOWN: usize = 5;

/// An item as shown to others, with trusted fields taken from its seal.
#[derive(Debug, Clone)]
pub struct CollectionItem {
    pub uri: RecordRef,
    pub cid: String,
    pub item: Item,
    pub image_url: Option<String>,
    /// Profile of the party the item depicts.
    pub profile: Option<ProfileView>,
    pub giver_profile: Option<ProfileView>,
    pub original_owner_profile: Option<ProfileView>,
}

impl CollectionItem {
    pub fn location(&self) -> StrongRef {
        StrongRef {
            uri: self.uri.clone(),
            cid: self.cid.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CollectionView {
    pub visible: Vec<CollectionItem>,
    /// Records hidden from the collection and why.
    pub hidden: Vec<(RecordRef, String)>,
}

#[derive(Debug, Clone)]
pub struct LikeState {
    pub target: StrongRef,
    pub count: usize,
    pub my_like: Option<RecordRef>,
    pub likers: Vec<ProfileView>,
}

pub struct CollectionService {
    ctx: ExchangeContext,
    session: Session,
}

impl CollectionService {
    pub fn new(ctx: ExchangeContext, session: Session) -> Self {
        Self { ctx, session }
    }

    /// Mint our own item and join the registry. Returns false when already initialized.
    pub async fn initialize(&self, avatar: Option<String>) -> Result<bool> {
        let registry = Registry::new(self.ctx.clone());
        if registry.has_pointer(&self.session).await? {
            return Ok(false);
        }

        let me = self.session.did.as_str();
        let avatar = avatar.filter(|url| !url.is_empty());
        let held = self.ctx.held_identities(self.session.store.as_ref(), me).await?;
        let already_minted = held
            .iter()
            .any(|id| id.subject == me && id.original_owner == me && id.model == DEFAULT_MODEL);

        if !already_minted {
            let info = SealInfo {
                model: Some(DEFAULT_MODEL.to_string()),
                image: avatar.clone(),
                ..Default::default()
            };
            let seal = self.ctx.seals.issue(me, &info).await?;
            let item = Item::self_minted(me, avatar, seal);
            let written = self
                .session
                .store
                .create_record(me, STICKER_COLLECTION, serde_json::to_value(&item)?)
                .await?;
            info!(item = %written.uri, "Minted own item");
        }

        registry.ensure_pointer(&self.session).await?;
        Ok(true)
    }

    /// Everything `holder` holds, split into items whose seals verify and the rest.
    pub async fn items_of(&self, holder: &str) -> Result<CollectionView> {
        let store = self.store_for(holder).await?;
        let records = list_all(store.as_ref(), holder, STICKER_COLLECTION, self.ctx.settings.page_size).await?;

        let checked = join_all(records.into_iter().map(|record| async move {
            let item = match decode_item(record.value.clone()) {
                Ok(item) => item,
                Err(e) => return Err((record.uri, e.to_string())),
            };
            let verification = self.ctx.seals.verify(&item, holder).await;
            match verification.into_trusted() {
                Ok(payload) => Ok((record.uri, record.cid, item, payload.info)),
                Err(e) => Err((record.uri, e.to_string())),
            }
        }))
        .await;

        let mut view = CollectionView::default();
        let mut verified = Vec::new();
        for result in checked {
            match result {
                Ok((uri, cid, item, trusted)) => verified.push((uri, cid, overlay_trusted(item, trusted))),
                Err((uri, reason)) => {
                    debug!(item = %uri, reason = %reason, "Hiding item");
                    view.hidden.push((uri, reason));
                }
            }
        }

        let profiles = self
            .profiles_of(verified.iter().flat_map(|(_, _, item)| {
                [Some(&item.subject_did), item.obtained_from.as_ref(), Some(&item.original_owner)]
                    .into_iter()
                    .flatten()
            }))
            .await;
        let lookup = |did: Option<&Did>| did.and_then(|did| profiles.get(did)).cloned();

        for (uri, cid, item) in verified {
            let profile = lookup(Some(&item.subject_did));
            // Legacy items without an image show their subject's avatar.
            let image_url = item
                .image_url(&self.ctx.settings.cdn_base)
                .or_else(|| profile.as_ref().and_then(|p| p.avatar.clone()));

            view.visible.push(CollectionItem {
                giver_profile: lookup(item.obtained_from.as_ref()),
                original_owner_profile: lookup(Some(&item.original_owner)),
                profile,
                image_url,
                uri,
                cid,
                item,
            });
        }

        Ok(view)
    }

    pub async fn delete_item(&self, uri: &RecordRef) -> Result<()> {
        if uri.owner != self.session.did || !uri.is_in(STICKER_COLLECTION) {
            return Err(ExchangeError::Validation(format!("{} is not an item you hold", uri)));
        }

        self.session
            .store
            .delete_record(&uri.owner, &uri.collection, &uri.rkey)
            .await?;
        info!(item = %uri, "Item deleted");
        Ok(())
    }

    /// The record likes should point at: the originally minted copy when it can be found.
    pub async fn resolve_like_target(&self, target: &CollectionItem) -> StrongRef {
        let item = &target.item;
        if target.uri.owner == item.original_owner || item.model == DEFAULT_MODEL {
            return target.location();
        }

        let identity = item.identity();
        if let Some(location) = self.ctx.caches.canonical.get(&identity) {
            return location;
        }

        let original_owner = item.original_owner.as_str();
        let found = match self.ctx.open_repository(original_owner).await {
            Ok(store) => find_first(
                store.as_ref(),
                original_owner,
                STICKER_COLLECTION,
                self.ctx.settings.page_size,
                |record| {
                    decode_item(record.value.clone())
                        .map(|candidate| candidate.identity() == identity)
                        .unwrap_or(false)
                },
            )
            .await,
            Err(e) => Err(e),
        };

        match found {
            Ok(Some(record)) => {
                let location = StrongRef {
                    uri: record.uri,
                    cid: record.cid,
                };
                self.ctx.caches.canonical.insert(identity, location.clone());
                location
            }
            Ok(None) => target.location(),
            Err(e) => {
                warn!(item = %target.uri, error = %e, "Canonical copy unavailable, liking local copy");
                target.location()
            }
        }
    }

    /// Remove `current_like` if given, otherwise like the item's canonical copy.
    pub async fn toggle_like(
        &self,
        target: &CollectionItem,
        current_like: Option<&RecordRef>,
    ) -> Result<Option<RecordRef>> {
        if let Some(like) = current_like {
            if like.owner != self.session.did || !like.is_in(STICKER_LIKE_COLLECTION) {
                return Err(ExchangeError::Validation(format!("{} is not one of your likes", like)));
            }
            self.session
                .store
                .delete_record(&like.owner, &like.collection, &like.rkey)
                .await?;
            return Ok(None);
        }

        let subject = self.resolve_like_target(target).await;
        let written = self
            .session
            .store
            .create_record(
                &self.session.did,
                STICKER_LIKE_COLLECTION,
                serde_json::to_value(Like::new(subject))?,
            )
            .await?;
        Ok(Some(written.uri))
    }

    pub async fn like_state(&self, target: &CollectionItem) -> LikeState {
        let target = self.resolve_like_target(target).await;
        let links = collect_backlinks(
            self.ctx.backlinks.as_ref(),
            &target.uri.to_string(),
            &source_path(STICKER_LIKE_COLLECTION, "subject.uri"),
        )
        .await;

        let my_like = links
            .iter()
            .find(|link| link.author().as_deref() == Some(self.session.did.as_str()))
            .and_then(|link| link.record_ref());

        let authors = distinct_authors(&links);
        let profiles = join_all(
            authors
                .iter()
                .take(MAX_LIKERS_SHOWN)
                .map(|did| self.ctx.directory.profile(did)),
        )
        .await;

        LikeState {
            target,
            count: links.len(),
            my_like,
            likers: profiles.into_iter().filter_map(|p| p.ok().flatten()).collect(),
        }
    }

    /// Delete every item, transaction and registry pointer we hold.
    pub async fn purge(&self) -> Result<usize> {
        let me = self.session.did.as_str();
        let mut deleted = 0;

        for collection in [STICKER_COLLECTION, TRANSACTION_COLLECTION, CONFIG_COLLECTION] {
            let records = list_all(self.session.store.as_ref(), me, collection, self.ctx.settings.page_size).await?;
            for record in records {
                self.session
                    .store
                    .delete_record(me, collection, &record.uri.rkey)
                    .await?;
                deleted += 1;
            }
        }

        info!(deleted, "Purged all data");
        Ok(deleted)
    }

    /// Profiles of the given parties, each looked up once. Unknown parties are left out.
    async fn profiles_of<'a>(&self, dids: impl Iterator<Item = &'a Did>) -> HashMap<Did, ProfileView> {
        let distinct: HashSet<&Did> = dids.collect();
        let fetched = join_all(distinct.into_iter().map(|did| async move {
            (did, self.ctx.directory.profile(did).await)
        }))
        .await;

        fetched
            .into_iter()
            .filter_map(|(did, result)| match result {
                Ok(profile) => profile.map(|profile| (did.clone(), profile)),
                Err(e) => {
                    debug!(did = %did, error = %e, "Profile unavailable");
                    None
                }
            })
            .collect()
    }

    async fn store_for(&self, holder: &str) -> Result<Arc<dyn RepositoryStore>> {
        if holder == self.session.did {
            Ok(self.session.store.clone())
        } else {
            self.ctx.open_repository(holder).await
        }
    }
}

fn overlay_trusted(mut item: Item, trusted: SealInfo) -> Item {
    if let Some(model) = trusted.model {
        item.model = model;
    }
    if let Some(image) = trusted.image {
        item.image = Some(ImageRef::Url(image));
    }
    if let Some(obtained_from) = trusted.obtained_from {
        item.obtained_from = Some(obtained_from);
    }
    item
}
