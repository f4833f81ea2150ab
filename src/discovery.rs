use crate::{
    backlinks::{collect_backlinks, source_path, BacklinkRecord},
    context::{ExchangeContext, Session},
    directory::ProfileView,
    model::{decode_transaction, Item, RecordRef, Transaction, TransactionStatus, TRANSACTION_COLLECTION},
    repository::list_all,
    seal::SealVerification,
    Did,
};
use futures::future::join_all;
use std::collections::HashSet;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct OfferedItem {
    pub uri: RecordRef,
    pub item: Item,
    pub image_url: Option<String>,
    pub verification: SealVerification,
}

#[derive(Debug, Clone)]
pub struct IncomingOffer {
    pub partner: Did,
    pub uri: RecordRef,
    pub offer: Transaction,
    pub profile: Option<ProfileView>,
    /// Offered items whose seals verified for the partner.
    pub items: Vec<OfferedItem>,
    /// Offered items that could not be read or did not verify, with the reason.
    pub unverified: Vec<(RecordRef, String)>,
}

/// Finds open offers addressed to us in other parties' repositories.
pub struct OfferDiscovery {
    ctx: ExchangeContext,
    session: Session,
}

impl OfferDiscovery {
    pub fn new(ctx: ExchangeContext, session: Session) -> Self {
        Self { ctx, session }
    }

    pub async fn incoming_offers(&self) -> Vec<IncomingOffer> {
        let subject = RecordRef::profile(&self.session.did).to_string();
        let links = collect_backlinks(
            self.ctx.backlinks.as_ref(),
            &subject,
            &source_path(TRANSACTION_COLLECTION, "refPartner"),
        )
        .await;
        debug!(links = links.len(), "Candidate offers from backlinks");

        let answered = self.answered_offers().await;
        let resolved = join_all(links.iter().map(|link| self.resolve_link(link, &answered))).await;

        let mut offers: Vec<IncomingOffer> = resolved.into_iter().flatten().collect();
        offers.sort_by(|a, b| b.offer.created_at.cmp(&a.offer.created_at));
        offers
    }

    /// Offers we have already completed or rejected.
    async fn answered_offers(&self) -> HashSet<RecordRef> {
        match list_all(
            self.session.store.as_ref(),
            &self.session.did,
            TRANSACTION_COLLECTION,
            self.ctx.settings.page_size,
        )
        .await
        {
            Ok(records) => records
                .into_iter()
                .filter_map(|record| decode_transaction(record.value).ok())
                .filter_map(|tx| tx.ref_transaction)
                .collect(),
            Err(e) => {
                warn!(error = %e, "Could not list own transactions");
                HashSet::new()
            }
        }
    }

    async fn resolve_link(&self, link: &BacklinkRecord, answered: &HashSet<RecordRef>) -> Option<IncomingOffer> {
        if link.collection.as_deref().is_some_and(|c| c != TRANSACTION_COLLECTION) {
            return None;
        }

        let record = match self.ctx.fetch_linked_record(link).await {
            Ok(record) => record,
            Err(e) => {
                debug!(link = ?link.record_ref(), error = %e, "Dropping unreadable offer");
                return None;
            }
        };

        let offer = decode_transaction(record.value).ok()?;
        if offer.status != TransactionStatus::Offered
            || offer.partner.as_deref() != Some(self.session.did.as_str())
            || answered.contains(&record.uri)
        {
            return None;
        }

        let partner = record.uri.owner.clone();
        let (profile, (items, unverified)) =
            tokio::join!(self.ctx.directory.profile(&partner), self.offered_items(&partner, &offer));

        Some(IncomingOffer {
            partner,
            uri: record.uri,
            offer,
            profile: profile.ok().flatten(),
            items,
            unverified,
        })
    }

    async fn offered_items(&self, partner: &str, offer: &Transaction) -> (Vec<OfferedItem>, Vec<(RecordRef, String)>) {
        let remote = match self.ctx.open_repository(partner).await {
            Ok(remote) => remote,
            Err(e) => {
                let reason = e.to_string();
                return (
                    vec![],
                    offer.sticker_out.iter().map(|uri| (uri.clone(), reason.clone())).collect(),
                );
            }
        };

        let fetched = join_all(offer.sticker_out.iter().map(|uri| {
            let remote = remote.clone();
            async move {
                let (_, item) = self.ctx.fetch_item(remote.as_ref(), uri).await?;
                let verification = self.ctx.seals.verify(&item, partner).await;
                Ok::<_, crate::error::ExchangeError>((item, verification))
            }
        }))
        .await;

        let mut items = Vec::new();
        let mut unverified = Vec::new();
        for (uri, result) in offer.sticker_out.iter().zip(fetched) {
            match result {
                Ok((item, verification)) if verification.is_valid => items.push(OfferedItem {
                    uri: uri.clone(),
                    image_url: item.image_url(&self.ctx.settings.cdn_base),
                    item,
                    verification,
                }),
                Ok((_, verification)) => unverified.push((
                    uri.clone(),
                    verification.reason.unwrap_or_else(|| "Seal did not verify".to_string()),
                )),
                Err(e) => unverified.push((uri.clone(), e.to_string())),
            }
        }

        (items, unverified)
    }
}
