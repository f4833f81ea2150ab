//! Anonymous partner search.
//!
//! Probes a random sample of registry members for an open anonymous offer. Best effort:
//! two parties can pick the same offer at the same time, and the completion guard only
//! sees completions the backlink index has already indexed.

use crate::{
    backlinks::{collect_backlinks, source_path},
    context::ExchangeContext,
    error::Result,
    model::{decode_transaction, Item, ItemIdentity, RecordRef, Transaction, TransactionStatus, TRANSACTION_COLLECTION},
    registry::Registry,
    repository::list_all,
    Did,
};
use futures::{future::join_all, stream::FuturesUnordered, StreamExt};
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct MatcherSettings {
    pub search_limit: usize,
    pub max_in_flight: usize,
    pub probe_timeout: Duration,
}

impl Default for MatcherSettings {
    fn default() -> Self {
        Self {
            search_limit: 200,
            max_in_flight: 10,
            probe_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MatchCandidate {
    pub did: Did,
    pub offer: RecordRef,
    pub transaction: Transaction,
    /// The candidate holds none of the items we are offering.
    pub perfect: bool,
}

pub struct ExchangeMatcher {
    ctx: ExchangeContext,
    me: Did,
}

impl ExchangeMatcher {
    pub fn new(ctx: ExchangeContext, me: impl Into<Did>) -> Self {
        Self { ctx, me: me.into() }
    }

    pub async fn find_partner(&self, offered: &[Item], excluded: &HashSet<Did>) -> Result<Option<MatchCandidate>> {
        let settings = &self.ctx.settings.matcher;
        let mut pool: Vec<Did> = Registry::new(self.ctx.clone())
            .members()
            .await?
            .into_iter()
            .filter(|did| *did != self.me && !excluded.contains(did))
            .collect();

        pool.shuffle(&mut rand::thread_rng());
        pool.truncate(settings.search_limit);
        debug!(candidates = pool.len(), "Probing registry members");

        let offered_ids: HashSet<ItemIdentity> = offered.iter().map(Item::identity).collect();
        let offered_ids = &offered_ids;
        let semaphore = Arc::new(Semaphore::new(settings.max_in_flight.max(1)));

        let mut probes: FuturesUnordered<_> = pool
            .into_iter()
            .map(|did| {
                let semaphore = semaphore.clone();
                async move {
                    let _permit = semaphore.acquire().await.ok()?;
                    match timeout(settings.probe_timeout, self.probe(&did, offered_ids)).await {
                        Ok(Ok(found)) => found,
                        Ok(Err(e)) => {
                            debug!(candidate = %did, error = %e, "Probe failed");
                            None
                        }
                        Err(_) => {
                            debug!(candidate = %did, "Probe timed out");
                            None
                        }
                    }
                }
            })
            .collect();

        let mut fallback: Option<MatchCandidate> = None;
        while let Some(result) = probes.next().await {
            let Some(candidate) = result else { continue };
            if candidate.perfect {
                info!(partner = %candidate.did, offer = %candidate.offer, "Perfect match found");
                return Ok(Some(candidate));
            }
            fallback.get_or_insert(candidate);
        }

        if let Some(candidate) = &fallback {
            info!(partner = %candidate.did, offer = %candidate.offer, "Partial match found");
        }
        Ok(fallback)
    }

    async fn probe(&self, did: &str, offered: &HashSet<ItemIdentity>) -> Result<Option<MatchCandidate>> {
        let remote = self.ctx.open_repository(did).await?;
        let records = list_all(remote.as_ref(), did, TRANSACTION_COLLECTION, self.ctx.settings.page_size).await?;

        let open: Vec<(RecordRef, Transaction)> = records
            .into_iter()
            .filter_map(|record| {
                let tx = decode_transaction(record.value).ok()?;
                tx.is_open_anonymous().then_some((record.uri, tx))
            })
            .collect();

        let mut chosen = None;
        for (uri, tx) in open {
            if self.is_claimed(&uri).await {
                debug!(offer = %uri, "Offer already claimed");
                continue;
            }
            chosen = Some((uri, tx));
            break;
        }
        let Some((offer, transaction)) = chosen else {
            return Ok(None);
        };

        let held = self.ctx.held_identities(remote.as_ref(), did).await?;
        let perfect = offered.iter().all(|identity| !held.contains(identity));

        Ok(Some(MatchCandidate {
            did: did.to_string(),
            offer,
            transaction,
            perfect,
        }))
    }

    /// Whether someone has already completed a barter against this offer.
    async fn is_claimed(&self, offer: &RecordRef) -> bool {
        let links = collect_backlinks(
            self.ctx.backlinks.as_ref(),
            &offer.to_string(),
            &source_path(TRANSACTION_COLLECTION, "refTransaction"),
        )
        .await;

        let answers = join_all(links.iter().map(|link| self.ctx.fetch_linked_record(link))).await;
        answers
            .into_iter()
            .filter_map(|record| record.ok())
            .filter_map(|record| decode_transaction(record.value).ok())
            .any(|tx| tx.status == TransactionStatus::Completed && tx.ref_transaction.as_ref() == Some(offer))
    }
}
