//! The barter state machine.
//!
//! One barter is two independent records: the offer in the offerer's repository and the
//! answer (completion or rejection) in the partner's. Neither party ever writes to the
//! other's repository. The offerer learns the outcome by reading the partner's answer
//! during `resolve_pending`, and every step can be re-run safely.

use crate::{
    backlinks::{collect_backlinks, distinct_authors, source_path},
    context::{ExchangeContext, Session},
    error::{ExchangeError, Result},
    model::{
        decode_transaction, AnnouncementPost, Item, RecordRef, Transaction, TransactionStatus, POST_COLLECTION,
        STICKER_COLLECTION, TRANSACTION_COLLECTION,
    },
    repository::{find_first, list_all, RepositoryStore, StoredRecord},
    seal::SealInfo,
    Did,
};
use futures::future::join_all;
use std::collections::HashSet;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum InverseOutcome {
    Completed {
        counter: RecordRef,
        received: Vec<RecordRef>,
    },
    Rejected {
        counter: RecordRef,
    },
    NotFound,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CloneReport {
    pub created: Vec<RecordRef>,
    pub already_held: usize,
    pub failed: usize,
}

impl CloneReport {
    /// Items now held locally, whether copied in this run or before.
    pub fn processed(&self) -> usize {
        self.created.len() + self.already_held
    }
}

#[derive(Debug, Clone)]
pub struct AcceptOutcome {
    pub offer: RecordRef,
    pub transaction: RecordRef,
    pub report: CloneReport,
}

#[derive(Debug, Clone, Default)]
pub struct ResolveSummary {
    pub completed: Vec<RecordRef>,
    pub rejected: Vec<RecordRef>,
    pub pending: Vec<RecordRef>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResolveProgress {
    Scanning { open_offers: usize },
    Checking { offer: RecordRef, partner: Option<Did> },
    Completed { offer: RecordRef, partner: Did, received: usize },
    Rejected { offer: RecordRef, partner: Did },
    Pending { offer: RecordRef },
}

enum Settlement {
    Completed(Vec<RecordRef>),
    Rejected,
}

pub struct ExchangeService {
    ctx: ExchangeContext,
    session: Session,
}

impl ExchangeService {
    pub fn new(ctx: ExchangeContext, session: Session) -> Self {
        Self { ctx, session }
    }

    pub fn did(&self) -> &str {
        &self.session.did
    }

    pub async fn create_offer(
        &self,
        partner: Option<&str>,
        items: &[RecordRef],
        message: Option<String>,
        easy_exchange: bool,
    ) -> Result<RecordRef> {
        if items.is_empty() {
            return Err(ExchangeError::Validation("An offer needs at least one item".to_string()));
        }
        self.ensure_own_items(items)?;

        match partner {
            None if !easy_exchange => {
                return Err(ExchangeError::Validation(
                    "An offer without a partner must be an easy exchange".to_string(),
                ))
            }
            Some(partner) if partner == self.session.did => {
                return Err(ExchangeError::Validation("Cannot offer to yourself".to_string()))
            }
            _ => {}
        }

        let offer = Transaction::offer(partner.map(str::to_string), items.to_vec(), message, easy_exchange);
        let written = self
            .session
            .store
            .create_record(&self.session.did, TRANSACTION_COLLECTION, serde_json::to_value(&offer)?)
            .await?;

        info!(offer = %written.uri, partner = ?partner, items = items.len(), "Offer created");
        Ok(written.uri)
    }

    /// Publish a post mentioning `partner` about an offer of `item_count` items.
    pub async fn announce_offer(&self, partner: &str, item_count: usize) -> Result<RecordRef> {
        let handle = self
            .ctx
            .directory
            .profile(partner)
            .await?
            .map(|profile| profile.handle)
            .filter(|handle| !handle.is_empty())
            .ok_or_else(|| ExchangeError::NotFound(format!("No handle for {}", partner)))?;

        let post = AnnouncementPost::offer(
            &self.session.did,
            partner,
            &handle,
            item_count,
            self.ctx.settings.app_origin.as_deref(),
        );
        let written = self
            .session
            .store
            .create_record(&self.session.did, POST_COLLECTION, serde_json::to_value(&post)?)
            .await?;

        info!(post = %written.uri, partner, "Offer announced");
        Ok(written.uri)
    }

    pub async fn accept_offer(
        &self,
        partner: &str,
        items_to_give: &[RecordRef],
        message: Option<String>,
        offer: Option<&RecordRef>,
    ) -> Result<AcceptOutcome> {
        if partner == self.session.did {
            return Err(ExchangeError::Validation("Cannot accept your own offer".to_string()));
        }
        self.ensure_own_items(items_to_give)?;

        let remote = self.ctx.open_repository(partner).await?;
        let (offer_record, offer) = self.find_offer(remote.as_ref(), partner, offer).await?;

        let report = self
            .clone_items(remote.as_ref(), partner, &offer.sticker_out, offer.message.clone())
            .await?;

        let completion = Transaction::completion(
            partner,
            &offer_record.uri,
            offer.sticker_out.clone(),
            items_to_give.to_vec(),
            message,
        );
        let written = self
            .session
            .store
            .create_record(&self.session.did, TRANSACTION_COLLECTION, serde_json::to_value(&completion)?)
            .await?;

        info!(
            offer = %offer_record.uri,
            transaction = %written.uri,
            created = report.created.len(),
            already_held = report.already_held,
            failed = report.failed,
            "Offer accepted"
        );

        Ok(AcceptOutcome {
            offer: offer_record.uri,
            transaction: written.uri,
            report,
        })
    }

    pub async fn reject_offer(&self, partner: &str, offer: Option<&RecordRef>) -> Result<RecordRef> {
        let remote = self.ctx.open_repository(partner).await?;
        let (offer_record, _) = self.find_offer(remote.as_ref(), partner, offer).await?;

        let rejection = Transaction::rejection(partner, &offer_record.uri);
        let written = self
            .session
            .store
            .create_record(&self.session.did, TRANSACTION_COLLECTION, serde_json::to_value(&rejection)?)
            .await?;

        info!(offer = %offer_record.uri, "Offer rejected");
        Ok(written.uri)
    }

    /// Delete one of our own offers that nobody has answered yet.
    pub async fn withdraw_offer(&self, offer: &RecordRef) -> Result<()> {
        if offer.owner != self.session.did || !offer.is_in(TRANSACTION_COLLECTION) {
            return Err(ExchangeError::Validation(format!("{} is not one of your offers", offer)));
        }

        let record = self
            .session
            .store
            .get_record(&offer.owner, &offer.collection, &offer.rkey)
            .await?;
        let transaction = decode_transaction(record.value)?;
        if transaction.status != TransactionStatus::Offered {
            return Err(ExchangeError::Validation(format!(
                "{} was already answered ({:?})",
                offer, transaction.status
            )));
        }

        self.session
            .store
            .delete_record(&offer.owner, &offer.collection, &offer.rkey)
            .await?;
        info!(offer = %offer, "Offer withdrawn");
        Ok(())
    }

    /// Our own transactions, newest first.
    pub async fn transactions(&self) -> Result<Vec<(RecordRef, Transaction)>> {
        let records = list_all(
            self.session.store.as_ref(),
            &self.session.did,
            TRANSACTION_COLLECTION,
            self.ctx.settings.page_size,
        )
        .await?;

        Ok(records
            .into_iter()
            .filter_map(|record| decode_transaction(record.value).ok().map(|tx| (record.uri, tx)))
            .collect())
    }

    /// Look for the partner's answer to one of our offers and, if it completed, copy in
    /// what they gave.
    pub async fn check_inverse(&self, partner: &str, offer: &RecordRef) -> Result<InverseOutcome> {
        let remote = self.ctx.open_repository(partner).await?;
        let me = self.session.did.as_str();

        let counter = find_first(
            remote.as_ref(),
            partner,
            TRANSACTION_COLLECTION,
            self.ctx.settings.page_size,
            |record| {
                decode_transaction(record.value.clone())
                    .map(|tx| tx.answers(offer, me))
                    .unwrap_or(false)
            },
        )
        .await?;

        let Some(record) = counter else {
            return Ok(InverseOutcome::NotFound);
        };
        let answer = decode_transaction(record.value)?;

        match answer.status {
            TransactionStatus::Rejected => Ok(InverseOutcome::Rejected { counter: record.uri }),
            TransactionStatus::Completed => {
                if answer.sticker_out.is_empty() {
                    return Ok(InverseOutcome::Completed {
                        counter: record.uri,
                        received: vec![],
                    });
                }

                let report = self
                    .clone_items(remote.as_ref(), partner, &answer.sticker_out, answer.message.clone())
                    .await?;
                if report.processed() == 0 {
                    warn!(offer = %offer, partner, "Counter-transaction found but none of its items could be copied");
                    return Ok(InverseOutcome::NotFound);
                }

                Ok(InverseOutcome::Completed {
                    counter: record.uri,
                    received: answer.sticker_out,
                })
            }
            TransactionStatus::Offered => Ok(InverseOutcome::NotFound),
        }
    }

    /// Reconcile every open offer of ours against the partners' repositories.
    pub async fn resolve_pending<F>(&self, mut progress: F) -> Result<ResolveSummary>
    where
        F: FnMut(ResolveProgress) + Send,
    {
        let records = list_all(
            self.session.store.as_ref(),
            &self.session.did,
            TRANSACTION_COLLECTION,
            self.ctx.settings.page_size,
        )
        .await?;

        let open: Vec<(StoredRecord, Transaction)> = records
            .into_iter()
            .filter_map(|record| {
                let tx = decode_transaction(record.value.clone()).ok()?;
                (tx.status == TransactionStatus::Offered).then_some((record, tx))
            })
            .collect();

        progress(ResolveProgress::Scanning { open_offers: open.len() });
        let mut summary = ResolveSummary::default();

        for (record, offer) in open {
            progress(ResolveProgress::Checking {
                offer: record.uri.clone(),
                partner: offer.partner.clone(),
            });

            let outcome = match &offer.partner {
                Some(partner) => self
                    .check_inverse(partner, &record.uri)
                    .await
                    .map(|outcome| Some((partner.clone(), outcome))),
                None => self.reconcile_anonymous(&record.uri).await,
            };

            let event = match outcome {
                Ok(Some((partner, InverseOutcome::Completed { received, .. }))) => {
                    let count = received.len();
                    match self.settle(&record, offer, &partner, Settlement::Completed(received)).await {
                        Ok(()) => ResolveProgress::Completed {
                            offer: record.uri.clone(),
                            partner,
                            received: count,
                        },
                        Err(e) => self.left_pending(&record.uri, &e),
                    }
                }
                Ok(Some((partner, InverseOutcome::Rejected { .. }))) => {
                    match self.settle(&record, offer, &partner, Settlement::Rejected).await {
                        Ok(()) => ResolveProgress::Rejected {
                            offer: record.uri.clone(),
                            partner,
                        },
                        Err(e) => self.left_pending(&record.uri, &e),
                    }
                }
                Ok(_) => ResolveProgress::Pending {
                    offer: record.uri.clone(),
                },
                Err(e) => self.left_pending(&record.uri, &e),
            };

            match &event {
                ResolveProgress::Completed { offer, .. } => summary.completed.push(offer.clone()),
                ResolveProgress::Rejected { offer, .. } => summary.rejected.push(offer.clone()),
                ResolveProgress::Pending { offer } => summary.pending.push(offer.clone()),
                _ => {}
            }
            progress(event);
        }

        info!(
            completed = summary.completed.len(),
            rejected = summary.rejected.len(),
            pending = summary.pending.len(),
            "Pending offers reconciled"
        );
        Ok(summary)
    }

    fn left_pending(&self, offer: &RecordRef, error: &ExchangeError) -> ResolveProgress {
        warn!(offer = %offer, error = %error, "Could not reconcile offer, leaving it pending");
        ResolveProgress::Pending {
            offer: offer.clone(),
        }
    }

    /// Anonymous offers have no partner to ask, so ask everyone whose transaction points at
    /// the offer. Only a completed barter binds a partner.
    async fn reconcile_anonymous(&self, offer: &RecordRef) -> Result<Option<(Did, InverseOutcome)>> {
        let links = collect_backlinks(
            self.ctx.backlinks.as_ref(),
            &offer.to_string(),
            &source_path(TRANSACTION_COLLECTION, "refTransaction"),
        )
        .await;

        for candidate in distinct_authors(&links) {
            if candidate == self.session.did {
                continue;
            }
            match self.check_inverse(&candidate, offer).await {
                Ok(outcome @ InverseOutcome::Completed { .. }) => return Ok(Some((candidate, outcome))),
                Ok(_) => {}
                Err(e) => debug!(offer = %offer, candidate = %candidate, error = %e, "Candidate check failed"),
            }
        }

        Ok(None)
    }

    async fn settle(
        &self,
        record: &StoredRecord,
        mut offer: Transaction,
        partner: &str,
        settlement: Settlement,
    ) -> Result<()> {
        match settlement {
            Settlement::Completed(received) => offer.mark_completed(partner, received)?,
            Settlement::Rejected => offer.mark_rejected(partner)?,
        }

        self.session
            .store
            .put_record(
                &self.session.did,
                TRANSACTION_COLLECTION,
                &record.uri.rkey,
                serde_json::to_value(&offer)?,
                Some(&record.cid),
            )
            .await?;

        info!(offer = %record.uri, partner, status = ?offer.status, "Offer settled");
        Ok(())
    }

    /// Offer lookup shared by accept and reject. With an explicit reference only that record
    /// may match; there is no fallback to another open offer. Offers we already answered
    /// never match, so repeating an accept or reject writes nothing.
    async fn find_offer(
        &self,
        remote: &dyn RepositoryStore,
        partner: &str,
        explicit: Option<&RecordRef>,
    ) -> Result<(StoredRecord, Transaction)> {
        let me = self.session.did.as_str();
        let answered = self.answered_offers().await?;

        let found = match explicit {
            Some(uri) => {
                if uri.owner != partner || !uri.is_in(TRANSACTION_COLLECTION) {
                    return Err(ExchangeError::NotFound(format!("{} is not an offer by {}", uri, partner)));
                }
                if answered.contains(uri) {
                    return Err(ExchangeError::NotFound(format!("{} was already answered", uri)));
                }
                match remote.get_record(&uri.owner, &uri.collection, &uri.rkey).await {
                    Ok(record) => Some(record),
                    Err(e) if e.is_not_found() => None,
                    Err(e) => return Err(e),
                }
            }
            None => {
                find_first(
                    remote,
                    partner,
                    TRANSACTION_COLLECTION,
                    self.ctx.settings.page_size,
                    |record| {
                        !answered.contains(&record.uri)
                            && decode_transaction(record.value.clone())
                                .map(|tx| tx.is_acceptable_by(me))
                                .unwrap_or(false)
                    },
                )
                .await?
            }
        };

        found
            .and_then(|record| {
                let tx = decode_transaction(record.value.clone()).ok()?;
                tx.is_acceptable_by(me).then_some((record, tx))
            })
            .ok_or_else(|| match explicit {
                Some(uri) => ExchangeError::NotFound(format!("{} is not an open offer for {}", uri, me)),
                None => ExchangeError::NotFound(format!("{} has no open offer for {}", partner, me)),
            })
    }

    /// Offers of others that we already completed or rejected.
    async fn answered_offers(&self) -> Result<HashSet<RecordRef>> {
        let records = list_all(
            self.session.store.as_ref(),
            &self.session.did,
            TRANSACTION_COLLECTION,
            self.ctx.settings.page_size,
        )
        .await?;

        Ok(records
            .into_iter()
            .filter_map(|record| decode_transaction(record.value).ok())
            .filter_map(|tx| tx.ref_transaction)
            .collect())
    }

    /// Copy the referenced items from `giver` into our repository, each under a fresh seal.
    /// Items we already hold are skipped, so repeating a copy is harmless.
    async fn clone_items(
        &self,
        remote: &dyn RepositoryStore,
        giver: &str,
        refs: &[RecordRef],
        message: Option<String>,
    ) -> Result<CloneReport> {
        let mut held = self
            .ctx
            .held_identities(self.session.store.as_ref(), &self.session.did)
            .await?;

        let fetched = join_all(refs.iter().map(|uri| self.fetch_sealed(remote, giver, uri))).await;
        let mut report = CloneReport::default();

        for (uri, fetched) in refs.iter().zip(fetched) {
            let item = match fetched {
                Ok(item) => item,
                Err(e) => {
                    warn!(item = %uri, error = %e, "Skipping item");
                    report.failed += 1;
                    continue;
                }
            };

            let identity = item.identity();
            if held.contains(&identity) {
                debug!(item = %uri, "Already held");
                report.already_held += 1;
                continue;
            }

            match self.write_copy(&item, giver, message.clone()).await {
                Ok(created) => {
                    held.insert(identity);
                    report.created.push(created);
                }
                Err(e) => {
                    warn!(item = %uri, error = %e, "Could not copy item");
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    async fn fetch_sealed(&self, remote: &dyn RepositoryStore, giver: &str, uri: &RecordRef) -> Result<Item> {
        if uri.owner != giver || !uri.is_in(STICKER_COLLECTION) {
            return Err(ExchangeError::Validation(format!("{} is not held by {}", uri, giver)));
        }

        let (_, item) = self.ctx.fetch_item(remote, uri).await?;
        self.ctx.seals.verify(&item, giver).await.into_trusted()?;
        Ok(item)
    }

    async fn write_copy(&self, source: &Item, giver: &str, message: Option<String>) -> Result<RecordRef> {
        let image = source.image_url(&self.ctx.settings.cdn_base);
        let info = SealInfo {
            model: Some(source.model.clone()),
            image: image.clone(),
            obtained_from: Some(giver.to_string()),
            original_creator: Some(source.original_owner.clone()),
            name: source.name.clone(),
            message: message.clone(),
        };

        let seal = self.ctx.seals.issue(&self.session.did, &info).await?;
        let copy = Item::received_copy(source, giver, image, message, seal);
        let written = self
            .session
            .store
            .create_record(&self.session.did, STICKER_COLLECTION, serde_json::to_value(&copy)?)
            .await?;

        Ok(written.uri)
    }

    fn ensure_own_items(&self, items: &[RecordRef]) -> Result<()> {
        match items
            .iter()
            .find(|uri| uri.owner != self.session.did || !uri.is_in(STICKER_COLLECTION))
        {
            Some(foreign) => Err(ExchangeError::Validation(format!(
                "{} is not an item held by {}",
                foreign, self.session.did
            ))),
            None => Ok(()),
        }
    }
}
