use crate::{
    backlinks::{collect_backlinks, distinct_authors, source_path},
    context::{ExchangeContext, Session},
    error::Result,
    model::{RecordRef, RegistryPointer, CONFIG_COLLECTION},
    repository::find_first,
    Did,
};
use tracing::{debug, info};

/// Membership in the shared registry: every member's config record points at the hub's
/// profile, so members are found by asking the backlink index who links to it.
pub struct Registry {
    ctx: ExchangeContext,
}

impl Registry {
    pub fn new(ctx: ExchangeContext) -> Self {
        Self { ctx }
    }

    /// DID of the hub identity, resolved once per process.
    pub async fn hub_did(&self) -> Result<Did> {
        if let Some(did) = self.ctx.caches.registry.get() {
            return Ok(did);
        }

        let did = self
            .ctx
            .directory
            .resolve_handle(&self.ctx.settings.hub_handle)
            .await?;
        debug!(handle = %self.ctx.settings.hub_handle, did = %did, "Resolved registry hub");
        self.ctx.caches.registry.set(&did);
        Ok(did)
    }

    pub async fn has_pointer(&self, session: &Session) -> Result<bool> {
        let existing = find_first(
            session.store.as_ref(),
            &session.did,
            CONFIG_COLLECTION,
            self.ctx.settings.page_size,
            |record| serde_json::from_value::<RegistryPointer>(record.value.clone()).is_ok(),
        )
        .await?;
        Ok(existing.is_some())
    }

    /// Write our registry pointer unless one exists. Returns whether a pointer was written.
    pub async fn ensure_pointer(&self, session: &Session) -> Result<bool> {
        if self.has_pointer(session).await? {
            return Ok(false);
        }

        let hub = self.hub_did().await?;
        let written = session
            .store
            .create_record(
                &session.did,
                CONFIG_COLLECTION,
                serde_json::to_value(RegistryPointer::new(&hub))?,
            )
            .await?;

        info!(pointer = %written.uri, hub = %hub, "Joined registry");
        Ok(true)
    }

    /// Every party whose pointer is visible in the backlink index.
    pub async fn members(&self) -> Result<Vec<Did>> {
        let hub = self.hub_did().await?;
        let links = collect_backlinks(
            self.ctx.backlinks.as_ref(),
            &RecordRef::profile(&hub).to_string(),
            &source_path(CONFIG_COLLECTION, "hubRef"),
        )
        .await;

        Ok(distinct_authors(&links))
    }
}
