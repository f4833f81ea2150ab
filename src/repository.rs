use crate::{
    error::{ExchangeError, Result},
    model::RecordRef,
};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub uri: RecordRef,
    #[serde(default)]
    pub cid: String,
    pub value: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordPage {
    #[serde(default)]
    pub records: Vec<StoredRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteResult {
    pub uri: RecordRef,
    pub cid: String,
}

/// A personal repository host. Writes are only ever issued against the caller's own repository.
#[async_trait]
pub trait RepositoryStore: Send + Sync {
    /// One page of records, newest first.
    async fn list_records(
        &self,
        owner: &str,
        collection: &str,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<RecordPage>;

    /// Fails with `NotFound` when the record does not exist.
    async fn get_record(&self, owner: &str, collection: &str, rkey: &str) -> Result<StoredRecord>;

    async fn create_record(&self, owner: &str, collection: &str, value: Value) -> Result<WriteResult>;

    /// Replace a record. When `swap` is given the write only succeeds if the stored content
    /// hash still matches it.
    async fn put_record(
        &self,
        owner: &str,
        collection: &str,
        rkey: &str,
        value: Value,
        swap: Option<&str>,
    ) -> Result<WriteResult>;

    async fn delete_record(&self, owner: &str, collection: &str, rkey: &str) -> Result<()>;
}

/// Opens read access to a repository host found through directory resolution.
pub trait RepositoryConnector: Send + Sync {
    fn open(&self, endpoint: &str) -> Arc<dyn RepositoryStore>;
}

/// Every record of a collection, fetched page by page in cursor order. A failure after the
/// first page ends pagination with what was collected so far.
pub async fn list_all(
    store: &dyn RepositoryStore,
    owner: &str,
    collection: &str,
    page_size: u32,
) -> Result<Vec<StoredRecord>> {
    let mut records = Vec::new();
    let mut cursor: Option<String> = None;

    loop {
        let page = match store
            .list_records(owner, collection, cursor.as_deref(), page_size)
            .await
        {
            Ok(page) => page,
            Err(e) if records.is_empty() => return Err(e),
            Err(e) => {
                warn!(owner, collection, error = %e, "Pagination stopped early");
                break;
            }
        };

        let page_len = page.records.len();
        records.extend(page.records);

        match page.cursor {
            Some(next) if page_len > 0 && cursor.as_deref() != Some(next.as_str()) => {
                cursor = Some(next)
            }
            _ => break,
        }
    }

    Ok(records)
}

/// First record in cursor order satisfying `predicate`; stops paging as soon as it is found.
pub async fn find_first<F>(
    store: &dyn RepositoryStore,
    owner: &str,
    collection: &str,
    page_size: u32,
    mut predicate: F,
) -> Result<Option<StoredRecord>>
where
    F: FnMut(&StoredRecord) -> bool + Send,
{
    let mut cursor: Option<String> = None;

    loop {
        let page = store
            .list_records(owner, collection, cursor.as_deref(), page_size)
            .await?;
        let page_len = page.records.len();

        if let Some(found) = page.records.into_iter().find(|record| predicate(record)) {
            return Ok(Some(found));
        }

        match page.cursor {
            Some(next) if page_len > 0 && cursor.as_deref() != Some(next.as_str()) => {
                cursor = Some(next)
            }
            _ => return Ok(None),
        }
    }
}

#[derive(Debug, Deserialize)]
struct XrpcErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// `com.atproto.repo.*` over HTTP.
#[derive(Clone)]
pub struct XrpcRepository {
    endpoint: String,
    client: Client,
    access_token: Option<String>,
}

impl XrpcRepository {
    pub fn new(endpoint: String) -> Self {
        Self::with_client(endpoint, Client::new())
    }

    pub fn with_client(endpoint: String, client: Client) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client,
            access_token: None,
        }
    }

    pub fn with_access_token(mut self, token: String) -> Self {
        self.access_token = Some(token);
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn url(&self, method: &str) -> String {
        format!("{}/xrpc/{}", self.endpoint, method)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn check(&self, response: Response, what: &str) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let parsed: Option<XrpcErrorBody> = serde_json::from_str(&body).ok();
        let code = parsed.as_ref().and_then(|b| b.error.clone()).unwrap_or_default();
        let message = parsed
            .and_then(|b| b.message)
            .unwrap_or_else(|| body.clone());

        if status == StatusCode::NOT_FOUND || code == "RecordNotFound" {
            return Err(ExchangeError::NotFound(what.to_string()));
        }

        Err(ExchangeError::Repository(format!(
            "{} failed with {} {}: {}",
            what, status, code, message
        )))
    }
}

#[async_trait]
impl RepositoryStore for XrpcRepository {
    async fn list_records(
        &self,
        owner: &str,
        collection: &str,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<RecordPage> {
        let mut query = vec![
            ("repo", owner.to_string()),
            ("collection", collection.to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor.to_string()));
        }

        let response = self
            .authorize(self.client.get(self.url("com.atproto.repo.listRecords")))
            .query(&query)
            .send()
            .await?;
        let response = self
            .check(response, &format!("listRecords {}/{}", owner, collection))
            .await?;

        Ok(response.json().await?)
    }

    async fn get_record(&self, owner: &str, collection: &str, rkey: &str) -> Result<StoredRecord> {
        let response = self
            .authorize(self.client.get(self.url("com.atproto.repo.getRecord")))
            .query(&[("repo", owner), ("collection", collection), ("rkey", rkey)])
            .send()
            .await?;
        let response = self
            .check(response, &RecordRef::new(owner, collection, rkey).to_string())
            .await?;

        Ok(response.json().await?)
    }

    async fn create_record(&self, owner: &str, collection: &str, value: Value) -> Result<WriteResult> {
        let response = self
            .authorize(self.client.post(self.url("com.atproto.repo.createRecord")))
            .json(&json!({ "repo": owner, "collection": collection, "record": value }))
            .send()
            .await?;
        let response = self
            .check(response, &format!("createRecord {}/{}", owner, collection))
            .await?;

        Ok(response.json().await?)
    }

    async fn put_record(
        &self,
        owner: &str,
        collection: &str,
        rkey: &str,
        value: Value,
        swap: Option<&str>,
    ) -> Result<WriteResult> {
        let mut body = json!({
            "repo": owner,
            "collection": collection,
            "rkey": rkey,
            "record": value,
        });
        if let Some(swap) = swap {
            body["swapRecord"] = Value::String(swap.to_string());
        }

        let response = self
            .authorize(self.client.post(self.url("com.atproto.repo.putRecord")))
            .json(&body)
            .send()
            .await?;
        let response = self
            .check(response, &RecordRef::new(owner, collection, rkey).to_string())
            .await?;

        Ok(response.json().await?)
    }

    async fn delete_record(&self, owner: &str, collection: &str, rkey: &str) -> Result<()> {
        let response = self
            .authorize(self.client.post(self.url("com.atproto.repo.deleteRecord")))
            .json(&json!({ "repo": owner, "collection": collection, "rkey": rkey }))
            .send()
            .await?;
        self.check(response, &RecordRef::new(owner, collection, rkey).to_string())
            .await?;

        Ok(())
    }
}

/// Opens unauthenticated `XrpcRepository` handles sharing one HTTP client.
#[derive(Clone, Default)]
pub struct XrpcConnector {
    client: Client,
}

impl XrpcConnector {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl RepositoryConnector for XrpcConnector {
    fn open(&self, endpoint: &str) -> Arc<dyn RepositoryStore> {
        Arc::new(XrpcRepository::with_client(endpoint.to_string(), self.client.clone()))
    }
}
