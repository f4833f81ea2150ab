use crate::{
    error::{ExchangeError, Result},
    model::RecordRef,
    Did,
};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use tracing::warn;

/// One record linking to a subject. Indexes that hydrate their results also fill `value`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BacklinkRecord {
    #[serde(default)]
    pub did: Option<Did>,
    #[serde(default)]
    pub collection: Option<String>,
    #[serde(default)]
    pub rkey: Option<String>,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub cid: Option<String>,
    #[serde(default)]
    pub value: Option<Value>,
}

impl BacklinkRecord {
    pub fn record_ref(&self) -> Option<RecordRef> {
        if let Some(uri) = self.uri.as_deref().and_then(|u| u.parse().ok()) {
            return Some(uri);
        }
        match (&self.did, &self.collection, &self.rkey) {
            (Some(did), Some(collection), Some(rkey)) => {
                Some(RecordRef::new(did.as_str(), collection.as_str(), rkey.as_str()))
            }
            _ => None,
        }
    }

    pub fn author(&self) -> Option<Did> {
        self.did
            .clone()
            .or_else(|| self.record_ref().map(|uri| uri.owner))
    }
}

#[derive(Debug, Clone, Default)]
pub struct BacklinkPage {
    pub records: Vec<BacklinkRecord>,
    pub cursor: Option<String>,
}

#[async_trait]
pub trait BacklinkIndex: Send + Sync {
    /// Records whose field at `source` (`collection:json.path`) equals `subject`.
    async fn get_backlinks(
        &self,
        subject: &str,
        source: &str,
        cursor: Option<&str>,
    ) -> Result<BacklinkPage>;
}

pub fn source_path(collection: &str, path: &str) -> String {
    format!("{}:{}", collection, path)
}

/// Follow the cursor until exhausted. Index failures end the walk with what was collected.
pub async fn collect_backlinks(
    index: &dyn BacklinkIndex,
    subject: &str,
    source: &str,
) -> Vec<BacklinkRecord> {
    let mut records = Vec::new();
    let mut cursor: Option<String> = None;

    loop {
        let page = match index.get_backlinks(subject, source, cursor.as_deref()).await {
            Ok(page) => page,
            Err(e) => {
                warn!(subject, source, error = %e, "Backlink lookup degraded");
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

    records
}

/// Distinct authors of the given links, in first-seen order.
pub fn distinct_authors(records: &[BacklinkRecord]) -> Vec<Did> {
    let mut seen = HashSet::new();
    records
        .iter()
        .filter_map(BacklinkRecord::author)
        .filter(|did| seen.insert(did.clone()))
        .collect()
}

#[derive(Debug, Deserialize)]
struct LinkTarget {
    did: Did,
    collection: String,
    rkey: String,
}

/// Constellation answers with one of several shapes depending on the deployment.
#[derive(Debug, Deserialize)]
struct RawBacklinkResponse {
    #[serde(default)]
    records: Option<Vec<BacklinkRecord>>,
    #[serde(default)]
    frames: Option<Vec<BacklinkRecord>>,
    #[serde(default)]
    linking_records: Option<Vec<LinkTarget>>,
    #[serde(default)]
    links: Option<Vec<LinkTarget>>,
    #[serde(default)]
    cursor: Option<String>,
}

impl From<RawBacklinkResponse> for BacklinkPage {
    fn from(raw: RawBacklinkResponse) -> Self {
        let records = raw
            .records
            .or(raw.frames)
            .unwrap_or_else(|| {
                raw.linking_records
                    .or(raw.links)
                    .unwrap_or_default()
                    .into_iter()
                    .map(|link| BacklinkRecord {
                        did: Some(link.did),
                        collection: Some(link.collection),
                        rkey: Some(link.rkey),
                        ..Default::default()
                    })
                    .collect()
            });

        BacklinkPage {
            records,
            cursor: raw.cursor.filter(|c| !c.is_empty()),
        }
    }
}

pub struct ConstellationClient {
    endpoint: String,
    client: Client,
    page_limit: u32,
}

impl ConstellationClient {
    pub fn new(endpoint: String) -> Self {
        Self::with_client(endpoint, Client::new())
    }

    pub fn with_client(endpoint: String, client: Client) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client,
            page_limit: 100,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl BacklinkIndex for ConstellationClient {
    async fn get_backlinks(
        &self,
        subject: &str,
        source: &str,
        cursor: Option<&str>,
    ) -> Result<BacklinkPage> {
        let mut query = vec![
            ("subject", subject.to_string()),
            ("source", source.to_string()),
            ("limit", self.page_limit.to_string()),
        ];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor.to_string()));
        }

        let response = self
            .client
            .get(&format!("{}/xrpc/blue.microcosm.links.getBacklinks", self.endpoint))
            .query(&query)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ExchangeError::Backlinks(format!(
                "getBacklinks {} ({}) returned {}",
                subject,
                source,
                response.status()
            )));
        }

        let raw: RawBacklinkResponse = response.json().await?;
        Ok(raw.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_response_shapes() {
        let records: RawBacklinkResponse = serde_json::from_value(json!({
            "records": [{ "did": "did:plc:a", "collection": "c", "rkey": "1", "value": { "x": 1 } }],
            "cursor": "abc"
        }))
        .unwrap();
        let page: BacklinkPage = records.into();
        assert_eq!(page.records.len(), 1);
        assert!(page.records[0].value.is_some());
        assert_eq!(page.cursor.as_deref(), Some("abc"));

        let links: RawBacklinkResponse = serde_json::from_value(json!({
            "linking_records": [{ "did": "did:plc:b", "collection": "c", "rkey": "2" }],
            "cursor": ""
        }))
        .unwrap();
        let page: BacklinkPage = links.into();
        assert_eq!(page.records[0].record_ref().unwrap().to_string(), "at://did:plc:b/c/2");
        assert!(page.cursor.is_none());
    }

    #[test]
    fn test_distinct_authors() {
        let link = |did: &str| BacklinkRecord {
            did: Some(did.to_string()),
            ..Default::default()
        };
        let uri_only = BacklinkRecord {
            uri: Some("at://did:plc:c/blue.atsumeat.config/self".to_string()),
            ..Default::default()
        };

        let authors = distinct_authors(&[link("did:plc:a"), link("did:plc:b"), link("did:plc:a"), uri_only]);
        assert_eq!(authors, vec!["did:plc:a", "did:plc:b", "did:plc:c"]);
    }
}
