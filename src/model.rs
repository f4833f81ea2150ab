use crate::{
    error::{ExchangeError, Result},
    seal::SealEnvelope,
    Did,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

pub const STICKER_COLLECTION: &str = "blue.atsumeat.sticker";
pub const TRANSACTION_COLLECTION: &str = "blue.atsumeat.transaction";
pub const CONFIG_COLLECTION: &str = "blue.atsumeat.config";
pub const STICKER_LIKE_COLLECTION: &str = "blue.atsumeat.stickerLike";
pub const PROFILE_COLLECTION: &str = "app.bsky.actor.profile";
pub const POST_COLLECTION: &str = "app.bsky.feed.post";

/// Hashtag carried by offer announcements.
pub const ANNOUNCEMENT_TAG: &str = "AtsumeAt";

/// Model name of the item every party mints for itself on initialization.
pub const DEFAULT_MODEL: &str = "default";

/// Current shape of stored item records. Version 0 carried a single `owner` field.
pub const ITEM_SCHEMA_VERSION: u32 = 1;

/// Stable three-part record path: `at://{owner}/{collection}/{rkey}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RecordRef {
    pub owner: Did,
    pub collection: String,
    pub rkey: String,
}

impl RecordRef {
    pub fn new(owner: impl Into<String>, collection: impl Into<String>, rkey: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            collection: collection.into(),
            rkey: rkey.into(),
        }
    }

    /// Canonical reference of a party, used as the backlink anchor for offers and the registry.
    pub fn profile(did: &str) -> Self {
        Self::new(did, PROFILE_COLLECTION, "self")
    }

    pub fn is_in(&self, collection: &str) -> bool {
        self.collection == collection
    }
}

impl fmt::Display for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "at://{}/{}/{}", self.owner, self.collection, self.rkey)
    }
}

impl FromStr for RecordRef {
    type Err = ExchangeError;

    fn from_str(s: &str) -> Result<Self> {
        let path = s
            .strip_prefix("at://")
            .ok_or_else(|| ExchangeError::InvalidInput(format!("Not a record reference: {}", s)))?;

        let parts: Vec<&str> = path.split('/').collect();
        match parts.as_slice() {
            [owner, collection, rkey]
                if !owner.is_empty() && !collection.is_empty() && !rkey.is_empty() =>
            {
                Ok(Self::new(*owner, *collection, *rkey))
            }
            _ => Err(ExchangeError::InvalidInput(format!(
                "Record reference must have owner, collection and key: {}",
                s
            ))),
        }
    }
}

impl TryFrom<String> for RecordRef {
    type Error = ExchangeError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<RecordRef> for String {
    fn from(value: RecordRef) -> Self {
        value.to_string()
    }
}

/// Reference plus content hash of the referenced record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StrongRef {
    pub uri: RecordRef,
    pub cid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CidLink {
    #[serde(rename = "$link")]
    pub link: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobRef {
    #[serde(rename = "$type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(rename = "ref")]
    pub reference: CidLink,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ImageRef {
    Url(String),
    Blob(BlobRef),
}

impl ImageRef {
    /// Fetchable URL for this image. Blobs are served by the CDN under the DID that uploaded them.
    pub fn to_url(&self, cdn_base: &str, blob_owner: &str) -> String {
        match self {
            ImageRef::Url(url) => url.clone(),
            ImageRef::Blob(blob) => format!(
                "{}/{}/{}@jpeg",
                cdn_base.trim_end_matches('/'),
                blob_owner,
                blob.reference.link
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageType {
    Avatar,
    Custom,
}

/// Logical identity of an item. Every physical copy of the same item shares it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ItemIdentity {
    pub subject: Did,
    pub original_owner: Did,
    pub model: String,
    pub shape: Option<String>,
}

fn sticker_type() -> String {
    STICKER_COLLECTION.to_string()
}

fn transaction_type() -> String {
    TRANSACTION_COLLECTION.to_string()
}

fn config_type() -> String {
    CONFIG_COLLECTION.to_string()
}

fn like_type() -> String {
    STICKER_LIKE_COLLECTION.to_string()
}

fn post_type() -> String {
    POST_COLLECTION.to_string()
}

fn external_embed_type() -> String {
    "app.bsky.embed.external".to_string()
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    #[serde(rename = "$type", default = "sticker_type")]
    pub record_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_type: Option<ImageType>,
    pub subject_did: Did,
    pub original_owner: Did,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obtained_from: Option<Did>,
    pub obtained_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signed_payload: Option<String>,
}

impl Item {
    /// The item a party mints of itself when its collection is initialized.
    pub fn self_minted(did: &str, avatar: Option<String>, seal: SealEnvelope) -> Self {
        Self {
            record_type: sticker_type(),
            name: None,
            image: avatar.map(ImageRef::Url),
            image_type: Some(ImageType::Avatar),
            subject_did: did.to_string(),
            original_owner: did.to_string(),
            model: default_model(),
            shape: None,
            description: None,
            message: None,
            obtained_from: None,
            obtained_at: Utc::now(),
            signature: Some(seal.signature),
            signed_payload: Some(seal.signed_payload),
        }
    }

    /// A new local copy of `source`, received from `giver` and sealed for the new holder.
    pub fn received_copy(
        source: &Item,
        giver: &str,
        image_url: Option<String>,
        message: Option<String>,
        seal: SealEnvelope,
    ) -> Self {
        Self {
            record_type: sticker_type(),
            name: source.name.clone(),
            image: image_url.map(ImageRef::Url),
            image_type: Some(source.image_type.unwrap_or(ImageType::Avatar)),
            subject_did: source.subject_did.clone(),
            original_owner: source.original_owner.clone(),
            model: source.model.clone(),
            shape: source.shape.clone(),
            description: source.description.clone(),
            message,
            obtained_from: Some(giver.to_string()),
            obtained_at: Utc::now(),
            signature: Some(seal.signature),
            signed_payload: Some(seal.signed_payload),
        }
    }

    pub fn identity(&self) -> ItemIdentity {
        ItemIdentity {
            subject: self.subject_did.clone(),
            original_owner: self.original_owner.clone(),
            model: self.model.clone(),
            shape: self.shape.clone(),
        }
    }

    /// Image as a fetchable URL; blobs resolve under the original owner.
    pub fn image_url(&self, cdn_base: &str) -> Option<String> {
        self.image
            .as_ref()
            .map(|image| image.to_url(cdn_base, &self.original_owner))
    }

    pub fn seal(&self) -> Option<SealEnvelope> {
        match (&self.signed_payload, &self.signature) {
            (Some(signed_payload), Some(signature)) => Some(SealEnvelope {
                signed_payload: signed_payload.clone(),
                signature: signature.clone(),
                issuer: None,
            }),
            _ => None,
        }
    }
}

/// Decode a stored item record, migrating older record shapes to the current one.
pub fn decode_item(mut value: Value) -> Result<Item> {
    if item_schema_version(&value) < ITEM_SCHEMA_VERSION {
        migrate_item_v0(&mut value)?;
    }
    Ok(serde_json::from_value(value)?)
}

fn item_schema_version(value: &Value) -> u32 {
    if value.get("subjectDid").is_some() && value.get("originalOwner").is_some() {
        1
    } else {
        0
    }
}

fn migrate_item_v0(value: &mut Value) -> Result<()> {
    let record = value
        .as_object_mut()
        .ok_or_else(|| ExchangeError::Serialization("Item record is not an object".to_string()))?;

    let owner = record
        .remove("owner")
        .and_then(|v| v.as_str().map(str::to_string));
    let subject = record
        .get("subjectDid")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| owner.clone())
        .ok_or_else(|| ExchangeError::Serialization("Item record has no owner".to_string()))?;

    if !record.contains_key("originalOwner") {
        let original = owner.unwrap_or_else(|| subject.clone());
        record.insert("originalOwner".to_string(), Value::String(original));
    }
    record.insert("subjectDid".to_string(), Value::String(subject));
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Offered,
    Completed,
    Rejected,
}

impl TransactionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Offered)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    #[serde(rename = "$type", default = "transaction_type")]
    pub record_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partner: Option<Did>,
    #[serde(default)]
    pub is_easy_exchange: bool,
    #[serde(default)]
    pub sticker_in: Vec<RecordRef>,
    #[serde(default)]
    pub sticker_out: Vec<RecordRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub status: TransactionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_partner: Option<RecordRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_transaction: Option<RecordRef>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Transaction {
    pub fn offer(
        partner: Option<Did>,
        items: Vec<RecordRef>,
        message: Option<String>,
        easy_exchange: bool,
    ) -> Self {
        Self {
            record_type: transaction_type(),
            ref_partner: partner.as_deref().map(RecordRef::profile),
            partner,
            is_easy_exchange: easy_exchange,
            sticker_in: vec![],
            sticker_out: items,
            message,
            status: TransactionStatus::Offered,
            ref_transaction: None,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    /// The accepting side's record of a completed barter.
    pub fn completion(
        partner: &str,
        offer: &RecordRef,
        received: Vec<RecordRef>,
        given: Vec<RecordRef>,
        message: Option<String>,
    ) -> Self {
        Self {
            record_type: transaction_type(),
            partner: Some(partner.to_string()),
            is_easy_exchange: false,
            sticker_in: received,
            sticker_out: given,
            message,
            status: TransactionStatus::Completed,
            ref_partner: None,
            ref_transaction: Some(offer.clone()),
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    pub fn rejection(partner: &str, offer: &RecordRef) -> Self {
        Self {
            record_type: transaction_type(),
            partner: Some(partner.to_string()),
            is_easy_exchange: false,
            sticker_in: vec![],
            sticker_out: vec![],
            message: None,
            status: TransactionStatus::Rejected,
            ref_partner: None,
            ref_transaction: Some(offer.clone()),
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    /// Whether `did` may accept or reject this record as an offer.
    pub fn is_acceptable_by(&self, did: &str) -> bool {
        self.status == TransactionStatus::Offered
            && match &self.partner {
                Some(partner) => partner == did,
                None => self.is_easy_exchange,
            }
    }

    pub fn is_open_anonymous(&self) -> bool {
        self.status == TransactionStatus::Offered
            && self.is_easy_exchange
            && self.partner.is_none()
            && !self.sticker_out.is_empty()
    }

    /// Whether this record is a terminal answer to `offer` written for `offerer`.
    pub fn answers(&self, offer: &RecordRef, offerer: &str) -> bool {
        self.status.is_terminal()
            && self.ref_transaction.as_ref() == Some(offer)
            && self.partner.as_deref().map_or(true, |partner| partner == offerer)
    }

    pub fn mark_completed(&mut self, partner: &str, received: Vec<RecordRef>) -> Result<()> {
        self.ensure_open()?;
        self.partner.get_or_insert_with(|| partner.to_string());
        self.sticker_in = received;
        self.status = TransactionStatus::Completed;
        self.updated_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_rejected(&mut self, partner: &str) -> Result<()> {
        self.ensure_open()?;
        self.partner.get_or_insert_with(|| partner.to_string());
        self.status = TransactionStatus::Rejected;
        self.updated_at = Some(Utc::now());
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.status != TransactionStatus::Offered {
            return Err(ExchangeError::Validation(format!(
                "Transaction is already {:?}",
                self.status
            )));
        }
        Ok(())
    }
}

/// Decode a stored transaction record. Early records used an empty partner string for
/// "no partner" and placeholder entries in the item lists; both are normalized away.
pub fn decode_transaction(mut value: Value) -> Result<Transaction> {
    if let Some(record) = value.as_object_mut() {
        if record.get("partner").and_then(Value::as_str) == Some("") {
            record.remove("partner");
        }
        for field in ["stickerIn", "stickerOut"] {
            if let Some(Value::Array(entries)) = record.get_mut(field) {
                entries.retain(|entry| {
                    entry
                        .as_str()
                        .map_or(false, |s| s.parse::<RecordRef>().is_ok())
                });
            }
        }
    }
    Ok(serde_json::from_value(value)?)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Like {
    #[serde(rename = "$type", default = "like_type")]
    pub record_type: String,
    pub subject: StrongRef,
    pub created_at: DateTime<Utc>,
}

impl Like {
    pub fn new(subject: StrongRef) -> Self {
        Self {
            record_type: like_type(),
            subject,
            created_at: Utc::now(),
        }
    }
}

/// Pointer record declaring membership in a registry. Its presence also marks an
/// initialized collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryPointer {
    #[serde(rename = "$type", default = "config_type")]
    pub record_type: String,
    pub hub_ref: RecordRef,
}

impl RegistryPointer {
    pub fn new(hub_did: &str) -> Self {
        Self {
            record_type: config_type(),
            hub_ref: RecordRef::profile(hub_did),
        }
    }
}

/// Public post announcing a direct offer, mentioning the partner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnouncementPost {
    #[serde(rename = "$type", default = "post_type")]
    pub record_type: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub facets: Vec<Facet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embed: Option<ExternalEmbed>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Facet {
    pub index: ByteSlice,
    pub features: Vec<FacetFeature>,
}

/// UTF-8 byte range of the annotated text, end exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ByteSlice {
    pub byte_start: usize,
    pub byte_end: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "$type")]
pub enum FacetFeature {
    #[serde(rename = "app.bsky.richtext.facet#mention")]
    Mention { did: Did },
    #[serde(rename = "app.bsky.richtext.facet#tag")]
    Tag { tag: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalEmbed {
    #[serde(rename = "$type", default = "external_embed_type")]
    pub record_type: String,
    pub external: ExternalLink,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalLink {
    pub uri: String,
    pub title: String,
    pub description: String,
}

impl AnnouncementPost {
    /// `Let's exchange stickers @handle! offering N stickers 🍬 #AtsumeAt`, with facets for
    /// the mention and the tag. With an app origin the post links to the offerer's exchange page.
    pub fn offer(offerer: &str, partner: &str, partner_handle: &str, item_count: usize, app_origin: Option<&str>) -> Self {
        let lead = "Let's exchange stickers ";
        let mention = format!("@{}", partner_handle);
        let tag = format!("#{}", ANNOUNCEMENT_TAG);
        let text = format!(
            "{}{}! offering {} sticker{} \u{1F36C} {}",
            lead,
            mention,
            item_count,
            if item_count > 1 { "s" } else { "" },
            tag
        );

        let facets = vec![
            Facet {
                index: ByteSlice {
                    byte_start: lead.len(),
                    byte_end: lead.len() + mention.len(),
                },
                features: vec![FacetFeature::Mention {
                    did: partner.to_string(),
                }],
            },
            Facet {
                index: ByteSlice {
                    byte_start: text.len() - tag.len(),
                    byte_end: text.len(),
                },
                features: vec![FacetFeature::Tag {
                    tag: ANNOUNCEMENT_TAG.to_string(),
                }],
            },
        ];

        let embed = app_origin.map(|origin| ExternalEmbed {
            record_type: external_embed_type(),
            external: ExternalLink {
                uri: format!("{}/exchange?user={}", origin.trim_end_matches('/'), offerer),
                title: "Exchange Stickers".to_string(),
                description: "Click to accept the sticker exchange!".to_string(),
            },
        });

        Self {
            record_type: post_type(),
            text,
            facets,
            embed,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_ref_parsing() {
        let uri: RecordRef = "at://did:plc:alice/blue.atsumeat.sticker/3k2a".parse().unwrap();
        assert_eq!(uri.owner, "did:plc:alice");
        assert_eq!(uri.collection, STICKER_COLLECTION);
        assert_eq!(uri.rkey, "3k2a");
        assert_eq!(uri.to_string(), "at://did:plc:alice/blue.atsumeat.sticker/3k2a");

        assert!("did:plc:alice/blue.atsumeat.sticker/3k2a".parse::<RecordRef>().is_err());
        assert!("at://did:plc:alice/blue.atsumeat.sticker".parse::<RecordRef>().is_err());
        assert!("at://did:plc:alice//3k2a".parse::<RecordRef>().is_err());
    }

    #[test]
    fn test_legacy_item_migration() {
        let legacy = json!({
            "$type": STICKER_COLLECTION,
            "owner": "did:plc:bob",
            "model": "default",
            "obtainedAt": "2024-11-02T10:00:00Z"
        });

        let item = decode_item(legacy).unwrap();
        assert_eq!(item.subject_did, "did:plc:bob");
        assert_eq!(item.original_owner, "did:plc:bob");
        assert!(item.seal().is_none());
    }

    #[test]
    fn test_current_item_is_not_migrated() {
        let current = json!({
            "subjectDid": "did:plc:bob",
            "originalOwner": "did:plc:carol",
            "owner": "did:plc:ignored",
            "model": "cat",
            "obtainedAt": "2024-11-02T10:00:00Z"
        });

        let item = decode_item(current).unwrap();
        assert_eq!(item.original_owner, "did:plc:carol");
        assert_eq!(item.model, "cat");
    }

    #[test]
    fn test_blob_image_resolves_under_original_owner() {
        let value = json!({
            "subjectDid": "did:plc:bob",
            "originalOwner": "did:plc:carol",
            "model": "cat",
            "obtainedAt": "2024-11-02T10:00:00Z",
            "image": { "$type": "blob", "ref": { "$link": "bafkreiabc" }, "mimeType": "image/png", "size": 1024 }
        });

        let item = decode_item(value).unwrap();
        assert_eq!(
            item.image_url("https://cdn.example/img/"),
            Some("https://cdn.example/img/did:plc:carol/bafkreiabc@jpeg".to_string())
        );
    }

    #[test]
    fn test_transaction_eligibility() {
        let item: RecordRef = "at://did:plc:alice/blue.atsumeat.sticker/1".parse().unwrap();

        let direct = Transaction::offer(Some("did:plc:bob".into()), vec![item.clone()], None, false);
        assert!(direct.is_acceptable_by("did:plc:bob"));
        assert!(!direct.is_acceptable_by("did:plc:carol"));
        assert_eq!(direct.ref_partner, Some(RecordRef::profile("did:plc:bob")));

        let anonymous = Transaction::offer(None, vec![item], None, true);
        assert!(anonymous.is_acceptable_by("did:plc:carol"));
        assert!(anonymous.is_open_anonymous());
        assert!(anonymous.ref_partner.is_none());
    }

    #[test]
    fn test_terminal_transactions_cannot_transition() {
        let offer_ref: RecordRef = "at://did:plc:alice/blue.atsumeat.transaction/1".parse().unwrap();
        let mut offer = Transaction::offer(None, vec![], None, true);

        offer.mark_completed("did:plc:bob", vec![]).unwrap();
        assert_eq!(offer.partner.as_deref(), Some("did:plc:bob"));
        assert!(offer.mark_rejected("did:plc:bob").is_err());

        let rejection = Transaction::rejection("did:plc:alice", &offer_ref);
        assert!(rejection.answers(&offer_ref, "did:plc:alice"));
        assert!(!rejection.answers(&offer_ref, "did:plc:mallory"));
    }

    #[test]
    fn test_legacy_transaction_placeholders_are_dropped() {
        let value = json!({
            "partner": "",
            "stickerIn": ["pending"],
            "stickerOut": ["pending", "at://did:plc:alice/blue.atsumeat.sticker/1"],
            "status": "completed",
            "createdAt": "2024-11-02T10:00:00Z"
        });

        let tx = decode_transaction(value).unwrap();
        assert!(tx.partner.is_none());
        assert!(tx.sticker_in.is_empty());
        assert_eq!(tx.sticker_out.len(), 1);
    }

    #[test]
    fn test_announcement_facets_cover_mention_and_tag() {
        let post = AnnouncementPost::offer("did:plc:alice", "did:plc:bob", "bob.test", 2, Some("https://app.example/"));
        assert_eq!(post.text, "Let's exchange stickers @bob.test! offering 2 stickers \u{1F36C} #AtsumeAt");

        let mention = post.facets[0].index;
        assert_eq!(&post.text[mention.byte_start..mention.byte_end], "@bob.test");
        assert_eq!(
            post.facets[0].features,
            vec![FacetFeature::Mention { did: "did:plc:bob".to_string() }]
        );

        let tag = post.facets[1].index;
        assert_eq!(&post.text[tag.byte_start..tag.byte_end], "#AtsumeAt");

        let value = serde_json::to_value(&post).unwrap();
        assert_eq!(value["$type"], POST_COLLECTION);
        assert_eq!(value["facets"][0]["features"][0]["$type"], "app.bsky.richtext.facet#mention");
        assert_eq!(value["embed"]["external"]["uri"], "https://app.example/exchange?user=did:plc:alice");

        let single = AnnouncementPost::offer("did:plc:alice", "did:plc:bob", "bob.test", 1, None);
        assert!(single.text.contains("offering 1 sticker \u{1F36C}"));
        assert!(single.embed.is_none());
    }
}
