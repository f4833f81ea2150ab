//! # sticker-swap
//!
//! Sealed item barter between independently hosted personal repositories.
//!
//! ## Architecture
//!
//! - **Seals**: Ed25519 provenance envelopes binding an item copy to its holder (`seal`, `keys`)
//! - **Exchange**: offer → accept/reject → reconcile, as independent per-party records (`exchange`)
//! - **Matcher**: anonymous partner search among registry members (`matcher`)
//! - **Discovery**: open offers addressed to us, found through a backlink index (`discovery`)
//! - **Collection**: self-minting, verified listings, likes and purge (`collection`)
//! - **Registry**: hub membership through pointer records (`registry`)
//! - **Collaborators**: repository hosts, backlink index and identity directory behind traits,
//!   with HTTP implementations and a shared in-memory network for tests

pub mod backlinks;
pub mod cache;
pub mod collection;
pub mod config;
pub mod context;
pub mod directory;
pub mod discovery;
pub mod error;
pub mod exchange;
pub mod keys;
pub mod matcher;
pub mod memory;
pub mod model;
pub mod registry;
pub mod repository;
pub mod seal;

pub use collection::{CollectionItem, CollectionService, CollectionView, LikeState};
pub use config::AppConfig;
pub use context::{ExchangeContext, ExchangeSettings, Session};
pub use discovery::{IncomingOffer, OfferDiscovery};
pub use error::{ExchangeError, Result};
pub use exchange::{AcceptOutcome, ExchangeService, InverseOutcome, ResolveProgress, ResolveSummary};
pub use matcher::{ExchangeMatcher, MatchCandidate, MatcherSettings};
pub use memory::MemoryNetwork;
pub use model::{Item, RecordRef, Transaction, TransactionStatus};
pub use registry::Registry;
pub use seal::{LocalSigningAuthority, SealEngine, SealVerification, SigningAuthority};

/// Decentralized identifier of a party, e.g. `did:plc:…`.
pub type Did = String;
