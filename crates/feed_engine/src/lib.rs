//! Optimistic mutations and cursor pagination over a cached transaction feed.
//!
//! A [`FeedEngine`] keeps one set of pages per [`Fingerprint`] (entity plus
//! filters). Creates and deletes patch every affected page before the server
//! answers and roll back atomically on failure; committed mutations schedule
//! an authoritative refetch once the settle window has passed.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use feed_engine::{FeedConfig, FeedEngine, FeedFilter, Fingerprint, RemoteFeed};
//!
//! # fn demo(remote: Arc<dyn RemoteFeed>) -> Result<(), feed_engine::FeedError> {
//! let engine = FeedEngine::builder()
//!     .remote(remote)
//!     .config(FeedConfig::default())
//!     .build()?;
//! let view = engine.observe(&Fingerprint::transactions(FeedFilter::all()));
//! println!("{} rows", view.total);
//! # Ok(())
//! # }
//! ```

pub use config::FeedConfig;
pub use engine::{FeedEngine, FeedEngineBuilder, FeedEvent, FeedView};
pub use error::FeedError;
pub use fingerprint::{EntityType, FeedFilter, Fingerprint};
pub use invalidation::{InvalidationBus, InvalidationSignal};
pub use model::{
    Classification, NewTransaction, SyncState, TempId, TempIdGenerator, Transaction,
    TransactionPatch, TxId,
};
pub use money::Money;
pub use mutation::{
    Mutation, MutationKind, MutationOutcome, MutationStatus, PendingMutation,
};
pub use pager::FetchOutcome;
pub use reconcile::{ReconciliationScheduler, ScheduledTask};
pub use remote::{FeedQuery, RemoteError, RemoteFeed, RemotePage};
pub use store::{CacheStore, CachedFeed, FeedSnapshot, Page};

mod config;
mod engine;
mod error;
mod fingerprint;
mod invalidation;
mod model;
mod money;
mod mutation;
mod pager;
mod reconcile;
pub mod remote;
mod store;
