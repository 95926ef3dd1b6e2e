//! The server as the engine consumes it.
//!
//! Transport, authentication and token refresh live behind [`RemoteFeed`];
//! the engine only sees pages, authoritative entities and [`RemoteError`]s.

use async_trait::async_trait;
use thiserror::Error;

use crate::{FeedFilter, NewTransaction, Transaction, TransactionPatch};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("server error: {0}")]
    Server(String),
    #[error("transport error: {0}")]
    Transport(String),
}

/// One request against the remote feed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FeedQuery {
    pub filter: FeedFilter,
    /// `None` requests the first page.
    pub cursor: Option<String>,
    pub limit: u32,
}

/// One page as returned by the server, newest first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemotePage {
    pub items: Vec<Transaction>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
    pub total: Option<u64>,
}

#[async_trait]
pub trait RemoteFeed: Send + Sync {
    async fn list(&self, query: FeedQuery) -> Result<RemotePage, RemoteError>;

    /// Returns the authoritative entity with its server-assigned id.
    async fn create(
        &self,
        entity: NewTransaction,
        idempotency_key: String,
    ) -> Result<Transaction, RemoteError>;

    async fn update(&self, id: &str, patch: TransactionPatch) -> Result<Transaction, RemoteError>;

    async fn delete(&self, id: &str) -> Result<(), RemoteError>;

    async fn get(&self, id: &str) -> Result<Transaction, RemoteError>;
}
