use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Error body returned by the server on non-2xx responses.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub mod session {
    use super::*;

    #[derive(Debug, Serialize, Deserialize)]
    pub struct SessionRefresh {
        pub refresh_token: String,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct SessionTokens {
        pub access_token: String,
        pub refresh_token: String,
    }
}

pub mod transaction {
    use super::*;

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum Classification {
        Expense,
        Income,
    }

    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TransactionView {
        pub id: String,
        pub classification: Classification,
        /// Always > 0; the classification carries the direction.
        pub amount_minor: i64,
        pub category: Option<String>,
        pub occurred_on: NaiveDate,
        pub description: Option<String>,
        pub note: Option<String>,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct TransactionNew {
        pub classification: Classification,
        pub amount_minor: i64,
        pub category: Option<String>,
        pub occurred_on: NaiveDate,
        pub description: Option<String>,
        pub note: Option<String>,
        /// Optional idempotency key for safely retrying the same create request.
        pub idempotency_key: Option<String>,
    }

    /// Partial update: absent fields are left untouched by the server.
    #[derive(Debug, Default, Serialize, Deserialize)]
    pub struct TransactionUpdate {
        #[serde(skip_serializing_if = "Option::is_none")]
        pub classification: Option<Classification>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub amount_minor: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub category: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub occurred_on: Option<NaiveDate>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub description: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub note: Option<String>,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct TransactionDeleted {
        pub deleted: bool,
    }
}

pub mod feed {
    use super::transaction::{Classification, TransactionView};
    use super::*;

    #[derive(Debug, Default, Serialize, Deserialize)]
    pub struct FeedList {
        /// Inclusive lower bound.
        pub from: Option<NaiveDate>,
        /// Inclusive upper bound.
        pub to: Option<NaiveDate>,
        pub classification: Option<Classification>,
        pub search: Option<String>,
        /// Opaque pagination cursor, from `next_cursor`. Omitted for the first page.
        ///
        /// Newest → older pagination.
        #[serde(skip_serializing_if = "Option::is_none")]
        pub cursor: Option<String>,
        pub limit: Option<u32>,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct FeedListResponse {
        pub items: Vec<TransactionView>,
        /// Opaque cursor for fetching the next page (older items).
        pub next_cursor: Option<String>,
        pub has_more: bool,
        /// Total number of matching items, when the server computes it.
        #[serde(default)]
        pub total: Option<u64>,
    }
}
