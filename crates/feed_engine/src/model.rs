//! Transaction primitives as the feed sees them.
//!
//! A row is identified by exactly one [`TxId`]: the server id once the
//! transaction is authoritative, or a locally generated [`TempId`] while it
//! only exists on this device.

use std::{
    fmt,
    str::FromStr,
    sync::atomic::{AtomicU64, Ordering},
};

use chrono::{NaiveDate, Utc};

use crate::{FeedError, Money};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Classification {
    Expense,
    Income,
}

impl Classification {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Expense => "expense",
            Self::Income => "income",
        }
    }
}

impl TryFrom<&str> for Classification {
    type Error = FeedError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "expense" => Ok(Self::Expense),
            "income" => Ok(Self::Income),
            other => Err(FeedError::Validation(format!(
                "invalid classification: {other}"
            ))),
        }
    }
}

/// Locally generated id of a transaction the server has not returned yet.
///
/// Built from the generator's start timestamp plus a monotonic counter, so
/// ids never collide across sessions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TempId {
    epoch_ms: i64,
    seq: u64,
}

impl fmt::Display for TempId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tmp-{}-{}", self.epoch_ms, self.seq)
    }
}

impl FromStr for TempId {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || FeedError::Validation(format!("invalid temporary id: {s}"));
        let rest = s.strip_prefix("tmp-").ok_or_else(invalid)?;
        let (epoch, seq) = rest.split_once('-').ok_or_else(invalid)?;
        Ok(Self {
            epoch_ms: epoch.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

#[derive(Debug)]
pub struct TempIdGenerator {
    epoch_ms: i64,
    next: AtomicU64,
}

impl TempIdGenerator {
    pub fn new() -> Self {
        Self {
            epoch_ms: Utc::now().timestamp_millis(),
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> TempId {
        TempId {
            epoch_ms: self.epoch_ms,
            seq: self.next.fetch_add(1, Ordering::Relaxed),
        }
    }
}

impl Default for TempIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TxId {
    Server(String),
    Temp(TempId),
}

impl TxId {
    pub fn as_server(&self) -> Option<&str> {
        match self {
            Self::Server(id) => Some(id),
            Self::Temp(_) => None,
        }
    }

    pub fn as_temp(&self) -> Option<TempId> {
        match self {
            Self::Server(_) => None,
            Self::Temp(temp) => Some(*temp),
        }
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server(id) => f.write_str(id),
            Self::Temp(temp) => temp.fmt(f),
        }
    }
}

impl FromStr for TxId {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(FeedError::Validation("empty id".to_string()));
        }
        if s.starts_with("tmp-") {
            return s.parse().map(Self::Temp);
        }
        Ok(Self::Server(s.to_string()))
    }
}

impl From<TempId> for TxId {
    fn from(value: TempId) -> Self {
        Self::Temp(value)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    /// The create is still in flight.
    Provisional,
    /// The server has acknowledged the row. A confirmed row may still show its
    /// temporary id until a refetch observes the authoritative copy.
    Confirmed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub id: TxId,
    pub sync: SyncState,
    pub classification: Classification,
    pub amount: Money,
    pub category: Option<String>,
    pub occurred_on: NaiveDate,
    pub description: Option<String>,
    pub note: Option<String>,
}

impl Transaction {
    pub(crate) fn provisional(temp: TempId, new: &NewTransaction) -> Self {
        Self {
            id: TxId::Temp(temp),
            sync: SyncState::Provisional,
            classification: new.classification,
            amount: new.amount,
            category: new.category.clone(),
            occurred_on: new.occurred_on,
            description: new.description.clone(),
            note: new.note.clone(),
        }
    }

    pub fn is_provisional(&self) -> bool {
        self.sync == SyncState::Provisional
    }
}

/// Payload of a create; the server assigns the id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewTransaction {
    pub classification: Classification,
    pub amount: Money,
    pub category: Option<String>,
    pub occurred_on: NaiveDate,
    pub description: Option<String>,
    pub note: Option<String>,
}

impl NewTransaction {
    pub fn new(classification: Classification, amount: Money, occurred_on: NaiveDate) -> Self {
        Self {
            classification,
            amount,
            category: None,
            occurred_on,
            description: None,
            note: None,
        }
    }

    pub fn validate(&self) -> Result<(), FeedError> {
        if !self.amount.is_positive() {
            return Err(FeedError::Validation("amount must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Partial update; `None` fields are left untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransactionPatch {
    pub classification: Option<Classification>,
    pub amount: Option<Money>,
    pub category: Option<String>,
    pub occurred_on: Option<NaiveDate>,
    pub description: Option<String>,
    pub note: Option<String>,
}

impl TransactionPatch {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn validate(&self) -> Result<(), FeedError> {
        if self.is_empty() {
            return Err(FeedError::Validation("nothing to update".to_string()));
        }
        if self.amount.is_some_and(|amount| !amount.is_positive()) {
            return Err(FeedError::Validation("amount must be > 0".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_ids_are_monotonic_and_round_trip_through_display() {
        let ids = TempIdGenerator::new();
        let first = ids.next_id();
        let second = ids.next_id();
        assert!(first < second);

        let parsed: TxId = second.to_string().parse().unwrap();
        assert_eq!(parsed, TxId::Temp(second));
    }

    #[test]
    fn plain_ids_parse_as_server_ids() {
        assert_eq!("tx_1".parse::<TxId>().unwrap(), TxId::Server("tx_1".into()));
        assert!("tmp-abc".parse::<TxId>().is_err());
    }

    #[test]
    fn new_transaction_requires_positive_amount() {
        let day = NaiveDate::from_ymd_opt(2026, 1, 5).unwrap();
        let zero = NewTransaction::new(Classification::Expense, Money::ZERO, day);
        assert!(matches!(zero.validate(), Err(FeedError::Validation(_))));
        let ok = NewTransaction::new(Classification::Expense, Money::new(500), day);
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn empty_patch_is_rejected() {
        assert!(TransactionPatch::default().validate().is_err());
    }
}
