//! Feed identity.
//!
//! A [`Fingerprint`] is the canonical key of a cached feed: entity type plus
//! the active filters. Filters are normalised when they are built, so two
//! requests with the same filters always share their cached pages.

use std::fmt;

use chrono::NaiveDate;
use unicode_normalization::{UnicodeNormalization, char::is_combining_mark};

use crate::{Classification, FeedError, Transaction};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntityType {
    Transaction,
}

impl EntityType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transaction => "transactions",
        }
    }
}

/// Filters for a transaction feed.
///
/// `from` and `to` are both inclusive.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct FeedFilter {
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
    classification: Option<Classification>,
    search: Option<String>,
}

impl FeedFilter {
    /// The unfiltered feed (expenses and income together).
    pub fn all() -> Self {
        Self::default()
    }

    pub fn classification(mut self, classification: Classification) -> Self {
        self.classification = Some(classification);
        self
    }

    pub fn since(mut self, from: NaiveDate) -> Self {
        self.from = Some(from);
        self
    }

    pub fn until(mut self, to: NaiveDate) -> Self {
        self.to = Some(to);
        self
    }

    /// Free-text search; blank input clears the search.
    pub fn search(mut self, text: &str) -> Self {
        self.search = normalize_search(text);
        self
    }

    pub fn date_range(&self) -> (Option<NaiveDate>, Option<NaiveDate>) {
        (self.from, self.to)
    }

    pub fn classification_filter(&self) -> Option<Classification> {
        self.classification
    }

    pub fn search_text(&self) -> Option<&str> {
        self.search.as_deref()
    }

    pub fn validate(&self) -> Result<(), FeedError> {
        if let (Some(from), Some(to)) = (self.from, self.to)
            && from > to
        {
            return Err(FeedError::Validation(
                "invalid range: from must be <= to".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether `tx` belongs to a feed with these filters.
    pub fn matches(&self, tx: &Transaction) -> bool {
        if self.from.is_some_and(|from| tx.occurred_on < from) {
            return false;
        }
        if self.to.is_some_and(|to| tx.occurred_on > to) {
            return false;
        }
        if self
            .classification
            .is_some_and(|classification| tx.classification != classification)
        {
            return false;
        }
        let Some(needle) = self.search.as_deref() else {
            return true;
        };
        [&tx.description, &tx.category, &tx.note]
            .into_iter()
            .flatten()
            .filter_map(|text| normalize_search(text))
            .any(|haystack| haystack.contains(needle))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    entity: EntityType,
    filter: FeedFilter,
}

impl Fingerprint {
    pub fn new(entity: EntityType, filter: FeedFilter) -> Self {
        Self { entity, filter }
    }

    pub fn transactions(filter: FeedFilter) -> Self {
        Self::new(EntityType::Transaction, filter)
    }

    pub fn entity(&self) -> EntityType {
        self.entity
    }

    pub fn filter(&self) -> &FeedFilter {
        &self.filter
    }

    pub fn matches(&self, tx: &Transaction) -> bool {
        self.filter.matches(tx)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.entity.as_str())?;
        let mut params = Vec::new();
        if let Some(classification) = self.filter.classification {
            params.push(format!("classification={}", classification.as_str()));
        }
        if let Some(from) = self.filter.from {
            params.push(format!("from={from}"));
        }
        if let Some(search) = &self.filter.search {
            params.push(format!("search={search}"));
        }
        if let Some(to) = self.filter.to {
            params.push(format!("to={to}"));
        }
        if !params.is_empty() {
            write!(f, "?{}", params.join("&"))?;
        }
        Ok(())
    }
}

/// Case-, accent- and whitespace-insensitive form of a search string.
fn normalize_search(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }

    let mut out = String::new();
    let mut prev_space = false;
    for ch in trimmed.nfkd() {
        if is_combining_mark(ch) {
            continue;
        }
        if ch.is_alphanumeric() {
            for lower in ch.to_lowercase() {
                out.push(lower);
            }
            prev_space = false;
        } else if !out.is_empty() && !prev_space {
            out.push(' ');
            prev_space = true;
        }
    }
    let normalized = out.trim();
    if normalized.is_empty() {
        None
    } else {
        Some(normalized.to_string())
    }
}
