use std::{
    collections::{HashMap, VecDeque},
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use base64::Engine as _;
use chrono::NaiveDate;
use feed_engine::{
    FeedQuery, NewTransaction, RemoteError, RemoteFeed, RemotePage, SyncState, Transaction,
    TransactionPatch, TxId,
};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct FeedCursor {
    occurred_on: NaiveDate,
    seq: u64,
}

impl FeedCursor {
    fn encode(&self) -> Result<String, RemoteError> {
        let bytes = serde_json::to_vec(self)
            .map_err(|_| RemoteError::Validation("invalid feed cursor".to_string()))?;
        Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
    }

    fn decode(input: &str) -> Result<Self, RemoteError> {
        let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(input.as_bytes())
            .map_err(|_| RemoteError::Validation("invalid feed cursor".to_string()))?;
        serde_json::from_slice::<Self>(&bytes)
            .map_err(|_| RemoteError::Validation("invalid feed cursor".to_string()))
    }

    /// Whether `row` sorts strictly after the cursor (older).
    fn precedes(&self, row: &Row) -> bool {
        (row.tx.occurred_on, row.seq) < (self.occurred_on, self.seq)
    }
}

#[derive(Clone, Debug)]
struct Row {
    seq: u64,
    tx: Transaction,
    /// Rows are invisible to `list` until this instant.
    indexed_at: Instant,
}

#[derive(Debug, Default)]
struct State {
    rows: Vec<Row>,
    next_seq: u64,
    idempotency: HashMap<String, String>,
    failures: VecDeque<RemoteError>,
    unreachable: bool,
}

impl State {
    fn insert(&mut self, tx: Transaction, indexed_at: Instant) -> Transaction {
        self.next_seq += 1;
        let seq = self.next_seq;
        let tx = Transaction {
            id: TxId::Server(format!("tx_{seq:06}")),
            sync: SyncState::Confirmed,
            ..tx
        };
        self.rows.push(Row {
            seq,
            tx: tx.clone(),
            indexed_at,
        });
        // Newest first: (occurred_on DESC, seq DESC).
        self.rows
            .sort_by(|a, b| (b.tx.occurred_on, b.seq).cmp(&(a.tx.occurred_on, a.seq)));
        tx
    }

    fn find_mut(&mut self, id: &str) -> Result<&mut Row, RemoteError> {
        self.rows
            .iter_mut()
            .find(|row| row.tx.id.as_server() == Some(id))
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))
    }

    fn check(&mut self) -> Result<(), RemoteError> {
        if self.unreachable {
            return Err(RemoteError::Transport("server unreachable".to_string()));
        }
        match self.failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// In-process [`RemoteFeed`].
///
/// Behaves like the HTTP API: newest first, opaque cursors, idempotent
/// creates. Created rows can be held out of listings for a while to mimic a
/// lagging search index, and failures can be queued or forced.
#[derive(Debug, Default)]
pub struct MemoryFeed {
    state: Mutex<State>,
    indexing_lag: Duration,
    latency: Duration,
}

impl MemoryFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hide new rows from listings for `lag` after they are created.
    pub fn with_indexing_lag(mut self, lag: Duration) -> Self {
        self.indexing_lag = lag;
        self
    }

    /// Delay every call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Inserts rows that are immediately listed.
    pub fn seed(&self, entities: impl IntoIterator<Item = NewTransaction>) -> Vec<Transaction> {
        let mut state = self.state();
        let now = Instant::now();
        entities
            .into_iter()
            .map(|entity| state.insert(from_new(entity), now))
            .collect()
    }

    /// The next call fails with `err`.
    pub fn fail_next(&self, err: RemoteError) {
        self.state().failures.push_back(err);
    }

    /// While unreachable every call fails with a transport error.
    pub fn set_reachable(&self, reachable: bool) {
        self.state().unreachable = !reachable;
    }

    pub fn len(&self) -> usize {
        self.state().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

fn from_new(entity: NewTransaction) -> Transaction {
    Transaction {
        id: TxId::Server(String::new()),
        sync: SyncState::Confirmed,
        classification: entity.classification,
        amount: entity.amount,
        category: entity.category,
        occurred_on: entity.occurred_on,
        description: entity.description,
        note: entity.note,
    }
}

#[async_trait]
impl RemoteFeed for MemoryFeed {
    async fn list(&self, query: FeedQuery) -> Result<RemotePage, RemoteError> {
        self.delay().await;
        let mut state = self.state();
        state.check()?;
        query
            .filter
            .validate()
            .map_err(|err| RemoteError::Validation(err.to_string()))?;
        if query.limit == 0 {
            return Err(RemoteError::Validation("limit must be > 0".to_string()));
        }
        let cursor = query.cursor.as_deref().map(FeedCursor::decode).transpose()?;

        let now = Instant::now();
        let matching: Vec<&Row> = state
            .rows
            .iter()
            .filter(|row| row.indexed_at <= now && query.filter.matches(&row.tx))
            .collect();
        let total = matching.len() as u64;

        let limit = query.limit as usize;
        let mut rows: Vec<&Row> = matching
            .into_iter()
            .filter(|row| cursor.as_ref().is_none_or(|cursor| cursor.precedes(row)))
            .take(limit.saturating_add(1))
            .collect();
        let has_more = rows.len() > limit;
        rows.truncate(limit);

        let next_cursor = match rows.last() {
            Some(last) if has_more => Some(
                FeedCursor {
                    occurred_on: last.tx.occurred_on,
                    seq: last.seq,
                }
                .encode()?,
            ),
            _ => None,
        };

        Ok(RemotePage {
            items: rows.into_iter().map(|row| row.tx.clone()).collect(),
            next_cursor,
            has_more,
            total: Some(total),
        })
    }

    async fn create(
        &self,
        entity: NewTransaction,
        idempotency_key: String,
    ) -> Result<Transaction, RemoteError> {
        self.delay().await;
        let mut state = self.state();
        state.check()?;
        if !entity.amount.is_positive() {
            return Err(RemoteError::Validation("amount must be > 0".to_string()));
        }

        if let Some(id) = state.idempotency.get(&idempotency_key).cloned() {
            tracing::debug!("replayed create {idempotency_key} as {id}");
            return state.find_mut(&id).map(|row| row.tx.clone());
        }

        let indexed_at = Instant::now() + self.indexing_lag;
        let created = state.insert(from_new(entity), indexed_at);
        state
            .idempotency
            .insert(idempotency_key, created.id.to_string());
        Ok(created)
    }

    async fn update(&self, id: &str, patch: TransactionPatch) -> Result<Transaction, RemoteError> {
        self.delay().await;
        let mut state = self.state();
        state.check()?;
        if patch.amount.is_some_and(|amount| !amount.is_positive()) {
            return Err(RemoteError::Validation("amount must be > 0".to_string()));
        }

        let row = state.find_mut(id)?;
        let tx = &mut row.tx;
        if let Some(classification) = patch.classification {
            tx.classification = classification;
        }
        if let Some(amount) = patch.amount {
            tx.amount = amount;
        }
        if let Some(category) = patch.category {
            tx.category = Some(category);
        }
        if let Some(occurred_on) = patch.occurred_on {
            tx.occurred_on = occurred_on;
        }
        if let Some(description) = patch.description {
            tx.description = Some(description);
        }
        if let Some(note) = patch.note {
            tx.note = Some(note);
        }
        let updated = tx.clone();
        state
            .rows
            .sort_by(|a, b| (b.tx.occurred_on, b.seq).cmp(&(a.tx.occurred_on, a.seq)));
        Ok(updated)
    }

    async fn delete(&self, id: &str) -> Result<(), RemoteError> {
        self.delay().await;
        let mut state = self.state();
        state.check()?;
        let before = state.rows.len();
        state.rows.retain(|row| row.tx.id.as_server() != Some(id));
        if state.rows.len() == before {
            return Err(RemoteError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Transaction, RemoteError> {
        self.delay().await;
        let mut state = self.state();
        state.check()?;
        state.find_mut(id).map(|row| row.tx.clone())
    }
}
