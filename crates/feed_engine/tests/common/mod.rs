#![allow(dead_code)]

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use chrono::NaiveDate;
use tokio::sync::oneshot;

use feed_engine::{
    Classification, FeedConfig, FeedEngine, FeedFilter, FeedQuery, Fingerprint, Money,
    NewTransaction, RemoteError, RemoteFeed, RemotePage, SyncState, Transaction,
    TransactionPatch, TxId,
};

pub fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
}

pub fn all() -> Fingerprint {
    Fingerprint::transactions(FeedFilter::all())
}

pub fn expenses() -> Fingerprint {
    Fingerprint::transactions(FeedFilter::all().classification(Classification::Expense))
}

pub fn expense(cents: i64) -> NewTransaction {
    NewTransaction::new(Classification::Expense, Money::new(cents), day(10))
}

pub fn server_tx(id: &str, classification: Classification, cents: i64) -> Transaction {
    Transaction {
        id: TxId::Server(id.to_string()),
        sync: SyncState::Confirmed,
        classification,
        amount: Money::new(cents),
        category: None,
        occurred_on: day(1),
        description: Some(format!("row {id}")),
        note: None,
    }
}

pub fn ids(items: &[Transaction]) -> Vec<String> {
    items.iter().map(|tx| tx.id.to_string()).collect()
}

/// Lets spawned tasks run until they block again.
pub async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

#[derive(Default)]
struct Gates {
    list: VecDeque<oneshot::Receiver<()>>,
    create: VecDeque<oneshot::Receiver<()>>,
    delete: VecDeque<oneshot::Receiver<()>>,
}

#[derive(Default)]
struct Failures {
    list: VecDeque<RemoteError>,
    create: VecDeque<RemoteError>,
    delete: VecDeque<RemoteError>,
    update: VecDeque<RemoteError>,
}

/// A scripted server: rows newest first, offset cursors.
///
/// Every call can be held back with a gate (released by sending on the
/// returned channel) or failed with a queued error.
#[derive(Default)]
pub struct ScriptedFeed {
    rows: Mutex<Vec<Transaction>>,
    /// Pages served verbatim, in order, before falling back to `rows`.
    pages: Mutex<VecDeque<RemotePage>>,
    gates: Mutex<Gates>,
    failures: Mutex<Failures>,
    next_id: AtomicUsize,
    pub list_calls: AtomicUsize,
    pub create_calls: AtomicUsize,
    pub delete_calls: AtomicUsize,
    pub update_calls: AtomicUsize,
    pub in_flight_lists: AtomicUsize,
    pub max_in_flight_lists: AtomicUsize,
    pub idempotency_keys: Mutex<Vec<String>>,
}

impl ScriptedFeed {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicUsize::new(1),
            ..Self::default()
        })
    }

    pub fn seed(&self, rows: Vec<Transaction>) {
        *self.rows.lock().unwrap() = rows;
    }

    pub fn rows(&self) -> Vec<Transaction> {
        self.rows.lock().unwrap().clone()
    }

    pub fn push_page(&self, items: Vec<Transaction>, next_cursor: Option<&str>) {
        self.pages.lock().unwrap().push_back(RemotePage {
            has_more: next_cursor.is_some(),
            next_cursor: next_cursor.map(str::to_string),
            items,
            total: None,
        });
    }

    pub fn gate_list(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.gates.lock().unwrap().list.push_back(rx);
        tx
    }

    pub fn gate_create(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.gates.lock().unwrap().create.push_back(rx);
        tx
    }

    pub fn gate_delete(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.gates.lock().unwrap().delete.push_back(rx);
        tx
    }

    pub fn fail_list(&self, err: RemoteError) {
        self.failures.lock().unwrap().list.push_back(err);
    }

    pub fn fail_create(&self, err: RemoteError) {
        self.failures.lock().unwrap().create.push_back(err);
    }

    pub fn fail_delete(&self, err: RemoteError) {
        self.failures.lock().unwrap().delete.push_back(err);
    }

    pub fn fail_update(&self, err: RemoteError) {
        self.failures.lock().unwrap().update.push_back(err);
    }

    pub fn calls(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    fn list_page(&self, query: &FeedQuery) -> RemotePage {
        if let Some(page) = self.pages.lock().unwrap().pop_front() {
            return page;
        }
        let rows: Vec<Transaction> = self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|tx| query.filter.matches(tx))
            .cloned()
            .collect();
        let offset: usize = query
            .cursor
            .as_deref()
            .and_then(|cursor| cursor.strip_prefix("o:"))
            .map(|offset| offset.parse().unwrap())
            .unwrap_or(0);
        let end = (offset + query.limit as usize).min(rows.len());
        let has_more = end < rows.len();
        RemotePage {
            items: rows[offset.min(end)..end].to_vec(),
            next_cursor: has_more.then(|| format!("o:{end}")),
            has_more,
            total: Some(rows.len() as u64),
        }
    }
}

async fn pass(gate: Option<oneshot::Receiver<()>>) {
    if let Some(gate) = gate {
        let _ = gate.await;
    }
}

#[async_trait]
impl RemoteFeed for ScriptedFeed {
    async fn list(&self, query: FeedQuery) -> Result<RemotePage, RemoteError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight_lists.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight_lists.fetch_max(now, Ordering::SeqCst);

        let gate = self.gates.lock().unwrap().list.pop_front();
        pass(gate).await;
        self.in_flight_lists.fetch_sub(1, Ordering::SeqCst);

        if let Some(err) = self.failures.lock().unwrap().list.pop_front() {
            return Err(err);
        }
        Ok(self.list_page(&query))
    }

    async fn create(
        &self,
        entity: NewTransaction,
        idempotency_key: String,
    ) -> Result<Transaction, RemoteError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.idempotency_keys.lock().unwrap().push(idempotency_key);
        let gate = self.gates.lock().unwrap().create.pop_front();
        pass(gate).await;

        if let Some(err) = self.failures.lock().unwrap().create.pop_front() {
            return Err(err);
        }
        let id = format!("tx_{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let created = Transaction {
            id: TxId::Server(id),
            sync: SyncState::Confirmed,
            classification: entity.classification,
            amount: entity.amount,
            category: entity.category,
            occurred_on: entity.occurred_on,
            description: entity.description,
            note: entity.note,
        };
        self.rows.lock().unwrap().insert(0, created.clone());
        Ok(created)
    }

    async fn update(&self, id: &str, patch: TransactionPatch) -> Result<Transaction, RemoteError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.failures.lock().unwrap().update.pop_front() {
            return Err(err);
        }
        let mut rows = self.rows.lock().unwrap();
        let row = rows
            .iter_mut()
            .find(|tx| tx.id.as_server() == Some(id))
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;
        if let Some(amount) = patch.amount {
            row.amount = amount;
        }
        if let Some(classification) = patch.classification {
            row.classification = classification;
        }
        if let Some(description) = patch.description {
            row.description = Some(description);
        }
        Ok(row.clone())
    }

    async fn delete(&self, id: &str) -> Result<(), RemoteError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.gates.lock().unwrap().delete.pop_front();
        pass(gate).await;

        if let Some(err) = self.failures.lock().unwrap().delete.pop_front() {
            return Err(err);
        }
        let mut rows = self.rows.lock().unwrap();
        let before = rows.len();
        rows.retain(|tx| tx.id.as_server() != Some(id));
        if rows.len() == before {
            return Err(RemoteError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Transaction, RemoteError> {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .find(|tx| tx.id.as_server() == Some(id))
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))
    }
}

pub fn engine_with(remote: Arc<ScriptedFeed>, config: FeedConfig) -> FeedEngine {
    FeedEngine::builder()
        .remote(remote)
        .config(config)
        .build()
        .unwrap()
}

pub fn engine(remote: Arc<ScriptedFeed>) -> FeedEngine {
    engine_with(remote, FeedConfig::default())
}

/// Observes `fp` and waits for its first page.
pub async fn loaded(engine: &FeedEngine, fp: &Fingerprint) -> Vec<Transaction> {
    engine.observe(fp);
    engine.refresh(fp).await.unwrap();
    engine.view(fp).items
}
