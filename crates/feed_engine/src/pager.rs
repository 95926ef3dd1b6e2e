//! Cursor pagination with at most one in-flight fetch per fingerprint.
//!
//! Fetches run on their own task and are shared: every caller that joins a
//! fetch awaits the same outcome, and the fetch completes (and its slot is
//! released) even if all of them go away.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::broadcast;

use crate::{
    CacheStore, FeedError, FeedEvent, Fingerprint,
    remote::{FeedQuery, RemoteFeed},
    store::Applied,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The page was merged into the cache.
    Applied { received: usize, added: usize },
    /// The response arrived for an older generation (or a superseded
    /// cursor) and was dropped.
    Discarded,
    /// The feed has no further pages.
    Exhausted,
}

type SharedFetch = Shared<BoxFuture<'static, Result<FetchOutcome, FeedError>>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FetchKind {
    First,
    Next,
}

struct InFlight {
    kind: FetchKind,
    generation: u64,
    ticket: u64,
    fetch: SharedFetch,
}

struct PagerInner {
    store: CacheStore,
    remote: Arc<dyn RemoteFeed>,
    limit: u32,
    events: broadcast::Sender<FeedEvent>,
    slots: Mutex<HashMap<Fingerprint, InFlight>>,
    tickets: AtomicU64,
}

#[derive(Clone)]
pub struct Pager {
    inner: Arc<PagerInner>,
}

enum Slot {
    Join(SharedFetch),
    Wait(SharedFetch),
}

impl Pager {
    pub fn new(
        store: CacheStore,
        remote: Arc<dyn RemoteFeed>,
        limit: u32,
        events: broadcast::Sender<FeedEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(PagerInner {
                store,
                remote,
                limit,
                events,
                slots: Mutex::new(HashMap::new()),
                tickets: AtomicU64::new(0),
            }),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<Fingerprint, InFlight>> {
        self.inner
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Fetches page 1 of `fp` and replaces its cached pages with it.
    ///
    /// Joins a first-page fetch of the same generation already in flight.
    /// Any other in-flight fetch is awaited before a new request goes out.
    pub async fn fetch_first(&self, fp: &Fingerprint) -> Result<FetchOutcome, FeedError> {
        loop {
            let slot = {
                let mut slots = self.slots();
                match slots.get(fp) {
                    Some(current)
                        if current.kind == FetchKind::First
                            && current.generation == self.inner.store.generation(fp) =>
                    {
                        Slot::Join(current.fetch.clone())
                    }
                    Some(current) => Slot::Wait(current.fetch.clone()),
                    None => Slot::Join(self.issue(&mut slots, fp, FetchKind::First, None)),
                }
            };
            match slot {
                Slot::Join(fetch) => return fetch.await,
                Slot::Wait(fetch) => {
                    let _ = fetch.await;
                }
            }
        }
    }

    /// Starts a first-page fetch of `fp` in the background, unless one for
    /// the current generation is already in flight.
    pub fn start_first(&self, fp: &Fingerprint) {
        let mut slots = self.slots();
        match slots.get(fp) {
            None => {
                let _fetch = self.issue(&mut slots, fp, FetchKind::First, None);
            }
            Some(current)
                if current.kind == FetchKind::First
                    && current.generation == self.inner.store.generation(fp) => {}
            Some(_) => {
                let pager = self.clone();
                let fp = fp.clone();
                tokio::spawn(async move {
                    if let Err(err) = pager.fetch_first(&fp).await {
                        tracing::debug!("background fetch of {fp} failed: {err}");
                    }
                });
            }
        }
    }

    /// Fetches the page after the last cached one and appends it.
    pub async fn fetch_next(&self, fp: &Fingerprint) -> Result<FetchOutcome, FeedError> {
        let fetch = {
            let mut slots = self.slots();
            let Some(cursor) = self.inner.store.next_cursor(fp)? else {
                return Ok(FetchOutcome::Exhausted);
            };
            match slots.get(fp) {
                Some(current) => current.fetch.clone(),
                None => self.issue(&mut slots, fp, FetchKind::Next, Some(cursor)),
            }
        };
        fetch.await
    }

    fn issue(
        &self,
        slots: &mut HashMap<Fingerprint, InFlight>,
        fp: &Fingerprint,
        kind: FetchKind,
        cursor: Option<String>,
    ) -> SharedFetch {
        let generation = self.inner.store.begin_fetch(fp);
        let ticket = self.inner.tickets.fetch_add(1, Ordering::Relaxed);
        let query = FeedQuery {
            filter: fp.filter().clone(),
            cursor,
            limit: self.inner.limit,
        };
        tracing::debug!("fetching {kind:?} page of {fp} (generation {generation})");

        let pager = self.clone();
        let task_fp = fp.clone();
        let handle =
            tokio::spawn(async move { pager.run(task_fp, generation, ticket, query).await });
        let fetch = async move {
            handle
                .await
                .unwrap_or_else(|err| Err(FeedError::Transport(format!("fetch aborted: {err}"))))
        }
        .boxed()
        .shared();

        slots.insert(
            fp.clone(),
            InFlight {
                kind,
                generation,
                ticket,
                fetch: fetch.clone(),
            },
        );
        fetch
    }

    async fn run(
        self,
        fp: Fingerprint,
        generation: u64,
        ticket: u64,
        query: FeedQuery,
    ) -> Result<FetchOutcome, FeedError> {
        let store = &self.inner.store;
        let cursor = query.cursor.clone();
        let outcome = match self.inner.remote.list(query).await {
            Ok(page) => {
                let applied = match &cursor {
                    None => store.apply_first(&fp, generation, page),
                    Some(cursor) => store.apply_next(&fp, generation, cursor, page),
                };
                match applied {
                    Applied::Merged { received, added } => {
                        tracing::debug!("merged {added}/{received} rows into {fp}");
                        let _ = self.inner.events.send(FeedEvent::Changed(fp.clone()));
                        Ok(FetchOutcome::Applied { received, added })
                    }
                    Applied::Discarded => {
                        tracing::warn!("discarded stale page for {fp} (generation {generation})");
                        Ok(FetchOutcome::Discarded)
                    }
                }
            }
            Err(err) => {
                let err = FeedError::from(err);
                tracing::debug!("fetch of {fp} failed: {err}");
                store.fail_fetch(&fp, generation, err.clone());
                let _ = self.inner.events.send(FeedEvent::Changed(fp.clone()));
                Err(err)
            }
        };

        let mut slots = self.slots();
        if slots.get(&fp).is_some_and(|current| current.ticket == ticket) {
            slots.remove(&fp);
        }
        outcome
    }
}
