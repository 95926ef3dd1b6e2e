use std::{
    collections::HashSet,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use futures_util::future::join_all;
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    CacheStore, FeedConfig, FeedError, Fingerprint, NewTransaction, Transaction,
    TransactionPatch, TxId,
    invalidation::{InvalidationBus, InvalidationSignal},
    mutation::{Mutation, MutationCoordinator, MutationOutcome, PendingMutation},
    pager::{FetchOutcome, Pager},
    reconcile::ReconciliationScheduler,
    remote::RemoteFeed,
    store::{CachedFeed, Page},
};

/// Notifications for the rendering layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FeedEvent {
    /// The cached pages of the feed changed; re-read its view.
    Changed(Fingerprint),
    /// The feed was marked stale and will be refetched when visible.
    Invalidated(Fingerprint),
    /// The whole cache was dropped.
    Cleared,
}

/// Read-only projection of a cached feed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FeedView {
    pub fingerprint: Fingerprint,
    pub pages: Vec<Page>,
    /// All pages flattened, in display order.
    pub items: Vec<Transaction>,
    pub total: u64,
    pub has_more: bool,
    pub loading: bool,
    pub error: Option<FeedError>,
    pub stale: bool,
    pub generation: u64,
}

impl FeedView {
    fn new(fingerprint: Fingerprint, feed: CachedFeed, generation: u64) -> Self {
        Self {
            items: feed.items().cloned().collect(),
            total: feed.displayed_total(),
            has_more: feed.has_more(),
            fingerprint,
            pages: feed.pages,
            loading: feed.loading,
            error: feed.error,
            stale: feed.stale,
            generation,
        }
    }
}

struct Inner {
    config: FeedConfig,
    store: CacheStore,
    remote: Arc<dyn RemoteFeed>,
    pager: Pager,
    mutations: MutationCoordinator,
    scheduler: ReconciliationScheduler,
    events: broadcast::Sender<FeedEvent>,
    visible: Mutex<HashSet<Fingerprint>>,
    shutdown: CancellationToken,
}

/// The transaction feed engine.
///
/// Cheap to clone; every clone drives the same cache.
#[derive(Clone)]
pub struct FeedEngine {
    inner: Arc<Inner>,
}

impl FeedEngine {
    /// Return a builder for `FeedEngine`.
    pub fn builder() -> FeedEngineBuilder {
        FeedEngineBuilder::default()
    }

    pub fn config(&self) -> &FeedConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &CacheStore {
        &self.inner.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FeedEvent> {
        self.inner.events.subscribe()
    }

    /// Current view of `fp`, marking it visible.
    ///
    /// A feed that is missing or stale gets a background first-page fetch.
    pub fn observe(&self, fp: &Fingerprint) -> FeedView {
        self.visible().insert(fp.clone());
        self.inner.store.ensure(fp);
        if self.inner.store.read(fp).is_some_and(|feed| feed.stale) {
            self.inner.pager.start_first(fp);
        }
        self.view(fp)
    }

    /// Current view of `fp` without side effects.
    pub fn view(&self, fp: &Fingerprint) -> FeedView {
        let feed = self.inner.store.read(fp).unwrap_or_default();
        FeedView::new(fp.clone(), feed, self.inner.store.generation(fp))
    }

    pub fn release(&self, fp: &Fingerprint) {
        self.visible().remove(fp);
    }

    pub fn is_visible(&self, fp: &Fingerprint) -> bool {
        self.visible().contains(fp)
    }

    pub async fn refresh(&self, fp: &Fingerprint) -> Result<FetchOutcome, FeedError> {
        self.inner.pager.fetch_first(fp).await
    }

    /// Loads the next page; a stale feed is reloaded from page 1 instead.
    pub async fn load_more(&self, fp: &Fingerprint) -> Result<FetchOutcome, FeedError> {
        match self.inner.pager.fetch_next(fp).await {
            Err(FeedError::StaleFingerprint(_)) => {
                tracing::debug!("{fp} is stale, reloading from the first page");
                self.inner.pager.fetch_first(fp).await
            }
            other => other,
        }
    }

    pub async fn mutate(&self, mutation: Mutation) -> Result<MutationOutcome, FeedError> {
        let settled = self.inner.mutations.submit(mutation).await?;
        for fp in settled.affected {
            self.schedule_reconcile(fp);
        }
        Ok(settled.outcome)
    }

    pub async fn create(&self, entity: NewTransaction) -> Result<MutationOutcome, FeedError> {
        self.mutate(Mutation::Create(entity)).await
    }

    pub async fn update(
        &self,
        id: TxId,
        patch: TransactionPatch,
    ) -> Result<MutationOutcome, FeedError> {
        self.mutate(Mutation::Update { id, patch }).await
    }

    pub async fn delete(&self, id: TxId) -> Result<MutationOutcome, FeedError> {
        self.mutate(Mutation::Delete { id }).await
    }

    pub fn pending(&self) -> Vec<PendingMutation> {
        self.inner.mutations.pending()
    }

    pub fn recent(&self) -> Vec<PendingMutation> {
        self.inner.mutations.recent()
    }

    /// The authoritative entity behind `id`, from cache when possible.
    pub async fn detail(&self, id: &TxId) -> Result<Transaction, FeedError> {
        let server_id = self
            .inner
            .store
            .resolve(id)
            .ok_or_else(|| FeedError::Unconfirmed(id.to_string()))?;
        if let Some(entity) = self.inner.store.detail(&server_id) {
            return Ok(entity);
        }
        let session = self.inner.store.session();
        let entity = self.inner.remote.get(&server_id).await?;
        self.inner.store.put_detail(session, entity.clone());
        Ok(entity)
    }

    /// Invalidates every cached feed and refetches the visible ones.
    pub fn on_network_restored(&self) {
        let invalidated = self.inner.store.invalidate_all();
        tracing::info!("network restored, invalidated {} feed(s)", invalidated.len());
        let mut visible = Vec::new();
        for fp in invalidated {
            let _ = self.inner.events.send(FeedEvent::Invalidated(fp.clone()));
            if self.is_visible(&fp) {
                visible.push(fp);
            }
        }
        if visible.is_empty() {
            return;
        }

        let engine = self.clone();
        tokio::spawn(async move {
            let fetches = visible.iter().map(|fp| engine.refresh(fp));
            for result in join_all(fetches).await {
                if let Err(err) = result {
                    tracing::debug!("refetch after reconnect failed: {err}");
                }
            }
        });
    }

    /// Drops all cached state after a logout.
    pub fn on_session_cleared(&self) {
        self.inner.scheduler.cancel_all();
        self.inner.store.clear();
        self.visible().clear();
        let _ = self.inner.events.send(FeedEvent::Cleared);
        tracing::info!("feed cache cleared");
    }

    /// Dispatches the signals of `bus` to this engine until shutdown.
    pub fn listen(&self, bus: &InvalidationBus) -> JoinHandle<()> {
        let mut signals = bus.subscribe();
        let engine = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let signal = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    signal = signals.recv() => signal,
                };
                let Some(engine) = upgrade(&engine) else {
                    break;
                };
                match signal {
                    Ok(InvalidationSignal::NetworkRestored) => engine.on_network_restored(),
                    Ok(InvalidationSignal::SessionCleared) => engine.on_session_cleared(),
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!("missed {missed} invalidation signal(s)");
                        engine.on_network_restored();
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Stops timers and listeners. In-flight requests still complete.
    pub fn shutdown(&self) {
        self.inner.scheduler.shutdown();
        self.inner.shutdown.cancel();
    }

    fn schedule_reconcile(&self, fp: Fingerprint) {
        let engine = Arc::downgrade(&self.inner);
        let target = fp.clone();
        self.inner.scheduler.arm(fp, async move {
            if let Some(engine) = upgrade(&engine) {
                engine.reconcile(&target).await;
            }
        });
    }

    async fn reconcile(&self, fp: &Fingerprint) {
        self.inner.store.invalidate(fp);
        let _ = self.inner.events.send(FeedEvent::Invalidated(fp.clone()));
        if !self.is_visible(fp) {
            return;
        }
        if let Err(err) = self.inner.pager.fetch_first(fp).await {
            tracing::debug!("reconciliation of {fp} failed: {err}");
        }
    }

    fn visible(&self) -> MutexGuard<'_, HashSet<Fingerprint>> {
        self.inner
            .visible
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn upgrade(inner: &Weak<Inner>) -> Option<FeedEngine> {
    inner.upgrade().map(|inner| FeedEngine { inner })
}

/// The builder for `FeedEngine`
#[derive(Default)]
pub struct FeedEngineBuilder {
    remote: Option<Arc<dyn RemoteFeed>>,
    config: FeedConfig,
    store: Option<CacheStore>,
}

impl FeedEngineBuilder {
    /// Pass the required remote feed
    pub fn remote(mut self, remote: Arc<dyn RemoteFeed>) -> FeedEngineBuilder {
        self.remote = Some(remote);
        self
    }

    pub fn config(mut self, config: FeedConfig) -> FeedEngineBuilder {
        self.config = config;
        self
    }

    /// Share an existing store instead of starting empty
    pub fn store(mut self, store: CacheStore) -> FeedEngineBuilder {
        self.store = Some(store);
        self
    }

    /// Construct `FeedEngine`
    pub fn build(self) -> Result<FeedEngine, FeedError> {
        let remote = self
            .remote
            .ok_or_else(|| FeedError::Validation("a remote feed is required".to_string()))?;
        if self.config.page_limit == 0 {
            return Err(FeedError::Validation(
                "page_limit must be > 0".to_string(),
            ));
        }

        let config = self.config;
        let store = self.store.unwrap_or_default();
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let pager = Pager::new(
            store.clone(),
            Arc::clone(&remote),
            config.page_limit,
            events.clone(),
        );
        let mutations = MutationCoordinator::new(
            store.clone(),
            Arc::clone(&remote),
            events.clone(),
            config.mutation_timeout(),
        );
        let scheduler = ReconciliationScheduler::new(config.settle_window());

        Ok(FeedEngine {
            inner: Arc::new(Inner {
                config,
                store,
                remote,
                pager,
                mutations,
                scheduler,
                events,
                visible: Mutex::new(HashSet::new()),
                shutdown: CancellationToken::new(),
            }),
        })
    }
}
