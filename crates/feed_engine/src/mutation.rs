//! Optimistic mutations.
//!
//! Creates and deletes patch every affected cached feed before the request
//! goes out and roll the patch back atomically if it fails. Updates wait for
//! the server. Mutations on one logical entity (a temporary id and its
//! alias count as one) run strictly in submission order.

use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, broadcast};

use crate::{
    CacheStore, FeedError, Fingerprint, NewTransaction, TempId, TempIdGenerator, Transaction,
    TransactionPatch, TxId,
    engine::FeedEvent,
    remote::{RemoteError, RemoteFeed},
    store::{FeedSnapshot, LocalPatch},
};

const RECENT_CAPACITY: usize = 32;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mutation {
    Create(NewTransaction),
    Update { id: TxId, patch: TransactionPatch },
    Delete { id: TxId },
}

impl Mutation {
    pub fn kind(&self) -> MutationKind {
        match self {
            Self::Create(_) => MutationKind::Create,
            Self::Update { .. } => MutationKind::Update,
            Self::Delete { .. } => MutationKind::Delete,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MutationStatus {
    InFlight,
    Committed,
    RolledBack,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingMutation {
    pub id: u64,
    pub kind: MutationKind,
    pub target: TxId,
    /// Pre-patch state of every feed the mutation touched.
    pub snapshots: Vec<FeedSnapshot>,
    pub status: MutationStatus,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MutationOutcome {
    /// `entity` is the authoritative copy; the feeds keep showing `temp`
    /// until a refetch observes it.
    Created { temp: TempId, entity: Transaction },
    Updated(Transaction),
    Deleted(TxId),
}

/// A committed mutation and the feeds that need reconciling.
#[derive(Debug)]
pub(crate) struct Settled {
    pub outcome: MutationOutcome,
    pub affected: Vec<Fingerprint>,
}

#[derive(Debug, Default)]
struct Registry {
    pending: HashMap<u64, PendingMutation>,
    recent: VecDeque<PendingMutation>,
}

pub(crate) struct MutationCoordinator {
    store: CacheStore,
    remote: Arc<dyn RemoteFeed>,
    events: broadcast::Sender<FeedEvent>,
    timeout: Option<Duration>,
    temp_ids: TempIdGenerator,
    locks: Mutex<HashMap<TxId, Arc<AsyncMutex<()>>>>,
    registry: Mutex<Registry>,
    next_id: AtomicU64,
}

/// Holds the entity lock until dropped, then forgets the lock if nobody else
/// is queued on it.
struct EntityGuard<'a> {
    coordinator: &'a MutationCoordinator,
    key: TxId,
    lock: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for EntityGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.coordinator.locks();
        let idle = Arc::strong_count(&self.lock) == 2
            && locks
                .get(&self.key)
                .is_some_and(|lock| Arc::ptr_eq(lock, &self.lock));
        if idle {
            locks.remove(&self.key);
        }
    }
}

impl MutationCoordinator {
    pub fn new(
        store: CacheStore,
        remote: Arc<dyn RemoteFeed>,
        events: broadcast::Sender<FeedEvent>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            store,
            remote,
            events,
            timeout,
            temp_ids: TempIdGenerator::new(),
            locks: Mutex::new(HashMap::new()),
            registry: Mutex::new(Registry::default()),
            next_id: AtomicU64::new(1),
        }
    }

    pub async fn submit(&self, mutation: Mutation) -> Result<Settled, FeedError> {
        match mutation {
            Mutation::Create(entity) => self.create(entity).await,
            Mutation::Update { id, patch } => self.update(id, patch).await,
            Mutation::Delete { id } => self.delete(id).await,
        }
    }

    pub fn pending(&self) -> Vec<PendingMutation> {
        let mut pending: Vec<_> = self.registry().pending.values().cloned().collect();
        pending.sort_by_key(|mutation| mutation.id);
        pending
    }

    pub fn recent(&self) -> Vec<PendingMutation> {
        self.registry().recent.iter().cloned().collect()
    }

    async fn create(&self, entity: NewTransaction) -> Result<Settled, FeedError> {
        entity.validate()?;

        let temp = self.temp_ids.next_id();
        let key = TxId::Temp(temp);
        // A fresh lock: acquired before the row becomes visible, so anything
        // issued against the temporary id queues behind this create.
        let _entity = self.lock_fresh(key.clone());

        let patch = self
            .store
            .splice_local(Transaction::provisional(temp, &entity));
        let mut affected = fingerprints(&patch);
        let pending = self.register(MutationKind::Create, key.clone(), patch.snapshots.clone());
        self.notify(&affected);
        tracing::debug!("create {temp} spliced into {} feed(s)", affected.len());

        match self.call(self.remote.create(entity, temp.to_string())).await {
            Ok(created) => {
                let server_id = created.id.to_string();
                let Some(promoted) = self.store.promote(patch.session, temp, &created) else {
                    self.finish(pending, MutationStatus::Committed);
                    tracing::debug!("create {temp} committed as {server_id} after the session ended");
                    return Ok(Settled {
                        outcome: MutationOutcome::Created {
                            temp,
                            entity: created,
                        },
                        affected: Vec::new(),
                    });
                };
                for fp in promoted {
                    if !affected.contains(&fp) {
                        affected.push(fp);
                    }
                }
                self.finish(pending, MutationStatus::Committed);
                self.notify(&affected);
                tracing::debug!("create {temp} committed as {server_id}");
                Ok(Settled {
                    outcome: MutationOutcome::Created {
                        temp,
                        entity: created,
                    },
                    affected,
                })
            }
            Err(err) => {
                self.store.rollback_local(temp, &patch);
                self.finish(pending, MutationStatus::RolledBack);
                self.notify(&affected);
                tracing::warn!("create {temp} rolled back: {err}");
                Err(err)
            }
        }
    }

    async fn delete(&self, id: TxId) -> Result<Settled, FeedError> {
        let _entity = self.lock(&id).await;

        let Some(server_id) = self.store.resolve(&id) else {
            // The create never committed; nothing exists on the server.
            let patch = self.store.delete_rows(None, std::slice::from_ref(&id));
            let affected = fingerprints(&patch);
            let pending = self.register(MutationKind::Delete, id.clone(), patch.snapshots);
            self.finish(pending, MutationStatus::Committed);
            self.notify(&affected);
            tracing::debug!("delete of unconfirmed {id} applied locally");
            return Ok(Settled {
                outcome: MutationOutcome::Deleted(id),
                affected: Vec::new(),
            });
        };

        let mut rows = vec![TxId::Server(server_id.clone())];
        rows.extend(self.store.alias_of(&server_id).map(TxId::Temp));

        let patch = self.store.delete_rows(Some(&server_id), &rows);
        let affected = fingerprints(&patch);
        let pending = self.register(MutationKind::Delete, id.clone(), patch.snapshots.clone());
        self.notify(&affected);
        tracing::debug!("delete {server_id} removed from {} feed(s)", affected.len());

        match self.call_raw(self.remote.delete(&server_id)).await {
            Ok(()) | Err(RemoteError::NotFound(_)) => {
                self.store.evict_detail(&server_id);
                self.finish(pending, MutationStatus::Committed);
                tracing::debug!("delete {server_id} committed");
                let current = self.store.session() == patch.session;
                Ok(Settled {
                    outcome: MutationOutcome::Deleted(id),
                    affected: if current { affected } else { Vec::new() },
                })
            }
            Err(err) => {
                let err = FeedError::from(err);
                self.store.undelete_rows(&server_id, &rows, &patch);
                self.finish(pending, MutationStatus::RolledBack);
                self.notify(&affected);
                tracing::warn!("delete {server_id} rolled back: {err}");
                Err(err)
            }
        }
    }

    async fn update(&self, id: TxId, patch: TransactionPatch) -> Result<Settled, FeedError> {
        patch.validate()?;
        let _entity = self.lock(&id).await;

        let server_id = self
            .store
            .resolve(&id)
            .ok_or_else(|| FeedError::Unconfirmed(id.to_string()))?;
        let pending = self.register(MutationKind::Update, id.clone(), Vec::new());
        let session = self.store.session();

        match self.call(self.remote.update(&server_id, patch)).await {
            Ok(updated) => {
                self.store.evict_detail(&server_id);
                let Some(mut affected) = self.store.replace_row(session, &server_id, &updated)
                else {
                    self.finish(pending, MutationStatus::Committed);
                    tracing::debug!("update {server_id} committed after the session ended");
                    return Ok(Settled {
                        outcome: MutationOutcome::Updated(updated),
                        affected: Vec::new(),
                    });
                };
                self.notify(&affected);
                for fp in self.store.fingerprints() {
                    if fp.matches(&updated) && !affected.contains(&fp) {
                        affected.push(fp);
                    }
                }
                self.finish(pending, MutationStatus::Committed);
                tracing::debug!("update {server_id} committed");
                Ok(Settled {
                    outcome: MutationOutcome::Updated(updated),
                    affected,
                })
            }
            Err(err) => {
                self.finish(pending, MutationStatus::RolledBack);
                tracing::warn!("update {server_id} failed: {err}");
                Err(err)
            }
        }
    }

    async fn call<T>(
        &self,
        request: impl Future<Output = Result<T, RemoteError>>,
    ) -> Result<T, FeedError> {
        self.call_raw(request).await.map_err(FeedError::from)
    }

    async fn call_raw<T>(
        &self,
        request: impl Future<Output = Result<T, RemoteError>>,
    ) -> Result<T, RemoteError> {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, request)
                .await
                .unwrap_or_else(|_| Err(RemoteError::Transport("request timed out".to_string()))),
            None => request.await,
        }
    }

    /// The lock key of `id`: authoritative ids created in this session map
    /// back to their temporary id.
    fn entity_key(&self, id: &TxId) -> TxId {
        match id {
            TxId::Temp(_) => id.clone(),
            TxId::Server(server_id) => self
                .store
                .alias_of(server_id)
                .map(TxId::Temp)
                .unwrap_or_else(|| id.clone()),
        }
    }

    fn lock_handle(&self, key: &TxId) -> Arc<AsyncMutex<()>> {
        self.locks()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    async fn lock(&self, id: &TxId) -> EntityGuard<'_> {
        let key = self.entity_key(id);
        let lock = self.lock_handle(&key);
        let guard = lock.clone().lock_owned().await;
        EntityGuard {
            coordinator: self,
            key,
            lock,
            guard: Some(guard),
        }
    }

    fn lock_fresh(&self, key: TxId) -> EntityGuard<'_> {
        let lock = self.lock_handle(&key);
        let guard = lock.clone().try_lock_owned().ok();
        EntityGuard {
            coordinator: self,
            key,
            lock,
            guard,
        }
    }

    fn locks(&self) -> MutexGuard<'_, HashMap<TxId, Arc<AsyncMutex<()>>>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, kind: MutationKind, target: TxId, snapshots: Vec<FeedSnapshot>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry().pending.insert(
            id,
            PendingMutation {
                id,
                kind,
                target,
                snapshots,
                status: MutationStatus::InFlight,
            },
        );
        id
    }

    fn finish(&self, id: u64, status: MutationStatus) {
        let mut registry = self.registry();
        let Some(mut mutation) = registry.pending.remove(&id) else {
            return;
        };
        mutation.status = status;
        if registry.recent.len() == RECENT_CAPACITY {
            registry.recent.pop_front();
        }
        registry.recent.push_back(mutation);
    }

    fn notify(&self, fingerprints: &[Fingerprint]) {
        for fp in fingerprints {
            let _ = self.events.send(FeedEvent::Changed(fp.clone()));
        }
    }
}

fn fingerprints(patch: &LocalPatch) -> Vec<Fingerprint> {
    patch
        .snapshots
        .iter()
        .map(|snapshot| snapshot.fingerprint.clone())
        .collect()
}
