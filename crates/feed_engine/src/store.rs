//! In-memory cache of feed pages, keyed by [`Fingerprint`].
//!
//! Every operation takes the store lock once and runs to completion, so a
//! caller never observes a half-applied patch or rollback. The lock is never
//! held across an await.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::{
    FeedError, Fingerprint, SyncState, TempId, Transaction, TxId, remote::RemotePage,
};

/// One page of a feed, in authoritative order (newest first).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Page {
    pub items: Vec<Transaction>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CachedFeed {
    /// First page first.
    pub pages: Vec<Page>,
    /// Server-reported total, adjusted by optimistic patches.
    pub total: Option<u64>,
    pub stale: bool,
    pub loading: bool,
    pub error: Option<FeedError>,
    revision: u64,
}

impl CachedFeed {
    fn placeholder() -> Self {
        Self {
            stale: true,
            ..Self::default()
        }
    }

    pub fn items(&self) -> impl Iterator<Item = &Transaction> {
        self.pages.iter().flat_map(|page| page.items.iter())
    }

    pub fn len(&self) -> usize {
        self.pages.iter().map(|page| page.items.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The total shown to the user: the server's count when it sends one,
    /// otherwise the number of loaded rows.
    pub fn displayed_total(&self) -> u64 {
        self.total.unwrap_or(self.len() as u64)
    }

    pub fn has_more(&self) -> bool {
        self.pages.last().is_some_and(|page| page.has_more)
    }

    pub fn last_cursor(&self) -> Option<&str> {
        self.pages.last().and_then(|page| page.next_cursor.as_deref())
    }

    /// `(page, index)` of the row with `id`.
    pub fn position(&self, id: &TxId) -> Option<(usize, usize)> {
        self.pages.iter().enumerate().find_map(|(p, page)| {
            page.items
                .iter()
                .position(|tx| &tx.id == id)
                .map(|i| (p, i))
        })
    }

    pub fn contains(&self, id: &TxId) -> bool {
        self.position(id).is_some()
    }

    /// Puts `tx` ahead of every authoritative row of the first page.
    pub(crate) fn splice_head(&mut self, tx: Transaction) {
        if self.pages.is_empty() {
            self.pages.push(Page::default());
        }
        self.pages[0].items.insert(0, tx);
        if let Some(total) = self.total.as_mut() {
            *total += 1;
        }
    }

    pub(crate) fn remove(&mut self, id: &TxId) -> Option<Transaction> {
        let (p, i) = self.position(id)?;
        let removed = self.pages[p].items.remove(i);
        if let Some(total) = self.total.as_mut() {
            *total = total.saturating_sub(1);
        }
        Some(removed)
    }

    /// Re-inserts `tx` at `(page, index)`, clamped to what the feed holds now.
    pub(crate) fn insert_at(&mut self, (page, index): (usize, usize), tx: Transaction) {
        if self.contains(&tx.id) {
            return;
        }
        if self.pages.is_empty() {
            self.pages.push(Page::default());
        }
        let page = page.min(self.pages.len() - 1);
        let items = &mut self.pages[page].items;
        items.insert(index.min(items.len()), tx);
        if let Some(total) = self.total.as_mut() {
            *total += 1;
        }
    }
}

/// Pre-patch state of one feed, captured by [`CacheStore::patch_all`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FeedSnapshot {
    pub fingerprint: Fingerprint,
    pub pages: Vec<Page>,
    pub total: Option<u64>,
    revision_after: u64,
}

/// What a local patch changed: the feed snapshots plus the local rows it
/// removed, stamped with the session it was made in.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct LocalPatch {
    pub session: u64,
    pub snapshots: Vec<FeedSnapshot>,
    removed: Vec<(usize, Transaction)>,
}

/// Result of applying a fetched page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Applied {
    /// The page was merged; `added` rows are new to the feed.
    Merged { received: usize, added: usize },
    /// The response was stale and dropped.
    Discarded,
}

#[derive(Debug, Default)]
struct StoreState {
    feeds: HashMap<Fingerprint, CachedFeed>,
    /// Outlives `feeds`: a cleared store keeps counting up.
    generations: HashMap<Fingerprint, u64>,
    /// Temporary id -> authoritative id, recorded when a create commits.
    aliases: HashMap<TempId, String>,
    /// Authoritative ids deleted in this session.
    tombstones: HashSet<String>,
    details: HashMap<String, Transaction>,
    /// Rows created on this device that no first page has returned yet,
    /// newest first. New feeds start out with the ones they match.
    locals: Vec<Transaction>,
    /// Bumped by every clear; work started in an older session is dropped.
    session: u64,
    revision: u64,
}

impl StoreState {
    fn touch(&mut self, fp: &Fingerprint) {
        self.revision += 1;
        let revision = self.revision;
        if let Some(feed) = self.feeds.get_mut(fp) {
            feed.revision = revision;
        }
    }

    fn generation(&self, fp: &Fingerprint) -> u64 {
        self.generations.get(fp).copied().unwrap_or(0)
    }

    fn bump(&mut self, fp: &Fingerprint) -> u64 {
        let generation = self.generations.entry(fp.clone()).or_insert(0);
        *generation += 1;
        *generation
    }

    /// Creates a stale feed for `fp`, seeded with the local rows it matches.
    fn ensure(&mut self, fp: &Fingerprint) -> bool {
        if self.feeds.contains_key(fp) {
            return false;
        }
        let mut feed = CachedFeed::placeholder();
        let seeded: Vec<Transaction> = self
            .locals
            .iter()
            .filter(|row| fp.matches(row))
            .cloned()
            .collect();
        if !seeded.is_empty() {
            feed.pages.push(Page {
                items: seeded,
                ..Page::default()
            });
        }
        self.feeds.insert(fp.clone(), feed);
        self.touch(fp);
        true
    }

    fn patch<P, T>(&mut self, predicate: P, mut transform: T) -> Vec<FeedSnapshot>
    where
        P: Fn(&Fingerprint, &CachedFeed) -> bool,
        T: FnMut(&Fingerprint, &mut CachedFeed),
    {
        let matched: Vec<Fingerprint> = self
            .feeds
            .iter()
            .filter(|(fp, feed)| predicate(fp, feed))
            .map(|(fp, _)| fp.clone())
            .collect();

        let mut snapshots = Vec::with_capacity(matched.len());
        for fp in matched {
            self.revision += 1;
            let revision = self.revision;
            let Some(feed) = self.feeds.get_mut(&fp) else {
                continue;
            };
            let snapshot = FeedSnapshot {
                fingerprint: fp.clone(),
                pages: feed.pages.clone(),
                total: feed.total,
                revision_after: revision,
            };
            transform(&fp, feed);
            feed.revision = revision;
            snapshots.push(snapshot);
        }
        snapshots
    }

    fn restore<F>(&mut self, snapshots: &[FeedSnapshot], mut fallback: F)
    where
        F: FnMut(&FeedSnapshot, &mut CachedFeed),
    {
        for snapshot in snapshots {
            let Some(feed) = self.feeds.get_mut(&snapshot.fingerprint) else {
                continue;
            };
            if feed.revision == snapshot.revision_after {
                feed.pages = snapshot.pages.clone();
                feed.total = snapshot.total;
            } else {
                fallback(snapshot, feed);
            }
            self.touch(&snapshot.fingerprint);
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct CacheStore {
    inner: Arc<Mutex<StoreState>>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn read(&self, fp: &Fingerprint) -> Option<CachedFeed> {
        self.state().feeds.get(fp).cloned()
    }

    /// Replaces the pages of `fp` with authoritative data.
    pub fn write(&self, fp: &Fingerprint, pages: Vec<Page>) {
        let mut state = self.state();
        let feed = state.feeds.entry(fp.clone()).or_default();
        feed.pages = pages;
        feed.stale = false;
        feed.error = None;
        state.touch(fp);
    }

    /// Creates an empty stale feed for `fp` unless one exists.
    pub fn ensure(&self, fp: &Fingerprint) -> bool {
        self.state().ensure(fp)
    }

    pub fn fingerprints(&self) -> Vec<Fingerprint> {
        self.state().feeds.keys().cloned().collect()
    }

    /// Applies `transform` to every feed accepted by `predicate` and returns
    /// the pre-patch snapshot of each of them.
    pub fn patch_all<P, T>(&self, predicate: P, transform: T) -> Vec<FeedSnapshot>
    where
        P: Fn(&Fingerprint, &CachedFeed) -> bool,
        T: FnMut(&Fingerprint, &mut CachedFeed),
    {
        self.state().patch(predicate, transform)
    }

    /// Rolls back a [`patch_all`](Self::patch_all).
    ///
    /// A feed nobody wrote to since the patch gets its snapshot back verbatim.
    /// A feed that moved on (a merge, another mutation) gets `fallback`
    /// instead, which must undo only this mutation's own change.
    pub fn restore<F>(&self, snapshots: &[FeedSnapshot], fallback: F)
    where
        F: FnMut(&FeedSnapshot, &mut CachedFeed),
    {
        self.state().restore(snapshots, fallback);
    }

    /// Records a provisional row and splices it at the head of every feed
    /// it matches.
    pub(crate) fn splice_local(&self, row: Transaction) -> LocalPatch {
        let mut state = self.state();
        state.locals.insert(0, row.clone());
        let snapshots = state.patch(
            |fp, _| fp.matches(&row),
            |_, feed| feed.splice_head(row.clone()),
        );
        LocalPatch {
            session: state.session,
            snapshots,
            removed: Vec::new(),
        }
    }

    /// Undoes [`splice_local`](Self::splice_local) after a failed create,
    /// including feeds created in the meantime.
    pub(crate) fn rollback_local(&self, temp: TempId, patch: &LocalPatch) {
        let id = TxId::Temp(temp);
        let mut state = self.state();
        if state.session != patch.session {
            return;
        }
        state.locals.retain(|row| row.id != id);
        state.restore(&patch.snapshots, |_, feed| {
            feed.remove(&id);
        });
        state.patch(
            |_, feed| feed.contains(&id),
            |_, feed| {
                feed.remove(&id);
            },
        );
    }

    /// Removes `rows` from every feed, tombstoning `server_id`.
    pub(crate) fn delete_rows(&self, server_id: Option<&str>, rows: &[TxId]) -> LocalPatch {
        let mut state = self.state();
        if let Some(server_id) = server_id {
            state.tombstones.insert(server_id.to_string());
        }
        let mut removed = Vec::new();
        let mut index = 0;
        state.locals.retain(|row| {
            let keep = !rows.contains(&row.id);
            if !keep {
                removed.push((index, row.clone()));
            }
            index += 1;
            keep
        });
        let snapshots = state.patch(
            |_, feed| rows.iter().any(|row| feed.contains(row)),
            |_, feed| {
                for row in rows {
                    feed.remove(row);
                }
            },
        );
        LocalPatch {
            session: state.session,
            snapshots,
            removed,
        }
    }

    /// Undoes [`delete_rows`](Self::delete_rows), putting every row back
    /// where the snapshot had it. A patch from an older session is ignored.
    pub(crate) fn undelete_rows(&self, server_id: &str, rows: &[TxId], patch: &LocalPatch) {
        let mut state = self.state();
        if state.session != patch.session {
            return;
        }
        state.tombstones.remove(server_id);
        for (index, row) in &patch.removed {
            if state.locals.iter().all(|local| local.id != row.id) {
                let index = (*index).min(state.locals.len());
                state.locals.insert(index, row.clone());
            }
        }
        state.restore(&patch.snapshots, |snapshot, feed| {
            for (p, page) in snapshot.pages.iter().enumerate() {
                for (i, tx) in page.items.iter().enumerate() {
                    if rows.contains(&tx.id) {
                        feed.insert_at((p, i), tx.clone());
                    }
                }
            }
        });
    }

    pub fn generation(&self, fp: &Fingerprint) -> u64 {
        self.state().generation(fp)
    }

    /// The current session; [`clear`](Self::clear) starts a new one.
    pub fn session(&self) -> u64 {
        self.state().session
    }

    /// Bumps the generation of `fp` and marks its pages stale.
    pub fn invalidate(&self, fp: &Fingerprint) -> u64 {
        let mut state = self.state();
        let generation = state.bump(fp);
        if let Some(feed) = state.feeds.get_mut(fp) {
            feed.stale = true;
        }
        generation
    }

    /// Invalidates every cached feed, returning their fingerprints.
    pub fn invalidate_all(&self) -> Vec<Fingerprint> {
        let mut state = self.state();
        let fingerprints: Vec<Fingerprint> = state.feeds.keys().cloned().collect();
        for fp in &fingerprints {
            state.bump(fp);
            if let Some(feed) = state.feeds.get_mut(fp) {
                feed.stale = true;
            }
        }
        fingerprints
    }

    /// Drops every cached page, alias, tombstone and detail, and starts a
    /// new session.
    ///
    /// Generations are bumped rather than reset so that responses issued
    /// before the clear are still recognised as stale.
    pub fn clear(&self) {
        let mut state = self.state();
        state.session += 1;
        let fingerprints: Vec<Fingerprint> = state.feeds.keys().cloned().collect();
        for fp in &fingerprints {
            state.bump(fp);
        }
        state.feeds.clear();
        state.aliases.clear();
        state.tombstones.clear();
        state.details.clear();
        state.locals.clear();
    }

    /// Marks a fetch as started and returns the generation it belongs to.
    pub(crate) fn begin_fetch(&self, fp: &Fingerprint) -> u64 {
        let mut state = self.state();
        state.ensure(fp);
        if let Some(feed) = state.feeds.get_mut(fp) {
            feed.loading = true;
        }
        state.generation(fp)
    }

    /// Cursor for the next page of `fp`, `None` once the feed is exhausted.
    pub(crate) fn next_cursor(&self, fp: &Fingerprint) -> Result<Option<String>, FeedError> {
        let state = self.state();
        match state.feeds.get(fp) {
            Some(feed) if !feed.stale => Ok(feed
                .has_more()
                .then(|| feed.last_cursor().map(str::to_string))
                .flatten()),
            _ => Err(FeedError::StaleFingerprint(fp.to_string())),
        }
    }

    pub(crate) fn fail_fetch(&self, fp: &Fingerprint, generation: u64, err: FeedError) {
        let mut state = self.state();
        let current = state.generation(fp);
        if let Some(feed) = state.feeds.get_mut(fp) {
            feed.loading = false;
            if current == generation {
                feed.error = Some(err);
            }
        }
    }

    /// Replaces the pages of `fp` with a freshly fetched first page.
    ///
    /// Rows created on this device that the page does not contain yet stay
    /// at the head, so an entry the server has not indexed does not vanish.
    /// A committed row stays only while it still sorts within the page; one
    /// that belongs further down is left for the page that returns it.
    pub(crate) fn apply_first(&self, fp: &Fingerprint, generation: u64, page: RemotePage) -> Applied {
        let mut state = self.state();
        let current = state.generation(fp);
        let StoreState {
            feeds,
            aliases,
            tombstones,
            locals,
            ..
        } = &mut *state;
        let Some(feed) = feeds.get_mut(fp) else {
            return Applied::Discarded;
        };
        if current != generation {
            feed.loading = false;
            return Applied::Discarded;
        }

        let fetched: HashSet<&str> = page
            .items
            .iter()
            .filter_map(|tx| tx.id.as_server())
            .collect();
        let boundary = page
            .items
            .last()
            .filter(|_| page.has_more)
            .map(|tx| tx.occurred_on);
        let carry = |row: &Transaction| match row.id.as_temp() {
            Some(temp) => match aliases.get(&temp) {
                Some(server_id) => {
                    !fetched.contains(server_id.as_str())
                        && boundary.is_none_or(|last| row.occurred_on >= last)
                }
                None => row.is_provisional(),
            },
            None => false,
        };
        let carried: Vec<Transaction> = feed
            .items()
            .filter(|&row| carry(row))
            .cloned()
            .collect();
        let in_flight = carried.len() as u64;
        locals.retain(|row| !fp.matches(row) || carry(row));

        let received = page.items.len();
        let mut seen = HashSet::new();
        let mut items = carried;
        for tx in page.items {
            let Some(id) = tx.id.as_server() else {
                continue;
            };
            if tombstones.contains(id) || !seen.insert(id.to_string()) {
                continue;
            }
            items.push(tx);
        }
        let added = seen.len();

        feed.pages = vec![Page {
            items,
            next_cursor: page.next_cursor,
            has_more: page.has_more,
        }];
        feed.total = page.total.map(|total| total + in_flight);
        feed.stale = false;
        feed.loading = false;
        feed.error = None;
        state.touch(fp);
        Applied::Merged { received, added }
    }

    /// Appends a fetched page to `fp`, skipping every id already present.
    ///
    /// An incoming row whose id is the alias of a promoted temporary row is
    /// appended in its fetched position and the temporary row is dropped.
    pub(crate) fn apply_next(
        &self,
        fp: &Fingerprint,
        generation: u64,
        cursor: &str,
        page: RemotePage,
    ) -> Applied {
        let mut state = self.state();
        let current = state.generation(fp);
        let StoreState {
            feeds,
            aliases,
            tombstones,
            locals,
            ..
        } = &mut *state;
        let Some(feed) = feeds.get_mut(fp) else {
            return Applied::Discarded;
        };
        if current != generation || feed.stale || feed.last_cursor() != Some(cursor) {
            feed.loading = false;
            return Applied::Discarded;
        }

        let mut known: HashSet<String> = HashSet::new();
        let mut promoted: HashMap<String, TempId> = HashMap::new();
        for row in feed.items() {
            match &row.id {
                TxId::Server(id) => {
                    known.insert(id.clone());
                }
                TxId::Temp(temp) => {
                    if let Some(server_id) = aliases.get(temp) {
                        promoted.insert(server_id.clone(), *temp);
                    }
                }
            }
        }

        let received = page.items.len();
        let mut appended = Vec::new();
        let mut moved: HashSet<TxId> = HashSet::new();
        let mut added = 0;
        for tx in page.items {
            let Some(id) = tx.id.as_server().map(str::to_string) else {
                continue;
            };
            if tombstones.contains(&id) {
                continue;
            }
            let swapped = promoted.remove(&id).map(TxId::Temp);
            if known.insert(id) {
                if swapped.is_none() {
                    added += 1;
                }
                appended.push(tx);
            }
            moved.extend(swapped);
        }

        if !moved.is_empty() {
            for page in &mut feed.pages {
                page.items.retain(|row| !moved.contains(&row.id));
            }
            locals.retain(|row| !moved.contains(&row.id));
        }
        feed.pages.push(Page {
            items: appended,
            next_cursor: page.next_cursor,
            has_more: page.has_more,
        });
        if let Some(total) = page.total {
            let in_flight = feed.items().filter(|row| row.id.as_temp().is_some()).count() as u64;
            feed.total = Some(total + in_flight);
        }
        feed.loading = false;
        feed.error = None;
        state.touch(fp);
        Applied::Merged { received, added }
    }

    /// Marks the rows of a committed create as confirmed, records the alias
    /// under which the server will return them and caches `created`.
    ///
    /// Returns `None`, changing nothing, once `session` has been cleared.
    pub(crate) fn promote(
        &self,
        session: u64,
        temp: TempId,
        created: &Transaction,
    ) -> Option<Vec<Fingerprint>> {
        let mut state = self.state();
        if state.session != session {
            return None;
        }
        let server_id = created.id.to_string();
        state.details.insert(server_id.clone(), created.clone());
        state.aliases.insert(temp, server_id);
        let id = TxId::Temp(temp);
        for row in state.locals.iter_mut().filter(|row| row.id == id) {
            row.sync = SyncState::Confirmed;
        }
        let mut touched = Vec::new();
        for (fp, feed) in state.feeds.iter_mut() {
            let mut hit = false;
            for row in feed.pages.iter_mut().flat_map(|page| page.items.iter_mut()) {
                if row.id == id {
                    row.sync = SyncState::Confirmed;
                    hit = true;
                }
            }
            if hit {
                touched.push(fp.clone());
            }
        }
        for fp in &touched {
            state.touch(fp);
        }
        Some(touched)
    }

    /// Authoritative id behind `id`, if the server knows it.
    pub fn resolve(&self, id: &TxId) -> Option<String> {
        match id {
            TxId::Server(id) => Some(id.clone()),
            TxId::Temp(temp) => self.state().aliases.get(temp).cloned(),
        }
    }

    /// Temporary id that `server_id` was created under in this session.
    pub fn alias_of(&self, server_id: &str) -> Option<TempId> {
        self.state()
            .aliases
            .iter()
            .find_map(|(temp, id)| (id == server_id).then_some(*temp))
    }

    /// Replaces, in place, every row showing `server_id` or its alias with
    /// the authoritative `tx`. Returns the feeds that held it, or `None` once
    /// `session` has been cleared.
    pub(crate) fn replace_row(
        &self,
        session: u64,
        server_id: &str,
        tx: &Transaction,
    ) -> Option<Vec<Fingerprint>> {
        let mut state = self.state();
        if state.session != session {
            return None;
        }
        let alias = state
            .aliases
            .iter()
            .find_map(|(temp, id)| (id == server_id).then_some(TxId::Temp(*temp)));
        let server = TxId::Server(server_id.to_string());
        let mut touched = Vec::new();
        for (fp, feed) in state.feeds.iter_mut() {
            let mut hit = false;
            for row in feed.pages.iter_mut().flat_map(|page| page.items.iter_mut()) {
                if row.id == server || alias.as_ref() == Some(&row.id) {
                    *row = tx.clone();
                    hit = true;
                }
            }
            if hit {
                touched.push(fp.clone());
            }
        }
        for fp in &touched {
            state.touch(fp);
        }
        Some(touched)
    }

    pub fn detail(&self, server_id: &str) -> Option<Transaction> {
        self.state().details.get(server_id).cloned()
    }

    pub(crate) fn put_detail(&self, session: u64, tx: Transaction) {
        let mut state = self.state();
        if state.session != session {
            return;
        }
        if let Some(id) = tx.id.as_server().map(str::to_string) {
            state.details.insert(id, tx);
        }
    }

    pub(crate) fn evict_detail(&self, server_id: &str) {
        self.state().details.remove(server_id);
    }
}
