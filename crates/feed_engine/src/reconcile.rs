//! Delayed authoritative refetches after a mutation commits.
//!
//! One timer per fingerprint. Arming a fingerprint that already has a timer
//! replaces it, so a burst of mutations produces a single refetch once the
//! settle window has passed since the last one.

use std::{
    collections::HashMap,
    future::Future,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::Fingerprint;

/// A pending timer and the token that cancels it.
#[derive(Debug)]
pub struct ScheduledTask {
    token: CancellationToken,
    ticket: u64,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

type Tasks = Arc<Mutex<HashMap<Fingerprint, ScheduledTask>>>;

#[derive(Debug)]
pub struct ReconciliationScheduler {
    window: Duration,
    shutdown: CancellationToken,
    tasks: Tasks,
    tickets: AtomicU64,
}

fn lock(tasks: &Tasks) -> MutexGuard<'_, HashMap<Fingerprint, ScheduledTask>> {
    tasks.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ReconciliationScheduler {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            shutdown: CancellationToken::new(),
            tasks: Arc::new(Mutex::new(HashMap::new())),
            tickets: AtomicU64::new(0),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Runs `on_fire` once the settle window elapses, unless `fp` is
    /// re-armed or cancelled first.
    pub fn arm<F>(&self, fp: Fingerprint, on_fire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.shutdown.child_token();
        let ticket = self.tickets.fetch_add(1, Ordering::Relaxed);
        let window = self.window;
        let tasks = Arc::clone(&self.tasks);
        let task_token = token.clone();
        let task_fp = fp.clone();

        let mut scheduled = lock(&self.tasks);
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = task_token.cancelled() => return,
                _ = tokio::time::sleep(window) => {}
            }
            {
                let mut scheduled = lock(&tasks);
                if scheduled
                    .get(&task_fp)
                    .is_some_and(|task| task.ticket == ticket)
                {
                    scheduled.remove(&task_fp);
                }
            }
            tracing::debug!("reconciling {task_fp}");
            on_fire.await;
        });
        let replaced = scheduled.insert(
            fp,
            ScheduledTask {
                token,
                ticket,
                handle,
            },
        );
        if let Some(previous) = replaced {
            previous.cancel();
        }
    }

    pub fn is_armed(&self, fp: &Fingerprint) -> bool {
        lock(&self.tasks).contains_key(fp)
    }

    pub fn cancel(&self, fp: &Fingerprint) {
        if let Some(task) = lock(&self.tasks).remove(fp) {
            task.cancel();
        }
    }

    pub fn cancel_all(&self) {
        let drained: Vec<ScheduledTask> =
            lock(&self.tasks).drain().map(|(_, task)| task).collect();
        if !drained.is_empty() {
            tracing::info!("cancelled {} reconciliation timer(s)", drained.len());
        }
        for task in drained {
            task.cancel();
        }
    }

    /// Cancels every timer, including ones armed after this call.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        lock(&self.tasks).clear();
    }
}

impl Drop for ReconciliationScheduler {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
