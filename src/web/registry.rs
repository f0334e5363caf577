//! Live log viewers currently connected.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct Entry {
    token: CancellationToken,
    closed: oneshot::Receiver<()>,
}

struct Inner {
    parent: CancellationToken,
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, Entry>>,
}

/// Set of live subscribers. Cloning shares the set.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<Inner>,
}

impl ConnectionRegistry {
    /// Subscriber tokens are children of `parent`, so cancelling it stops
    /// every subscriber too.
    pub fn new(parent: CancellationToken) -> Self {
        Self {
            inner: Arc::new(Inner {
                parent,
                next_id: AtomicU64::new(1),
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn register(&self) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let token = self.inner.parent.child_token();
        let (closed_tx, closed_rx) = oneshot::channel();

        self.lock().insert(
            id,
            Entry {
                token: token.clone(),
                closed: closed_rx,
            },
        );
        debug!(id, "Subscriber registered");

        Subscription {
            id,
            token,
            registry: self.clone(),
            _closed: closed_tx,
        }
    }

    /// Remove a subscriber. Returns false if it was already gone.
    pub fn unregister(&self, id: u64) -> bool {
        let removed = self.lock().remove(&id).is_some();
        if removed {
            debug!(id, "Subscriber unregistered");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel every subscriber and wait up to `grace` for them to finish.
    ///
    /// All subscribers share the same deadline. Returns the number drained; a
    /// subscriber that does not finish in time is logged and skipped.
    pub async fn drain_all(&self, grace: Duration) -> usize {
        let entries: Vec<(u64, Entry)> = self.lock().drain().collect();
        let count = entries.len();

        for (_, entry) in &entries {
            entry.token.cancel();
        }

        future::join_all(entries.into_iter().map(|(id, entry)| async move {
            if tokio::time::timeout(grace, entry.closed).await.is_err() {
                debug!(id, "Subscriber did not close in time");
            }
        }))
        .await;

        if count > 0 {
            debug!(count, "Closed all live log subscribers");
        }
        count
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Entry>> {
        self.inner.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A registered subscriber. Dropping it unregisters.
pub struct Subscription {
    id: u64,
    token: CancellationToken,
    registry: ConnectionRegistry,
    // Dropped with the subscription, which wakes `drain_all`.
    _closed: oneshot::Sender<()>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
    }
}
