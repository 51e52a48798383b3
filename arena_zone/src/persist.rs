//! Coalescing write-behind queues.
//!
//! The tick loop never touches storage: it enqueues the latest state and a
//! worker flushes batches on a drip ticker or a wake signal. Enqueueing the
//! same key twice coalesces to one pending entry; the per-queue cap drops
//! the oldest distinct key to bound memory. Store errors are logged and
//! retried implicitly by later enqueues; they never reach the tick loop.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tracing::{debug, warn};

use arena_shared::ids::{CharacterId, ZoneId};

use crate::store::{CharacterState, CharacterStore, SnapshotStore, ZoneSnapshot};

/// Batch size per worker wake for character saves.
pub const SAVE_BATCH: usize = 256;
/// Drip interval for character saves.
pub const SAVE_DRIP: Duration = Duration::from_millis(250);
/// Batch size per worker wake for snapshots.
pub const SNAPSHOT_BATCH: usize = 8;
/// Drip interval for snapshots.
pub const SNAPSHOT_DRIP: Duration = Duration::from_millis(500);

struct Coalesced<K, V> {
    pending: HashMap<K, V>,
    order: VecDeque<K>,
    max_pending: usize,
}

impl<K: std::hash::Hash + Eq + Copy, V> Coalesced<K, V> {
    fn new(max_pending: usize) -> Self {
        Self {
            pending: HashMap::new(),
            order: VecDeque::new(),
            max_pending: max_pending.max(1),
        }
    }

    fn enqueue(&mut self, key: K, value: V) {
        let existed = self.pending.insert(key, value).is_some();
        if !existed {
            self.order.push_back(key);
            while self.order.len() > self.max_pending {
                if let Some(old) = self.order.pop_front() {
                    self.pending.remove(&old);
                }
            }
        }
    }

    fn take_batch(&mut self, n: usize) -> Vec<V> {
        let mut batch = Vec::new();
        while batch.len() < n {
            let Some(key) = self.order.pop_front() else {
                break;
            };
            if let Some(v) = self.pending.remove(&key) {
                batch.push(v);
            }
        }
        batch
    }

    fn len(&self) -> usize {
        self.pending.len()
    }
}

/// Write-behind queue for character state.
pub struct SaveQueue {
    store: Arc<dyn CharacterStore>,
    inner: Mutex<Coalesced<CharacterId, CharacterState>>,
    wake: Notify,
}

impl SaveQueue {
    pub fn new(store: Arc<dyn CharacterStore>, max_pending: usize) -> Self {
        Self {
            store,
            inner: Mutex::new(Coalesced::new(max_pending)),
            wake: Notify::new(),
        }
    }

    /// O(1); the latest state for a character wins.
    pub fn enqueue(&self, st: CharacterState) {
        self.inner.lock().expect("save queue lock").enqueue(st.cid, st);
        self.wake.notify_one();
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().expect("save queue lock").len()
    }

    async fn flush_some(&self, n: usize) {
        let batch = self.inner.lock().expect("save queue lock").take_batch(n);
        for st in batch {
            if let Err(e) = self.store.save_character(&st).await {
                warn!(cid = st.cid.0, error = %e, "character save failed");
            }
        }
    }

    /// Flushes everything pending right now; shutdown paths and tests.
    pub async fn flush_all(&self) {
        self.flush_some(usize::MAX).await;
    }

    /// Worker loop; drains everything on shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut drip = tokio::time::interval(SAVE_DRIP);
        loop {
            tokio::select! {
                _ = drip.tick() => self.flush_some(SAVE_BATCH).await,
                _ = self.wake.notified() => self.flush_some(SAVE_BATCH).await,
                _ = shutdown.changed() => {
                    self.flush_some(usize::MAX).await;
                    debug!("save queue drained");
                    return;
                }
            }
        }
    }
}

/// Write-behind queue for zone snapshots.
pub struct SnapshotQueue {
    store: Arc<dyn SnapshotStore>,
    inner: Mutex<Coalesced<ZoneId, ZoneSnapshot>>,
    wake: Notify,
}

impl SnapshotQueue {
    pub fn new(store: Arc<dyn SnapshotStore>, max_pending: usize) -> Self {
        Self {
            store,
            inner: Mutex::new(Coalesced::new(max_pending)),
            wake: Notify::new(),
        }
    }

    pub fn enqueue(&self, snap: ZoneSnapshot) {
        self.inner
            .lock()
            .expect("snapshot queue lock")
            .enqueue(snap.zid, snap);
        self.wake.notify_one();
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().expect("snapshot queue lock").len()
    }

    async fn flush_some(&self, n: usize) {
        let batch = self
            .inner
            .lock()
            .expect("snapshot queue lock")
            .take_batch(n);
        for snap in batch {
            if let Err(e) = self.store.save_snapshot(&snap).await {
                warn!(zid = snap.zid.0, error = %e, "snapshot save failed");
            }
        }
    }

    /// Flushes everything pending right now; shutdown paths and tests.
    pub async fn flush_all(&self) {
        self.flush_some(usize::MAX).await;
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut drip = tokio::time::interval(SNAPSHOT_DRIP);
        loop {
            tokio::select! {
                _ = drip.tick() => self.flush_some(SNAPSHOT_BATCH).await,
                _ = self.wake.notified() => self.flush_some(SNAPSHOT_BATCH).await,
                _ = shutdown.changed() => {
                    self.flush_some(usize::MAX).await;
                    debug!("snapshot queue drained");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;
    use arena_shared::ids::CharacterId;

    fn state(cid: u64, hp: u16) -> CharacterState {
        CharacterState {
            cid: CharacterId(cid),
            zid: ZoneId(1),
            x: 0,
            y: 0,
            hp,
            server_tick: 1,
        }
    }

    #[tokio::test]
    async fn enqueue_coalesces_per_character() {
        let store = Arc::new(MemStore::new());
        let q = SaveQueue::new(store.clone(), 100);
        q.enqueue(state(1, 50));
        q.enqueue(state(1, 40));
        q.enqueue(state(2, 99));
        assert_eq!(q.pending_len(), 2);

        q.flush_some(usize::MAX).await;
        assert_eq!(q.pending_len(), 0);
        // The latest enqueue for cid 1 won.
        let st = store.load_character(CharacterId(1)).await.unwrap().unwrap();
        assert_eq!(st.hp, 40);
    }

    #[tokio::test]
    async fn cap_drops_oldest_distinct_key() {
        let store = Arc::new(MemStore::new());
        let q = SaveQueue::new(store.clone(), 2);
        q.enqueue(state(1, 1));
        q.enqueue(state(2, 2));
        q.enqueue(state(3, 3));
        assert_eq!(q.pending_len(), 2);

        q.flush_some(usize::MAX).await;
        assert!(store.load_character(CharacterId(1)).await.unwrap().is_none());
        assert!(store.load_character(CharacterId(3)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn worker_flushes_on_wake_and_drains_on_shutdown() {
        let store = Arc::new(MemStore::new());
        let q = Arc::new(SaveQueue::new(store.clone(), 100));
        let (tx, rx) = watch::channel(false);

        let worker = {
            let q = q.clone();
            tokio::spawn(async move { q.run(rx).await })
        };

        q.enqueue(state(1, 10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.character_count(), 1);

        q.enqueue(state(2, 20));
        tx.send(true).unwrap();
        worker.await.unwrap();
        assert_eq!(store.character_count(), 2);
    }

    #[tokio::test]
    async fn snapshot_queue_coalesces_per_zone() {
        let store = Arc::new(MemStore::new());
        let q = SnapshotQueue::new(store.clone(), 10);
        let snap = |tick| ZoneSnapshot {
            zid: ZoneId(1),
            server_tick: tick,
            entities: Vec::new(),
        };
        q.enqueue(snap(1));
        q.enqueue(snap(2));
        assert_eq!(q.pending_len(), 1);

        q.flush_some(usize::MAX).await;
        let got = store.load_snapshot(ZoneId(1)).await.unwrap().unwrap();
        assert_eq!(got.server_tick, 2);
    }
}
