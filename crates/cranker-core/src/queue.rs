//! A FIFO socket queue with a companion "alive" membership set.
//!
//! Sockets are hand-offed to whichever request arrives first (`poll` /
//! `poll_timeout`), but any holder of a socket can also deregister it from
//! anywhere (`remove`) without having to walk or rewrite the FIFO. A FIFO
//! entry whose membership has already been removed is a dead "tombstone":
//! `poll`/`poll_timeout` skip past it instead of returning it.

use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Default bounded capacity of a socket queue, matching the router's default.
pub const DEFAULT_QUEUE_CAPACITY: usize = 200;

const OFFER_RETRY_INTERVAL: Duration = Duration::from_secs(300);

/// Anything that can sit in a [`SocketQueue`] needs a stable identity so the
/// queue can track liveness independent of FIFO position.
pub trait QueueItem: Clone + Send + Sync + 'static {
    fn queue_id(&self) -> Uuid;
}

/// FIFO queue of live items plus a concurrent membership set.
///
/// `len()` is the raw FIFO depth (including tombstones); `len_alive()` is the
/// live membership count, which is what callers should treat as the queue's
/// logical size.
pub struct SocketQueue<T: QueueItem> {
    tx: mpsc::Sender<T>,
    rx: parking_lot::Mutex<mpsc::Receiver<T>>,
    alive: DashMap<Uuid, T>,
    alive_count: AtomicI32,
}

impl<T: QueueItem> SocketQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 {
            DEFAULT_QUEUE_CAPACITY
        } else {
            capacity
        };
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: parking_lot::Mutex::new(rx),
            alive: DashMap::new(),
            alive_count: AtomicI32::new(0),
        }
    }

    /// Number of items currently considered alive (distinct from FIFO depth).
    pub fn len_alive(&self) -> usize {
        self.alive_count.load(Ordering::Acquire).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len_alive() == 0
    }

    /// Registers `item` and enqueues it. Never blocks the caller; if the
    /// bounded channel is momentarily full this retries in the background.
    pub fn offer(self: &std::sync::Arc<Self>, item: T) {
        let id = item.queue_id();
        self.alive.insert(id, item.clone());
        self.alive_count.fetch_add(1, Ordering::AcqRel);

        let this = self.clone();
        tokio::spawn(async move {
            let mut item = item;
            loop {
                match tokio::time::timeout(OFFER_RETRY_INTERVAL, this.tx.send(item)).await {
                    Ok(Ok(())) => return,
                    Ok(Err(_)) => {
                        // receiver dropped: queue is gone, drop membership too.
                        this.alive.remove(&id);
                        this.alive_count.fetch_sub(1, Ordering::AcqRel);
                        return;
                    }
                    Err(_) => {
                        warn!(
                            "could not push socket into queue within {:?}, queue may be full, retrying",
                            OFFER_RETRY_INTERVAL
                        );
                        // tx.send consumed `item` only on success; since we hit the
                        // timeout branch we must have a value to retry with. Because
                        // `mpsc::Sender::send` takes ownership, we can't recover the
                        // original value from a cancelled future, so re-fetch our own
                        // stored copy from the alive map instead of looping forever.
                        match this.alive.get(&id) {
                            Some(entry) => item = entry.clone(),
                            None => return,
                        }
                    }
                }
            }
        });
    }

    /// Non-blocking pop of the first live item, skipping tombstones. `None`
    /// if the FIFO is empty of live items right now.
    pub fn poll(&self) -> Option<T> {
        let mut rx = self.rx.lock();
        loop {
            match rx.try_recv() {
                Ok(item) => {
                    let id = item.queue_id();
                    if self.alive.remove(&id).is_some() {
                        self.alive_count.fetch_sub(1, Ordering::AcqRel);
                        return Some(item);
                    }
                    debug!("poll: dropped a dead socket, polling again");
                }
                Err(_) => return None,
            }
        }
    }

    /// Blocking pop with a deadline. Returns `None` on timeout or if the FIFO
    /// drains without producing a live item within the deadline.
    pub async fn poll_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            // try_recv keeps the sync Mutex guard out of scope across the await below.
            let recv_fut = self.rx.lock().try_recv();
            match recv_fut {
                Ok(item) => {
                    let id = item.queue_id();
                    if self.alive.remove(&id).is_some() {
                        self.alive_count.fetch_sub(1, Ordering::AcqRel);
                        return Some(item);
                    }
                    debug!("poll_timeout: dropped a dead socket, polling again");
                    continue;
                }
                Err(mpsc::error::TryRecvError::Empty) => {
                    tokio::time::sleep(Duration::from_millis(10).min(remaining)).await;
                }
                Err(mpsc::error::TryRecvError::Disconnected) => return None,
            }
        }
    }

    /// Removes `item` from the alive set if present. Returns `true` if it was
    /// a member (and is now removed); the FIFO slot becomes a tombstone.
    pub fn remove(&self, item: &T) -> bool {
        let id = item.queue_id();
        if self.alive.remove(&id).is_some() {
            self.alive_count.fetch_sub(1, Ordering::AcqRel);
            true
        } else {
            false
        }
    }

    pub fn remove_by_id(&self, id: Uuid) -> bool {
        if self.alive.remove(&id).is_some() {
            self.alive_count.fetch_sub(1, Ordering::AcqRel);
            true
        } else {
            false
        }
    }

    /// Iterates live members only, in no particular order.
    pub fn range(&self, mut f: impl FnMut(&T) -> bool) {
        for entry in self.alive.iter() {
            if !f(entry.value()) {
                break;
            }
        }
    }

    pub fn alive_snapshot(&self) -> Vec<T> {
        self.alive.iter().map(|e| e.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Clone)]
    struct Sock(Uuid);
    impl QueueItem for Sock {
        fn queue_id(&self) -> Uuid {
            self.0
        }
    }

    #[tokio::test]
    async fn poll_returns_offered_item() {
        let q = Arc::new(SocketQueue::<Sock>::new(10));
        let s = Sock(Uuid::new_v4());
        q.offer(s.clone());
        tokio::task::yield_now().await;
        let polled = q.poll_timeout(Duration::from_secs(1)).await;
        assert_eq!(polled.map(|s| s.0), Some(s.0));
    }

    #[tokio::test]
    async fn removed_item_is_never_polled() {
        let q = Arc::new(SocketQueue::<Sock>::new(10));
        let s = Sock(Uuid::new_v4());
        q.offer(s.clone());
        tokio::task::yield_now().await;
        assert!(q.remove(&s));
        assert_eq!(q.len_alive(), 0);
        let polled = q.poll_timeout(Duration::from_millis(50)).await;
        assert!(polled.is_none());
    }

    #[tokio::test]
    async fn len_alive_tracks_offers_and_removals() {
        let q = Arc::new(SocketQueue::<Sock>::new(10));
        let a = Sock(Uuid::new_v4());
        let b = Sock(Uuid::new_v4());
        q.offer(a.clone());
        q.offer(b.clone());
        tokio::task::yield_now().await;
        assert_eq!(q.len_alive(), 2);
        q.remove(&a);
        assert_eq!(q.len_alive(), 1);
    }

    #[tokio::test]
    async fn poll_timeout_expires_on_empty_queue() {
        let q = Arc::new(SocketQueue::<Sock>::new(10));
        let polled = q.poll_timeout(Duration::from_millis(30)).await;
        assert!(polled.is_none());
    }
}
