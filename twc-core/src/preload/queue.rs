//! Per-session prefetch queues.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::Preloader;
use crate::cache::{Expiry, Pool, spawn_reaper};
use crate::pieces::PieceRequest;

/// Bounded queue of pieces to preload, drained by a fixed set of workers.
///
/// Pushing waits while every worker is busy and the buffer is full, which
/// keeps a single reader from flooding the sources.
pub struct PrefetchQueue {
    sender: async_channel::Sender<PieceRequest>,
    workers: Vec<JoinHandle<()>>,
}

impl PrefetchQueue {
    pub fn new(preloader: Arc<dyn Preloader>, workers: usize) -> Self {
        let workers = workers.max(1);
        let (sender, receiver) = async_channel::bounded::<PieceRequest>(workers);

        let workers = (0..workers)
            .map(|worker_id| {
                let receiver = receiver.clone();
                let preloader = Arc::clone(&preloader);
                tokio::spawn(async move {
                    while let Ok(request) = receiver.recv().await {
                        if let Err(e) = preloader.preload(&request).await {
                            if !e.is_cancelled() {
                                warn!(
                                    "Prefetch worker {} failed to preload piece {}: {}",
                                    worker_id, request.piece_hash, e
                                );
                            }
                        }
                    }
                    debug!("Prefetch worker {} stopped", worker_id);
                })
            })
            .collect();

        Self { sender, workers }
    }

    /// Enqueues a piece, waiting for room.
    ///
    /// Returns `false` once the queue is closed.
    pub async fn push(&self, request: PieceRequest) -> bool {
        self.sender.send(request).await.is_ok()
    }

    /// Enqueues a piece only if there is room right now.
    pub fn try_push(&self, request: PieceRequest) -> bool {
        self.sender.try_send(request).is_ok()
    }

    /// Stops accepting pieces. Workers finish what is already queued.
    pub fn close(&self) {
        self.sender.close();
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for PrefetchQueue {
    fn drop(&mut self) {
        self.sender.close();
    }
}

/// Prefetch queues keyed by reader session.
///
/// A queue is closed once its session has been idle for the pool TTL.
pub struct PrefetchQueuePool {
    preloader: Arc<dyn Preloader>,
    workers: usize,
    pool: Arc<Pool<String, Arc<PrefetchQueue>>>,
    reaper: JoinHandle<()>,
}

impl PrefetchQueuePool {
    pub fn new(preloader: Arc<dyn Preloader>, workers: usize, ttl: Duration, reap_interval: Duration) -> Self {
        let pool = Arc::new(Pool::<String, Arc<PrefetchQueue>>::new("prefetch_queues", Expiry::Sliding(ttl)));
        let reaper = spawn_reaper(&pool, reap_interval, |session: String, cell| {
            if let Some(queue) = cell.get() {
                debug!("Closing idle prefetch queue of session {}", session);
                queue.close();
            }
        });
        Self {
            preloader,
            workers,
            pool,
            reaper,
        }
    }

    /// The queue of `session`, created on first use.
    pub fn queue(&self, session: &str) -> Arc<PrefetchQueue> {
        self.pool.get_or_insert_with(&session.to_string(), || {
            Arc::new(PrefetchQueue::new(Arc::clone(&self.preloader), self.workers))
        })
    }

    /// Enqueues a piece on the queue of `session`.
    pub async fn push(&self, session: &str, request: PieceRequest) -> bool {
        self.queue(session).push(request).await
    }

    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    /// Closes every queue.
    pub fn close_all(&self) {
        for (_, cell) in self.pool.drain() {
            if let Some(queue) = cell.get() {
                queue.close();
            }
        }
    }
}

impl Drop for PrefetchQueuePool {
    fn drop(&mut self) {
        self.reaper.abort();
        self.close_all();
    }
}
