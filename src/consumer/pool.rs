//! Worker pool bound to one delivery feed.
//!
//! A pool belongs to exactly one feed. The consumer stamps every pool with a
//! generation; on reconnect it bumps the shared token before the new feed
//! exists, so workers of the old pool stop at their next check instead of
//! lingering on a dead feed.
//!
//! When the last worker returns on its own (the feed ended while the link
//! stayed up, e.g. the broker cancelled the consumer) the pool reports itself
//! exhausted so the consumer can re-announce the queue.

use crate::connection::DeliveryFeed;
use crate::consumer::handler::DeliveryHandler;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

pub(crate) struct WorkerPool {
    generation: u64,
    workers: Vec<JoinHandle<u64>>,
    exhausted: Arc<Notify>,
}

/// Held by each worker for its lifetime; the last one out signals the pool
struct Seat {
    live: Arc<AtomicUsize>,
    exhausted: Arc<Notify>,
}

impl Drop for Seat {
    fn drop(&mut self) {
        if self.live.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.exhausted.notify_one();
        }
    }
}

impl WorkerPool {
    /// Spawn `count` workers that all read from `feed`
    pub(crate) fn spawn(
        feed: DeliveryFeed,
        handler: Arc<dyn DeliveryHandler>,
        count: usize,
        token: Arc<AtomicU64>,
        queue: &str,
    ) -> Self {
        let generation = token.load(Ordering::SeqCst);
        let feed = Arc::new(Mutex::new(feed));
        let live = Arc::new(AtomicUsize::new(count));
        let exhausted = Arc::new(Notify::new());
        let workers = (0..count)
            .map(|worker| {
                let seat = Seat {
                    live: live.clone(),
                    exhausted: exhausted.clone(),
                };
                tokio::spawn(run_worker(
                    worker,
                    generation,
                    feed.clone(),
                    handler.clone(),
                    token.clone(),
                    queue.to_string(),
                    seat,
                ))
            })
            .collect();

        debug!(queue, generation, workers = count, "Worker pool started");
        Self {
            generation,
            workers,
            exhausted,
        }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Resolves once every worker has returned, panics included
    pub(crate) async fn exhausted(&self) {
        self.exhausted.notified().await;
    }

    /// Wait for the workers to finish, aborting the ones still running after `grace`.
    ///
    /// Returns how many deliveries the pool handled.
    pub(crate) async fn join(self, grace: Duration) -> u64 {
        let mut handled = 0;
        let deadline = tokio::time::Instant::now() + grace;
        for mut worker in self.workers {
            match tokio::time::timeout_at(deadline, &mut worker).await {
                Ok(Ok(count)) => handled += count,
                Ok(Err(e)) if e.is_panic() => error!(error = %e, "Worker panicked"),
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!(generation = self.generation, "Worker did not stop in time, aborting");
                    worker.abort();
                }
            }
        }
        handled
    }
}

async fn run_worker(
    worker: usize,
    generation: u64,
    feed: Arc<Mutex<DeliveryFeed>>,
    handler: Arc<dyn DeliveryHandler>,
    token: Arc<AtomicU64>,
    queue: String,
    _seat: Seat,
) -> u64 {
    let mut handled = 0;
    loop {
        if token.load(Ordering::SeqCst) != generation {
            debug!(queue = %queue, worker, generation, "Stale worker exiting");
            break;
        }
        let next = feed.lock().await.next().await;
        match next {
            Some(Ok(delivery)) => {
                if token.load(Ordering::SeqCst) != generation {
                    // The channel it came from is gone; the broker redelivers it
                    debug!(queue = %queue, worker, delivery_tag = delivery.delivery_tag(), "Dropping delivery from replaced feed");
                    break;
                }
                handler.handle(delivery).await;
                handled += 1;
            }
            Some(Err(e)) => {
                error!(queue = %queue, worker, error = %e, "Delivery feed error");
            }
            None => {
                debug!(queue = %queue, worker, generation, handled, "Delivery feed closed");
                break;
            }
        }
    }
    handled
}
