//! Consumer: supervised queue consumption with a worker pool

use crate::config::{ConsumeQueueConfig, ConsumerConfig};
use crate::connection::{
    policy_from_config, BrokerConnector, ConnectionState, ConnectionSupervisor, DeliveryFeed,
    ReconnectBreaker, RetryPolicy,
};
use crate::consumer::handler::DeliveryHandler;
use crate::consumer::pool::WorkerPool;
use crate::error::{BrokerError, BrokerResult};
use crate::metrics::{MetricsSink, PrefixedSink, ANNOUNCE_ERRORS, QUEUE_SIZE};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How long workers get to finish their current delivery on shutdown
const WORKER_GRACE: Duration = Duration::from_secs(30);

struct Inner {
    supervisor: ConnectionSupervisor,
    policy: Arc<dyn RetryPolicy>,
    metrics: Arc<dyn MetricsSink>,
    queue_name: String,
    prefetch: u16,
    queue_size_interval: Duration,
}

/// Consumes one queue through a supervised connection.
///
/// Metrics are reported under a `<queue>_` prefix so several consumers can
/// share one sink. Clones share the same connection.
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<Inner>,
}

impl Consumer {
    pub fn new(
        config: ConsumerConfig,
        queue_name: &str,
        prefetch: u16,
        connector: Arc<dyn BrokerConnector>,
        metrics: Arc<dyn MetricsSink>,
    ) -> BrokerResult<Self> {
        let policy = policy_from_config(&config.retry, config.reconnect_delay());
        Self::with_policy(config, queue_name, prefetch, connector, metrics, policy)
    }

    /// Same as [`Consumer::new`] with an explicit reconnect policy
    pub fn with_policy(
        config: ConsumerConfig,
        queue_name: &str,
        prefetch: u16,
        connector: Arc<dyn BrokerConnector>,
        metrics: Arc<dyn MetricsSink>,
        policy: Arc<dyn RetryPolicy>,
    ) -> BrokerResult<Self> {
        config.validate()?;
        if queue_name.is_empty() {
            return Err(BrokerError::Configuration(
                "consumer queue name is required".to_string(),
            ));
        }
        if prefetch == 0 {
            return Err(BrokerError::Configuration(
                "consumer prefetch must be greater than 0".to_string(),
            ));
        }

        let metrics: Arc<dyn MetricsSink> = Arc::new(PrefixedSink::new(metrics, queue_name));
        let name = format!("consumer:{}", queue_name);
        let breaker = ReconnectBreaker::new(name.clone(), config.retry.breaker.clone(), metrics.clone());
        let supervisor = ConnectionSupervisor::new(
            name,
            config.conn.url(),
            connector,
            metrics.clone(),
            policy.clone(),
            breaker,
        );
        metrics.set_gauge(ANNOUNCE_ERRORS, 0.0);

        info!(
            queue = queue_name,
            prefetch,
            url = %config.conn.redacted_url(),
            "Consumer created"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                supervisor,
                policy,
                metrics,
                queue_name: queue_name.to_string(),
                prefetch,
                queue_size_interval: Duration::from_secs(config.queue_size_interval_secs),
            }),
        })
    }

    /// Build a consumer from the `[queue]` section
    pub fn from_queue_config(
        config: ConsumerConfig,
        queue: &ConsumeQueueConfig,
        connector: Arc<dyn BrokerConnector>,
        metrics: Arc<dyn MetricsSink>,
    ) -> BrokerResult<Self> {
        queue.validate()?;
        Self::new(config, &queue.name, queue.prefetch_count, connector, metrics)
    }

    pub fn queue_name(&self) -> &str {
        &self.inner.queue_name
    }

    pub fn prefetch(&self) -> u16 {
        self.inner.prefetch
    }

    pub fn supervisor(&self) -> &ConnectionSupervisor {
        &self.inner.supervisor
    }

    /// The prefixed sink this consumer reports to
    pub fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.inner.metrics
    }

    pub async fn connect(&self) -> BrokerResult<()> {
        self.inner.supervisor.connect().await
    }

    /// Declare `queue`, apply the prefetch limit and open a delivery feed.
    ///
    /// Exchange binding is not performed; `routing_key` is only logged.
    pub async fn announce_queue(&self, queue: &str, routing_key: &str) -> BrokerResult<DeliveryFeed> {
        let start = Instant::now();
        match self.try_announce(queue, routing_key).await {
            Ok(feed) => {
                self.inner.metrics.set_gauge(ANNOUNCE_ERRORS, 0.0);
                info!(
                    queue,
                    routing_key,
                    prefetch = self.inner.prefetch,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Consuming queue"
                );
                Ok(feed)
            }
            Err(e) => {
                self.inner.metrics.increment(ANNOUNCE_ERRORS);
                error!(
                    queue,
                    routing_key,
                    error = %e,
                    error_code = e.error_code(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Could not announce queue"
                );
                Err(e)
            }
        }
    }

    async fn try_announce(&self, queue: &str, routing_key: &str) -> BrokerResult<DeliveryFeed> {
        let channel = self.inner.supervisor.channel()?;

        let declared = channel.queue_declare(queue).await?;
        debug!(
            queue,
            routing_key,
            messages = declared.messages,
            consumers = declared.consumers,
            "Queue declared"
        );

        channel.basic_qos(self.inner.prefetch).await?;

        let consumer_tag = format!("rbmq-link-{}", Uuid::new_v4());
        channel.basic_consume(queue, &consumer_tag).await
    }

    /// Broker-reported backlog of `queue`
    pub async fn queue_size(&self, queue: &str) -> BrokerResult<u32> {
        let channel = self.inner.supervisor.channel()?;
        channel.queue_size(queue).await.map_err(|e| {
            error!(queue, error = %e, "Cannot inspect queue");
            e
        })
    }

    /// Run `worker_count` workers over `feed` until shut down.
    ///
    /// When the connection closes, the current pool is retired, the
    /// connection re-established and the queue announced again; the new
    /// feed gets a fresh pool. Announce failures go back through the retry
    /// policy. If the policy gives up the handle stops and no worker is left
    /// attached to a dead feed.
    pub fn handle<H: DeliveryHandler>(
        &self,
        feed: DeliveryFeed,
        handler: H,
        worker_count: usize,
        queue: &str,
        routing_key: &str,
    ) -> BrokerResult<ConsumerHandle> {
        if worker_count == 0 {
            return Err(BrokerError::Configuration(
                "worker count must be greater than 0".to_string(),
            ));
        }

        let handler: Arc<dyn DeliveryHandler> = Arc::new(handler);
        let token = Arc::new(AtomicU64::new(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let pool = WorkerPool::spawn(feed, handler.clone(), worker_count, token.clone(), queue);
        let supervision = tokio::spawn(supervise(
            self.clone(),
            pool,
            handler,
            worker_count,
            token.clone(),
            queue.to_string(),
            routing_key.to_string(),
            shutdown_rx.clone(),
        ));
        let sampler = tokio::spawn(sample_queue_size(self.clone(), shutdown_rx));

        Ok(ConsumerHandle {
            queue: queue.to_string(),
            token,
            shutdown_tx,
            supervision: Some(supervision),
            sampler,
        })
    }

    /// Connect when needed, announce `queue` and start handling it.
    ///
    /// Announce failure here is returned to the caller rather than retried.
    pub async fn init_queue<H: DeliveryHandler>(
        &self,
        handler: H,
        worker_count: usize,
        queue: &str,
        routing_key: &str,
    ) -> BrokerResult<ConsumerHandle> {
        if self.inner.supervisor.state() != ConnectionState::Connected {
            self.connect().await?;
        }
        let feed = self.announce_queue(queue, routing_key).await?;
        let handle = self.handle(feed, handler, worker_count, queue, routing_key)?;
        info!(queue, workers = worker_count, "Consumer initialised");
        Ok(handle)
    }

    /// Reconnect and announce until a feed is open; `None` once the policy gives up
    async fn recover(&self, queue: &str, routing_key: &str) -> Option<DeliveryFeed> {
        let mut announce_failures: u32 = 0;
        loop {
            if let Err(e) = self.inner.supervisor.reconnect().await {
                error!(queue, error = %e, "Consumer gave up reconnecting");
                return None;
            }
            match self.announce_queue(queue, routing_key).await {
                Ok(feed) => return Some(feed),
                Err(e) => {
                    announce_failures += 1;
                    if self.inner.policy.delay(announce_failures).is_none() {
                        error!(
                            queue,
                            error = %e,
                            attempts = announce_failures,
                            "Consumer gave up announcing queue"
                        );
                        return None;
                    }
                    warn!(queue, attempt = announce_failures, "Announce failed after reconnect, reconnecting again");
                }
            }
        }
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("queue", &self.inner.queue_name)
            .field("prefetch", &self.inner.prefetch)
            .field("supervisor", &self.inner.supervisor)
            .finish()
    }
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[allow(clippy::too_many_arguments)]
async fn supervise(
    consumer: Consumer,
    mut pool: WorkerPool,
    handler: Arc<dyn DeliveryHandler>,
    worker_count: usize,
    token: Arc<AtomicU64>,
    queue: String,
    routing_key: String,
    mut shutdown: watch::Receiver<bool>,
) {
    let supervisor = &consumer.inner.supervisor;
    let mut handled = 0;
    loop {
        tokio::select! {
            biased;
            _ = stopped(&mut shutdown) => break,
            event = supervisor.closed() => {
                info!(queue = %queue, generation = event.generation, "Consumer connection closed");
            }
            _ = pool.exhausted() => {
                warn!(queue = %queue, generation = pool.generation(), "Delivery feed ended while connected, re-announcing queue");
            }
        }

        // Retire the pool before the new feed exists
        token.fetch_add(1, Ordering::SeqCst);
        handled += pool.join(WORKER_GRACE).await;

        let recovered = tokio::select! {
            _ = stopped(&mut shutdown) => None,
            feed = consumer.recover(&queue, &routing_key) => feed,
        };
        let Some(feed) = recovered else {
            supervisor.shutdown().await;
            info!(queue = %queue, handled, "Consumer stopped");
            return;
        };
        pool = WorkerPool::spawn(feed, handler.clone(), worker_count, token.clone(), &queue);
        info!(queue = %queue, generation = pool.generation(), "Consumer reconnected, workers relaunched");
    }

    token.fetch_add(1, Ordering::SeqCst);
    // Closing the link ends the feed, which lets idle workers return
    supervisor.shutdown().await;
    handled += pool.join(WORKER_GRACE).await;
    info!(queue = %queue, handled, "Consumer stopped");
}

async fn sample_queue_size(consumer: Consumer, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(consumer.inner.queue_size_interval);
    loop {
        tokio::select! {
            _ = stopped(&mut shutdown) => break,
            _ = ticker.tick() => {
                if consumer.inner.supervisor.state() != ConnectionState::Connected {
                    continue;
                }
                if let Ok(size) = consumer.queue_size(&consumer.inner.queue_name).await {
                    consumer.inner.metrics.set_gauge(QUEUE_SIZE, size as f64);
                }
            }
        }
    }
}

/// Running consumer; dropping it leaves the workers running
#[derive(Debug)]
pub struct ConsumerHandle {
    queue: String,
    token: Arc<AtomicU64>,
    shutdown_tx: watch::Sender<bool>,
    supervision: Option<JoinHandle<()>>,
    sampler: JoinHandle<()>,
}

impl ConsumerHandle {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Generation of the current worker pool; bumped on every reconnect
    pub fn generation(&self) -> u64 {
        self.token.load(Ordering::SeqCst)
    }

    /// Whether the supervision task has stopped (shutdown or retry policy exhausted)
    pub fn is_finished(&self) -> bool {
        self.supervision
            .as_ref()
            .map_or(true, |supervision| supervision.is_finished())
    }

    /// Stop the workers and the supervision task, closing the connection
    pub async fn shutdown(self) {
        self.shutdown_tx.send_replace(true);
        if let Some(supervision) = self.supervision {
            if let Err(e) = supervision.await {
                warn!(queue = %self.queue, error = %e, "Consumer supervision task failed");
            }
        }
        let _ = self.sampler.await;
    }

    /// Wait until the supervision task stops on its own
    pub async fn wait(&mut self) {
        if let Some(supervision) = self.supervision.take() {
            if let Err(e) = supervision.await {
                warn!(queue = %self.queue, error = %e, "Consumer supervision task failed");
            }
        }
    }
}
