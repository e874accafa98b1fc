//! Notifier: staged, supervised publishing

use crate::config::NotifierConfig;
use crate::connection::{
    policy_from_config, BrokerConnector, ConnectionState, ConnectionSupervisor, ReconnectBreaker,
    RetryPolicy,
};
use crate::error::{BrokerError, BrokerResult};
use crate::metrics::{MetricsSink, PENDING_BUFFER_SIZE, PUBLISH_ERRORS, READING_BUFFER_SIZE};
use crate::notifier::buffer::{InFlight, PendingBuffer};
use crate::notifier::message::OutboundMessage;
use crate::notifier::snapshot;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Consecutive failures after which the head message is moved to the tail
const HEAD_FAILURE_LIMIT: u32 = 3;

struct Shared {
    supervisor: ConnectionSupervisor,
    pending: PendingBuffer,
    metrics: Arc<dyn MetricsSink>,
    staging_capacity: usize,
    /// Message taken off staging by the forwarder and waiting for a pending slot
    held: AtomicUsize,
}

impl Shared {
    fn update_pending_gauge(&self) {
        self.metrics
            .set_gauge(PENDING_BUFFER_SIZE, self.pending.len() as f64);
    }
}

/// Publisher that hides broker outages from its callers.
///
/// Messages go through two bounded buffers: `publish` drops them into the
/// staging buffer, a forwarder moves them into the sequence-stamped pending
/// buffer, and a single publish loop drains pending into the broker. A failed
/// declare or publish puts the message back, force-closes the connection and
/// waits for the supervisor to reconnect. A message that fails three times in
/// a row is moved behind the rest of the buffer so it cannot hold up later
/// messages forever.
pub struct Notifier {
    shared: Arc<Shared>,
    staging_tx: mpsc::Sender<OutboundMessage>,
    staging_rx: Arc<Mutex<mpsc::Receiver<OutboundMessage>>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    snapshot_path: Option<PathBuf>,
}

impl Notifier {
    /// Connect, restore the snapshot and start the background loops.
    ///
    /// The first connect happens before any loop is spawned; failing it
    /// returns the dial or channel error to the caller.
    pub async fn start(
        config: NotifierConfig,
        connector: Arc<dyn BrokerConnector>,
        metrics: Arc<dyn MetricsSink>,
    ) -> BrokerResult<Self> {
        let policy = policy_from_config(&config.retry, config.reconnect_delay());
        Self::start_with_policy(config, connector, metrics, policy).await
    }

    /// Same as [`Notifier::start`] with an explicit reconnect policy
    pub async fn start_with_policy(
        config: NotifierConfig,
        connector: Arc<dyn BrokerConnector>,
        metrics: Arc<dyn MetricsSink>,
        policy: Arc<dyn RetryPolicy>,
    ) -> BrokerResult<Self> {
        config.validate()?;

        let breaker = ReconnectBreaker::new("notifier", config.retry.breaker.clone(), metrics.clone());
        let supervisor = ConnectionSupervisor::new(
            "notifier",
            config.conn.url(),
            connector,
            metrics.clone(),
            policy,
            breaker,
        );
        supervisor.connect().await?;

        let restored = match &config.pending_buffer_path {
            Some(path) => restore(path).await,
            None => Vec::new(),
        };

        let shared = Arc::new(Shared {
            supervisor,
            pending: PendingBuffer::new(config.chan_capacity),
            metrics: metrics.clone(),
            staging_capacity: config.chan_capacity,
            held: AtomicUsize::new(0),
        });
        metrics.set_gauge(PUBLISH_ERRORS, 0.0);
        shared.update_pending_gauge();

        let (staging_tx, staging_rx) = mpsc::channel(config.chan_capacity);
        let staging_rx = Arc::new(Mutex::new(staging_rx));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let publish_loop = tokio::spawn(run_publish_loop(shared.clone(), shutdown_rx.clone()));
        let forwarder = tokio::spawn(run_forwarder(
            shared.clone(),
            staging_rx.clone(),
            restored,
            shutdown_rx.clone(),
        ));
        let sampler = tokio::spawn(run_gauge_sampler(
            shared.clone(),
            staging_tx.downgrade(),
            Duration::from_millis(config.gauge_interval_ms),
            shutdown_rx,
        ));

        info!(
            url = %config.conn.redacted_url(),
            capacity = config.chan_capacity,
            snapshot = ?config.pending_buffer_path,
            "Notifier started"
        );

        Ok(Self {
            shared,
            staging_tx,
            staging_rx,
            shutdown_tx,
            tasks: parking_lot::Mutex::new(vec![publish_loop, forwarder, sampler]),
            snapshot_path: config.pending_buffer_path,
        })
    }

    /// Stage a message, waiting for a free slot when the buffer is full.
    ///
    /// An empty destination queue is rejected before anything is buffered.
    pub async fn publish(&self, message: OutboundMessage) -> BrokerResult<()> {
        message.validate().map_err(|e| {
            error!(error = %e, event_tag = message.event_tag_or_empty(), "Rejected outbound message");
            e
        })?;
        if *self.shutdown_tx.borrow() {
            return Err(BrokerError::Shutdown);
        }
        self.staging_tx
            .send(message)
            .await
            .map_err(|_| BrokerError::Shutdown)
    }

    /// Stage a message without waiting; a full buffer is `BufferFull`
    pub fn try_publish(&self, message: OutboundMessage) -> BrokerResult<()> {
        message.validate()?;
        if *self.shutdown_tx.borrow() {
            return Err(BrokerError::Shutdown);
        }
        self.staging_tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => BrokerError::BufferFull,
            mpsc::error::TrySendError::Closed(_) => BrokerError::Shutdown,
        })
    }

    /// Broker-reported backlog of `queue`.
    ///
    /// On a closed channel this waits for the publish loop to reconnect and
    /// tries once more. After shutdown it fails with `Shutdown`.
    pub async fn queue_size(&self, queue: &str) -> BrokerResult<u32> {
        let mut shutdown = self.shutdown_tx.subscribe();
        if *shutdown.borrow_and_update() {
            return Err(BrokerError::Shutdown);
        }
        let supervisor = &self.shared.supervisor;
        let first = match supervisor.channel() {
            Ok(channel) => channel.queue_size(queue).await,
            Err(e) => Err(e),
        };
        let result = match first {
            Err(e) if supervisor.state() != ConnectionState::Connected => {
                info!(queue, error = %e, "Waiting for reconnect before inspecting queue");
                tokio::select! {
                    biased;
                    _ = stopped(&mut shutdown) => return Err(BrokerError::Shutdown),
                    connected = supervisor.wait_connected() => connected?,
                }
                supervisor.channel()?.queue_size(queue).await
            }
            other => other,
        };
        result.map_err(|e| {
            error!(queue, error = %e, error_code = e.error_code(), "Cannot inspect queue");
            e
        })
    }

    /// Messages waiting in the pending buffer
    pub fn pending_len(&self) -> usize {
        self.shared.pending.len()
    }

    /// Messages waiting in the staging buffer
    pub fn staging_len(&self) -> usize {
        self.shared.staging_capacity - self.staging_tx.capacity()
    }

    /// Messages accepted by `publish` and not yet confirmed by the broker,
    /// including the one the forwarder holds while the pending buffer is full
    pub fn unpublished(&self) -> usize {
        self.staging_len()
            + self.shared.held.load(Ordering::SeqCst)
            + self.shared.pending.in_use()
    }

    pub fn supervisor(&self) -> &ConnectionSupervisor {
        &self.shared.supervisor
    }

    /// Stop the loops and return how many buffered messages were drained.
    ///
    /// With a snapshot path configured, buffered messages are written there
    /// for the next start. Calling it twice is harmless.
    pub async fn shutdown(&self) -> BrokerResult<usize> {
        if self.shutdown_tx.send_replace(true) {
            return Ok(0);
        }
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Notifier task ended abnormally");
            }
        }

        let mut drained = self.shared.pending.drain();
        {
            let mut staging = self.staging_rx.lock().await;
            staging.close();
            while let Ok(message) = staging.try_recv() {
                drained.push(message);
            }
        }
        self.shared.update_pending_gauge();
        self.shared.metrics.set_gauge(READING_BUFFER_SIZE, 0.0);

        match &self.snapshot_path {
            Some(path) if !drained.is_empty() => snapshot::write_snapshot(path, &drained).await?,
            Some(_) => {}
            None if !drained.is_empty() => {
                warn!(count = drained.len(), "No snapshot path; buffered messages dropped");
            }
            None => {}
        }
        self.shared.supervisor.shutdown().await;

        info!(drained = drained.len(), "Notifier stopped");
        Ok(drained.len())
    }

    /// Wait for ctrl-c or SIGTERM, then shut down
    pub async fn shutdown_on_signal(&self) -> BrokerResult<usize> {
        crate::telemetry::shutdown_signal().await;
        info!("Shutdown signal received");
        self.shutdown().await
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("supervisor", &self.shared.supervisor)
            .field("pending", &self.pending_len())
            .field("staging", &self.staging_len())
            .finish()
    }
}

async fn restore(path: &std::path::Path) -> Vec<OutboundMessage> {
    match snapshot::read_snapshot(path).await {
        Ok(messages) => {
            if !messages.is_empty() {
                info!(path = %path.display(), count = messages.len(), "Restored pending buffer snapshot");
            }
            if let Err(e) = snapshot::remove_snapshot(path).await {
                warn!(path = %path.display(), error = %e, "Cannot remove pending buffer snapshot");
            }
            messages
        }
        Err(e) => {
            error!(path = %path.display(), error = %e, "Cannot read pending buffer snapshot");
            Vec::new()
        }
    }
}

async fn run_forwarder(
    shared: Arc<Shared>,
    staging_rx: Arc<Mutex<mpsc::Receiver<OutboundMessage>>>,
    restored: Vec<OutboundMessage>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut staging = staging_rx.lock().await;
    // Snapshot messages are older than anything staged, so they go first
    let mut backlog = restored.into_iter();

    loop {
        let message = match backlog.next() {
            Some(message) => message,
            None => tokio::select! {
                _ = stopped(&mut shutdown) => break,
                received = staging.recv() => match received {
                    Some(message) => message,
                    None => break,
                },
            },
        };

        shared.held.store(1, Ordering::SeqCst);
        let stopping = tokio::select! {
            _ = shared.pending.reserve() => {
                shared.pending.insert_reserved(message);
                false
            }
            _ = stopped(&mut shutdown) => {
                // Over capacity is fine here, the buffers are about to be drained
                shared.pending.push_overflow(message);
                for message in backlog.by_ref() {
                    shared.pending.push_overflow(message);
                }
                true
            }
        };
        shared.held.store(0, Ordering::SeqCst);
        if stopping {
            break;
        }
        shared.update_pending_gauge();
        debug!(pending = shared.pending.len(), "Forwarded message to pending buffer");
    }
    debug!("Notifier forwarder stopped");
}

async fn run_publish_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    // Sequence number of the message at the head and how often it failed in a row
    let mut head_failures: Option<(u64, u32)> = None;
    loop {
        tokio::select! {
            biased;
            _ = stopped(&mut shutdown) => break,
            event = shared.supervisor.closed() => {
                info!(generation = event.generation, "Notifier connection closed");
                if !reconnect(&shared, &mut shutdown).await {
                    break;
                }
            }
            in_flight = shared.pending.pop() => {
                match publish_one(&shared, &in_flight).await {
                    Ok(elapsed) => {
                        info!(
                            queue = %in_flight.message.queue_name,
                            event_tag = in_flight.message.event_tag_or_empty(),
                            bytes = in_flight.message.payload.len(),
                            elapsed_ms = elapsed.as_millis() as u64,
                            "Published"
                        );
                        head_failures = None;
                        shared.pending.complete(in_flight);
                        shared.update_pending_gauge();
                    }
                    Err(e) => {
                        let failures = match head_failures {
                            Some((seq, failures)) if seq == in_flight.seq => failures + 1,
                            _ => 1,
                        };
                        error!(
                            queue = %in_flight.message.queue_name,
                            error = %e,
                            error_code = e.error_code(),
                            attempt = failures,
                            "Publish failed, message requeued"
                        );
                        if failures >= HEAD_FAILURE_LIMIT {
                            let queue = in_flight.message.queue_name.clone();
                            let seq = shared.pending.defer(in_flight);
                            warn!(
                                queue = %queue,
                                failures,
                                seq,
                                "Message keeps failing, moved behind the rest of the buffer"
                            );
                            head_failures = None;
                        } else {
                            head_failures = Some((in_flight.seq, failures));
                            shared.pending.requeue(in_flight);
                        }
                        shared.update_pending_gauge();
                        shared.supervisor.force_close().await;
                        shared.metrics.increment(PUBLISH_ERRORS);

                        let recovered = tokio::select! {
                            _ = stopped(&mut shutdown) => false,
                            _ = shared.supervisor.closed() => reconnect(&shared, &mut shutdown).await,
                        };
                        if !recovered {
                            break;
                        }
                    }
                }
            }
        }
    }
    debug!("Notifier publish loop stopped");
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Reconnect unless shutdown arrives first; `false` stops the publish loop
async fn reconnect(shared: &Shared, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = stopped(shutdown) => false,
        result = shared.supervisor.reconnect() => match result {
            Ok(()) => {
                info!(pending = shared.pending.len(), "Notifier reconnected");
                true
            }
            Err(e) => {
                error!(
                    error = %e,
                    pending = shared.pending.len(),
                    "Notifier gave up reconnecting; messages stay buffered until shutdown"
                );
                false
            }
        },
    }
}

async fn publish_one(shared: &Shared, in_flight: &InFlight) -> BrokerResult<Duration> {
    let start = Instant::now();
    let message = &in_flight.message;
    let channel = shared.supervisor.channel()?;
    channel.queue_declare(&message.queue_name).await?;
    channel
        .basic_publish(&message.queue_name, &message.payload, message.priority)
        .await?;
    Ok(start.elapsed())
}

async fn run_gauge_sampler(
    shared: Arc<Shared>,
    staging: mpsc::WeakSender<OutboundMessage>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = stopped(&mut shutdown) => break,
            _ = ticker.tick() => {
                let Some(staging) = staging.upgrade() else {
                    break;
                };
                let staged = shared.staging_capacity - staging.capacity();
                shared.metrics.set_gauge(READING_BUFFER_SIZE, staged as f64);
                shared.update_pending_gauge();
            }
        }
    }
}
