//! Connection supervisor: one link, one channel, automatic reconnect

use crate::connection::breaker::ReconnectBreaker;
use crate::connection::retry::RetryPolicy;
use crate::connection::transport::{BrokerChannel, BrokerConnector, BrokerLink};
use crate::error::{BrokerError, BrokerResult};
use crate::metrics::{MetricsSink, CONNECTED, RECONNECT_COUNT};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use strum::{Display, EnumString};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

/// Connection state as seen by the owning component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// The retry policy gave up; only a fresh `connect()` leaves this state
    Failed,
}

/// Emitted once per link when it closes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClosedEvent {
    /// Generation of the link that closed
    pub generation: u64,
}

struct Live {
    link: Arc<dyn BrokerLink>,
    channel: Arc<dyn BrokerChannel>,
    generation: u64,
}

/// Owns the broker link and channel of a single notifier or consumer
pub struct ConnectionSupervisor {
    name: String,
    url: String,
    redacted_url: String,
    connector: Arc<dyn BrokerConnector>,
    metrics: Arc<dyn MetricsSink>,
    policy: Arc<dyn RetryPolicy>,
    breaker: ReconnectBreaker,
    live: RwLock<Option<Live>>,
    state: watch::Sender<ConnectionState>,
    generation: AtomicU64,
    closed_tx: mpsc::UnboundedSender<ClosedEvent>,
    closed_rx: Mutex<mpsc::UnboundedReceiver<ClosedEvent>>,
}

impl ConnectionSupervisor {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        connector: Arc<dyn BrokerConnector>,
        metrics: Arc<dyn MetricsSink>,
        policy: Arc<dyn RetryPolicy>,
        breaker: ReconnectBreaker,
    ) -> Self {
        let url = url.into();
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        metrics.set_gauge(CONNECTED, 0.0);

        Self {
            name: name.into(),
            redacted_url: redact(&url),
            url,
            connector,
            metrics,
            policy,
            breaker,
            live: RwLock::new(None),
            state,
            generation: AtomicU64::new(0),
            closed_tx,
            closed_rx: Mutex::new(closed_rx),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Wait until a channel is available; `NotConnected` once reconnect has given up
    pub async fn wait_connected(&self) -> BrokerResult<()> {
        let mut rx = self.state.subscribe();
        let state = *rx
            .wait_for(|state| {
                matches!(state, ConnectionState::Connected | ConnectionState::Failed)
            })
            .await
            .map_err(|_| BrokerError::NotConnected)?;
        match state {
            ConnectionState::Connected => Ok(()),
            _ => Err(BrokerError::NotConnected),
        }
    }

    pub fn breaker(&self) -> &ReconnectBreaker {
        &self.breaker
    }

    pub fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.metrics
    }

    /// Generation of the current (or last) link; bumped by every successful connect
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// The live channel, or `NotConnected`
    pub fn channel(&self) -> BrokerResult<Arc<dyn BrokerChannel>> {
        if self.state() != ConnectionState::Connected {
            return Err(BrokerError::NotConnected);
        }
        self.live
            .read()
            .as_ref()
            .map(|live| live.channel.clone())
            .ok_or(BrokerError::NotConnected)
    }

    /// Dial, open a channel and start watching the link for closure
    pub async fn connect(&self) -> BrokerResult<()> {
        debug!(name = %self.name, url = %self.redacted_url, "Dialing broker");
        let start = Instant::now();

        let link = self.connector.connect(&self.url).await?;
        let channel = match link.open_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                link.close().await;
                return Err(e);
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.live.write() = Some(Live {
            link: link.clone(),
            channel,
            generation,
        });
        self.state.send_replace(ConnectionState::Connected);
        self.metrics.set_gauge(CONNECTED, 1.0);

        let closed_tx = self.closed_tx.clone();
        let name = self.name.clone();
        tokio::spawn(async move {
            link.closed().await;
            info!(name = %name, generation, "Broker link closed");
            let _ = closed_tx.send(ClosedEvent { generation });
        });

        info!(
            name = %self.name,
            url = %self.redacted_url,
            generation,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Connected to broker"
        );
        Ok(())
    }

    /// Wait for the current link to close.
    ///
    /// Events from links that were already replaced are skipped.
    pub async fn closed(&self) -> ClosedEvent {
        let mut rx = self.closed_rx.lock().await;
        loop {
            // The sender lives in `self`, so the channel never reports closed
            let Some(event) = rx.recv().await else {
                futures::future::pending::<()>().await;
                continue;
            };
            if event.generation == self.generation() {
                if let Some(live) = self.live.read().as_ref() {
                    if live.generation == event.generation {
                        self.state.send_replace(ConnectionState::Disconnected);
                        self.metrics.set_gauge(CONNECTED, 0.0);
                    }
                }
                return event;
            }
            debug!(
                name = %self.name,
                stale = event.generation,
                current = self.generation(),
                "Ignoring close of a replaced link"
            );
        }
    }

    /// Reconnect until the retry policy gives up.
    ///
    /// Every failed attempt sets `connected` to 0 and bumps `reconnect_count`;
    /// success sets `connected` to 1 and resets `reconnect_count` to 0.
    pub async fn reconnect(&self) -> BrokerResult<()> {
        self.state.send_replace(ConnectionState::Connecting);
        self.metrics.set_gauge(CONNECTED, 0.0);
        self.drop_live().await;

        let started = Instant::now();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let Some(delay) = self.policy.delay(attempt) else {
                let attempts = attempt - 1;
                error!(
                    name = %self.name,
                    attempts,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Reconnect gave up"
                );
                self.state.send_replace(ConnectionState::Failed);
                return Err(BrokerError::RetriesExhausted { attempts });
            };

            info!(name = %self.name, attempt, delay_ms = delay.as_millis() as u64, "Reconnecting");
            tokio::time::sleep(delay).await;

            while let Err(wait) = self.breaker.try_acquire() {
                debug!(
                    name = %self.name,
                    wait_ms = wait.as_millis() as u64,
                    "Reconnect breaker open, holding off"
                );
                tokio::time::sleep(wait).await;
            }

            match self.connect().await {
                Ok(()) => {
                    self.breaker.record_success();
                    self.metrics.set_gauge(CONNECTED, 1.0);
                    self.metrics.set_gauge(RECONNECT_COUNT, 0.0);
                    info!(
                        name = %self.name,
                        attempt,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Reconnected"
                    );
                    return Ok(());
                }
                Err(e) => {
                    self.breaker.record_failure();
                    self.metrics.set_gauge(CONNECTED, 0.0);
                    self.metrics.increment(RECONNECT_COUNT);
                    error!(
                        name = %self.name,
                        attempt,
                        error = %e,
                        error_code = e.error_code(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Could not reconnect"
                    );
                }
            }
        }
    }

    /// Close the live link so the owner goes through the reconnect path
    pub async fn force_close(&self) {
        self.state.send_replace(ConnectionState::Disconnected);
        self.metrics.set_gauge(CONNECTED, 0.0);
        let link = self.live.read().as_ref().map(|live| live.link.clone());
        if let Some(link) = link {
            warn!(name = %self.name, generation = self.generation(), "Force-closing broker link");
            link.close().await;
        }
    }

    /// Close the link for good
    pub async fn shutdown(&self) {
        self.state.send_replace(ConnectionState::Disconnected);
        self.metrics.set_gauge(CONNECTED, 0.0);
        self.drop_live().await;
    }

    async fn drop_live(&self) {
        let live = self.live.write().take();
        if let Some(live) = live {
            if live.link.is_open() {
                live.link.close().await;
            }
        }
    }
}

impl std::fmt::Debug for ConnectionSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSupervisor")
            .field("name", &self.name)
            .field("url", &self.redacted_url)
            .field("state", &self.state())
            .field("generation", &self.generation())
            .finish()
    }
}

fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            let credentials = &url[scheme_end + 3..at];
            match credentials.find(':') {
                Some(colon) => format!(
                    "{}{}:***{}",
                    &url[..scheme_end + 3],
                    &credentials[..colon],
                    &url[at..]
                ),
                None => url.to_string(),
            }
        }
        _ => url.to_string(),
    }
}
