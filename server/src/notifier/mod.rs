//! Change notification.
//!
//! Each [`Subscription`] is driven by one background task running a small
//! state machine:
//!
//! ```text
//! Init ──remote configured──▶ Subscribing ──confirmed──▶ Subscribed
//!  │                              │ error/closed/timeout      │ error/closed
//!  └──────remote missing─────────▶└──────────▶ Polling ◀──────┘
//! ```
//!
//! Any state moves to `Unsubscribed` when the subscription is dropped or
//! explicitly unsubscribed. In every live state, update markers written by
//! other contexts trigger a read-through and a `local-broadcast` event.

mod broadcast;
mod registry;

pub use broadcast::LocalBroadcast;
pub use registry::{SubscriptionEntry, SubscriptionRegistry};

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tandem_engine::{CacheEntry, ChangeEvent, Entity, EventSource, EventType, Stamp};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast as tokio_broadcast, mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};

use crate::cache::storage::lock;
use crate::coordinator::SyncCoordinator;
use crate::error::{ErrorKind, RemoteError, SyncError};
use crate::remote::{ChannelStatus, LiveChannel, LiveCloser, RemoteStore};
use crate::scheduler::TaskHandle;

/// Lifecycle of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Init,
    Subscribing,
    Subscribed,
    Polling,
    /// Terminal
    Unsubscribed,
}

/// One recorded state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Transition {
    pub from: SubscriptionState,
    pub to: SubscriptionState,
    pub at: Stamp,
}

/// Notifier timings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotifierConfig {
    /// Budget for opening and confirming a live channel
    pub subscribe_timeout: Duration,
    /// Period between read-throughs while polling
    pub poll_interval: Duration,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            subscribe_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// State shared between a subscription handle and its driver task.
#[derive(Debug)]
struct Shared {
    id: String,
    entity: Entity,
    state: watch::Sender<SubscriptionState>,
    history: Mutex<Vec<Transition>>,
    last_delivered_at: Mutex<Option<Stamp>>,
    /// Open live channel, closed inline on unsubscribe
    live: Mutex<Option<LiveCloser>>,
}

impl Shared {
    /// Move to `to`. Nothing leaves `Unsubscribed`.
    fn transition(&self, to: SubscriptionState) -> bool {
        let mut history = lock(&self.history);
        let from = *self.state.borrow();
        if from == to || from == SubscriptionState::Unsubscribed {
            return false;
        }

        history.push(Transition {
            from,
            to,
            at: Stamp::now(),
        });
        self.state.send_replace(to);
        tracing::info!(
            subscription = %self.id,
            entity = %self.entity,
            from = ?from,
            to = ?to,
            "Subscription state changed"
        );
        true
    }

    /// Keep `closer` for [`close_live`](Self::close_live). A subscription
    /// that is already gone closes it at once.
    fn hold_live(&self, closer: LiveCloser) {
        let mut live = lock(&self.live);
        if *self.state.borrow() == SubscriptionState::Unsubscribed {
            closer.close();
        } else {
            *live = Some(closer);
        }
    }

    fn close_live(&self) {
        if let Some(closer) = lock(&self.live).take() {
            closer.close();
        }
    }

    fn deliver(&self, events: &mpsc::UnboundedSender<ChangeEvent>, event: ChangeEvent) {
        if *self.state.borrow() == SubscriptionState::Unsubscribed {
            return;
        }
        let source = event.source;
        if events.send(event).is_ok() {
            *lock(&self.last_delivered_at) = Some(Stamp::now());
            tracing::debug!(
                subscription = %self.id,
                entity = %self.entity,
                source = ?source,
                "Change delivered"
            );
        }
    }
}

/// Fans change events out to subscribers of one context.
pub struct ChangeNotifier {
    coordinator: Arc<SyncCoordinator>,
    broadcast: LocalBroadcast,
    registry: Arc<SubscriptionRegistry>,
    config: NotifierConfig,
}

impl std::fmt::Debug for ChangeNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeNotifier")
            .field("config", &self.config)
            .field("subscriptions", &self.registry.count())
            .finish()
    }
}

impl ChangeNotifier {
    /// Create a notifier listening for markers on the coordinator's cache.
    pub fn new(coordinator: Arc<SyncCoordinator>, config: NotifierConfig) -> Self {
        let broadcast = LocalBroadcast::attach(coordinator.cache().storage().as_ref());
        Self {
            coordinator,
            broadcast,
            registry: Arc::new(SubscriptionRegistry::new()),
            config,
        }
    }

    pub fn config(&self) -> NotifierConfig {
        self.config
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn active_subscriptions(&self) -> usize {
        self.registry.count()
    }

    /// Start watching `entity`. Must be called inside a Tokio runtime.
    pub fn subscribe(&self, entity: Entity) -> Subscription {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SubscriptionState::Init);

        // Attach to local markers before anything can be missed.
        let local = self.broadcast.subscribe(entity);
        let id = self.registry.register(entity, state_rx.clone());

        let shared = Arc::new(Shared {
            id: id.clone(),
            entity,
            state: state_tx,
            history: Mutex::new(Vec::new()),
            last_delivered_at: Mutex::new(None),
            live: Mutex::new(None),
        });

        let driver = Driver {
            entity,
            coordinator: self.coordinator.clone(),
            remote: self.coordinator.remote().clone(),
            config: self.config,
            shared: shared.clone(),
            events: events_tx,
            local,
            local_open: true,
            fingerprint: None,
        };
        let task = TaskHandle::spawn(driver.run());

        Subscription {
            id,
            entity,
            events: events_rx,
            state: state_rx,
            shared,
            task,
            registry: self.registry.clone(),
            closed: false,
        }
    }
}

/// Handle to one entity subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: String,
    entity: Entity,
    events: mpsc::UnboundedReceiver<ChangeEvent>,
    state: watch::Receiver<SubscriptionState>,
    shared: Arc<Shared>,
    task: TaskHandle,
    registry: Arc<SubscriptionRegistry>,
    closed: bool,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("entity", &self.entity)
            .field("state", &self.state())
            .finish()
    }
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn entity(&self) -> Entity {
        self.entity
    }

    /// Next change event. `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        self.events.try_recv().ok()
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    /// A receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<SubscriptionState> {
        self.state.clone()
    }

    /// Wait until the subscription reaches `target`.
    ///
    /// Returns `false` if it became `Unsubscribed` first.
    pub async fn wait_for_state(&mut self, target: SubscriptionState) -> bool {
        let reached = self
            .state
            .wait_for(|state| *state == target || *state == SubscriptionState::Unsubscribed)
            .await
            .map(|state| *state == target);
        reached.unwrap_or(false)
    }

    pub fn transitions(&self) -> Vec<Transition> {
        lock(&self.shared.history).clone()
    }

    pub fn last_delivered_at(&self) -> Option<Stamp> {
        *lock(&self.shared.last_delivered_at)
    }

    /// Stop the subscription. Timers and the live channel are released and
    /// undelivered events are discarded. Idempotent.
    pub fn unsubscribe(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        self.shared.transition(SubscriptionState::Unsubscribed);
        self.shared.close_live();
        self.task.cancel();
        self.events.close();
        while self.events.try_recv().is_ok() {}
        self.registry.unregister(&self.id);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// The background task behind one subscription.
struct Driver {
    entity: Entity,
    coordinator: Arc<SyncCoordinator>,
    remote: Arc<dyn RemoteStore>,
    config: NotifierConfig,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<ChangeEvent>,
    local: tokio_broadcast::Receiver<ChangeEvent>,
    local_open: bool,
    /// Fingerprint of the last collection delivered to the subscriber
    fingerprint: Option<u64>,
}

impl Driver {
    async fn run(mut self) {
        if self.remote.is_available() {
            self.shared.transition(SubscriptionState::Subscribing);
            if let Some(channel) = self.open_live().await {
                self.shared.transition(SubscriptionState::Subscribed);
                self.run_live(channel).await;
                self.shared.close_live();
            }
        }

        self.shared.transition(SubscriptionState::Polling);
        self.run_polling().await;
    }

    /// Open and confirm a live channel within the subscribe timeout.
    async fn open_live(&mut self) -> Option<LiveChannel> {
        let remote = self.remote.clone();
        let shared = self.shared.clone();
        let entity = self.entity;
        let attempt = async move {
            let mut channel = match remote.subscribe(entity).await {
                Ok(channel) => channel,
                Err(e) => return Err(e),
            };
            shared.hold_live(channel.closer());
            loop {
                match channel.next_status().await {
                    ChannelStatus::Subscribed => return Ok(channel),
                    ChannelStatus::Message(_) => continue,
                    ChannelStatus::Error(e) => return Err(e),
                    ChannelStatus::Closed => {
                        return Err(RemoteError::new(
                            ErrorKind::Network,
                            "live channel closed before confirming",
                        ))
                    }
                }
            }
        };

        match tokio::time::timeout(self.config.subscribe_timeout, attempt).await {
            Ok(Ok(channel)) => Some(channel),
            Ok(Err(e)) => {
                tracing::warn!(
                    entity = %entity,
                    kind = %e.kind,
                    error = %e.message,
                    "Live subscription failed, polling instead"
                );
                None
            }
            Err(_) => {
                tracing::warn!(
                    entity = %entity,
                    timeout_ms = self.config.subscribe_timeout.as_millis() as u64,
                    "Live subscription timed out, polling instead"
                );
                None
            }
        }
    }

    async fn run_live(&mut self, mut channel: LiveChannel) {
        loop {
            tokio::select! {
                status = channel.next_status() => match status {
                    ChannelStatus::Message(event_type) => {
                        self.refresh().await;
                        self.emit(event_type, EventSource::RemoteLive);
                    }
                    ChannelStatus::Subscribed => {}
                    ChannelStatus::Error(e) => {
                        tracing::warn!(
                            entity = %self.entity,
                            kind = %e.kind,
                            error = %e.message,
                            "Live channel failed, polling instead"
                        );
                        return;
                    }
                    ChannelStatus::Closed => {
                        tracing::info!(
                            entity = %self.entity,
                            "Live channel closed, polling instead"
                        );
                        return;
                    }
                },
                received = self.local.recv(), if self.local_open => self.on_local(received).await,
            }
        }
    }

    async fn run_polling(&mut self) {
        let period = self.config.poll_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    tracing::debug!(entity = %self.entity, "Polling");
                    if let Some(fingerprint) = self.read_through().await {
                        if self.fingerprint != Some(fingerprint) {
                            self.fingerprint = Some(fingerprint);
                            self.emit(EventType::All, EventSource::RemotePoll);
                        }
                    }
                }
                received = self.local.recv(), if self.local_open => self.on_local(received).await,
            }
        }
    }

    async fn on_local(&mut self, received: Result<ChangeEvent, RecvError>) {
        match received {
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!(
                    entity = %self.entity,
                    skipped,
                    "Collapsed lagging local broadcasts"
                );
            }
            Err(RecvError::Closed) => {
                self.local_open = false;
                return;
            }
        }
        self.refresh().await;
        self.emit(EventType::All, EventSource::LocalBroadcast);
    }

    /// Read through and remember what the subscriber is about to see.
    async fn refresh(&mut self) {
        if let Some(fingerprint) = self.read_through().await {
            self.fingerprint = Some(fingerprint);
        }
    }

    async fn read_through(&self) -> Option<u64> {
        match self.coordinator.read_collection(self.entity).await {
            Ok(fetched) => Some(fingerprint(&fetched.data)),
            Err(SyncError::Auth(e)) => {
                tracing::error!(
                    entity = %self.entity,
                    error = %e.message,
                    "Read-through rejected, session expired"
                );
                None
            }
            Err(e) => {
                tracing::warn!(entity = %self.entity, error = %e, "Read-through failed");
                None
            }
        }
    }

    fn emit(&self, event_type: EventType, source: EventSource) {
        let event = ChangeEvent::new(self.entity, event_type, source, Stamp::now());
        self.shared.deliver(&self.events, event);
    }
}

/// Hash of the visible rows and their dirty flags.
///
/// Cache times are left out so that re-reading unchanged data is not a change.
fn fingerprint(entries: &[CacheEntry]) -> u64 {
    let mut sorted: Vec<&CacheEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| a.natural_key().cmp(b.natural_key()));

    let mut hasher = DefaultHasher::new();
    for entry in sorted {
        entry.natural_key().hash(&mut hasher);
        serde_json::to_string(entry.record.row())
            .unwrap_or_default()
            .hash(&mut hasher);
        entry.dirty.hash(&mut hasher);
    }
    hasher.finish()
}
