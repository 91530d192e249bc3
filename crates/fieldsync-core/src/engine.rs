//! Engine composition root
//!
//! [`Engine`] wires the components together and owns their lifetime. Any
//! collaborator not handed to the [`EngineBuilder`] is opened from the
//! [`Config`]: a SQLite store, a durable queue and a shared-file remote in
//! the data directory.
//!
//! ```text
//! let engine = Engine::builder(config).build()?;
//! engine.start();
//!
//! let outcome = engine.request_save(mutation).await;
//! let result = engine.sync_now().await;
//!
//! engine.shutdown().await;
//! ```
//!
//! ## Background tasks
//!
//! [`Engine::start`] spawns:
//! - a forwarder that republishes network transitions as
//!   [`EngineEvent::NetworkChanged`]
//! - a reconnect trigger that runs a sync pass when the network comes back
//!   (waiting for a flapping network to settle first)
//! - an interval timer for periodic passes
//! - a reachability poller feeding the [`NetworkMonitor`]
//!
//! Automatic passes only run when `sync_enabled` is set; the forwarder and
//! poller always run.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::conflict::ConflictResolver;
use crate::error::EngineResult;
use crate::events::{EngineEvent, EventBus};
use crate::identity::Identity;
use crate::models::{Mutation, PendingChange, RecordId, RevisionedPayload, Watermark};
use crate::network::{spawn_reachability_poller, NetworkMonitor, NetworkState, NetworkTransition};
use crate::propagate::Propagator;
use crate::queue::PendingChangeQueue;
use crate::remote::{RemoteBackend, SqliteRemote};
use crate::save::{SaveCoordinator, SaveOutcome, SaveState};
use crate::storage::SqliteStore;
use crate::store::LocalStore;
use crate::sync::{ManualChoice, SyncOrchestrator, SyncResult, SyncSession};

/// Builder for [`Engine`]
pub struct EngineBuilder {
    config: Config,
    store: Option<Arc<dyn LocalStore>>,
    remote: Option<Arc<dyn RemoteBackend>>,
    queue: Option<Arc<PendingChangeQueue>>,
    resolver: ConflictResolver,
}

impl EngineBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            store: None,
            remote: None,
            queue: None,
            resolver: ConflictResolver::new(),
        }
    }

    /// Use this local store instead of the SQLite store
    pub fn store(mut self, store: Arc<dyn LocalStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use this remote instead of the shared-file remote
    pub fn remote(mut self, remote: Arc<dyn RemoteBackend>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Use this queue instead of the durable queue file
    pub fn queue(mut self, queue: Arc<PendingChangeQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn resolver(mut self, resolver: ConflictResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn build(self) -> Result<Engine> {
        let config = self.config;

        let store = match self.store {
            Some(store) => store,
            None => {
                let device_id = Identity::with_config(&config).load_or_create()?;
                let store = SqliteStore::open(&config.store_path(), device_id)
                    .context("Failed to open local store")?;
                Arc::new(store) as Arc<dyn LocalStore>
            }
        };

        let queue = match self.queue {
            Some(queue) => queue,
            None => Arc::new(
                PendingChangeQueue::open(&config.queue_path())
                    .context("Failed to open pending change queue")?,
            ),
        };

        let remote = match self.remote {
            Some(remote) => remote,
            None => {
                let path = config.remote_path();
                let remote = SqliteRemote::open(&path)
                    .with_context(|| format!("Failed to open remote: {:?}", path))?;
                Arc::new(remote) as Arc<dyn RemoteBackend>
            }
        };

        let initial = if config.force_offline {
            NetworkState::Offline
        } else {
            NetworkState::Online
        };
        let network = Arc::new(NetworkMonitor::with_flap_settings(
            initial,
            config.flap_settings(),
        ));

        let events = EventBus::new();
        let propagator = Propagator::new(
            remote.clone(),
            network.clone(),
            config.retry_policy(),
            config.attempt_timeout(),
        );
        let saves = Arc::new(SaveCoordinator::new(
            store.clone(),
            queue.clone(),
            propagator.clone(),
            events.clone(),
        ));
        let sync = Arc::new(SyncOrchestrator::new(
            store.clone(),
            queue.clone(),
            saves.clone(),
            propagator,
            self.resolver,
            events.clone(),
            config.sync_settings(),
        ));

        info!(
            device_id = store.device_id(),
            pending = queue.len(),
            watermark = queue.watermark(),
            network = %initial,
            "Engine ready"
        );

        Ok(Engine {
            config,
            store,
            remote,
            queue,
            network,
            events,
            saves,
            sync,
            token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }
}

/// The save and sync engine
pub struct Engine {
    config: Config,
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteBackend>,
    queue: Arc<PendingChangeQueue>,
    network: Arc<NetworkMonitor>,
    events: EventBus,
    saves: Arc<SaveCoordinator>,
    sync: Arc<SyncOrchestrator>,
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("device_id", &self.store.device_id())
            .field("network", &self.network.current())
            .field("pending", &self.queue.len())
            .field("syncing", &self.sync.is_running())
            .finish()
    }
}

impl Engine {
    pub fn builder(config: Config) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn device_id(&self) -> &str {
        self.store.device_id()
    }

    /// Commit a mutation locally and propagate it
    pub async fn request_save(&self, mutation: Mutation) -> SaveOutcome {
        self.saves.request_save(mutation).await
    }

    /// Cancel the in-progress save for a record; no-op when idle
    pub fn cancel_pending(&self, record_id: &RecordId) {
        self.saves.cancel_pending(record_id)
    }

    pub fn save_state(&self, record_id: &RecordId) -> SaveState {
        self.saves.state(record_id)
    }

    /// Run a sync pass now
    pub async fn sync_now(&self) -> SyncResult {
        self.sync.sync_now().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn network(&self) -> &Arc<NetworkMonitor> {
        &self.network
    }

    pub fn remote(&self) -> &Arc<dyn RemoteBackend> {
        &self.remote
    }

    pub fn pending_change_count(&self) -> usize {
        self.queue.len()
    }

    /// Queued changes, oldest first
    pub fn pending_changes(&self) -> Vec<PendingChange> {
        self.queue.drain()
    }

    pub fn is_syncing(&self) -> bool {
        self.sync.is_running()
    }

    /// When the last sync pass completed
    pub fn last_sync_timestamp(&self) -> Option<DateTime<Utc>> {
        self.queue.last_sync_at()
    }

    pub fn watermark(&self) -> Watermark {
        self.queue.watermark()
    }

    pub fn current_session(&self) -> Option<SyncSession> {
        self.sync.current_session()
    }

    pub fn last_session(&self) -> Option<SyncSession> {
        self.sync.last_session()
    }

    /// Local version of a record
    pub fn load(&self, record_id: &RecordId) -> EngineResult<Option<RevisionedPayload>> {
        Ok(self.store.load(record_id)?)
    }

    /// All local records
    pub fn list(&self) -> EngineResult<Vec<RevisionedPayload>> {
        Ok(self.store.list()?)
    }

    /// Records waiting for a manual conflict decision
    pub fn unresolved_conflicts(&self) -> Vec<RecordId> {
        self.sync.unresolved_conflicts()
    }

    /// Settle a manual conflict; the result is queued for the next pass
    pub fn resolve_conflict(
        &self,
        record_id: &RecordId,
        choice: ManualChoice,
    ) -> EngineResult<RevisionedPayload> {
        self.sync.resolve_manual(record_id, choice)
    }

    /// Spawn the background tasks; calling it again is a no-op
    pub fn start(&self) {
        let mut tasks = self.tasks();
        if !tasks.is_empty() || self.token.is_cancelled() {
            debug!("Engine already started or shut down");
            return;
        }

        // Subscribe before spawning so no transition is missed
        tasks.push(tokio::spawn(forward_transitions(
            self.network.subscribe(),
            self.events.clone(),
            self.token.child_token(),
        )));

        if self.config.sync_enabled {
            tasks.push(tokio::spawn(sync_on_reconnect(
                self.network.subscribe(),
                self.network.clone(),
                self.sync.clone(),
                self.config.flap_settings().window,
                self.token.child_token(),
            )));

            if let Some(period) = self.config.sync_interval() {
                tasks.push(tokio::spawn(sync_on_interval(
                    period,
                    self.network.clone(),
                    self.sync.clone(),
                    self.token.child_token(),
                )));
            }
        }

        if !self.config.force_offline {
            if let Some(interval) = self.config.reachability_poll_interval() {
                tasks.push(spawn_reachability_poller(
                    self.network.clone(),
                    self.remote.clone(),
                    interval,
                    self.token.child_token(),
                ));
            }
        }

        info!(
            tasks = tasks.len(),
            sync_enabled = self.config.sync_enabled,
            "Engine started"
        );
    }

    /// Cancel every save and sync pass, then stop the background tasks
    ///
    /// Saves already committed locally stay queued.
    pub async fn shutdown(&self) {
        info!("Shutting down engine");
        self.saves.cancel_all();
        self.sync.shutdown();
        self.token.cancel();

        let tasks = std::mem::take(&mut *self.tasks());
        for result in join_all(tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        debug!(pending = self.queue.len(), "Engine stopped");
    }

    fn tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|p| p.into_inner())
    }
}

async fn forward_transitions(
    mut transitions: broadcast::Receiver<NetworkTransition>,
    events: EventBus,
    token: CancellationToken,
) {
    loop {
        let transition = tokio::select! {
            _ = token.cancelled() => break,
            received = transitions.recv() => match received {
                Ok(transition) => transition,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Missed network transitions");
                    continue;
                }
                Err(RecvError::Closed) => break,
            },
        };
        events.emit(EngineEvent::NetworkChanged {
            old: transition.old,
            new: transition.new,
        });
    }
}

async fn sync_on_reconnect(
    mut transitions: broadcast::Receiver<NetworkTransition>,
    network: Arc<NetworkMonitor>,
    sync: Arc<SyncOrchestrator>,
    settle: Duration,
    token: CancellationToken,
) {
    loop {
        let transition = tokio::select! {
            _ = token.cancelled() => break,
            received = transitions.recv() => match received {
                Ok(transition) => transition,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            },
        };
        if !transition.new.is_online() {
            continue;
        }

        while network.is_flapping() {
            debug!(settle_ms = settle.as_millis() as u64, "Network flapping, waiting");
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(settle) => {}
            }
        }

        // Transitions seen while settling collapse into this trigger
        loop {
            match transitions.try_recv() {
                Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }

        if network.is_online() {
            run_automatic_pass(&sync, "reconnect").await;
        }
    }
}

async fn sync_on_interval(
    period: Duration,
    network: Arc<NetworkMonitor>,
    sync: Arc<SyncOrchestrator>,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                if network.is_online() {
                    run_automatic_pass(&sync, "interval").await;
                }
            }
        }
    }
}

async fn run_automatic_pass(sync: &SyncOrchestrator, trigger: &'static str) {
    match sync.sync_now().await {
        SyncResult::Busy => debug!(trigger, "Automatic sync skipped, pass already running"),
        SyncResult::Completed(report) => {
            debug!(trigger, pushed = report.pushed, pulled = report.pulled, "Automatic sync done")
        }
        SyncResult::Failed(failure) => {
            debug!(trigger, kind = %failure.kind, "Automatic sync failed")
        }
    }
}
