//! The sync queue manager.
//!
//! ```text
//!                 ┌──────────── triggers ────────────┐
//!                 │ enqueue (online)   network online │
//!                 │ background sync    periodic timer │
//!                 │ retry due                         │
//!                 └────────────────┬─────────────────┘
//!                                  ▼
//! ActionQueue ──get_unsynced──► sync pass ──deliver──► MutationClient
//!      ▲                           │
//!      └── mark_synced / mark_failed / mark_rejected ──► SyncEvent broadcast
//! ```
//!
//! A pass walks pending actions in insertion order. A failure only holds
//! back later actions with the same ordering key; everything else proceeds.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::{broadcast, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::{DeliveryError, MutationClient};
use super::network::NetworkState;
use super::ordering::OrderingRules;
use super::policy::RetryPolicy;
use super::SyncError;
use crate::store::{ActionKind, OfflineStore, PendingAction, StoreError, LAST_SYNC_KEY};

/// Default safety-net interval between passes while online.
pub const DEFAULT_PERIODIC_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Capacity of the event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Settings for the sync queue.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// API base URL the mutation endpoints are joined to.
    pub base_url: String,
    pub periodic_interval: Duration,
    pub retry: RetryPolicy,
    pub ordering: OrderingRules,
    pub request_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            periodic_interval: DEFAULT_PERIODIC_INTERVAL,
            retry: RetryPolicy::default(),
            ordering: OrderingRules::default(),
            request_timeout: super::client::DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl SyncConfig {
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_periodic_interval(mut self, interval: Duration) -> Self {
        self.periodic_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_ordering(mut self, ordering: OrderingRules) -> Self {
        self.ordering = ordering;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// What started a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    Startup,
    Manual,
    Enqueue,
    NetworkOnline,
    BackgroundSync,
    Periodic,
    RetryDue,
}

impl fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncTrigger::Startup => "startup",
            SyncTrigger::Manual => "manual",
            SyncTrigger::Enqueue => "enqueue",
            SyncTrigger::NetworkOnline => "network-online",
            SyncTrigger::BackgroundSync => "background-sync",
            SyncTrigger::Periodic => "periodic",
            SyncTrigger::RetryDue => "retry-due",
        };
        f.write_str(name)
    }
}

/// Per-action results, broadcast to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Enqueued {
        action_id: String,
        kind: ActionKind,
        pending: usize,
    },
    Synced {
        action_id: String,
        kind: ActionKind,
        pending: usize,
    },
    RetryScheduled {
        action_id: String,
        kind: ActionKind,
        attempt: u32,
        next_attempt_at: DateTime<Utc>,
        error: String,
    },
    /// Refused by the receiver or out of attempts; needs user handling.
    Rejected {
        action_id: String,
        kind: ActionKind,
        error: String,
    },
    PassCompleted {
        synced: usize,
        failed: usize,
        pending: usize,
    },
}

/// Outcome of one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub synced: usize,
    pub failed: usize,
    pub rejected: usize,
    /// Not attempted: not yet due, or behind a failed action with the same
    /// ordering key.
    pub skipped: usize,
    pub pending: usize,
    /// The pass did not run because the network is offline.
    pub offline: bool,
}

/// Enqueue, deliver and retry offline mutations.
pub struct SyncQueueManager {
    store: OfflineStore,
    client: Arc<dyn MutationClient>,
    network: Arc<NetworkState>,
    config: SyncConfig,
    events: broadcast::Sender<SyncEvent>,
    pass_lock: Mutex<()>,
    wake: Notify,
}

impl SyncQueueManager {
    pub fn new(
        store: OfflineStore,
        client: Arc<dyn MutationClient>,
        network: Arc<NetworkState>,
        config: SyncConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            client,
            network,
            config,
            events,
            pass_lock: Mutex::new(()),
            wake: Notify::new(),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn network(&self) -> &Arc<NetworkState> {
        &self.network
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn pending_count(&self) -> usize {
        self.store.actions().pending_count()
    }

    /// Persist a mutation, keyed by the configured ordering rule, then try
    /// to deliver it if online.
    pub async fn enqueue(&self, kind: ActionKind, payload: Value) -> Result<PendingAction, SyncError> {
        let key = self.config.ordering.key_for(kind, &payload);
        self.enqueue_with_key(kind, payload, key).await
    }

    /// Like [`enqueue`](Self::enqueue) with an explicit ordering key.
    pub async fn enqueue_with_key(
        &self,
        kind: ActionKind,
        payload: Value,
        ordering_key: Option<String>,
    ) -> Result<PendingAction, SyncError> {
        let action = self.store.actions().enqueue(kind, payload, ordering_key).await?;
        self.emit(SyncEvent::Enqueued {
            action_id: action.id.clone(),
            kind,
            pending: self.pending_count(),
        });

        if self.network.is_online() {
            self.sync(SyncTrigger::Enqueue).await?;
        }
        Ok(self.store.actions().get(&action.id).unwrap_or(action))
    }

    /// Ask the run loop for a pass.
    pub fn request_sync(&self) {
        self.wake.notify_one();
    }

    /// Run one pass over the pending actions.
    pub async fn sync(&self, trigger: SyncTrigger) -> Result<SyncReport, SyncError> {
        if !self.network.is_online() {
            debug!(%trigger, "Offline, sync pass skipped");
            return Ok(SyncReport {
                pending: self.pending_count(),
                offline: true,
                ..SyncReport::default()
            });
        }

        let _pass = self.pass_lock.lock().await;
        let now = Utc::now();
        let mut report = SyncReport::default();
        let mut blocked: HashSet<String> = HashSet::new();

        for action in self.store.actions().get_unsynced() {
            if action
                .ordering_key
                .as_ref()
                .is_some_and(|key| blocked.contains(key))
            {
                report.skipped += 1;
                continue;
            }
            if !action.is_due(now) {
                report.skipped += 1;
                block(&mut blocked, &action);
                continue;
            }
            if !self.network.is_online() {
                debug!("Went offline during sync pass");
                break;
            }

            match self.client.deliver(&action).await {
                Ok(()) => {
                    let marked = self.store.actions().mark_synced(&action.id).await;
                    if !still_queued(marked, &action.id)? {
                        report.skipped += 1;
                        continue;
                    }
                    report.synced += 1;
                    info!(action_id = %action.id, kind = %action.kind, "Action synced");
                    self.emit(SyncEvent::Synced {
                        action_id: action.id.clone(),
                        kind: action.kind,
                        pending: self.pending_count(),
                    });
                }
                Err(DeliveryError::Retryable(error)) => {
                    let attempt = action.retry_count + 1;
                    match self.config.retry.next_attempt_at(attempt, now) {
                        Some(next_attempt_at) => {
                            let marked = self
                                .store
                                .actions()
                                .mark_failed(&action.id, &error, Some(next_attempt_at))
                                .await;
                            if !still_queued(marked, &action.id)? {
                                report.skipped += 1;
                                continue;
                            }
                            report.failed += 1;
                            block(&mut blocked, &action);
                            warn!(
                                action_id = %action.id,
                                attempt,
                                %error,
                                "Action delivery failed, retry scheduled"
                            );
                            self.emit(SyncEvent::RetryScheduled {
                                action_id: action.id.clone(),
                                kind: action.kind,
                                attempt,
                                next_attempt_at,
                                error,
                            });
                        }
                        None => {
                            let error = format!("{error} (gave up after {attempt} attempts)");
                            self.reject(&action, error, &mut report).await?;
                        }
                    }
                }
                Err(DeliveryError::Permanent(error)) => {
                    self.reject(&action, error, &mut report).await?;
                }
            }
        }

        report.pending = self.pending_count();
        if report.synced > 0 {
            self.store
                .metadata()
                .set(LAST_SYNC_KEY, json!(Utc::now().to_rfc3339()))
                .await?;
        }
        info!(
            %trigger,
            synced = report.synced,
            failed = report.failed,
            rejected = report.rejected,
            pending = report.pending,
            "Sync pass complete"
        );
        self.emit(SyncEvent::PassCompleted {
            synced: report.synced,
            failed: report.failed,
            pending: report.pending,
        });
        Ok(report)
    }

    /// Earliest scheduled retry among pending actions.
    pub fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        self.store
            .actions()
            .get_unsynced()
            .into_iter()
            .filter_map(|a| a.next_attempt_at)
            .min()
    }

    /// Background loop: syncs on network-online, on request, when a retry
    /// falls due and on the periodic timer.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut network_rx = self.network.subscribe();
        let mut periodic = tokio::time::interval(self.config.periodic_interval);
        periodic.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        periodic.reset();
        info!(
            interval_secs = self.config.periodic_interval.as_secs(),
            "Sync loop started"
        );

        // Flush whatever survived the last session.
        if self.network.is_online() && self.pending_count() > 0 {
            if let Err(e) = self.sync(SyncTrigger::Startup).await {
                warn!(error = %e, "Startup sync pass failed");
            }
        }

        loop {
            let retry_delay = self
                .network
                .is_online()
                .then(|| self.next_retry_at())
                .flatten()
                .map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO));

            let trigger = tokio::select! {
                _ = cancel.cancelled() => break,
                changed = network_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let online = *network_rx.borrow_and_update();
                    if !online {
                        continue;
                    }
                    SyncTrigger::NetworkOnline
                }
                _ = self.wake.notified() => SyncTrigger::BackgroundSync,
                _ = periodic.tick() => SyncTrigger::Periodic,
                _ = sleep_opt(retry_delay) => SyncTrigger::RetryDue,
            };

            if let Err(e) = self.sync(trigger).await {
                warn!(%trigger, error = %e, "Sync pass failed");
            }
        }
        info!("Sync loop stopped");
    }

    async fn reject(
        &self,
        action: &PendingAction,
        error: String,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let marked = self.store.actions().mark_rejected(&action.id, &error).await;
        if !still_queued(marked, &action.id)? {
            report.skipped += 1;
            return Ok(());
        }
        report.rejected += 1;
        warn!(action_id = %action.id, kind = %action.kind, %error, "Action rejected");
        self.emit(SyncEvent::Rejected {
            action_id: action.id.clone(),
            kind: action.kind,
            error,
        });
        Ok(())
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// `Ok(false)` when the action was discarded while its delivery was in
/// flight.
fn still_queued<T>(marked: Result<T, StoreError>, action_id: &str) -> Result<bool, StoreError> {
    match marked {
        Ok(_) => Ok(true),
        Err(StoreError::ActionNotFound(_)) => {
            debug!(action_id, "Action discarded during delivery");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

fn block(blocked: &mut HashSet<String>, action: &PendingAction) {
    if let Some(key) = &action.ordering_key {
        blocked.insert(key.clone());
    }
}

async fn sleep_opt(delay: Option<Duration>) {
    match delay {
        Some(delay) => tokio::time::sleep(delay).await,
        None => std::future::pending().await,
    }
}
