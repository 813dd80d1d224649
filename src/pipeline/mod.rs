//! Event pipeline: binds every registered handler to a watch subscription.
//!
//! Startup probes each resource type, subscribes the available ones and
//! blocks until each subscription has delivered its initial listing. Each
//! kind is consumed by its own task, which fans notifications out to a
//! fixed set of lanes keyed by object uid: notifications about one object
//! are handled in arrival order, different objects in parallel.
//! After the initial sync a liveness ticker checks the graph store and
//! reports subscription states.

pub mod kube_source;
mod registry;
mod source;

#[cfg(test)]
pub(crate) mod memory;

pub use kube_source::KubeSource;
pub use registry::{HandlerRegistry, SubscriptionState};
pub use source::{ClusterSource, ProbeError, WatchEvent, WatchStream};

use crate::handlers::ResourceHandler;
use crate::metrics::record_event;
use crate::neo4j::GraphStore;
use futures::future::join_all;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Bound on the initial sync of every subscription.
    pub sync_timeout: Duration,
    pub liveness_interval: Duration,
    /// Handler lanes per kind.
    pub workers_per_kind: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            sync_timeout: Duration::from_secs(300),
            liveness_interval: Duration::from_secs(30),
            workers_per_kind: 8,
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("initial sync not complete after {timeout:?}, still waiting on {pending:?}")]
    SyncTimeout {
        timeout: Duration,
        pending: Vec<String>,
    },
    #[error("pipeline cancelled")]
    Cancelled,
}

pub struct EventPipeline {
    registry: Arc<HandlerRegistry>,
    source: Arc<dyn ClusterSource>,
    store: Arc<dyn GraphStore>,
    settings: PipelineSettings,
}

impl EventPipeline {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        source: Arc<dyn ClusterSource>,
        store: Arc<dyn GraphStore>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            registry,
            source,
            store,
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Probe, subscribe and wait for the initial sync.
    ///
    /// Returns the per-kind watch tasks; they run until `cancel` fires.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<Vec<JoinHandle<()>>, PipelineError> {
        self.probe_all().await;
        let tasks = self.subscribe_all(cancel);
        tracing::info!(subscriptions = tasks.len(), "Waiting for initial sync");
        self.wait_for_sync(cancel).await?;
        tracing::info!(
            active = self.registry.active_resources().len(),
            "Initial sync complete"
        );
        Ok(tasks)
    }

    async fn probe_all(&self) {
        let probes = self.registry.handlers().iter().map(|handler| async move {
            (handler, self.source.probe(handler.gvr()).await)
        });
        for (handler, result) in join_all(probes).await {
            let kind = handler.kind();
            let state = match result {
                Ok(()) => SubscriptionState::Available,
                Err(e) if e.is_unavailable() => {
                    tracing::info!(kind = %kind, gvr = %handler.gvr(), reason = %e, "Resource type unavailable, skipping");
                    SubscriptionState::Skipped
                }
                Err(e) => {
                    tracing::warn!(kind = %kind, error = %e, "Probe failed, subscribing anyway");
                    SubscriptionState::Available
                }
            };
            self.registry.set_state(kind, state);
        }
    }

    fn subscribe_all(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();
        for handler in self.registry.handlers() {
            if self.registry.state(handler.kind()) != Some(SubscriptionState::Available) {
                continue;
            }
            self.registry.set_state(handler.kind(), SubscriptionState::Syncing);
            let stream = self.source.watch(handler.gvr());
            tasks.push(tokio::spawn(consume(
                handler.clone(),
                self.registry.clone(),
                self.store.clone(),
                stream,
                self.settings.workers_per_kind,
                cancel.clone(),
            )));
        }
        tasks
    }

    async fn wait_for_sync(&self, cancel: &CancellationToken) -> Result<(), PipelineError> {
        let mut changed = self.registry.subscribe();
        let deadline = tokio::time::sleep(self.settings.sync_timeout);
        tokio::pin!(deadline);
        loop {
            if self.registry.pending().is_empty() {
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                _ = &mut deadline => {
                    return Err(PipelineError::SyncTimeout {
                        timeout: self.settings.sync_timeout,
                        pending: self.registry.pending(),
                    });
                }
                res = changed.changed() => res.map_err(|_| PipelineError::Cancelled)?,
            }
        }
    }

    /// Periodic store health check and subscription report, until cancelled.
    pub async fn run_liveness(&self, cancel: CancellationToken) {
        // `interval` rejects a zero period.
        let period = self.settings.liveness_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.liveness_check().await;
                }
            }
        }
        tracing::debug!("Liveness ticker stopped");
    }

    /// One liveness round. Returns whether the graph store answered.
    pub async fn liveness_check(&self) -> bool {
        let healthy = match self.store.health_check().await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Graph store health check failed");
                false
            }
        };
        let states = self.registry.states();
        let count = |s: SubscriptionState| states.values().filter(|v| **v == s).count();
        tracing::info!(
            healthy,
            synced = count(SubscriptionState::Synced),
            syncing = count(SubscriptionState::Syncing),
            skipped = count(SubscriptionState::Skipped),
            "Liveness check"
        );
        for (kind, state) in states.iter().filter(|(_, s)| **s != SubscriptionState::Synced) {
            tracing::debug!(kind = %kind, state = %state, "Subscription not synced");
        }
        healthy
    }
}

const LANE_BUFFER: usize = 64;

enum LaneMessage {
    Event(WatchEvent),
    /// Acknowledged once every notification queued before it is handled.
    Flush(oneshot::Sender<()>),
}

/// Lane index for an object uid. Stable across runs so that one uid always
/// maps to the same lane.
fn lane_for(uid: Option<&str>, lanes: usize) -> usize {
    let hash = uid
        .unwrap_or_default()
        .bytes()
        .fold(0u64, |h, b| h.wrapping_mul(31).wrapping_add(u64::from(b)));
    (hash % lanes.max(1) as u64) as usize
}

/// Consume one kind's watch stream until it ends or `cancel` fires.
///
/// A `Synced` marker is only recorded after every lane has drained the
/// notifications received before it.
async fn consume(
    handler: Arc<dyn ResourceHandler>,
    registry: Arc<HandlerRegistry>,
    store: Arc<dyn GraphStore>,
    mut stream: WatchStream,
    lane_count: usize,
    cancel: CancellationToken,
) {
    let kind = handler.kind().to_string();
    let (lanes, workers): (Vec<_>, Vec<_>) = (0..lane_count.max(1))
        .map(|_| {
            let (tx, rx) = mpsc::channel(LANE_BUFFER);
            let worker = tokio::spawn(run_lane(handler.clone(), store.clone(), rx, cancel.clone()));
            (tx, worker)
        })
        .unzip();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(WatchEvent::Synced)) => {
                if !flush(&lanes, &cancel).await {
                    break;
                }
                if registry.state(&kind) != Some(SubscriptionState::Synced) {
                    tracing::info!(kind = %kind, "Subscription synced");
                }
                registry.set_state(&kind, SubscriptionState::Synced);
            }
            Some(Ok(event)) => {
                let uid = event.object().and_then(|o| o.uid());
                let lane = &lanes[lane_for(uid.as_deref(), lanes.len())];
                let sent = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    sent = lane.send(LaneMessage::Event(event)) => sent,
                };
                if sent.is_err() {
                    tracing::warn!(kind = %kind, "Handler lane closed");
                    break;
                }
            }
            Some(Err(e)) => {
                tracing::warn!(kind = %kind, error = %e, "Watch error, retrying");
            }
            None => {
                tracing::warn!(kind = %kind, "Watch stream ended");
                break;
            }
        }
    }

    // Closing the senders lets each lane finish what it already holds.
    drop(lanes);
    join_all(workers).await;
    tracing::debug!(kind = %kind, "Watch task stopped");
}

/// Wait until every lane has handled its queued notifications. Returns
/// false when cancelled or when a lane is gone.
async fn flush(lanes: &[mpsc::Sender<LaneMessage>], cancel: &CancellationToken) -> bool {
    let mut acks = Vec::with_capacity(lanes.len());
    for lane in lanes {
        let (tx, rx) = oneshot::channel();
        if lane.send(LaneMessage::Flush(tx)).await.is_err() {
            return false;
        }
        acks.push(rx);
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        acked = join_all(acks) => acked.iter().all(Result::is_ok),
    }
}

/// One lane: handle notifications in order until the sender side closes
/// or `cancel` fires.
async fn run_lane(
    handler: Arc<dyn ResourceHandler>,
    store: Arc<dyn GraphStore>,
    mut rx: mpsc::Receiver<LaneMessage>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            message = rx.recv() => message,
        };
        match message {
            Some(LaneMessage::Event(event)) => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = dispatch(handler.as_ref(), store.as_ref(), &event) => {}
                }
            }
            Some(LaneMessage::Flush(ack)) => {
                let _ = ack.send(());
            }
            None => break,
        }
    }
}

/// Route one notification: add and update share create semantics.
async fn dispatch(handler: &dyn ResourceHandler, store: &dyn GraphStore, event: &WatchEvent) {
    let result = match event {
        WatchEvent::Added(obj) | WatchEvent::Updated(obj) => handler.handle_create(obj, store).await,
        WatchEvent::Deleted(obj) => handler.handle_delete(obj, store).await,
        WatchEvent::Synced => return,
    };
    record_event(handler.kind(), event.name(), result.is_ok());
    if let Err(e) = result {
        let obj = event.object();
        tracing::error!(
            kind = %handler.kind(),
            event = event.name(),
            uid = ?obj.and_then(|o| o.uid()),
            object = ?obj.map(|o| o.display_name()),
            error = %e,
            "Failed to handle watch event"
        );
    }
}
