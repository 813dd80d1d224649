//! Handler registry with per-kind subscription state.

use crate::handlers::{Gvr, ResourceHandler};
use crate::metrics::SUBSCRIPTION_STATE;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Lifecycle of one kind's watch subscription.
///
/// `Unchecked → Available → Syncing → Synced`, or `Unchecked → Skipped`
/// when the resource type is not served to this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SubscriptionState {
    Unchecked,
    Available,
    Syncing,
    Synced,
    Skipped,
}

impl SubscriptionState {
    pub const ALL: [SubscriptionState; 5] = [
        SubscriptionState::Unchecked,
        SubscriptionState::Available,
        SubscriptionState::Syncing,
        SubscriptionState::Synced,
        SubscriptionState::Skipped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionState::Unchecked => "unchecked",
            SubscriptionState::Available => "available",
            SubscriptionState::Syncing => "syncing",
            SubscriptionState::Synced => "synced",
            SubscriptionState::Skipped => "skipped",
        }
    }

    /// Subscribed and still owing its initial sync.
    pub fn is_pending(&self) -> bool {
        matches!(self, SubscriptionState::Available | SubscriptionState::Syncing)
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SubscriptionState::Available | SubscriptionState::Syncing | SubscriptionState::Synced
        )
    }
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The handlers served by this process, keyed by kind.
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn ResourceHandler>>,
    states: DashMap<String, SubscriptionState>,
    changed: watch::Sender<()>,
}

impl HandlerRegistry {
    /// Later handlers for an already-listed kind are dropped.
    pub fn new(handlers: Vec<Arc<dyn ResourceHandler>>) -> Self {
        let states = DashMap::new();
        let mut unique: Vec<Arc<dyn ResourceHandler>> = Vec::with_capacity(handlers.len());
        for handler in handlers {
            if states.contains_key(handler.kind()) {
                tracing::warn!(kind = %handler.kind(), "Duplicate handler ignored");
                continue;
            }
            states.insert(handler.kind().to_string(), SubscriptionState::Unchecked);
            unique.push(handler);
        }
        let (changed, _) = watch::channel(());
        let registry = Self {
            handlers: unique,
            states,
            changed,
        };
        for handler in &registry.handlers {
            registry.publish(handler.kind(), SubscriptionState::Unchecked);
        }
        registry
    }

    pub fn handlers(&self) -> &[Arc<dyn ResourceHandler>] {
        &self.handlers
    }

    pub fn handler(&self, kind: &str) -> Option<Arc<dyn ResourceHandler>> {
        self.handlers.iter().find(|h| h.kind() == kind).cloned()
    }

    pub fn kinds(&self) -> Vec<String> {
        self.handlers.iter().map(|h| h.kind().to_string()).collect()
    }

    /// Resource type watched for `kind`.
    pub fn gvr_for(&self, kind: &str) -> Option<Gvr> {
        self.handler(kind).map(|h| h.gvr().clone())
    }

    /// Resource types with a live subscription.
    pub fn active_resources(&self) -> Vec<Gvr> {
        self.handlers
            .iter()
            .filter(|h| self.state(h.kind()).is_some_and(|s| s.is_active()))
            .map(|h| h.gvr().clone())
            .collect()
    }

    pub fn state(&self, kind: &str) -> Option<SubscriptionState> {
        self.states.get(kind).map(|s| *s.value())
    }

    pub fn states(&self) -> BTreeMap<String, SubscriptionState> {
        self.states
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }

    /// Kinds still owing their initial sync.
    pub fn pending(&self) -> Vec<String> {
        let mut pending: Vec<String> = self
            .states
            .iter()
            .filter(|e| e.value().is_pending())
            .map(|e| e.key().clone())
            .collect();
        pending.sort();
        pending
    }

    /// Receiver notified on every state change.
    pub fn subscribe(&self) -> watch::Receiver<()> {
        self.changed.subscribe()
    }

    pub(crate) fn set_state(&self, kind: &str, state: SubscriptionState) {
        let previous = self.states.insert(kind.to_string(), state);
        if previous == Some(state) {
            return;
        }
        tracing::debug!(kind = %kind, from = ?previous, to = %state, "Subscription state changed");
        self.publish(kind, state);
        self.changed.send_replace(());
    }

    fn publish(&self, kind: &str, state: SubscriptionState) {
        for s in SubscriptionState::ALL {
            SUBSCRIPTION_STATE
                .with_label_values(&[kind, s.as_str()])
                .set(i64::from(s == state));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_support::context;
    use crate::handlers::{NodeHandler, PodHandler};

    fn registry() -> HandlerRegistry {
        let ctx = context("c1", "h1");
        HandlerRegistry::new(vec![
            Arc::new(PodHandler::new(ctx.clone()).unwrap()),
            Arc::new(NodeHandler::new(ctx.clone()).unwrap()),
            Arc::new(PodHandler::new(ctx).unwrap()),
        ])
    }

    #[test]
    fn test_lookup_and_dedup() {
        let registry = registry();
        assert_eq!(registry.kinds(), vec!["Pod", "Node"]);
        assert_eq!(registry.gvr_for("Pod").unwrap().resource, "pods");
        assert!(registry.gvr_for("Deployment").is_none());
        assert_eq!(registry.state("Node"), Some(SubscriptionState::Unchecked));
    }

    #[test]
    fn test_active_resources_exclude_skipped() {
        let registry = registry();
        registry.set_state("Pod", SubscriptionState::Synced);
        registry.set_state("Node", SubscriptionState::Skipped);
        let active: Vec<String> = registry.active_resources().into_iter().map(|g| g.kind).collect();
        assert_eq!(active, vec!["Pod"]);
        assert!(registry.pending().is_empty());
    }

    #[tokio::test]
    async fn test_state_changes_notify() {
        let registry = registry();
        let mut rx = registry.subscribe();
        registry.set_state("Pod", SubscriptionState::Syncing);
        rx.changed().await.unwrap();
        assert_eq!(registry.pending(), vec!["Pod"]);
    }
}
