//! In-memory `ClusterSource` for testing.
//!
//! Each kind replays a scripted list of notifications and then stays open,
//! like a live watch with nothing further to report.
//! Conditionally compiled with `#[cfg(test)]`.

use super::source::{ClusterSource, ProbeError, WatchEvent, WatchStream};
use crate::handlers::Gvr;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy)]
pub enum ProbeOutcome {
    NotFound,
    Forbidden,
    Flaky,
}

#[derive(Default)]
pub struct MemorySource {
    scripts: HashMap<String, Vec<WatchEvent>>,
    probes: HashMap<String, ProbeOutcome>,
    watched: Mutex<HashSet<String>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the notifications delivered for `kind`.
    pub fn with_events(mut self, kind: &str, events: Vec<WatchEvent>) -> Self {
        self.scripts.insert(kind.to_string(), events);
        self
    }

    pub fn with_probe(mut self, kind: &str, outcome: ProbeOutcome) -> Self {
        self.probes.insert(kind.to_string(), outcome);
        self
    }

    pub fn was_watched(&self, kind: &str) -> bool {
        self.watched
            .lock()
            .map(|w| w.contains(kind))
            .unwrap_or(false)
    }
}

#[async_trait]
impl ClusterSource for MemorySource {
    async fn probe(&self, gvr: &Gvr) -> Result<(), ProbeError> {
        match self.probes.get(&gvr.kind) {
            None => Ok(()),
            Some(ProbeOutcome::NotFound) => Err(ProbeError::NotFound(gvr.to_string())),
            Some(ProbeOutcome::Forbidden) => Err(ProbeError::Forbidden(gvr.to_string())),
            Some(ProbeOutcome::Flaky) => Err(ProbeError::Other(anyhow::anyhow!("connection reset"))),
        }
    }

    fn watch(&self, gvr: &Gvr) -> WatchStream {
        if let Ok(mut watched) = self.watched.lock() {
            watched.insert(gvr.kind.clone());
        }
        let events = self.scripts.get(&gvr.kind).cloned().unwrap_or_default();
        stream::iter(events.into_iter().map(Ok))
            .chain(stream::pending())
            .boxed()
    }
}
