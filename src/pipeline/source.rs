//! The cluster-facing side of the pipeline: availability probes and
//! per-kind watch streams.

use crate::handlers::{Gvr, RawObject};
use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

/// One notification from a per-kind watch.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Added(RawObject),
    Updated(RawObject),
    Deleted(RawObject),
    /// The initial listing has been fully delivered.
    Synced,
}

impl WatchEvent {
    pub fn name(&self) -> &'static str {
        match self {
            WatchEvent::Added(_) => "add",
            WatchEvent::Updated(_) => "update",
            WatchEvent::Deleted(_) => "delete",
            WatchEvent::Synced => "synced",
        }
    }

    pub fn object(&self) -> Option<&RawObject> {
        match self {
            WatchEvent::Added(o) | WatchEvent::Updated(o) | WatchEvent::Deleted(o) => Some(o),
            WatchEvent::Synced => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("resource type not served: {0}")]
    NotFound(String),
    #[error("access forbidden: {0}")]
    Forbidden(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProbeError {
    /// Whether the resource type is unavailable to this process, as opposed
    /// to a transient failure.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, ProbeError::NotFound(_) | ProbeError::Forbidden(_))
    }
}

/// Watch notifications; stream errors are transient and do not end the watch.
pub type WatchStream = BoxStream<'static, anyhow::Result<WatchEvent>>;

/// Source of cluster state for the pipeline.
#[async_trait]
pub trait ClusterSource: Send + Sync {
    /// Minimal list call telling whether the resource type can be watched.
    async fn probe(&self, gvr: &Gvr) -> Result<(), ProbeError>;

    /// Subscribe to every object of the resource type, across namespaces.
    fn watch(&self, gvr: &Gvr) -> WatchStream;
}
