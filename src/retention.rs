//! Retention sweeps over the graph.
//!
//! Two independent sweeps keep the graph bounded:
//! - the instance-staleness sweep removes nodes written by earlier
//!   instances of this cluster name (previous process runs, replaced pods);
//! - the TTL sweep removes `Event` nodes older than the retention window.

use crate::metrics::NODES_SWEPT;
use crate::neo4j::{ClusterIdentity, GraphStore, EVENT_LABEL};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Totals from one instance-staleness sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub clusters: u64,
    pub resources: u64,
    pub duplicates: u64,
}

impl SweepReport {
    pub fn total(&self) -> u64 {
        self.clusters + self.resources + self.duplicates
    }
}

pub struct RetentionSweeper {
    store: Arc<dyn GraphStore>,
    identity: ClusterIdentity,
    retention_days: i64,
    interval: Duration,
}

impl RetentionSweeper {
    pub fn new(
        store: Arc<dyn GraphStore>,
        identity: ClusterIdentity,
        retention_days: i64,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            identity,
            retention_days,
            interval,
        }
    }

    /// A non-positive retention disables the TTL sweep.
    pub fn is_enabled(&self) -> bool {
        self.retention_days > 0
    }

    /// Delete every node of this cluster name written by another instance.
    ///
    /// `kinds` are the labels swept one by one; `Event` is always skipped
    /// since events age out through the TTL sweep instead. A failure on one
    /// kind is logged and the sweep moves on.
    pub async fn sweep_stale_instances(&self, kinds: &[String]) -> anyhow::Result<SweepReport> {
        let ClusterIdentity {
            cluster_name,
            instance_hash,
        } = &self.identity;
        let mut report = SweepReport {
            clusters: self
                .store
                .delete_old_clusters_by_name(cluster_name, instance_hash)
                .await?,
            ..Default::default()
        };

        for kind in kinds.iter().filter(|k| k.as_str() != EVENT_LABEL) {
            match self
                .store
                .delete_old_resources_by_cluster_name(kind, cluster_name, instance_hash)
                .await
            {
                Ok(n) => {
                    if n > 0 {
                        tracing::debug!(kind = %kind, deleted = n, "Removed stale nodes");
                    }
                    report.resources += n;
                }
                Err(e) => tracing::warn!(kind = %kind, error = %e, "Stale node cleanup failed"),
            }
        }

        report.duplicates = self
            .store
            .cleanup_duplicate_clusters(cluster_name, instance_hash)
            .await?;

        NODES_SWEPT
            .with_label_values(&["instance"])
            .inc_by(report.total());
        tracing::info!(
            cluster = %cluster_name,
            instance = %instance_hash,
            clusters = report.clusters,
            resources = report.resources,
            duplicates = report.duplicates,
            "Instance cleanup finished"
        );
        Ok(report)
    }

    /// Delete `Event` nodes older than the retention window ending at `now`.
    pub async fn prune_events_at(&self, now: DateTime<Utc>) -> anyhow::Result<u64> {
        if !self.is_enabled() {
            return Ok(0);
        }
        let Some(cutoff) = ChronoDuration::try_days(self.retention_days)
            .and_then(|window| now.checked_sub_signed(window))
        else {
            tracing::warn!(
                retention_days = self.retention_days,
                "Retention window reaches past the representable date range, nothing to prune"
            );
            return Ok(0);
        };
        let deleted = self
            .store
            .prune_events(&self.identity.cluster_name, cutoff)
            .await?;
        NODES_SWEPT.with_label_values(&["ttl"]).inc_by(deleted);
        if deleted > 0 {
            tracing::info!(deleted, cutoff = %cutoff, "Pruned expired events");
        }
        Ok(deleted)
    }

    pub async fn prune_events(&self) -> anyhow::Result<u64> {
        self.prune_events_at(Utc::now()).await
    }

    /// TTL sweep loop, until cancelled. Runs once immediately.
    pub async fn run_ttl(&self, cancel: CancellationToken) {
        if !self.is_enabled() {
            tracing::info!("Event retention disabled, TTL sweep not started");
            return;
        }
        let mut ticker = tokio::time::interval(self.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.prune_events().await {
                        tracing::warn!(error = %e, "Event TTL sweep failed");
                    }
                }
            }
        }
        tracing::debug!("TTL sweep stopped");
    }
}
