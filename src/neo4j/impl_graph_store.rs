//! `GraphStore` implementation for `Neo4jClient`.
//!
//! Every method delegates to the corresponding inherent method on `Neo4jClient`
//! and records its count, outcome, latency and in-flight session.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::client::Neo4jClient;
use super::models::*;
use super::traits::GraphStore;
use crate::metrics::instrument;

#[async_trait]
impl GraphStore for Neo4jClient {
    // ========================================================================
    // Node operations
    // ========================================================================

    async fn upsert_node(
        &self,
        labels: &[&str],
        properties: &PropertyMap,
        unique_key: &str,
    ) -> anyhow::Result<()> {
        instrument(
            "upsert_node",
            self.upsert_node(labels, properties, unique_key),
        )
        .await
    }

    async fn upsert_node_with_transaction(
        &self,
        labels: &[&str],
        properties: &PropertyMap,
        unique_key: &str,
    ) -> anyhow::Result<()> {
        instrument(
            "upsert_node_txn",
            self.upsert_node_with_transaction(labels, properties, unique_key),
        )
        .await
    }

    async fn delete_node(&self, label: &str, key: &str, value: &str) -> anyhow::Result<()> {
        instrument("delete_node", self.delete_node(label, key, value)).await
    }

    async fn list_nodes(
        &self,
        label: &str,
        filters: &[(&str, &str)],
    ) -> anyhow::Result<Vec<NodeProperties>> {
        instrument("list_nodes", self.list_nodes(label, filters)).await
    }

    // ========================================================================
    // Relationship operations
    // ========================================================================

    async fn create_relationship(
        &self,
        from: &NodeRef,
        rel: RelationshipType,
        to: &NodeRef,
    ) -> anyhow::Result<()> {
        instrument(
            "create_relationship",
            self.create_relationship(from, rel, to),
        )
        .await
    }

    // ========================================================================
    // Cleanup and retention
    // ========================================================================

    async fn delete_old_clusters_by_name(
        &self,
        cluster_name: &str,
        instance_hash: &str,
    ) -> anyhow::Result<u64> {
        instrument(
            "delete_old_clusters",
            self.delete_old_clusters_by_name(cluster_name, instance_hash),
        )
        .await
    }

    async fn delete_old_resources_by_cluster_name(
        &self,
        label: &str,
        cluster_name: &str,
        instance_hash: &str,
    ) -> anyhow::Result<u64> {
        instrument(
            "delete_old_resources",
            self.delete_old_resources_by_cluster_name(label, cluster_name, instance_hash),
        )
        .await
    }

    async fn cleanup_duplicate_clusters(
        &self,
        cluster_name: &str,
        instance_hash: &str,
    ) -> anyhow::Result<u64> {
        instrument(
            "cleanup_duplicate_clusters",
            self.cleanup_duplicate_clusters(cluster_name, instance_hash),
        )
        .await
    }

    async fn prune_events(&self, cluster_name: &str, cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
        instrument("prune_events", self.prune_events(cluster_name, cutoff)).await
    }

    // ========================================================================
    // Status
    // ========================================================================

    async fn count_nodes_by_kind(
        &self,
        cluster_name: &str,
        instance_hash: &str,
    ) -> anyhow::Result<Vec<KindCount>> {
        instrument(
            "count_nodes_by_kind",
            self.count_nodes_by_kind(cluster_name, instance_hash),
        )
        .await
    }

    async fn health_check(&self) -> anyhow::Result<()> {
        instrument("health_check", self.health_check()).await
    }
}
