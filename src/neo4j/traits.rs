//! GraphStore trait definition
//!
//! Defines the abstract interface for all graph operations performed by the
//! synchronization core. `Neo4jClient` implements it against a live database;
//! an in-memory implementation backs the unit tests.

use crate::neo4j::models::*;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Abstract interface for all graph database operations.
///
/// Every method is safe to call concurrently from many handler invocations.
#[async_trait]
pub trait GraphStore: Send + Sync {
    // ========================================================================
    // Node operations
    // ========================================================================

    /// Ensure the node with `labels` and this unique key has exactly
    /// `properties` (full replace). `properties` must contain `unique_key`.
    async fn upsert_node(&self, labels: &[&str], properties: &PropertyMap, unique_key: &str)
        -> Result<()>;

    /// Same contract as [`GraphStore::upsert_node`], inside an explicit,
    /// retried transaction.
    async fn upsert_node_with_transaction(
        &self,
        labels: &[&str],
        properties: &PropertyMap,
        unique_key: &str,
    ) -> Result<()>;

    /// Delete the node matching `(label, key, value)` and all its relationships.
    async fn delete_node(&self, label: &str, key: &str, value: &str) -> Result<()>;

    /// Property maps of every `label` node whose properties equal all `filters`.
    async fn list_nodes(&self, label: &str, filters: &[(&str, &str)]) -> Result<Vec<NodeProperties>>;

    // ========================================================================
    // Relationship operations
    // ========================================================================

    /// Ensure a typed edge exists between two nodes. A missing endpoint is
    /// not an error: nothing is created.
    async fn create_relationship(&self, from: &NodeRef, rel: RelationshipType, to: &NodeRef)
        -> Result<()>;

    // ========================================================================
    // Cleanup and retention
    // ========================================================================

    /// Delete `Cluster` nodes named `cluster_name` written by another instance.
    async fn delete_old_clusters_by_name(&self, cluster_name: &str, instance_hash: &str)
        -> Result<u64>;

    /// Delete `label` nodes of `cluster_name` whose instance hash is present
    /// and differs from `instance_hash`.
    async fn delete_old_resources_by_cluster_name(
        &self,
        label: &str,
        cluster_name: &str,
        instance_hash: &str,
    ) -> Result<u64>;

    /// Same predicate as above across every label except `Event`.
    async fn cleanup_duplicate_clusters(&self, cluster_name: &str, instance_hash: &str)
        -> Result<u64>;

    /// Delete `Event` nodes of `cluster_name` whose `createdAt` is older
    /// than `cutoff`.
    async fn prune_events(&self, cluster_name: &str, cutoff: DateTime<Utc>) -> Result<u64>;

    // ========================================================================
    // Status
    // ========================================================================

    /// Node counts per label for one instance.
    async fn count_nodes_by_kind(&self, cluster_name: &str, instance_hash: &str)
        -> Result<Vec<KindCount>>;

    /// Verify connectivity.
    async fn health_check(&self) -> Result<()>;
}
