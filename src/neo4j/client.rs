//! Neo4j client for mirroring cluster state into the graph

use super::models::*;
use crate::metrics::instrument;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use neo4rs::{query, ConfigBuilder, Graph, Query};
use std::sync::Arc;
use std::time::Duration;

/// Attempts made by [`Neo4jClient::upsert_node_with_transaction`].
const TXN_MAX_ATTEMPTS: u32 = 3;
/// Base delay between transaction attempts (doubled each retry).
const TXN_RETRY_BASE: Duration = Duration::from_millis(100);

/// Connection settings for [`Neo4jClient::connect`].
#[derive(Debug, Clone)]
pub struct Neo4jSettings {
    pub uri: String,
    pub user: String,
    pub password: String,
    pub database: String,
    pub max_connections: usize,
    pub fetch_size: usize,
    pub connect_timeout: Duration,
}

/// Client for Neo4j operations
#[derive(Clone)]
pub struct Neo4jClient {
    graph: Arc<Graph>,
}

impl Neo4jClient {
    /// Create a new Neo4j client.
    ///
    /// neo4rs builds its pool lazily, so a `RETURN 1` ping is run right away
    /// (bounded by `connect_timeout`) to fail fast when the database is down.
    pub async fn connect(settings: &Neo4jSettings) -> Result<Self> {
        let config = ConfigBuilder::default()
            .uri(&settings.uri)
            .user(&settings.user)
            .password(&settings.password)
            .db(settings.database.as_str())
            .max_connections(settings.max_connections)
            .fetch_size(settings.fetch_size)
            .build()
            .context("Failed to build Neo4j config")?;

        let graph = Graph::connect(config)
            .await
            .context("Failed to create Neo4j connection pool")?;

        let client = Self {
            graph: Arc::new(graph),
        };

        tokio::time::timeout(settings.connect_timeout, client.ping())
            .await
            .with_context(|| {
                format!(
                    "Neo4j at {} did not answer within {:?}",
                    settings.uri, settings.connect_timeout
                )
            })??;

        tracing::info!(uri = %settings.uri, database = %settings.database, "Connected to Neo4j");
        Ok(client)
    }

    async fn ping(&self) -> Result<()> {
        self.graph
            .run(query("RETURN 1"))
            .await
            .context("Neo4j is not responding to queries")
    }

    /// Create a `uid` uniqueness constraint for every label.
    ///
    /// Failures are logged and skipped (editions without constraint support,
    /// pre-existing duplicate data).
    pub async fn ensure_constraints(&self, labels: &[&str]) -> Result<()> {
        for label in labels {
            if !is_valid_identifier(label) {
                bail!("invalid label {:?}", label);
            }
            let cypher = format!(
                "CREATE CONSTRAINT {}_uid IF NOT EXISTS FOR (n:{}) REQUIRE n.uid IS UNIQUE",
                label.to_lowercase(),
                label
            );
            if let Err(e) = self.graph.run(query(&cypher)).await {
                tracing::warn!(label, error = %e, "Uniqueness constraint skipped");
            }
        }
        Ok(())
    }

    // ========================================================================
    // Ad-hoc units of work
    // ========================================================================

    /// Execute a parameterized read query and collect its rows.
    pub async fn execute_read(&self, q: Query) -> Result<Vec<neo4rs::Row>> {
        instrument("execute_read", self.collect_rows(q)).await
    }

    /// Execute a parameterized write query inside its own transaction.
    pub async fn execute_write(&self, q: Query) -> Result<()> {
        instrument("execute_write", self.run_in_txn(q)).await
    }

    async fn collect_rows(&self, q: Query) -> Result<Vec<neo4rs::Row>> {
        let mut result = self.graph.execute(q).await?;
        let mut rows = Vec::new();
        while let Some(row) = result.next().await? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// Run a `... RETURN count(*) AS deleted` statement and read the count.
    async fn run_delete(&self, q: Query) -> Result<u64> {
        let rows = self.collect_rows(q).await?;
        let deleted = match rows.first() {
            Some(row) => row.get::<i64>("deleted").unwrap_or(0),
            None => 0,
        };
        Ok(deleted.max(0) as u64)
    }

    // ========================================================================
    // Node operations
    // ========================================================================

    fn upsert_query(labels: &[&str], properties: &PropertyMap, unique_key: &str) -> Result<Query> {
        let cypher = build_upsert_query(labels, unique_key)?;
        let serialized = serialize_properties(properties);
        let key_value = match serialized.get(unique_key) {
            Some(v) => v.clone(),
            None => bail!("properties are missing unique key {:?}", unique_key),
        };
        Ok(query(&cypher)
            .param(unique_key, key_value)
            .param("properties", to_bolt_map(serialized)))
    }

    /// Full-replace upsert as a single auto-committed statement.
    pub async fn upsert_node(
        &self,
        labels: &[&str],
        properties: &PropertyMap,
        unique_key: &str,
    ) -> Result<()> {
        let q = Self::upsert_query(labels, properties, unique_key)?;
        self.graph.run(q).await.context("Node upsert failed")
    }

    /// Full-replace upsert inside an explicit transaction, retried with
    /// exponential backoff on failure.
    pub async fn upsert_node_with_transaction(
        &self,
        labels: &[&str],
        properties: &PropertyMap,
        unique_key: &str,
    ) -> Result<()> {
        // Validate once; statement errors are not worth retrying.
        Self::upsert_query(labels, properties, unique_key)?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let q = Self::upsert_query(labels, properties, unique_key)?;
            match self.run_in_txn(q).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < TXN_MAX_ATTEMPTS => {
                    let delay = TXN_RETRY_BASE * 2u32.pow(attempt - 1);
                    tracing::debug!(attempt, error = %e, "Retrying upsert transaction in {:?}", delay);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e.context("Transactional node upsert failed")),
            }
        }
    }

    async fn run_in_txn(&self, q: Query) -> Result<()> {
        let mut txn = self.graph.start_txn().await?;
        if let Err(e) = txn.run(q).await {
            if let Err(rollback) = txn.rollback().await {
                tracing::debug!(error = %rollback, "Transaction rollback failed");
            }
            return Err(e.into());
        }
        txn.commit().await?;
        Ok(())
    }

    /// Detach-delete the node matching `(label, key, value)`.
    pub async fn delete_node(&self, label: &str, key: &str, value: &str) -> Result<()> {
        let q = query(&build_delete_query(label, key)?).param("value", value);
        self.graph.run(q).await.context("Node delete failed")
    }

    /// Property maps of `label` nodes matching every `(key, value)` filter.
    pub async fn list_nodes(
        &self,
        label: &str,
        filters: &[(&str, &str)],
    ) -> Result<Vec<NodeProperties>> {
        if !is_valid_identifier(label) {
            bail!("invalid label {:?}", label);
        }
        let mut conditions = Vec::with_capacity(filters.len());
        for (i, (key, _)) in filters.iter().enumerate() {
            if !is_valid_identifier(key) {
                bail!("invalid property key {:?}", key);
            }
            conditions.push(format!("n.{} = $f{}", key, i));
        }
        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };
        let mut q = query(&format!("MATCH (n:{}) {} RETURN n", label, where_clause));
        for (i, (_, value)) in filters.iter().enumerate() {
            q = q.param(&format!("f{}", i), *value);
        }

        let rows = self.collect_rows(q).await?;
        let mut nodes = Vec::with_capacity(rows.len());
        for row in rows {
            let node: neo4rs::Node = row.get("n")?;
            nodes.push(node_properties(&node));
        }
        Ok(nodes)
    }

    // ========================================================================
    // Relationship operations
    // ========================================================================

    /// MATCH both endpoints, MERGE the edge. Zero matches creates nothing.
    pub async fn create_relationship(
        &self,
        from: &NodeRef,
        rel: RelationshipType,
        to: &NodeRef,
    ) -> Result<()> {
        let mut q = query(&build_relationship_query(from, rel, to)?)
            .param("a_value", from.value.as_str())
            .param("b_value", to.value.as_str());
        if let Some(cluster) = &from.cluster_name {
            q = q.param("a_cluster", cluster.as_str());
        }
        if let Some(cluster) = &to.cluster_name {
            q = q.param("b_cluster", cluster.as_str());
        }
        self.graph.run(q).await.context("Relationship merge failed")
    }

    // ========================================================================
    // Cleanup and retention
    // ========================================================================

    pub async fn delete_old_clusters_by_name(
        &self,
        cluster_name: &str,
        instance_hash: &str,
    ) -> Result<u64> {
        let q = query(&format!(
            "MATCH (c:{} {{name: $cluster_name}})
             WHERE c.instanceHash IS NOT NULL AND c.instanceHash <> $instance_hash
             DETACH DELETE c
             RETURN count(*) AS deleted",
            CLUSTER_LABEL
        ))
        .param("cluster_name", cluster_name)
        .param("instance_hash", instance_hash);
        self.run_delete(q).await
    }

    pub async fn delete_old_resources_by_cluster_name(
        &self,
        label: &str,
        cluster_name: &str,
        instance_hash: &str,
    ) -> Result<u64> {
        if !is_valid_identifier(label) {
            bail!("invalid label {:?}", label);
        }
        if label == EVENT_LABEL {
            return Ok(0);
        }
        let q = query(&format!(
            "MATCH (n:{} {{clusterName: $cluster_name}})
             WHERE n.instanceHash IS NOT NULL AND n.instanceHash <> $instance_hash
             DETACH DELETE n
             RETURN count(*) AS deleted",
            label
        ))
        .param("cluster_name", cluster_name)
        .param("instance_hash", instance_hash);
        self.run_delete(q).await
    }

    pub async fn cleanup_duplicate_clusters(
        &self,
        cluster_name: &str,
        instance_hash: &str,
    ) -> Result<u64> {
        let q = query(&format!(
            "MATCH (n {{clusterName: $cluster_name}})
             WHERE NOT n:{}
               AND n.instanceHash IS NOT NULL
               AND n.instanceHash <> $instance_hash
             DETACH DELETE n
             RETURN count(*) AS deleted",
            EVENT_LABEL
        ))
        .param("cluster_name", cluster_name)
        .param("instance_hash", instance_hash);
        self.run_delete(q).await
    }

    pub async fn prune_events(&self, cluster_name: &str, cutoff: DateTime<Utc>) -> Result<u64> {
        let q = query(&format!(
            "MATCH (e:{}) WHERE e.clusterName = $cluster_name AND e.createdAt < $cutoff
             DETACH DELETE e
             RETURN count(*) AS deleted",
            EVENT_LABEL
        ))
        .param("cluster_name", cluster_name)
        .param("cutoff", format_timestamp(cutoff));
        self.run_delete(q).await
    }

    // ========================================================================
    // Status
    // ========================================================================

    pub async fn count_nodes_by_kind(
        &self,
        cluster_name: &str,
        instance_hash: &str,
    ) -> Result<Vec<KindCount>> {
        let q = query(
            "MATCH (n {clusterName: $cluster_name})
             WHERE n.instanceHash = $instance_hash OR n.instanceHash IS NULL
             RETURN labels(n)[0] AS kind, count(n) AS count
             ORDER BY kind",
        )
        .param("cluster_name", cluster_name)
        .param("instance_hash", instance_hash);

        let rows = self.collect_rows(q).await?;
        let mut counts = Vec::with_capacity(rows.len());
        for row in rows {
            let kind: String = row.get("kind").unwrap_or_default();
            let count: i64 = row.get("count").unwrap_or(0);
            counts.push(KindCount { kind, count });
        }
        Ok(counts)
    }

    pub async fn health_check(&self) -> Result<()> {
        self.ping().await
    }
}

/// Read every property of a returned node back into scalar form.
fn node_properties(node: &neo4rs::Node) -> NodeProperties {
    let mut props = NodeProperties::new();
    for key in node.keys() {
        let value = if let Ok(b) = node.get::<bool>(key) {
            PropertyValue::Boolean(b)
        } else if let Ok(i) = node.get::<i64>(key) {
            PropertyValue::Integer(i)
        } else if let Ok(x) = node.get::<f64>(key) {
            PropertyValue::Float(x)
        } else if let Ok(s) = node.get::<String>(key) {
            PropertyValue::String(s)
        } else {
            continue;
        };
        props.insert(key.to_string(), value);
    }
    props
}
