//! In-memory mock implementation of GraphStore for testing.
//!
//! Models nodes as label sets + scalar property maps and relationships as
//! `(from, type, to)` triples, with the same MERGE / full-replace / silent
//! no-op semantics as the Cypher statements issued by `Neo4jClient`.
//! Conditionally compiled with `#[cfg(test)]`.

use crate::neo4j::models::*;
use crate::neo4j::traits::GraphStore;
use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct MockNode {
    pub labels: Vec<String>,
    pub properties: NodeProperties,
}

impl MockNode {
    fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }

    fn prop_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(|v| v.as_str())
    }

    fn matches(&self, node: &NodeRef) -> bool {
        self.has_label(&node.label)
            && self.properties.get(&node.key).is_some_and(|v| v.matches(&node.value))
            && node
                .cluster_name
                .as_deref()
                .map_or(true, |c| self.prop_str(CLUSTER_NAME) == Some(c))
    }

    /// `n.instanceHash IS NOT NULL AND n.instanceHash <> $hash` within a cluster.
    fn is_stale(&self, cluster_name: &str, instance_hash: &str) -> bool {
        self.prop_str(CLUSTER_NAME) == Some(cluster_name)
            && matches!(self.prop_str(INSTANCE_HASH), Some(h) if h != instance_hash)
    }
}

#[derive(Default)]
struct MockGraph {
    next_id: u64,
    nodes: BTreeMap<u64, MockNode>,
    relationships: HashSet<(u64, RelationshipType, u64)>,
}

impl MockGraph {
    fn find(&self, node: &NodeRef) -> Vec<u64> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.matches(node))
            .map(|(id, _)| *id)
            .collect()
    }

    fn detach_delete(&mut self, ids: &[u64]) -> u64 {
        for id in ids {
            self.nodes.remove(id);
        }
        self.relationships
            .retain(|(a, _, b)| !ids.contains(a) && !ids.contains(b));
        ids.len() as u64
    }

    fn delete_where(&mut self, pred: impl Fn(&MockNode) -> bool) -> u64 {
        let ids: Vec<u64> = self
            .nodes
            .iter()
            .filter(|(_, n)| pred(n))
            .map(|(id, _)| *id)
            .collect();
        self.detach_delete(&ids)
    }
}

/// In-memory mock implementation of GraphStore for testing.
pub struct MockGraphStore {
    graph: RwLock<MockGraph>,
    /// When set, every write operation fails (simulates a lost connection).
    pub fail_writes: AtomicBool,
    /// Number of upserts that reached the store (successful or not).
    pub upsert_calls: AtomicUsize,
    /// Of those, the ones that went through the transactional path.
    pub txn_upsert_calls: AtomicUsize,
}

impl MockGraphStore {
    /// Create a new empty MockGraphStore.
    pub fn new() -> Self {
        Self {
            graph: RwLock::new(MockGraph::default()),
            fail_writes: AtomicBool::new(false),
            upsert_calls: AtomicUsize::new(0),
            txn_upsert_calls: AtomicUsize::new(0),
        }
    }

    // ========================================================================
    // Builder / seeding methods for tests
    // ========================================================================

    /// Seed a node without going through the upsert path.
    pub async fn with_node(self, labels: &[&str], properties: PropertyMap) -> Self {
        {
            let mut g = self.graph.write().await;
            let id = g.next_id;
            g.next_id += 1;
            g.nodes.insert(
                id,
                MockNode {
                    labels: labels.iter().map(|l| l.to_string()).collect(),
                    properties: serialize_properties(&properties),
                },
            );
        }
        self
    }

    // ========================================================================
    // Inspection helpers
    // ========================================================================

    /// Every node carrying `label` whose `key` equals `value`.
    pub async fn find_nodes(&self, label: &str, key: &str, value: &str) -> Vec<NodeProperties> {
        let g = self.graph.read().await;
        let node = NodeRef::new(label, key, value);
        g.find(&node)
            .into_iter()
            .filter_map(|id| g.nodes.get(&id).map(|n| n.properties.clone()))
            .collect()
    }

    /// The single node matching `(label, key, value)`, if any.
    pub async fn get_node(&self, label: &str, key: &str, value: &str) -> Option<NodeProperties> {
        self.find_nodes(label, key, value).await.into_iter().next()
    }

    pub async fn node_count(&self, label: &str) -> usize {
        let g = self.graph.read().await;
        g.nodes.values().filter(|n| n.has_label(label)).count()
    }

    pub async fn total_nodes(&self) -> usize {
        self.graph.read().await.nodes.len()
    }

    pub async fn relationship_count(&self) -> usize {
        self.graph.read().await.relationships.len()
    }

    /// Whether a `rel` edge exists between any nodes matching the two refs.
    pub async fn has_relationship(&self, from: &NodeRef, rel: RelationshipType, to: &NodeRef) -> bool {
        let g = self.graph.read().await;
        let froms = g.find(from);
        let tos = g.find(to);
        froms
            .iter()
            .any(|a| tos.iter().any(|b| g.relationships.contains(&(*a, rel, *b))))
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("mock graph store: connection refused");
        }
        Ok(())
    }

    async fn do_upsert(&self, labels: &[&str], properties: &PropertyMap, unique_key: &str) -> Result<()> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        self.check_writable()?;
        // Same validation as the Cypher builder.
        build_upsert_query(labels, unique_key)?;
        let serialized = serialize_properties(properties);
        let key_value = match serialized.get(unique_key) {
            Some(v) => v.clone(),
            None => bail!("properties are missing unique key {:?}", unique_key),
        };

        let mut g = self.graph.write().await;
        let existing = g.nodes.iter().find_map(|(id, n)| {
            let labels_match = labels.iter().all(|l| n.has_label(l));
            let key_match = n.properties.get(unique_key) == Some(&key_value);
            (labels_match && key_match).then_some(*id)
        });
        match existing {
            Some(id) => {
                if let Some(node) = g.nodes.get_mut(&id) {
                    node.properties = serialized;
                }
            }
            None => {
                let id = g.next_id;
                g.next_id += 1;
                g.nodes.insert(
                    id,
                    MockNode {
                        labels: labels.iter().map(|l| l.to_string()).collect(),
                        properties: serialized,
                    },
                );
            }
        }
        Ok(())
    }
}

impl Default for MockGraphStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GraphStore for MockGraphStore {
    async fn upsert_node(&self, labels: &[&str], properties: &PropertyMap, unique_key: &str) -> Result<()> {
        self.do_upsert(labels, properties, unique_key).await
    }

    async fn upsert_node_with_transaction(
        &self,
        labels: &[&str],
        properties: &PropertyMap,
        unique_key: &str,
    ) -> Result<()> {
        self.txn_upsert_calls.fetch_add(1, Ordering::SeqCst);
        self.do_upsert(labels, properties, unique_key).await
    }

    async fn delete_node(&self, label: &str, key: &str, value: &str) -> Result<()> {
        self.check_writable()?;
        build_delete_query(label, key)?;
        let mut g = self.graph.write().await;
        let ids = g.find(&NodeRef::new(label, key, value));
        g.detach_delete(&ids);
        Ok(())
    }

    async fn list_nodes(&self, label: &str, filters: &[(&str, &str)]) -> Result<Vec<NodeProperties>> {
        let g = self.graph.read().await;
        Ok(g.nodes
            .values()
            .filter(|n| n.has_label(label))
            .filter(|n| filters.iter().all(|(k, v)| n.properties.get(*k).is_some_and(|p| p.matches(v))))
            .map(|n| n.properties.clone())
            .collect())
    }

    async fn create_relationship(&self, from: &NodeRef, rel: RelationshipType, to: &NodeRef) -> Result<()> {
        self.check_writable()?;
        build_relationship_query(from, rel, to)?;
        let mut g = self.graph.write().await;
        let froms = g.find(from);
        let tos = g.find(to);
        for a in &froms {
            for b in &tos {
                g.relationships.insert((*a, rel, *b));
            }
        }
        Ok(())
    }

    async fn delete_old_clusters_by_name(&self, cluster_name: &str, instance_hash: &str) -> Result<u64> {
        self.check_writable()?;
        let mut g = self.graph.write().await;
        Ok(g.delete_where(|n| {
            n.has_label(CLUSTER_LABEL)
                && n.prop_str(NAME) == Some(cluster_name)
                && matches!(n.prop_str(INSTANCE_HASH), Some(h) if h != instance_hash)
        }))
    }

    async fn delete_old_resources_by_cluster_name(
        &self,
        label: &str,
        cluster_name: &str,
        instance_hash: &str,
    ) -> Result<u64> {
        self.check_writable()?;
        if label == EVENT_LABEL {
            return Ok(0);
        }
        let mut g = self.graph.write().await;
        Ok(g.delete_where(|n| n.has_label(label) && n.is_stale(cluster_name, instance_hash)))
    }

    async fn cleanup_duplicate_clusters(&self, cluster_name: &str, instance_hash: &str) -> Result<u64> {
        self.check_writable()?;
        let mut g = self.graph.write().await;
        Ok(g.delete_where(|n| !n.has_label(EVENT_LABEL) && n.is_stale(cluster_name, instance_hash)))
    }

    async fn prune_events(&self, cluster_name: &str, cutoff: DateTime<Utc>) -> Result<u64> {
        self.check_writable()?;
        let cutoff = format_timestamp(cutoff);
        let mut g = self.graph.write().await;
        Ok(g.delete_where(|n| {
            n.has_label(EVENT_LABEL)
                && n.prop_str(CLUSTER_NAME) == Some(cluster_name)
                && n.prop_str(CREATED_AT).is_some_and(|ts| ts < cutoff.as_str())
        }))
    }

    async fn count_nodes_by_kind(&self, cluster_name: &str, instance_hash: &str) -> Result<Vec<KindCount>> {
        let g = self.graph.read().await;
        let mut counts: HashMap<String, i64> = HashMap::new();
        for n in g.nodes.values() {
            let in_instance = match n.prop_str(INSTANCE_HASH) {
                Some(h) => h == instance_hash,
                None => true,
            };
            if n.prop_str(CLUSTER_NAME) == Some(cluster_name) && in_instance {
                if let Some(label) = n.labels.first() {
                    *counts.entry(label.clone()).or_default() += 1;
                }
            }
        }
        let mut out: Vec<KindCount> = counts
            .into_iter()
            .map(|(kind, count)| KindCount { kind, count })
            .collect();
        out.sort_by(|a, b| a.kind.cmp(&b.kind));
        Ok(out)
    }

    async fn health_check(&self) -> Result<()> {
        self.check_writable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(value: serde_json::Value) -> PropertyMap {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let store = MockGraphStore::new();
        let p = props(json!({"uid": "p1", "name": "web", "phase": "Running"}));
        store.upsert_node(&["Pod"], &p, UID).await.unwrap();
        store.upsert_node(&["Pod"], &p, UID).await.unwrap();

        assert_eq!(store.node_count("Pod").await, 1);
        let node = store.get_node("Pod", UID, "p1").await.unwrap();
        assert_eq!(node, serialize_properties(&p));
    }

    #[tokio::test]
    async fn test_upsert_replaces_full_property_set() {
        let store = MockGraphStore::new();
        store
            .upsert_node(&["Pod"], &props(json!({"uid": "p1", "a": 1, "b": 2})), UID)
            .await
            .unwrap();
        store
            .upsert_node(&["Pod"], &props(json!({"uid": "p1", "a": 1})), UID)
            .await
            .unwrap();

        let node = store.get_node("Pod", UID, "p1").await.unwrap();
        assert_eq!(node.get("a"), Some(&PropertyValue::Integer(1)));
        assert!(node.get("b").is_none());
    }

    #[tokio::test]
    async fn test_structured_value_stored_as_json_text() {
        let store = MockGraphStore::new();
        store
            .upsert_node(&["Pod"], &props(json!({"uid": "p1", "labels": {"app": "x"}})), UID)
            .await
            .unwrap();
        let node = store.get_node("Pod", UID, "p1").await.unwrap();
        assert_eq!(node["labels"].as_str(), Some(r#"{"app":"x"}"#));
    }

    #[tokio::test]
    async fn test_null_property_is_omitted() {
        let store = MockGraphStore::new();
        store
            .upsert_node(&["Pod"], &props(json!({"uid": "p1", "nodeName": null})), UID)
            .await
            .unwrap();
        let node = store.get_node("Pod", UID, "p1").await.unwrap();
        assert!(!node.contains_key("nodeName"));
    }

    #[tokio::test]
    async fn test_upsert_requires_unique_key_in_properties() {
        let store = MockGraphStore::new();
        let err = store
            .upsert_node(&["Pod"], &props(json!({"name": "web"})), UID)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unique key"));
        assert_eq!(store.total_nodes().await, 0);
    }

    #[tokio::test]
    async fn test_relationship_to_missing_endpoint_is_noop() {
        let store = MockGraphStore::new();
        store
            .upsert_node(&["Pod"], &props(json!({"uid": "p1"})), UID)
            .await
            .unwrap();
        store
            .create_relationship(
                &NodeRef::by_uid("Pod", "p1"),
                RelationshipType::ScheduledOn,
                &NodeRef::new("Node", NAME, "n1"),
            )
            .await
            .unwrap();
        assert_eq!(store.relationship_count().await, 0);
    }

    #[tokio::test]
    async fn test_relationship_is_ensure_exists() {
        let store = MockGraphStore::new()
            .with_node(&["Pod"], props(json!({"uid": "p1"})))
            .await
            .with_node(&["Node"], props(json!({"uid": "n-uid", "name": "n1"})))
            .await;
        let from = NodeRef::by_uid("Pod", "p1");
        let to = NodeRef::new("Node", NAME, "n1");
        store.create_relationship(&from, RelationshipType::ScheduledOn, &to).await.unwrap();
        store.create_relationship(&from, RelationshipType::ScheduledOn, &to).await.unwrap();
        assert_eq!(store.relationship_count().await, 1);
        assert!(store.has_relationship(&from, RelationshipType::ScheduledOn, &to).await);
    }

    #[tokio::test]
    async fn test_delete_node_detaches_relationships() {
        let store = MockGraphStore::new()
            .with_node(&["Pod"], props(json!({"uid": "p1"})))
            .await
            .with_node(&["Node"], props(json!({"uid": "n-uid", "name": "n1"})))
            .await;
        store
            .create_relationship(
                &NodeRef::by_uid("Pod", "p1"),
                RelationshipType::ScheduledOn,
                &NodeRef::new("Node", NAME, "n1"),
            )
            .await
            .unwrap();
        store.delete_node("Pod", UID, "p1").await.unwrap();
        assert_eq!(store.node_count("Pod").await, 0);
        assert_eq!(store.relationship_count().await, 0);
    }

    #[tokio::test]
    async fn test_instance_cleanup_spares_current_and_events() {
        let store = MockGraphStore::new()
            .with_node(&["Pod"], props(json!({"uid": "a", "clusterName": "c1", "instanceHash": "old"})))
            .await
            .with_node(&["Service"], props(json!({"uid": "b", "clusterName": "c1", "instanceHash": "old"})))
            .await
            .with_node(&["Pod"], props(json!({"uid": "c", "clusterName": "c1", "instanceHash": "new"})))
            .await
            .with_node(&["Event"], props(json!({"uid": "e", "clusterName": "c1", "instanceHash": "old"})))
            .await;

        let deleted = store.cleanup_duplicate_clusters("c1", "new").await.unwrap();
        assert_eq!(deleted, 2);
        assert!(store.get_node("Pod", UID, "a").await.is_none());
        assert!(store.get_node("Service", UID, "b").await.is_none());
        assert!(store.get_node("Pod", UID, "c").await.is_some());
        assert!(store.get_node("Event", UID, "e").await.is_some());
    }

    #[tokio::test]
    async fn test_instance_cleanup_ignores_other_clusters_and_missing_hash() {
        let store = MockGraphStore::new()
            .with_node(&["Pod"], props(json!({"uid": "a", "clusterName": "c2", "instanceHash": "old"})))
            .await
            .with_node(&["Pod"], props(json!({"uid": "b", "clusterName": "c1"})))
            .await;
        let deleted = store.cleanup_duplicate_clusters("c1", "new").await.unwrap();
        assert_eq!(deleted, 0);
        assert_eq!(store.node_count("Pod").await, 2);
    }

    #[tokio::test]
    async fn test_prune_events_by_age() {
        let now = Utc::now();
        let old = format_timestamp(now - chrono::Duration::days(8));
        let recent = format_timestamp(now - chrono::Duration::days(1));
        let store = MockGraphStore::new()
            .with_node(&["Event"], props(json!({"uid": "old", "clusterName": "c1", "createdAt": old})))
            .await
            .with_node(&["Event"], props(json!({"uid": "recent", "clusterName": "c1", "createdAt": recent})))
            .await
            .with_node(&["Event"], props(json!({"uid": "other", "clusterName": "c2", "createdAt": old})))
            .await;

        let deleted = store.prune_events("c1", now - chrono::Duration::days(7)).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get_node("Event", UID, "old").await.is_none());
        assert!(store.get_node("Event", UID, "recent").await.is_some());
        // Another cluster's events follow that cluster's own retention.
        assert!(store.get_node("Event", UID, "other").await.is_some());
    }

    #[tokio::test]
    async fn test_count_nodes_by_kind() {
        let store = MockGraphStore::new()
            .with_node(&["Pod"], props(json!({"uid": "a", "clusterName": "c1", "instanceHash": "h"})))
            .await
            .with_node(&["Pod"], props(json!({"uid": "b", "clusterName": "c1", "instanceHash": "h"})))
            .await
            .with_node(&["Event"], props(json!({"uid": "e", "clusterName": "c1"})))
            .await
            .with_node(&["Pod"], props(json!({"uid": "z", "clusterName": "c1", "instanceHash": "other"})))
            .await;
        let counts = store.count_nodes_by_kind("c1", "h").await.unwrap();
        assert_eq!(
            counts,
            vec![
                KindCount { kind: "Event".into(), count: 1 },
                KindCount { kind: "Pod".into(), count: 2 },
            ]
        );
    }
}
