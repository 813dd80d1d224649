//! Shared plumbing for handlers: metadata properties, node references and
//! best-effort relationship emission.

use super::{ConversionError, Gvr, HandlerContext, HandlerError, RegistryError};
use crate::neo4j::models::*;
use crate::neo4j::GraphStore;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Label of namespace nodes, the target of `BELONGS_TO`.
pub(crate) const NAMESPACE_LABEL: &str = "Namespace";

/// Implements the identity half of `ResourceHandler` for a handler holding
/// a `base: HandlerBase` field.
macro_rules! handler_identity {
    () => {
        fn gvr(&self) -> &$crate::handlers::Gvr {
            self.base.gvr()
        }

        fn kind(&self) -> &str {
            self.base.kind()
        }
    };
}
pub(crate) use handler_identity;

/// State shared by every handler: its resource type and construction context.
pub(crate) struct HandlerBase {
    ctx: HandlerContext,
    gvr: Gvr,
}

impl HandlerBase {
    /// Registers the kind in the owner registry.
    pub fn new(ctx: HandlerContext, gvr: Gvr) -> Result<Self, RegistryError> {
        ctx.owners.register(&gvr.kind)?;
        Ok(Self { ctx, gvr })
    }

    pub fn gvr(&self) -> &Gvr {
        &self.gvr
    }

    pub fn kind(&self) -> &str {
        &self.gvr.kind
    }

    pub fn cluster_name(&self) -> &str {
        &self.ctx.identity.cluster_name
    }

    pub fn instance_hash(&self) -> &str {
        &self.ctx.identity.instance_hash
    }

    /// Properties every node carries, derived from object metadata.
    pub fn base_properties(&self, meta: &ObjectMeta) -> Result<PropertyMap, ConversionError> {
        let uid = meta
            .uid
            .clone()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| ConversionError::MissingUid { kind: self.kind().to_string() })?;

        let mut props = PropertyMap::new();
        props.insert(UID.into(), json!(uid));
        props.insert(NAME.into(), json!(meta.name));
        props.insert(NAMESPACE.into(), json!(meta.namespace));
        if let (Some(ns), Some(name)) = (&meta.namespace, &meta.name) {
            props.insert(NAMESPACED_NAME.into(), json!(namespaced_name(ns, name)));
        }
        props.insert(CLUSTER_NAME.into(), json!(self.cluster_name()));
        props.insert(INSTANCE_HASH.into(), json!(self.instance_hash()));
        props.insert("labels".into(), json!(meta.labels));
        props.insert("annotations".into(), json!(meta.annotations));
        props.insert("creationTimestamp".into(), json!(timestamp(&meta.creation_timestamp)));
        Ok(props)
    }

    /// Reference to this handler's own node.
    pub fn self_ref(&self, uid: &str) -> NodeRef {
        NodeRef::by_uid(self.kind(), uid)
    }

    /// Reference to the node of the object described by `meta`.
    pub fn node_ref(&self, meta: &ObjectMeta) -> NodeRef {
        self.self_ref(meta.uid.as_deref().unwrap_or_default())
    }

    /// A namespaced object of `label` addressed by name, in this cluster.
    pub fn namespaced_ref(&self, label: &str, namespace: &str, name: &str) -> NodeRef {
        NodeRef::new(label, NAMESPACED_NAME, namespaced_name(namespace, name)).in_cluster(self.cluster_name())
    }

    /// A cluster-scoped object of `label` addressed by name, in this cluster.
    pub fn cluster_ref(&self, label: &str, name: &str) -> NodeRef {
        NodeRef::new(label, NAME, name).in_cluster(self.cluster_name())
    }

    /// Label registered for `kind`, logging when nothing handles it.
    pub fn label_for(&self, kind: &str) -> Option<String> {
        let label = self.ctx.owners.label_for(kind);
        if label.is_none() {
            tracing::debug!(kind = %self.kind(), target_kind = %kind, "No handler registered for referenced kind");
        }
        label
    }

    pub async fn upsert(&self, store: &dyn GraphStore, props: &PropertyMap) -> Result<(), HandlerError> {
        store.upsert_node(&[self.kind()], props, UID).await?;
        Ok(())
    }

    /// Ensure an edge exists. Failures are logged and swallowed.
    pub async fn link(&self, store: &dyn GraphStore, from: &NodeRef, rel: RelationshipType, to: &NodeRef) {
        if let Err(e) = store.create_relationship(from, rel, to).await {
            tracing::warn!(
                kind = %self.kind(),
                from = %from,
                rel = %rel,
                to = %to,
                error = %e,
                "Failed to create relationship"
            );
        }
    }

    /// Owner-reference edges (`MANAGES` for the controller, `OWNS`
    /// otherwise) and namespace membership.
    pub async fn link_metadata(&self, store: &dyn GraphStore, meta: &ObjectMeta, me: &NodeRef) {
        for owner in meta.owner_references.iter().flatten() {
            let Some(label) = self.label_for(&owner.kind) else {
                continue;
            };
            let rel = if owner.controller == Some(true) {
                RelationshipType::Manages
            } else {
                RelationshipType::Owns
            };
            self.link(store, &NodeRef::by_uid(label, owner.uid.as_str()), rel, me).await;
        }

        if let Some(ns) = &meta.namespace {
            let namespace = self.cluster_ref(NAMESPACE_LABEL, ns);
            self.link(store, me, RelationshipType::BelongsTo, &namespace).await;
        }
    }
}

pub(crate) fn namespaced_name(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

pub(crate) fn timestamp(time: &Option<Time>) -> Option<String> {
    time.as_ref().map(|t| format_timestamp(t.0))
}

/// `name` of a local object reference, whatever its optionality in the API types.
pub(crate) fn reference_name<T: Serialize>(reference: &T) -> Option<String> {
    serde_json::to_value(reference)
        .ok()?
        .get(NAME)?
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Whether every `selector` entry is present in the stored `labels` JSON text.
/// An empty selector selects nothing.
pub(crate) fn selector_matches(selector: &BTreeMap<String, String>, labels: Option<&str>) -> bool {
    if selector.is_empty() {
        return false;
    }
    let Some(labels) = labels.and_then(|l| serde_json::from_str::<BTreeMap<String, String>>(l).ok()) else {
        return false;
    };
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

/// Parse a selector stored as JSON text on a node.
pub(crate) fn stored_selector(value: Option<&PropertyValue>) -> Option<BTreeMap<String, String>> {
    value
        .and_then(|v| v.as_str())
        .and_then(|s| serde_json::from_str(s).ok())
}

/// Names of every key in a data map, as a JSON array. Values are never kept.
pub(crate) fn key_list<V>(data: &Option<BTreeMap<String, V>>) -> Value {
    match data {
        Some(map) => json!(map.keys().collect::<Vec<_>>()),
        None => Value::Null,
    }
}
