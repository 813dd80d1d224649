//! Graph models: property values, node references, relationship vocabulary
//! and Cypher statement builders shared by every `GraphStore` implementation.

use anyhow::{bail, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use neo4rs::{BoltMap, BoltString, BoltType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// Well-known labels and property keys
// ============================================================================

/// Label of Kubernetes Event nodes (exempt from instance cleanup).
pub const EVENT_LABEL: &str = "Event";
/// Label of the per-instance cluster node.
pub const CLUSTER_LABEL: &str = "Cluster";

pub const UID: &str = "uid";
pub const NAME: &str = "name";
pub const NAMESPACE: &str = "namespace";
pub const NAMESPACED_NAME: &str = "namespacedName";
pub const CLUSTER_NAME: &str = "clusterName";
pub const INSTANCE_HASH: &str = "instanceHash";
pub const CREATED_AT: &str = "createdAt";

/// Raw, unserialized node properties as produced by resource handlers.
pub type PropertyMap = serde_json::Map<String, serde_json::Value>;

/// Serialized node properties: only scalars survive.
pub type NodeProperties = BTreeMap<String, PropertyValue>;

// ============================================================================
// Property values
// ============================================================================

/// A scalar property value as stored on a graph node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

impl PropertyValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Whether this value equals the given string under Cypher equality
    /// (only string values can match).
    pub fn matches(&self, value: &str) -> bool {
        self.as_str() == Some(value)
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Boolean(b) => write!(f, "{}", b),
            PropertyValue::Integer(i) => write!(f, "{}", i),
            PropertyValue::Float(x) => write!(f, "{}", x),
            PropertyValue::String(s) => f.write_str(s),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        PropertyValue::String(s.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        PropertyValue::String(s)
    }
}

impl From<PropertyValue> for BoltType {
    fn from(value: PropertyValue) -> Self {
        match value {
            PropertyValue::Boolean(b) => BoltType::from(b),
            PropertyValue::Integer(i) => BoltType::from(i),
            PropertyValue::Float(x) => BoltType::from(x),
            PropertyValue::String(s) => BoltType::from(s),
        }
    }
}

/// Convert a single JSON value into its stored form.
///
/// `null` yields `None` (the property is omitted). Objects and arrays are
/// stored as their compact JSON text.
pub fn serialize_value(value: &serde_json::Value) -> Option<PropertyValue> {
    use serde_json::Value;
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(PropertyValue::Boolean(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Some(PropertyValue::Integer(i)),
            None => n.as_f64().map(PropertyValue::Float),
        },
        Value::String(s) => Some(PropertyValue::String(s.clone())),
        Value::Array(_) | Value::Object(_) => Some(PropertyValue::String(value.to_string())),
    }
}

/// Serialize a raw property map into storable scalar properties.
pub fn serialize_properties(properties: &PropertyMap) -> NodeProperties {
    properties
        .iter()
        .filter_map(|(k, v)| serialize_value(v).map(|pv| (k.clone(), pv)))
        .collect()
}

/// Build the Bolt map sent as `$properties`.
pub fn to_bolt_map(properties: NodeProperties) -> BoltType {
    let mut map = BoltMap::new();
    for (k, v) in properties {
        map.put(BoltString::from(k.as_str()), v.into());
    }
    BoltType::Map(map)
}

/// Timestamp format used for `createdAt` / `startedAt` (lexicographically ordered).
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

// ============================================================================
// Identity
// ============================================================================

/// `(clusterName, instanceHash)` of the running process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterIdentity {
    pub cluster_name: String,
    pub instance_hash: String,
}

impl ClusterIdentity {
    pub fn new(cluster_name: impl Into<String>, instance_hash: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            instance_hash: instance_hash.into(),
        }
    }

    /// Unique key of this instance's `Cluster` node.
    pub fn cluster_uid(&self) -> String {
        format!("{}/{}", self.cluster_name, self.instance_hash)
    }
}

// ============================================================================
// Relationships
// ============================================================================

/// Fixed relationship vocabulary. Never built from external strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelationshipType {
    Owns,
    Manages,
    Uses,
    ScheduledOn,
    Selects,
    Scales,
    RoutesTo,
    Involves,
    BelongsTo,
}

impl RelationshipType {
    pub const ALL: [RelationshipType; 9] = [
        RelationshipType::Owns,
        RelationshipType::Manages,
        RelationshipType::Uses,
        RelationshipType::ScheduledOn,
        RelationshipType::Selects,
        RelationshipType::Scales,
        RelationshipType::RoutesTo,
        RelationshipType::Involves,
        RelationshipType::BelongsTo,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipType::Owns => "OWNS",
            RelationshipType::Manages => "MANAGES",
            RelationshipType::Uses => "USES",
            RelationshipType::ScheduledOn => "SCHEDULED_ON",
            RelationshipType::Selects => "SELECTS",
            RelationshipType::Scales => "SCALES",
            RelationshipType::RoutesTo => "ROUTES_TO",
            RelationshipType::Involves => "INVOLVES",
            RelationshipType::BelongsTo => "BELONGS_TO",
        }
    }
}

impl fmt::Display for RelationshipType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One endpoint of a relationship, addressed by `(label, key, value)`.
///
/// `cluster_name` optionally narrows the match to nodes of one logical
/// cluster; it is used for by-name references, which are not globally unique.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeRef {
    pub label: String,
    pub key: String,
    pub value: String,
    pub cluster_name: Option<String>,
}

impl NodeRef {
    pub fn new(label: impl Into<String>, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            key: key.into(),
            value: value.into(),
            cluster_name: None,
        }
    }

    pub fn by_uid(label: impl Into<String>, uid: impl Into<String>) -> Self {
        Self::new(label, UID, uid)
    }

    pub fn in_cluster(mut self, cluster_name: impl Into<String>) -> Self {
        self.cluster_name = Some(cluster_name.into());
        self
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}:{}={})", self.label, self.key, self.value)
    }
}

// ============================================================================
// Statement builders
// ============================================================================

/// Whether `s` is safe to splice into Cypher as a label or property key.
pub fn is_valid_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn check_identifier(kind: &str, s: &str) -> Result<()> {
    if !is_valid_identifier(s) {
        bail!("invalid {} {:?}", kind, s);
    }
    Ok(())
}

/// `MERGE (n:L1:L2 {key: $key}) SET n = $properties`
pub fn build_upsert_query(labels: &[&str], unique_key: &str) -> Result<String> {
    check_identifier("property key", unique_key)?;
    let mut label_part = String::new();
    for label in labels {
        check_identifier("label", label)?;
        label_part.push(':');
        label_part.push_str(label);
    }
    Ok(format!(
        "MERGE (n{} {{{key}: ${key}}}) SET n = $properties",
        label_part,
        key = unique_key
    ))
}

fn endpoint_pattern(var: &str, node: &NodeRef) -> Result<String> {
    check_identifier("label", &node.label)?;
    check_identifier("property key", &node.key)?;
    let mut props = format!("{}: ${}_value", node.key, var);
    if node.cluster_name.is_some() {
        props.push_str(&format!(", {}: ${}_cluster", CLUSTER_NAME, var));
    }
    Ok(format!("({}:{} {{{}}})", var, node.label, props))
}

/// `MATCH (a:From {key: $a_value}), (b:To {key: $b_value}) MERGE (a)-[:REL]->(b)`
pub fn build_relationship_query(from: &NodeRef, rel: RelationshipType, to: &NodeRef) -> Result<String> {
    Ok(format!(
        "MATCH {}, {} MERGE (a)-[:{}]->(b)",
        endpoint_pattern("a", from)?,
        endpoint_pattern("b", to)?,
        rel.as_str()
    ))
}

/// `MATCH (n:Label {key: $value}) DETACH DELETE n`
pub fn build_delete_query(label: &str, key: &str) -> Result<String> {
    check_identifier("label", label)?;
    check_identifier("property key", key)?;
    Ok(format!("MATCH (n:{} {{{}: $value}}) DETACH DELETE n", label, key))
}

/// Per-label node count, as reported to the status collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KindCount {
    pub kind: String,
    pub count: i64,
}
