//! Owner-kind registry: resource kind name → graph node label.
//!
//! Handlers register their kind while they are constructed; afterwards the
//! registry is only read, concurrently, when owner references and scale or
//! route targets are resolved into relationship endpoints.

use crate::neo4j::models::is_valid_identifier;
use dashmap::DashMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("kind {0:?} is not a valid graph label")]
    InvalidKind(String),
    #[error("label {label:?} for kind {kind:?} is not a valid graph label")]
    InvalidLabel { kind: String, label: String },
}

/// Explicit, shareable kind → label table.
#[derive(Debug, Default)]
pub struct OwnerKindRegistry {
    labels: DashMap<String, String>,
}

impl OwnerKindRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `kind` under its own name as label.
    pub fn register(&self, kind: &str) -> Result<(), RegistryError> {
        self.register_as(kind, kind)
    }

    /// Register `kind` under an explicit label. Re-registering a kind keeps
    /// the latest label.
    pub fn register_as(&self, kind: &str, label: &str) -> Result<(), RegistryError> {
        if !is_valid_identifier(kind) {
            return Err(RegistryError::InvalidKind(kind.to_string()));
        }
        if !is_valid_identifier(label) {
            return Err(RegistryError::InvalidLabel {
                kind: kind.to_string(),
                label: label.to_string(),
            });
        }
        self.labels.insert(kind.to_string(), label.to_string());
        Ok(())
    }

    /// Label for `kind`, if any handler registered it.
    pub fn label_for(&self, kind: &str) -> Option<String> {
        self.labels.get(kind).map(|l| l.value().clone())
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.labels.contains_key(kind)
    }

    /// Every registered kind, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.labels.iter().map(|e| e.key().clone()).collect();
        kinds.sort();
        kinds
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_register_and_lookup() {
        let registry = OwnerKindRegistry::new();
        registry.register("Deployment").unwrap();
        registry.register_as("ScaledObject", "KedaScaledObject").unwrap();

        assert_eq!(registry.label_for("Deployment").as_deref(), Some("Deployment"));
        assert_eq!(registry.label_for("ScaledObject").as_deref(), Some("KedaScaledObject"));
        assert_eq!(registry.label_for("Rollout"), None);
        assert_eq!(registry.kinds(), vec!["Deployment", "ScaledObject"]);
    }

    #[test]
    fn test_rejects_unsafe_names() {
        let registry = OwnerKindRegistry::new();
        assert_eq!(
            registry.register("Pod`) DETACH DELETE n //"),
            Err(RegistryError::InvalidKind("Pod`) DETACH DELETE n //".into()))
        );
        assert!(matches!(
            registry.register_as("Widget", "my-widget"),
            Err(RegistryError::InvalidLabel { .. })
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_isolated_instances() {
        let a = OwnerKindRegistry::new();
        let b = OwnerKindRegistry::new();
        a.register("Job").unwrap();
        assert!(a.contains("Job"));
        assert!(!b.contains("Job"));
    }

    #[tokio::test]
    async fn test_concurrent_readers() {
        let registry = Arc::new(OwnerKindRegistry::new());
        registry.register("ReplicaSet").unwrap();
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let r = registry.clone();
            tasks.push(tokio::spawn(async move { r.label_for("ReplicaSet") }));
        }
        for t in tasks {
            assert_eq!(t.await.unwrap().as_deref(), Some("ReplicaSet"));
        }
    }
}
