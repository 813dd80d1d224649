//! Resource handlers: the per-kind capability the pipeline dispatches to.
//!
//! Every watched resource kind is served by one [`ResourceHandler`]. The
//! handler converts the raw object it receives into graph properties, upserts
//! its node and emits the relationships its kind is responsible for.
//!
//! Handlers are listed explicitly by [`default_handlers`]; each constructor
//! registers its kind in the shared [`OwnerKindRegistry`] so that owner
//! references and scale targets can be resolved to node labels.

mod autoscaling;
mod cluster;
mod common;
mod event;
mod network;
pub mod owners;
mod storage;
mod workloads;

pub use autoscaling::{HorizontalPodAutoscalerHandler, ScaledObject, ScaledObjectHandler};
pub use cluster::{NamespaceHandler, NodeHandler};
pub use event::EventHandler;
pub use network::{IngressHandler, ServiceHandler};
pub use owners::{OwnerKindRegistry, RegistryError};
pub use storage::{
    ConfigMapHandler, PersistentVolumeClaimHandler, PersistentVolumeHandler, SecretHandler,
};
pub use workloads::{
    CronJobHandler, DaemonSetHandler, DeploymentHandler, JobHandler, PodHandler,
    ReplicaSetHandler, StatefulSetHandler,
};

use crate::neo4j::models::{ClusterIdentity, UID};
use crate::neo4j::GraphStore;
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// Resource type descriptor
// ============================================================================

/// Group/version/resource of a watched type, plus its kind and scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Gvr {
    pub group: String,
    pub version: String,
    pub resource: String,
    pub kind: String,
    pub namespaced: bool,
}

impl Gvr {
    pub fn new(group: &str, version: &str, resource: &str, kind: &str, namespaced: bool) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            resource: resource.to_string(),
            kind: kind.to_string(),
            namespaced,
        }
    }

    /// Descriptor of a compiled-in Kubernetes type.
    pub fn of<K>(namespaced: bool) -> Self
    where
        K: kube::Resource<DynamicType = ()>,
    {
        Self {
            group: K::group(&()).into_owned(),
            version: K::version(&()).into_owned(),
            resource: K::plural(&()).into_owned(),
            kind: K::kind(&()).into_owned(),
            namespaced,
        }
    }

    /// `apiVersion` as it appears on objects (`v1`, `apps/v1`).
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for Gvr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}.{}", self.resource, self.version)
        } else {
            write!(f, "{}.{}.{}", self.resource, self.version, self.group)
        }
    }
}

// ============================================================================
// Raw objects and conversion
// ============================================================================

/// An in-process, concretely typed Kubernetes object.
pub trait TypedObject: Any + Send + Sync + fmt::Debug {
    fn as_any(&self) -> &dyn Any;
    fn object_meta(&self) -> &ObjectMeta;
    fn type_name(&self) -> &'static str;
}

impl<K> TypedObject for K
where
    K: kube::Resource + fmt::Debug + Send + Sync + 'static,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn object_meta(&self) -> &ObjectMeta {
        self.meta()
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<K>()
    }
}

/// Object carried by a watch notification.
#[derive(Debug, Clone)]
pub enum RawObject {
    Typed(Arc<dyn TypedObject>),
    Unstructured(serde_json::Value),
}

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("object is null")]
    Null,
    #[error("expected {expected}, got {found}")]
    UnexpectedType {
        expected: &'static str,
        found: &'static str,
    },
    #[error("expected kind {expected}, got {found}")]
    UnexpectedKind { expected: String, found: String },
    #[error("malformed {kind} object: {source}")]
    Malformed {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{kind} object has no metadata.uid")]
    MissingUid { kind: String },
}

impl RawObject {
    pub fn typed<K: TypedObject>(obj: K) -> Self {
        RawObject::Typed(Arc::new(obj))
    }

    pub fn uid(&self) -> Option<String> {
        match self {
            RawObject::Typed(obj) => obj.object_meta().uid.clone(),
            RawObject::Unstructured(value) => value
                .pointer("/metadata/uid")
                .and_then(|v| v.as_str())
                .map(str::to_string),
        }
    }

    /// `namespace/name` (or `name`) for log lines.
    pub fn display_name(&self) -> String {
        let (namespace, name) = match self {
            RawObject::Typed(obj) => {
                let meta = obj.object_meta();
                (meta.namespace.clone(), meta.name.clone())
            }
            RawObject::Unstructured(value) => (
                value.pointer("/metadata/namespace").and_then(|v| v.as_str()).map(str::to_string),
                value.pointer("/metadata/name").and_then(|v| v.as_str()).map(str::to_string),
            ),
        };
        match (namespace, name) {
            (Some(ns), Some(name)) => format!("{}/{}", ns, name),
            (None, Some(name)) => name,
            _ => "<unnamed>".to_string(),
        }
    }

    /// The object's uid, or the conversion error explaining why there is none.
    pub fn require_uid(&self, kind: &str) -> Result<String, ConversionError> {
        if matches!(self, RawObject::Unstructured(serde_json::Value::Null)) {
            return Err(ConversionError::Null);
        }
        self.uid()
            .filter(|uid| !uid.is_empty())
            .ok_or_else(|| ConversionError::MissingUid { kind: kind.to_string() })
    }

    /// Convert into the handler's native type `T`.
    ///
    /// A typed object of type `T` is used as is. An unstructured object is
    /// deserialized into `T`, after checking its `kind` field when present.
    pub fn convert<T>(&self, kind: &str) -> Result<T, ConversionError>
    where
        T: DeserializeOwned + Clone + 'static,
    {
        match self {
            RawObject::Typed(obj) => obj.as_any().downcast_ref::<T>().cloned().ok_or(
                ConversionError::UnexpectedType {
                    expected: std::any::type_name::<T>(),
                    found: obj.type_name(),
                },
            ),
            RawObject::Unstructured(serde_json::Value::Null) => Err(ConversionError::Null),
            RawObject::Unstructured(value) => {
                if let Some(found) = value.get("kind").and_then(|k| k.as_str()) {
                    if found != kind {
                        return Err(ConversionError::UnexpectedKind {
                            expected: kind.to_string(),
                            found: found.to_string(),
                        });
                    }
                }
                serde_json::from_value(value.clone()).map_err(|source| ConversionError::Malformed {
                    kind: kind.to_string(),
                    source,
                })
            }
        }
    }
}

// ============================================================================
// Handler contract
// ============================================================================

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Conversion(#[from] ConversionError),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// What every handler is constructed with.
#[derive(Clone)]
pub struct HandlerContext {
    pub identity: ClusterIdentity,
    pub owners: Arc<OwnerKindRegistry>,
}

impl HandlerContext {
    pub fn new(identity: ClusterIdentity, owners: Arc<OwnerKindRegistry>) -> Self {
        Self { identity, owners }
    }
}

/// Per-kind synchronisation capability.
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    /// The resource type this handler watches.
    fn gvr(&self) -> &Gvr;

    /// Graph label and owner-registry key.
    fn kind(&self) -> &str;

    /// Upsert the object's node, then emit its relationships. Relationship
    /// failures are logged, never returned.
    async fn handle_create(&self, obj: &RawObject, store: &dyn GraphStore) -> Result<(), HandlerError>;

    /// Detach-delete the object's node by uid.
    async fn handle_delete(&self, obj: &RawObject, store: &dyn GraphStore) -> Result<(), HandlerError> {
        let uid = obj.require_uid(self.kind())?;
        store.delete_node(self.kind(), UID, &uid).await?;
        Ok(())
    }
}

/// The handler list served by this process.
///
/// The Event handler is only included when `event_retention_days` is
/// positive; a non-positive window disables event ingestion.
pub fn default_handlers(
    ctx: &HandlerContext,
    event_retention_days: i64,
) -> Result<Vec<Arc<dyn ResourceHandler>>, RegistryError> {
    let mut handlers: Vec<Arc<dyn ResourceHandler>> = vec![
        Arc::new(NamespaceHandler::new(ctx.clone())?),
        Arc::new(NodeHandler::new(ctx.clone())?),
        Arc::new(PodHandler::new(ctx.clone())?),
        Arc::new(DeploymentHandler::new(ctx.clone())?),
        Arc::new(ReplicaSetHandler::new(ctx.clone())?),
        Arc::new(StatefulSetHandler::new(ctx.clone())?),
        Arc::new(DaemonSetHandler::new(ctx.clone())?),
        Arc::new(JobHandler::new(ctx.clone())?),
        Arc::new(CronJobHandler::new(ctx.clone())?),
        Arc::new(ServiceHandler::new(ctx.clone())?),
        Arc::new(IngressHandler::new(ctx.clone())?),
        Arc::new(ConfigMapHandler::new(ctx.clone())?),
        Arc::new(SecretHandler::new(ctx.clone())?),
        Arc::new(PersistentVolumeClaimHandler::new(ctx.clone())?),
        Arc::new(PersistentVolumeHandler::new(ctx.clone())?),
        Arc::new(HorizontalPodAutoscalerHandler::new(ctx.clone())?),
        Arc::new(ScaledObjectHandler::new(ctx.clone())?),
    ];
    if event_retention_days > 0 {
        handlers.push(Arc::new(EventHandler::new(ctx.clone())?));
    }
    Ok(handlers)
}


#[cfg(test)]
mod tests {
    use super::test_support::context;
    use super::*;
    use crate::neo4j::mock::MockGraphStore;
    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::api::core::v1::Pod;
    use serde_json::json;

    #[test]
    fn test_gvr_of_compiled_types() {
        let gvr = Gvr::of::<Deployment>(true);
        assert_eq!(gvr.group, "apps");
        assert_eq!(gvr.resource, "deployments");
        assert_eq!(gvr.api_version(), "apps/v1");
        assert_eq!(gvr.to_string(), "deployments.v1.apps");

        let core = Gvr::of::<Pod>(true);
        assert_eq!(core.api_version(), "v1");
        assert_eq!(core.to_string(), "pods.v1");
    }

    #[test]
    fn test_convert_typed_native() {
        let mut pod = Pod::default();
        pod.metadata.uid = Some("p1".into());
        let raw = RawObject::typed(pod);
        let back: Pod = raw.convert("Pod").unwrap();
        assert_eq!(back.metadata.uid.as_deref(), Some("p1"));
    }

    #[test]
    fn test_convert_typed_wrong_type() {
        let raw = RawObject::typed(Deployment::default());
        let err = raw.convert::<Pod>("Pod").unwrap_err();
        assert!(matches!(err, ConversionError::UnexpectedType { .. }));
    }

    #[test]
    fn test_convert_unstructured() {
        let raw = RawObject::Unstructured(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "web", "uid": "p1"},
            "spec": {"containers": [], "nodeName": "n1"}
        }));
        let pod: Pod = raw.convert("Pod").unwrap();
        assert_eq!(pod.spec.unwrap().node_name.as_deref(), Some("n1"));
        assert_eq!(raw.uid().as_deref(), Some("p1"));
        assert_eq!(raw.display_name(), "web");
    }

    #[test]
    fn test_convert_rejects_null_and_malformed() {
        let null = RawObject::Unstructured(serde_json::Value::Null);
        assert!(matches!(null.convert::<Pod>("Pod"), Err(ConversionError::Null)));
        assert!(matches!(null.require_uid("Pod"), Err(ConversionError::Null)));

        let malformed = RawObject::Unstructured(json!({"metadata": "not-an-object"}));
        assert!(matches!(
            malformed.convert::<Pod>("Pod"),
            Err(ConversionError::Malformed { .. })
        ));

        let other_kind = RawObject::Unstructured(json!({"kind": "Service", "metadata": {}}));
        assert!(matches!(
            other_kind.convert::<Pod>("Pod"),
            Err(ConversionError::UnexpectedKind { .. })
        ));
    }

    #[tokio::test]
    async fn test_default_handlers_register_kinds() {
        let ctx = context("c1", "h1");
        let handlers = default_handlers(&ctx, 7).unwrap();
        let kinds: Vec<&str> = handlers.iter().map(|h| h.kind()).collect();
        assert!(kinds.contains(&"Pod"));
        assert!(kinds.contains(&"Event"));
        assert!(kinds.contains(&"ScaledObject"));
        for kind in &kinds {
            assert!(ctx.owners.contains(kind), "{} not registered", kind);
        }
    }

    #[test]
    fn test_event_ingestion_disabled_without_retention() {
        let ctx = context("c1", "h1");
        let handlers = default_handlers(&ctx, 0).unwrap();
        assert!(handlers.iter().all(|h| h.kind() != "Event"));
        assert!(!ctx.owners.contains("Event"));
    }

    #[tokio::test]
    async fn test_default_delete_removes_node_by_uid() {
        let ctx = context("c1", "h1");
        let store = MockGraphStore::new();
        let handler = PodHandler::new(ctx).unwrap();
        let raw = RawObject::Unstructured(json!({
            "kind": "Pod",
            "metadata": {"name": "web", "namespace": "default", "uid": "p1"}
        }));
        handler.handle_create(&raw, &store).await.unwrap();
        assert_eq!(store.node_count("Pod").await, 1);

        handler.handle_delete(&raw, &store).await.unwrap();
        assert_eq!(store.node_count("Pod").await, 0);
    }

    #[tokio::test]
    async fn test_delete_without_uid_is_conversion_error() {
        let store = MockGraphStore::new();
        let handler = PodHandler::new(context("c1", "h1")).unwrap();
        let raw = RawObject::Unstructured(json!({"metadata": {"name": "web"}}));
        let err = handler.handle_delete(&raw, &store).await.unwrap_err();
        assert!(matches!(err, HandlerError::Conversion(ConversionError::MissingUid { .. })));
    }
}
