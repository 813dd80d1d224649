//! Autoscalers: the built-in HorizontalPodAutoscaler and KEDA's ScaledObject.
//!
//! ScaledObject is not part of the compiled-in API types; it arrives as an
//! unstructured object and is deserialized into the local [`ScaledObject`]
//! shape. Its watch is skipped when the CRD is not installed.

use super::common::{handler_identity, HandlerBase};
use super::{Gvr, HandlerContext, HandlerError, RawObject, RegistryError, ResourceHandler};
use crate::neo4j::models::*;
use crate::neo4j::GraphStore;
use async_trait::async_trait;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::Deserialize;
use serde_json::json;

pub struct HorizontalPodAutoscalerHandler {
    base: HandlerBase,
}

impl HorizontalPodAutoscalerHandler {
    pub fn new(ctx: HandlerContext) -> Result<Self, RegistryError> {
        Ok(Self {
            base: HandlerBase::new(ctx, Gvr::of::<HorizontalPodAutoscaler>(true))?,
        })
    }
}

#[async_trait]
impl ResourceHandler for HorizontalPodAutoscalerHandler {
    handler_identity!();

    async fn handle_create(&self, obj: &RawObject, store: &dyn GraphStore) -> Result<(), HandlerError> {
        let hpa: HorizontalPodAutoscaler = obj.convert(self.kind())?;
        let mut props = self.base.base_properties(&hpa.metadata)?;
        let target = hpa.spec.as_ref().map(|s| &s.scale_target_ref);
        if let Some(spec) = &hpa.spec {
            props.insert("minReplicas".into(), json!(spec.min_replicas));
            props.insert("maxReplicas".into(), json!(spec.max_replicas));
            props.insert("targetKind".into(), json!(spec.scale_target_ref.kind));
            props.insert("targetName".into(), json!(spec.scale_target_ref.name));
        }
        if let Some(status) = &hpa.status {
            props.insert("currentReplicas".into(), json!(status.current_replicas));
            props.insert("desiredReplicas".into(), json!(status.desired_replicas));
        }
        self.base.upsert(store, &props).await?;

        let me = self.base.node_ref(&hpa.metadata);
        self.base.link_metadata(store, &hpa.metadata, &me).await;
        if let Some(target) = target {
            link_scale_target(&self.base, store, &hpa.metadata, &me, &target.kind, &target.name).await;
        }
        Ok(())
    }
}

// ============================================================================
// KEDA ScaledObject
// ============================================================================

/// The fields of a `keda.sh/v1alpha1` ScaledObject this handler reads.
#[derive(Debug, Clone, Deserialize)]
pub struct ScaledObject {
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub spec: ScaledObjectSpec,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaledObjectSpec {
    pub scale_target_ref: ScaleTargetRef,
    pub min_replica_count: Option<i32>,
    pub max_replica_count: Option<i32>,
    pub polling_interval: Option<i32>,
    pub cooldown_period: Option<i32>,
    #[serde(default)]
    pub triggers: Vec<ScaledObjectTrigger>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleTargetRef {
    pub name: String,
    pub kind: Option<String>,
    pub api_version: Option<String>,
}

impl ScaleTargetRef {
    /// KEDA defaults the target kind to Deployment.
    pub fn kind(&self) -> &str {
        self.kind.as_deref().unwrap_or("Deployment")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScaledObjectTrigger {
    #[serde(rename = "type")]
    pub type_: String,
}

pub struct ScaledObjectHandler {
    base: HandlerBase,
}

impl ScaledObjectHandler {
    pub fn new(ctx: HandlerContext) -> Result<Self, RegistryError> {
        Ok(Self {
            base: HandlerBase::new(
                ctx,
                Gvr::new("keda.sh", "v1alpha1", "scaledobjects", "ScaledObject", true),
            )?,
        })
    }
}

#[async_trait]
impl ResourceHandler for ScaledObjectHandler {
    handler_identity!();

    async fn handle_create(&self, obj: &RawObject, store: &dyn GraphStore) -> Result<(), HandlerError> {
        let so: ScaledObject = obj.convert(self.kind())?;
        let mut props = self.base.base_properties(&so.metadata)?;
        let spec = &so.spec;
        let triggers: Vec<&str> = spec.triggers.iter().map(|t| t.type_.as_str()).collect();
        props.insert("minReplicaCount".into(), json!(spec.min_replica_count));
        props.insert("maxReplicaCount".into(), json!(spec.max_replica_count));
        props.insert("pollingInterval".into(), json!(spec.polling_interval));
        props.insert("cooldownPeriod".into(), json!(spec.cooldown_period));
        props.insert("triggers".into(), json!(triggers));
        props.insert("targetKind".into(), json!(spec.scale_target_ref.kind()));
        props.insert("targetName".into(), json!(spec.scale_target_ref.name));
        self.base.upsert(store, &props).await?;

        let me = self.base.node_ref(&so.metadata);
        self.base.link_metadata(store, &so.metadata, &me).await;
        let target = &spec.scale_target_ref;
        link_scale_target(&self.base, store, &so.metadata, &me, target.kind(), &target.name).await;
        Ok(())
    }
}

/// `SCALES` edge to a target resolved through the owner registry.
async fn link_scale_target(
    base: &HandlerBase,
    store: &dyn GraphStore,
    meta: &ObjectMeta,
    me: &NodeRef,
    kind: &str,
    name: &str,
) {
    let (Some(label), Some(ns)) = (base.label_for(kind), meta.namespace.as_deref()) else {
        return;
    };
    let target = base.namespaced_ref(&label, ns, name);
    base.link(store, me, RelationshipType::Scales, &target).await;
}
