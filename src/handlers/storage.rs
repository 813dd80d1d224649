//! Configuration objects and storage: ConfigMaps, Secrets, claims and volumes.
//!
//! ConfigMap and Secret nodes record key names only; values never reach the
//! graph.

use super::common::{handler_identity, key_list, HandlerBase};
use super::{Gvr, HandlerContext, HandlerError, RawObject, RegistryError, ResourceHandler};
use crate::neo4j::models::*;
use crate::neo4j::GraphStore;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolume, PersistentVolumeClaim, Secret};
use serde_json::json;

pub struct ConfigMapHandler {
    base: HandlerBase,
}

impl ConfigMapHandler {
    pub fn new(ctx: HandlerContext) -> Result<Self, RegistryError> {
        Ok(Self {
            base: HandlerBase::new(ctx, Gvr::of::<ConfigMap>(true))?,
        })
    }
}

#[async_trait]
impl ResourceHandler for ConfigMapHandler {
    handler_identity!();

    async fn handle_create(&self, obj: &RawObject, store: &dyn GraphStore) -> Result<(), HandlerError> {
        let cm: ConfigMap = obj.convert(self.kind())?;
        let mut props = self.base.base_properties(&cm.metadata)?;
        props.insert("dataKeys".into(), key_list(&cm.data));
        props.insert("binaryDataKeys".into(), key_list(&cm.binary_data));
        props.insert("immutable".into(), json!(cm.immutable));
        self.base.upsert(store, &props).await?;

        let me = self.base.node_ref(&cm.metadata);
        self.base.link_metadata(store, &cm.metadata, &me).await;
        Ok(())
    }
}

pub struct SecretHandler {
    base: HandlerBase,
}

impl SecretHandler {
    pub fn new(ctx: HandlerContext) -> Result<Self, RegistryError> {
        Ok(Self {
            base: HandlerBase::new(ctx, Gvr::of::<Secret>(true))?,
        })
    }
}

#[async_trait]
impl ResourceHandler for SecretHandler {
    handler_identity!();

    async fn handle_create(&self, obj: &RawObject, store: &dyn GraphStore) -> Result<(), HandlerError> {
        let secret: Secret = obj.convert(self.kind())?;
        let mut props = self.base.base_properties(&secret.metadata)?;
        props.insert("type".into(), json!(secret.type_));
        props.insert("dataKeys".into(), key_list(&secret.data));
        props.insert("immutable".into(), json!(secret.immutable));
        // last-applied-configuration may embed the secret's data.
        if let Some(serde_json::Value::Object(annotations)) = props.get_mut("annotations") {
            annotations.remove("kubectl.kubernetes.io/last-applied-configuration");
        }
        self.base.upsert(store, &props).await?;

        let me = self.base.node_ref(&secret.metadata);
        self.base.link_metadata(store, &secret.metadata, &me).await;
        Ok(())
    }
}

pub struct PersistentVolumeClaimHandler {
    base: HandlerBase,
}

impl PersistentVolumeClaimHandler {
    pub fn new(ctx: HandlerContext) -> Result<Self, RegistryError> {
        Ok(Self {
            base: HandlerBase::new(ctx, Gvr::of::<PersistentVolumeClaim>(true))?,
        })
    }
}

#[async_trait]
impl ResourceHandler for PersistentVolumeClaimHandler {
    handler_identity!();

    async fn handle_create(&self, obj: &RawObject, store: &dyn GraphStore) -> Result<(), HandlerError> {
        let pvc: PersistentVolumeClaim = obj.convert(self.kind())?;
        let mut props = self.base.base_properties(&pvc.metadata)?;
        let spec = pvc.spec.as_ref();
        if let Some(spec) = spec {
            let requested = spec
                .resources
                .as_ref()
                .and_then(|r| r.requests.as_ref())
                .and_then(|r| r.get("storage"))
                .map(|q| q.0.clone());
            props.insert("storageClassName".into(), json!(spec.storage_class_name));
            props.insert("volumeName".into(), json!(spec.volume_name));
            props.insert("accessModes".into(), json!(spec.access_modes));
            props.insert("requestedStorage".into(), json!(requested));
        }
        props.insert(
            "phase".into(),
            json!(pvc.status.as_ref().and_then(|s| s.phase.clone())),
        );
        self.base.upsert(store, &props).await?;

        let me = self.base.node_ref(&pvc.metadata);
        self.base.link_metadata(store, &pvc.metadata, &me).await;

        if let Some(volume) = spec.and_then(|s| s.volume_name.as_deref()) {
            let target = self.base.cluster_ref("PersistentVolume", volume);
            self.base.link(store, &me, RelationshipType::Uses, &target).await;
        }
        Ok(())
    }
}

pub struct PersistentVolumeHandler {
    base: HandlerBase,
}

impl PersistentVolumeHandler {
    pub fn new(ctx: HandlerContext) -> Result<Self, RegistryError> {
        Ok(Self {
            base: HandlerBase::new(ctx, Gvr::of::<PersistentVolume>(false))?,
        })
    }
}

#[async_trait]
impl ResourceHandler for PersistentVolumeHandler {
    handler_identity!();

    async fn handle_create(&self, obj: &RawObject, store: &dyn GraphStore) -> Result<(), HandlerError> {
        let pv: PersistentVolume = obj.convert(self.kind())?;
        let mut props = self.base.base_properties(&pv.metadata)?;
        let claim = pv.spec.as_ref().and_then(|s| s.claim_ref.as_ref());
        let claim_name = claim.and_then(|c| match (&c.namespace, &c.name) {
            (Some(ns), Some(name)) => Some((ns.clone(), name.clone())),
            _ => None,
        });
        if let Some(spec) = &pv.spec {
            let capacity = spec
                .capacity
                .as_ref()
                .and_then(|c| c.get("storage"))
                .map(|q| q.0.clone());
            props.insert("capacity".into(), json!(capacity));
            props.insert("storageClassName".into(), json!(spec.storage_class_name));
            props.insert("reclaimPolicy".into(), json!(spec.persistent_volume_reclaim_policy));
            props.insert("accessModes".into(), json!(spec.access_modes));
        }
        props.insert(
            "claim".into(),
            json!(claim_name.as_ref().map(|(ns, name)| format!("{}/{}", ns, name))),
        );
        props.insert(
            "phase".into(),
            json!(pv.status.as_ref().and_then(|s| s.phase.clone())),
        );
        self.base.upsert(store, &props).await?;

        let me = self.base.node_ref(&pv.metadata);
        self.base.link_metadata(store, &pv.metadata, &me).await;

        // Same edge the claim emits; whichever side arrives last creates it.
        if let Some((ns, name)) = claim_name {
            let from = self.base.namespaced_ref("PersistentVolumeClaim", &ns, &name);
            self.base.link(store, &from, RelationshipType::Uses, &me).await;
        }
        Ok(())
    }
}
