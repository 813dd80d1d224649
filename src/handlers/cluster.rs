//! Cluster-scoped infrastructure: namespaces and nodes.

use super::common::{handler_identity, HandlerBase};
use super::{Gvr, HandlerContext, HandlerError, RawObject, RegistryError, ResourceHandler};
use crate::neo4j::GraphStore;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Node};
use serde_json::json;

pub struct NamespaceHandler {
    base: HandlerBase,
}

impl NamespaceHandler {
    pub fn new(ctx: HandlerContext) -> Result<Self, RegistryError> {
        Ok(Self {
            base: HandlerBase::new(ctx, Gvr::of::<Namespace>(false))?,
        })
    }
}

#[async_trait]
impl ResourceHandler for NamespaceHandler {
    handler_identity!();

    async fn handle_create(&self, obj: &RawObject, store: &dyn GraphStore) -> Result<(), HandlerError> {
        let ns: Namespace = obj.convert(self.kind())?;
        let mut props = self.base.base_properties(&ns.metadata)?;
        props.insert(
            "phase".into(),
            json!(ns.status.as_ref().and_then(|s| s.phase.clone())),
        );
        self.base.upsert(store, &props).await
    }
}

pub struct NodeHandler {
    base: HandlerBase,
}

impl NodeHandler {
    pub fn new(ctx: HandlerContext) -> Result<Self, RegistryError> {
        Ok(Self {
            base: HandlerBase::new(ctx, Gvr::of::<Node>(false))?,
        })
    }
}

#[async_trait]
impl ResourceHandler for NodeHandler {
    handler_identity!();

    async fn handle_create(&self, obj: &RawObject, store: &dyn GraphStore) -> Result<(), HandlerError> {
        let node: Node = obj.convert(self.kind())?;
        let mut props = self.base.base_properties(&node.metadata)?;

        if let Some(spec) = &node.spec {
            props.insert("podCIDR".into(), json!(spec.pod_cidr));
            props.insert("providerID".into(), json!(spec.provider_id));
            props.insert("unschedulable".into(), json!(spec.unschedulable.unwrap_or(false)));
        }
        if let Some(status) = &node.status {
            if let Some(info) = &status.node_info {
                props.insert("kubeletVersion".into(), json!(info.kubelet_version));
                props.insert("osImage".into(), json!(info.os_image));
                props.insert("architecture".into(), json!(info.architecture));
            }
            let internal_ip = status
                .addresses
                .iter()
                .flatten()
                .find(|a| a.type_ == "InternalIP")
                .map(|a| a.address.clone());
            props.insert("internalIP".into(), json!(internal_ip));
            let ready = status
                .conditions
                .iter()
                .flatten()
                .find(|c| c.type_ == "Ready")
                .map(|c| c.status == "True");
            props.insert("ready".into(), json!(ready));
            if let Some(capacity) = &status.capacity {
                props.insert("capacityCpu".into(), json!(capacity.get("cpu").map(|q| &q.0)));
                props.insert("capacityMemory".into(), json!(capacity.get("memory").map(|q| &q.0)));
                props.insert("capacityPods".into(), json!(capacity.get("pods").map(|q| &q.0)));
            }
        }

        self.base.upsert(store, &props).await
    }
}
