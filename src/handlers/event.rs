//! Kubernetes Event nodes.
//!
//! Events form an audit trail: they carry no instance hash (so instance
//! cleanup never touches them), are stamped with `createdAt` on write, and
//! are only ever removed by the retention sweep.

use super::common::{handler_identity, timestamp, HandlerBase};
use super::{Gvr, HandlerContext, HandlerError, RawObject, RegistryError, ResourceHandler};
use crate::neo4j::models::*;
use crate::neo4j::GraphStore;
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::Event;
use serde_json::json;

pub struct EventHandler {
    base: HandlerBase,
}

impl EventHandler {
    pub fn new(ctx: HandlerContext) -> Result<Self, RegistryError> {
        Ok(Self {
            base: HandlerBase::new(ctx, Gvr::of::<Event>(true))?,
        })
    }
}

#[async_trait]
impl ResourceHandler for EventHandler {
    handler_identity!();

    async fn handle_create(&self, obj: &RawObject, store: &dyn GraphStore) -> Result<(), HandlerError> {
        let event: Event = obj.convert(self.kind())?;
        let mut props = self.base.base_properties(&event.metadata)?;
        props.remove(INSTANCE_HASH);
        props.insert(CREATED_AT.into(), json!(format_timestamp(Utc::now())));

        let involved = &event.involved_object;
        props.insert("reason".into(), json!(event.reason));
        props.insert("message".into(), json!(event.message));
        props.insert("type".into(), json!(event.type_));
        props.insert("count".into(), json!(event.count));
        props.insert("firstTimestamp".into(), json!(timestamp(&event.first_timestamp)));
        props.insert("lastTimestamp".into(), json!(timestamp(&event.last_timestamp)));
        props.insert("involvedKind".into(), json!(involved.kind));
        props.insert("involvedName".into(), json!(involved.name));
        props.insert(
            "sourceComponent".into(),
            json!(event.source.as_ref().and_then(|s| s.component.clone())),
        );
        self.base.upsert(store, &props).await?;

        let me = self.base.node_ref(&event.metadata);
        if let (Some(kind), Some(uid)) = (involved.kind.as_deref(), involved.uid.as_deref()) {
            if let Some(label) = self.base.label_for(kind) {
                let target = NodeRef::by_uid(label, uid);
                self.base.link(store, &me, RelationshipType::Involves, &target).await;
            }
        }
        Ok(())
    }

    /// Events outlive their cluster object; only the retention sweep deletes them.
    async fn handle_delete(&self, _obj: &RawObject, _store: &dyn GraphStore) -> Result<(), HandlerError> {
        Ok(())
    }
}
