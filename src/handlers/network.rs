//! Services and ingresses.

use super::common::{handler_identity, selector_matches, HandlerBase};
use super::{Gvr, HandlerContext, HandlerError, RawObject, RegistryError, ResourceHandler};
use crate::neo4j::models::*;
use crate::neo4j::GraphStore;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::{Ingress, IngressBackend};
use serde_json::json;
use std::collections::BTreeSet;

pub struct ServiceHandler {
    base: HandlerBase,
}

impl ServiceHandler {
    pub fn new(ctx: HandlerContext) -> Result<Self, RegistryError> {
        Ok(Self {
            base: HandlerBase::new(ctx, Gvr::of::<Service>(true))?,
        })
    }
}

#[async_trait]
impl ResourceHandler for ServiceHandler {
    handler_identity!();

    async fn handle_create(&self, obj: &RawObject, store: &dyn GraphStore) -> Result<(), HandlerError> {
        let svc: Service = obj.convert(self.kind())?;
        let mut props = self.base.base_properties(&svc.metadata)?;
        let spec = svc.spec.as_ref();
        if let Some(spec) = spec {
            props.insert("type".into(), json!(spec.type_));
            props.insert("clusterIP".into(), json!(spec.cluster_ip));
            props.insert("externalName".into(), json!(spec.external_name));
            props.insert("selector".into(), json!(spec.selector));
            props.insert("ports".into(), json!(spec.ports));
        }
        self.base.upsert(store, &props).await?;

        let me = self.base.node_ref(&svc.metadata);
        self.base.link_metadata(store, &svc.metadata, &me).await;

        let (Some(selector), Some(ns)) = (
            spec.and_then(|s| s.selector.as_ref()),
            svc.metadata.namespace.as_deref(),
        ) else {
            return Ok(());
        };
        let filters = [
            (NAMESPACE, ns),
            (CLUSTER_NAME, self.base.cluster_name()),
            (INSTANCE_HASH, self.base.instance_hash()),
        ];
        let pods = match store.list_nodes("Pod", &filters).await {
            Ok(pods) => pods,
            Err(e) => {
                tracing::warn!(kind = %self.kind(), error = %e, "Failed to list pods for selector matching");
                return Ok(());
            }
        };
        for pod in pods {
            let labels = pod.get("labels").and_then(|v| v.as_str());
            if !selector_matches(selector, labels) {
                continue;
            }
            if let Some(uid) = pod.get(UID).and_then(|v| v.as_str()) {
                let target = NodeRef::by_uid("Pod", uid);
                self.base.link(store, &me, RelationshipType::Selects, &target).await;
            }
        }
        Ok(())
    }
}

pub struct IngressHandler {
    base: HandlerBase,
}

impl IngressHandler {
    pub fn new(ctx: HandlerContext) -> Result<Self, RegistryError> {
        Ok(Self {
            base: HandlerBase::new(ctx, Gvr::of::<Ingress>(true))?,
        })
    }

    fn backend_service(backend: &IngressBackend) -> Option<String> {
        backend.service.as_ref().map(|s| s.name.clone())
    }

    /// Every Service named as a backend, default backend included.
    fn backend_services(ingress: &Ingress) -> BTreeSet<String> {
        let mut services = BTreeSet::new();
        let Some(spec) = &ingress.spec else {
            return services;
        };
        if let Some(name) = spec.default_backend.as_ref().and_then(Self::backend_service) {
            services.insert(name);
        }
        for rule in spec.rules.iter().flatten() {
            for path in rule.http.iter().flat_map(|h| h.paths.iter()) {
                if let Some(name) = Self::backend_service(&path.backend) {
                    services.insert(name);
                }
            }
        }
        services
    }
}

#[async_trait]
impl ResourceHandler for IngressHandler {
    handler_identity!();

    async fn handle_create(&self, obj: &RawObject, store: &dyn GraphStore) -> Result<(), HandlerError> {
        let ingress: Ingress = obj.convert(self.kind())?;
        let mut props = self.base.base_properties(&ingress.metadata)?;
        if let Some(spec) = &ingress.spec {
            let hosts: Vec<&str> = spec
                .rules
                .iter()
                .flatten()
                .filter_map(|r| r.host.as_deref())
                .collect();
            props.insert("ingressClassName".into(), json!(spec.ingress_class_name));
            props.insert("hosts".into(), json!(hosts));
            props.insert("tls".into(), json!(spec.tls.as_ref().is_some_and(|t| !t.is_empty())));
        }
        self.base.upsert(store, &props).await?;

        let me = self.base.node_ref(&ingress.metadata);
        self.base.link_metadata(store, &ingress.metadata, &me).await;

        if let Some(ns) = ingress.metadata.namespace.as_deref() {
            for service in Self::backend_services(&ingress) {
                let target = self.base.namespaced_ref("Service", ns, &service);
                self.base.link(store, &me, RelationshipType::RoutesTo, &target).await;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_support::context;
    use crate::neo4j::mock::MockGraphStore;

    #[tokio::test]
    async fn test_ingress_routes_to_backends() {
        let ctx = context("c1", "h1");
        let services = ServiceHandler::new(ctx.clone()).unwrap();
        let ingresses = IngressHandler::new(ctx).unwrap();
        let store = MockGraphStore::new();

        for (uid, name) in [("s1", "web"), ("s2", "api")] {
            let svc = RawObject::Unstructured(json!({
                "kind": "Service",
                "metadata": {"name": name, "namespace": "default", "uid": uid}
            }));
            services.handle_create(&svc, &store).await.unwrap();
        }
        let ingress = RawObject::Unstructured(json!({
            "kind": "Ingress",
            "metadata": {"name": "edge", "namespace": "default", "uid": "i1"},
            "spec": {
                "defaultBackend": {"service": {"name": "web", "port": {"number": 80}}},
                "rules": [{
                    "host": "example.com",
                    "http": {"paths": [{
                        "path": "/api",
                        "pathType": "Prefix",
                        "backend": {"service": {"name": "api", "port": {"number": 8080}}}
                    }]}
                }]
            }
        }));
        ingresses.handle_create(&ingress, &store).await.unwrap();

        let node = store.get_node("Ingress", UID, "i1").await.unwrap();
        assert_eq!(node["hosts"], PropertyValue::from(r#"["example.com"]"#));
        let me = NodeRef::by_uid("Ingress", "i1");
        for uid in ["s1", "s2"] {
            assert!(
                store
                    .has_relationship(&me, RelationshipType::RoutesTo, &NodeRef::by_uid("Service", uid))
                    .await
            );
        }
    }

    #[tokio::test]
    async fn test_service_without_selector_selects_nothing() {
        let store = MockGraphStore::new()
            .with_node(
                &["Pod"],
                json!({
                    "uid": "p1",
                    "namespace": "default",
                    "clusterName": "c1",
                    "instanceHash": "h1",
                    "labels": {"app": "web"}
                })
                .as_object()
                .cloned()
                .unwrap(),
            )
            .await;
        let handler = ServiceHandler::new(context("c1", "h1")).unwrap();
        let svc = RawObject::Unstructured(json!({
            "kind": "Service",
            "metadata": {"name": "ext", "namespace": "default", "uid": "s1"},
            "spec": {"type": "ExternalName", "externalName": "db.example.com"}
        }));
        handler.handle_create(&svc, &store).await.unwrap();
        assert_eq!(store.relationship_count().await, 0);
        let node = store.get_node("Service", UID, "s1").await.unwrap();
        assert_eq!(node["type"], PropertyValue::from("ExternalName"));
    }
}
