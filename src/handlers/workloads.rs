//! Pods and the controllers that own them.

use super::common::{
    handler_identity, reference_name, selector_matches, stored_selector, timestamp, HandlerBase,
};
use super::{Gvr, HandlerContext, HandlerError, RawObject, RegistryError, ResourceHandler};
use crate::neo4j::models::*;
use crate::neo4j::GraphStore;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{Pod, PodSpec};
use serde_json::json;
use std::collections::BTreeSet;

// ============================================================================
// Pod
// ============================================================================

pub struct PodHandler {
    base: HandlerBase,
}

impl PodHandler {
    pub fn new(ctx: HandlerContext) -> Result<Self, RegistryError> {
        Ok(Self {
            base: HandlerBase::new(ctx, Gvr::of::<Pod>(true))?,
        })
    }

    /// `(label, name)` of every ConfigMap, Secret and claim the pod mounts
    /// or imports.
    fn used_objects(spec: &PodSpec) -> BTreeSet<(&'static str, String)> {
        let mut used = BTreeSet::new();
        for volume in spec.volumes.iter().flatten() {
            if let Some(name) = volume.config_map.as_ref().and_then(reference_name) {
                used.insert(("ConfigMap", name));
            }
            if let Some(name) = volume.secret.as_ref().and_then(|s| s.secret_name.clone()) {
                used.insert(("Secret", name));
            }
            if let Some(claim) = &volume.persistent_volume_claim {
                used.insert(("PersistentVolumeClaim", claim.claim_name.clone()));
            }
        }
        let containers = spec
            .containers
            .iter()
            .chain(spec.init_containers.iter().flatten());
        for container in containers {
            for source in container.env_from.iter().flatten() {
                if let Some(name) = source.config_map_ref.as_ref().and_then(reference_name) {
                    used.insert(("ConfigMap", name));
                }
                if let Some(name) = source.secret_ref.as_ref().and_then(reference_name) {
                    used.insert(("Secret", name));
                }
            }
        }
        for secret in spec.image_pull_secrets.iter().flatten() {
            if let Some(name) = reference_name(secret) {
                used.insert(("Secret", name));
            }
        }
        used
    }

    /// `SELECTS` edges from every known Service in the namespace whose
    /// selector matches this pod.
    async fn link_selecting_services(
        &self,
        store: &dyn GraphStore,
        namespace: &str,
        labels: Option<&str>,
        me: &NodeRef,
    ) {
        let filters = [
            (NAMESPACE, namespace),
            (CLUSTER_NAME, self.base.cluster_name()),
            (INSTANCE_HASH, self.base.instance_hash()),
        ];
        let services = match store.list_nodes("Service", &filters).await {
            Ok(services) => services,
            Err(e) => {
                tracing::warn!(kind = %self.kind(), error = %e, "Failed to list services for selector matching");
                return;
            }
        };
        for service in services {
            let Some(selector) = stored_selector(service.get("selector")) else {
                continue;
            };
            let Some(uid) = service.get(UID).and_then(|v| v.as_str()) else {
                continue;
            };
            if selector_matches(&selector, labels) {
                let from = NodeRef::by_uid("Service", uid);
                self.base.link(store, &from, RelationshipType::Selects, me).await;
            }
        }
    }
}

#[async_trait]
impl ResourceHandler for PodHandler {
    handler_identity!();

    async fn handle_create(&self, obj: &RawObject, store: &dyn GraphStore) -> Result<(), HandlerError> {
        let pod: Pod = obj.convert(self.kind())?;
        let mut props = self.base.base_properties(&pod.metadata)?;
        let spec = pod.spec.as_ref();
        let status = pod.status.as_ref();

        props.insert("nodeName".into(), json!(spec.and_then(|s| s.node_name.clone())));
        props.insert(
            "serviceAccountName".into(),
            json!(spec.and_then(|s| s.service_account_name.clone())),
        );
        props.insert("restartPolicy".into(), json!(spec.and_then(|s| s.restart_policy.clone())));
        if let Some(spec) = spec {
            let names: Vec<&str> = spec.containers.iter().map(|c| c.name.as_str()).collect();
            let images: Vec<&str> = spec.containers.iter().filter_map(|c| c.image.as_deref()).collect();
            props.insert("containers".into(), json!(names));
            props.insert("images".into(), json!(images));
        }
        if let Some(status) = status {
            props.insert("phase".into(), json!(status.phase));
            props.insert("podIP".into(), json!(status.pod_ip));
            props.insert("hostIP".into(), json!(status.host_ip));
            props.insert("qosClass".into(), json!(status.qos_class));
            let restarts: i32 = status
                .container_statuses
                .iter()
                .flatten()
                .map(|c| c.restart_count)
                .sum();
            props.insert("restartCount".into(), json!(restarts));
            let ready = status
                .conditions
                .iter()
                .flatten()
                .find(|c| c.type_ == "Ready")
                .map(|c| c.status == "True");
            props.insert("ready".into(), json!(ready));
        }

        self.base.upsert(store, &props).await?;

        let me = self.base.node_ref(&pod.metadata);
        self.base.link_metadata(store, &pod.metadata, &me).await;

        if let Some(node_name) = spec.and_then(|s| s.node_name.as_deref()) {
            let node = self.base.cluster_ref("Node", node_name);
            self.base.link(store, &me, RelationshipType::ScheduledOn, &node).await;
        }

        if let (Some(spec), Some(ns)) = (spec, pod.metadata.namespace.as_deref()) {
            for (label, name) in Self::used_objects(spec) {
                let target = self.base.namespaced_ref(label, ns, &name);
                self.base.link(store, &me, RelationshipType::Uses, &target).await;
            }
            let labels = props.get("labels").filter(|v| !v.is_null()).map(|v| v.to_string());
            self.link_selecting_services(store, ns, labels.as_deref(), &me).await;
        }

        Ok(())
    }
}

// ============================================================================
// Controllers
// ============================================================================

pub struct DeploymentHandler {
    base: HandlerBase,
}

impl DeploymentHandler {
    pub fn new(ctx: HandlerContext) -> Result<Self, RegistryError> {
        Ok(Self {
            base: HandlerBase::new(ctx, Gvr::of::<Deployment>(true))?,
        })
    }
}

#[async_trait]
impl ResourceHandler for DeploymentHandler {
    handler_identity!();

    async fn handle_create(&self, obj: &RawObject, store: &dyn GraphStore) -> Result<(), HandlerError> {
        let deploy: Deployment = obj.convert(self.kind())?;
        let mut props = self.base.base_properties(&deploy.metadata)?;
        if let Some(spec) = &deploy.spec {
            props.insert("replicas".into(), json!(spec.replicas));
            props.insert("selector".into(), json!(spec.selector.match_labels));
            props.insert(
                "strategy".into(),
                json!(spec.strategy.as_ref().and_then(|s| s.type_.clone())),
            );
        }
        if let Some(status) = &deploy.status {
            props.insert("readyReplicas".into(), json!(status.ready_replicas));
            props.insert("availableReplicas".into(), json!(status.available_replicas));
            props.insert("updatedReplicas".into(), json!(status.updated_replicas));
        }
        self.base.upsert(store, &props).await?;
        let me = self.base.node_ref(&deploy.metadata);
        self.base.link_metadata(store, &deploy.metadata, &me).await;
        Ok(())
    }
}

pub struct ReplicaSetHandler {
    base: HandlerBase,
}

impl ReplicaSetHandler {
    pub fn new(ctx: HandlerContext) -> Result<Self, RegistryError> {
        Ok(Self {
            base: HandlerBase::new(ctx, Gvr::of::<ReplicaSet>(true))?,
        })
    }
}

#[async_trait]
impl ResourceHandler for ReplicaSetHandler {
    handler_identity!();

    async fn handle_create(&self, obj: &RawObject, store: &dyn GraphStore) -> Result<(), HandlerError> {
        let rs: ReplicaSet = obj.convert(self.kind())?;
        let mut props = self.base.base_properties(&rs.metadata)?;
        if let Some(spec) = &rs.spec {
            props.insert("replicas".into(), json!(spec.replicas));
            props.insert("selector".into(), json!(spec.selector.match_labels));
        }
        if let Some(status) = &rs.status {
            props.insert("readyReplicas".into(), json!(status.ready_replicas));
            props.insert("availableReplicas".into(), json!(status.available_replicas));
        }
        self.base.upsert(store, &props).await?;
        let me = self.base.node_ref(&rs.metadata);
        self.base.link_metadata(store, &rs.metadata, &me).await;
        Ok(())
    }
}

pub struct StatefulSetHandler {
    base: HandlerBase,
}

impl StatefulSetHandler {
    pub fn new(ctx: HandlerContext) -> Result<Self, RegistryError> {
        Ok(Self {
            base: HandlerBase::new(ctx, Gvr::of::<StatefulSet>(true))?,
        })
    }
}

#[async_trait]
impl ResourceHandler for StatefulSetHandler {
    handler_identity!();

    async fn handle_create(&self, obj: &RawObject, store: &dyn GraphStore) -> Result<(), HandlerError> {
        let sts: StatefulSet = obj.convert(self.kind())?;
        let mut props = self.base.base_properties(&sts.metadata)?;
        if let Some(spec) = &sts.spec {
            props.insert("replicas".into(), json!(spec.replicas));
            props.insert("selector".into(), json!(spec.selector.match_labels));
        }
        if let Some(status) = &sts.status {
            props.insert("readyReplicas".into(), json!(status.ready_replicas));
            props.insert("currentReplicas".into(), json!(status.current_replicas));
        }
        self.base.upsert(store, &props).await?;
        let me = self.base.node_ref(&sts.metadata);
        self.base.link_metadata(store, &sts.metadata, &me).await;
        Ok(())
    }
}

pub struct DaemonSetHandler {
    base: HandlerBase,
}

impl DaemonSetHandler {
    pub fn new(ctx: HandlerContext) -> Result<Self, RegistryError> {
        Ok(Self {
            base: HandlerBase::new(ctx, Gvr::of::<DaemonSet>(true))?,
        })
    }
}

#[async_trait]
impl ResourceHandler for DaemonSetHandler {
    handler_identity!();

    async fn handle_create(&self, obj: &RawObject, store: &dyn GraphStore) -> Result<(), HandlerError> {
        let ds: DaemonSet = obj.convert(self.kind())?;
        let mut props = self.base.base_properties(&ds.metadata)?;
        if let Some(spec) = &ds.spec {
            props.insert("selector".into(), json!(spec.selector.match_labels));
        }
        if let Some(status) = &ds.status {
            props.insert("desiredNumberScheduled".into(), json!(status.desired_number_scheduled));
            props.insert("numberReady".into(), json!(status.number_ready));
            props.insert("numberAvailable".into(), json!(status.number_available));
        }
        self.base.upsert(store, &props).await?;
        let me = self.base.node_ref(&ds.metadata);
        self.base.link_metadata(store, &ds.metadata, &me).await;
        Ok(())
    }
}

pub struct JobHandler {
    base: HandlerBase,
}

impl JobHandler {
    pub fn new(ctx: HandlerContext) -> Result<Self, RegistryError> {
        Ok(Self {
            base: HandlerBase::new(ctx, Gvr::of::<Job>(true))?,
        })
    }
}

#[async_trait]
impl ResourceHandler for JobHandler {
    handler_identity!();

    async fn handle_create(&self, obj: &RawObject, store: &dyn GraphStore) -> Result<(), HandlerError> {
        let job: Job = obj.convert(self.kind())?;
        let mut props = self.base.base_properties(&job.metadata)?;
        if let Some(spec) = &job.spec {
            props.insert("completions".into(), json!(spec.completions));
            props.insert("parallelism".into(), json!(spec.parallelism));
        }
        if let Some(status) = &job.status {
            props.insert("active".into(), json!(status.active));
            props.insert("succeeded".into(), json!(status.succeeded));
            props.insert("failed".into(), json!(status.failed));
            props.insert("startTime".into(), json!(timestamp(&status.start_time)));
            props.insert("completionTime".into(), json!(timestamp(&status.completion_time)));
        }
        self.base.upsert(store, &props).await?;
        let me = self.base.node_ref(&job.metadata);
        self.base.link_metadata(store, &job.metadata, &me).await;
        Ok(())
    }
}

pub struct CronJobHandler {
    base: HandlerBase,
}

impl CronJobHandler {
    pub fn new(ctx: HandlerContext) -> Result<Self, RegistryError> {
        Ok(Self {
            base: HandlerBase::new(ctx, Gvr::of::<CronJob>(true))?,
        })
    }
}

#[async_trait]
impl ResourceHandler for CronJobHandler {
    handler_identity!();

    async fn handle_create(&self, obj: &RawObject, store: &dyn GraphStore) -> Result<(), HandlerError> {
        let cron: CronJob = obj.convert(self.kind())?;
        let mut props = self.base.base_properties(&cron.metadata)?;
        if let Some(spec) = &cron.spec {
            props.insert("schedule".into(), json!(spec.schedule));
            props.insert("suspend".into(), json!(spec.suspend.unwrap_or(false)));
        }
        if let Some(status) = &cron.status {
            props.insert("lastScheduleTime".into(), json!(timestamp(&status.last_schedule_time)));
        }
        self.base.upsert(store, &props).await?;
        let me = self.base.node_ref(&cron.metadata);
        self.base.link_metadata(store, &cron.metadata, &me).await;
        Ok(())
    }
}
