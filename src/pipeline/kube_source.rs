//! `ClusterSource` backed by the Kubernetes API.
//!
//! Every kind is watched through the dynamic API so compiled-in types and
//! custom resources share one code path; objects reach the handlers as
//! unstructured JSON.

use super::source::{ClusterSource, ProbeError, WatchEvent, WatchStream};
use crate::handlers::{Gvr, RawObject};
use anyhow::Context;
use async_trait::async_trait;
use futures::{stream, StreamExt};
use kube::api::{Api, ApiResource, DynamicObject, ListParams};
use kube::core::TypeMeta;
use kube::runtime::watcher::{self, watcher};
use kube::runtime::WatchStreamExt;
use kube::Client;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};

pub struct KubeSource {
    client: Client,
}

impl KubeSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Client from the in-cluster service account or the local kubeconfig.
    pub async fn try_default() -> anyhow::Result<Self> {
        let client = Client::try_default()
            .await
            .context("Failed to create Kubernetes client")?;
        Ok(Self::new(client))
    }

    fn api(&self, gvr: &Gvr) -> Api<DynamicObject> {
        Api::all_with(self.client.clone(), &api_resource(gvr))
    }
}

fn api_resource(gvr: &Gvr) -> ApiResource {
    ApiResource {
        group: gvr.group.clone(),
        version: gvr.version.clone(),
        api_version: gvr.api_version(),
        kind: gvr.kind.clone(),
        plural: gvr.resource.clone(),
    }
}

/// Serialize a watched object, restoring the type metadata list responses omit.
fn to_raw(mut obj: DynamicObject, types: &TypeMeta) -> anyhow::Result<RawObject> {
    if obj.types.is_none() {
        obj.types = Some(types.clone());
    }
    let value = serde_json::to_value(&obj).context("Failed to serialize watched object")?;
    Ok(RawObject::Unstructured(value))
}

fn classify(gvr: &Gvr, err: kube::Error) -> ProbeError {
    match err {
        kube::Error::Api(resp) if resp.code == 404 => {
            ProbeError::NotFound(format!("{}: {}", gvr, resp.message))
        }
        kube::Error::Api(resp) if resp.code == 403 => {
            ProbeError::Forbidden(format!("{}: {}", gvr, resp.message))
        }
        other => ProbeError::Other(anyhow::Error::new(other).context(format!("probing {}", gvr))),
    }
}

#[async_trait]
impl ClusterSource for KubeSource {
    async fn probe(&self, gvr: &Gvr) -> Result<(), ProbeError> {
        self.api(gvr)
            .list(&ListParams::default().limit(1))
            .await
            .map(|_| ())
            .map_err(|e| classify(gvr, e))
    }

    fn watch(&self, gvr: &Gvr) -> WatchStream {
        let mut tracker = RelistTracker::new(TypeMeta {
            api_version: gvr.api_version(),
            kind: gvr.kind.clone(),
        });
        watcher(self.api(gvr), watcher::Config::default())
            .default_backoff()
            .flat_map(move |event| {
                let mapped = match event {
                    Ok(event) => tracker.apply(event),
                    Err(e) => vec![Err(anyhow::Error::new(e).context("watch stream error"))],
                };
                stream::iter(mapped)
            })
            .boxed()
    }
}

/// Maps raw watcher events to pipeline notifications for one kind.
///
/// The watcher re-lists after a desync without reporting objects removed
/// in the meantime. The tracker keeps the uids currently listed and, when
/// a re-list completes, emits `Deleted` for every uid it no longer saw.
struct RelistTracker {
    types: TypeMeta,
    /// uid -> identifying stub of the last known object.
    known: HashMap<String, Value>,
    /// uids delivered by the listing in progress.
    relisted: Option<HashSet<String>>,
}

impl RelistTracker {
    fn new(types: TypeMeta) -> Self {
        Self {
            types,
            known: HashMap::new(),
            relisted: None,
        }
    }

    fn apply(&mut self, event: watcher::Event<DynamicObject>) -> Vec<anyhow::Result<WatchEvent>> {
        match event {
            watcher::Event::Init => {
                self.relisted = Some(HashSet::new());
                Vec::new()
            }
            watcher::Event::InitApply(obj) => vec![self.track(obj).map(WatchEvent::Added)],
            watcher::Event::Apply(obj) => vec![self.track(obj).map(WatchEvent::Updated)],
            watcher::Event::Delete(obj) => {
                if let Some(uid) = obj.metadata.uid.as_deref() {
                    self.known.remove(uid);
                }
                vec![to_raw(obj, &self.types).map(WatchEvent::Deleted)]
            }
            watcher::Event::InitDone => {
                let mut out: Vec<anyhow::Result<WatchEvent>> = Vec::new();
                if let Some(relisted) = self.relisted.take() {
                    let gone: Vec<String> = self
                        .known
                        .keys()
                        .filter(|uid| !relisted.contains(*uid))
                        .cloned()
                        .collect();
                    for uid in gone {
                        if let Some(stub) = self.known.remove(&uid) {
                            tracing::debug!(kind = %self.types.kind, uid = %uid, "Object vanished during re-list");
                            out.push(Ok(WatchEvent::Deleted(RawObject::Unstructured(stub))));
                        }
                    }
                }
                out.push(Ok(WatchEvent::Synced));
                out
            }
        }
    }

    fn track(&mut self, obj: DynamicObject) -> anyhow::Result<RawObject> {
        if let Some(uid) = obj.metadata.uid.clone() {
            let stub = json!({
                "apiVersion": self.types.api_version,
                "kind": self.types.kind,
                "metadata": {
                    "name": obj.metadata.name,
                    "namespace": obj.metadata.namespace,
                    "uid": uid,
                }
            });
            if let Some(relisted) = self.relisted.as_mut() {
                relisted.insert(uid.clone());
            }
            self.known.insert(uid, stub);
        }
        to_raw(obj, &self.types)
    }
}
