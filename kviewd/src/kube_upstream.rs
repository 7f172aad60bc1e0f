use crate::errors::Error;
use crate::upstream::{EventStream, ListResult, Upstream, UpstreamFactory, WatchEvent, WatchScope};
use kview_api::{ResourceKind, ResourceObject};

use async_trait::async_trait;
use futures::StreamExt;
use kube::Api as KubeApi;
use kube::Client as KubeClient;
use kube::Config as KubeConfig;
use kube::api::ApiResource as KubeApiResource;
use kube::api::DynamicObject as KubeDynamicObject;
use kube::api::GroupVersionKind as KubeGvk;
use kube::api::ListParams as KubeListParams;
use kube::api::WatchEvent as KubeWatchEvent;
use kube::api::WatchParams as KubeWatchParams;
use kube::config::KubeConfigOptions;
use log;
use std::sync::Arc;

/*
 * KubeUpstream speaks to a real API server through kube-rs, using
 * DynamicObject so that any kind (core, apps, Flux or Carvel CRDs) can be
 * listed and watched without compiled-in types.
 */
#[derive(Clone)]
pub struct KubeUpstream {
    kube_client: KubeClient,
    watch_timeout_secs: u32,
}

fn to_resource(kind: &ResourceKind, obj: KubeDynamicObject) -> Result<ResourceObject, Error> {
    let body = serde_json::to_value(&obj)?;
    Ok(ResourceObject::from_manifest(kind.clone(), body))
}

/*
 * Maps a watch event to our own event type. An error event with code 410
 * means our resource version is gone and the caller has to re-list.
 */
fn to_event(kind: &ResourceKind, event: KubeWatchEvent<KubeDynamicObject>) -> Result<WatchEvent, Error> {
    let event = match event {
	KubeWatchEvent::Added(obj) => WatchEvent::Added(to_resource(kind, obj)?),
	KubeWatchEvent::Modified(obj) => WatchEvent::Modified(to_resource(kind, obj)?),
	KubeWatchEvent::Deleted(obj) => WatchEvent::Deleted(to_resource(kind, obj)?),
	KubeWatchEvent::Bookmark(bookmark) => WatchEvent::Bookmark(bookmark.metadata.resource_version),
	KubeWatchEvent::Error(resp) => {
	    return Err(match resp.code {
		410 => Error::Expired,
		401 | 403 | 404 => Error::Denied(resp.message),
		_ => Error::Transient(format!("{} ({})", resp.message, resp.code)),
	    });
	}
    };

    Ok(event)
}

impl KubeUpstream {

    fn api(&self, scope: &WatchScope) -> KubeApi<KubeDynamicObject> {
	let gvk = KubeGvk::gvk(&scope.kind.group, &scope.kind.version, &scope.kind.kind);
	let resource = KubeApiResource::from_gvk(&gvk);

	match &scope.namespace {
	    Some(ns) => KubeApi::namespaced_with(self.kube_client.clone(), ns, &resource),
	    None => KubeApi::all_with(self.kube_client.clone(), &resource),
	}
    }

    pub fn new(kube_client: KubeClient, watch_timeout_secs: u32) -> Self {
	Self{
	    kube_client: kube_client,
	    watch_timeout_secs: watch_timeout_secs,
	}
    }
}

#[async_trait]
impl Upstream for KubeUpstream {

    async fn list(&self, scope: &WatchScope) -> Result<ListResult, Error> {
	let list = self.api(scope).list(&KubeListParams::default()).await?;
	let resource_version = list.metadata.resource_version.clone().unwrap_or_default();

	log::debug!("listed {} objects for {} at {}", list.items.len(), scope, resource_version);

	let objects = list.items.into_iter()
	    .map(|obj| to_resource(&scope.kind, obj))
	    .collect::<Result<Vec<_>, Error>>()?;

	Ok(ListResult{
	    objects: objects,
	    resource_version: resource_version,
	})
    }

    async fn watch(&self, scope: &WatchScope, resource_version: &str) -> Result<EventStream, Error> {
	let params = KubeWatchParams::default().timeout(self.watch_timeout_secs);
	let stream = self.api(scope).watch(&params, resource_version).await?;

	let kind = scope.kind.clone();
	let events = stream.map(move |event| match event {
	    Ok(event) => to_event(&kind, event),
	    Err(err) => Err(Error::from(err)),
	});

	Ok(events.boxed())
    }
}

/*
 * Builds one KubeUpstream per kubeconfig context. An empty context name
 * means whatever the environment selects (in-cluster config or the current
 * kubeconfig context).
 */
pub struct KubeUpstreamFactory {
    watch_timeout_secs: u32,
}

impl KubeUpstreamFactory {
    pub fn new(watch_timeout_secs: u32) -> Self {
	Self{
	    watch_timeout_secs: watch_timeout_secs,
	}
    }
}

#[async_trait]
impl UpstreamFactory for KubeUpstreamFactory {

    async fn connect(&self, context: &str) -> Result<Arc<dyn Upstream>, Error> {
	let kube_client = if context.is_empty() {
	    KubeClient::try_default().await?
	} else {
	    let opts = KubeConfigOptions{
		context: Some(context.to_string()),
		cluster: None,
		user: None,
	    };
	    let config = KubeConfig::from_kubeconfig(&opts).await?;
	    KubeClient::try_from(config)?
	};

	log::info!("connected to cluster context '{}'", context);
	Ok(Arc::new(KubeUpstream::new(kube_client, self.watch_timeout_secs)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pod(name: &str) -> KubeDynamicObject {
	serde_json::from_value(json!({
	    "apiVersion": "v1",
	    "kind": "Pod",
	    "metadata": {"name": name, "namespace": "shop", "resourceVersion": "7", "labels": {"app": "web"}},
	    "spec": {"containers": []}
	})).unwrap()
    }

    #[test]
    fn converts_dynamic_objects() {
	let event = to_event(&ResourceKind::pod(), KubeWatchEvent::Modified(pod("web-0"))).unwrap();

	match event {
	    WatchEvent::Modified(obj) => {
		assert_eq!(obj.name(), "web-0");
		assert_eq!(obj.namespace(), "shop");
		assert_eq!(obj.resource_version, "7");
		assert_eq!(obj.labels.get("app").map(String::as_str), Some("web"));
		assert!(obj.body.pointer("/spec/containers").is_some());
	    },
	    other => panic!("unexpected event {:?}", other),
	}
    }

    #[test]
    fn gone_maps_to_expired() {
	let resp = kube::core::ErrorResponse{
	    status: "Failure".to_string(),
	    message: "too old resource version".to_string(),
	    reason: "Expired".to_string(),
	    code: 410,
	};

	let err = to_event(&ResourceKind::pod(), KubeWatchEvent::Error(resp)).unwrap_err();
	assert!(err.is_expired());
    }
}
