use kview_api::{Delta, HubMessage, ObjectKey, ResourceKind, ResourceObject, SessionState, StatusLabel, SubscriptionFilter};
use kviewd::{ClientSession, ClusterContext, Error, EventStream, ListResult, Relay, RelayConfig};
use kviewd::{Upstream, UpstreamFactory, WatchEvent, WatchScope};

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

type Sender = mpsc::UnboundedSender<Result<WatchEvent, Error>>;

/*
 * An in-memory API server: tests mutate it and every open watch on a
 * matching scope sees the change.
 */
#[derive(Default)]
struct FakeCluster {
    objects: Mutex<BTreeMap<(ResourceKind, ObjectKey), ResourceObject>>,
    watchers: Mutex<Vec<(WatchScope, Sender)>>,
    version: AtomicU64,
    denied: Mutex<Option<String>>,
}

impl FakeCluster {

    fn bump(&self) -> String {
	(self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn notify(&self, obj: &ResourceObject, event: WatchEvent) {
	self.watchers.lock().retain(|(scope, tx)| {
	    if scope.kind != obj.kind || !scope.covers(obj.namespace()) {
		return true;
	    }
	    tx.send(Ok(event.clone())).is_ok()
	});
    }

    fn upsert(&self, mut obj: ResourceObject) {
	obj.resource_version = self.bump();
	let existed = self.objects.lock()
	    .insert((obj.kind.clone(), obj.key.clone()), obj.clone())
	    .is_some();

	let event = if existed { WatchEvent::Modified(obj.clone()) } else { WatchEvent::Added(obj.clone()) };
	self.notify(&obj, event);
    }

    fn delete(&self, kind: ResourceKind, namespace: &str, name: &str) {
	if let Some(mut obj) = self.remove(kind, namespace, name) {
	    obj.resource_version = self.bump();
	    self.notify(&obj, WatchEvent::Deleted(obj.clone()));
	}
    }

    /* the delete happens while nobody is watching */
    fn remove(&self, kind: ResourceKind, namespace: &str, name: &str) -> Option<ResourceObject> {
	self.objects.lock().remove(&(kind, ObjectKey::new(namespace, name)))
    }

    /* every open watch learns its cursor is too old */
    fn expire_watches(&self) {
	for (_, tx) in self.watchers.lock().drain(..) {
	    let _ = tx.send(Err(Error::Expired));
	}
    }

    fn deny(&self, reason: &str) {
	*self.denied.lock() = Some(reason.to_string());
    }

    fn allow(&self) {
	*self.denied.lock() = None;
    }

    fn check_access(&self) -> Result<(), Error> {
	match self.denied.lock().as_ref() {
	    Some(reason) => Err(Error::Denied(reason.clone())),
	    None => Ok(()),
	}
    }
}

#[async_trait]
impl Upstream for FakeCluster {

    async fn list(&self, scope: &WatchScope) -> Result<ListResult, Error> {
	self.check_access()?;

	let objects = self.objects.lock().values()
	    .filter(|obj| obj.kind == scope.kind && scope.covers(obj.namespace()))
	    .cloned()
	    .collect();

	Ok(ListResult{
	    objects: objects,
	    resource_version: self.version.load(Ordering::SeqCst).to_string(),
	})
    }

    async fn watch(&self, scope: &WatchScope, _resource_version: &str) -> Result<EventStream, Error> {
	self.check_access()?;

	let (tx, rx) = mpsc::unbounded_channel();
	self.watchers.lock().push((scope.clone(), tx));

	let events = futures::stream::unfold(rx, |mut rx| async move {
	    rx.recv().await.map(|event| (event, rx))
	});
	Ok(events.boxed())
    }
}

struct FakeFactory {
    clusters: HashMap<String, Arc<FakeCluster>>,
}

#[async_trait]
impl UpstreamFactory for FakeFactory {
    async fn connect(&self, context: &str) -> Result<Arc<dyn Upstream>, Error> {
	match self.clusters.get(context) {
	    Some(cluster) => Ok(cluster.clone()),
	    None => Err(Error::UnknownContext(context.to_string())),
	}
    }
}

fn config() -> RelayConfig {
    RelayConfig{
	backoff_jitter: 0.0,
	heartbeat_timeout: Duration::ZERO,
	..RelayConfig::default()
    }
}

fn pod(name: &str, app: &str) -> ResourceObject {
    ResourceObject::from_manifest(ResourceKind::pod(), json!({
	"metadata": {"name": name, "namespace": "shop", "labels": {"app": app}},
	"status": {"conditions": [{"type": "Ready", "status": "True"}]}
    }))
}

fn deployment(name: &str, app: &str) -> ResourceObject {
    ResourceObject::from_manifest(ResourceKind::deployment(), json!({
	"metadata": {"name": name, "namespace": "shop", "uid": format!("uid-{}", name)},
	"spec": {
	    "selector": {"matchLabels": {"app": app}},
	    "template": {"metadata": {"labels": {"app": app}}}
	}
    }))
}

fn filter(context: &str, kinds: Vec<ResourceKind>) -> SubscriptionFilter {
    SubscriptionFilter::new(context, kinds, vec!["shop".to_string()])
}

async fn settle() {
    tokio::time::sleep(Duration::from_secs(1)).await;
}

async fn next(session: &ClientSession) -> HubMessage {
    tokio::time::timeout(Duration::from_secs(10), session.recv()).await
	.expect("timed out waiting for a message")
	.expect("session closed")
}

/*
 * Reads until a message satisfies `pred`, skipping everything else.
 */
async fn until<F>(session: &ClientSession, pred: F) -> HubMessage
where
    F: Fn(&HubMessage) -> bool,
{
    loop {
	let msg = next(session).await;
	if pred(&msg) {
	    return msg;
	}
    }
}

fn view_pods(msg: &HubMessage) -> Option<Vec<String>> {
    match msg {
	HubMessage::Delta { payload: Delta::View { view }, .. } => {
	    Some(view.members("pods").iter().map(|m| m.object.key.name.clone()).collect())
	},
	_ => None,
    }
}

#[tokio::test(start_paused = true)]
async fn pods_listed_before_their_deployment_join_its_view() {
    let cluster = Arc::new(FakeCluster::default());
    for name in ["web-1", "web-2", "web-3"] {
	cluster.upsert(pod(name, "web"));
    }
    cluster.upsert(pod("db-0", "db"));

    let ctx = ClusterContext::new("test", cluster.clone(), config());
    let session = ctx.subscribe("ui", filter("test", vec![ResourceKind::deployment()]));
    assert!(next(&session).await.is_resync());
    settle().await;

    cluster.upsert(deployment("web", "web"));

    let msg = until(&session, |msg| view_pods(msg).is_some()).await;
    assert_eq!(view_pods(&msg).unwrap(), vec!["web-1", "web-2", "web-3"]);

    let view = ctx.view(&deployment("web", "web").object_ref()).unwrap();
    for member in view.members("pods") {
	assert!(member.labels.contains(&StatusLabel::Ready));
    }

    ctx.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn deleting_a_pod_shrinks_the_view() {
    let cluster = Arc::new(FakeCluster::default());
    cluster.upsert(pod("web-1", "web"));
    cluster.upsert(pod("web-2", "web"));
    cluster.upsert(deployment("web", "web"));

    let ctx = ClusterContext::new("test", cluster.clone(), config());
    let session = ctx.subscribe("ui", filter("test", vec![ResourceKind::deployment()]));
    settle().await;

    match next(&session).await {
	HubMessage::Resync { payload, .. } => {
	    assert_eq!(payload.objects.len(), 1);
	    assert_eq!(payload.views.len(), 1);
	    assert_eq!(payload.views[0].members("pods").len(), 2);
	},
	other => panic!("expected a resync, got {:?}", other),
    }

    cluster.delete(ResourceKind::pod(), "shop", "web-2");
    let msg = until(&session, |msg| view_pods(msg).is_some()).await;
    assert_eq!(view_pods(&msg).unwrap(), vec!["web-1"]);

    ctx.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn expired_cursor_synthesizes_missed_deletes() {
    let cluster = Arc::new(FakeCluster::default());
    cluster.upsert(pod("a", "web"));
    cluster.upsert(pod("b", "web"));

    let ctx = ClusterContext::new("test", cluster.clone(), config());
    let session = ctx.subscribe("ui", filter("test", vec![ResourceKind::pod()]));
    settle().await;

    match next(&session).await {
	HubMessage::Resync { payload, .. } => assert_eq!(payload.objects.len(), 2),
	other => panic!("expected a resync, got {:?}", other),
    }

    cluster.remove(ResourceKind::pod(), "shop", "b");
    cluster.expire_watches();

    let msg = until(&session, |msg| matches!(msg, HubMessage::Delta { payload: Delta::Delete { .. }, .. })).await;
    match msg {
	HubMessage::Delta { payload: Delta::Delete { object }, .. } => assert_eq!(object.key.name, "b"),
	_ => unreachable!(),
    }

    // back to streaming, nothing else was deleted
    until(&session, |msg| matches!(msg, HubMessage::Delta { payload: Delta::Session { state: SessionState::Streaming, .. }, .. })).await;
    let scope = WatchScope::new("test", ResourceKind::pod(), Some("shop"));
    assert_eq!(ctx.session_status(&scope).unwrap().state, SessionState::Streaming);
    assert!(ctx.get(&pod("a", "web").object_ref()).is_some());

    ctx.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn slow_subscribers_get_one_resync() {
    let cluster = Arc::new(FakeCluster::default());
    let config = RelayConfig{
	queue_capacity: 4,
	..config()
    };

    let ctx = ClusterContext::new("test", cluster.clone(), config);
    let session = ctx.subscribe("ui", filter("test", vec![ResourceKind::pod()]));
    settle().await;
    assert!(next(&session).await.is_resync());

    for i in 0..20 {
	cluster.upsert(pod(&format!("web-{}", i), "web"));
    }
    settle().await;

    match next(&session).await {
	HubMessage::Resync { payload, .. } => assert_eq!(payload.objects.len(), 20),
	other => panic!("expected a resync, got {:?}", other),
    }
    assert_eq!(session.overflows(), 1);

    cluster.upsert(pod("web-20", "web"));
    match next(&session).await {
	HubMessage::Delta { payload: Delta::Upsert { object, .. }, .. } => assert_eq!(object.key.name, "web-20"),
	other => panic!("expected an upsert, got {:?}", other),
    }

    ctx.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn denied_watch_is_reported_once() {
    let cluster = Arc::new(FakeCluster::default());
    cluster.deny("pods is forbidden");

    let ctx = ClusterContext::new("test", cluster.clone(), config());
    let session = ctx.subscribe("ui", filter("test", vec![ResourceKind::pod()]));
    assert!(next(&session).await.is_resync());

    let msg = until(&session, HubMessage::is_error).await;
    match msg {
	HubMessage::Error { payload, .. } => {
	    assert!(payload.terminal);
	    assert!(payload.message.contains("forbidden"));
	},
	_ => unreachable!(),
    }

    let scope = WatchScope::new("test", ResourceKind::pod(), Some("shop"));
    assert_eq!(ctx.session_status(&scope).unwrap().state, SessionState::Closed);

    ctx.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn late_subscribers_learn_about_failed_watches() {
    let cluster = Arc::new(FakeCluster::default());
    cluster.deny("pods is forbidden");

    let ctx = ClusterContext::new("test", cluster.clone(), config());
    let one = ctx.subscribe("one", filter("test", vec![ResourceKind::pod()]));
    until(&one, HubMessage::is_error).await;

    let two = ctx.subscribe("two", filter("test", vec![ResourceKind::pod()]));
    match next(&two).await {
	HubMessage::Resync { payload, .. } => {
	    let report = payload.sessions.iter()
		.find(|report| report.scope.kind == Some(ResourceKind::pod()))
		.expect("no report for the pod watch");
	    assert!(report.error.as_deref().unwrap_or_default().contains("forbidden"));
	},
	other => panic!("expected a resync, got {:?}", other),
    }

    // still denied, so the retry started for "two" fails in front of it too
    let msg = until(&two, HubMessage::is_error).await;
    match msg {
	HubMessage::Error { payload, .. } => assert!(payload.terminal),
	_ => unreachable!(),
    }

    ctx.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failed_watches_recover_for_new_subscribers() {
    let cluster = Arc::new(FakeCluster::default());
    cluster.deny("pods is forbidden");

    let ctx = ClusterContext::new("test", cluster.clone(), config());
    let one = ctx.subscribe("one", filter("test", vec![ResourceKind::pod()]));
    until(&one, HubMessage::is_error).await;

    cluster.allow();
    cluster.upsert(pod("a", "web"));
    settle().await;

    let two = ctx.subscribe("two", filter("test", vec![ResourceKind::pod()]));
    // depending on timing "a" shows up in a resync or as an upsert
    let shows_a = |msg: &HubMessage| match msg {
	HubMessage::Delta { payload: Delta::Upsert { object, .. }, .. } => object.key.name == "a",
	HubMessage::Resync { payload, .. } => payload.objects.iter().any(|state| state.object.key.name == "a"),
	_ => false,
    };
    until(&one, shows_a).await;
    until(&two, shows_a).await;

    let scope = WatchScope::new("test", ResourceKind::pod(), Some("shop"));
    let status = ctx.session_status(&scope).unwrap();
    assert_eq!(status.state, SessionState::Streaming);
    assert!(status.error.is_none());
    assert!(ctx.get(&pod("a", "web").object_ref()).is_some());

    // the next resync no longer carries the failure
    let snapshot = ctx.snapshot(&filter("test", vec![ResourceKind::pod()]));
    let report = snapshot.sessions.iter()
	.find(|report| report.scope.kind == Some(ResourceKind::pod()))
	.expect("no report for the pod watch");
    assert_eq!(report.state, SessionState::Streaming);
    assert!(report.error.is_none());

    ctx.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn relisting_unchanged_objects_sends_no_deltas() {
    let cluster = Arc::new(FakeCluster::default());
    cluster.upsert(pod("a", "web"));
    cluster.upsert(pod("b", "web"));

    let pods = filter("test", vec![ResourceKind::pod()]);
    let ctx = ClusterContext::new("test", cluster.clone(), config());
    let session = ctx.subscribe("ui", pods.clone());
    settle().await;
    assert!(next(&session).await.is_resync());

    let before = ctx.snapshot(&pods);
    assert_eq!(before.objects.len(), 2);

    cluster.expire_watches();
    loop {
	match next(&session).await {
	    HubMessage::Delta { payload: Delta::Session { state, .. }, .. } => {
		if state == SessionState::Streaming {
		    break;
		}
	    },
	    other => panic!("expected only session deltas, got {:?}", other),
	}
    }

    let quiet = tokio::time::timeout(Duration::from_secs(5), session.recv()).await;
    assert!(quiet.is_err(), "unexpected message after the re-list: {:?}", quiet);
    assert_eq!(ctx.snapshot(&pods), before);

    ctx.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unsubscribing_stops_the_watches() {
    let cluster = Arc::new(FakeCluster::default());
    cluster.upsert(pod("a", "web"));

    let ctx = ClusterContext::new("test", cluster.clone(), config());
    let first = ctx.subscribe("one", filter("test", vec![ResourceKind::pod()]));
    let second = ctx.subscribe("two", filter("test", vec![ResourceKind::pod()]));
    settle().await;

    let scope = WatchScope::new("test", ResourceKind::pod(), Some("shop"));
    assert_eq!(ctx.watch_scopes(), vec![scope.clone()]);

    drop(first);
    settle().await;
    assert_eq!(ctx.watch_scopes(), vec![scope.clone()]);
    assert_eq!(ctx.subscribers(), 1);

    drop(second);
    settle().await;
    assert!(ctx.watch_scopes().is_empty());
    assert!(ctx.get(&pod("a", "web").object_ref()).is_none());

    ctx.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn silent_subscribers_are_torn_down() {
    let cluster = Arc::new(FakeCluster::default());
    let config = RelayConfig{
	heartbeat_timeout: Duration::from_secs(30),
	..config()
    };

    let ctx = ClusterContext::new("test", cluster, config);
    let quiet = ctx.subscribe("quiet", filter("test", vec![ResourceKind::pod()]));
    assert!(next(&quiet).await.is_resync());

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(ctx.subscribers(), 0);

    // whatever was queued is still delivered, then the session ends
    let drained = tokio::time::timeout(Duration::from_secs(10), async {
	while quiet.recv().await.is_some() {}
    }).await;
    assert!(drained.is_ok());

    ctx.shutdown().await;
}

fn relay(names: &[&str]) -> (Arc<Relay>, HashMap<String, Arc<FakeCluster>>) {
    let clusters: HashMap<String, Arc<FakeCluster>> = names.iter()
	.map(|name| (name.to_string(), Arc::new(FakeCluster::default())))
	.collect();
    let factory = FakeFactory{
	clusters: clusters.clone(),
    };

    (Relay::new(Arc::new(factory), config()), clusters)
}

#[tokio::test(start_paused = true)]
async fn context_shutdown_ends_its_sessions() {
    let (relay, _) = relay(&["prod"]);
    let conn = relay.connect("ui", filter("prod", vec![ResourceKind::pod()])).await.unwrap();
    assert!(conn.recv().await.unwrap().is_resync());

    assert!(relay.shutdown_context("prod").await);
    assert!(!relay.shutdown_context("prod").await);

    loop {
	match conn.recv().await {
	    Some(HubMessage::Error { payload, .. }) => {
		assert!(payload.terminal);
		break;
	    },
	    Some(_) => continue,
	    None => panic!("closed without an error report"),
	}
    }
    assert!(conn.recv().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn filters_can_move_between_contexts() {
    let (relay, clusters) = relay(&["prod", "staging"]);
    clusters["staging"].upsert(pod("canary", "web"));

    let mut conn = relay.connect("ui", filter("prod", vec![ResourceKind::pod()])).await.unwrap();
    assert_eq!(conn.context(), "prod");
    assert!(conn.recv().await.unwrap().is_resync());

    conn.update_filter(filter("staging", vec![ResourceKind::pod()])).await.unwrap();
    assert_eq!(conn.context(), "staging");
    settle().await;

    match conn.recv().await {
	Some(HubMessage::Resync { scope, payload }) => {
	    assert_eq!(scope.context, "staging");
	    assert_eq!(payload.objects.len(), 1);
	    assert_eq!(payload.objects[0].object.key.name, "canary");
	},
	other => panic!("expected a resync, got {:?}", other),
    }

    // prod lost its only subscriber
    let prod = relay.context("prod").await.unwrap();
    assert_eq!(prod.subscribers(), 0);
    assert!(prod.watch_scopes().is_empty());

    let err = relay.connect("ui2", filter("nowhere", vec![])).await.err().unwrap();
    assert!(matches!(err, Error::UnknownContext(_)));

    relay.shutdown().await;
    assert!(relay.contexts().await.is_empty());
}
