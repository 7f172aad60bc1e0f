use crate::cache::{Applied, Op, ResourceCache};
use crate::config::RelayConfig;
use crate::correlation::{default_rules, CorrelationIndex, JoinRule, ViewChange};
use crate::hub::{ClientHub, Next, Outbound};
use crate::rollup::Classifier;
use crate::upstream::{Upstream, WatchScope};
use crate::watch::{EventSink, SessionEvent, SessionStatus, WatchSessionManager};
use kview_api::{
    CompositeView, Delta, ErrorReport, HubMessage, ObjectKey, ObjectRef, ObjectState,
    ResourceObject, Scope, SessionReport, SessionState, Snapshot, StatusLabelSet,
    SubscriptionFilter,
};

use log;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/*
 * Pipeline is where watch events of one context become hub messages.
 *
 * The index mutex doubles as the pipeline lock: cache mutation, view
 * recomputation, classification and enqueueing for one event happen under
 * it, so every subscriber sees object deltas and the view deltas they cause
 * in upstream order, and a resync snapshot is never followed by an older
 * delta. Session reports are only touched under it too.
 */
struct Pipeline {
    context: String,
    cache: ResourceCache,
    classifier: Classifier,
    hub: ClientHub,
    index: Mutex<CorrelationIndex>,
    sessions: Mutex<HashMap<WatchScope, SessionReport>>,
}

impl Pipeline {

    fn apply_object(&self, op: Op, obj: ResourceObject) {
	let mut index = self.index.lock();

	// re-lists replay objects we already have
	if op != Op::Delete && !obj.resource_version.is_empty() {
	    if let Some(cached) = self.cache.get(&obj.kind, &obj.key) {
		if cached.resource_version == obj.resource_version {
		    return;
		}
	    }
	}

	let kind = obj.kind.clone();
	let key = obj.key.clone();

	let applied = self.cache.apply(op, obj);
	let changes = index.apply(&applied, &self.cache, &self.classifier);

	match &applied {
	    Applied::Upserted { current, .. } => {
		let delta = Delta::Upsert{
		    object: (**current).clone(),
		    labels: self.classifier.classify(current),
		};
		self.publish(current.object_ref(), delta);
	    },
	    Applied::Deleted { previous } => {
		self.publish(previous.object_ref(), Delta::Delete{
		    object: previous.object_ref(),
		});
	    },
	    Applied::Unknown => {
		log::debug!("ignoring delete of unknown {}/{}", kind, key);
	    },
	}

	for change in changes {
	    match change {
		ViewChange::Updated(view) => {
		    let root = view.root.clone();
		    self.publish(root, Delta::View{
			view: view,
		    });
		},
		ViewChange::Removed(root) => {
		    self.publish(root.clone(), Delta::ViewRemoved{
			root: root,
		    });
		},
	    }
	}

	if matches!(applied, Applied::Deleted { .. }) {
	    self.cache.evict(&kind, &key);
	}
    }

    fn publish(&self, object: ObjectRef, delta: Delta) {
	let msg = HubMessage::Delta{
	    scope: Scope::object(&self.context, &object.kind, &object.key.namespace),
	    payload: delta,
	};
	self.hub.publish(&object.kind, &object.key.namespace, &msg);
    }

    fn publish_session(&self, scope: &WatchScope, msg: HubMessage) {
	self.hub.publish_session(scope, &msg);
    }

    fn session_scope(&self, scope: &WatchScope) -> Scope {
	Scope{
	    context: self.context.clone(),
	    kind: Some(scope.kind.clone()),
	    namespace: scope.namespace.clone(),
	}
    }

    /*
     * Keeps the last reported state of a session around for snapshots. A
     * failure sticks until the scope streams again.
     */
    fn track_session(&self, scope: &WatchScope, state: SessionState, retries: u32) {
	let mut sessions = self.sessions.lock();
	let report = sessions.entry(scope.clone()).or_insert_with(|| SessionReport{
	    scope: self.session_scope(scope),
	    state: state,
	    retries: retries,
	    error: None,
	});
	report.state = state;
	report.retries = retries;
	if state == SessionState::Streaming {
	    report.error = None;
	}

	if state == SessionState::Closed && report.error.is_none() {
	    sessions.remove(scope);
	}
    }

    fn track_failure(&self, scope: &WatchScope, message: &str) {
	let mut sessions = self.sessions.lock();
	let report = sessions.entry(scope.clone()).or_insert_with(|| SessionReport{
	    scope: self.session_scope(scope),
	    state: SessionState::Closed,
	    retries: 0,
	    error: None,
	});
	report.error = Some(message.to_string());
    }

    fn session_reports(&self, scopes: &BTreeSet<WatchScope>) -> Vec<SessionReport> {
	let sessions = self.sessions.lock();
	scopes.iter()
	    .map(|scope| match sessions.get(scope) {
		Some(report) => report.clone(),
		None => SessionReport{
		    scope: self.session_scope(scope),
		    state: SessionState::Idle,
		    retries: 0,
		    error: None,
		},
	    })
	    .collect()
    }

    /*
     * Everything currently visible through `filter`, plus the state of the
     * watch sessions in `scopes`. Callers hold the index lock.
     */
    fn snapshot(&self, index: &CorrelationIndex, filter: &SubscriptionFilter, scopes: &BTreeSet<WatchScope>) -> Snapshot {
	let namespaces: Vec<Option<&str>> = if filter.namespaces.is_empty() {
	    vec![None]
	} else {
	    filter.namespaces.iter().map(|ns| Some(ns.as_str())).collect()
	};

	let mut objects = vec![];
	for kind in &filter.kinds {
	    for ns in &namespaces {
		objects.extend(self.cache.list(kind, *ns).into_iter().map(|obj| ObjectState{
		    labels: self.classifier.classify(&obj),
		    object: (*obj).clone(),
		}));
	    }
	}

	// cluster scoped objects pass every namespace filter
	if !filter.namespaces.is_empty() {
	    for kind in &filter.kinds {
		objects.extend(self.cache.list(kind, Some("")).into_iter().map(|obj| ObjectState{
		    labels: self.classifier.classify(&obj),
		    object: (*obj).clone(),
		}));
	    }
	}

	Snapshot{
	    objects: objects,
	    views: index.views_for(filter),
	    sessions: self.session_reports(scopes),
	}
    }
}

impl EventSink for Pipeline {

    fn cached_keys(&self, scope: &WatchScope) -> BTreeSet<ObjectKey> {
	self.cache.keys(&scope.kind, scope.namespace.as_deref())
    }

    fn apply(&self, scope: &WatchScope, event: SessionEvent) {
	match event {
	    SessionEvent::Object(op, obj) => self.apply_object(op, obj),
	    SessionEvent::StateChanged { state, retries } => {
		let _index = self.index.lock();
		self.track_session(scope, state, retries);
		self.publish_session(scope, HubMessage::Delta{
		    scope: self.session_scope(scope),
		    payload: Delta::Session{
			state: state,
			retries: retries,
		    },
		});
	    },
	    SessionEvent::Failed(message) => {
		let _index = self.index.lock();
		self.track_failure(scope, &message);
		self.publish_session(scope, HubMessage::Error{
		    scope: self.session_scope(scope),
		    payload: ErrorReport{
			message: message,
			terminal: true,
		    },
		});
	    },
	}
    }
}

/*
 * ClusterContext is the live state relayed for one kubeconfig context: its
 * cache, correlation index, subscribers and the watch sessions they need.
 */
pub struct ClusterContext {
    name: String,
    config: RelayConfig,
    pipeline: Arc<Pipeline>,
    watches: WatchSessionManager,

    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl ClusterContext {

    pub fn new(name: &str, upstream: Arc<dyn Upstream>, config: RelayConfig) -> Arc<Self> {
	Self::with_rules(name, upstream, config, default_rules(), Classifier::default())
    }

    /*
     * Must be called from within a tokio runtime: the heartbeat reaper is
     * started right away.
     */
    pub fn with_rules(name: &str, upstream: Arc<dyn Upstream>, config: RelayConfig, rules: Vec<JoinRule>, classifier: Classifier) -> Arc<Self> {
	let pipeline = Arc::new(Pipeline{
	    context: name.to_string(),
	    cache: ResourceCache::new(),
	    classifier: classifier,
	    hub: ClientHub::new(config.queue_capacity),
	    index: Mutex::new(CorrelationIndex::new(rules)),
	    sessions: Mutex::new(HashMap::new()),
	});

	let watches = WatchSessionManager::new(upstream, pipeline.clone(), config.clone());

	let context = Arc::new(Self{
	    name: name.to_string(),
	    config: config,
	    pipeline: pipeline,
	    watches: watches,
	    cancel: CancellationToken::new(),
	    tasks: TaskTracker::new(),
	});

	if !context.config.heartbeat_timeout.is_zero() {
	    context.tasks.spawn(reap_silent_subscribers(
		Arc::downgrade(&context),
		context.config.heartbeat_timeout,
		context.cancel.clone(),
	    ));
	}

	context
    }

    pub fn name(&self) -> &str {
	&self.name
    }

    /*
     * The watch scopes a filter needs: the filtered kinds themselves plus
     * the kinds their views are built from.
     */
    pub fn interest(&self, filter: &SubscriptionFilter) -> BTreeSet<WatchScope> {
	let namespaces: Vec<Option<&str>> = if filter.namespaces.is_empty() {
	    vec![None]
	} else {
	    filter.namespaces.iter().map(|ns| Some(ns.as_str())).collect()
	};

	let index = self.pipeline.index.lock();
	let mut scopes = BTreeSet::new();

	for kind in &filter.kinds {
	    for ns in &namespaces {
		scopes.insert(WatchScope::new(&self.name, kind.clone(), *ns));
	    }

	    for (target, cross_namespace) in index.dependencies(kind) {
		if cross_namespace {
		    scopes.insert(WatchScope::new(&self.name, target, None));
		    continue;
		}
		for ns in &namespaces {
		    scopes.insert(WatchScope::new(&self.name, target.clone(), *ns));
		}
	    }
	}

	scopes
    }

    /*
     * Registers a subscriber and starts (or joins) the watches it needs.
     * The first message it receives is a resync.
     */
    pub fn subscribe(self: &Arc<Self>, id: &str, filter: SubscriptionFilter) -> ClientSession {
	let scopes = self.interest(&filter);
	log::info!("{} subscribes to {} with {} watch scope(s)", id, self.name, scopes.len());

	let (outbound, replaced) = self.pipeline.hub.register(id, filter, scopes.clone());
	for scope in &scopes {
	    self.watches.acquire(scope);
	}
	for scope in replaced.unwrap_or_default() {
	    self.watches.release(&scope);
	}

	ClientSession{
	    id: id.to_string(),
	    context: self.clone(),
	    outbound: outbound,
	}
    }

    /*
     * New scopes are acquired before old ones are released, so streams both
     * filters need are never torn down.
     */
    pub fn update_filter(&self, id: &str, filter: SubscriptionFilter) -> bool {
	let scopes = self.interest(&filter);
	for scope in &scopes {
	    self.watches.acquire(scope);
	}

	match self.pipeline.hub.update_filter(id, filter, scopes.clone()) {
	    Some(old) => {
		for scope in old {
		    self.watches.release(&scope);
		}
		true
	    },
	    None => {
		for scope in &scopes {
		    self.watches.release(scope);
		}
		false
	    },
	}
    }

    pub fn disconnect(&self, id: &str) {
	if let Some(scopes) = self.pipeline.hub.remove(id) {
	    log::info!("{} left {}", id, self.name);
	    for scope in scopes {
		self.watches.release(&scope);
	    }
	}
    }

    fn disconnect_session(&self, id: &str, outbound: &Arc<Outbound>) {
	if let Some(scopes) = self.pipeline.hub.remove_if(id, outbound) {
	    log::info!("{} left {}", id, self.name);
	    for scope in scopes {
		self.watches.release(&scope);
	    }
	}
    }

    pub fn heartbeat(&self, id: &str) -> bool {
	self.pipeline.hub.touch(id)
    }

    /*
     * Builds the snapshot a subscriber is owed, or None if it is not owed
     * one (any more).
     */
    fn resync(&self, id: &str, outbound: &Outbound) -> Option<HubMessage> {
	let index = self.pipeline.index.lock();

	if !outbound.begin_resync() {
	    return None;
	}
	let filter = self.pipeline.hub.filter(id)?;
	let scopes = self.pipeline.hub.scopes(id)?;
	let snapshot = self.pipeline.snapshot(&index, &filter, &scopes);
	log::debug!("resyncing {} with {} object(s) and {} view(s)", id, snapshot.objects.len(), snapshot.views.len());

	Some(HubMessage::Resync{
	    scope: Scope::context(&self.name),
	    payload: snapshot,
	})
    }

    pub fn snapshot(&self, filter: &SubscriptionFilter) -> Snapshot {
	let scopes = self.interest(filter);
	let index = self.pipeline.index.lock();
	self.pipeline.snapshot(&index, filter, &scopes)
    }

    pub fn get(&self, object: &ObjectRef) -> Option<Arc<ResourceObject>> {
	self.pipeline.cache.get(&object.kind, &object.key)
    }

    pub fn labels(&self, object: &ObjectRef) -> Option<StatusLabelSet> {
	self.get(object).map(|obj| self.pipeline.classifier.classify(&obj))
    }

    pub fn view(&self, root: &ObjectRef) -> Option<CompositeView> {
	self.pipeline.index.lock().view(root).cloned()
    }

    pub fn session_status(&self, scope: &WatchScope) -> Option<SessionStatus> {
	self.watches.status(scope)
    }

    pub fn watch_scopes(&self) -> Vec<WatchScope> {
	self.watches.scopes()
    }

    pub fn subscribers(&self) -> usize {
	self.pipeline.hub.len()
    }

    /*
     * Tells every subscriber the context is gone, then stops all watches.
     */
    pub async fn shutdown(&self) {
	log::info!("shutting down cluster context {}", self.name);
	self.cancel.cancel();

	let report = ErrorReport{
	    message: format!("cluster context {} closed", self.name),
	    terminal: true,
	};
	let closed = self.pipeline.hub.close_all(&Scope::context(&self.name), &report);
	for (_, scopes) in closed {
	    for scope in scopes {
		self.watches.release(&scope);
	    }
	}

	self.watches.shutdown().await;
	self.tasks.close();
	self.tasks.wait().await;
    }
}

async fn reap_silent_subscribers(context: Weak<ClusterContext>, timeout: Duration, cancel: CancellationToken) {
    let period = (timeout / 2).max(Duration::from_millis(10));
    let mut ticker = tokio::time::interval(period);

    loop {
	tokio::select! {
	    _ = cancel.cancelled() => break,
	    _ = ticker.tick() => {},
	}

	let Some(ctx) = context.upgrade() else {
	    break;
	};
	for id in ctx.pipeline.hub.expired(timeout) {
	    log::warn!("{} missed its heartbeat on {}, disconnecting", id, ctx.name);
	    ctx.disconnect(&id);
	}
    }
}

/*
 * One subscriber's end of a context. Dropping it unsubscribes.
 */
pub struct ClientSession {
    id: String,
    context: Arc<ClusterContext>,
    outbound: Arc<Outbound>,
}

impl ClientSession {

    pub fn id(&self) -> &str {
	&self.id
    }

    pub fn context(&self) -> &Arc<ClusterContext> {
	&self.context
    }

    /*
     * The next message for this subscriber, or None once it has been
     * disconnected.
     */
    pub async fn recv(&self) -> Option<HubMessage> {
	loop {
	    match self.outbound.next().await {
		Next::Message(msg) => return Some(msg),
		Next::Resync => {
		    if let Some(msg) = self.context.resync(&self.id, &self.outbound) {
			return Some(msg);
		    }
		    if self.outbound.is_closed() {
			return None;
		    }
		},
		Next::Closed => return None,
	    }
	}
    }

    pub fn update_filter(&self, filter: SubscriptionFilter) -> bool {
	self.context.update_filter(&self.id, filter)
    }

    pub fn heartbeat(&self) -> bool {
	self.context.heartbeat(&self.id)
    }

    pub fn is_closed(&self) -> bool {
	self.outbound.is_closed()
    }

    pub fn overflows(&self) -> u64 {
	self.outbound.overflows()
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
	self.context.disconnect_session(&self.id, &self.outbound);
    }
}
