use crate::backoff::Backoff;
use crate::cache::Op;
use crate::config::RelayConfig;
use crate::errors::Error;
use crate::upstream::{Upstream, WatchEvent, WatchScope};
use kview_api::{ObjectKey, ResourceObject, SessionState};

use futures::StreamExt;
use log;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/*
 * What a watch session hands to the rest of the relay, in receipt order.
 */
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Object(Op, ResourceObject),

    StateChanged {
	state: SessionState,
	retries: u32,
    },

    /* the session gave up; it will not retry */
    Failed(String),
}

/*
 * The consumer of session events: the relay pipeline in production, a
 * recorder in tests.
 */
pub trait EventSink: Send + Sync + 'static {

    /*
     * Keys currently cached for the scope, reconciled against every
     * (re-)list.
     */
    fn cached_keys(&self, scope: &WatchScope) -> BTreeSet<ObjectKey>;

    fn apply(&self, scope: &WatchScope, event: SessionEvent);
}

#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub state: SessionState,
    pub resource_version: Option<String>,
    pub retries: u32,
    pub last_event: Option<Instant>,
    pub error: Option<String>,
}

impl SessionStatus {
    fn new() -> Self {
	Self{
	    state: SessionState::Idle,
	    resource_version: None,
	    retries: 0,
	    last_event: None,
	    error: None,
	}
    }
}

struct SessionEntry {
    id: u64,
    subscribers: usize,
    cancel: CancellationToken,
    status: Arc<Mutex<SessionStatus>>,
}

struct Shared {
    sessions: Mutex<HashMap<WatchScope, SessionEntry>>,
    closing: AtomicBool,
    next_id: AtomicU64,
}

/*
 * WatchSessionManager keeps exactly one upstream watch alive per scope
 * that has at least one interested subscriber.
 *
 * Each session runs on its own task and walks
 *
 *   Idle -> Connecting -> Streaming -> Reconnecting -> Connecting ...
 *
 * until its last subscriber leaves (or the manager shuts down), which
 * moves it to Closed.
 */
pub struct WatchSessionManager {
    upstream: Arc<dyn Upstream>,
    sink: Arc<dyn EventSink>,
    config: RelayConfig,

    shared: Arc<Shared>,
    root: CancellationToken,
    tracker: TaskTracker,
}

impl WatchSessionManager {

    pub fn new(upstream: Arc<dyn Upstream>, sink: Arc<dyn EventSink>, config: RelayConfig) -> Self {
	Self{
	    upstream: upstream,
	    sink: sink,
	    config: config,
	    shared: Arc::new(Shared{
		sessions: Mutex::new(HashMap::new()),
		closing: AtomicBool::new(false),
		next_id: AtomicU64::new(1),
	    }),
	    root: CancellationToken::new(),
	    tracker: TaskTracker::new(),
	}
    }

    /*
     * Registers interest in a scope, starting its session on the 0 -> 1
     * transition. A session that gave up is started over for the newcomer,
     * keeping the subscribers it already had. Must be called from within a
     * tokio runtime.
     */
    pub fn acquire(&self, scope: &WatchScope) {
	let mut sessions = self.shared.sessions.lock();

	let subscribers = match sessions.get_mut(scope) {
	    Some(entry) => {
		entry.subscribers += 1;
		log::debug!("{} now has {} subscriber(s)", scope, entry.subscribers);
		if entry.status.lock().state != SessionState::Closed {
		    return;
		}
		entry.cancel.cancel();
		entry.subscribers
	    },
	    None => 1,
	};

	if self.shared.closing.load(Ordering::SeqCst) {
	    log::warn!("not starting a watch for {}, shutting down", scope);
	    return;
	}

	let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
	let cancel = self.root.child_token();
	let status = Arc::new(Mutex::new(SessionStatus::new()));

	sessions.insert(scope.clone(), SessionEntry{
	    id: id,
	    subscribers: subscribers,
	    cancel: cancel.clone(),
	    status: status.clone(),
	});

	if subscribers > 1 {
	    log::info!("restarting failed watch session for {}", scope);
	} else {
	    log::info!("starting watch session for {}", scope);
	}
	let task = SessionTask{
	    id: id,
	    scope: scope.clone(),
	    upstream: self.upstream.clone(),
	    sink: self.sink.clone(),
	    shared: self.shared.clone(),
	    status: status,
	    cancel: cancel,
	    max_retries: self.config.max_retries,
	    backoff: Backoff::from_config(&self.config),
	    cursor: None,
	    retries: 0,
	};
	self.tracker.spawn(task.run());
    }

    /*
     * Drops interest in a scope; the last subscriber leaving cancels the
     * upstream stream.
     */
    pub fn release(&self, scope: &WatchScope) {
	let mut sessions = self.shared.sessions.lock();

	let Some(entry) = sessions.get_mut(scope) else {
	    return;
	};

	entry.subscribers = entry.subscribers.saturating_sub(1);
	if entry.subscribers == 0 {
	    if let Some(entry) = sessions.remove(scope) {
		log::info!("closing watch session for {}, no subscribers left", scope);
		entry.cancel.cancel();
	    }
	}
    }

    pub fn status(&self, scope: &WatchScope) -> Option<SessionStatus> {
	self.shared.sessions.lock().get(scope).map(|entry| entry.status.lock().clone())
    }

    pub fn subscribers(&self, scope: &WatchScope) -> usize {
	self.shared.sessions.lock().get(scope).map(|entry| entry.subscribers).unwrap_or(0)
    }

    pub fn scopes(&self) -> Vec<WatchScope> {
	let mut scopes: Vec<WatchScope> = self.shared.sessions.lock().keys().cloned().collect();
	scopes.sort();
	scopes
    }

    /*
     * Cancels every session and waits for all session tasks to exit.
     */
    pub async fn shutdown(&self) {
	self.shared.closing.store(true, Ordering::SeqCst);
	self.root.cancel();

	self.tracker.close();
	self.tracker.wait().await;
	self.shared.sessions.lock().clear();
    }
}

struct SessionTask {
    id: u64,
    scope: WatchScope,
    upstream: Arc<dyn Upstream>,
    sink: Arc<dyn EventSink>,
    shared: Arc<Shared>,
    status: Arc<Mutex<SessionStatus>>,
    cancel: CancellationToken,
    max_retries: Option<u32>,

    backoff: Backoff,
    cursor: Option<String>,
    retries: u32,
}

impl SessionTask {

    async fn run(mut self) {
	let cancel = self.cancel.clone();

	loop {
	    self.set_state(SessionState::Connecting);

	    let outcome = tokio::select! {
		_ = cancel.cancelled() => break,
		outcome = self.stream() => outcome,
	    };

	    match outcome {
		Ok(()) => {
		    log::debug!("watch for {} ended, resuming from {:?}", self.scope, self.cursor);
		},
		Err(err) if err.is_expired() => {
		    log::info!("cursor for {} expired, re-listing", self.scope);
		    self.cursor = None;
		},
		Err(err) if err.is_terminal() => {
		    self.fail(err);
		    break;
		},
		Err(err) => {
		    self.retries += 1;
		    if let Some(max) = self.max_retries {
			if self.retries >= max {
			    self.fail(Error::RetriesExhausted(self.retries, err.to_string()));
			    break;
			}
		    }
		    log::warn!("watch for {} failed (attempt {}): {}", self.scope, self.retries, err);
		},
	    }

	    self.set_state(SessionState::Reconnecting);
	    let delay = self.backoff.next_delay();
	    log::debug!("reconnecting {} in {:?}", self.scope, delay);

	    tokio::select! {
		_ = cancel.cancelled() => break,
		_ = tokio::time::sleep(delay) => {},
	    }
	}

	self.close();
    }

    /*
     * One connection: list when there is no cursor, then watch until the
     * stream ends or fails.
     */
    async fn stream(&mut self) -> Result<(), Error> {
	let cursor = match self.cursor.clone() {
	    Some(cursor) => cursor,
	    None => {
		let list = self.upstream.list(&self.scope).await?;
		log::debug!("{} listed {} object(s)", self.scope, list.objects.len());

		self.reconcile(list.objects);
		self.set_cursor(&list.resource_version);
		list.resource_version
	    },
	};

	let mut events = self.upstream.watch(&self.scope, &cursor).await?;
	self.retries = 0;
	self.backoff.mark_healthy();
	self.set_state(SessionState::Streaming);

	while let Some(event) = events.next().await {
	    let event = event?;
	    self.status.lock().last_event = Some(Instant::now());

	    match event {
		WatchEvent::Added(obj) => self.deliver(Op::Add, obj),
		WatchEvent::Modified(obj) => self.deliver(Op::Modify, obj),
		WatchEvent::Deleted(obj) => self.deliver(Op::Delete, obj),
		WatchEvent::Bookmark(rv) => self.set_cursor(&rv),
	    }
	}

	Ok(())
    }

    /*
     * Brings the cache in line with a fresh list: every listed object is
     * upserted and every cached key missing from the list gets a synthetic
     * DELETE.
     */
    fn reconcile(&mut self, objects: Vec<ResourceObject>) {
	let mut missing = self.sink.cached_keys(&self.scope);

	for obj in objects {
	    missing.remove(&obj.key);
	    self.sink.apply(&self.scope, SessionEvent::Object(Op::Modify, obj));
	}

	for key in missing {
	    log::debug!("{} vanished from {} while we were away", key, self.scope);
	    let tombstone = ResourceObject::tombstone(self.scope.kind.clone(), key);
	    self.sink.apply(&self.scope, SessionEvent::Object(Op::Delete, tombstone));
	}
    }

    fn deliver(&mut self, op: Op, obj: ResourceObject) {
	if !obj.resource_version.is_empty() {
	    self.set_cursor(&obj.resource_version);
	}
	self.sink.apply(&self.scope, SessionEvent::Object(op, obj));
    }

    fn set_cursor(&mut self, resource_version: &str) {
	self.cursor = Some(resource_version.to_string());
	self.status.lock().resource_version = Some(resource_version.to_string());
    }

    fn set_state(&self, state: SessionState) {
	{
	    let mut status = self.status.lock();
	    if status.state == state && state != SessionState::Connecting {
		return;
	    }
	    status.state = state;
	    status.retries = self.retries;
	}

	log::info!("watch {} is {}", self.scope, state);
	self.sink.apply(&self.scope, SessionEvent::StateChanged{
	    state: state,
	    retries: self.retries,
	});
    }

    fn fail(&self, err: Error) {
	log::error!("watch for {} failed permanently: {}", self.scope, err);

	self.status.lock().error = Some(err.to_string());
	self.sink.apply(&self.scope, SessionEvent::Failed(err.to_string()));
    }

    /*
     * Final transition. Unless the whole manager is going away, objects of
     * this scope that no other live session covers are evicted, so the
     * cache never keeps data nobody watches.
     */
    fn close(&self) {
	self.set_state(SessionState::Closed);

	if self.shared.closing.load(Ordering::SeqCst) {
	    return;
	}

	// no session of this kind can start or stop while the orphans are
	// picked and evicted; a newer session may still be listing, its
	// reconcile sorts that out
	let sessions = self.shared.sessions.lock();
	let others: Vec<WatchScope> = sessions.iter()
	    .filter(|(scope, entry)| {
		entry.id != self.id
		    && scope.kind == self.scope.kind
		    && entry.status.lock().state != SessionState::Closed
	    })
	    .map(|(scope, _)| scope.clone())
	    .collect();

	let orphans: Vec<ObjectKey> = self.sink.cached_keys(&self.scope).into_iter()
	    .filter(|key| !others.iter().any(|scope| scope.covers(&key.namespace)))
	    .collect();

	if !orphans.is_empty() {
	    log::debug!("evicting {} object(s) of closed scope {}", orphans.len(), self.scope);
	}
	for key in orphans {
	    let tombstone = ResourceObject::tombstone(self.scope.kind.clone(), key);
	    self.sink.apply(&self.scope, SessionEvent::Object(Op::Delete, tombstone));
	}
    }
}
