use crate::upstream::WatchScope;
use kview_api::{ErrorReport, HubMessage, ResourceKind, Scope, SubscriptionFilter};

use log;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Push {
    Queued,

    /* the queue was full: its deltas were dropped and a resync is owed */
    Overflowed,

    /* a resync is already owed and will carry this change */
    Absorbed,

    Closed,
}

#[derive(Debug)]
pub enum Next {
    Message(HubMessage),

    /* the consumer must fetch a fresh snapshot before anything else */
    Resync,

    Closed,
}

struct OutboundState {
    queue: VecDeque<HubMessage>,
    needs_resync: bool,
    closed: bool,
    overflows: u64,
}

/*
 * Outbound is the bounded queue between the relay and one subscriber.
 *
 * Pushing never blocks. When the queue is full every queued delta is
 * dropped and the subscriber is owed exactly one resync; further deltas
 * are absorbed until that resync has been built. Error reports survive an
 * overflow.
 */
pub struct Outbound {
    capacity: usize,
    state: Mutex<OutboundState>,
    notify: Notify,
}

impl Outbound {

    pub fn new(capacity: usize) -> Self {
	Self{
	    capacity: capacity.max(1),
	    state: Mutex::new(OutboundState{
		queue: VecDeque::new(),
		// a fresh subscriber starts from a snapshot
		needs_resync: true,
		closed: false,
		overflows: 0,
	    }),
	    notify: Notify::new(),
	}
    }

    pub fn push(&self, msg: HubMessage) -> Push {
	let mut state = self.state.lock();

	if state.closed {
	    return Push::Closed;
	}

	let outcome = if msg.is_error() {
	    if state.queue.len() >= self.capacity {
		Self::overflow(&mut state);
	    }
	    if state.queue.len() >= self.capacity {
		// nothing but errors left
		state.queue.pop_front();
	    }
	    state.queue.push_back(msg);
	    Push::Queued
	} else if state.needs_resync {
	    return Push::Absorbed;
	} else if state.queue.len() >= self.capacity {
	    Self::overflow(&mut state);
	    Push::Overflowed
	} else {
	    state.queue.push_back(msg);
	    Push::Queued
	};

	drop(state);
	self.notify.notify_one();
	outcome
    }

    fn overflow(state: &mut OutboundState) {
	state.queue.retain(HubMessage::is_error);
	state.needs_resync = true;
	state.overflows += 1;
    }

    /*
     * Waits for the next thing to hand to the subscriber. Queued error
     * reports go first, then an owed resync, then deltas in order.
     */
    pub async fn next(&self) -> Next {
	loop {
	    let notified = self.notify.notified();

	    {
		let mut state = self.state.lock();

		if state.needs_resync {
		    // only error reports are left in the queue here
		    if let Some(msg) = state.queue.pop_front() {
			return Next::Message(msg);
		    }
		    if state.closed {
			return Next::Closed;
		    }
		    return Next::Resync;
		}

		if let Some(msg) = state.queue.pop_front() {
		    return Next::Message(msg);
		}
		if state.closed {
		    return Next::Closed;
		}
	    }

	    notified.await;
	}
    }

    /*
     * Claims the owed resync. Returns false if there is none (it was
     * already claimed), in which case no snapshot must be sent.
     *
     * Callers hold the pipeline lock while claiming and building the
     * snapshot, so no delta older than the snapshot can follow it.
     */
    pub fn begin_resync(&self) -> bool {
	let mut state = self.state.lock();
	if !state.needs_resync {
	    return false;
	}
	state.queue.retain(HubMessage::is_error);
	state.needs_resync = false;
	true
    }

    /*
     * Discards queued deltas and owes the subscriber a resync, e.g. after
     * its filter changed.
     */
    pub fn request_resync(&self) {
	{
	    let mut state = self.state.lock();
	    state.queue.retain(HubMessage::is_error);
	    state.needs_resync = true;
	}
	self.notify.notify_one();
    }

    pub fn close(&self) {
	self.state.lock().closed = true;
	self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
	self.state.lock().closed
    }

    pub fn len(&self) -> usize {
	self.state.lock().queue.len()
    }

    pub fn overflows(&self) -> u64 {
	self.state.lock().overflows
    }
}

struct Subscriber {
    filter: SubscriptionFilter,
    scopes: BTreeSet<WatchScope>,
    outbound: Arc<Outbound>,
    last_seen: Instant,
}

/*
 * ClientHub fans messages of one cluster context out to its subscribers.
 */
pub struct ClientHub {
    capacity: usize,
    subscribers: RwLock<HashMap<String, Subscriber>>,
}

impl ClientHub {

    pub fn new(capacity: usize) -> Self {
	Self{
	    capacity: capacity,
	    subscribers: RwLock::new(HashMap::new()),
	}
    }

    /*
     * Registers a subscriber. An existing registration under the same id is
     * closed and its watch scopes are returned so the caller can release
     * them.
     */
    pub fn register(&self, id: &str, filter: SubscriptionFilter, scopes: BTreeSet<WatchScope>) -> (Arc<Outbound>, Option<BTreeSet<WatchScope>>) {
	let outbound = Arc::new(Outbound::new(self.capacity));
	let subscriber = Subscriber{
	    filter: filter,
	    scopes: scopes,
	    outbound: outbound.clone(),
	    last_seen: Instant::now(),
	};

	let replaced = self.subscribers.write().insert(id.to_string(), subscriber);
	let replaced = replaced.map(|old| {
	    log::info!("subscriber {} re-registered, closing its previous queue", id);
	    old.outbound.close();
	    old.scopes
	});

	(outbound, replaced)
    }

    /*
     * Swaps the filter (and derived scopes) of a subscriber and owes it a
     * resync. Returns the scopes it had before.
     */
    pub fn update_filter(&self, id: &str, filter: SubscriptionFilter, scopes: BTreeSet<WatchScope>) -> Option<BTreeSet<WatchScope>> {
	let mut subscribers = self.subscribers.write();
	let subscriber = subscribers.get_mut(id)?;

	subscriber.filter = filter;
	subscriber.last_seen = Instant::now();
	subscriber.outbound.request_resync();
	Some(std::mem::replace(&mut subscriber.scopes, scopes))
    }

    pub fn remove(&self, id: &str) -> Option<BTreeSet<WatchScope>> {
	let subscriber = self.subscribers.write().remove(id)?;
	subscriber.outbound.close();
	Some(subscriber.scopes)
    }

    /*
     * Like `remove()`, but only if `id` is still registered with this very
     * queue.
     */
    pub fn remove_if(&self, id: &str, outbound: &Arc<Outbound>) -> Option<BTreeSet<WatchScope>> {
	let mut subscribers = self.subscribers.write();
	match subscribers.get(id) {
	    Some(sub) if Arc::ptr_eq(&sub.outbound, outbound) => {},
	    _ => return None,
	}

	let subscriber = subscribers.remove(id)?;
	subscriber.outbound.close();
	Some(subscriber.scopes)
    }

    pub fn filter(&self, id: &str) -> Option<SubscriptionFilter> {
	self.subscribers.read().get(id).map(|sub| sub.filter.clone())
    }

    pub fn scopes(&self, id: &str) -> Option<BTreeSet<WatchScope>> {
	self.subscribers.read().get(id).map(|sub| sub.scopes.clone())
    }

    pub fn filters(&self) -> Vec<SubscriptionFilter> {
	self.subscribers.read().values().map(|sub| sub.filter.clone()).collect()
    }

    /*
     * Delivers a message about an object (or a view rooted at one) to
     * every subscriber whose filter admits it. Returns how many took it.
     */
    pub fn publish(&self, kind: &ResourceKind, namespace: &str, msg: &HubMessage) -> usize {
	self.fan_out(|sub| sub.filter.matches(kind, namespace), msg)
    }

    /*
     * Delivers a session message to every subscriber depending on the
     * scope.
     */
    pub fn publish_session(&self, scope: &WatchScope, msg: &HubMessage) -> usize {
	self.fan_out(|sub| sub.scopes.contains(scope), msg)
    }

    fn fan_out<F>(&self, admit: F, msg: &HubMessage) -> usize
    where
	F: Fn(&Subscriber) -> bool,
    {
	let subscribers = self.subscribers.read();
	let mut delivered = 0;

	for (id, sub) in subscribers.iter().filter(|(_, sub)| admit(sub)) {
	    match sub.outbound.push(msg.clone()) {
		Push::Queued => delivered += 1,
		Push::Overflowed => {
		    log::warn!("subscriber {} fell behind, dropping its queue and resyncing", id);
		},
		Push::Absorbed | Push::Closed => {},
	    }
	}

	delivered
    }

    pub fn touch(&self, id: &str) -> bool {
	match self.subscribers.write().get_mut(id) {
	    Some(sub) => {
		sub.last_seen = Instant::now();
		true
	    },
	    None => false,
	}
    }

    /*
     * Subscribers that have not been heard from within `timeout`.
     */
    pub fn expired(&self, timeout: Duration) -> Vec<String> {
	let now = Instant::now();
	self.subscribers.read().iter()
	    .filter(|(_, sub)| now.duration_since(sub.last_seen) > timeout)
	    .map(|(id, _)| id.clone())
	    .collect()
    }

    /*
     * Tells every subscriber why it is being dropped, closes its queue and
     * forgets it.
     */
    pub fn close_all(&self, scope: &Scope, report: &ErrorReport) -> Vec<(String, BTreeSet<WatchScope>)> {
	let msg = HubMessage::Error{
	    scope: scope.clone(),
	    payload: report.clone(),
	};

	self.subscribers.write().drain()
	    .map(|(id, sub)| {
		sub.outbound.push(msg.clone());
		sub.outbound.close();
		(id, sub.scopes)
	    })
	    .collect()
    }

    pub fn len(&self) -> usize {
	self.subscribers.read().len()
    }

    pub fn is_empty(&self) -> bool {
	self.len() == 0
    }
}
