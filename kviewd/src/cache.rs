use kview_api::{ObjectKey, ResourceKind, ResourceObject};

use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Op {
    Add,
    Modify,
    Delete,
}

/*
 * The outcome of applying one event, handed to correlation and fan-out.
 */
#[derive(Debug, Clone)]
pub enum Applied {
    Upserted {
	previous: Option<Arc<ResourceObject>>,
	current: Arc<ResourceObject>,
    },

    /* the entry is soft-deleted and waits for `evict()` */
    Deleted {
	previous: Arc<ResourceObject>,
    },

    /* DELETE for a key we never had */
    Unknown,
}

impl Applied {
    pub fn previous(&self) -> Option<&Arc<ResourceObject>> {
	match self {
	    Applied::Upserted { previous, .. } => previous.as_ref(),
	    Applied::Deleted { previous } => Some(previous),
	    Applied::Unknown => None,
	}
    }

    pub fn current(&self) -> Option<&Arc<ResourceObject>> {
	match self {
	    Applied::Upserted { current, .. } => Some(current),
	    _ => None,
	}
    }
}

/*
 * Latest known objects of one kind, keyed by (namespace, name).
 */
#[derive(Default)]
struct KindStore {
    entries: RwLock<BTreeMap<ObjectKey, Arc<ResourceObject>>>,
}

/*
 * ResourceCache holds the latest body of every watched object of one
 * cluster context.
 *
 * Readers get `Arc` snapshots of entries and never observe a half applied
 * event. Writes are serialized by the relay pipeline; the per-kind lock
 * only guards against concurrent readers.
 */
#[derive(Default)]
pub struct ResourceCache {
    kinds: RwLock<HashMap<ResourceKind, Arc<KindStore>>>,
}

impl ResourceCache {

    pub fn new() -> Self {
	Self::default()
    }

    fn store(&self, kind: &ResourceKind) -> Option<Arc<KindStore>> {
	self.kinds.read().get(kind).cloned()
    }

    fn store_or_insert(&self, kind: &ResourceKind) -> Arc<KindStore> {
	if let Some(store) = self.store(kind) {
	    return store;
	}
	self.kinds.write().entry(kind.clone()).or_default().clone()
    }

    /*
     * ADD and MODIFY overwrite-or-insert (a MODIFY for an unknown key is an
     * ADD). DELETE soft-deletes the entry: it disappears from reads at once
     * but stays in place until `evict()`, so dependents can be recomputed
     * against its last body.
     */
    pub fn apply(&self, op: Op, object: ResourceObject) -> Applied {
	let store = self.store_or_insert(&object.kind);
	let mut entries = store.entries.write();

	match op {
	    Op::Add | Op::Modify => {
		let mut object = object;
		object.deleted = false;

		let current = Arc::new(object);
		let previous = entries.insert(current.key.clone(), current.clone())
		    .filter(|prev| !prev.deleted);

		Applied::Upserted{
		    previous: previous,
		    current: current,
		}
	    },
	    Op::Delete => {
		let Some(entry) = entries.get_mut(&object.key) else {
		    return Applied::Unknown;
		};
		if entry.deleted {
		    return Applied::Unknown;
		}

		let previous = entry.clone();
		let mut tombstone = (*previous).clone();
		tombstone.deleted = true;
		*entry = Arc::new(tombstone);

		Applied::Deleted{
		    previous: previous,
		}
	    },
	}
    }

    /*
     * Drops a soft-deleted entry. A key that was re-added in the meantime
     * is left alone.
     */
    pub fn evict(&self, kind: &ResourceKind, key: &ObjectKey) -> bool {
	let Some(store) = self.store(kind) else {
	    return false;
	};

	let mut entries = store.entries.write();
	match entries.get(key) {
	    Some(entry) if entry.deleted => {
		entries.remove(key);
		true
	    },
	    _ => false,
	}
    }

    pub fn get(&self, kind: &ResourceKind, key: &ObjectKey) -> Option<Arc<ResourceObject>> {
	let store = self.store(kind)?;
	let entries = store.entries.read();
	entries.get(key).filter(|obj| !obj.deleted).cloned()
    }

    /*
     * All live objects of a kind, optionally limited to one namespace, in
     * key order.
     */
    pub fn list(&self, kind: &ResourceKind, namespace: Option<&str>) -> Vec<Arc<ResourceObject>> {
	let Some(store) = self.store(kind) else {
	    return vec![];
	};
	let entries = store.entries.read();

	match namespace {
	    Some(ns) => {
		let from = ObjectKey::new(ns, "");
		entries.range(from..)
		    .take_while(|(key, _)| key.namespace == ns)
		    .filter(|(_, obj)| !obj.deleted)
		    .map(|(_, obj)| obj.clone())
		    .collect()
	    },
	    None => entries.values().filter(|obj| !obj.deleted).cloned().collect(),
	}
    }

    pub fn keys(&self, kind: &ResourceKind, namespace: Option<&str>) -> BTreeSet<ObjectKey> {
	self.list(kind, namespace).iter().map(|obj| obj.key.clone()).collect()
    }

    pub fn len(&self, kind: &ResourceKind) -> usize {
	self.store(kind)
	    .map(|store| store.entries.read().values().filter(|obj| !obj.deleted).count())
	    .unwrap_or(0)
    }

    pub fn kinds(&self) -> Vec<ResourceKind> {
	self.kinds.read().keys().cloned().collect()
    }
}
