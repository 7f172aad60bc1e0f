use crate::resource::{ObjectRef, ResourceKind, ResourceObject};
use crate::status::StatusLabelSet;
use crate::view::CompositeView;
use serde::{Deserialize, Serialize};
use std::fmt;

/*
 * What a UI session wants to see: a set of kinds in a set of namespaces
 * (empty = every namespace) of one cluster context (empty = the current
 * kubeconfig context).
 */
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionFilter {
    #[serde(default)]
    pub context: String,

    #[serde(default)]
    pub kinds: Vec<ResourceKind>,

    #[serde(default)]
    pub namespaces: Vec<String>,
}

impl SubscriptionFilter {

    pub fn new(context: &str, kinds: Vec<ResourceKind>, namespaces: Vec<String>) -> Self {
	Self{
	    context: context.to_string(),
	    kinds: kinds,
	    namespaces: namespaces,
	}
    }

    pub fn includes_namespace(&self, namespace: &str) -> bool {
	// cluster scoped objects are not filtered by namespace
	namespace.is_empty() || self.namespaces.is_empty() || self.namespaces.iter().any(|ns| ns == namespace)
    }

    pub fn matches(&self, kind: &ResourceKind, namespace: &str) -> bool {
	self.kinds.contains(kind) && self.includes_namespace(namespace)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Connecting,
    Streaming,
    Reconnecting,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
	let state = match self {
	    SessionState::Idle => "idle",
	    SessionState::Connecting => "connecting",
	    SessionState::Streaming => "streaming",
	    SessionState::Reconnecting => "reconnecting",
	    SessionState::Closed => "closed",
	};
	write!(f, "{}", state)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    pub context: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ResourceKind>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl Scope {
    pub fn context(context: &str) -> Self {
	Self{
	    context: context.to_string(),
	    kind: None,
	    namespace: None,
	}
    }

    pub fn object(context: &str, kind: &ResourceKind, namespace: &str) -> Self {
	Self{
	    context: context.to_string(),
	    kind: Some(kind.clone()),
	    namespace: optional_namespace(namespace),
	}
    }
}

fn optional_namespace(namespace: &str) -> Option<String> {
    if namespace.is_empty() {
	None
    } else {
	Some(namespace.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectState {
    pub object: ResourceObject,
    pub labels: StatusLabelSet,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Delta {
    Upsert {
	object: ResourceObject,
	labels: StatusLabelSet,
    },
    Delete {
	object: ObjectRef,
    },
    View {
	view: CompositeView,
    },
    ViewRemoved {
	root: ObjectRef,
    },
    Session {
	state: SessionState,
	retries: u32,
    },
}

/*
 * The full current state for a subscription's filter; it replaces whatever
 * the client rendered before.
 */
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub objects: Vec<ObjectState>,
    pub views: Vec<CompositeView>,

    /* state of the watch sessions behind the objects */
    #[serde(default)]
    pub sessions: Vec<SessionReport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionReport {
    pub scope: Scope,
    pub state: SessionState,
    pub retries: u32,

    /* why the session gave up, kept until it streams again */
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub message: String,

    /* terminal errors are not retried by the relay */
    pub terminal: bool,
}

/*
 * Messages sent to a UI session:
 *
 *   {"kind": "delta",  "scope": {...}, "payload": {"type": "upsert", ...}}
 *   {"kind": "resync", "scope": {...}, "payload": {"objects": [...], "views": [...], "sessions": [...]}}
 *   {"kind": "error",  "scope": {...}, "payload": {"message": "...", "terminal": true}}
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum HubMessage {
    Delta {
	scope: Scope,
	payload: Delta,
    },
    Resync {
	scope: Scope,
	payload: Snapshot,
    },
    Error {
	scope: Scope,
	payload: ErrorReport,
    },
}

impl HubMessage {

    pub fn scope(&self) -> &Scope {
	match self {
	    HubMessage::Delta { scope, .. } => scope,
	    HubMessage::Resync { scope, .. } => scope,
	    HubMessage::Error { scope, .. } => scope,
	}
    }

    pub fn is_delta(&self) -> bool {
	matches!(self, HubMessage::Delta { .. })
    }

    pub fn is_resync(&self) -> bool {
	matches!(self, HubMessage::Resync { .. })
    }

    pub fn is_error(&self) -> bool {
	matches!(self, HubMessage::Error { .. })
    }
}

/*
 * Requests received from a UI session.
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientRequest {
    Filter(SubscriptionFilter),
    Heartbeat,
}
