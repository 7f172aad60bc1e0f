use crate::errors::Error;
use kview_api::{ResourceKind, ResourceObject};

use async_trait::async_trait;
use futures::Stream;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

/*
 * A watchable slice of one cluster: a kind, in one namespace or in all of
 * them. There is at most one live upstream stream per scope.
 */
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchScope {
    pub context: String,
    pub kind: ResourceKind,
    pub namespace: Option<String>,
}

impl WatchScope {

    pub fn new(context: &str, kind: ResourceKind, namespace: Option<&str>) -> Self {
	Self{
	    context: context.to_string(),
	    kind: kind,
	    namespace: namespace.map(String::from),
	}
    }

    /*
     * Whether an object living in `namespace` is visible through this scope.
     */
    pub fn covers(&self, namespace: &str) -> bool {
	match &self.namespace {
	    Some(ns) => ns == namespace,
	    None => true,
	}
    }
}

impl fmt::Display for WatchScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
	let context = if self.context.is_empty() { "<current>" } else { self.context.as_str() };
	match &self.namespace {
	    Some(ns) => write!(f, "{}:{}@{}", context, self.kind, ns),
	    None => write!(f, "{}:{}@*", context, self.kind),
	}
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Added(ResourceObject),
    Modified(ResourceObject),
    Deleted(ResourceObject),

    /* progress notification, carries only a new resumption cursor */
    Bookmark(String),
}

#[derive(Debug, Clone, Default)]
pub struct ListResult {
    pub objects: Vec<ResourceObject>,
    pub resource_version: String,
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<WatchEvent, Error>> + Send>>;

/*
 * The cluster API as far as the relay is concerned: a consistent list of a
 * scope, and a watch resuming from the cursor returned by that list (or by
 * a later event).
 *
 * A watch that can no longer resume must fail with `Error::Expired` (either
 * from `watch()` itself or as an item of the stream).
 */
#[async_trait]
pub trait Upstream: Send + Sync + 'static {
    async fn list(&self, scope: &WatchScope) -> Result<ListResult, Error>;

    async fn watch(&self, scope: &WatchScope, resource_version: &str) -> Result<EventStream, Error>;
}

/*
 * Resolves a cluster context name to a connected upstream.
 */
#[async_trait]
pub trait UpstreamFactory: Send + Sync + 'static {
    async fn connect(&self, context: &str) -> Result<Arc<dyn Upstream>, Error>;
}
