use crate::config::RelayConfig;
use crate::context::{ClientSession, ClusterContext};
use crate::errors::Error;
use crate::upstream::UpstreamFactory;
use kview_api::{HubMessage, SubscriptionFilter};

use log;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/*
 * Relay owns one ClusterContext per kubeconfig context, created on first
 * use and kept until explicitly shut down.
 */
pub struct Relay {
    factory: Arc<dyn UpstreamFactory>,
    config: RelayConfig,
    contexts: Mutex<HashMap<String, Arc<ClusterContext>>>,
}

impl Relay {

    pub fn new(factory: Arc<dyn UpstreamFactory>, config: RelayConfig) -> Arc<Self> {
	Arc::new(Self{
	    factory: factory,
	    config: config,
	    contexts: Mutex::new(HashMap::new()),
	})
    }

    pub async fn context(&self, name: &str) -> Result<Arc<ClusterContext>, Error> {
	let mut contexts = self.contexts.lock().await;

	if let Some(context) = contexts.get(name) {
	    return Ok(context.clone());
	}

	let upstream = self.factory.connect(name).await?;
	let context = ClusterContext::new(name, upstream, self.config.clone());
	contexts.insert(name.to_string(), context.clone());

	log::info!("cluster context '{}' is up", name);
	Ok(context)
    }

    pub async fn connect(self: &Arc<Self>, session_id: &str, filter: SubscriptionFilter) -> Result<ClientConnection, Error> {
	let context = self.context(&filter.context).await?;
	let session = context.subscribe(session_id, filter);

	Ok(ClientConnection{
	    relay: self.clone(),
	    session: session,
	})
    }

    pub async fn contexts(&self) -> Vec<String> {
	let mut names: Vec<String> = self.contexts.lock().await.keys().cloned().collect();
	names.sort();
	names
    }

    /*
     * Tears a context down: its subscribers get a terminal error and every
     * watch stops. Returns false if it was not running.
     */
    pub async fn shutdown_context(&self, name: &str) -> bool {
	let context = self.contexts.lock().await.remove(name);
	match context {
	    Some(context) => {
		context.shutdown().await;
		true
	    },
	    None => false,
	}
    }

    pub async fn shutdown(&self) {
	let contexts: Vec<Arc<ClusterContext>> = self.contexts.lock().await
	    .drain()
	    .map(|(_, context)| context)
	    .collect();

	for context in contexts {
	    context.shutdown().await;
	}
    }
}

/*
 * A UI session attached to the relay. Unlike a ClientSession it can move
 * to another context when its filter names one.
 */
pub struct ClientConnection {
    relay: Arc<Relay>,
    session: ClientSession,
}

impl ClientConnection {

    pub fn id(&self) -> &str {
	self.session.id()
    }

    pub fn context(&self) -> &str {
	self.session.context().name()
    }

    pub async fn recv(&self) -> Option<HubMessage> {
	self.session.recv().await
    }

    pub fn heartbeat(&self) {
	self.session.heartbeat();
    }

    pub async fn update_filter(&mut self, filter: SubscriptionFilter) -> Result<(), Error> {
	if filter.context == self.context() {
	    self.session.update_filter(filter);
	    return Ok(());
	}

	log::info!("{} switches from context '{}' to '{}'", self.id(), self.context(), filter.context);
	let context = self.relay.context(&filter.context).await?;
	let id = self.id().to_string();

	// the old session unsubscribes when dropped
	self.session = context.subscribe(&id, filter);
	Ok(())
    }
}
