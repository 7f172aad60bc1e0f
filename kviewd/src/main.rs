use kviewd::kube_upstream::KubeUpstreamFactory;
use kviewd::{stdio, Error, Relay, RelayConfig};
use kview_api::{ResourceKind, SubscriptionFilter};

use clap::Parser;
use log;
use std::sync::Arc;
use std::time::Duration;

/*
 * Streams the live state of a cluster context as JSON lines on stdout.
 * Requests (filter changes, heartbeats) are read from stdin.
 */
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {

    /// kubeconfig context to start with, empty for the current one
    #[arg(long, default_value = "")]
    context: String,

    /// kind to subscribe to, as `group/version/Kind` (or `v1/Kind`); repeatable
    #[arg(long = "kind")]
    kinds: Vec<ResourceKind>,

    /// namespace to subscribe to, repeatable; none means all
    #[arg(long = "namespace")]
    namespaces: Vec<String>,

    /// subscriber id used in logs
    #[arg(long, default_value = "stdio")]
    session_id: String,

    /// messages queued per subscriber before it is resynced
    #[arg(long, default_value_t = 256)]
    queue_capacity: usize,

    /// first reconnect delay
    #[arg(long, default_value_t = 1)]
    backoff_floor_secs: u64,

    /// longest reconnect delay
    #[arg(long, default_value_t = 30)]
    backoff_cap_secs: u64,

    /// consecutive failures before a watch gives up, 0 retries forever
    #[arg(long, default_value_t = 10)]
    max_retries: u32,

    /// server side timeout of a single watch request
    #[arg(long, default_value_t = 290)]
    watch_timeout_secs: u32,

    /// silence after which a subscriber is dropped, 0 disables it
    #[arg(long, default_value_t = 45)]
    heartbeat_timeout_secs: u64,
}

impl Args {
    fn relay_config(&self) -> RelayConfig {
	RelayConfig{
	    backoff_floor: Duration::from_secs(self.backoff_floor_secs),
	    backoff_cap: Duration::from_secs(self.backoff_cap_secs),
	    max_retries: if self.max_retries == 0 { None } else { Some(self.max_retries) },
	    watch_timeout_secs: self.watch_timeout_secs,
	    queue_capacity: self.queue_capacity,
	    heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout_secs),
	    ..RelayConfig::default()
	}
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::init();

    let args = Args::parse();
    let config = args.relay_config();

    let factory = KubeUpstreamFactory::new(config.watch_timeout_secs);
    let relay = Relay::new(Arc::new(factory), config);

    let filter = SubscriptionFilter::new(&args.context, args.kinds.clone(), args.namespaces.clone());
    log::info!("starting kviewd session {} on context '{}'", args.session_id, args.context);
    let mut conn = relay.connect(&args.session_id, filter).await?;

    let result = tokio::select! {
	result = stdio::serve(&mut conn, tokio::io::stdin(), tokio::io::stdout()) => result,

	// handle CTRL^C as gracefully as we can.
	_ = tokio::signal::ctrl_c() => Ok(()),
    };

    if let Err(err) = &result {
	log::error!("session ended: {}", err);
    }

    drop(conn);
    relay.shutdown().await;

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn every_flag_has_help() {
	let cmd = Args::command();
	for arg in cmd.get_arguments() {
	    if matches!(arg.get_id().as_str(), "help" | "version") {
		continue;
	    }
	    assert!(arg.get_help().is_some(), "--{} has no help text", arg.get_id());
	}
    }

    #[test]
    fn zero_retries_means_forever() {
	let args = Args::parse_from(["kviewd", "--kind", "v1/Pod", "--max-retries", "0"]);
	assert_eq!(args.kinds, vec![ResourceKind::pod()]);
	assert_eq!(args.relay_config().max_retries, None);
    }
}
