/*
 * kviewd - relays live cluster state to UI sessions.
 *
 * Watch sessions keep a per-context cache current, the correlation index
 * joins cached objects into composite views, the classifier rolls their
 * conditions up into status labels and the hub fans the resulting deltas
 * out to subscribers over bounded queues.
 */

pub mod backoff;
pub mod cache;
pub mod config;
pub mod context;
pub mod correlation;
pub mod errors;
pub mod hub;
pub mod kube_upstream;
pub mod relay;
pub mod rollup;
pub mod stdio;
pub mod upstream;
pub mod watch;

pub use config::RelayConfig;
pub use context::{ClientSession, ClusterContext};
pub use errors::Error;
pub use relay::{ClientConnection, Relay};
pub use upstream::{EventStream, ListResult, Upstream, UpstreamFactory, WatchEvent, WatchScope};
