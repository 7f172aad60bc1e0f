use std::time::Duration;

/*
 * Tunables of the relay. Every field has a sensible default; the daemon
 * overrides them from its command line.
 */
#[derive(Debug, Clone)]
pub struct RelayConfig {

    /* first reconnect delay, and the delay after a healthy stream */
    pub backoff_floor: Duration,

    /* reconnect delays never grow past this */
    pub backoff_cap: Duration,

    /* a stream that stayed healthy this long resets the backoff to the floor */
    pub backoff_reset_after: Duration,

    /* +/- fraction applied to every delay, 0.0 disables jitter */
    pub backoff_jitter: f64,

    /* consecutive transient failures before the session gives up, None retries forever */
    pub max_retries: Option<u32>,

    /* server side timeout for a single watch request */
    pub watch_timeout_secs: u32,

    /* per subscription outbound queue length */
    pub queue_capacity: usize,

    /* subscriptions silent for longer than this are torn down, zero never tears down */
    pub heartbeat_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
	Self{
	    backoff_floor: Duration::from_secs(1),
	    backoff_cap: Duration::from_secs(30),
	    backoff_reset_after: Duration::from_secs(60),
	    backoff_jitter: 0.2,
	    max_retries: Some(10),
	    watch_timeout_secs: 290,
	    queue_capacity: 256,
	    heartbeat_timeout: Duration::from_secs(45),
	}
    }
}
