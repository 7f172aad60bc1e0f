use crate::config::RelayConfig;

use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;

/*
 * Exponential reconnect backoff with jitter.
 *
 * Delays double from `floor` up to `cap`. Once a stream has been healthy
 * for `reset_after`, the next disconnect starts over from the floor.
 */
#[derive(Debug, Clone)]
pub struct Backoff {
    floor: Duration,
    cap: Duration,
    reset_after: Duration,
    jitter: f64,

    current: Duration,
    healthy_since: Option<Instant>,
}

impl Backoff {

    pub fn new(floor: Duration, cap: Duration, reset_after: Duration, jitter: f64) -> Self {
	let floor = floor.min(cap);
	Self{
	    floor: floor,
	    cap: cap,
	    reset_after: reset_after,
	    jitter: jitter.clamp(0.0, 1.0),
	    current: floor,
	    healthy_since: None,
	}
    }

    pub fn from_config(config: &RelayConfig) -> Self {
	Self::new(config.backoff_floor, config.backoff_cap, config.backoff_reset_after, config.backoff_jitter)
    }

    /*
     * The stream is up and delivering.
     */
    pub fn mark_healthy(&mut self) {
	self.healthy_since = Some(Instant::now());
    }

    /*
     * The delay to wait before the next connection attempt.
     */
    pub fn next_delay(&mut self) -> Duration {
	if let Some(since) = self.healthy_since.take() {
	    if since.elapsed() >= self.reset_after {
		self.current = self.floor;
	    }
	}

	let base = self.current;
	self.current = self.current.saturating_mul(2).min(self.cap);

	apply_jitter(base, self.jitter).min(self.cap)
    }

    pub fn reset(&mut self) {
	self.current = self.floor;
	self.healthy_since = None;
    }
}

fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
	return delay;
    }

    let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
    delay.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
	Duration::from_secs(n)
    }

    #[test]
    fn doubles_up_to_the_cap() {
	let mut backoff = Backoff::new(secs(1), secs(30), secs(60), 0.0);

	let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_secs()).collect();
	assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn jitter_stays_within_bounds() {
	let mut backoff = Backoff::new(secs(10), secs(10), secs(60), 0.2);

	for _ in 0..100 {
	    let delay = backoff.next_delay();
	    assert!(delay >= Duration::from_secs(8), "{:?} too short", delay);
	    assert!(delay <= secs(10), "{:?} exceeds cap", delay);
	}
    }

    #[tokio::test(start_paused = true)]
    async fn resets_after_a_healthy_stream() {
	let mut backoff = Backoff::new(secs(1), secs(30), secs(60), 0.0);
	for _ in 0..4 {
	    backoff.next_delay();
	}

	// a short lived stream does not reset
	backoff.mark_healthy();
	tokio::time::advance(secs(5)).await;
	assert_eq!(backoff.next_delay(), secs(16));

	backoff.mark_healthy();
	tokio::time::advance(secs(61)).await;
	assert_eq!(backoff.next_delay(), secs(1));
	assert_eq!(backoff.next_delay(), secs(2));
    }
}
