//! Per operation-code call spacing.
//!
//! Each operation code gets its own lane. A lane is a fair (FIFO) async mutex
//! around the time of the last granted call: a caller queues on the mutex,
//! sleeps off whatever remains of the code's minimum interval, stamps the
//! grant time and lets the next caller in.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use super::config::GatewayConfig;

#[derive(Debug, Default)]
struct Lane {
    last_call_at: Option<Instant>,
}

/// Enforces a minimum interval between consecutive calls of the same
/// operation code.
///
/// Grants for one code are strictly FIFO and at least the code's interval
/// apart; different codes never wait on each other.
///
/// # Scope
///
/// The limiter is process-local. Every replica of the surrounding service
/// spaces its own calls, so N replicas can reach the brokerage up to N times
/// as often as the configured interval suggests. This is a known limitation:
/// the brokerage's own limits are expected to absorb it, and coordinating the
/// limiter through the credential store would change the latency profile of
/// every call.
///
/// # Example
///
/// ```rust
/// use market_gateway::RateLimiter;
/// use std::time::Duration;
///
/// # async fn example() {
/// let limiter = RateLimiter::new(Duration::from_secs(1))
///     .with_interval("t8412", Duration::from_millis(500));
///
/// limiter.acquire_slot("t8412").await; // immediate
/// limiter.acquire_slot("t8412").await; // ~500ms later
/// limiter.acquire_slot("t1102").await; // immediate, different lane
/// # }
/// ```
#[derive(Debug)]
pub struct RateLimiter {
    default_interval: Duration,
    intervals: HashMap<String, Duration>,
    lanes: Mutex<HashMap<String, Arc<tokio::sync::Mutex<Lane>>>>,
}

impl RateLimiter {
    /// Creates a limiter applying `default_interval` to every code.
    pub fn new(default_interval: Duration) -> Self {
        Self {
            default_interval,
            intervals: HashMap::new(),
            lanes: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a limiter from the gateway configuration's interval table.
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            default_interval: config.default_min_interval,
            intervals: config.min_intervals.clone(),
            lanes: Mutex::new(HashMap::new()),
        }
    }

    /// Overrides the interval for one code.
    pub fn with_interval(mut self, code: impl Into<String>, interval: Duration) -> Self {
        self.intervals.insert(code.into(), interval);
        self
    }

    /// The minimum interval applied to `code`.
    pub fn interval_for(&self, code: &str) -> Duration {
        self.intervals
            .get(code)
            .copied()
            .unwrap_or(self.default_interval)
    }

    /// Number of codes that have been seen so far.
    pub fn tracked_codes(&self) -> usize {
        self.lock_lanes().len()
    }

    /// Lock the lane map, recovering from poison.
    ///
    /// The map only ever gains entries, so a poisoned guard still holds a
    /// consistent map.
    fn lock_lanes(&self) -> MutexGuard<'_, HashMap<String, Arc<tokio::sync::Mutex<Lane>>>> {
        self.lanes.lock().unwrap_or_else(|poisoned| {
            warn!("Rate limiter lane map mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn lane(&self, code: &str) -> Arc<tokio::sync::Mutex<Lane>> {
        let mut lanes = self.lock_lanes();
        Arc::clone(lanes.entry(code.to_string()).or_default())
    }

    /// Waits until a call with operation code `code` may start.
    ///
    /// Returns how long this caller slept once it reached the head of the
    /// queue (time spent queued behind earlier callers is not included).
    pub async fn acquire_slot(&self, code: &str) -> Duration {
        let interval = self.interval_for(code);
        let lane = self.lane(code);
        let mut lane = lane.lock().await;

        let wait = match lane.last_call_at {
            Some(last) => interval.saturating_sub(last.elapsed()),
            None => Duration::ZERO,
        };

        if !wait.is_zero() {
            debug!(code, wait_ms = wait.as_millis() as u64, "Rate limiter: waiting for slot");
            tokio::time::sleep(wait).await;
        }

        lane.last_call_at = Some(Instant::now());
        wait
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_sequential_grants_are_spaced() {
        let interval = Duration::from_millis(1000);
        let limiter = RateLimiter::new(Duration::from_millis(10)).with_interval("t1102", interval);

        let mut grants = Vec::new();
        for _ in 0..5 {
            limiter.acquire_slot("t1102").await;
            grants.push(Instant::now());
        }

        for pair in grants.windows(2) {
            assert!(pair[1] - pair[0] >= interval);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_call_is_immediate() {
        let limiter = RateLimiter::new(Duration::from_secs(5));
        let start = Instant::now();
        let waited = limiter.acquire_slot("t8412").await;
        assert_eq!(waited, Duration::ZERO);
        assert_eq!(Instant::now(), start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_time_is_credited() {
        let limiter = RateLimiter::new(Duration::from_millis(1000));
        limiter.acquire_slot("t1102").await;

        tokio::time::advance(Duration::from_millis(700)).await;
        let waited = limiter.acquire_slot("t1102").await;
        assert_eq!(waited, Duration::from_millis(300));

        tokio::time::advance(Duration::from_millis(5000)).await;
        assert_eq!(limiter.acquire_slot("t1102").await, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_are_fifo_and_spaced() {
        let interval = Duration::from_millis(500);
        let limiter = Arc::new(RateLimiter::new(interval));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let mut handles = Vec::new();
        for i in 0..4 {
            let limiter = Arc::clone(&limiter);
            let tx = tx.clone();
            handles.push(tokio::spawn(async move {
                limiter.acquire_slot("t8412").await;
                tx.send((i, Instant::now())).unwrap();
            }));
            // Let each task enqueue before spawning the next
            tokio::task::yield_now().await;
        }
        drop(tx);
        for handle in handles {
            handle.await.unwrap();
        }

        let mut grants = Vec::new();
        while let Some(grant) = rx.recv().await {
            grants.push(grant);
        }
        let order: Vec<_> = grants.iter().map(|(i, _)| *i).collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
        for pair in grants.windows(2) {
            assert!(pair[1].1 - pair[0].1 >= interval);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_codes_do_not_block_each_other() {
        let limiter = Arc::new(RateLimiter::new(Duration::from_secs(10)));
        limiter.acquire_slot("slow").await;

        // Second call on "slow" sleeps for ten seconds
        let blocked = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move { limiter.acquire_slot("slow").await })
        };
        tokio::task::yield_now().await;

        let start = Instant::now();
        limiter.acquire_slot("fast").await;
        assert_eq!(Instant::now(), start);
        assert!(!blocked.is_finished());

        assert_eq!(blocked.await.unwrap(), Duration::from_secs(10));
        assert_eq!(limiter.tracked_codes(), 2);
    }

    #[test]
    fn test_from_config() {
        let config = GatewayConfig::from(super::super::config::ConfigPreset::Production)
            .with_min_interval("t8412", Duration::from_millis(250));
        let limiter = RateLimiter::from_config(&config);
        assert_eq!(limiter.interval_for("t8412"), Duration::from_millis(250));
        assert_eq!(limiter.interval_for("t1102"), Duration::from_secs(1));
    }
}
