use std::time::Duration;

/// Bounded exponential backoff applied to consecutive long-poll failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Consecutive transport failures tolerated before the poll loop gives up.
    pub max_attempts: u32,
    /// Delay after the first failure; doubled on each further failure.
    pub initial_backoff: Duration,
    /// Upper bound for a single delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the `failures`-th consecutive failure (1-based).
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

/// Tunables for a gateway [`Session`](crate::session::Session).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// `maxev` sent with every long-poll.
    pub max_events: u32,
    /// Retry policy for long-poll transport failures.
    pub poll_retry: RetryPolicy,
    /// Timeout for ordinary POST requests.
    pub request_timeout: Duration,
    /// Timeout for a single long-poll; must exceed the gateway's hold time.
    pub poll_timeout: Duration,
    /// Unclaimed events kept per handle before the oldest is dropped.
    pub backlog_limit: usize,
    /// Capacity of the session notification channel.
    pub notice_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_events: 1,
            poll_retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(10),
            poll_timeout: Duration::from_secs(65),
            backlog_limit: 64,
            notice_capacity: 64,
        }
    }
}

impl SessionConfig {
    pub fn with_poll_retry(mut self, retry: RetryPolicy) -> Self {
        self.poll_retry = retry;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_backlog_limit(mut self, limit: usize) -> Self {
        self.backlog_limit = limit.max(1);
        self
    }
}
