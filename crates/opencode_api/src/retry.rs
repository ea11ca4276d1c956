use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

/// Backoff for the one-shot endpoints. The event stream is never retried;
/// reconnecting it is the subscriber's decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first request.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(4),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no backoff.
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// Delay before retry number `attempt + 1`: doubles each time, capped.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.min(16)))
            .min(self.max_delay)
    }
}

fn transient_error_regex() -> &'static Regex {
    static CACHED: OnceLock<Regex> = OnceLock::new();
    CACHED.get_or_init(|| {
        Regex::new(r"(?i)overloaded|temporarily.?unavailable|bad.?gateway|econnreset|connection.?(refused|reset)|timed?.?out")
            .expect("transient error regex must compile")
    })
}

/// Whether a non-success response is worth another attempt: gateway and
/// throttling statuses, or a body that reads like a transient server fault.
pub fn is_transient_status(status: u16, body: &str) -> bool {
    matches!(status, 408 | 429 | 502 | 503 | 504) || transient_error_regex().is_match(body)
}
