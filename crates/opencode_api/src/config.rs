use std::collections::BTreeMap;
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Transport configuration for opencode server requests.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Server base URL; normalized by [`crate::normalize_base_url`].
    pub base_url: String,
    /// Optional `User-Agent` override.
    pub user_agent: Option<String>,
    /// Additional headers merged into request headers.
    pub extra_headers: BTreeMap<String, String>,
    /// Timeout for one-shot requests. The event stream is never timed out.
    pub timeout: Option<Duration>,
    /// Backoff for one-shot requests.
    pub retry: RetryPolicy,
}

impl ApiConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            user_agent: None,
            extra_headers: BTreeMap::new(),
            timeout: Some(Duration::from_secs(30)),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn without_timeout(mut self) -> Self {
        self.timeout = None;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn insert_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.insert(key.into(), value.into());
        self
    }
}
