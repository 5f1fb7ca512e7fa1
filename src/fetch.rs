//! One remote page retrieval: timeout, error classification, and bounded
//! backoff when the remote signals throttling.

use std::fmt;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use tokio::time::sleep;
use tracing::debug;

/// Bounded exponential backoff: `base_delay * multiplier^attempt`.
///
/// An explicit value rather than an ad hoc loop so callers can share one
/// ladder and tests can pin the delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, multiplier: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            multiplier,
        }
    }

    /// Delay to sleep after the given zero-based attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay * self.multiplier.saturating_pow(attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1), 2)
    }
}

/// Why a fetch failed.
#[derive(Debug)]
pub enum FetchError {
    /// Remote says the resource is absent. Recorded, not escalated.
    NotFound,
    /// Remote throttled us and the retry budget ran out.
    RateLimited { attempts: u32 },
    /// The request exceeded its deadline.
    Timeout,
    /// Connection, DNS, or TLS failure.
    Transport(reqwest::Error),
    /// Remote 5xx.
    ServerError(StatusCode),
}

impl FetchError {
    /// Stable label persisted into the failure log.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::RateLimited { .. } => "rate_limited",
            Self::Timeout => "timeout",
            Self::Transport(_) => "transport_error",
            Self::ServerError(_) => "server_error",
        }
    }

    /// Whether the caller should retry the whole fetch after a delay.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Transport(_) | Self::ServerError(_)
        )
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "resource not found"),
            Self::RateLimited { attempts } => {
                write!(f, "rate limited after {attempts} attempts")
            }
            Self::Timeout => write!(f, "request timed out"),
            Self::Transport(err) => write!(f, "transport error: {err}"),
            Self::ServerError(status) => write!(f, "server error: {status}"),
        }
    }
}

impl std::error::Error for FetchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(err) => Some(err),
            _ => None,
        }
    }
}

const USER_AGENT: &str = "aiaaic-harvest/0.3 (+https://github.com/aaronlifton/aiaaic-harvest)";

/// Stateless page fetcher. One instance is shared across the whole run; the
/// underlying client pools connections.
#[derive(Clone)]
pub struct FetchExecutor {
    client: Client,
    policy: RetryPolicy,
}

impl FetchExecutor {
    pub fn new(timeout: Duration, policy: RetryPolicy) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(timeout)
            .build()?;
        Ok(Self { client, policy })
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Fetches one page. Throttling responses are retried here under the
    /// policy; every other failure kind surfaces immediately for the caller
    /// to decide.
    pub async fn fetch(&self, address: &str) -> Result<String, FetchError> {
        let mut attempt = 0u32;
        loop {
            match self.fetch_once(address).await {
                Err(FetchError::RateLimited { .. }) if attempt + 1 < self.policy.max_attempts => {
                    let delay = self.policy.delay(attempt);
                    debug!(address, attempt, ?delay, "rate limited, backing off");
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(FetchError::RateLimited { .. }) => {
                    return Err(FetchError::RateLimited {
                        attempts: attempt + 1,
                    });
                }
                other => return other,
            }
        }
    }

    async fn fetch_once(&self, address: &str) -> Result<String, FetchError> {
        let response = self
            .client
            .get(address)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(FetchError::NotFound),
            StatusCode::TOO_MANY_REQUESTS => Err(FetchError::RateLimited { attempts: 1 }),
            status if status.is_server_error() => Err(FetchError::ServerError(status)),
            _ => response.text().await.map_err(classify_reqwest_error),
        }
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Transport(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_delays_grow_exponentially() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(2), Duration::from_secs(4));
    }

    #[test]
    fn policy_never_allows_zero_attempts() {
        let policy = RetryPolicy::new(0, Duration::from_millis(10), 2);
        assert_eq!(policy.max_attempts, 1);
    }

    #[test]
    fn error_kinds_are_stable_labels() {
        assert_eq!(FetchError::NotFound.kind(), "not_found");
        assert_eq!(FetchError::Timeout.kind(), "timeout");
        assert_eq!(
            FetchError::ServerError(StatusCode::BAD_GATEWAY).kind(),
            "server_error"
        );
        assert_eq!(FetchError::RateLimited { attempts: 3 }.kind(), "rate_limited");
    }

    #[test]
    fn only_transient_kinds_are_retryable() {
        assert!(FetchError::Timeout.is_retryable());
        assert!(FetchError::ServerError(StatusCode::INTERNAL_SERVER_ERROR).is_retryable());
        assert!(!FetchError::NotFound.is_retryable());
        assert!(!FetchError::RateLimited { attempts: 3 }.is_retryable());
    }
}
