use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::ClientResult;

/// Exponential backoff for read paths. Sends never go through this.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1` (1-based): base, 2x base, 4x base...
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay * 2_u32.pow(attempt.saturating_sub(1))
    }

    /// Run `operation`, retrying transient failures only.
    pub async fn run<T, F, Fut>(&self, operation_name: &str, mut operation: F) -> ClientResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ClientResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        info!("{} succeeded after {} attempts", operation_name, attempt);
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    warn!(
                        "{} failed (attempt {}/{}): {}, retrying",
                        operation_name, attempt, self.max_attempts, e
                    );
                    tokio::time::sleep(self.delay(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use parley_types::error::MessagingError;

    use super::*;
    use crate::error::ClientError;

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn delays_double() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let calls = Cell::new(0);
        let result = fast()
            .run("list", || {
                calls.set(calls.get() + 1);
                let n = calls.get();
                async move {
                    if n < 3 {
                        Err(ClientError::from(MessagingError::Transient("busy".into())))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = Cell::new(0);
        let result: ClientResult<()> = fast()
            .run("list", || {
                calls.set(calls.get() + 1);
                async { Err(ClientError::from(MessagingError::Transient("busy".into()))) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn permanent_errors_fail_immediately() {
        let calls = Cell::new(0);
        let result: ClientResult<()> = fast()
            .run("list", || {
                calls.set(calls.get() + 1);
                async { Err(ClientError::NoConversation) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }
}
