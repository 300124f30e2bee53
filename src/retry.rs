//! Retry orchestration with exponential backoff.
//!
//! [`RetryPolicy::execute`] runs one logical operation: invoke, classify the
//! failure, decide whether to retry, wait, repeat. Every invocation owns a
//! fresh [`RetryContext`]; no retry state is shared across concurrent calls.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::classify::classify;
use crate::error::{AgentError, ErrorCategory, OperationError};
use crate::transport::TransportError;

/// Configuration for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyOptions {
    /// Maximum number of retry attempts, not including the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each subsequent retry.
    pub initial_delay: Duration,
    /// Upper bound for the computed backoff delay.
    pub max_delay: Duration,
    /// Randomizes each delay to avoid synchronized retry storms.
    pub use_jitter: bool,
    /// Caps retries attributable specifically to server errors, even when
    /// `max_retries` would allow more.
    pub max_server_error_retries: u32,
}

impl RetryPolicyOptions {
    /// Total invocation budget: the first attempt plus `max_retries`.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

impl Default for RetryPolicyOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(32),
            use_jitter: true,
            max_server_error_retries: 2,
        }
    }
}

/// Per-operation record of attempts made and errors seen.
///
/// Created at the start of an [`RetryPolicy::execute`] call and dropped when
/// the call finishes; owned exclusively by that call.
#[derive(Debug)]
pub struct RetryContext {
    attempt_count: u32,
    server_error_count: u32,
    errors: Vec<AgentError>,
    max_attempts: u32,
}

impl RetryContext {
    /// Creates an empty context for one logical operation.
    pub fn new(options: &RetryPolicyOptions) -> Self {
        Self {
            attempt_count: 0,
            server_error_count: 0,
            errors: Vec::new(),
            max_attempts: options.max_attempts(),
        }
    }

    /// Records one failed attempt.
    pub fn record_attempt(&mut self, error: AgentError) {
        self.attempt_count += 1;
        if error.category == ErrorCategory::ServerError {
            self.server_error_count += 1;
        }
        self.errors.push(error);
    }

    /// Number of attempts recorded so far.
    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Number of recorded attempts that failed with a server error.
    pub fn server_error_count(&self) -> u32 {
        self.server_error_count
    }

    /// Total invocation budget for this operation.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Errors seen so far, in attempt order.
    pub fn errors(&self) -> &[AgentError] {
        &self.errors
    }

    /// The most recently recorded error.
    pub fn last_error(&self) -> Option<&AgentError> {
        self.errors.last()
    }
}

/// Orchestrates one logical operation with retry and backoff.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    options: RetryPolicyOptions,
}

impl RetryPolicy {
    /// Creates a policy from the given options.
    pub fn new(options: RetryPolicyOptions) -> Self {
        Self { options }
    }

    /// The options this policy was built from.
    pub fn options(&self) -> &RetryPolicyOptions {
        &self.options
    }

    /// Runs `operation` until it succeeds, exhausts its retry budget, or is
    /// cancelled.
    ///
    /// A cancellation that is already active when this is called fails
    /// immediately with zero invocations. Cancellation observed during a
    /// backoff wait, or classified from the operation's own failure,
    /// propagates as [`OperationError::Cancelled`] and is never wrapped in
    /// [`OperationError::Failed`].
    pub async fn execute<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T, OperationError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        if cancel.is_cancelled() {
            return Err(OperationError::Cancelled);
        }

        let mut context = RetryContext::new(&self.options);
        loop {
            match operation().await {
                Ok(value) => {
                    if context.attempt_count() > 0 {
                        log::info!(
                            "✅ Operation succeeded on attempt {}/{}",
                            context.attempt_count() + 1,
                            context.max_attempts()
                        );
                    }
                    return Ok(value);
                }
                Err(raw) => {
                    let error = classify(&raw, cancel);
                    if error.category == ErrorCategory::Cancelled {
                        return Err(OperationError::Cancelled);
                    }
                    context.record_attempt(error.clone());

                    if !self.should_retry(&error, &context) {
                        log::error!(
                            "❌ Operation failed after {} attempt(s): {}",
                            context.attempt_count(),
                            error
                        );
                        return Err(OperationError::Failed {
                            error,
                            attempts: context.attempt_count(),
                        });
                    }

                    let delay = self.calculate_delay(&error, &context);
                    log::warn!(
                        "⚠️ Attempt {}/{} failed: {}. Retrying in {:?}...",
                        context.attempt_count(),
                        context.max_attempts(),
                        error,
                        delay
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(OperationError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    if cancel.is_cancelled() {
                        return Err(OperationError::Cancelled);
                    }
                }
            }
        }
    }

    /// Whether another attempt should be made after `error`.
    ///
    /// The server-error cap counts retries, not attempts: the initial
    /// attempt does not consume the server-error budget, so a transport
    /// that always fails with a server error makes
    /// `1 + max_server_error_retries` invocations in total.
    pub fn should_retry(&self, error: &AgentError, context: &RetryContext) -> bool {
        if !error.is_retryable {
            return false;
        }
        if context.attempt_count() >= context.max_attempts() {
            return false;
        }
        if error.category == ErrorCategory::ServerError
            && context.server_error_count() > self.options.max_server_error_retries
        {
            return false;
        }
        true
    }

    /// Delay before the next attempt.
    ///
    /// A server-dictated `retry_after` wins verbatim over the backoff
    /// computation. Otherwise the delay for the zero-based retry index `i`
    /// is `min(initial_delay * 2^i, max_delay)`, optionally spread by a
    /// uniform jitter factor in `[0.5, 1.5)`.
    pub fn calculate_delay(&self, error: &AgentError, context: &RetryContext) -> Duration {
        if let Some(delay) = error.retry_after {
            return delay;
        }

        let retry_index = context.attempt_count().saturating_sub(1);
        let multiplier = 2u64.saturating_pow(retry_index);
        let backoff = self
            .options
            .initial_delay
            .checked_mul(multiplier.min(u64::from(u32::MAX)) as u32)
            .unwrap_or(self.options.max_delay);
        let mut delay = backoff.min(self.options.max_delay);

        if self.options.use_jitter {
            use rand::Rng;
            let factor = rand::thread_rng().gen_range(0.5..1.5);
            delay = delay.mul_f64(factor);
        }
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_options(max_retries: u32) -> RetryPolicyOptions {
        RetryPolicyOptions {
            max_retries,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(40),
            use_jitter: false,
            max_server_error_retries: 10,
        }
    }

    fn network_failure() -> TransportError {
        TransportError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ))
    }

    fn server_failure() -> TransportError {
        TransportError::HttpStatus {
            status: 500,
            body: "internal".to_string(),
            retry_after: None,
        }
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let policy = RetryPolicy::new(fast_options(3));
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result = policy
            .execute(&cancel, move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, TransportError>("success".to_string())
                }
            })
            .await;

        assert_eq!(result.unwrap(), "success");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_success_after_retries() {
        let policy = RetryPolicy::new(fast_options(3));
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result = policy
            .execute(&cancel, move || {
                let calls = calls_clone.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(network_failure())
                    } else {
                        Ok("success".to_string())
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "success");
        assert_eq!(calls.load(Ordering::SeqCst), 3, "1 initial + 2 retries");
    }

    #[tokio::test]
    async fn test_retryable_error_makes_at_most_n_plus_one_attempts() {
        let policy = RetryPolicy::new(fast_options(2));
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result: Result<String, _> = policy
            .execute(&cancel, move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(network_failure())
                }
            })
            .await;

        match result {
            Err(OperationError::Failed { error, attempts }) => {
                assert_eq!(attempts, 3, "1 initial + 2 retries");
                assert_eq!(error.category, ErrorCategory::Network);
            }
            other => panic!("Expected Failed, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_makes_exactly_one_attempt() {
        let policy = RetryPolicy::new(fast_options(5));
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result: Result<String, _> = policy
            .execute(&cancel, move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(TransportError::HttpStatus {
                        status: 401,
                        body: "bad key".to_string(),
                        retry_after: None,
                    })
                }
            })
            .await;

        match result {
            Err(OperationError::Failed { error, attempts }) => {
                assert_eq!(attempts, 1);
                assert_eq!(error.category, ErrorCategory::Authentication);
            }
            other => panic!("Expected Failed, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_server_error_cap_overrides_max_retries() {
        let options = RetryPolicyOptions {
            max_server_error_retries: 1,
            ..fast_options(5)
        };
        let policy = RetryPolicy::new(options);
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result: Result<String, _> = policy
            .execute(&cancel, move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(server_failure())
                }
            })
            .await;

        match result {
            Err(OperationError::Failed { attempts, .. }) => {
                assert_eq!(attempts, 2, "1 initial + 1 server-error retry");
            }
            other => panic!("Expected Failed, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_pre_cancelled_execute_makes_zero_attempts() {
        let policy = RetryPolicy::new(fast_options(3));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result: Result<String, _> = policy
            .execute(&cancel, move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("never".to_string())
                }
            })
            .await;

        assert!(matches!(result, Err(OperationError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancellation_during_backoff_wait() {
        let options = RetryPolicyOptions {
            initial_delay: Duration::from_secs(5),
            ..fast_options(3)
        };
        let policy = RetryPolicy::new(options);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let result: Result<String, _> = policy
            .execute(&cancel, move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(network_failure())
                }
            })
            .await;

        assert!(matches!(result, Err(OperationError::Cancelled)));
        assert_eq!(
            calls.load(Ordering::SeqCst),
            1,
            "cancel should interrupt the backoff wait before a second attempt"
        );
    }

    #[tokio::test]
    async fn test_cancelled_transport_failure_is_never_wrapped() {
        let policy = RetryPolicy::new(fast_options(3));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result: Result<String, _> = policy
            .execute(&cancel, move || {
                let calls = calls_clone.clone();
                let trigger = trigger.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    trigger.cancel();
                    Err(TransportError::Cancelled)
                }
            })
            .await;

        assert!(matches!(result, Err(OperationError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_calculate_delay_is_deterministic_without_jitter() {
        let options = RetryPolicyOptions {
            max_retries: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(450),
            use_jitter: false,
            max_server_error_retries: 10,
        };
        let policy = RetryPolicy::new(options.clone());
        let mut context = RetryContext::new(&options);
        let error = AgentError::new(ErrorCategory::Network, "down");

        context.record_attempt(error.clone());
        assert_eq!(
            policy.calculate_delay(&error, &context),
            Duration::from_millis(100)
        );

        context.record_attempt(error.clone());
        assert_eq!(
            policy.calculate_delay(&error, &context),
            Duration::from_millis(200)
        );

        context.record_attempt(error.clone());
        assert_eq!(
            policy.calculate_delay(&error, &context),
            Duration::from_millis(400)
        );

        // Capped at max_delay from here on.
        context.record_attempt(error.clone());
        assert_eq!(
            policy.calculate_delay(&error, &context),
            Duration::from_millis(450)
        );
    }

    #[test]
    fn test_retry_after_wins_over_backoff() {
        let options = fast_options(5);
        let policy = RetryPolicy::new(options.clone());
        let mut context = RetryContext::new(&options);
        let error = AgentError::new(ErrorCategory::RateLimit, "slow down")
            .with_retry_after(Duration::from_secs(30));

        for _ in 0..4 {
            context.record_attempt(error.clone());
            assert_eq!(
                policy.calculate_delay(&error, &context),
                Duration::from_secs(30),
                "retry_after applies verbatim at any attempt index"
            );
        }
    }

    #[test]
    fn test_context_tracks_server_errors_separately() {
        let options = fast_options(5);
        let mut context = RetryContext::new(&options);

        context.record_attempt(AgentError::new(ErrorCategory::Network, "down"));
        context.record_attempt(AgentError::new(ErrorCategory::ServerError, "boom"));
        context.record_attempt(AgentError::new(ErrorCategory::ServerError, "boom"));

        assert_eq!(context.attempt_count(), 3);
        assert_eq!(context.server_error_count(), 2);
        assert_eq!(context.errors().len(), 3);
        assert_eq!(
            context.last_error().map(|e| e.category),
            Some(ErrorCategory::ServerError)
        );
    }
}
