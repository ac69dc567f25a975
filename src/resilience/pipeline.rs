//! Resilience Pipeline Module
//!
//! Wraps database calls in: operation timeout -> retry -> circuit breaker ->
//! connection/command timeouts on the underlying call.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn, Level};

use crate::config::ResilienceOptions;
use crate::error::{CacheError, Result, TimeoutKind};
use crate::resilience::{CircuitBreaker, CircuitState};

// == Resilience Pipeline ==
/// Shared by every database call of a cache instance.
#[derive(Debug)]
pub struct ResiliencePipeline {
    options: ResilienceOptions,
    breaker: Option<CircuitBreaker>,
    /// Masked description of the database, used in failure logs
    target: String,
}

impl ResiliencePipeline {
    /// Creates a pipeline.
    ///
    /// # Arguments
    /// * `options` - Retry, breaker and timeout settings
    /// * `target` - Masked database description for logs
    pub fn new(options: ResilienceOptions, target: impl Into<String>) -> Self {
        let breaker = options
            .circuit_breaker_enabled
            .then(|| CircuitBreaker::new(options.failure_threshold, options.break_duration));
        Self {
            options,
            breaker,
            target: target.into(),
        }
    }

    pub fn circuit_state(&self) -> Option<CircuitState> {
        self.breaker.as_ref().map(CircuitBreaker::state)
    }

    // == Execute ==
    /// Runs `call` under the full pipeline. `call` is invoked once per attempt.
    pub async fn execute<T, F, Fut>(&self, operation: &str, call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_cancellable(operation, &CancellationToken::new(), call)
            .await
    }

    /// Like [`ResiliencePipeline::execute`], aborting when `cancel` fires.
    pub async fn execute_cancellable<T, F, Fut>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        call: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let limit = self.options.operation_timeout;
        match tokio::time::timeout(limit, self.retry(operation, cancel, call)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(operation, database = %self.target, timeout = ?limit, "Operation timed out");
                Err(CacheError::Timeout {
                    operation: operation.to_string(),
                    kind: TimeoutKind::Operation,
                    after: limit,
                })
            }
        }
    }

    async fn retry<T, F, Fut>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        mut call: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;

            // dropping the permit (timeout, cancellation) releases a half-open trial
            let permit = match self.breaker.as_ref().map(CircuitBreaker::try_enter) {
                Some(Err(retry_after)) => {
                    debug!(operation, ?retry_after, "Circuit open, rejecting call");
                    return Err(CacheError::CircuitOpen {
                        operation: operation.to_string(),
                        retry_after,
                    });
                }
                Some(Ok(permit)) => Some(permit),
                None => None,
            };

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CacheError::Cancelled(operation.to_string())),
                result = call() => result,
            };

            let err = match result {
                Ok(value) => {
                    if let Some(permit) = permit {
                        permit.succeeded();
                    }
                    if attempt > 1 {
                        info!(operation, attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if let Some(permit) = permit {
                // application-level failures prove the database is reachable
                if err.is_transient() {
                    permit.failed();
                } else {
                    permit.succeeded();
                }
            }
            self.log_failure(operation, attempt, &err);

            if !err.is_transient() {
                return Err(err);
            }
            if attempt >= self.options.max_attempts {
                error!(operation, attempts = attempt, database = %self.target, "Retries exhausted");
                return Err(CacheError::OperationFailed {
                    operation: operation.to_string(),
                    attempts: attempt,
                    last_error: Box::new(err),
                });
            }

            let delay = self.options.backoff.delay(
                attempt,
                self.options.base_delay,
                self.options.max_delay,
            );
            debug!(operation, attempt, ?delay, "Retrying after backoff");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CacheError::Cancelled(operation.to_string())),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    // == Inner Timeouts ==
    /// Bounds a connection checkout by the connection timeout.
    pub async fn with_connection_timeout<T, Fut>(&self, operation: &str, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        bounded(operation, TimeoutKind::Connection, self.options.connection_timeout, fut).await
    }

    /// Bounds a single database round trip by the command timeout.
    pub async fn with_command_timeout<T, Fut>(&self, operation: &str, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        bounded(operation, TimeoutKind::Command, self.options.command_timeout, fut).await
    }

    fn log_failure(&self, operation: &str, attempt: u32, err: &CacheError) {
        if err.is_connection_failure() {
            let level = self.options.connection_failure_log_level;
            let database = self.target.as_str();
            if level == Level::ERROR {
                error!(operation, attempt, database, error = %err, "Database connection failure");
            } else if level == Level::WARN {
                warn!(operation, attempt, database, error = %err, "Database connection failure");
            } else if level == Level::INFO {
                info!(operation, attempt, database, error = %err, "Database connection failure");
            } else if level == Level::DEBUG {
                debug!(operation, attempt, database, error = %err, "Database connection failure");
            } else {
                trace!(operation, attempt, database, error = %err, "Database connection failure");
            }
        } else if err.is_transient() {
            warn!(operation, attempt, error = %err, "Transient database failure");
        } else {
            debug!(operation, attempt, error = %err, "Operation failed");
        }
    }
}

async fn bounded<T, Fut>(operation: &str, kind: TimeoutKind, limit: Duration, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .unwrap_or_else(|_| {
            Err(CacheError::Timeout {
                operation: operation.to_string(),
                kind,
                after: limit,
            })
        })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use tracing_test::traced_test;

    use super::*;
    use crate::error::DataSourceError;
    use crate::resilience::BackoffStrategy;

    fn options() -> ResilienceOptions {
        ResilienceOptions {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff: BackoffStrategy::Linear,
            operation_timeout: Duration::from_secs(30),
            ..ResilienceOptions::default()
        }
    }

    fn pipeline(options: ResilienceOptions) -> ResiliencePipeline {
        ResiliencePipeline::new(options, "host=db password=*****")
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_on_first_attempt() {
        let calls = AtomicU32::new(0);
        let result = pipeline(options())
            .execute("get", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(7)
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_connection_failures_until_success() {
        let calls = AtomicU32::new(0);
        let result = pipeline(options())
            .execute("set", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(DataSourceError::connection("refused").into())
                } else {
                    Ok("done")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_surface_operation_failed() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = pipeline(options())
            .execute("set", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(DataSourceError::connection("refused").into())
            })
            .await;

        assert!(matches!(
            result,
            Err(CacheError::OperationFailed { attempts: 3, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_application_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = pipeline(options())
            .execute("get", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(CacheError::Deserialization("garbage".to_string()))
            })
            .await;

        assert!(matches!(result, Err(CacheError::Deserialization(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_operation_timeout_is_reported_distinctly() {
        let options = ResilienceOptions {
            operation_timeout: Duration::from_millis(50),
            ..options()
        };
        let result: Result<()> = pipeline(options)
            .execute("get", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert!(matches!(
            result,
            Err(CacheError::Timeout {
                kind: TimeoutKind::Operation,
                ..
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_timeout_is_retried() {
        let options = ResilienceOptions {
            command_timeout: Duration::from_millis(20),
            ..options()
        };
        let pipeline = pipeline(options);
        let calls = AtomicU32::new(0);

        let result = pipeline
            .execute("get", || async {
                let slow = calls.fetch_add(1, Ordering::SeqCst) == 0;
                pipeline
                    .with_command_timeout("get", async {
                        if slow {
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                        Ok(1)
                    })
                    .await
            })
            .await;

        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_fails_fast() {
        let options = ResilienceOptions {
            max_attempts: 1,
            circuit_breaker_enabled: true,
            failure_threshold: 2,
            break_duration: Duration::from_secs(30),
            ..options()
        };
        let pipeline = pipeline(options);
        let calls = AtomicU32::new(0);
        let failing = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(DataSourceError::connection("down").into())
        };

        let _ = pipeline.execute("get", failing).await;
        let _ = pipeline.execute("get", failing).await;
        let result = pipeline.execute("get", failing).await;

        assert!(matches!(result, Err(CacheError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(pipeline.circuit_state(), Some(CircuitState::Open));
    }

    fn breaker_options() -> ResilienceOptions {
        ResilienceOptions {
            max_attempts: 1,
            circuit_breaker_enabled: true,
            failure_threshold: 1,
            break_duration: Duration::from_secs(30),
            operation_timeout: Duration::from_millis(50),
            ..options()
        }
    }

    async fn open_and_wait_out(pipeline: &ResiliencePipeline) {
        let _: Result<()> = pipeline
            .execute("get", || async { Err(DataSourceError::connection("down").into()) })
            .await;
        assert_eq!(pipeline.circuit_state(), Some(CircuitState::Open));
        tokio::time::advance(Duration::from_secs(31)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_trial_call_lets_next_call_through() {
        let pipeline = pipeline(breaker_options());
        open_and_wait_out(&pipeline).await;

        let result: Result<()> = pipeline
            .execute("get", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(CacheError::Timeout { kind: TimeoutKind::Operation, .. })));

        pipeline.execute("get", || async { Ok(()) }).await.unwrap();
        assert_eq!(pipeline.circuit_state(), Some(CircuitState::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_trial_call_lets_next_call_through() {
        let pipeline = pipeline(ResilienceOptions {
            operation_timeout: Duration::from_secs(30),
            ..breaker_options()
        });
        open_and_wait_out(&pipeline).await;

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });
        let result: Result<()> = pipeline
            .execute_cancellable("get", &cancel, || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(CacheError::Cancelled(_))));

        pipeline.execute("get", || async { Ok(()) }).await.unwrap();
        assert_eq!(pipeline.circuit_state(), Some(CircuitState::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_aborts_backoff() {
        let options = ResilienceOptions {
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(10),
            ..options()
        };
        let pipeline = pipeline(options);
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let result: Result<()> = pipeline
            .execute_cancellable("set", &cancel, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(DataSourceError::connection("refused").into())
            })
            .await;

        assert!(matches!(result, Err(CacheError::Cancelled(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_connection_failures_log_operation_and_target() {
        let options = ResilienceOptions {
            max_attempts: 1,
            ..options()
        };
        let _: Result<()> = pipeline(options)
            .execute("refresh", || async {
                Err(DataSourceError::connection("refused").into())
            })
            .await;

        assert!(logs_contain("Database connection failure"));
        assert!(logs_contain("refresh"));
        assert!(logs_contain("host=db password=*****"));
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_other_failures_are_not_labelled_connection_failures() {
        let _: Result<()> = pipeline(options())
            .execute("get", || async {
                Err(CacheError::Deserialization("garbage".to_string()))
            })
            .await;

        assert!(!logs_contain("Database connection failure"));
    }
}
