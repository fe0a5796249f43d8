use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use saleflow_sales::SaleItem;

use super::{ActivityDispatcher, ActivityError, ActivityKind, RetryPolicy};
use crate::workflow::WorkflowError;

/// Runs dispatcher calls with a per-attempt timeout and retry policy.
#[derive(Clone)]
pub struct ActivityExecutor {
    dispatcher: Arc<dyn ActivityDispatcher>,
    timeout: Duration,
    retry: RetryPolicy,
}

impl ActivityExecutor {
    pub fn new(dispatcher: Arc<dyn ActivityDispatcher>, timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            dispatcher,
            timeout,
            retry,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `kind` against `sale_item`.
    ///
    /// Timeouts and fatal failures are returned at once; retryable failures
    /// are re-attempted until the policy gives up.
    pub async fn run(&self, kind: ActivityKind, sale_item: &SaleItem) -> Result<(), WorkflowError> {
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            let outcome =
                tokio::time::timeout(self.timeout, self.dispatcher.execute(kind, sale_item)).await;

            match outcome {
                Ok(Ok(())) => {
                    debug!(activity = kind.name(), attempt, "activity completed");
                    return Ok(());
                }
                Ok(Err(ActivityError::Retryable(reason))) if self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay;
                    warn!(
                        activity = kind.name(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "activity failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Ok(Err(e)) => {
                    warn!(activity = kind.name(), attempt, error = %e, "activity failed");
                    return Err(WorkflowError::ActionFailed {
                        activity: kind.name().to_string(),
                        reason: e.to_string(),
                    });
                }
                Err(_) => {
                    warn!(
                        activity = kind.name(),
                        attempt,
                        timeout_ms = self.timeout.as_millis() as u64,
                        "activity timed out"
                    );
                    return Err(WorkflowError::ActionTimeout {
                        activity: kind.name().to_string(),
                        timeout: self.timeout,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use saleflow_core::SaleItemId;
    use saleflow_sales::SaleItemStatus;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        calls: AtomicU32,
        failures_before_success: u32,
        error: ActivityError,
    }

    #[async_trait]
    impl ActivityDispatcher for Flaky {
        async fn execute(&self, _: ActivityKind, _: &SaleItem) -> Result<(), ActivityError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures_before_success {
                Err(self.error.clone())
            } else {
                Ok(())
            }
        }
    }

    struct Sleepy(Duration);

    #[async_trait]
    impl ActivityDispatcher for Sleepy {
        async fn execute(&self, _: ActivityKind, _: &SaleItem) -> Result<(), ActivityError> {
            tokio::time::sleep(self.0).await;
            Ok(())
        }
    }

    fn item() -> SaleItem {
        SaleItem {
            sale_item_id: SaleItemId::new("1234567").unwrap(),
            current_status: SaleItemStatus::Open,
            quantity: 10,
        }
    }

    fn flaky(failures: u32, error: ActivityError) -> Arc<Flaky> {
        Arc::new(Flaky {
            calls: AtomicU32::new(0),
            failures_before_success: failures,
            error,
        })
    }

    #[tokio::test]
    async fn retryable_failures_are_retried_until_success() {
        let dispatcher = flaky(2, ActivityError::retryable("busy"));
        let executor = ActivityExecutor::new(
            dispatcher.clone(),
            Duration::from_secs(1),
            RetryPolicy::fixed(3, Duration::from_millis(1)),
        );

        executor
            .run(ActivityKind::MoveFromOpenToReady, &item())
            .await
            .unwrap();
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_stop_when_policy_is_exhausted() {
        let dispatcher = flaky(5, ActivityError::retryable("busy"));
        let executor = ActivityExecutor::new(
            dispatcher.clone(),
            Duration::from_secs(1),
            RetryPolicy::fixed(2, Duration::from_millis(1)),
        );

        let err = executor
            .run(ActivityKind::MoveFromOpenToReady, &item())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::ActionFailed { .. }));
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fatal_failures_are_not_retried() {
        let dispatcher = flaky(1, ActivityError::fatal("rejected"));
        let executor = ActivityExecutor::new(
            dispatcher.clone(),
            Duration::from_secs(1),
            RetryPolicy::fixed(5, Duration::from_millis(1)),
        );

        let err = executor
            .run(ActivityKind::PostUpdate, &item())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            WorkflowError::ActionFailed {
                activity: "post_update".to_string(),
                reason: "fatal activity failure: rejected".to_string(),
            }
        );
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_activity_times_out() {
        let executor = ActivityExecutor::new(
            Arc::new(Sleepy(Duration::from_millis(200))),
            Duration::from_millis(20),
            RetryPolicy::fixed(3, Duration::from_millis(1)),
        );

        let err = executor
            .run(ActivityKind::MoveFromReadyToBilledPending, &item())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::ActionTimeout { ref activity, .. } if activity == "move_from_ready_to_billed_pending"
        ));
    }
}
