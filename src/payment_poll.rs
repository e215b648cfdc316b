//! Mobile-money payment status poller.
//!
//! After an STK push the checkout screen waits for the payment to settle.
//! The poller asks the server right away, then on a fixed cadence, and gives
//! up after a bounded number of attempts.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::RemoteApi;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "message", rename_all = "lowercase")]
pub enum PaymentOutcome {
    Completed,
    /// Settled but not completed (failed or cancelled by the customer).
    Failed,
    /// Still unsettled after the last attempt.
    Pending,
    /// The caller stopped waiting.
    Cancelled,
    Error(String),
}

pub struct PaymentPoller<R> {
    remote: Arc<R>,
    interval: Duration,
    max_attempts: u32,
}

impl<R: RemoteApi> PaymentPoller<R> {
    pub fn new(remote: Arc<R>, interval: Duration, max_attempts: u32) -> Self {
        Self {
            remote,
            interval,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Poll until the payment settles, attempts run out, an error occurs, or
    /// `cancel` fires.
    pub async fn wait(
        &self,
        checkout_request_id: &str,
        cancel: CancellationToken,
    ) -> PaymentOutcome {
        for attempt in 1..=self.max_attempts {
            if attempt > 1 {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!(checkout_request_id, "payment polling cancelled");
                        return PaymentOutcome::Cancelled;
                    }
                    _ = tokio::time::sleep(self.interval) => {}
                }
            } else if cancel.is_cancelled() {
                return PaymentOutcome::Cancelled;
            }

            let response = match self.remote.payment_status(checkout_request_id).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(checkout_request_id, error = %e, "payment status check failed");
                    return PaymentOutcome::Error(e.to_string());
                }
            };
            debug!(
                checkout_request_id,
                attempt,
                status = ?response.status,
                is_complete = response.is_complete,
                "payment status polled"
            );

            if !response.success {
                let message = response
                    .message
                    .unwrap_or_else(|| "Error checking payment status".to_string());
                warn!(checkout_request_id, error = %message, "payment status check rejected");
                return PaymentOutcome::Error(message);
            }
            if response.is_complete {
                let outcome = if response.status.as_deref() == Some("completed") {
                    PaymentOutcome::Completed
                } else {
                    PaymentOutcome::Failed
                };
                info!(checkout_request_id, outcome = ?outcome, "payment settled");
                return outcome;
            }
        }

        info!(
            checkout_request_id,
            attempts = self.max_attempts,
            "payment still pending; giving up"
        );
        PaymentOutcome::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{PaymentStatusResponse, SubmitOutcome};
    use crate::error::{OfflineError, Result};
    use crate::models::Collection;
    use serde_json::Value;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct PaymentGateway {
        replies: Mutex<VecDeque<Result<PaymentStatusResponse>>>,
        polls: AtomicUsize,
    }

    impl PaymentGateway {
        fn with(replies: Vec<Result<PaymentStatusResponse>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                polls: AtomicUsize::new(0),
            })
        }
    }

    impl RemoteApi for PaymentGateway {
        async fn submit_sale(&self, _body: &Value) -> Result<SubmitOutcome> {
            Err(OfflineError::TransportFailure("unused".into()))
        }

        async fn fetch_collection(&self, _collection: Collection) -> Result<Vec<Value>> {
            Ok(Vec::new())
        }

        async fn check_health(&self) -> bool {
            true
        }

        async fn payment_status(&self, _id: &str) -> Result<PaymentStatusResponse> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(status("pending", false)))
        }
    }

    fn status(status: &str, is_complete: bool) -> PaymentStatusResponse {
        PaymentStatusResponse {
            success: true,
            status: Some(status.to_string()),
            is_complete,
            message: None,
        }
    }

    fn poller(gateway: &Arc<PaymentGateway>, max_attempts: u32) -> PaymentPoller<PaymentGateway> {
        PaymentPoller::new(gateway.clone(), Duration::from_millis(10), max_attempts)
    }

    #[tokio::test]
    async fn test_completed_after_pending_polls() {
        let gateway = PaymentGateway::with(vec![
            Ok(status("pending", false)),
            Ok(status("pending", false)),
            Ok(status("completed", true)),
        ]);
        let outcome = poller(&gateway, 12)
            .wait("ws_CO_1", CancellationToken::new())
            .await;
        assert_eq!(outcome, PaymentOutcome::Completed);
        assert_eq!(gateway.polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_settled_but_not_completed_is_failed() {
        let gateway = PaymentGateway::with(vec![Ok(status("failed", true))]);
        let outcome = poller(&gateway, 12)
            .wait("ws_CO_2", CancellationToken::new())
            .await;
        assert_eq!(outcome, PaymentOutcome::Failed);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let gateway = PaymentGateway::with(Vec::new());
        let outcome = poller(&gateway, 4)
            .wait("ws_CO_3", CancellationToken::new())
            .await;
        assert_eq!(outcome, PaymentOutcome::Pending);
        assert_eq!(gateway.polls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_error_stops_polling() {
        let gateway = PaymentGateway::with(vec![
            Ok(status("pending", false)),
            Ok(PaymentStatusResponse {
                success: false,
                status: None,
                is_complete: false,
                message: Some("Payment not found".into()),
            }),
        ]);
        let outcome = poller(&gateway, 12)
            .wait("ws_CO_4", CancellationToken::new())
            .await;
        assert_eq!(outcome, PaymentOutcome::Error("Payment not found".into()));
        assert_eq!(gateway.polls.load(Ordering::SeqCst), 2);

        let gateway = PaymentGateway::with(vec![Err(OfflineError::TransportFailure(
            "timed out".into(),
        ))]);
        let outcome = poller(&gateway, 12)
            .wait("ws_CO_5", CancellationToken::new())
            .await;
        assert!(matches!(outcome, PaymentOutcome::Error(_)));
        assert_eq!(gateway.polls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_between_polls() {
        let gateway = PaymentGateway::with(Vec::new());
        let poller = PaymentPoller::new(gateway.clone(), Duration::from_secs(30), 12);
        let cancel = CancellationToken::new();

        let waiter = {
            let cancel = cancel.clone();
            tokio::spawn(async move { poller.wait("ws_CO_6", cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        assert_eq!(waiter.await.unwrap(), PaymentOutcome::Cancelled);
        assert_eq!(gateway.polls.load(Ordering::SeqCst), 1);
    }
}
