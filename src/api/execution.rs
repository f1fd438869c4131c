//! Execution delegates: hand go/sold decisions to an external order layer.
//!
//! Delivery is fire-and-forget. The order layer is idempotent on
//! `idempotency_key`, and a failed notification is logged, never retried.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info};

use super::types::ExecutionRequest;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait ExecutionDelegate: Send + Sync {
    /// Notify that a validated position should be opened.
    async fn open_position(&self, request: &ExecutionRequest) -> Result<()>;

    /// Notify that a position should be closed at the given price.
    async fn close_position(&self, request: &ExecutionRequest) -> Result<()>;
}

/// Logs instructions instead of sending them.
#[derive(Debug, Default, Clone)]
pub struct DryRunDelegate;

#[async_trait]
impl ExecutionDelegate for DryRunDelegate {
    async fn open_position(&self, request: &ExecutionRequest) -> Result<()> {
        info!(
            position_id = request.position_id,
            strategy = %request.strategy_id,
            asset = %request.asset,
            price = %request.price,
            "[DRY RUN] Would open position"
        );
        Ok(())
    }

    async fn close_position(&self, request: &ExecutionRequest) -> Result<()> {
        info!(
            position_id = request.position_id,
            strategy = %request.strategy_id,
            asset = %request.asset,
            price = %request.price,
            reason = request.reason.as_deref().unwrap_or(""),
            "[DRY RUN] Would close position"
        );
        Ok(())
    }
}

/// POSTs instructions as JSON to a webhook.
pub struct WebhookDelegate {
    client: Client,
    url: String,
}

impl WebhookDelegate {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }

    async fn send(&self, request: &ExecutionRequest) -> Result<()> {
        debug!(url = %self.url, key = %request.idempotency_key, "Sending execution request");

        let response = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .context("Failed to send execution request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Execution request failed: {} - {}", status, body);
        }

        Ok(())
    }
}

#[async_trait]
impl ExecutionDelegate for WebhookDelegate {
    async fn open_position(&self, request: &ExecutionRequest) -> Result<()> {
        self.send(request).await
    }

    async fn close_position(&self, request: &ExecutionRequest) -> Result<()> {
        self.send(request).await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Records every request it receives.
    #[derive(Default)]
    pub struct RecordingDelegate {
        pub opened: Mutex<Vec<ExecutionRequest>>,
        pub closed: Mutex<Vec<ExecutionRequest>>,
    }

    #[async_trait]
    impl ExecutionDelegate for RecordingDelegate {
        async fn open_position(&self, request: &ExecutionRequest) -> Result<()> {
            self.opened.lock().unwrap().push(request.clone());
            Ok(())
        }

        async fn close_position(&self, request: &ExecutionRequest) -> Result<()> {
            self.closed.lock().unwrap().push(request.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ExecutionAction;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_dry_run_accepts_everything() {
        let delegate = DryRunDelegate;
        let request = ExecutionRequest::new(ExecutionAction::Open, 1, "s1", "BTC", dec!(100), Utc::now());
        tokio_test::assert_ok!(delegate.open_position(&request).await);
        tokio_test::assert_ok!(delegate.close_position(&request).await);
    }

    #[tokio::test]
    async fn test_webhook_failure_is_an_error() {
        // Nothing listens on the discard port
        let delegate = WebhookDelegate::new("http://127.0.0.1:9/execute").unwrap();
        let request = ExecutionRequest::new(ExecutionAction::Close, 1, "s1", "BTC", dec!(100), Utc::now());
        tokio_test::assert_err!(delegate.close_position(&request).await);
    }
}
