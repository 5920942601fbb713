//! Mock provider for tests and local development.
//!
//! Reports a scripted decision once a configurable delay has elapsed,
//! without touching any real channel. Call counters make delivery and
//! sweep behavior observable from tests.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::debug;

use super::{
    Decision, HumanLoopProvider, ProviderAsk, ProviderError, ProviderResolution, Receipt,
};
use crate::request::RequestKind;

/// What the mock does with each ask.
#[derive(Debug, Clone)]
enum MockBehavior {
    /// Report the decision once the delay has elapsed since submission
    Resolve {
        decision: Decision,
        response: Option<serde_json::Value>,
        after: Duration,
    },
    /// Never report a decision (for exercising expiry)
    Silent,
    /// Fail every submission (for exercising channel outages)
    FailSubmit,
}

/// Scripted channel provider.
pub struct MockProvider {
    name: String,
    behavior: MockBehavior,
    submit_count: AtomicU32,
    poll_count: AtomicU32,
    cancel_count: AtomicU32,
}

impl MockProvider {
    fn with_behavior(name: impl Into<String>, behavior: MockBehavior) -> Self {
        Self {
            name: name.into(),
            behavior,
            submit_count: AtomicU32::new(0),
            poll_count: AtomicU32::new(0),
            cancel_count: AtomicU32::new(0),
        }
    }

    /// Approves every ask after the given delay.
    #[must_use]
    pub fn approve_after(name: impl Into<String>, delay: Duration) -> Self {
        Self::with_behavior(
            name,
            MockBehavior::Resolve {
                decision: Decision::Approved,
                response: Some(serde_json::json!({"reason": "ok"})),
                after: delay,
            },
        )
    }

    /// Rejects every ask after the given delay.
    #[must_use]
    pub fn reject_after(name: impl Into<String>, delay: Duration) -> Self {
        Self::with_behavior(
            name,
            MockBehavior::Resolve {
                decision: Decision::Rejected,
                response: Some(serde_json::json!({"reason": "denied"})),
                after: delay,
            },
        )
    }

    /// Completes every ask with the given payload after the delay.
    #[must_use]
    pub fn complete_after(
        name: impl Into<String>,
        delay: Duration,
        response: serde_json::Value,
    ) -> Self {
        Self::with_behavior(
            name,
            MockBehavior::Resolve {
                decision: Decision::Completed,
                response: Some(response),
                after: delay,
            },
        )
    }

    /// Approves on the first poll.
    #[must_use]
    pub fn instant_approve(name: impl Into<String>) -> Self {
        Self::approve_after(name, Duration::ZERO)
    }

    /// Rejects on the first poll.
    #[must_use]
    pub fn instant_reject(name: impl Into<String>) -> Self {
        Self::reject_after(name, Duration::ZERO)
    }

    /// Never responds, so asks run into their timeout.
    #[must_use]
    pub fn silent(name: impl Into<String>) -> Self {
        Self::with_behavior(name, MockBehavior::Silent)
    }

    /// Fails every submission with an unavailable channel.
    #[must_use]
    pub fn unavailable(name: impl Into<String>) -> Self {
        Self::with_behavior(name, MockBehavior::FailSubmit)
    }

    /// Number of asks submitted.
    #[must_use]
    pub fn submit_count(&self) -> u32 {
        self.submit_count.load(Ordering::Relaxed)
    }

    /// Number of poll attempts.
    #[must_use]
    pub fn poll_count(&self) -> u32 {
        self.poll_count.load(Ordering::Relaxed)
    }

    /// Number of withdrawals.
    #[must_use]
    pub fn cancel_count(&self) -> u32 {
        self.cancel_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl HumanLoopProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports(&self, _kind: RequestKind) -> bool {
        true
    }

    async fn submit(&self, ask: &ProviderAsk) -> Result<Receipt, ProviderError> {
        self.submit_count.fetch_add(1, Ordering::Relaxed);

        if matches!(self.behavior, MockBehavior::FailSubmit) {
            return Err(ProviderError::Unavailable {
                reason: "mock channel is down".to_string(),
                retriable: false,
            });
        }

        debug!(request_id = %ask.request_id, "mock provider accepted ask");
        Ok(Receipt {
            request_id: ask.request_id.clone(),
            external_id: format!("mock_{}", ask.request_id),
            issued_at: Utc::now(),
        })
    }

    async fn poll(&self, receipt: &Receipt) -> Result<Option<ProviderResolution>, ProviderError> {
        self.poll_count.fetch_add(1, Ordering::Relaxed);

        match &self.behavior {
            MockBehavior::Resolve {
                decision,
                response,
                after,
            } => {
                let elapsed = (Utc::now() - receipt.issued_at)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                if elapsed < *after {
                    return Ok(None);
                }
                Ok(Some(
                    ProviderResolution::new(*decision, response.clone())
                        .with_responder("mock:auto"),
                ))
            }
            MockBehavior::Silent => Ok(None),
            MockBehavior::FailSubmit => Ok(None),
        }
    }

    async fn cancel(&self, receipt: &Receipt) -> Result<(), ProviderError> {
        self.cancel_count.fetch_add(1, Ordering::Relaxed);
        debug!(request_id = %receipt.request_id, "mock provider cancelled ask");
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
