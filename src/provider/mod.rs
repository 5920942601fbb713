//! Capability-polymorphic channel abstraction.
//!
//! A provider's only job is to *deliver* an ask through its channel and
//! *later report* a resolution; it never blocks the caller. Pull-style
//! channels (remote APIs, inboxes) report through [`HumanLoopProvider::poll`]
//! driven by the sweep scheduler; push-style channels hand their answer to
//! [`crate::manager::HumanLoopManager::resolve`] instead.
//!
//! ## Module organization
//!
//! - `mod.rs` - trait definition, ask/receipt/resolution types, errors
//! - `terminal.rs` - synchronous local prompt on stdin/stdout
//! - `api.rs` - generic remote approval service over HTTPS
//! - `mock.rs` - scripted provider for tests and local development

pub mod api;
pub mod mock;
pub mod terminal;

pub use api::{ApiConfig, ApiProvider};
pub use mock::MockProvider;
pub use terminal::TerminalProvider;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::request::{ConversationId, RequestId, RequestKind, RequestStatus, Resolution};

// ============================================================================
// Provider Ask
// ============================================================================

/// Everything a channel needs to render one human-facing ask.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderAsk {
    /// The request this ask belongs to
    pub request_id: RequestId,
    /// Caller-supplied logical task name
    pub task_id: String,
    /// What is being asked
    pub kind: RequestKind,
    /// Conversation this ask continues, if any
    pub conversation_id: Option<ConversationId>,
    /// Opaque display/delivery hints from the caller (recipient address,
    /// prompt text, ...), never interpreted by the engine
    pub metadata: serde_json::Value,
    /// Prior turns of the conversation, oldest first, so the reviewer
    /// sees context; empty for non-conversational asks
    pub history: Vec<ConversationTurn>,
    /// When the request was created
    pub created_at: DateTime<Utc>,
    /// When the request expires
    pub expires_at: DateTime<Utc>,
}

/// One prior turn of a conversation, as rendered to the reviewer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// The turn's request id
    pub request_id: RequestId,
    /// The turn's ask payload
    pub metadata: serde_json::Value,
    /// The human response, if the turn resolved
    pub response: Option<serde_json::Value>,
    /// When the turn resolved
    pub responded_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Receipt
// ============================================================================

/// Proof of delivery returned by [`HumanLoopProvider::submit`], passed back
/// verbatim to `poll` and `cancel` so the provider can correlate the ask
/// with inbound human responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    /// The request the receipt belongs to
    pub request_id: RequestId,
    /// Provider-scoped correlation id (message timestamp, remote id, …)
    pub external_id: String,
    /// When the ask was delivered
    pub issued_at: DateTime<Utc>,
}

// ============================================================================
// Provider Resolution
// ============================================================================

/// The decision a channel reports for an ask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// The human approved the proposed action
    Approved,
    /// The human rejected the proposed action
    Rejected,
    /// The human supplied the requested information or reply
    Completed,
}

/// A resolution as reported by a channel, before the manager maps it onto
/// the request's terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResolution {
    /// The decision detected on the channel
    pub decision: Decision,
    /// Free-form response payload
    pub response: Option<serde_json::Value>,
    /// Who responded, when the channel knows
    pub responded_by: Option<String>,
    /// When the response was detected
    pub responded_at: DateTime<Utc>,
}

impl ProviderResolution {
    /// Builds a resolution with the given decision and payload.
    #[must_use]
    pub fn new(decision: Decision, response: Option<serde_json::Value>) -> Self {
        Self {
            decision,
            response,
            responded_by: None,
            responded_at: Utc::now(),
        }
    }

    /// Sets the responder identity.
    #[must_use]
    pub fn with_responder(mut self, responded_by: impl Into<String>) -> Self {
        self.responded_by = Some(responded_by.into());
        self
    }

    /// Maps the channel decision onto the request's terminal status.
    ///
    /// Approval requests resolve approved/rejected (a plain completion
    /// counts as approval); information and conversation turns always
    /// resolve `Completed` unless explicitly rejected.
    #[must_use]
    pub fn into_resolution(self, kind: RequestKind) -> Resolution {
        let status = match (kind, self.decision) {
            (RequestKind::Approval, Decision::Approved | Decision::Completed) => {
                RequestStatus::Approved
            }
            (_, Decision::Rejected) => RequestStatus::Rejected,
            (RequestKind::Information | RequestKind::Conversation, _) => RequestStatus::Completed,
        };
        Resolution {
            status,
            response: self.response,
            responded_by: self.responded_by,
            responded_at: self.responded_at,
        }
    }
}

// ============================================================================
// Provider Errors
// ============================================================================

/// Errors from channel providers.
#[derive(Debug, Error, Clone)]
pub enum ProviderError {
    /// The channel cannot be reached to deliver the ask.
    #[error("channel unavailable: {reason}")]
    Unavailable {
        /// Reason for the failure
        reason: String,
        /// Whether a later attempt might succeed
        retriable: bool,
    },

    /// Polling the channel for a response failed.
    #[error("poll failed: {reason}")]
    PollFailed {
        /// Reason for the failure
        reason: String,
        /// Whether the next sweep should retry
        retriable: bool,
    },

    /// The channel rate-limited us.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited {
        /// How long to wait before retrying
        retry_after: Duration,
    },

    /// The channel rejected our credentials.
    #[error("invalid or expired channel credentials")]
    InvalidCredentials,

    /// The channel no longer knows the receipt (ask deleted remotely).
    #[error("receipt '{external_id}' not known to the channel")]
    UnknownReceipt {
        /// The receipt's correlation id
        external_id: String,
    },
}

impl ProviderError {
    /// Returns whether the next sweep should retry the operation.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Unavailable { retriable, .. } | Self::PollFailed { retriable, .. } => *retriable,
            Self::RateLimited { .. } => true,
            Self::InvalidCredentials | Self::UnknownReceipt { .. } => false,
        }
    }
}

// ============================================================================
// Provider Trait
// ============================================================================

/// A pluggable channel capable of delivering an ask to a human and
/// reporting its resolution.
///
/// Implementations must be safe for concurrent `submit`/`poll`/`cancel`
/// across different requests; the engine serializes operations per
/// request but dispatches unrelated requests to the same provider
/// concurrently.
#[async_trait]
pub trait HumanLoopProvider: Send + Sync {
    /// Returns the provider name, unique within a manager.
    fn name(&self) -> &str;

    /// Returns true if the provider can carry asks of the given kind.
    fn supports(&self, kind: RequestKind) -> bool;

    /// Delivers the ask through the channel and returns a receipt.
    ///
    /// Must return promptly: delivery only, never waiting for the human.
    /// Fails with [`ProviderError::Unavailable`] if the channel cannot be
    /// reached; the engine surfaces that to the caller without retrying.
    async fn submit(&self, ask: &ProviderAsk) -> Result<Receipt, ProviderError>;

    /// Checks whether a human has responded to a delivered ask.
    ///
    /// Returns `Ok(None)` while the ask is still pending. Must be safe to
    /// call repeatedly and concurrently for different receipts.
    async fn poll(&self, receipt: &Receipt) -> Result<Option<ProviderResolution>, ProviderError>;

    /// Best-effort withdrawal of a still-pending ask.
    ///
    /// A no-op if the ask already resolved; failures are advisory.
    async fn cancel(&self, receipt: &Receipt) -> Result<(), ProviderError>;
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approval_decisions_map_onto_approval_statuses() {
        let approved = ProviderResolution::new(Decision::Approved, None)
            .into_resolution(RequestKind::Approval);
        assert_eq!(approved.status, RequestStatus::Approved);

        let rejected = ProviderResolution::new(Decision::Rejected, None)
            .into_resolution(RequestKind::Approval);
        assert_eq!(rejected.status, RequestStatus::Rejected);

        // A bare completion on an approval request counts as approval.
        let completed = ProviderResolution::new(Decision::Completed, None)
            .into_resolution(RequestKind::Approval);
        assert_eq!(completed.status, RequestStatus::Approved);
    }

    #[test]
    fn information_and_conversation_resolve_completed() {
        for kind in [RequestKind::Information, RequestKind::Conversation] {
            let resolution = ProviderResolution::new(
                Decision::Completed,
                Some(serde_json::json!({"response": "42"})),
            )
            .into_resolution(kind);
            assert_eq!(resolution.status, RequestStatus::Completed);
            assert_eq!(resolution.response.unwrap()["response"], "42");

            let rejected =
                ProviderResolution::new(Decision::Rejected, None).into_resolution(kind);
            assert_eq!(rejected.status, RequestStatus::Rejected);
        }
    }

    #[test]
    fn responder_is_carried_through() {
        let resolution = ProviderResolution::new(Decision::Approved, None)
            .with_responder("alice")
            .into_resolution(RequestKind::Approval);
        assert_eq!(resolution.responded_by.as_deref(), Some("alice"));
    }

    #[test]
    fn error_retriability() {
        assert!(ProviderError::Unavailable {
            reason: "connect timeout".to_string(),
            retriable: true
        }
        .is_retriable());
        assert!(!ProviderError::Unavailable {
            reason: "bad address".to_string(),
            retriable: false
        }
        .is_retriable());
        assert!(ProviderError::RateLimited {
            retry_after: Duration::from_secs(30)
        }
        .is_retriable());
        assert!(!ProviderError::InvalidCredentials.is_retriable());
        assert!(!ProviderError::UnknownReceipt {
            external_id: "x".to_string()
        }
        .is_retriable());
    }
}
