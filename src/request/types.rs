//! Request domain types: identifiers, kinds, resolutions, and the request
//! and conversation records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::error::StoreError;
use super::status::RequestStatus;

// ============================================================================
// Request ID
// ============================================================================

/// Unique request identifier.
///
/// Format: `hl_<nanoid>` where the body is 21 alphanumeric characters,
/// e.g. `hl_V1StGXR8_Z5jdHi6B-myT`. Generated once at creation and
/// immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(String);

/// Prefix for request ids minted by this crate.
pub const REQUEST_ID_PREFIX: &str = "hl_";

/// Length of the nanoid body (excluding prefix).
pub const REQUEST_ID_BODY_LENGTH: usize = 21;

impl RequestId {
    /// Creates a new random request id.
    ///
    /// 21 nanoid characters give roughly a billion ids before a 1%
    /// collision probability.
    #[must_use]
    pub fn new() -> Self {
        let body = nanoid::nanoid!(REQUEST_ID_BODY_LENGTH);
        Self(format!("{REQUEST_ID_PREFIX}{body}"))
    }

    /// Creates a request id from a raw string without validation.
    #[must_use]
    pub fn from_raw(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the raw string value.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RequestId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

impl Serialize for RequestId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for RequestId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Self(s))
    }
}

// ============================================================================
// Conversation ID
// ============================================================================

/// Caller-supplied identifier grouping an ordered chain of request turns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(String);

impl ConversationId {
    /// Wraps a caller-supplied conversation name.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the raw string value.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ConversationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ============================================================================
// Request Kind
// ============================================================================

/// What is being asked of the human.
///
/// Doubles as the capability atom a provider advertises via
/// [`crate::provider::HumanLoopProvider::supports`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// A yes/no decision on a proposed action
    Approval,
    /// Free-form information the caller needs
    Information,
    /// One turn in an iterative feedback dialogue
    Conversation,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Approval => write!(f, "approval"),
            Self::Information => write!(f, "information"),
            Self::Conversation => write!(f, "conversation"),
        }
    }
}

// ============================================================================
// Resolution
// ============================================================================

/// The terminal outcome of a request: a terminal status plus whatever the
/// human (or the scheduler, for synthetic outcomes) supplied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resolution {
    /// The terminal status committed for the request
    pub status: RequestStatus,
    /// Free-form response payload; shape depends on the request kind
    pub response: Option<serde_json::Value>,
    /// Who resolved the request, when the channel knows
    pub responded_by: Option<String>,
    /// When the resolution was produced
    pub responded_at: DateTime<Utc>,
}

impl Resolution {
    /// Builds a resolution with the given terminal status and payload.
    #[must_use]
    pub fn new(status: RequestStatus, response: Option<serde_json::Value>) -> Self {
        Self {
            status,
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

    /// Synthetic resolution for a request whose timeout elapsed.
    #[must_use]
    pub fn timed_out() -> Self {
        Self::new(
            RequestStatus::Expired,
            Some(serde_json::json!({"reason": "timed out waiting for a human response"})),
        )
    }

    /// Synthetic resolution for a cancelled request.
    #[must_use]
    pub fn cancelled() -> Self {
        Self::new(RequestStatus::Cancelled, None)
    }

    /// Synthetic resolution for a request the channel could not carry.
    #[must_use]
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::new(
            RequestStatus::Failed,
            Some(serde_json::json!({"reason": reason.into()})),
        )
    }
}

// ============================================================================
// Request Transition
// ============================================================================

/// Audit record of a single status transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestTransition {
    /// Previous status
    pub from: RequestStatus,
    /// New status
    pub to: RequestStatus,
    /// When the transition committed
    pub at: DateTime<Utc>,
    /// Optional reason for the transition
    pub reason: Option<String>,
}

// ============================================================================
// Request
// ============================================================================

/// One outstanding ask for human approval, information, or a conversation
/// turn.
///
/// The identity fields are immutable after creation; `status`,
/// `resolution`, and `transitions` are mutated exactly once, when the
/// store commits the terminal transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanLoopRequest {
    /// Unique request identifier
    pub id: RequestId,
    /// Caller-supplied logical task name; may repeat across requests
    pub task_id: String,
    /// Conversation this request is a turn of, if any
    pub conversation_id: Option<ConversationId>,
    /// What is being asked
    pub kind: RequestKind,
    /// Name of the provider carrying this request
    pub provider_id: String,
    /// Opaque key/value payload passed through to the provider untouched
    pub metadata: serde_json::Value,
    /// When the request was created
    pub created_at: DateTime<Utc>,
    /// Wall-clock budget for a human response
    pub timeout: Duration,
    /// `created_at + timeout`, precomputed for the expiry sweep
    pub expires_at: DateTime<Utc>,
    /// Current status
    pub status: RequestStatus,
    /// Terminal outcome, once committed
    pub resolution: Option<Resolution>,
    /// Audit trail of status transitions
    pub transitions: Vec<RequestTransition>,
}

impl HumanLoopRequest {
    /// Creates a new pending request.
    #[must_use]
    pub fn new(
        task_id: impl Into<String>,
        kind: RequestKind,
        conversation_id: Option<ConversationId>,
        provider_id: impl Into<String>,
        metadata: serde_json::Value,
        timeout: Duration,
    ) -> Self {
        let now = Utc::now();
        // Clamp to 30 days if the duration overflows chrono's range
        let chrono_timeout =
            chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::days(30));
        Self {
            id: RequestId::new(),
            task_id: task_id.into(),
            conversation_id,
            kind,
            provider_id: provider_id.into(),
            metadata,
            created_at: now,
            timeout,
            expires_at: now + chrono_timeout,
            status: RequestStatus::Pending,
            resolution: None,
            transitions: Vec::new(),
        }
    }

    /// Returns true if the response deadline has passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Applies a terminal resolution to this record.
    ///
    /// Fails if the request is already terminal (first writer wins) or if
    /// the resolution carries a non-terminal status.
    pub(crate) fn commit(&mut self, resolution: Resolution) -> Result<(), StoreError> {
        if self.status.is_terminal() {
            return Err(StoreError::AlreadyTerminal {
                id: self.id.clone(),
                status: self.status,
            });
        }
        if !self.status.can_transition_to(resolution.status) {
            return Err(StoreError::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to: resolution.status,
            });
        }

        self.transitions.push(RequestTransition {
            from: self.status,
            to: resolution.status,
            at: resolution.responded_at,
            reason: resolution.responded_by.clone(),
        });
        self.status = resolution.status;
        self.resolution = Some(resolution);
        Ok(())
    }
}

// ============================================================================
// Conversation
// ============================================================================

/// An ordered chain of request turns sharing one conversation id.
///
/// Turns are appended in creation order. The conversation closes when a
/// turn ends in a negative terminal state; `Completed` turns leave it
/// open so the dialogue can continue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    /// Conversation identifier
    pub id: ConversationId,
    /// Turn request ids, oldest first
    pub turns: Vec<RequestId>,
    /// Whether further turns may be appended
    pub closed: bool,
    /// When the first turn was appended
    pub created_at: DateTime<Utc>,
    /// When the latest turn was appended or the conversation closed
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub(crate) fn new(id: ConversationId) -> Self {
        let now = Utc::now();
        Self {
            id,
            turns: Vec::new(),
            closed: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Number of turns appended so far.
    #[must_use]
    pub fn turn_count(&self) -> usize {
        self.turns.len()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_has_prefix_and_is_unique() {
        let a = RequestId::new();
        let b = RequestId::new();
        assert!(a.as_str().starts_with(REQUEST_ID_PREFIX));
        assert_eq!(a.as_str().len(), REQUEST_ID_PREFIX.len() + REQUEST_ID_BODY_LENGTH);
        assert_ne!(a, b);
    }

    #[test]
    fn request_id_round_trips_through_serde() {
        let id = RequestId::new();
        let json = serde_json::to_string(&id).unwrap();
        let back: RequestId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    fn pending_request() -> HumanLoopRequest {
        HumanLoopRequest::new(
            "deploy-prod",
            RequestKind::Approval,
            None,
            "terminal",
            serde_json::json!({"service": "billing"}),
            Duration::from_secs(60),
        )
    }

    #[test]
    fn new_request_starts_pending_with_deadline() {
        let req = pending_request();
        assert_eq!(req.status, RequestStatus::Pending);
        assert!(req.resolution.is_none());
        assert!(req.expires_at > req.created_at);
        assert!(!req.is_expired());
    }

    #[test]
    fn commit_records_resolution_and_audit_trail() {
        let mut req = pending_request();
        let resolution = Resolution::new(RequestStatus::Approved, Some(serde_json::json!({"reason": "ok"})))
            .with_responder("alice");
        req.commit(resolution).unwrap();

        assert_eq!(req.status, RequestStatus::Approved);
        assert_eq!(req.transitions.len(), 1);
        assert_eq!(req.transitions[0].from, RequestStatus::Pending);
        assert_eq!(req.transitions[0].to, RequestStatus::Approved);
        let resolution = req.resolution.as_ref().unwrap();
        assert_eq!(resolution.responded_by.as_deref(), Some("alice"));
    }

    #[test]
    fn second_commit_is_rejected() {
        let mut req = pending_request();
        req.commit(Resolution::timed_out()).unwrap();

        let err = req.commit(Resolution::cancelled()).unwrap_err();
        assert!(matches!(err, StoreError::AlreadyTerminal { .. }));
        assert_eq!(req.status, RequestStatus::Expired);
    }

    #[test]
    fn commit_with_pending_status_is_invalid() {
        let mut req = pending_request();
        let err = req
            .commit(Resolution::new(RequestStatus::Pending, None))
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[test]
    fn synthetic_resolutions_carry_terminal_statuses() {
        assert_eq!(Resolution::timed_out().status, RequestStatus::Expired);
        assert_eq!(Resolution::cancelled().status, RequestStatus::Cancelled);
        let failed = Resolution::failed("smtp down");
        assert_eq!(failed.status, RequestStatus::Failed);
        assert_eq!(failed.response.unwrap()["reason"], "smtp down");
    }

    #[test]
    fn request_round_trips_through_serde() {
        let req = pending_request();
        let json = serde_json::to_string(&req).unwrap();
        let back: HumanLoopRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, req.id);
        assert_eq!(back.kind, RequestKind::Approval);
        assert_eq!(back.timeout, req.timeout);
    }
}
