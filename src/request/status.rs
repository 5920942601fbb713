//! Request lifecycle status and state machine.

use serde::{Deserialize, Serialize};

// ============================================================================
// Request Status
// ============================================================================

/// Lifecycle status of a human-loop request.
///
/// State machine transitions:
/// - Pending → Approved (approval granted)
/// - Pending → Rejected (approval denied)
/// - Pending → Completed (information/conversation turn answered)
/// - Pending → Expired (timeout elapsed without a response)
/// - Pending → Cancelled (caller withdrew the request)
/// - Pending → Failed (channel could not deliver or resolve the request)
///
/// Every status except `Pending` is terminal and immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Awaiting a human response
    Pending,
    /// Human approved the request
    Approved,
    /// Human rejected the request
    Rejected,
    /// Human supplied the requested information or conversation reply
    Completed,
    /// Timeout elapsed without a response
    Expired,
    /// Request was cancelled before resolution
    Cancelled,
    /// The channel failed to deliver or resolve the request
    Failed,
}

impl RequestStatus {
    /// Returns true if this is a terminal state.
    ///
    /// Terminal states are immutable: once reached, the request's
    /// resolution is fixed for the rest of its lifetime in the store.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Checks if a transition from this status to another is valid.
    ///
    /// The only valid transitions are `Pending` → any terminal state.
    #[must_use]
    pub fn can_transition_to(&self, to: RequestStatus) -> bool {
        matches!(self, Self::Pending) && to.is_terminal()
    }

    /// Returns true if the status is a negative outcome that closes the
    /// surrounding conversation (no further turns may be appended).
    #[must_use]
    pub fn closes_conversation(&self) -> bool {
        matches!(self, Self::Expired | Self::Cancelled | Self::Failed)
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Approved => write!(f, "approved"),
            Self::Rejected => write!(f, "rejected"),
            Self::Completed => write!(f, "completed"),
            Self::Expired => write!(f, "expired"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
