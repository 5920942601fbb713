//! Request store errors.

use thiserror::Error;

use super::status::RequestStatus;
use super::types::{ConversationId, RequestId};

// ============================================================================
// Store Errors
// ============================================================================

/// Errors from request store operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No request with the given id exists.
    #[error("request '{id}' not found")]
    NotFound {
        /// The request id that was not found
        id: RequestId,
    },

    /// A request with the given id already exists.
    ///
    /// Should not occur with generated ids; indicates a programmer error.
    #[error("request '{id}' already exists")]
    DuplicateId {
        /// The colliding request id
        id: RequestId,
    },

    /// The request is already in a terminal state.
    #[error("request '{id}' is already terminal ({status})")]
    AlreadyTerminal {
        /// The request id
        id: RequestId,
        /// The terminal status it holds
        status: RequestStatus,
    },

    /// Attempted status transition violates the state machine.
    ///
    /// Indicates a bug in the caller; never swallowed.
    #[error("invalid transition for request '{id}': {from} -> {to}")]
    InvalidTransition {
        /// The request id
        id: RequestId,
        /// Current status
        from: RequestStatus,
        /// Attempted new status
        to: RequestStatus,
    },

    /// The conversation is closed; no further turns may be appended.
    #[error("conversation '{conversation_id}' is closed")]
    ConversationClosed {
        /// The closed conversation
        conversation_id: ConversationId,
    },

    /// The request did not reach a terminal state within the wait budget.
    #[error("request '{id}' is still pending")]
    ResultNotReady {
        /// The request id
        id: RequestId,
    },
}
