//! Request and conversation model: identity, lifecycle state machine, and
//! the concurrency-safe store.

pub mod error;
pub mod status;
pub mod store;
pub mod types;

pub use error::StoreError;
pub use status::RequestStatus;
pub use store::RequestStore;
pub use types::{
    Conversation, ConversationId, HumanLoopRequest, RequestId, RequestKind, RequestTransition,
    Resolution, REQUEST_ID_BODY_LENGTH, REQUEST_ID_PREFIX,
};
