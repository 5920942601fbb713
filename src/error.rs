//! Manager-level errors.

use thiserror::Error;

use crate::provider::ProviderError;
use crate::request::{RequestKind, StoreError};

// ============================================================================
// Manager Errors
// ============================================================================

/// Errors from [`crate::manager::HumanLoopManager`] operations.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// No registered provider advertises the requested capability.
    ///
    /// A configuration error; fails fast at call time.
    #[error("no registered provider supports {kind} requests")]
    NoCapableProvider {
        /// The capability nobody advertises
        kind: RequestKind,
    },

    /// A provider with this name is already registered.
    #[error("provider '{name}' is already registered")]
    DuplicateProviderName {
        /// The colliding name
        name: String,
    },

    /// The caller named a provider that is not registered.
    #[error("unknown provider '{name}'")]
    UnknownProvider {
        /// The unknown name
        name: String,
    },

    /// The selected provider could not deliver the ask.
    ///
    /// The request is committed `Failed`; delivery is never retried
    /// automatically.
    #[error("provider '{provider}' could not deliver the request")]
    ProviderUnavailable {
        /// The provider that failed
        provider: String,
        /// The underlying channel error
        #[source]
        source: ProviderError,
    },

    /// A request store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The manager has been shut down.
    #[error("manager is shut down")]
    ShutDown,
}
