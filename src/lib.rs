//! Human-in-the-loop orchestration engine.
//!
//! Lets arbitrary function calls pause for human approval, free-form
//! information, or multi-turn conversation, routed through pluggable
//! channels (terminal, remote approval API, anything implementing
//! [`provider::HumanLoopProvider`]), with per-request timeouts, a sweep
//! scheduler for pull-style channels, and resumable execution.
//!
//! # Architecture
//!
//! - [`request`] - request/conversation records, the status state
//!   machine, and the concurrency-safe store
//! - [`provider`] - the channel trait plus terminal, HTTP API, and mock
//!   implementations
//! - [`scheduler`] - the background sweep that expires overdue requests
//!   and polls pull-style channels
//! - [`manager`] - the facade: provider registry, dispatch, resolution
//! - [`gate`] - wraps callables so invocation suspends on the human and
//!   resumes with their answer
//! - [`host`] - suspend-marker/external-resume hooks for checkpointed
//!   execution engines
//!
//! # Example
//!
//! ```no_run
//! use humanloop::{AskSpec, HumanLoopManager, ManagerConfig, TerminalProvider};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = Arc::new(HumanLoopManager::new(ManagerConfig::default()));
//!     manager.register_provider(Arc::new(TerminalProvider::new("terminal")))?;
//!     manager.start().await;
//!
//!     let handle = manager
//!         .request_approval(
//!             AskSpec::new()
//!                 .task_id("delete-account")
//!                 .metadata(serde_json::json!({"account": "acme-corp"})),
//!         )
//!         .await?;
//!     let resolution = handle.wait().await?;
//!     println!("human said: {}", resolution.status);
//!
//!     manager.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod gate;
pub mod host;
pub mod manager;
pub mod provider;
pub mod request;
pub mod scheduler;

pub use config::ManagerConfig;
pub use error::ManagerError;
pub use gate::{GateError, GateOutcome, GateSpec, HumanGate};
pub use host::{apply_external_resume, suspend, ResumePayload, SuspendMarker};
pub use manager::{AskSpec, HumanLoopManager, RequestHandle, ResolutionHook};
pub use provider::{
    ApiConfig, ApiProvider, ConversationTurn, Decision, HumanLoopProvider, MockProvider,
    ProviderAsk, ProviderError, ProviderResolution, Receipt, TerminalProvider,
};
pub use request::{
    Conversation, ConversationId, HumanLoopRequest, RequestId, RequestKind, RequestStatus,
    RequestStore, Resolution, StoreError,
};
