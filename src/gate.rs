//! Suspend/resume gate: wraps a callable so that invoking it blocks on a
//! human response and re-enters with the resolution injected.
//!
//! The wrap is explicit: build a gate from a manager, wrap the target
//! function once, and call the wrapper wherever the bare function was
//! called before:
//!
//! ```ignore
//! let gate = HumanGate::new(manager).with_default_timeout(Duration::from_secs(300));
//! let transfer = gate.require_approval(
//!     GateSpec::new().task_id("transfer-funds").execute_on_reject(true),
//!     |amount: u64, resolution| async move {
//!         if resolution.status == RequestStatus::Approved {
//!             format!("transferred {amount}")
//!         } else {
//!             format!("held {amount}")
//!         }
//!     },
//! );
//! let outcome = transfer.call(100).await?;
//! ```
//!
//! Exactly one human-facing ask is issued per invocation of the wrapper;
//! retry, if wanted, is the caller's job via re-invocation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::error::ManagerError;
use crate::manager::{AskSpec, HumanLoopManager};
use crate::request::{ConversationId, RequestStatus, Resolution};

// ============================================================================
// Gate Spec
// ============================================================================

/// Per-wrap parameters.
#[derive(Debug, Clone, Default)]
pub struct GateSpec {
    /// Logical task name; generated per call when absent
    pub task_id: Option<String>,
    /// Provider to carry the ask; first capable when absent
    pub provider_id: Option<String>,
    /// Opaque payload passed through to the provider
    pub metadata: serde_json::Value,
    /// Response budget; the gate default, then the manager default
    pub timeout: Option<Duration>,
    /// Whether the wrapped function still runs on a rejection, with the
    /// rejection injected so it can branch itself
    pub execute_on_reject: bool,
}

impl GateSpec {
    /// Creates an empty spec.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the logical task name.
    #[must_use]
    pub fn task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    /// Routes asks to a named provider.
    #[must_use]
    pub fn provider(mut self, provider_id: impl Into<String>) -> Self {
        self.provider_id = Some(provider_id.into());
        self
    }

    /// Attaches an opaque payload for the provider.
    #[must_use]
    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Overrides the response budget.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Runs the wrapped function on rejection too.
    #[must_use]
    pub fn execute_on_reject(mut self, execute: bool) -> Self {
        self.execute_on_reject = execute;
        self
    }

    fn to_ask(&self, default_timeout: Option<Duration>) -> AskSpec {
        AskSpec {
            task_id: self.task_id.clone(),
            provider_id: self.provider_id.clone(),
            metadata: self.metadata.clone(),
            timeout: self.timeout.or(default_timeout),
        }
    }
}

// ============================================================================
// Gate Outcome & Errors
// ============================================================================

/// What a gated call produced.
#[derive(Debug)]
pub enum GateOutcome<R> {
    /// The wrapped function ran; its return value
    Executed(R),
    /// Rejected without execution (`execute_on_reject` was off)
    Rejected(Resolution),
}

impl<R> GateOutcome<R> {
    /// Unwraps the executed value, if the function ran.
    pub fn into_executed(self) -> Option<R> {
        match self {
            Self::Executed(value) => Some(value),
            Self::Rejected(_) => None,
        }
    }
}

/// Signaled failures of a gated call. The wrapped function never runs on
/// any of these.
#[derive(Debug, Error)]
pub enum GateError {
    /// The request expired before a human responded.
    #[error("request expired before a human responded")]
    Expired(Resolution),

    /// The request was cancelled while waiting.
    #[error("request was cancelled")]
    Cancelled(Resolution),

    /// The channel failed to carry or resolve the request.
    #[error("request failed in the channel")]
    Failed(Resolution),

    /// Creating or waiting on the request failed.
    #[error(transparent)]
    Manager(#[from] ManagerError),
}

/// Routes a terminal resolution to the caller-visible outcome shared by
/// all gate kinds: run on affirmative statuses, maybe run on rejection,
/// signal the rest.
async fn dispatch<C, R, F, Fut>(
    f: &F,
    ctx: C,
    resolution: Resolution,
    execute_on_reject: bool,
) -> Result<GateOutcome<R>, GateError>
where
    F: Fn(C, Resolution) -> Fut,
    Fut: Future<Output = R>,
{
    match resolution.status {
        RequestStatus::Approved | RequestStatus::Completed => {
            Ok(GateOutcome::Executed(f(ctx, resolution).await))
        }
        RequestStatus::Rejected if execute_on_reject => {
            Ok(GateOutcome::Executed(f(ctx, resolution).await))
        }
        RequestStatus::Rejected => {
            debug!("rejection short-circuits the wrapped function");
            Ok(GateOutcome::Rejected(resolution))
        }
        RequestStatus::Expired => Err(GateError::Expired(resolution)),
        RequestStatus::Cancelled => Err(GateError::Cancelled(resolution)),
        RequestStatus::Failed | RequestStatus::Pending => Err(GateError::Failed(resolution)),
    }
}

// ============================================================================
// Human Gate
// ============================================================================

/// Factory for gated callables bound to one manager.
#[derive(Clone)]
pub struct HumanGate {
    manager: Arc<HumanLoopManager>,
    default_timeout: Option<Duration>,
}

impl HumanGate {
    /// Creates a gate over the given manager.
    #[must_use]
    pub fn new(manager: Arc<HumanLoopManager>) -> Self {
        Self {
            manager,
            default_timeout: None,
        }
    }

    /// Sets a timeout applied to every wrap that doesn't set its own.
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    /// Wraps `f` behind a human approval.
    pub fn require_approval<F>(&self, spec: GateSpec, f: F) -> ApprovalGate<F> {
        ApprovalGate {
            manager: self.manager.clone(),
            spec,
            default_timeout: self.default_timeout,
            f,
        }
    }

    /// Wraps `f` behind a human-supplied answer.
    pub fn require_information<F>(&self, spec: GateSpec, f: F) -> InformationGate<F> {
        InformationGate {
            manager: self.manager.clone(),
            spec,
            default_timeout: self.default_timeout,
            f,
        }
    }

    /// Wraps `f` behind one conversation turn per call.
    ///
    /// Every call appends a turn; the manager replays the accumulated
    /// turn history into each new ask so the reviewer sees context.
    pub fn require_conversation<F>(
        &self,
        conversation_id: impl Into<ConversationId>,
        spec: GateSpec,
        f: F,
    ) -> ConversationGate<F> {
        ConversationGate {
            manager: self.manager.clone(),
            conversation_id: conversation_id.into(),
            spec,
            default_timeout: self.default_timeout,
            f,
        }
    }
}

// ============================================================================
// Gated Callables
// ============================================================================

/// A callable gated behind an approval decision.
pub struct ApprovalGate<F> {
    manager: Arc<HumanLoopManager>,
    spec: GateSpec,
    default_timeout: Option<Duration>,
    f: F,
}

impl<F> ApprovalGate<F> {
    /// Issues one approval ask, waits for the decision, and re-enters the
    /// wrapped function per the gate contract.
    pub async fn call<C, R, Fut>(&self, ctx: C) -> Result<GateOutcome<R>, GateError>
    where
        F: Fn(C, Resolution) -> Fut,
        Fut: Future<Output = R>,
    {
        let handle = self
            .manager
            .request_approval(self.spec.to_ask(self.default_timeout))
            .await?;
        let resolution = handle.wait().await?;
        dispatch(&self.f, ctx, resolution, self.spec.execute_on_reject).await
    }
}

/// A callable gated behind a human-supplied answer.
pub struct InformationGate<F> {
    manager: Arc<HumanLoopManager>,
    spec: GateSpec,
    default_timeout: Option<Duration>,
    f: F,
}

impl<F> InformationGate<F> {
    /// Issues one information ask, waits for the answer, and re-enters
    /// the wrapped function with it.
    pub async fn call<C, R, Fut>(&self, ctx: C) -> Result<GateOutcome<R>, GateError>
    where
        F: Fn(C, Resolution) -> Fut,
        Fut: Future<Output = R>,
    {
        let handle = self
            .manager
            .request_information(self.spec.to_ask(self.default_timeout))
            .await?;
        let resolution = handle.wait().await?;
        dispatch(&self.f, ctx, resolution, self.spec.execute_on_reject).await
    }
}

/// A callable gated behind one conversation turn per call.
pub struct ConversationGate<F> {
    manager: Arc<HumanLoopManager>,
    conversation_id: ConversationId,
    spec: GateSpec,
    default_timeout: Option<Duration>,
    f: F,
}

impl<F> ConversationGate<F> {
    /// The conversation this gate appends to.
    #[must_use]
    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// Appends one turn, waits for the reply, and re-enters the wrapped
    /// function with it.
    pub async fn call<C, R, Fut>(&self, ctx: C) -> Result<GateOutcome<R>, GateError>
    where
        F: Fn(C, Resolution) -> Fut,
        Fut: Future<Output = R>,
    {
        let handle = self
            .manager
            .request_conversation(&self.conversation_id, self.spec.to_ask(self.default_timeout))
            .await?;
        let resolution = handle.wait().await?;
        dispatch(&self.f, ctx, resolution, self.spec.execute_on_reject).await
    }
}

// ============================================================================
// Tests
// ============================================================================
