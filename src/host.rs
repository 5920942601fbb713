//! Host-engine boundary for checkpointed execution engines.
//!
//! A graph engine that checkpoints and replays (rather than parking a
//! task) integrates through two hooks: [`suspend`] hands it an opaque,
//! serializable marker for a pending request to stash in its checkpoint,
//! and [`apply_external_resume`] maps the replayed human answer back onto
//! the request. The engine's checkpoint/replay mechanics stay entirely on
//! its side of this boundary.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ManagerError;
use crate::manager::HumanLoopManager;
use crate::provider::{Decision, ProviderResolution};
use crate::request::{HumanLoopRequest, RequestId, StoreError};

// ============================================================================
// Suspend Marker
// ============================================================================

/// Opaque marker for a pending request, fit for embedding in a host
/// engine's checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspendMarker {
    /// The pending request the marker stands for
    pub request_id: RequestId,
    /// The request's logical task name
    pub task_id: String,
    /// When the marker was issued
    pub issued_at: DateTime<Utc>,
}

/// Issues a suspend marker for a still-pending request.
///
/// # Errors
///
/// Fails with [`StoreError::AlreadyTerminal`] if the request has already
/// resolved; there is nothing left to suspend on.
pub fn suspend(
    manager: &HumanLoopManager,
    request_id: &RequestId,
) -> Result<SuspendMarker, ManagerError> {
    let record = manager.get(request_id)?;
    if record.status.is_terminal() {
        return Err(ManagerError::Store(StoreError::AlreadyTerminal {
            id: record.id.clone(),
            status: record.status,
        }));
    }
    Ok(SuspendMarker {
        request_id: record.id.clone(),
        task_id: record.task_id.clone(),
        issued_at: Utc::now(),
    })
}

// ============================================================================
// External Resume
// ============================================================================

/// The human answer a host engine replays at its resume point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumePayload {
    /// The approval verdict; absent for plain completions
    /// (information/conversation answers)
    pub approved: Option<bool>,
    /// Free-form response payload
    pub response: Option<serde_json::Value>,
    /// Who answered, when known
    pub responded_by: Option<String>,
}

impl ResumePayload {
    /// An approval verdict.
    #[must_use]
    pub fn approval(approved: bool) -> Self {
        Self {
            approved: Some(approved),
            response: None,
            responded_by: None,
        }
    }

    /// A plain completion carrying the given payload.
    #[must_use]
    pub fn completion(response: serde_json::Value) -> Self {
        Self {
            approved: None,
            response: Some(response),
            responded_by: None,
        }
    }

    /// Attaches the response payload.
    #[must_use]
    pub fn with_response(mut self, response: serde_json::Value) -> Self {
        self.response = Some(response);
        self
    }

    /// Attaches the responder identity.
    #[must_use]
    pub fn with_responder(mut self, responded_by: impl Into<String>) -> Self {
        self.responded_by = Some(responded_by.into());
        self
    }
}

/// Applies a replayed human answer to the marker's request.
///
/// First-writer-wins like every other resolution path: if the request
/// already resolved (e.g. it expired while the checkpoint sat idle), the
/// earlier outcome stands and this returns the store error.
pub fn apply_external_resume(
    manager: &HumanLoopManager,
    marker: &SuspendMarker,
    payload: ResumePayload,
) -> Result<Arc<HumanLoopRequest>, ManagerError> {
    let decision = match payload.approved {
        Some(true) => Decision::Approved,
        Some(false) => Decision::Rejected,
        None => Decision::Completed,
    };
    let mut resolution = ProviderResolution::new(decision, payload.response);
    resolution.responded_by = payload.responded_by;
    manager.resolve(&marker.request_id, resolution)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerConfig;
    use crate::manager::AskSpec;
    use crate::provider::MockProvider;
    use crate::request::RequestStatus;

    async fn manager_with_silent_provider() -> HumanLoopManager {
        let manager = HumanLoopManager::new(ManagerConfig::default());
        manager
            .register_provider(Arc::new(MockProvider::silent("mock")))
            .unwrap();
        manager
    }

    #[tokio::test]
    async fn suspend_and_resume_round_trip() {
        let manager = manager_with_silent_provider().await;
        let handle = manager
            .request_approval(AskSpec::new().task_id("checkpointed"))
            .await
            .unwrap();
        let id = handle.id().clone();

        let marker = suspend(&manager, &id).unwrap();
        assert_eq!(marker.request_id, id);
        assert_eq!(marker.task_id, "checkpointed");

        // The marker survives a serialization round trip, as a checkpoint
        // would subject it to.
        let json = serde_json::to_string(&marker).unwrap();
        let marker: SuspendMarker = serde_json::from_str(&json).unwrap();

        let record = apply_external_resume(
            &manager,
            &marker,
            ResumePayload::approval(true)
                .with_response(serde_json::json!({"reason": "lgtm"}))
                .with_responder("reviewer"),
        )
        .unwrap();
        assert_eq!(record.status, RequestStatus::Approved);

        let resolution = handle.wait().await.unwrap();
        assert_eq!(resolution.status, RequestStatus::Approved);
        assert_eq!(resolution.responded_by.as_deref(), Some("reviewer"));
    }

    #[tokio::test]
    async fn resume_with_denial_rejects() {
        let manager = manager_with_silent_provider().await;
        let handle = manager.request_approval(AskSpec::new()).await.unwrap();
        let marker = suspend(&manager, handle.id()).unwrap();

        let record =
            apply_external_resume(&manager, &marker, ResumePayload::approval(false)).unwrap();
        assert_eq!(record.status, RequestStatus::Rejected);
    }

    #[tokio::test]
    async fn resume_without_verdict_completes_information() {
        let manager = manager_with_silent_provider().await;
        let handle = manager
            .request_information(AskSpec::new())
            .await
            .unwrap();
        let marker = suspend(&manager, handle.id()).unwrap();

        let record = apply_external_resume(
            &manager,
            &marker,
            ResumePayload::completion(serde_json::json!({"answer": 42})),
        )
        .unwrap();
        assert_eq!(record.status, RequestStatus::Completed);
        assert_eq!(
            record.resolution.as_ref().unwrap().response.as_ref().unwrap()["answer"],
            42
        );
    }

    #[tokio::test]
    async fn suspend_refuses_terminal_requests() {
        let manager = manager_with_silent_provider().await;
        let handle = manager.request_approval(AskSpec::new()).await.unwrap();
        let id = handle.id().clone();
        manager.cancel(&id).await.unwrap();

        let err = suspend(&manager, &id).unwrap_err();
        assert!(matches!(
            err,
            ManagerError::Store(StoreError::AlreadyTerminal { .. })
        ));
    }

    #[tokio::test]
    async fn late_resume_loses_to_the_earlier_outcome() {
        let manager = manager_with_silent_provider().await;
        let handle = manager.request_approval(AskSpec::new()).await.unwrap();
        let marker = suspend(&manager, handle.id()).unwrap();
        manager.cancel(handle.id()).await.unwrap();

        let err =
            apply_external_resume(&manager, &marker, ResumePayload::approval(true)).unwrap_err();
        assert!(matches!(
            err,
            ManagerError::Store(StoreError::AlreadyTerminal { .. })
        ));
        assert_eq!(
            manager.get(&marker.request_id).unwrap().status,
            RequestStatus::Cancelled
        );
    }
}
