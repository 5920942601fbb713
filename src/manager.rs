//! Human-loop manager: provider registry, request dispatch, and status
//! resolution.
//!
//! One manager owns the request store, the receipt table, and the sweep
//! scheduler for its lifetime. There is no ambient global instance:
//! construct a manager, wrap it in an `Arc`, and hand it to every
//! call site explicitly.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ManagerConfig;
use crate::error::ManagerError;
use crate::provider::{
    ConversationTurn, HumanLoopProvider, ProviderAsk, ProviderResolution,
};
use crate::request::{
    Conversation, ConversationId, HumanLoopRequest, RequestId, RequestKind, RequestStore,
    Resolution,
};
use crate::scheduler::{ReceiptEntry, ReceiptTable, SweepScheduler};

// ============================================================================
// Resolution Hook
// ============================================================================

/// Observer invoked exactly once per request, when its terminal
/// resolution commits: whichever of the sweep, a push resolution, a
/// cancellation, or a failed dispatch got there first.
pub type ResolutionHook = Arc<dyn Fn(&HumanLoopRequest, &Resolution) + Send + Sync>;

// ============================================================================
// Ask Spec
// ============================================================================

/// Per-request parameters for the `request_*` calls.
#[derive(Debug, Clone, Default)]
pub struct AskSpec {
    /// Logical task name; generated when absent
    pub task_id: Option<String>,
    /// Provider to carry the ask; first capable registered provider when
    /// absent
    pub provider_id: Option<String>,
    /// Opaque payload passed through to the provider
    pub metadata: serde_json::Value,
    /// Response budget; the manager default when absent
    pub timeout: Option<Duration>,
}

impl AskSpec {
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

    /// Routes the ask to a named provider.
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
}

// ============================================================================
// Request Handle
// ============================================================================

/// Caller-side handle to one in-flight request.
///
/// Both wait styles consume the handle, so the terminal resolution is
/// observed exactly once by construction. The record itself stays
/// available through [`HumanLoopManager::get`] afterwards.
#[derive(Debug)]
pub struct RequestHandle {
    id: RequestId,
    task_id: String,
    kind: RequestKind,
    store: Arc<RequestStore>,
    rx: oneshot::Receiver<Resolution>,
}

impl RequestHandle {
    /// The request id.
    #[must_use]
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// The logical task name.
    #[must_use]
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// The request kind.
    #[must_use]
    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    /// A point-in-time snapshot of the request record.
    pub fn snapshot(&self) -> Result<Arc<HumanLoopRequest>, ManagerError> {
        Ok(self.store.get(&self.id)?)
    }

    /// Suspends until the request resolves, for cooperative callers.
    pub async fn wait(self) -> Result<Resolution, ManagerError> {
        match self.rx.await {
            Ok(resolution) => Ok(resolution),
            Err(_) => Self::recover(&self.store, &self.id),
        }
    }

    /// Parks the calling thread until the request resolves.
    ///
    /// For synchronous callers only; must not be called from an async
    /// context (use [`RequestHandle::wait`] there).
    pub fn wait_blocking(self) -> Result<Resolution, ManagerError> {
        match self.rx.blocking_recv() {
            Ok(resolution) => Ok(resolution),
            Err(_) => Self::recover(&self.store, &self.id),
        }
    }

    /// Fallback when the waiter channel died under us: the record may
    /// still carry the resolution (e.g. committed just before a prune).
    fn recover(store: &RequestStore, id: &RequestId) -> Result<Resolution, ManagerError> {
        match store.get(id) {
            Ok(record) => record.resolution.clone().ok_or(ManagerError::ShutDown),
            Err(_) => Err(ManagerError::ShutDown),
        }
    }
}

// ============================================================================
// Manager
// ============================================================================

struct ProviderEntry {
    /// Registration sequence; selection order when no provider is named
    seq: usize,
    provider: Arc<dyn HumanLoopProvider>,
}

/// Orchestrates providers, requests, and the sweep scheduler.
pub struct HumanLoopManager {
    config: ManagerConfig,
    providers: DashMap<String, ProviderEntry>,
    next_seq: AtomicUsize,
    store: Arc<RequestStore>,
    receipts: Arc<ReceiptTable>,
    hook: Option<ResolutionHook>,
    shutdown_token: CancellationToken,
    sweep_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl HumanLoopManager {
    /// Creates a manager with the given configuration.
    ///
    /// Call [`HumanLoopManager::start`] to begin sweeping; until then,
    /// timeouts and pull-style resolutions are not detected.
    #[must_use]
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            config,
            providers: DashMap::new(),
            next_seq: AtomicUsize::new(0),
            store: Arc::new(RequestStore::new()),
            receipts: Arc::new(ReceiptTable::new()),
            hook: None,
            shutdown_token: CancellationToken::new(),
            sweep_task: tokio::sync::Mutex::new(None),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    /// Installs a resolution observer.
    ///
    /// Must be set before [`HumanLoopManager::start`].
    #[must_use]
    pub fn with_resolution_hook(mut self, hook: ResolutionHook) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Registers a provider.
    ///
    /// Registration order doubles as the selection order for requests
    /// that don't name a provider.
    pub fn register_provider(
        &self,
        provider: Arc<dyn HumanLoopProvider>,
    ) -> Result<(), ManagerError> {
        let name = provider.name().to_string();
        match self.providers.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(ManagerError::DuplicateProviderName { name })
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                slot.insert(ProviderEntry { seq, provider });
                info!(provider = %name, "registered provider");
                Ok(())
            }
        }
    }

    /// Spawns the sweep scheduler. Idempotent.
    pub async fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let scheduler = SweepScheduler::new(
            self.store.clone(),
            self.receipts.clone(),
            self.hook.clone(),
            self.config.check_interval,
            self.shutdown_token.clone(),
        );
        let handle = tokio::spawn(async move { scheduler.run().await });
        *self.sweep_task.lock().await = Some(handle);
    }

    /// Stops the scheduler, withdraws in-flight asks, and cancels pending
    /// requests so no waiter hangs. Idempotent.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown_token.cancel();
        if let Some(handle) = self.sweep_task.lock().await.take() {
            let _ = handle.await;
        }

        // Best-effort withdrawal of every delivered ask.
        let entries: Vec<(RequestId, Arc<dyn HumanLoopProvider>, crate::provider::Receipt)> = self
            .receipts
            .iter()
            .map(|e| (e.key().clone(), e.provider.clone(), e.receipt.clone()))
            .collect();
        for (id, provider, receipt) in entries {
            self.receipts.remove(&id);
            if let Err(e) = provider.cancel(&receipt).await {
                warn!(request_id = %id, provider = provider.name(), error = %e, "failed to withdraw ask during shutdown");
            }
        }

        // Resolve whatever is still pending so handles don't wait forever.
        let mut cancelled = 0;
        for record in self.store.pending_requests() {
            let resolution = Resolution::cancelled().with_responder("shutdown");
            if self.commit_resolution(&record.id, resolution).is_ok() {
                cancelled += 1;
            }
        }
        info!(cancelled, "manager shut down");
    }

    /// Requests a human approval decision.
    pub async fn request_approval(&self, spec: AskSpec) -> Result<RequestHandle, ManagerError> {
        self.submit_request(RequestKind::Approval, None, spec).await
    }

    /// Requests free-form information from a human.
    pub async fn request_information(&self, spec: AskSpec) -> Result<RequestHandle, ManagerError> {
        self.submit_request(RequestKind::Information, None, spec).await
    }

    /// Creates or continues a conversation with one more turn.
    ///
    /// Prior turns of the conversation are threaded into the ask so the
    /// reviewer sees context.
    pub async fn request_conversation(
        &self,
        conversation_id: &ConversationId,
        spec: AskSpec,
    ) -> Result<RequestHandle, ManagerError> {
        self.submit_request(
            RequestKind::Conversation,
            Some(conversation_id.clone()),
            spec,
        )
        .await
    }

    async fn submit_request(
        &self,
        kind: RequestKind,
        conversation_id: Option<ConversationId>,
        spec: AskSpec,
    ) -> Result<RequestHandle, ManagerError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ManagerError::ShutDown);
        }

        let provider = self.select_provider(spec.provider_id.as_deref(), kind)?;
        let task_id = spec
            .task_id
            .unwrap_or_else(|| format!("task-{}", nanoid::nanoid!(8)));
        let timeout = spec.timeout.unwrap_or(self.config.default_timeout);

        // History is collected before the new turn exists, so it holds
        // exactly the prior turns.
        let history = match &conversation_id {
            Some(cid) => self.turn_history(cid),
            None => Vec::new(),
        };

        let record = HumanLoopRequest::new(
            task_id,
            kind,
            conversation_id,
            provider.name(),
            spec.metadata,
            timeout,
        );
        let (record, rx) = self.store.create(record)?;

        let ask = ProviderAsk {
            request_id: record.id.clone(),
            task_id: record.task_id.clone(),
            kind,
            conversation_id: record.conversation_id.clone(),
            metadata: record.metadata.clone(),
            history,
            created_at: record.created_at,
            expires_at: record.expires_at,
        };

        match provider.submit(&ask).await {
            Ok(receipt) => {
                self.receipts.insert(
                    record.id.clone(),
                    ReceiptEntry {
                        provider: provider.clone(),
                        receipt,
                    },
                );
                info!(
                    request_id = %record.id,
                    task_id = %record.task_id,
                    kind = %kind,
                    provider = provider.name(),
                    "dispatched request"
                );
                Ok(RequestHandle {
                    id: record.id.clone(),
                    task_id: record.task_id.clone(),
                    kind,
                    store: self.store.clone(),
                    rx,
                })
            }
            Err(e) => {
                warn!(
                    request_id = %record.id,
                    provider = provider.name(),
                    error = %e,
                    "provider could not deliver the request"
                );
                let resolution = Resolution::failed(e.to_string());
                let _ = self.commit_resolution(&record.id, resolution);
                Err(ManagerError::ProviderUnavailable {
                    provider: provider.name().to_string(),
                    source: e,
                })
            }
        }
    }

    /// Applies a channel-reported resolution to a request.
    ///
    /// The entry point for push-style providers (a webhook handler calls
    /// this with the platform's answer) and for external resume payloads.
    pub fn resolve(
        &self,
        id: &RequestId,
        resolution: ProviderResolution,
    ) -> Result<Arc<HumanLoopRequest>, ManagerError> {
        let record = self.store.get(id)?;
        let resolution = resolution.into_resolution(record.kind);
        let record = self.commit_resolution(id, resolution)?;
        Ok(record)
    }

    /// Cancels a pending request and withdraws its ask, best-effort.
    ///
    /// A no-op returning the current record if the request is already
    /// terminal. A resolution that raced in first wins, and repeated
    /// cancellation is harmless.
    pub async fn cancel(&self, id: &RequestId) -> Result<Arc<HumanLoopRequest>, ManagerError> {
        let record = self.store.get(id)?;
        if record.status.is_terminal() {
            return Ok(record);
        }

        let record = match self.commit_resolution(id, Resolution::cancelled()) {
            Ok(record) => record,
            // Lost the race to another terminal writer; that writer wins.
            Err(ManagerError::Store(crate::request::StoreError::AlreadyTerminal { .. })) => {
                return Ok(self.store.get(id)?);
            }
            Err(e) => return Err(e),
        };

        if let Some((_, entry)) = self.receipts.remove(id) {
            if let Err(e) = entry.provider.cancel(&entry.receipt).await {
                warn!(request_id = %id, provider = entry.provider.name(), error = %e, "failed to withdraw cancelled ask");
            }
        }
        info!(request_id = %id, "request cancelled");
        Ok(record)
    }

    /// Gets a request record by id.
    pub fn get(&self, id: &RequestId) -> Result<Arc<HumanLoopRequest>, ManagerError> {
        Ok(self.store.get(id)?)
    }

    /// Gets a conversation snapshot by id.
    #[must_use]
    pub fn conversation(&self, id: &ConversationId) -> Option<Conversation> {
        self.store.conversation(id)
    }

    /// Number of pending requests.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.store.pending_count()
    }

    /// Removes terminal records older than the configured grace period.
    pub fn prune(&self) -> usize {
        self.store.prune_terminal(self.config.terminal_grace_period)
    }

    /// Commits a terminal resolution and fires the resolution hook.
    fn commit_resolution(
        &self,
        id: &RequestId,
        resolution: Resolution,
    ) -> Result<Arc<HumanLoopRequest>, ManagerError> {
        let record = self.store.commit(id, resolution.clone())?;
        self.receipts.remove(id);
        if let Some(hook) = &self.hook {
            hook(&record, &resolution);
        }
        Ok(record)
    }

    fn select_provider(
        &self,
        provider_id: Option<&str>,
        kind: RequestKind,
    ) -> Result<Arc<dyn HumanLoopProvider>, ManagerError> {
        match provider_id {
            Some(name) => {
                let entry = self
                    .providers
                    .get(name)
                    .ok_or_else(|| ManagerError::UnknownProvider {
                        name: name.to_string(),
                    })?;
                if !entry.provider.supports(kind) {
                    return Err(ManagerError::NoCapableProvider { kind });
                }
                Ok(entry.provider.clone())
            }
            None => self
                .providers
                .iter()
                .filter(|entry| entry.provider.supports(kind))
                .min_by_key(|entry| entry.seq)
                .map(|entry| entry.provider.clone())
                .ok_or(ManagerError::NoCapableProvider { kind }),
        }
    }

    fn turn_history(&self, conversation_id: &ConversationId) -> Vec<ConversationTurn> {
        self.store
            .conversation_turns(conversation_id)
            .into_iter()
            .map(|turn| ConversationTurn {
                request_id: turn.id.clone(),
                metadata: turn.metadata.clone(),
                response: turn
                    .resolution
                    .as_ref()
                    .and_then(|resolution| resolution.response.clone()),
                responded_at: turn
                    .resolution
                    .as_ref()
                    .map(|resolution| resolution.responded_at),
            })
            .collect()
    }
}

// ============================================================================
// Tests
// ============================================================================
