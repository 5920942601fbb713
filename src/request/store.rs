//! In-memory request store with concurrent access support.
//!
//! The store is the single serialization point for the whole engine: the
//! caller's task, the sweep scheduler, and push-style resolution paths all
//! race toward one atomic per-record terminal commit.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};

use super::error::StoreError;
use super::types::{Conversation, ConversationId, HumanLoopRequest, RequestId, Resolution};

// ============================================================================
// Request Store
// ============================================================================

/// Internal request entry with wait and cleanup bookkeeping.
///
/// Stores `Arc<HumanLoopRequest>` to avoid deep clones on reads. The
/// terminal commit uses `Arc::make_mut`, which copies only while other
/// references are held.
#[derive(Debug)]
struct RequestEntry {
    /// The request record itself
    record: Arc<HumanLoopRequest>,
    /// Notifier for poll-style waiters on this request
    notify: Arc<Notify>,
    /// One-shot channel to the request's handle, consumed at commit time
    waiter: Option<oneshot::Sender<Resolution>>,
    /// When the request became terminal (for grace-period pruning)
    terminal_at: Option<DateTime<Utc>>,
}

/// Concurrency-safe registry of in-flight requests and conversations.
///
/// Keyed by [`RequestId`] with a secondary index by [`ConversationId`].
/// Records are retained after resolution for inspection until
/// [`RequestStore::prune_terminal`] removes them; nothing is deleted
/// implicitly mid-flight.
pub struct RequestStore {
    /// Request storage keyed by id
    requests: DashMap<RequestId, RequestEntry>,
    /// Conversation records keyed by conversation id
    conversations: DashMap<ConversationId, Conversation>,
    /// Counter of pending (non-terminal) requests
    pending_count: AtomicUsize,
}

impl std::fmt::Debug for RequestStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestStore")
            .field("total_count", &self.requests.len())
            .field("pending_count", &self.pending_count.load(Ordering::Acquire))
            .field("conversation_count", &self.conversations.len())
            .finish()
    }
}

impl Default for RequestStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            requests: DashMap::new(),
            conversations: DashMap::new(),
            pending_count: AtomicUsize::new(0),
        }
    }

    /// Returns the number of pending (non-terminal) requests.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending_count.load(Ordering::Acquire)
    }

    /// Returns the total number of retained requests (including terminal).
    #[must_use]
    pub fn total_count(&self) -> usize {
        self.requests.len()
    }

    /// Inserts a new pending request, returning the stored record and the
    /// one-shot receiver its handle will wait on.
    ///
    /// If the request is a conversation turn, the turn is appended to the
    /// conversation's ordered chain; appending to a closed conversation
    /// fails with [`StoreError::ConversationClosed`] and leaves no trace
    /// of the request behind.
    pub fn create(
        &self,
        record: HumanLoopRequest,
    ) -> Result<(Arc<HumanLoopRequest>, oneshot::Receiver<Resolution>), StoreError> {
        let id = record.id.clone();
        let conversation_id = record.conversation_id.clone();
        let record = Arc::new(record);
        let (tx, rx) = oneshot::channel();

        let entry = RequestEntry {
            record: record.clone(),
            notify: Arc::new(Notify::new()),
            waiter: Some(tx),
            terminal_at: None,
        };

        match self.requests.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(StoreError::DuplicateId { id });
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(entry);
            }
        }
        self.pending_count.fetch_add(1, Ordering::AcqRel);

        // Append the turn after the request insert so the two maps are
        // never locked at once. If the conversation closed in between,
        // undo the insert.
        if let Some(cid) = conversation_id {
            let mut conversation = self
                .conversations
                .entry(cid.clone())
                .or_insert_with(|| Conversation::new(cid.clone()));
            if conversation.closed {
                drop(conversation);
                self.requests.remove(&id);
                self.pending_count.fetch_sub(1, Ordering::AcqRel);
                return Err(StoreError::ConversationClosed {
                    conversation_id: cid,
                });
            }
            conversation.turns.push(id);
            conversation.updated_at = Utc::now();
        }

        Ok((record, rx))
    }

    /// Gets a request by id.
    pub fn get(&self, id: &RequestId) -> Result<Arc<HumanLoopRequest>, StoreError> {
        self.requests
            .get(id)
            .map(|entry| entry.record.clone())
            .ok_or_else(|| StoreError::NotFound { id: id.clone() })
    }

    /// Enumerates pending requests ordered by `created_at` ascending, for
    /// deterministic sweep processing.
    #[must_use]
    pub fn pending_requests(&self) -> Vec<Arc<HumanLoopRequest>> {
        let mut pending: Vec<Arc<HumanLoopRequest>> = self
            .requests
            .iter()
            .filter(|entry| !entry.record.status.is_terminal())
            .map(|entry| entry.record.clone())
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        pending
    }

    /// Commits the terminal resolution for a request.
    ///
    /// This is the atomic synchronization point: whichever of the expiry
    /// sweep, a provider poll result, a push resolution, or a cancellation
    /// gets here first wins; every later writer sees
    /// [`StoreError::AlreadyTerminal`]. On success the handle's one-shot
    /// waiter fires exactly once, poll-style waiters are woken, and a
    /// negative terminal closes the surrounding conversation.
    pub fn commit(
        &self,
        id: &RequestId,
        resolution: Resolution,
    ) -> Result<Arc<HumanLoopRequest>, StoreError> {
        let record = {
            let mut entry = self
                .requests
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound { id: id.clone() })?;

            Arc::make_mut(&mut entry.record).commit(resolution.clone())?;
            entry.terminal_at = Some(Utc::now());
            self.pending_count.fetch_sub(1, Ordering::AcqRel);

            if let Some(tx) = entry.waiter.take() {
                // The handle may have been dropped; that loses nothing.
                let _ = tx.send(resolution.clone());
            }
            entry.notify.notify_waiters();
            entry.record.clone()
        };

        if resolution.status.closes_conversation() {
            if let Some(cid) = &record.conversation_id {
                if let Some(mut conversation) = self.conversations.get_mut(cid) {
                    conversation.closed = true;
                    conversation.updated_at = Utc::now();
                }
            }
        }

        Ok(record)
    }

    /// Waits for a request to reach a terminal state.
    ///
    /// The notified future is created before the status check so a commit
    /// between the check and the await cannot be missed; the loop handles
    /// spurious wakeups.
    pub async fn wait_for_terminal(
        &self,
        id: &RequestId,
        timeout: Duration,
    ) -> Result<Arc<HumanLoopRequest>, StoreError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let notify = {
                let entry = self
                    .requests
                    .get(id)
                    .ok_or_else(|| StoreError::NotFound { id: id.clone() })?;
                entry.notify.clone()
            };

            let notified = notify.notified();

            {
                let entry = self
                    .requests
                    .get(id)
                    .ok_or_else(|| StoreError::NotFound { id: id.clone() })?;
                if entry.record.status.is_terminal() {
                    return Ok(entry.record.clone());
                }
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(StoreError::ResultNotReady { id: id.clone() });
            }

            if tokio::time::timeout(deadline - now, notified).await.is_err() {
                let entry = self
                    .requests
                    .get(id)
                    .ok_or_else(|| StoreError::NotFound { id: id.clone() })?;
                if entry.record.status.is_terminal() {
                    return Ok(entry.record.clone());
                }
                return Err(StoreError::ResultNotReady { id: id.clone() });
            }
        }
    }

    /// Returns a snapshot of a conversation record.
    #[must_use]
    pub fn conversation(&self, id: &ConversationId) -> Option<Conversation> {
        self.conversations.get(id).map(|c| c.clone())
    }

    /// Returns the turn records of a conversation, oldest first.
    #[must_use]
    pub fn conversation_turns(&self, id: &ConversationId) -> Vec<Arc<HumanLoopRequest>> {
        let turn_ids = match self.conversations.get(id) {
            Some(conversation) => conversation.turns.clone(),
            None => return Vec::new(),
        };
        turn_ids
            .iter()
            .filter_map(|turn_id| self.requests.get(turn_id).map(|e| e.record.clone()))
            .collect()
    }

    /// Removes terminal requests older than the grace period.
    ///
    /// Returns the number of requests removed. Pruned turn ids are also
    /// dropped from their conversation's chain.
    pub fn prune_terminal(&self, grace_period: Duration) -> usize {
        let now = Utc::now();
        let grace = chrono::Duration::from_std(grace_period).unwrap_or_default();

        let to_remove: Vec<RequestId> = self
            .requests
            .iter()
            .filter_map(|entry| match entry.terminal_at {
                Some(terminal_at) if now - terminal_at > grace => Some(entry.record.id.clone()),
                _ => None,
            })
            .collect();

        let count = to_remove.len();
        for id in to_remove {
            if let Some((_, entry)) = self.requests.remove(&id) {
                if let Some(cid) = &entry.record.conversation_id {
                    if let Some(mut conversation) = self.conversations.get_mut(cid) {
                        conversation.turns.retain(|turn_id| turn_id != &id);
                    }
                }
            }
        }
        count
    }
}

// ============================================================================
// Tests
// ============================================================================
