//! Timeout and poll sweep scheduler.
//!
//! One background task per manager runs two duties on a fixed cadence,
//! independent of any individual request's timeout: expiring overdue
//! pending requests, and polling pull-style providers for answers that
//! arrived since the last sweep. Worst-case detection latency for either
//! is bounded by one sweep interval.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::manager::ResolutionHook;
use crate::provider::{HumanLoopProvider, Receipt};
use crate::request::{RequestId, RequestStore, Resolution, StoreError};

// ============================================================================
// Receipt Table
// ============================================================================

/// A delivered ask awaiting a pull-style resolution.
pub(crate) struct ReceiptEntry {
    /// The provider carrying the ask
    pub provider: Arc<dyn HumanLoopProvider>,
    /// The provider's delivery receipt
    pub receipt: Receipt,
}

/// Receipts of in-flight asks, shared between the manager (which inserts
/// on dispatch and drains on shutdown) and the scheduler (which polls).
pub(crate) type ReceiptTable = DashMap<RequestId, ReceiptEntry>;

// ============================================================================
// Sweep Scheduler
// ============================================================================

/// Background sweep loop over the request store.
pub struct SweepScheduler {
    store: Arc<RequestStore>,
    receipts: Arc<ReceiptTable>,
    hook: Option<ResolutionHook>,
    check_interval: Duration,
    shutdown: CancellationToken,
}

impl SweepScheduler {
    pub(crate) fn new(
        store: Arc<RequestStore>,
        receipts: Arc<ReceiptTable>,
        hook: Option<ResolutionHook>,
        check_interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            receipts,
            hook,
            check_interval,
            shutdown,
        }
    }

    /// Runs the sweep loop until the shutdown token is cancelled.
    pub async fn run(&self) {
        info!(
            interval_ms = self.check_interval.as_millis() as u64,
            "sweep scheduler started"
        );

        let mut ticker = tokio::time::interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    break;
                }

                _ = ticker.tick() => {
                    self.sweep().await;
                }
            }
        }

        // One last expiry pass so overdue requests don't outlive the loop.
        self.expire_pass();
        info!("sweep scheduler stopped");
    }

    /// One full pass: expire overdue requests, then poll the rest.
    ///
    /// Expiry runs first so a timeout always beats a late-arriving poll
    /// result for the same request; the store's atomic commit settles any
    /// remaining race.
    pub(crate) async fn sweep(&self) {
        self.expire_pass();
        self.poll_pass().await;
    }

    /// Transitions every pending request past its deadline to expired.
    fn expire_pass(&self) {
        let mut expired = 0;
        for record in self.store.pending_requests() {
            if record.is_expired() {
                self.commit_resolution(&record.id, Resolution::timed_out());
                expired += 1;
            }
        }
        if expired > 0 {
            info!(expired, "expired overdue requests");
        }
    }

    /// Polls the provider of every pending request with a receipt.
    ///
    /// A provider failure is logged and the sweep moves on to the next
    /// candidate; one failing provider never stalls the others.
    async fn poll_pass(&self) {
        for record in self.store.pending_requests() {
            let (provider, receipt) = match self.receipts.get(&record.id) {
                Some(entry) => (entry.provider.clone(), entry.receipt.clone()),
                None => continue,
            };

            match provider.poll(&receipt).await {
                Ok(Some(provider_resolution)) => {
                    let resolution = provider_resolution.into_resolution(record.kind);
                    self.commit_resolution(&record.id, resolution);
                }
                Ok(None) => {
                    debug!(request_id = %record.id, provider = provider.name(), "still pending");
                }
                Err(e) if e.is_retriable() => {
                    warn!(
                        request_id = %record.id,
                        provider = provider.name(),
                        error = %e,
                        "poll failed, retrying next sweep"
                    );
                }
                Err(e) => {
                    warn!(
                        request_id = %record.id,
                        provider = provider.name(),
                        error = %e,
                        "poll failed permanently"
                    );
                    self.commit_resolution(&record.id, Resolution::failed(e.to_string()));
                }
            }
        }
    }

    /// Commits a terminal resolution and fires the resolution hook.
    ///
    /// Losing the commit race to another writer is unremarkable; any
    /// other store failure is an invariant violation and logged loudly.
    fn commit_resolution(&self, id: &RequestId, resolution: Resolution) {
        match self.store.commit(id, resolution.clone()) {
            Ok(record) => {
                self.receipts.remove(id);
                info!(
                    request_id = %id,
                    status = %resolution.status,
                    "request resolved by sweep"
                );
                if let Some(hook) = &self.hook {
                    hook(&record, &resolution);
                }
            }
            Err(StoreError::AlreadyTerminal { .. }) => {
                self.receipts.remove(id);
                debug!(request_id = %id, "request already terminal, sweep result dropped");
            }
            Err(StoreError::NotFound { .. }) => {
                self.receipts.remove(id);
                debug!(request_id = %id, "request pruned mid-sweep");
            }
            Err(e) => {
                error!(request_id = %id, error = %e, "sweep commit failed");
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{MockProvider, ProviderAsk, ProviderError, ProviderResolution};
    use crate::request::{HumanLoopRequest, RequestKind, RequestStatus};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn pending(
        store: &RequestStore,
        provider: &str,
        timeout: Duration,
    ) -> Arc<HumanLoopRequest> {
        let record = HumanLoopRequest::new(
            "task",
            RequestKind::Approval,
            None,
            provider,
            serde_json::json!({}),
            timeout,
        );
        store.create(record).unwrap().0
    }

    async fn register(
        receipts: &ReceiptTable,
        provider: Arc<dyn HumanLoopProvider>,
        record: &HumanLoopRequest,
    ) {
        let ask = ProviderAsk {
            request_id: record.id.clone(),
            task_id: record.task_id.clone(),
            kind: record.kind,
            conversation_id: None,
            metadata: record.metadata.clone(),
            history: Vec::new(),
            created_at: record.created_at,
            expires_at: record.expires_at,
        };
        let receipt = provider.submit(&ask).await.unwrap();
        receipts.insert(record.id.clone(), ReceiptEntry { provider, receipt });
    }

    fn scheduler(
        store: Arc<RequestStore>,
        receipts: Arc<ReceiptTable>,
        hook: Option<ResolutionHook>,
    ) -> SweepScheduler {
        SweepScheduler::new(
            store,
            receipts,
            hook,
            Duration::from_millis(20),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn sweep_expires_overdue_requests_and_fires_the_hook() {
        let store = Arc::new(RequestStore::new());
        let receipts = Arc::new(ReceiptTable::new());
        let record = pending(&store, "silent", Duration::from_millis(10));
        register(&receipts, Arc::new(MockProvider::silent("silent")), &record).await;

        let seen: Arc<Mutex<Vec<RequestStatus>>> = Arc::new(Mutex::new(Vec::new()));
        let hook: ResolutionHook = {
            let seen = seen.clone();
            Arc::new(move |_record, resolution| {
                seen.lock().unwrap().push(resolution.status);
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        scheduler(store.clone(), receipts.clone(), Some(hook)).sweep().await;

        assert_eq!(store.get(&record.id).unwrap().status, RequestStatus::Expired);
        assert_eq!(*seen.lock().unwrap(), vec![RequestStatus::Expired]);
        assert!(receipts.is_empty());
    }

    #[tokio::test]
    async fn sweep_does_not_expire_before_the_deadline() {
        let store = Arc::new(RequestStore::new());
        let receipts = Arc::new(ReceiptTable::new());
        let record = pending(&store, "silent", Duration::from_secs(60));
        register(&receipts, Arc::new(MockProvider::silent("silent")), &record).await;

        scheduler(store.clone(), receipts, None).sweep().await;
        assert_eq!(store.get(&record.id).unwrap().status, RequestStatus::Pending);
    }

    #[tokio::test]
    async fn sweep_commits_a_polled_decision() {
        let store = Arc::new(RequestStore::new());
        let receipts = Arc::new(ReceiptTable::new());
        let record = pending(&store, "mock", Duration::from_secs(60));
        register(
            &receipts,
            Arc::new(MockProvider::instant_approve("mock")),
            &record,
        )
        .await;

        scheduler(store.clone(), receipts.clone(), None).sweep().await;

        let resolved = store.get(&record.id).unwrap();
        assert_eq!(resolved.status, RequestStatus::Approved);
        assert!(receipts.is_empty());
    }

    /// Provider whose polls always fail.
    struct BrokenProvider {
        retriable: bool,
        polls: AtomicU32,
    }

    #[async_trait]
    impl HumanLoopProvider for BrokenProvider {
        fn name(&self) -> &str {
            "broken"
        }

        fn supports(&self, _kind: RequestKind) -> bool {
            true
        }

        async fn submit(&self, ask: &ProviderAsk) -> Result<Receipt, ProviderError> {
            Ok(Receipt {
                request_id: ask.request_id.clone(),
                external_id: ask.request_id.to_string(),
                issued_at: chrono::Utc::now(),
            })
        }

        async fn poll(
            &self,
            _receipt: &Receipt,
        ) -> Result<Option<ProviderResolution>, ProviderError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            Err(ProviderError::PollFailed {
                reason: "wire snapped".to_string(),
                retriable: self.retriable,
            })
        }

        async fn cancel(&self, _receipt: &Receipt) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn one_failing_provider_does_not_stall_the_sweep() {
        let store = Arc::new(RequestStore::new());
        let receipts = Arc::new(ReceiptTable::new());

        let broken = Arc::new(BrokenProvider {
            retriable: true,
            polls: AtomicU32::new(0),
        });
        let healthy = Arc::new(MockProvider::instant_approve("mock"));

        let stuck = pending(&store, "broken", Duration::from_secs(60));
        register(&receipts, broken.clone(), &stuck).await;
        // Created second, so the sweep visits it after the failing one.
        let fine = pending(&store, "mock", Duration::from_secs(60));
        register(&receipts, healthy, &fine).await;

        scheduler(store.clone(), receipts.clone(), None).sweep().await;

        assert_eq!(store.get(&fine.id).unwrap().status, RequestStatus::Approved);
        // Retriable failure keeps the request pending and the receipt alive.
        assert_eq!(store.get(&stuck.id).unwrap().status, RequestStatus::Pending);
        assert!(receipts.contains_key(&stuck.id));
        assert!(broken.polls.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn permanent_poll_failure_fails_the_request() {
        let store = Arc::new(RequestStore::new());
        let receipts = Arc::new(ReceiptTable::new());
        let broken = Arc::new(BrokenProvider {
            retriable: false,
            polls: AtomicU32::new(0),
        });
        let record = pending(&store, "broken", Duration::from_secs(60));
        register(&receipts, broken, &record).await;

        scheduler(store.clone(), receipts.clone(), None).sweep().await;

        let failed = store.get(&record.id).unwrap();
        assert_eq!(failed.status, RequestStatus::Failed);
        assert!(receipts.is_empty());
    }

    #[tokio::test]
    async fn expiry_beats_a_late_poll_answer() {
        let store = Arc::new(RequestStore::new());
        let receipts = Arc::new(ReceiptTable::new());
        // The provider would approve immediately, but the deadline has
        // already passed when the sweep runs.
        let record = pending(&store, "mock", Duration::from_millis(5));
        register(
            &receipts,
            Arc::new(MockProvider::instant_approve("mock")),
            &record,
        )
        .await;

        tokio::time::sleep(Duration::from_millis(15)).await;
        scheduler(store.clone(), receipts.clone(), None).sweep().await;

        assert_eq!(store.get(&record.id).unwrap().status, RequestStatus::Expired);
        assert!(receipts.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn run_loop_resolves_requests_and_stops_on_shutdown() {
        let store = Arc::new(RequestStore::new());
        let receipts = Arc::new(ReceiptTable::new());
        let shutdown = CancellationToken::new();

        let sched = Arc::new(SweepScheduler::new(
            store.clone(),
            receipts.clone(),
            None,
            Duration::from_millis(10),
            shutdown.clone(),
        ));
        let running = {
            let sched = sched.clone();
            tokio::spawn(async move { sched.run().await })
        };

        let record = pending(&store, "mock", Duration::from_secs(60));
        register(
            &receipts,
            Arc::new(MockProvider::approve_after("mock", Duration::from_millis(20))),
            &record,
        )
        .await;

        let resolved = store
            .wait_for_terminal(&record.id, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(resolved.status, RequestStatus::Approved);

        shutdown.cancel();
        running.await.unwrap();
    }
}
