//! End-to-end flows through a running manager: dispatch, sweep,
//! resolution, and the gate wrapper.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use humanloop::{
    AskSpec, ConversationId, Decision, GateOutcome, GateSpec, HumanGate, HumanLoopManager,
    HumanLoopProvider, ManagerConfig, MockProvider, ProviderAsk, ProviderError,
    ProviderResolution, Receipt, RequestKind, RequestStatus, Resolution,
};

fn config(check_interval: Duration) -> ManagerConfig {
    ManagerConfig::default().with_check_interval(check_interval)
}

async fn started(
    provider: Arc<dyn HumanLoopProvider>,
    check_interval: Duration,
) -> Arc<HumanLoopManager> {
    let manager = Arc::new(HumanLoopManager::new(config(check_interval)));
    manager.register_provider(provider).unwrap();
    manager.start().await;
    manager
}

/// A never-answering provider expires within its timeout plus one sweep
/// interval, and not before the timeout.
#[tokio::test(flavor = "multi_thread")]
async fn unanswered_request_expires_within_timeout_plus_one_sweep() {
    let timeout = Duration::from_millis(200);
    let sweep = Duration::from_millis(100);
    let manager = started(Arc::new(MockProvider::silent("quiet")), sweep).await;

    let begin = Instant::now();
    let handle = manager
        .request_approval(AskSpec::new().task_id("never-answered").timeout(timeout))
        .await
        .unwrap();
    let id = handle.id().clone();

    let resolution = handle.wait().await.unwrap();
    let elapsed = begin.elapsed();

    assert_eq!(resolution.status, RequestStatus::Expired);
    assert!(elapsed >= timeout, "expired early after {elapsed:?}");
    assert!(
        elapsed < timeout + sweep * 5,
        "expiry took {elapsed:?}, budget was timeout + one sweep"
    );

    let record = manager.get(&id).unwrap();
    assert_eq!(record.status, RequestStatus::Expired);
    assert_eq!(record.transitions.len(), 1);

    manager.shutdown().await;
}

/// An approval with a payload reaches the wrapped function exactly once,
/// and the caller receives the function's return value.
#[tokio::test(flavor = "multi_thread")]
async fn approved_payload_reaches_the_wrapped_function_once() {
    let manager = started(
        Arc::new(MockProvider::approve_after("mock", Duration::from_millis(30))),
        Duration::from_millis(10),
    )
    .await;

    let calls = Arc::new(AtomicU32::new(0));
    let gate = HumanGate::new(manager.clone());
    let transfer = gate.require_approval(GateSpec::new().task_id("transfer"), {
        let calls = calls.clone();
        move |amount: u64, resolution: Resolution| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                let reason = resolution.response.unwrap()["reason"]
                    .as_str()
                    .unwrap()
                    .to_string();
                format!("sent {amount} ({reason})")
            }
        }
    });

    let outcome = transfer.call(250).await.unwrap();
    assert_eq!(outcome.into_executed().unwrap(), "sent 250 (ok)");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    manager.shutdown().await;
}

/// With `execute_on_reject` off, a rejection never invokes the wrapped
/// function; the caller gets the rejection outcome directly.
#[tokio::test(flavor = "multi_thread")]
async fn rejection_short_circuits_the_wrapped_function() {
    let manager = started(
        Arc::new(MockProvider::reject_after("mock", Duration::from_millis(20))),
        Duration::from_millis(10),
    )
    .await;

    let calls = Arc::new(AtomicU32::new(0));
    let gate = HumanGate::new(manager.clone());
    let guarded = gate.require_approval(GateSpec::new(), {
        let calls = calls.clone();
        move |_: (), _| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
            }
        }
    });

    match guarded.call(()).await.unwrap() {
        GateOutcome::Rejected(resolution) => {
            assert_eq!(resolution.status, RequestStatus::Rejected);
        }
        GateOutcome::Executed(()) => panic!("wrapped function ran on rejection"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    manager.shutdown().await;
}

/// Records every ask; completes each turn with a scripted reply.
struct ScriptedReviewer {
    asks: Mutex<Vec<ProviderAsk>>,
    replies: Mutex<Vec<serde_json::Value>>,
}

impl ScriptedReviewer {
    fn new(replies: Vec<serde_json::Value>) -> Self {
        Self {
            asks: Mutex::new(Vec::new()),
            replies: Mutex::new(replies),
        }
    }
}

#[async_trait]
impl HumanLoopProvider for ScriptedReviewer {
    fn name(&self) -> &str {
        "reviewer"
    }

    fn supports(&self, kind: RequestKind) -> bool {
        kind == RequestKind::Conversation
    }

    async fn submit(&self, ask: &ProviderAsk) -> Result<Receipt, ProviderError> {
        self.asks.lock().unwrap().push(ask.clone());
        Ok(Receipt {
            request_id: ask.request_id.clone(),
            external_id: ask.request_id.to_string(),
            issued_at: chrono::Utc::now(),
        })
    }

    async fn poll(&self, _receipt: &Receipt) -> Result<Option<ProviderResolution>, ProviderError> {
        let mut replies = self.replies.lock().unwrap();
        if replies.is_empty() {
            return Ok(None);
        }
        let reply = replies.remove(0);
        Ok(Some(
            ProviderResolution::new(Decision::Completed, Some(reply)).with_responder("reviewer"),
        ))
    }

    async fn cancel(&self, _receipt: &Receipt) -> Result<(), ProviderError> {
        Ok(())
    }
}

/// The second turn of a conversation carries the first turn's response in
/// its context.
#[tokio::test(flavor = "multi_thread")]
async fn second_conversation_turn_sees_the_first_response() {
    let reviewer = Arc::new(ScriptedReviewer::new(vec![
        serde_json::json!({"response": "add benchmarks"}),
        serde_json::json!({"response": "ship it"}),
    ]));
    let manager = started(reviewer.clone(), Duration::from_millis(10)).await;

    let cid = ConversationId::from("c1");
    let first = manager
        .request_conversation(&cid, AskSpec::new().task_id("draft-review"))
        .await
        .unwrap();
    let first_resolution = first.wait().await.unwrap();
    assert_eq!(first_resolution.status, RequestStatus::Completed);

    let second = manager
        .request_conversation(&cid, AskSpec::new().task_id("draft-review"))
        .await
        .unwrap();
    let second_resolution = second.wait().await.unwrap();
    assert_eq!(second_resolution.status, RequestStatus::Completed);
    assert_eq!(
        second_resolution.response.unwrap()["response"],
        "ship it"
    );

    let asks = reviewer.asks.lock().unwrap();
    assert_eq!(asks.len(), 2);
    assert!(asks[0].history.is_empty());
    assert_eq!(asks[1].history.len(), 1);
    assert_eq!(
        asks[1].history[0].response.as_ref().unwrap()["response"],
        "add benchmarks"
    );

    let conversation = manager.conversation(&cid).unwrap();
    assert_eq!(conversation.turn_count(), 2);
    let turn_records = asks[1].history[0].responded_at;
    assert!(turn_records.is_some());

    manager.shutdown().await;
}

/// N concurrent approvals against one provider get distinct ids and
/// resolve independently, one delivery per handle.
#[tokio::test(flavor = "multi_thread")]
async fn concurrent_approvals_resolve_independently() {
    let manager = started(
        Arc::new(MockProvider::approve_after("mock", Duration::from_millis(20))),
        Duration::from_millis(10),
    )
    .await;

    let mut handles = Vec::new();
    for i in 0..16 {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move {
            let handle = manager
                .request_approval(AskSpec::new().task_id(format!("task-{i}")))
                .await
                .unwrap();
            let id = handle.id().clone();
            let resolution = handle.wait().await.unwrap();
            (id, resolution.status)
        }));
    }

    let mut ids = std::collections::HashSet::new();
    for handle in handles {
        let (id, status) = handle.await.unwrap();
        assert_eq!(status, RequestStatus::Approved);
        assert!(ids.insert(id), "request id delivered to two handles");
    }
    assert_eq!(ids.len(), 16);

    manager.shutdown().await;
}

/// Cancelling twice commits `Cancelled` exactly once; the second call is
/// a no-op.
#[tokio::test(flavor = "multi_thread")]
async fn double_cancel_commits_once() {
    let manager = started(Arc::new(MockProvider::silent("quiet")), Duration::from_millis(50)).await;

    let handle = manager.request_approval(AskSpec::new()).await.unwrap();
    let id = handle.id().clone();

    manager.cancel(&id).await.unwrap();
    manager.cancel(&id).await.unwrap();

    let record = manager.get(&id).unwrap();
    assert_eq!(record.status, RequestStatus::Cancelled);
    assert_eq!(record.transitions.len(), 1);

    let resolution = handle.wait().await.unwrap();
    assert_eq!(resolution.status, RequestStatus::Cancelled);

    manager.shutdown().await;
}

/// A synchronous caller parks on the handle off the runtime and observes
/// the same resolution an async caller would.
#[tokio::test(flavor = "multi_thread")]
async fn blocking_wait_observes_the_resolution() {
    let manager = started(
        Arc::new(MockProvider::approve_after("mock", Duration::from_millis(30))),
        Duration::from_millis(10),
    )
    .await;

    let handle = manager.request_approval(AskSpec::new()).await.unwrap();
    let waiter = std::thread::spawn(move || handle.wait_blocking());

    let resolution = tokio::task::spawn_blocking(move || waiter.join().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resolution.status, RequestStatus::Approved);

    manager.shutdown().await;
}
