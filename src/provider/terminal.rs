//! Terminal provider: synchronous local prompt on stdin/stdout.
//!
//! Suited to CLI hosts and local development. The ask is printed to
//! stdout and one line is read from stdin on a blocking task; the answer
//! surfaces through `poll` on the next sweep. Concurrent asks take turns
//! at the prompt.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::io::Write;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{
    Decision, HumanLoopProvider, ProviderAsk, ProviderError, ProviderResolution, Receipt,
};
use crate::request::RequestKind;

/// Responder identity recorded for terminal answers.
const RESPONDER: &str = "terminal";

/// Channel provider that prompts the local operator.
pub struct TerminalProvider {
    name: String,
    /// Collected answers keyed by receipt external id
    answers: Arc<DashMap<String, ProviderResolution>>,
    /// Receipts withdrawn before the operator answered
    withdrawn: Arc<DashMap<String, ()>>,
    /// Serializes prompts so concurrent asks do not interleave
    prompt_gate: Arc<Mutex<()>>,
}

impl TerminalProvider {
    /// Creates a terminal provider with the given registry name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            answers: Arc::new(DashMap::new()),
            withdrawn: Arc::new(DashMap::new()),
            prompt_gate: Arc::new(Mutex::new(())),
        }
    }

    /// Renders the ask for the operator.
    fn render(ask: &ProviderAsk) -> String {
        let mut out = String::new();
        out.push_str("\n== HUMAN INPUT REQUIRED ==\n");
        out.push_str(&format!("Task: {}\n", ask.task_id));
        out.push_str(&format!("Kind: {}\n", ask.kind));
        if !ask.metadata.is_null() {
            out.push_str(&format!(
                "Details: {}\n",
                serde_json::to_string_pretty(&ask.metadata).unwrap_or_default()
            ));
        }
        for (i, turn) in ask.history.iter().enumerate() {
            if let Some(response) = &turn.response {
                out.push_str(&format!("Turn {}: {}\n", i + 1, response));
            }
        }
        match ask.kind {
            RequestKind::Approval => out.push_str("Approve? [y/N]: "),
            RequestKind::Information | RequestKind::Conversation => out.push_str("Response: "),
        }
        out
    }

    /// Parses one operator line into a resolution.
    fn parse_answer(kind: RequestKind, line: &str) -> ProviderResolution {
        let trimmed = line.trim();
        let resolution = match kind {
            RequestKind::Approval => match trimmed.to_lowercase().as_str() {
                "y" | "yes" | "approve" => ProviderResolution::new(
                    Decision::Approved,
                    Some(serde_json::json!({"input": trimmed})),
                ),
                _ => ProviderResolution::new(
                    Decision::Rejected,
                    Some(serde_json::json!({"input": trimmed})),
                ),
            },
            RequestKind::Information | RequestKind::Conversation => ProviderResolution::new(
                Decision::Completed,
                Some(serde_json::json!({"response": trimmed})),
            ),
        };
        resolution.with_responder(RESPONDER)
    }
}

#[async_trait]
impl HumanLoopProvider for TerminalProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports(&self, _kind: RequestKind) -> bool {
        true
    }

    async fn submit(&self, ask: &ProviderAsk) -> Result<Receipt, ProviderError> {
        let external_id = ask.request_id.to_string();
        let prompt = Self::render(ask);
        let kind = ask.kind;

        let answers = self.answers.clone();
        let withdrawn = self.withdrawn.clone();
        let prompt_gate = self.prompt_gate.clone();
        let key = external_id.clone();

        // The operator session runs off to the side; the submit itself
        // only schedules it. An unanswered prompt parks one blocking
        // thread until process exit, which is acceptable for a local
        // interactive channel.
        tokio::spawn(async move {
            let _turn = prompt_gate.lock().await;
            if withdrawn.contains_key(&key) {
                return;
            }
            let line = tokio::task::spawn_blocking(move || {
                print!("{prompt}");
                let _ = std::io::stdout().flush();
                let mut input = String::new();
                std::io::stdin().read_line(&mut input).map(|_| input)
            })
            .await;

            match line {
                Ok(Ok(input)) => {
                    if withdrawn.contains_key(&key) {
                        debug!(receipt = %key, "answer arrived after withdrawal, discarding");
                        return;
                    }
                    answers.insert(key, Self::parse_answer(kind, &input));
                }
                Ok(Err(e)) => {
                    warn!(receipt = %key, error = %e, "failed to read operator input");
                }
                Err(e) => {
                    warn!(receipt = %key, error = %e, "operator input task aborted");
                }
            }
        });

        info!(request_id = %ask.request_id, task_id = %ask.task_id, "prompted operator at terminal");

        Ok(Receipt {
            request_id: ask.request_id.clone(),
            external_id,
            issued_at: Utc::now(),
        })
    }

    async fn poll(&self, receipt: &Receipt) -> Result<Option<ProviderResolution>, ProviderError> {
        if self.withdrawn.contains_key(&receipt.external_id) {
            return Ok(None);
        }
        Ok(self
            .answers
            .get(&receipt.external_id)
            .map(|answer| answer.clone()))
    }

    async fn cancel(&self, receipt: &Receipt) -> Result<(), ProviderError> {
        if self.answers.contains_key(&receipt.external_id) {
            // Already answered; the withdrawal loses.
            return Ok(());
        }
        self.withdrawn.insert(receipt.external_id.clone(), ());
        debug!(receipt = %receipt.external_id, "withdrew terminal prompt");
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
