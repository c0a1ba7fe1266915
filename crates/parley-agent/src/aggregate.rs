//! Result aggregation.
//!
//! Fuses per-task outputs into the single reply the user sees.  Inputs are
//! ordered by task id before fusion so the result is reproducible for a
//! given set of worker outputs.  Exactly one task short-circuits: its
//! output is the reply verbatim.  The aggregator is defined purely over
//! [`TaskResult`] values; it never inspects any intermediate LLM shape.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::llm::{LlmClient, Message};
use crate::worker::TaskResult;

/// Reply used when no worker produced a result at all.
pub const NO_RESULTS_REPLY: &str =
    "I wasn't able to complete any part of that request. Please try again.";

const PER_RESULT_BUDGET: usize = 400;

/// LLM-backed response fuser.
#[derive(Clone)]
pub struct Aggregator {
    llm: Arc<dyn LlmClient>,
}

impl Aggregator {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// Order `results` by task id (in place) and fuse them into one reply.
    pub async fn aggregate(&self, user_query: &str, results: &mut Vec<TaskResult>) -> String {
        results.sort_by_key(|r| r.task_id);

        match results.len() {
            0 => NO_RESULTS_REPLY.to_owned(),
            1 => results[0].output.clone(),
            _ => self.fuse(user_query, results).await,
        }
    }

    async fn fuse(&self, user_query: &str, results: &[TaskResult]) -> String {
        let blocks: Vec<String> = results
            .iter()
            .map(|r| {
                let status = if r.success { "" } else { " (failed)" };
                let output: String = r.output.chars().take(PER_RESULT_BUDGET).collect();
                format!("[{} task {}{}]\n{}", r.worker_kind, r.task_id, status, output)
            })
            .collect();
        let results_text = blocks.join("\n\n");

        let prompt = format!(
            "Original query: {user_query}\n\n\
             Results from different workers:\n{results_text}\n\n\
             Provide one coherent response that addresses the original query, \
             integrating the results smoothly. Mention failures only where \
             they affect the answer."
        );
        let messages = [
            Message::system("You are a helpful assistant."),
            Message::user(prompt),
        ];

        match self.llm.complete(&messages).await {
            Ok(response) => {
                debug!(tasks = results.len(), "results fused");
                response
            }
            Err(e) => {
                // Degrade to the deterministic concatenation; the user still
                // gets every worker's output.
                warn!(error = %e, "fusion llm call failed; returning joined results");
                results_text
            }
        }
    }
}
