//! The orchestration state machine.
//!
//! One request flows through:
//!
//! ```text
//! entry → safety_gate → { short_circuit | planning }
//!       → context_routing → { none | web | rag | club | mixed }
//!       → fanout → aggregator → confidence_check → { retry | done }
//! ```
//!
//! Tasks fan out concurrently; each worker owns its task and reports on a
//! result channel bounded by the task count.  Worker failures never escape
//! the worker boundary, so the aggregator is always reached.  A
//! request-level deadline covers the whole orchestration: tasks still
//! pending at expiry are recorded as failed and aggregation runs with
//! whatever completed.
//!
//! The confidence check can send the request back to planning, at most
//! `max_iterations` passes in total.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use parley_kernel::ToolInvoker;
use parley_knowledge::RetrievalService;

use crate::aggregate::Aggregator;
use crate::context::{ContextRouter, GatheredContext};
use crate::llm::{LlmClient, Message};
use crate::plan::{ExecutionPlan, WorkerKind};
use crate::planner::Planner;
use crate::safety::{REFUSAL_MESSAGE, SafetyGate};
use crate::worker::{ConversationalWorker, PendingApproval, TaskResult, ToolWorker};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tunables for one orchestrator instance.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Replanning triggers below this confidence score.
    pub confidence_threshold: f32,
    /// Maximum planning passes per request.
    pub max_iterations: u32,
    /// Wall-clock budget for the whole request.
    pub request_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.6,
            max_iterations: 2,
            request_timeout: Duration::from_secs(60),
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Everything one orchestration run produced, for the chat facade and the
/// reply metadata.
#[derive(Debug, Clone)]
pub struct OrchestrationOutcome {
    pub response: String,
    pub red_flag: bool,
    pub confidence: f32,
    /// Planning passes executed (1 unless the confidence loop retried).
    pub iterations: u32,
    /// `server.tool` identifiers touched across context providers and
    /// workers, deduplicated, in first-use order.
    pub tools_used: Vec<String>,
    pub total_tasks: usize,
    pub successful_tasks: usize,
    pub tasks_with_context: usize,
    pub pending_approvals: Vec<PendingApproval>,
    /// How many planning passes fell back to the default plan.
    pub planner_fallbacks: u32,
    pub errors: Vec<String>,
}

impl OrchestrationOutcome {
    fn refusal() -> Self {
        Self {
            response: REFUSAL_MESSAGE.to_owned(),
            red_flag: true,
            confidence: 1.0,
            iterations: 0,
            tools_used: Vec::new(),
            total_tasks: 0,
            successful_tasks: 0,
            tasks_with_context: 0,
            pending_approvals: Vec::new(),
            planner_fallbacks: 0,
            errors: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

fn confidence_schema() -> Value {
    json!({
        "type": "object",
        "required": ["score"],
        "properties": {
            "score": {"type": "number", "minimum": 0.0, "maximum": 1.0},
            "retry_needed": {"type": "boolean"}
        }
    })
}

/// Long-lived engine wiring gate → planner → context → workers → aggregator.
pub struct Orchestrator {
    llm: Arc<dyn LlmClient>,
    gate: SafetyGate,
    planner: Planner,
    router: ContextRouter,
    conversational: ConversationalWorker,
    tool_worker: ToolWorker,
    aggregator: Aggregator,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        invoker: Arc<dyn ToolInvoker>,
        retrieval: Arc<RetrievalService>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            gate: SafetyGate::new().with_llm(Arc::clone(&llm)),
            planner: Planner::new(Arc::clone(&llm)),
            router: ContextRouter::new(
                Arc::clone(&invoker),
                Arc::clone(&llm),
                Arc::clone(&retrieval),
            ),
            conversational: ConversationalWorker::new(Arc::clone(&llm)),
            tool_worker: ToolWorker::new(Arc::clone(&llm), invoker),
            aggregator: Aggregator::new(Arc::clone(&llm)),
            llm,
            config,
        }
    }

    /// Replace the safety gate (custom patterns, no LLM stage, ...).
    pub fn with_safety_gate(mut self, gate: SafetyGate) -> Self {
        self.gate = gate;
        self
    }

    /// Drive one request through the state machine.
    pub async fn run(&self, user_query: &str, history: &[String]) -> OrchestrationOutcome {
        let deadline = Instant::now() + self.config.request_timeout;

        // -- safety_gate ----------------------------------------------------
        if self.gate.check(user_query).await.is_trip() {
            info!("request short-circuited by safety gate");
            return OrchestrationOutcome::refusal();
        }

        let mut iterations = 0u32;
        let mut planner_fallbacks = 0u32;
        let mut tools_used: Vec<String> = Vec::new();
        let mut errors: Vec<String> = Vec::new();
        let mut pending_approvals: Vec<PendingApproval> = Vec::new();

        loop {
            iterations += 1;

            // -- planning ---------------------------------------------------
            let planned = self.planner.plan(user_query, history).await;
            if planned.used_fallback {
                planner_fallbacks += 1;
            }
            let plan = planned.plan;
            debug!(
                iteration = iterations,
                tasks = plan.tasks.len(),
                context = ?plan.context_type,
                "plan ready"
            );

            // -- context_routing --------------------------------------------
            let context = self.router.gather(&plan).await;
            record_context_tools(&context, &mut tools_used);

            // -- fanout -----------------------------------------------------
            let (mut results, approvals) = self.fan_out(&plan, user_query, &context, deadline).await;
            pending_approvals.extend(approvals);
            for result in &results {
                for tool in &result.tools_used {
                    push_unique(&mut tools_used, tool.clone());
                }
                if let Some(error) = &result.error {
                    errors.push(format!("task {}: {error}", result.task_id));
                }
            }

            // -- aggregator -------------------------------------------------
            let response = self.aggregator.aggregate(user_query, &mut results).await;

            // -- confidence_check -------------------------------------------
            let confidence = self.confidence(user_query, &response).await;
            let retry = confidence < self.config.confidence_threshold
                && iterations < self.config.max_iterations;
            info!(
                iteration = iterations,
                confidence,
                retry,
                tasks = results.len(),
                "orchestration pass complete"
            );
            if retry {
                continue;
            }

            return OrchestrationOutcome {
                response,
                red_flag: false,
                confidence,
                iterations,
                tools_used,
                total_tasks: results.len(),
                successful_tasks: results.iter().filter(|r| r.success).count(),
                tasks_with_context: results.iter().filter(|r| r.used_context).count(),
                pending_approvals,
                planner_fallbacks,
                errors,
            };
        }
    }

    /// Dispatch every task concurrently and fan results back in.
    ///
    /// The channel is bounded by the task count; workers share no mutable
    /// state beyond it.  Tasks missing at the deadline are synthesized as
    /// failures so aggregation always sees the full task set.
    async fn fan_out(
        &self,
        plan: &ExecutionPlan,
        user_query: &str,
        context: &GatheredContext,
        deadline: Instant,
    ) -> (Vec<TaskResult>, Vec<PendingApproval>) {
        let expected = plan.tasks.len();
        let (tx, mut rx) = mpsc::channel::<(TaskResult, Vec<PendingApproval>)>(expected.max(1));

        for task in plan.tasks.iter().cloned() {
            let tx = tx.clone();
            let user_query = user_query.to_owned();
            let task_context = (task.requires_context && !context.combined.is_empty())
                .then(|| context.combined.clone());

            match task.worker_kind {
                WorkerKind::Conversational => {
                    let worker = self.conversational.clone();
                    tokio::spawn(async move {
                        let result = worker
                            .execute(&task, &user_query, task_context.as_deref())
                            .await;
                        let _ = tx.send((result, Vec::new())).await;
                    });
                }
                WorkerKind::Tool => {
                    let worker = self.tool_worker.clone();
                    tokio::spawn(async move {
                        let outcome = worker
                            .execute(&task, &user_query, task_context.as_deref())
                            .await;
                        let _ = tx.send(outcome).await;
                    });
                }
            }
        }
        drop(tx);

        let mut results = Vec::with_capacity(expected);
        let mut approvals = Vec::new();
        while results.len() < expected {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some((result, task_approvals))) => {
                    results.push(result);
                    approvals.extend(task_approvals);
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        completed = results.len(),
                        expected, "request deadline expired during fan-out"
                    );
                    let done: HashSet<u32> = results.iter().map(|r| r.task_id).collect();
                    for task in &plan.tasks {
                        if !done.contains(&task.id) {
                            results.push(TaskResult {
                                task_id: task.id,
                                worker_kind: task.worker_kind,
                                success: false,
                                output: "The task timed out before completing.".to_owned(),
                                used_context: false,
                                error: Some("request deadline exceeded".to_owned()),
                                tools_used: Vec::new(),
                                requires_approval: false,
                            });
                        }
                    }
                    break;
                }
            }
        }
        (results, approvals)
    }

    /// Ask the LLM to score the response; unusable answers score 1.0 so a
    /// broken judge can never cause a retry storm.
    async fn confidence(&self, user_query: &str, response: &str) -> f32 {
        let prompt = format!(
            "Rate how well this response answers the query.\n\n\
             Query: {user_query}\n\nResponse: {response}\n\n\
             Return JSON with `score` in [0, 1] and `retry_needed`."
        );
        let value = match self
            .llm
            .complete_structured(&[Message::user(prompt)], &confidence_schema())
            .await
        {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "confidence check failed; accepting response");
                return 1.0;
            }
        };
        value
            .get("score")
            .and_then(Value::as_f64)
            .map(|s| s.clamp(0.0, 1.0) as f32)
            .unwrap_or(1.0)
    }
}

fn record_context_tools(context: &GatheredContext, tools_used: &mut Vec<String>) {
    for item in &context.items {
        let server = item.metadata.get("server").and_then(Value::as_str);
        let tool = item.metadata.get("tool").and_then(Value::as_str);
        if let (Some(server), Some(tool)) = (server, tool) {
            push_unique(tools_used, format!("{server}.{tool}"));
        }
    }
}

fn push_unique(list: &mut Vec<String>, value: String) {
    if !list.contains(&value) {
        list.push(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AgentError;
    use crate::safety::REFUSAL_MESSAGE;
    use crate::testing::{MockInvoker, MockLlm, club_retrieval_fixture};

    /// Schema sniffing keeps one mock serving planner, judge, and workers.
    fn is_plan_schema(schema: &Value) -> bool {
        schema["properties"].get("tasks").is_some()
    }
    fn is_confidence_schema(schema: &Value) -> bool {
        schema["properties"].get("retry_needed").is_some()
    }

    fn conversational_plan() -> Value {
        json!({
            "needs_context": false,
            "context_type": "none",
            "reasoning": "chit-chat",
            "tasks": [{"id": 1, "title": "Respond", "worker_kind": "conversational"}]
        })
    }

    fn scripted_llm(plan: Value, confidence: f64, reply: &str) -> MockLlm {
        let reply = reply.to_owned();
        MockLlm::with_handlers(
            move |_| Ok(reply.clone()),
            move |_, schema| {
                if is_plan_schema(schema) {
                    Ok(plan.clone())
                } else if is_confidence_schema(schema) {
                    Ok(json!({"score": confidence, "retry_needed": confidence < 0.6}))
                } else {
                    Err(AgentError::LlmParseFailed {
                        reason: "unexpected structured call".to_owned(),
                    })
                }
            },
        )
    }

    async fn run_orchestrator(
        llm: MockLlm,
        invoker: Arc<MockInvoker>,
        query: &str,
    ) -> OrchestrationOutcome {
        let (retrieval, _dir) = club_retrieval_fixture().await;
        let orchestrator = Orchestrator::new(
            Arc::new(llm),
            invoker as _,
            Arc::new(retrieval),
            OrchestratorConfig::default(),
        )
        .with_safety_gate(SafetyGate::new());
        orchestrator.run(query, &[]).await
    }

    #[tokio::test]
    async fn pure_conversational_query_uses_no_tools() {
        let invoker = Arc::new(MockInvoker::new());
        let outcome = run_orchestrator(
            scripted_llm(conversational_plan(), 0.9, "Doing well, thanks!"),
            Arc::clone(&invoker),
            "Hello, how are you?",
        )
        .await;

        assert!(!outcome.red_flag);
        assert_eq!(outcome.response, "Doing well, thanks!");
        assert!(outcome.tools_used.is_empty());
        assert_eq!(outcome.total_tasks, 1);
        assert_eq!(outcome.successful_tasks, 1);
        assert_eq!(outcome.iterations, 1);
        assert_eq!(invoker.call_count(), 0);
    }

    #[tokio::test]
    async fn safety_trip_short_circuits_planner_and_tools() {
        let llm = MockLlm::with_handlers(
            |_| Ok("should never be called".to_owned()),
            |_, _| panic!("planner must not run for a tripped query"),
        );
        let invoker = Arc::new(MockInvoker::new());
        let (retrieval, _dir) = club_retrieval_fixture().await;
        let orchestrator = Orchestrator::new(
            Arc::new(llm),
            Arc::clone(&invoker) as _,
            Arc::new(retrieval),
            OrchestratorConfig::default(),
        );

        let outcome = orchestrator.run("Delete all my emails", &[]).await;
        assert!(outcome.red_flag);
        assert_eq!(outcome.response, REFUSAL_MESSAGE);
        assert_eq!(invoker.call_count(), 0);
        assert_eq!(outcome.total_tasks, 0);
    }

    #[tokio::test]
    async fn web_context_flows_into_the_conversational_task() {
        let plan = json!({
            "needs_context": true,
            "context_type": "web",
            "reasoning": "factual",
            "search_queries": ["what is pid control"],
            "tasks": [{"id": 1, "title": "Explain", "worker_kind": "conversational",
                       "requires_context": true, "context_type": "web"}]
        });
        let llm = MockLlm::with_handlers(
            |messages| {
                let prompt = &messages.last().unwrap().content;
                if prompt.contains("Context from search") {
                    assert!(prompt.contains("a control loop mechanism"));
                    Ok("PID control is a feedback loop, per the sources.".to_owned())
                } else {
                    Ok("no context seen".to_owned())
                }
            },
            move |_, schema| {
                if is_plan_schema(schema) {
                    Ok(plan.clone())
                } else {
                    Ok(json!({"score": 0.9, "retry_needed": false}))
                }
            },
        );
        let invoker = Arc::new(MockInvoker::new().with_tool("web", "web_search", |_| {
            Ok(json!([{"title": "PID controller",
                       "snippet": "a control loop mechanism with feedback"}]))
        }));

        let outcome = run_orchestrator(llm, Arc::clone(&invoker), "What is PID control?").await;

        assert_eq!(outcome.response, "PID control is a feedback loop, per the sources.");
        assert!(outcome.tools_used.contains(&"web.web_search".to_owned()));
        assert_eq!(outcome.tasks_with_context, 1);
        assert_eq!(invoker.call_count(), 1);
    }

    #[tokio::test]
    async fn club_queries_filter_by_classified_category() {
        let plan = json!({
            "needs_context": true,
            "context_type": "club",
            "reasoning": "club coordinator lookup",
            "club_queries": ["who coordinates RoboSprint"],
            "tasks": [{"id": 1, "title": "Answer", "worker_kind": "conversational",
                       "requires_context": true, "context_type": "club"}]
        });
        let llm = MockLlm::with_handlers(
            |messages| {
                let prompt = &messages.last().unwrap().content;
                if prompt.contains("Classify this club-knowledge query") {
                    Ok("coordinators".to_owned())
                } else if prompt.contains("Context from search") {
                    // The coordinator sheet reached the worker through the
                    // category-filtered club search.
                    assert!(prompt.contains("Priya Nair"));
                    Ok("RoboSprint is coordinated by Priya Nair.".to_owned())
                } else {
                    Ok("context never arrived".to_owned())
                }
            },
            move |_, schema| {
                if is_plan_schema(schema) {
                    Ok(plan.clone())
                } else {
                    Ok(json!({"score": 0.9, "retry_needed": false}))
                }
            },
        );

        let outcome = run_orchestrator(
            llm,
            Arc::new(MockInvoker::new()),
            "Who coordinates RoboSprint?",
        )
        .await;

        assert_eq!(outcome.response, "RoboSprint is coordinated by Priya Nair.");
        assert_eq!(outcome.tasks_with_context, 1);
    }

    #[tokio::test]
    async fn mixed_context_hits_both_web_and_rag() {
        let plan = json!({
            "needs_context": true,
            "context_type": "mixed",
            "reasoning": "web + user docs",
            "search_queries": ["vector databases"],
            "rag_queries": ["our docs on vector databases"],
            "tasks": [{"id": 1, "title": "Summarize", "worker_kind": "conversational",
                       "requires_context": true}]
        });
        let llm = scripted_llm(plan, 0.9, "Summary across both sources.");
        let invoker = Arc::new(
            MockInvoker::new()
                .with_tool("web", "web_search", |_| Ok(json!("web says hello")))
                .with_tool("rag", "retrieve_context", |_| {
                    Ok(json!({"chunks": [{"text": "docs say hi", "score": 0.8}]}))
                }),
        );

        let outcome = run_orchestrator(
            llm,
            Arc::clone(&invoker),
            "Search the web for vector databases and what do our docs say about them",
        )
        .await;

        assert!(outcome.tools_used.contains(&"web.web_search".to_owned()));
        assert!(outcome.tools_used.contains(&"rag.retrieve_context".to_owned()));
        assert_eq!(invoker.call_count(), 2);
        assert_eq!(outcome.total_tasks, 1);
    }

    #[tokio::test]
    async fn low_confidence_replans_up_to_the_iteration_cap() {
        let llm = scripted_llm(conversational_plan(), 0.1, "weak answer");
        let outcome =
            run_orchestrator(llm, Arc::new(MockInvoker::new()), "vague question").await;

        assert_eq!(outcome.iterations, 2);
        assert!((outcome.confidence - 0.1).abs() < 1e-6);
        // A low final score does not erase the response.
        assert_eq!(outcome.response, "weak answer");
    }

    #[tokio::test]
    async fn worker_failures_still_reach_the_aggregator() {
        let plan = json!({
            "reasoning": "one tool task that will fail",
            "tasks": [{"id": 1, "title": "Fetch mail", "worker_kind": "tool",
                       "tool_spec": {"server": "gmail", "tool": "get_latest",
                                     "arguments": {}}}]
        });
        // No gmail server registered: the invoke fails, the worker records
        // the failure, and the reply is that result's output verbatim.
        let llm = scripted_llm(plan, 0.9, "unused");
        let outcome =
            run_orchestrator(llm, Arc::new(MockInvoker::new()), "check my email").await;

        assert_eq!(outcome.total_tasks, 1);
        assert_eq!(outcome.successful_tasks, 0);
        assert!(outcome.response.contains("gmail.get_latest failed"));
        assert!(!outcome.errors.is_empty());
    }

    #[tokio::test]
    async fn approval_gated_task_produces_pending_record() {
        let plan = json!({
            "reasoning": "write operation",
            "tasks": [{"id": 1, "title": "Send status email", "worker_kind": "tool",
                       "needs_approval": true,
                       "tool_spec": {"server": "gmail", "tool": "send_email",
                                     "arguments": {"to": "team@club.example"}}}]
        });
        let llm = scripted_llm(plan, 0.9, "unused");
        let invoker = Arc::new(MockInvoker::new().with_tool("gmail", "send_email", |_| {
            Ok(json!("sent"))
        }));

        let outcome = run_orchestrator(llm, Arc::clone(&invoker), "email the team").await;

        assert_eq!(outcome.pending_approvals.len(), 1);
        assert_eq!(outcome.pending_approvals[0].tool, "send_email");
        assert!(outcome.response.contains("needs your approval"));
        // The write never executed.
        assert_eq!(invoker.call_count(), 0);
    }

    #[tokio::test]
    async fn multi_task_results_aggregate_in_id_order() {
        let llm = MockLlm::with_handlers(
            |messages| {
                let prompt = &messages.last().unwrap().content;
                if prompt.contains("Results from different workers") {
                    // Fusion sees task 1 before task 2 regardless of
                    // completion order.
                    let one = prompt.find("task 1").expect("task 1 present");
                    let two = prompt.find("task 2").expect("task 2 present");
                    assert!(one < two);
                    Ok("fused reply".to_owned())
                } else {
                    Ok("conversational part".to_owned())
                }
            },
            move |_, schema| {
                if is_plan_schema(schema) {
                    Ok(json!({
                        "reasoning": "two tasks",
                        "tasks": [
                            {"id": 2, "title": "Second", "worker_kind": "tool",
                             "tool_spec": {"server": "github", "tool": "get_me",
                                           "arguments": {}}},
                            {"id": 1, "title": "First", "worker_kind": "conversational"}
                        ]
                    }))
                } else {
                    Ok(json!({"score": 0.9}))
                }
            },
        );
        let invoker = Arc::new(MockInvoker::new().with_tool("github", "get_me", |_| {
            Ok(json!({"login": "club-bot"}))
        }));

        let outcome = run_orchestrator(llm, invoker, "who am I and say hi").await;
        assert_eq!(outcome.response, "fused reply");
        assert_eq!(outcome.total_tasks, 2);
        assert_eq!(outcome.successful_tasks, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn deadline_marks_pending_tasks_failed() {
        let llm = MockLlm::with_handlers(
            |messages| {
                let prompt = &messages.last().unwrap().content;
                if prompt.contains("Provide a helpful, conversational response") {
                    // Simulates an LLM call that outlives the request budget.
                    std::thread::sleep(Duration::from_millis(300));
                }
                Ok("too late".to_owned())
            },
            |_, schema| {
                if is_plan_schema(schema) {
                    Ok(json!({
                        "reasoning": "slow task",
                        "tasks": [{"id": 1, "title": "Respond",
                                   "worker_kind": "conversational"}]
                    }))
                } else {
                    Ok(json!({"score": 0.9}))
                }
            },
        );
        let (retrieval, _dir) = club_retrieval_fixture().await;
        let orchestrator = Orchestrator::new(
            Arc::new(llm),
            Arc::new(MockInvoker::new()) as _,
            Arc::new(retrieval),
            OrchestratorConfig {
                request_timeout: Duration::from_millis(50),
                ..OrchestratorConfig::default()
            },
        )
        .with_safety_gate(SafetyGate::new());

        let outcome = orchestrator.run("slow request", &[]).await;
        assert_eq!(outcome.total_tasks, 1);
        assert_eq!(outcome.successful_tasks, 0);
        assert!(outcome.response.contains("timed out"));
        assert!(outcome.errors.iter().any(|e| e.contains("deadline")));
    }

    #[tokio::test]
    async fn empty_query_still_produces_a_reply() {
        // Planner output is garbage; the default plan and the
        // conversational worker still answer.
        let llm = MockLlm::with_handlers(
            |_| Ok("How can I help?".to_owned()),
            |_, schema| {
                if is_plan_schema(schema) {
                    Ok(json!({"definitely": "not a plan"}))
                } else {
                    Ok(json!({"score": 0.9}))
                }
            },
        );
        let outcome = run_orchestrator(llm, Arc::new(MockInvoker::new()), "").await;

        assert!(!outcome.response.is_empty());
        assert_eq!(outcome.planner_fallbacks, 1);
        assert_eq!(outcome.total_tasks, 1);
    }
}
