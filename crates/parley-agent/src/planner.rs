//! Query planning.
//!
//! Asks the LLM to classify a query into an [`ExecutionPlan`]: whether
//! context is needed, from which sources, and which worker tasks to run.
//! The model's structured output is validated against the plan schema; any
//! failure -- transport, parse, or schema -- substitutes the deterministic
//! default plan so a request always has at least one conversational task.
//! The planner never executes tools.

use std::collections::HashSet;
use std::sync::Arc;

use jsonschema::JSONSchema;
use tracing::{debug, warn};

use crate::llm::{LlmClient, Message};
use crate::plan::{ExecutionPlan, execution_plan_schema};

const PLANNING_SYSTEM: &str = "\
You are a planning agent for an assistant with web search, a user-document \
index, a club-knowledge index, and tool servers (gmail, calendar, drive, \
github). Decide:

1. Does this query need context, and of which type?
   - web: factual questions, definitions, explanations, general knowledge
   - rag: questions about the user's own documents
   - club: club events, announcements, coordinators and their contacts
   - mixed: more than one of the above
   - none: greetings, chit-chat, pure tool operations
2. Which worker tasks are needed?
   - conversational: answer with the model
   - tool: drive a tool server; set tool_spec.server to one of gmail, \
calendar, drive, github, and set needs_approval=true for writes that \
modify remote state (sending mail, creating events, creating repos).

Rules: extract concrete queries into search_queries / rag_queries / \
club_queries; give every task a unique integer id starting at 1; mark \
tasks that should see the gathered context with requires_context=true.";

/// A plan plus how it was obtained.
#[derive(Debug, Clone)]
pub struct PlannedRequest {
    pub plan: ExecutionPlan,
    /// True when the default plan was substituted for unusable model output.
    pub used_fallback: bool,
}

/// LLM-backed intent classifier.
pub struct Planner {
    llm: Arc<dyn LlmClient>,
    schema: JSONSchema,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        let schema = JSONSchema::compile(&execution_plan_schema())
            .expect("execution plan schema is valid");
        Self { llm, schema }
    }

    /// Produce a plan for `user_query`.  Infallible: schema violations and
    /// LLM failures degrade to the default conversational plan.
    pub async fn plan(&self, user_query: &str, history: &[String]) -> PlannedRequest {
        let mut prompt = format!("User query: {user_query}\n");
        if !history.is_empty() {
            let recent: Vec<&str> = history
                .iter()
                .rev()
                .take(6)
                .rev()
                .map(String::as_str)
                .collect();
            prompt.push_str(&format!("\nRecent conversation:\n{}\n", recent.join("\n")));
        }
        prompt.push_str(
            "\nAnalyze what context is needed and produce the execution plan as JSON.",
        );

        let messages = [Message::system(PLANNING_SYSTEM), Message::user(prompt)];
        let value = match self
            .llm
            .complete_structured(&messages, &execution_plan_schema())
            .await
        {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "planner llm call failed; using default plan");
                return PlannedRequest {
                    plan: ExecutionPlan::default_conversational(),
                    used_fallback: true,
                };
            }
        };

        if let Err(errors) = self.schema.validate(&value) {
            let reasons: Vec<String> = errors.map(|e| e.to_string()).collect();
            warn!(reasons = ?reasons, "plan failed schema validation; using default plan");
            return PlannedRequest {
                plan: ExecutionPlan::default_conversational(),
                used_fallback: true,
            };
        }

        match serde_json::from_value::<ExecutionPlan>(value) {
            Ok(plan) => {
                let plan = sanitize(plan);
                debug!(
                    needs_context = plan.needs_context,
                    context_type = ?plan.context_type,
                    tasks = plan.tasks.len(),
                    "plan accepted"
                );
                PlannedRequest {
                    plan,
                    used_fallback: false,
                }
            }
            Err(e) => {
                warn!(error = %e, "plan failed deserialization; using default plan");
                PlannedRequest {
                    plan: ExecutionPlan::default_conversational(),
                    used_fallback: true,
                }
            }
        }
    }
}

/// Enforce the invariants deserialization alone cannot: at least one task,
/// unique task ids.
fn sanitize(mut plan: ExecutionPlan) -> ExecutionPlan {
    if plan.tasks.is_empty() {
        return ExecutionPlan::default_conversational();
    }
    let mut seen = HashSet::new();
    let mut next = plan.tasks.iter().map(|t| t.id).max().unwrap_or(0);
    for task in &mut plan.tasks {
        if !seen.insert(task.id) {
            next += 1;
            task.id = next;
            seen.insert(task.id);
        }
    }
    plan
}
