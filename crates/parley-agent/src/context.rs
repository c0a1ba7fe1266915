//! Context providers.
//!
//! Four providers share one signature -- take the plan, return scored
//! [`ContextItem`]s plus a combined text block:
//!
//! - **web**: the web tool server, one call per search query (max two).
//! - **rag**: the rag tool server's retrieve tool, same shape.
//! - **club**: LLM category classification, then the in-process retrieval
//!   service with the category as a metadata filter.
//! - **mixed**: web, rag, club in that order for whichever query lists are
//!   non-empty, merged and re-sorted.
//!
//! Combination sorts items by relevance descending; ties keep provider
//! order (web before rag before club) and then query order, which a stable
//! sort over the insertion sequence gives for free.  The combined text is
//! capped at [`CONTEXT_BUDGET`] characters.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, warn};

use parley_kernel::ToolInvoker;
use parley_knowledge::{MetadataFilter, RetrievalService};

use crate::llm::{LlmClient, Message};
use crate::plan::{ContextType, ExecutionPlan};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Character budget for the combined context block.
pub const CONTEXT_BUDGET: usize = 3_000;

/// At most this many queries run per provider per request.
pub const MAX_QUERIES_PER_PROVIDER: usize = 2;

/// Where a context item came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextSource {
    Web,
    Rag,
    Club,
}

impl ContextSource {
    fn header(&self) -> &'static str {
        match self {
            Self::Web => "Web Search",
            Self::Rag => "RAG Search",
            Self::Club => "Club Search",
        }
    }
}

/// A unit of retrieved context.
#[derive(Debug, Clone)]
pub struct ContextItem {
    pub source: ContextSource,
    pub content: String,
    /// In `[0, 1]`; degraded items from failed lookups carry 0.1.
    pub relevance: f32,
    pub metadata: Value,
}

/// Everything a provider hands back to the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct GatheredContext {
    pub items: Vec<ContextItem>,
    pub combined: String,
}

/// Uniform facade over the context sources.
#[async_trait]
pub trait ContextProvider: Send + Sync {
    async fn gather(&self, plan: &ExecutionPlan) -> GatheredContext;
}

// ---------------------------------------------------------------------------
// Combination
// ---------------------------------------------------------------------------

/// Merge items into the combined block: relevance-descending (stable), one
/// header per item, capped at the character budget.
pub fn combine(mut items: Vec<ContextItem>) -> GatheredContext {
    items.sort_by(|a, b| b.relevance.total_cmp(&a.relevance));

    let mut combined = String::new();
    for item in &items {
        let query = item
            .metadata
            .get("query")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        let block = format!("[{}: '{}']\n{}", item.source.header(), query, item.content);

        if !combined.is_empty() {
            if combined.chars().count() + 2 >= CONTEXT_BUDGET {
                break;
            }
            combined.push_str("\n\n");
        }
        let remaining = CONTEXT_BUDGET - combined.chars().count();
        combined.extend(block.chars().take(remaining));
        if remaining <= block.chars().count() {
            break;
        }
    }

    GatheredContext { items, combined }
}

fn plan_queries(queries: &[String]) -> impl Iterator<Item = &String> {
    queries
        .iter()
        .filter(|q| !q.trim().is_empty())
        .take(MAX_QUERIES_PER_PROVIDER)
}

// ---------------------------------------------------------------------------
// Web
// ---------------------------------------------------------------------------

/// Factual lookup via the web tool server.
pub struct WebProvider {
    invoker: Arc<dyn ToolInvoker>,
    server: String,
    tool: String,
}

impl WebProvider {
    pub fn new(invoker: Arc<dyn ToolInvoker>) -> Self {
        Self {
            invoker,
            server: "web".to_owned(),
            tool: "web_search".to_owned(),
        }
    }

    async fn search(&self, query: &str) -> ContextItem {
        debug!(query, "web context lookup");
        match self
            .invoker
            .invoke(
                &self.server,
                &self.tool,
                json!({"query": query, "max_results": 5}),
            )
            .await
        {
            Ok(value) => ContextItem {
                source: ContextSource::Web,
                content: truncate_chars(&render_tool_output(&value), 1_000),
                relevance: 0.9,
                metadata: json!({"query": query, "server": self.server, "tool": self.tool}),
            },
            Err(e) => {
                warn!(query, error = %e, "web search failed");
                ContextItem {
                    source: ContextSource::Web,
                    content: format!("Web search failed for: {query}. Error: {e}"),
                    relevance: 0.1,
                    metadata: json!({"query": query, "error": e.to_string()}),
                }
            }
        }
    }
}

#[async_trait]
impl ContextProvider for WebProvider {
    async fn gather(&self, plan: &ExecutionPlan) -> GatheredContext {
        let mut items = Vec::new();
        for query in plan_queries(&plan.search_queries) {
            items.push(self.search(query).await);
        }
        combine(items)
    }
}

// ---------------------------------------------------------------------------
// Rag
// ---------------------------------------------------------------------------

/// User-document retrieval via the rag tool server.
pub struct RagProvider {
    invoker: Arc<dyn ToolInvoker>,
    server: String,
    tool: String,
}

impl RagProvider {
    pub fn new(invoker: Arc<dyn ToolInvoker>) -> Self {
        Self {
            invoker,
            server: "rag".to_owned(),
            tool: "retrieve_context".to_owned(),
        }
    }

    async fn search(&self, query: &str) -> ContextItem {
        debug!(query, "rag context lookup");
        match self
            .invoker
            .invoke(&self.server, &self.tool, json!({"query": query, "top_k": 5}))
            .await
        {
            Ok(value) => ContextItem {
                source: ContextSource::Rag,
                content: truncate_chars(&render_tool_output(&value), 1_500),
                relevance: 0.85,
                metadata: json!({"query": query, "server": self.server, "tool": self.tool}),
            },
            Err(e) => {
                warn!(query, error = %e, "rag search failed");
                ContextItem {
                    source: ContextSource::Rag,
                    content: format!("Document search failed for: {query}. Error: {e}"),
                    relevance: 0.1,
                    metadata: json!({"query": query, "error": e.to_string()}),
                }
            }
        }
    }
}

#[async_trait]
impl ContextProvider for RagProvider {
    async fn gather(&self, plan: &ExecutionPlan) -> GatheredContext {
        let mut items = Vec::new();
        for query in plan_queries(&plan.rag_queries) {
            items.push(self.search(query).await);
        }
        combine(items)
    }
}

// ---------------------------------------------------------------------------
// Club
// ---------------------------------------------------------------------------

const CLUB_CATEGORIES: &[&str] = &["events", "announcements", "coordinators", "general"];
const CLUB_TOP_K: usize = 3;

/// Club-knowledge retrieval with LLM category classification.
pub struct ClubProvider {
    llm: Arc<dyn LlmClient>,
    retrieval: Arc<RetrievalService>,
}

impl ClubProvider {
    pub fn new(llm: Arc<dyn LlmClient>, retrieval: Arc<RetrievalService>) -> Self {
        Self { llm, retrieval }
    }

    /// Single-word classification, validated against the category set.
    async fn classify(&self, query: &str) -> String {
        let prompt = format!(
            "Classify this club-knowledge query into exactly one category out \
             of: events, announcements, coordinators, general.\n\
             Reply with the single category word only.\n\nQuery: {query}"
        );
        let answer = match self.llm.complete(&[Message::user(prompt)]).await {
            Ok(answer) => answer.trim().to_ascii_lowercase(),
            Err(e) => {
                warn!(error = %e, "club category classification failed");
                String::new()
            }
        };
        if CLUB_CATEGORIES.contains(&answer.as_str()) {
            answer
        } else {
            "general".to_owned()
        }
    }

    async fn search(&self, query: &str) -> ContextItem {
        let category = self.classify(query).await;
        debug!(query, category, "club context lookup");

        let filter = (category != "general").then(|| MetadataFilter {
            key: "category".to_owned(),
            value: Value::String(category.clone()),
        });
        let rows = match self
            .retrieval
            .retrieve_filtered(query, CLUB_TOP_K, filter.as_ref())
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                warn!(query, error = %e, "club search failed");
                return ContextItem {
                    source: ContextSource::Club,
                    content: format!("Club search failed for: {query}. Error: {e}"),
                    relevance: 0.1,
                    metadata: json!({"query": query, "category": category, "error": e.to_string()}),
                };
            }
        };

        if rows.is_empty() {
            return ContextItem {
                source: ContextSource::Club,
                content: "No club information found for this query.".to_owned(),
                relevance: 0.0,
                metadata: json!({"query": query, "category": category, "results_count": 0}),
            };
        }

        // Fold every row into one item; relevance is the mean row score.
        let mut content = String::new();
        let mut total = 0.0f32;
        for (i, row) in rows.iter().enumerate() {
            content.push_str(&format!(
                "Result {} (Relevance: {:.2}):\n{}\n\n",
                i + 1,
                row.score,
                row.text
            ));
            total += row.score;
        }
        ContextItem {
            source: ContextSource::Club,
            content: content.trim_end().to_owned(),
            relevance: total / rows.len() as f32,
            metadata: json!({
                "query": query,
                "category": category,
                "results_count": rows.len(),
            }),
        }
    }
}

#[async_trait]
impl ContextProvider for ClubProvider {
    async fn gather(&self, plan: &ExecutionPlan) -> GatheredContext {
        let mut items = Vec::new();
        for query in plan_queries(&plan.club_queries) {
            items.push(self.search(query).await);
        }
        combine(items)
    }
}

// ---------------------------------------------------------------------------
// Mixed
// ---------------------------------------------------------------------------

/// Runs web, rag, club in that order for non-empty query lists and merges
/// under the global budget.
pub struct MixedProvider {
    web: Arc<WebProvider>,
    rag: Arc<RagProvider>,
    club: Arc<ClubProvider>,
}

impl MixedProvider {
    pub fn new(web: Arc<WebProvider>, rag: Arc<RagProvider>, club: Arc<ClubProvider>) -> Self {
        Self { web, rag, club }
    }
}

#[async_trait]
impl ContextProvider for MixedProvider {
    async fn gather(&self, plan: &ExecutionPlan) -> GatheredContext {
        let mut items = Vec::new();
        if !plan.search_queries.is_empty() {
            items.extend(self.web.gather(plan).await.items);
        }
        if !plan.rag_queries.is_empty() {
            items.extend(self.rag.gather(plan).await.items);
        }
        if !plan.club_queries.is_empty() {
            items.extend(self.club.gather(plan).await.items);
        }
        combine(items)
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Owns the four providers and dispatches on the plan's context type.
pub struct ContextRouter {
    web: Arc<WebProvider>,
    rag: Arc<RagProvider>,
    club: Arc<ClubProvider>,
    mixed: MixedProvider,
}

impl ContextRouter {
    pub fn new(
        invoker: Arc<dyn ToolInvoker>,
        llm: Arc<dyn LlmClient>,
        retrieval: Arc<RetrievalService>,
    ) -> Self {
        let web = Arc::new(WebProvider::new(Arc::clone(&invoker)));
        let rag = Arc::new(RagProvider::new(invoker));
        let club = Arc::new(ClubProvider::new(llm, retrieval));
        let mixed = MixedProvider::new(Arc::clone(&web), Arc::clone(&rag), Arc::clone(&club));
        Self {
            web,
            rag,
            club,
            mixed,
        }
    }

    /// Gather context for the plan, or nothing when the plan asks for none.
    pub async fn gather(&self, plan: &ExecutionPlan) -> GatheredContext {
        if !plan.needs_context {
            return GatheredContext::default();
        }
        match plan.context_type {
            ContextType::Web => self.web.gather(plan).await,
            ContextType::Rag => self.rag.gather(plan).await,
            ContextType::Club => self.club.gather(plan).await,
            ContextType::Mixed => self.mixed.gather(plan).await,
            ContextType::None => GatheredContext::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Rendering helpers
// ---------------------------------------------------------------------------

/// Render a tool server's JSON payload as readable text.
fn render_tool_output(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(rows) => rows
            .iter()
            .map(render_row)
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Object(map) => {
            // Common envelope shapes first.
            for key in ["results", "chunks"] {
                if let Some(Value::Array(rows)) = map.get(key) {
                    return rows.iter().map(render_row).collect::<Vec<_>>().join("\n");
                }
            }
            value.to_string()
        }
        other => other.to_string(),
    }
}

fn render_row(row: &Value) -> String {
    if let Value::Object(map) = row {
        let title = map.get("title").and_then(Value::as_str);
        let body = map
            .get("snippet")
            .or_else(|| map.get("text"))
            .and_then(Value::as_str);
        match (title, body) {
            (Some(t), Some(b)) => return format!("{t}: {b}"),
            (None, Some(b)) => return b.to_owned(),
            (Some(t), None) => return t.to_owned(),
            (None, None) => {}
        }
    }
    row.to_string()
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockInvoker, MockLlm, club_retrieval_fixture};

    fn plan_with(
        context_type: ContextType,
        web: &[&str],
        rag: &[&str],
        club: &[&str],
    ) -> ExecutionPlan {
        let mut plan = ExecutionPlan::default_conversational();
        plan.needs_context = true;
        plan.context_type = context_type;
        plan.search_queries = web.iter().map(|s| (*s).to_owned()).collect();
        plan.rag_queries = rag.iter().map(|s| (*s).to_owned()).collect();
        plan.club_queries = club.iter().map(|s| (*s).to_owned()).collect();
        plan
    }

    #[test]
    fn combine_orders_by_relevance_with_stable_ties() {
        let item = |source, relevance: f32, query: &str| ContextItem {
            source,
            content: format!("content for {query}"),
            relevance,
            metadata: json!({"query": query}),
        };
        // Insertion order is provider order: web items then rag then club.
        let gathered = combine(vec![
            item(ContextSource::Web, 0.9, "w1"),
            item(ContextSource::Web, 0.5, "w2"),
            item(ContextSource::Rag, 0.9, "r1"),
            item(ContextSource::Club, 0.9, "c1"),
        ]);

        let order: Vec<&str> = gathered
            .items
            .iter()
            .map(|i| i.metadata["query"].as_str().unwrap())
            .collect();
        // Ties at 0.9 keep web < rag < club; the 0.5 item sinks.
        assert_eq!(order, vec!["w1", "r1", "c1", "w2"]);
        assert!(gathered.combined.starts_with("[Web Search: 'w1']"));
    }

    #[test]
    fn combine_respects_the_character_budget() {
        let items: Vec<ContextItem> = (0..10)
            .map(|i| ContextItem {
                source: ContextSource::Web,
                content: "x".repeat(800),
                relevance: 0.9 - i as f32 * 0.01,
                metadata: json!({"query": format!("q{i}")}),
            })
            .collect();
        let gathered = combine(items);
        assert!(gathered.combined.chars().count() <= CONTEXT_BUDGET);
        assert!(!gathered.combined.is_empty());
    }

    #[tokio::test]
    async fn web_provider_wraps_success_and_failure() {
        let invoker = Arc::new(MockInvoker::new().with_tool(
            "web",
            "web_search",
            |args| {
                let query = args["query"].as_str().unwrap().to_owned();
                if query.contains("fail") {
                    Err(parley_kernel::KernelError::Timeout {
                        server: "web".into(),
                        method: "call_tool".into(),
                    })
                } else {
                    Ok(json!([{"title": "PID", "snippet": "a control loop"}]))
                }
            },
        ));
        let provider = WebProvider::new(invoker);

        let plan = plan_with(ContextType::Web, &["what is pid", "fail this one"], &[], &[]);
        let gathered = provider.gather(&plan).await;

        assert_eq!(gathered.items.len(), 2);
        assert_eq!(gathered.items[0].relevance, 0.9);
        assert!(gathered.items[0].content.contains("PID: a control loop"));
        assert_eq!(gathered.items[1].relevance, 0.1);
        assert!(gathered.items[1].content.contains("Web search failed"));
    }

    #[tokio::test]
    async fn web_provider_caps_queries_at_two() {
        let invoker = Arc::new(MockInvoker::new().with_tool("web", "web_search", |_| {
            Ok(json!("ok"))
        }));
        let provider = WebProvider::new(Arc::clone(&invoker) as Arc<dyn ToolInvoker>);

        let plan = plan_with(ContextType::Web, &["a", "b", "c"], &[], &[]);
        let gathered = provider.gather(&plan).await;
        assert_eq!(gathered.items.len(), 2);
        assert_eq!(invoker.call_count(), 2);
    }

    #[tokio::test]
    async fn club_provider_classifies_and_folds_rows() {
        let (retrieval, _dirs) = club_retrieval_fixture().await;
        let provider = ClubProvider::new(
            Arc::new(MockLlm::completion("coordinators")),
            Arc::new(retrieval),
        );

        let plan = plan_with(ContextType::Club, &[], &[], &["who coordinates RoboSprint"]);
        let gathered = provider.gather(&plan).await;

        assert_eq!(gathered.items.len(), 1);
        let item = &gathered.items[0];
        assert_eq!(item.metadata["category"], "coordinators");
        assert!(item.content.contains("Result 1 (Relevance:"));
        assert!(item.content.contains("Priya Nair"));
        assert!(item.relevance > 0.0);
    }

    #[tokio::test]
    async fn club_provider_defaults_invalid_category_to_general() {
        let (retrieval, _dirs) = club_retrieval_fixture().await;
        let provider = ClubProvider::new(
            Arc::new(MockLlm::completion("I think it's about events, mostly")),
            Arc::new(retrieval),
        );

        let plan = plan_with(ContextType::Club, &[], &[], &["anything new?"]);
        let gathered = provider.gather(&plan).await;
        assert_eq!(gathered.items[0].metadata["category"], "general");
    }

    #[tokio::test]
    async fn mixed_provider_merges_sources_in_order() {
        let invoker = Arc::new(
            MockInvoker::new()
                .with_tool("web", "web_search", |_| Ok(json!("web result")))
                .with_tool("rag", "retrieve_context", |_| {
                    Ok(json!({"chunks": [{"text": "doc result", "score": 0.7}]}))
                }),
        );
        let (retrieval, _dirs) = club_retrieval_fixture().await;
        let router = ContextRouter::new(
            invoker,
            Arc::new(MockLlm::completion("general")),
            Arc::new(retrieval),
        );

        let plan = plan_with(
            ContextType::Mixed,
            &["vector databases"],
            &["our docs on vector databases"],
            &[],
        );
        let gathered = router.gather(&plan).await;

        let sources: Vec<ContextSource> = gathered.items.iter().map(|i| i.source).collect();
        assert_eq!(sources, vec![ContextSource::Web, ContextSource::Rag]);
        assert!(gathered.combined.contains("[Web Search:"));
        assert!(gathered.combined.contains("[RAG Search:"));
    }

    #[tokio::test]
    async fn no_context_plans_gather_nothing() {
        let invoker = Arc::new(MockInvoker::new());
        let (retrieval, _dirs) = club_retrieval_fixture().await;
        let router = ContextRouter::new(
            invoker,
            Arc::new(MockLlm::completion("general")),
            Arc::new(retrieval),
        );

        let gathered = router.gather(&ExecutionPlan::default_conversational()).await;
        assert!(gathered.items.is_empty());
        assert!(gathered.combined.is_empty());
    }
}
