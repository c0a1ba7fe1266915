//! Safety gate.
//!
//! Two-stage filter over the raw user query, run before any planning:
//!
//! 1. A synchronous pattern stage: configurable case-insensitive regexes
//!    over the query.  Any match trips the gate.
//! 2. An optional LLM stage, consulted only when the query contains one of
//!    the "soft" keywords (hack, exploit, ...).  A `YES`-prefixed answer
//!    trips the gate; an LLM failure lets the query through.
//!
//! A tripped gate short-circuits the whole request with a fixed canned
//! response; the planner is never consulted and no tool is ever called.

use std::sync::Arc;

use aho_corasick::AhoCorasick;
use regex::Regex;
use tracing::{debug, warn};

use crate::llm::{LlmClient, Message};

/// The fixed refusal returned verbatim for a tripped query.
pub const REFUSAL_MESSAGE: &str = "\
I cannot assist with that request. I'm here to help with club activities like:

- Answering technical questions about robotics, programming, and control systems
- Searching for code examples, research papers, and documentation
- Finding information in your documents and the club knowledge base
- Scheduling meetings and managing email and calendar events

How can I help you with these tasks?";

const DEFAULT_PATTERNS: &[&str] = &[
    r"(?i)\bdelete\s+(all|everything|files?|repos?|emails?)\b",
    r"(?i)\bremove\s+(all|everything)\b",
    r"(?i)\bdestroy\b",
    r"(?i)\bwipe\s+out\b",
];

const SOFT_KEYWORDS: &[&str] = &[
    "hack",
    "exploit",
    "bypass",
    "cheat",
    "steal",
    "plagiarize",
    "illegal",
];

/// The gate's decision for one query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// Proceed to planning.
    Pass,
    /// Stop; reply with the canned response.
    Trip,
}

impl GateDecision {
    pub fn is_trip(&self) -> bool {
        matches!(self, Self::Trip)
    }
}

/// Deterministic pattern filter with optional LLM confirmation.
pub struct SafetyGate {
    patterns: Vec<Regex>,
    soft_keywords: AhoCorasick,
    llm: Option<Arc<dyn LlmClient>>,
}

impl SafetyGate {
    /// Gate with the default destructive patterns and no LLM stage.
    pub fn new() -> Self {
        Self::with_patterns(DEFAULT_PATTERNS.iter().copied())
            .expect("default patterns are valid")
    }

    /// Gate with caller-supplied patterns.
    pub fn with_patterns<'a>(
        patterns: impl IntoIterator<Item = &'a str>,
    ) -> Result<Self, regex::Error> {
        let patterns = patterns
            .into_iter()
            .map(Regex::new)
            .collect::<Result<Vec<_>, _>>()?;
        let soft_keywords = AhoCorasick::builder()
            .ascii_case_insensitive(true)
            .build(SOFT_KEYWORDS)
            .expect("soft keyword set is valid");
        Ok(Self {
            patterns,
            soft_keywords,
            llm: None,
        })
    }

    /// Enable the LLM confirmation stage for soft-keyword queries.
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// Run both stages over `query`.
    pub async fn check(&self, query: &str) -> GateDecision {
        if let Some(pattern) = self.patterns.iter().find(|p| p.is_match(query)) {
            warn!(pattern = %pattern.as_str(), "query tripped safety pattern");
            return GateDecision::Trip;
        }

        if self.soft_keywords.is_match(query) {
            if let Some(llm) = &self.llm {
                return self.llm_stage(llm.as_ref(), query).await;
            }
            debug!("soft keyword present but no llm stage configured; passing");
        }

        GateDecision::Pass
    }

    async fn llm_stage(&self, llm: &dyn LlmClient, query: &str) -> GateDecision {
        let prompt = format!(
            "Is this query requesting something unethical or harmful?\n\
             Query: {query}\n\n\
             Answer with just \"YES\" or \"NO\" and a brief reason."
        );
        match llm.complete(&[Message::user(prompt)]).await {
            Ok(answer) => {
                if answer.trim().to_ascii_uppercase().starts_with("YES") {
                    warn!("query tripped llm safety stage");
                    GateDecision::Trip
                } else {
                    GateDecision::Pass
                }
            }
            Err(e) => {
                // The pattern stage already passed; do not block on an
                // unavailable model.
                warn!(error = %e, "llm safety stage failed; passing query");
                GateDecision::Pass
            }
        }
    }
}

impl Default for SafetyGate {
    fn default() -> Self {
        Self::new()
    }
}
