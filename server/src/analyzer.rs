//! Query analysis: intent and difficulty classification driving the
//! retrieval strategy.
//!
//! The heuristic classifier is always available and always used when the
//! model-based mode (query-understand session) is disabled or unavailable.
//! Explicit weights in the request override whatever the analyzer decides.

use regex::Regex;
use std::sync::{Arc, OnceLock};

use crate::runtime::{ModelRuntime, SessionKind, Tensor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Navigational,
    Factual,
    Exploratory,
    Analytical,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Navigational => "navigational",
            Intent::Factual => "factual",
            Intent::Exploratory => "exploratory",
            Intent::Analytical => "analytical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

impl Difficulty {
    pub fn as_str(&self) -> &'static str {
        match self {
            Difficulty::Easy => "easy",
            Difficulty::Medium => "medium",
            Difficulty::Hard => "hard",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    SparseOnly,
    Balanced,
    DenseHeavy,
    DeepRerank,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::SparseOnly => "sparse-only",
            Strategy::Balanced => "balanced",
            Strategy::DenseHeavy => "dense-heavy",
            Strategy::DeepRerank => "deep-rerank",
        }
    }

    /// (sparse_weight, dense_weight) — the one consistent set.
    pub fn weights(&self) -> (f32, f32) {
        match self {
            Strategy::SparseOnly => (1.0, 0.0),
            Strategy::Balanced => (0.5, 0.5),
            Strategy::DenseHeavy => (0.3, 0.7),
            Strategy::DeepRerank => (0.4, 0.6),
        }
    }

    pub fn enable_rerank(&self) -> bool {
        !matches!(self, Strategy::SparseOnly)
    }

    /// Pass-2 of the reranker runs only for deep-rerank.
    pub fn deep(&self) -> bool {
        matches!(self, Strategy::DeepRerank)
    }
}

/// Analyzer output. The caller may override weights and rerank enablement.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub intent: Intent,
    pub difficulty: Difficulty,
    pub strategy: Strategy,
    pub sparse_weight: f32,
    pub dense_weight: f32,
    pub enable_rerank: bool,
    pub confidence: f32,
    /// Query actually sent to the retrievers (expansion may append terms).
    pub expanded_query: String,
}

// ---------------------------------------------------------------------------
// Token classification
// ---------------------------------------------------------------------------

fn camel_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[a-z0-9][A-Z]").expect("static regex"))
}

fn ext_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\w[\w-]*\.[A-Za-z0-9]{1,6}$").expect("static regex"))
}

fn is_identifier_token(tok: &str) -> bool {
    let snake = tok.contains('_') && tok.chars().all(|c| c.is_alphanumeric() || c == '_');
    snake || camel_re().is_match(tok)
}

fn is_path_token(tok: &str) -> bool {
    tok.contains('/') && tok.len() > 1
}

fn is_ext_token(tok: &str) -> bool {
    ext_re().is_match(tok)
}

const CAUSAL_WORDS: [&str; 10] = [
    "versus", "vs", "compare", "comparison", "difference", "better", "because", "cause",
    "impact", "tradeoff",
];

/// Split a CamelCase or snake_case identifier into its words.
pub fn split_identifier(tok: &str) -> Vec<String> {
    let mut words = Vec::new();
    for part in tok.split('_') {
        let mut cur = String::new();
        for ch in part.chars() {
            if ch.is_uppercase() && !cur.is_empty() {
                words.push(std::mem::take(&mut cur));
            }
            cur.extend(ch.to_lowercase());
        }
        if !cur.is_empty() {
            words.push(cur);
        }
    }
    words.retain(|w| w.len() > 1);
    words
}

// ---------------------------------------------------------------------------
// Analyzer
// ---------------------------------------------------------------------------

pub struct QueryAnalyzer {
    /// Query-understand session; `None` keeps the analyzer heuristic-only.
    runtime: Option<Arc<ModelRuntime>>,
}

impl QueryAnalyzer {
    pub fn heuristic() -> Self {
        QueryAnalyzer { runtime: None }
    }

    pub fn with_model(runtime: Arc<ModelRuntime>) -> Self {
        QueryAnalyzer { runtime: Some(runtime) }
    }

    /// Classify the query. Falls back to heuristics whenever the model is
    /// disabled or errors.
    pub async fn analyze(&self, query: &str, enable_expansion: bool) -> QueryPlan {
        if let Some(runtime) = &self.runtime {
            if let Some(plan) = self.model_classify(runtime, query, enable_expansion).await {
                return plan;
            }
        }
        heuristic_classify(query, enable_expansion)
    }

    async fn model_classify(
        &self,
        runtime: &Arc<ModelRuntime>,
        query: &str,
        enable_expansion: bool,
    ) -> Option<QueryPlan> {
        let active = runtime.acquire(SessionKind::QueryUnderstand).await.ok()?;
        let enc = active.entry().encoder.encode(query, true).ok()?;
        let seq = enc.ids.len().max(1);
        let outputs = active
            .run(vec![
                ("input_ids".into(), Tensor::I64 { shape: vec![1, seq], data: enc.ids }),
                (
                    "attention_mask".into(),
                    Tensor::I64 { shape: vec![1, seq], data: enc.attention_mask },
                ),
            ])
            .ok()?;
        let logits = outputs.first().map(|(_, t)| t)?.f32_data().ok()?;
        if logits.len() < 7 {
            return None;
        }

        let intent = match argmax(&logits[0..4]) {
            0 => Intent::Navigational,
            1 => Intent::Factual,
            3 => Intent::Analytical,
            _ => Intent::Exploratory,
        };
        let difficulty = match argmax(&logits[4..7]) {
            0 => Difficulty::Easy,
            2 => Difficulty::Hard,
            _ => Difficulty::Medium,
        };
        let strategy = match (intent, difficulty) {
            (Intent::Navigational, _) => Strategy::SparseOnly,
            (Intent::Analytical, _) => Strategy::DeepRerank,
            (Intent::Exploratory, Difficulty::Hard) => Strategy::DenseHeavy,
            _ => Strategy::Balanced,
        };
        let confidence = softmax_max(&logits[0..4]);
        Some(build_plan(query, intent, difficulty, strategy, confidence, enable_expansion))
    }
}

fn argmax(xs: &[f32]) -> usize {
    xs.iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

fn softmax_max(xs: &[f32]) -> f32 {
    let max = xs.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let denom: f32 = xs.iter().map(|x| (x - max).exp()).sum();
    if denom > 0.0 {
        1.0 / denom
    } else {
        0.5
    }
}

/// The always-available classifier.
pub fn heuristic_classify(query: &str, enable_expansion: bool) -> QueryPlan {
    let trimmed = query.trim();
    let tokens: Vec<&str> = trimmed.split_whitespace().collect();
    let lower = trimmed.to_lowercase();

    let quoted = trimmed.matches('"').count() >= 2;
    let identifier_tokens =
        tokens.iter().filter(|t| is_identifier_token(t) || is_path_token(t) || is_ext_token(t)).count();
    let natural_tokens = tokens
        .iter()
        .filter(|t| t.chars().all(|c| c.is_alphabetic()) && !is_identifier_token(t))
        .count();

    let navigational = quoted
        || tokens.iter().any(|t| is_ext_token(t))
        || tokens.iter().any(|t| is_path_token(t))
        || (identifier_tokens > 0 && identifier_tokens >= natural_tokens);

    let analytical = lower.starts_with("how ")
        || lower.starts_with("why ")
        || lower.starts_with("what does")
        || CAUSAL_WORDS.iter().any(|w| lower.split_whitespace().any(|t| t == *w))
        || tokens.len() > 12;

    let symbols_only = !trimmed.is_empty() && !trimmed.chars().any(|c| c.is_alphabetic());

    let (intent, strategy, confidence) = if navigational {
        (Intent::Navigational, Strategy::SparseOnly, 0.9)
    } else if analytical {
        (Intent::Analytical, Strategy::DeepRerank, 0.75)
    } else if symbols_only {
        (Intent::Factual, Strategy::Balanced, 0.6)
    } else {
        (Intent::Exploratory, Strategy::Balanced, 0.6)
    };

    let difficulty = if tokens.len() > 12 || intent == Intent::Analytical {
        Difficulty::Hard
    } else if tokens.len() <= 3 {
        Difficulty::Easy
    } else {
        Difficulty::Medium
    };

    build_plan(query, intent, difficulty, strategy, confidence, enable_expansion)
}

fn build_plan(
    query: &str,
    intent: Intent,
    difficulty: Difficulty,
    strategy: Strategy,
    confidence: f32,
    enable_expansion: bool,
) -> QueryPlan {
    let (sparse_weight, dense_weight) = strategy.weights();
    QueryPlan {
        intent,
        difficulty,
        strategy,
        sparse_weight,
        dense_weight,
        enable_rerank: strategy.enable_rerank(),
        confidence,
        expanded_query: expand_query(query, intent, enable_expansion),
    }
}

/// Identifier-aware expansion: append the split words of CamelCase and
/// snake_case tokens so lexical retrieval sees both spellings.
fn expand_query(query: &str, intent: Intent, enable_expansion: bool) -> String {
    let trimmed = query.trim();
    if !enable_expansion || intent != Intent::Navigational {
        return trimmed.to_string();
    }
    let mut extra: Vec<String> = Vec::new();
    for tok in trimmed.split_whitespace() {
        if is_identifier_token(tok) {
            for word in split_identifier(tok) {
                if !trimmed.to_lowercase().split_whitespace().any(|t| t == word) {
                    extra.push(word);
                }
            }
        }
    }
    if extra.is_empty() {
        trimmed.to_string()
    } else {
        format!("{trimmed} {}", extra.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(q: &str) -> QueryPlan {
        heuristic_classify(q, true)
    }

    #[test]
    fn test_navigational_signals() {
        for q in [
            "\"exact phrase here\"",
            "auth.ts",
            "src/indexer/mod",
            "getUserName",
            "parse_config input",
        ] {
            let plan = classify(q);
            assert_eq!(plan.intent, Intent::Navigational, "query {q:?}");
            assert_eq!(plan.strategy, Strategy::SparseOnly);
            assert_eq!(plan.sparse_weight, 1.0);
            assert_eq!(plan.dense_weight, 0.0);
            assert!(!plan.enable_rerank);
        }
    }

    #[test]
    fn test_analytical_signals() {
        for q in [
            "how does the indexer detect changed files",
            "why is the reranker slow on cold start",
            "what does the fusion stage actually compute",
            "tokio versus rayon for cpu bound workloads",
        ] {
            let plan = classify(q);
            assert_eq!(plan.intent, Intent::Analytical, "query {q:?}");
            assert_eq!(plan.strategy, Strategy::DeepRerank);
            assert!(plan.enable_rerank);
            assert_eq!(plan.difficulty, Difficulty::Hard);
        }
    }

    #[test]
    fn test_long_queries_are_hard_analytical() {
        let q = "find the place where the retry loop gives up and logs the final error for uploads";
        let plan = classify(q);
        assert_eq!(plan.intent, Intent::Analytical);
        assert_eq!(plan.difficulty, Difficulty::Hard);
    }

    #[test]
    fn test_symbols_only_is_factual() {
        let plan = classify("=> !== ??");
        assert_eq!(plan.intent, Intent::Factual);
        assert_eq!(plan.strategy, Strategy::Balanced);
    }

    #[test]
    fn test_default_is_exploratory_balanced() {
        let plan = classify("retry logic for uploads");
        assert_eq!(plan.intent, Intent::Exploratory);
        assert_eq!(plan.strategy, Strategy::Balanced);
        assert_eq!(plan.sparse_weight, 0.5);
        assert_eq!(plan.dense_weight, 0.5);
    }

    #[test]
    fn test_weights_sum_at_most_one() {
        for s in [Strategy::SparseOnly, Strategy::Balanced, Strategy::DenseHeavy, Strategy::DeepRerank]
        {
            let (sw, dw) = s.weights();
            assert!(sw + dw <= 1.0 + 1e-6);
            assert!((0.0..=1.0).contains(&sw));
            assert!((0.0..=1.0).contains(&dw));
        }
    }

    #[test]
    fn test_identifier_splitting() {
        assert_eq!(split_identifier("getUserName"), vec!["get", "user", "name"]);
        assert_eq!(split_identifier("parse_config_file"), vec!["parse", "config", "file"]);
    }

    #[test]
    fn test_expansion_appends_identifier_words() {
        let plan = classify("getUserName");
        assert!(plan.expanded_query.starts_with("getUserName"));
        assert!(plan.expanded_query.contains("user"));
        // Disabled expansion leaves the query untouched
        let plan = heuristic_classify("getUserName", false);
        assert_eq!(plan.expanded_query, "getUserName");
    }
}
