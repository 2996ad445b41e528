//! BM25 relevance ranking over paragraph chunks.

use std::collections::HashMap;

use serde_json::{Map, Value};

use super::{chunk_text, param_str, param_usize, search_mode, Processor, StageOutput};

const DEFAULT_TOP_K: usize = 5;

pub struct Bm25Processor {
    k1: f64,
    b: f64,
}

impl Default for Bm25Processor {
    fn default() -> Self {
        Self { k1: 1.5, b: 0.75 }
    }
}

impl Processor for Bm25Processor {
    fn name(&self) -> &'static str {
        "bm25"
    }

    fn run(
        &self,
        content: &str,
        params: &Map<String, Value>,
    ) -> Option<Result<StageOutput, String>> {
        let pattern = param_str(params, "pattern")?;
        if search_mode(params) != "bm25" {
            return None;
        }
        let top_k = param_usize(params, "top_k", DEFAULT_TOP_K).max(1);
        Some(Ok(self.rank(content, pattern, top_k)))
    }
}

impl Bm25Processor {
    fn rank(&self, content: &str, query: &str, top_k: usize) -> StageOutput {
        let chunks = chunk_text(content);
        let query_terms = tokenize(query);

        let mut metadata = Map::new();
        metadata.insert("chunks".to_string(), Value::from(chunks.len()));

        if chunks.is_empty() || query_terms.is_empty() {
            metadata.insert("returned".to_string(), Value::from(0));
            return StageOutput::applied(String::new(), metadata);
        }

        let chunk_tokens: Vec<Vec<String>> = chunks.iter().map(|c| tokenize(c)).collect();
        let doc_count = chunks.len();
        let avg_len =
            chunk_tokens.iter().map(Vec::len).sum::<usize>() as f64 / doc_count as f64;

        // Document frequency per query term.
        let mut doc_freq: HashMap<&str, usize> = HashMap::new();
        for term in &query_terms {
            let df = chunk_tokens
                .iter()
                .filter(|tokens| tokens.iter().any(|t| t == term))
                .count();
            doc_freq.insert(term, df);
        }

        let mut scored: Vec<(usize, f64)> = Vec::new();
        for (idx, tokens) in chunk_tokens.iter().enumerate() {
            let score = self.score(tokens, &query_terms, &doc_freq, doc_count, avg_len);
            if score > 0.0 {
                scored.push((idx, score));
            }
        }
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(top_k);

        let rendered = scored
            .iter()
            .map(|(idx, score)| format!("[score={score:.4}] {}", chunks[*idx]))
            .collect::<Vec<_>>()
            .join("\n\n");

        metadata.insert("returned".to_string(), Value::from(scored.len()));
        StageOutput::applied(rendered, metadata)
    }

    fn score(
        &self,
        tokens: &[String],
        query_terms: &[String],
        doc_freq: &HashMap<&str, usize>,
        doc_count: usize,
        avg_len: f64,
    ) -> f64 {
        let mut term_freq: HashMap<&str, usize> = HashMap::new();
        for token in tokens {
            *term_freq.entry(token.as_str()).or_insert(0) += 1;
        }
        let len = tokens.len() as f64;

        let mut score = 0.0;
        for term in query_terms {
            let tf = term_freq.get(term.as_str()).copied().unwrap_or(0) as f64;
            if tf == 0.0 {
                continue;
            }
            let df = doc_freq.get(term.as_str()).copied().unwrap_or(0) as f64;
            if df == 0.0 {
                continue;
            }
            let idf = ((doc_count as f64 - df + 0.5) / (df + 0.5) + 1.0).ln();
            score += idf * (tf * (self.k1 + 1.0))
                / (tf + self.k1 * (1.0 - self.b + self.b * len / avg_len));
        }
        score
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}
