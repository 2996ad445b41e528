//! Fuzzy search: windowed Levenshtein similarity over paragraph chunks.

use serde_json::{Map, Value};

use super::{
    chunk_text, param_str, param_usize, search_mode, Processor, StageOutput, DEFAULT_MAX_RESULTS,
};

const DEFAULT_THRESHOLD: f64 = 0.7;

pub struct FuzzyProcessor;

impl Processor for FuzzyProcessor {
    fn name(&self) -> &'static str {
        "fuzzy"
    }

    fn run(
        &self,
        content: &str,
        params: &Map<String, Value>,
    ) -> Option<Result<StageOutput, String>> {
        let pattern = param_str(params, "pattern")?;
        if search_mode(params) != "fuzzy" {
            return None;
        }
        let threshold = match params.get("fuzzy_threshold") {
            Some(value) => match value.as_f64() {
                Some(t) if (0.0..=1.0).contains(&t) => t,
                _ => {
                    return Some(Err(format!(
                        "fuzzy_threshold must be a number in [0, 1], got {value}"
                    )));
                }
            },
            None => DEFAULT_THRESHOLD,
        };
        let max_results = param_usize(params, "max_results", DEFAULT_MAX_RESULTS).max(1);
        Some(Ok(apply(content, pattern, threshold, max_results)))
    }
}

fn apply(content: &str, pattern: &str, threshold: f64, max_results: usize) -> StageOutput {
    let chunks = chunk_text(content);
    let pattern_tokens: Vec<String> = pattern
        .to_lowercase()
        .split_whitespace()
        .map(str::to_string)
        .collect();

    let mut metadata = Map::new();
    metadata.insert("chunks".to_string(), Value::from(chunks.len()));
    metadata.insert("threshold".to_string(), Value::from(threshold));

    if pattern_tokens.is_empty() || chunks.is_empty() {
        metadata.insert("returned".to_string(), Value::from(0));
        return StageOutput::applied(String::new(), metadata);
    }
    let needle = pattern_tokens.join(" ");

    let mut scored: Vec<(usize, f64)> = Vec::new();
    for (idx, chunk) in chunks.iter().enumerate() {
        let score = chunk_score(chunk, &needle, pattern_tokens.len());
        if score >= threshold {
            scored.push((idx, score));
        }
    }
    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    scored.truncate(max_results);

    let rendered = scored
        .iter()
        .map(|(idx, score)| format!("[score={score:.2}] {}", chunks[*idx]))
        .collect::<Vec<_>>()
        .join("\n\n");

    metadata.insert("returned".to_string(), Value::from(scored.len()));
    StageOutput::applied(rendered, metadata)
}

/// Best similarity between the pattern and any window of `window_tokens`
/// consecutive tokens in the chunk.
fn chunk_score(chunk: &str, needle: &str, window_tokens: usize) -> f64 {
    let tokens: Vec<String> = chunk
        .to_lowercase()
        .split_whitespace()
        .map(str::to_string)
        .collect();
    if tokens.is_empty() {
        return 0.0;
    }

    let window_tokens = window_tokens.min(tokens.len());
    let mut best = 0.0_f64;
    for start in 0..=(tokens.len() - window_tokens) {
        let window = tokens[start..start + window_tokens].join(" ");
        let similarity = similarity(needle, &window);
        if similarity > best {
            best = similarity;
        }
        if best == 1.0 {
            break;
        }
    }
    best
}

fn similarity(a: &str, b: &str) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let distance = levenshtein(a, b) as f64;
    let max_len = a.chars().count().max(b.chars().count()) as f64;
    1.0 - distance / max_len
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.len() < b.len() {
        return levenshtein_rows(&b, &a);
    }
    levenshtein_rows(&a, &b)
}

fn levenshtein_rows(longer: &[char], shorter: &[char]) -> usize {
    if shorter.is_empty() {
        return longer.len();
    }
    let mut previous: Vec<usize> = (0..=shorter.len()).collect();
    let mut current = vec![0usize; shorter.len() + 1];
    for (i, &c1) in longer.iter().enumerate() {
        current[0] = i + 1;
        for (j, &c2) in shorter.iter().enumerate() {
            let insertions = previous[j + 1] + 1;
            let deletions = current[j] + 1;
            let substitutions = previous[j] + usize::from(c1 != c2);
            current[j + 1] = insertions.min(deletions).min(substitutions);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[shorter.len()]
}
