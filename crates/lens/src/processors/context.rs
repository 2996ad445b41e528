//! Context extraction: the enclosing paragraph around each pattern match.

use regex::RegexBuilder;
use serde_json::{Map, Value};

use super::search::BLOCK_SEPARATOR;
use super::{
    param_bool, param_str, param_usize, search_mode, Processor, StageOutput, DEFAULT_MAX_RESULTS,
};

pub struct ContextProcessor;

impl Processor for ContextProcessor {
    fn name(&self) -> &'static str {
        "context"
    }

    fn run(
        &self,
        content: &str,
        params: &Map<String, Value>,
    ) -> Option<Result<StageOutput, String>> {
        let pattern = param_str(params, "pattern")?;
        if search_mode(params) != "context" {
            return None;
        }
        Some(apply(content, pattern, params))
    }
}

fn apply(content: &str, pattern: &str, params: &Map<String, Value>) -> Result<StageOutput, String> {
    let case_insensitive = param_bool(params, "case_insensitive");
    let max_results = param_usize(params, "max_results", DEFAULT_MAX_RESULTS).max(1);
    let context_lines = param_usize(params, "context_lines", 2);

    let regex = RegexBuilder::new(pattern)
        .case_insensitive(case_insensitive)
        .build()
        .map_err(|err| format!("invalid regex pattern {pattern:?}: {err}"))?;

    let mut metadata = Map::new();

    // Paragraph structure when present; otherwise fall back to line windows.
    if content.contains("\n\n") {
        let mut matched = Vec::new();
        for paragraph in content.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
            if regex.is_match(paragraph) {
                matched.push(paragraph);
                if matched.len() >= max_results {
                    break;
                }
            }
        }

        metadata.insert("unit".to_string(), Value::from("paragraph"));
        metadata.insert("matches".to_string(), Value::from(matched.len()));
        let rendered = matched.join(BLOCK_SEPARATOR);
        return Ok(StageOutput::applied(rendered, metadata));
    }

    let lines: Vec<&str> = content.lines().collect();
    let last_line = lines.len().saturating_sub(1);
    let mut blocks: Vec<(usize, usize)> = Vec::new();
    let mut matches = 0usize;
    for (idx, line) in lines.iter().enumerate() {
        if !regex.is_match(line) {
            continue;
        }
        matches += 1;
        let start = idx.saturating_sub(context_lines);
        let end = (idx + context_lines).min(last_line);
        match blocks.last_mut() {
            Some((_, prev_end)) if start <= prev_end.saturating_add(1) => {
                *prev_end = (*prev_end).max(end);
            }
            _ => blocks.push((start, end)),
        }
        if matches >= max_results {
            break;
        }
    }

    metadata.insert("unit".to_string(), Value::from("lines"));
    metadata.insert("matches".to_string(), Value::from(matches));
    let rendered = blocks
        .iter()
        .map(|(start, end)| lines[*start..=*end].join("\n"))
        .collect::<Vec<_>>()
        .join(BLOCK_SEPARATOR);
    Ok(StageOutput::applied(rendered, metadata))
}
