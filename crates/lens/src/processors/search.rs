//! Regex search with grep-style context blocks.

use regex::RegexBuilder;
use serde_json::{Map, Value};

use super::{
    param_bool, param_str, param_usize, search_mode, Processor, StageOutput, DEFAULT_MAX_RESULTS,
};

pub(crate) const BLOCK_SEPARATOR: &str = "\n--\n";
pub(crate) const NO_MATCHES: &str = "No matches found.";

pub struct RegexSearchProcessor;

impl Processor for RegexSearchProcessor {
    fn name(&self) -> &'static str {
        "regex_search"
    }

    fn run(
        &self,
        content: &str,
        params: &Map<String, Value>,
    ) -> Option<Result<StageOutput, String>> {
        let pattern = param_str(params, "pattern")?;
        if search_mode(params) != "regex" {
            return None;
        }
        Some(apply(content, pattern, params))
    }
}

fn apply(content: &str, pattern: &str, params: &Map<String, Value>) -> Result<StageOutput, String> {
    let case_insensitive = param_bool(params, "case_insensitive");
    let multiline = param_bool(params, "multiline");
    let max_results = param_usize(params, "max_results", DEFAULT_MAX_RESULTS).max(1);
    let context_lines = param_usize(params, "context_lines", 0);

    let regex = RegexBuilder::new(pattern)
        .case_insensitive(case_insensitive)
        .multi_line(multiline)
        .dot_matches_new_line(multiline)
        .build()
        .map_err(|err| format!("invalid regex pattern {pattern:?}: {err}"))?;

    let lines: Vec<&str> = content.lines().collect();

    // Line ranges (inclusive) around each hit.
    let mut hit_ranges: Vec<(usize, usize)> = Vec::new();
    if multiline {
        let line_starts = line_start_offsets(content);
        for found in regex.find_iter(content).take(max_results) {
            let start_line = line_of_offset(&line_starts, found.start());
            let end_line = line_of_offset(&line_starts, found.end().saturating_sub(1).max(found.start()));
            hit_ranges.push((start_line, end_line));
        }
    } else {
        for (idx, line) in lines.iter().enumerate() {
            if regex.is_match(line) {
                hit_ranges.push((idx, idx));
                if hit_ranges.len() >= max_results {
                    break;
                }
            }
        }
    }

    let matches = hit_ranges.len();
    if matches == 0 {
        let mut metadata = Map::new();
        metadata.insert("matches".to_string(), Value::from(0));
        return Ok(StageOutput::applied(NO_MATCHES.to_string(), metadata));
    }

    let last_line = lines.len().saturating_sub(1);
    let mut blocks: Vec<(usize, usize)> = Vec::new();
    for (start, end) in hit_ranges {
        let block_start = start.saturating_sub(context_lines);
        let block_end = (end + context_lines).min(last_line);
        match blocks.last_mut() {
            // Overlapping or touching blocks merge into one.
            Some((_, prev_end)) if block_start <= prev_end.saturating_add(1) => {
                *prev_end = (*prev_end).max(block_end);
            }
            _ => blocks.push((block_start, block_end)),
        }
    }

    let rendered = blocks
        .iter()
        .map(|(start, end)| lines[*start..=*end].join("\n"))
        .collect::<Vec<_>>()
        .join(BLOCK_SEPARATOR);

    let mut metadata = Map::new();
    metadata.insert("matches".to_string(), Value::from(matches));
    metadata.insert("blocks".to_string(), Value::from(blocks.len()));
    Ok(StageOutput::applied(rendered, metadata))
}

fn line_start_offsets(content: &str) -> Vec<usize> {
    let mut starts = vec![0];
    for (idx, byte) in content.bytes().enumerate() {
        if byte == b'\n' {
            starts.push(idx + 1);
        }
    }
    starts
}

fn line_of_offset(line_starts: &[usize], offset: usize) -> usize {
    match line_starts.binary_search(&offset) {
        Ok(idx) => idx,
        Err(idx) => idx.saturating_sub(1),
    }
}
