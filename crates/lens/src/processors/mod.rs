//! Processor pipeline for drilling into cached tool responses.
//!
//! A pipeline is an ordered list of processors driven by a single params map.
//! Each processor inspects the map for its own keys; when they are absent the
//! processor is skipped and its output equals its input. Processor failures
//! are absorbed into the result's `error` field and the pipeline continues
//! with unchanged content.

mod context;
mod explore;
mod fuzzy;
mod projection;
mod rank;
mod search;

pub use context::ContextProcessor;
pub use explore::ExploreProcessor;
pub use fuzzy::FuzzyProcessor;
pub use projection::ProjectionProcessor;
pub use rank::Bm25Processor;
pub use search::RegexSearchProcessor;

use serde_json::{Map, Value};

pub(crate) const DEFAULT_MAX_RESULTS: usize = 100;

/// Output of one processor stage.
#[derive(Debug, Clone)]
pub struct StageOutput {
    pub content: String,
    pub metadata: Map<String, Value>,
    /// True iff the processor's parameters were present and its work ran.
    pub applied: bool,
}

impl StageOutput {
    pub fn applied(content: String, metadata: Map<String, Value>) -> Self {
        Self {
            content,
            metadata,
            applied: true,
        }
    }

    /// Content passes through unchanged with a metadata note.
    pub fn pass_through(content: &str, note: impl Into<String>) -> Self {
        let mut metadata = Map::new();
        metadata.insert("note".to_string(), Value::String(note.into()));
        Self {
            content: content.to_string(),
            metadata,
            applied: false,
        }
    }
}

pub trait Processor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run this processor over `content`.
    ///
    /// Returns `None` when the processor's parameters are absent from
    /// `params` (the stage is skipped). A returned `Err` is non-fatal: the
    /// pipeline records it and continues with unchanged content.
    fn run(
        &self,
        content: &str,
        params: &Map<String, Value>,
    ) -> Option<Result<StageOutput, String>>;
}

/// Final result of a pipeline run.
#[derive(Debug, Clone)]
pub struct ProcessorResult {
    pub content: String,
    /// Per-processor metadata, keyed by processor name.
    pub metadata: Map<String, Value>,
    pub original_size: usize,
    pub processed_size: usize,
    /// True iff at least one stage applied.
    pub applied: bool,
    /// Last non-fatal stage error, if any.
    pub error: Option<String>,
}

pub struct Pipeline {
    processors: Vec<Box<dyn Processor>>,
}

impl Pipeline {
    pub fn new(processors: Vec<Box<dyn Processor>>) -> Self {
        Self { processors }
    }

    /// The standard pipeline used by the proxy tools: projection, the four
    /// search modes, and structure exploration.
    pub fn standard() -> Self {
        Self::new(vec![
            Box::new(ProjectionProcessor),
            Box::new(RegexSearchProcessor),
            Box::new(Bm25Processor::default()),
            Box::new(FuzzyProcessor),
            Box::new(ContextProcessor),
            Box::new(ExploreProcessor),
        ])
    }

    pub fn run(&self, input: &str, params: &Map<String, Value>) -> ProcessorResult {
        let original_size = input.len();
        let mut content = input.to_string();
        let mut metadata = Map::new();
        let mut applied = false;
        let mut error: Option<String> = None;

        for processor in &self.processors {
            let stage_input_size = content.len();
            match processor.run(&content, params) {
                None => continue,
                Some(Ok(stage)) => {
                    let mut stage_meta = stage.metadata;
                    stage_meta.insert("applied".to_string(), Value::Bool(stage.applied));
                    stage_meta.insert(
                        "originalSize".to_string(),
                        Value::from(stage_input_size),
                    );
                    stage_meta.insert(
                        "processedSize".to_string(),
                        Value::from(stage.content.len()),
                    );
                    metadata.insert(processor.name().to_string(), Value::Object(stage_meta));
                    applied |= stage.applied;
                    content = stage.content;
                }
                Some(Err(message)) => {
                    tracing::debug!(
                        processor = processor.name(),
                        error = %message,
                        "processor failed; continuing with unchanged content"
                    );
                    let mut stage_meta = Map::new();
                    stage_meta.insert("applied".to_string(), Value::Bool(false));
                    stage_meta.insert("error".to_string(), Value::String(message.clone()));
                    metadata.insert(processor.name().to_string(), Value::Object(stage_meta));
                    error = Some(message);
                }
            }
        }

        ProcessorResult {
            processed_size: content.len(),
            content,
            metadata,
            original_size,
            applied,
            error,
        }
    }
}

pub(crate) fn param_str<'a>(params: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    params.get(key).and_then(|v| v.as_str())
}

pub(crate) fn param_bool(params: &Map<String, Value>, key: &str) -> bool {
    params.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
}

pub(crate) fn param_usize(params: &Map<String, Value>, key: &str, default: usize) -> usize {
    params
        .get(key)
        .and_then(|v| v.as_u64())
        .and_then(|v| usize::try_from(v).ok())
        .unwrap_or(default)
}

/// The search mode selected by the params map (default `regex`).
pub(crate) fn search_mode<'a>(params: &'a Map<String, Value>) -> &'a str {
    param_str(params, "mode").unwrap_or("regex")
}

/// Paragraph chunks (double-newline separated), falling back to sentences
/// when the text has no paragraph structure.
pub(crate) fn chunk_text(text: &str) -> Vec<String> {
    let paragraphs: Vec<String> = text
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect();
    if paragraphs.len() > 1 {
        return paragraphs;
    }

    let mut sentences = Vec::new();
    let mut rest = text.trim();
    while !rest.is_empty() {
        let end = rest
            .char_indices()
            .find(|(idx, ch)| {
                matches!(ch, '.' | '!' | '?')
                    && rest[idx + ch.len_utf8()..]
                        .chars()
                        .next()
                        .map_or(true, char::is_whitespace)
            })
            .map(|(idx, ch)| idx + ch.len_utf8());
        match end {
            Some(end) => {
                let sentence = rest[..end].trim();
                if !sentence.is_empty() {
                    sentences.push(sentence.to_string());
                }
                rest = rest[end..].trim_start();
            }
            None => {
                let sentence = rest.trim();
                if !sentence.is_empty() {
                    sentences.push(sentence.to_string());
                }
                break;
            }
        }
    }
    if sentences.is_empty() {
        paragraphs
    } else {
        sentences
    }
}
