//! Field projection over JSON-shaped content.
//!
//! Field paths are parsed once into an AST and matched structurally:
//! - `a.b.c` traverses object keys
//! - `orders[]` applies to every element of the array at that position
//! - `*` matches every key at its level
//! - the terminal `_keys` replaces an object with the list of its keys
//!
//! Dotted segments descend into arrays implicitly, so `users.name` selects
//! `name` inside every element of a `users` array.

use serde_json::{Map, Value};

use super::{param_str, Processor, StageOutput};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    AnyKey,
    Elements,
    Keys,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FieldPath(Vec<Segment>);

impl FieldPath {
    fn parse(expr: &str) -> Result<Self, String> {
        if expr.trim().is_empty() {
            return Err("field expression must not be empty".to_string());
        }
        let mut segments = Vec::new();
        for part in expr.split('.') {
            if part.is_empty() {
                return Err(format!("empty segment in field expression: {expr:?}"));
            }
            let (base, elements) = match part.strip_suffix("[]") {
                Some(base) => (base, true),
                None => (part, false),
            };
            match base {
                "" => {}
                "*" => segments.push(Segment::AnyKey),
                "_keys" => segments.push(Segment::Keys),
                key => segments.push(Segment::Key(key.to_string())),
            }
            if elements {
                segments.push(Segment::Elements);
            }
        }
        if segments.is_empty() {
            return Err(format!("invalid field expression: {expr:?}"));
        }
        Ok(Self(segments))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Include,
    Exclude,
}

pub struct ProjectionProcessor;

impl Processor for ProjectionProcessor {
    fn name(&self) -> &'static str {
        "projection"
    }

    fn run(
        &self,
        content: &str,
        params: &Map<String, Value>,
    ) -> Option<Result<StageOutput, String>> {
        let fields = params.get("fields")?;
        Some(self.apply(content, fields, params))
    }
}

impl ProjectionProcessor {
    fn apply(
        &self,
        content: &str,
        fields: &Value,
        params: &Map<String, Value>,
    ) -> Result<StageOutput, String> {
        let mode = match param_str(params, "mode").unwrap_or("include") {
            "include" => Mode::Include,
            "exclude" => Mode::Exclude,
            other => return Err(format!("invalid projection mode: {other:?}")),
        };

        let Some(fields) = fields.as_array() else {
            return Err("fields must be an array of strings".to_string());
        };
        let mut paths = Vec::with_capacity(fields.len());
        for field in fields {
            let Some(expr) = field.as_str() else {
                return Err("fields must be an array of strings".to_string());
            };
            paths.push(FieldPath::parse(expr)?);
        }

        let Ok(value) = serde_json::from_str::<Value>(content) else {
            return Ok(StageOutput::pass_through(
                content,
                "content is not JSON; projection skipped",
            ));
        };

        let path_refs: Vec<&[Segment]> = paths.iter().map(|p| p.0.as_slice()).collect();
        let projected = match mode {
            Mode::Include => include(&value, &path_refs).unwrap_or(Value::Null),
            Mode::Exclude => {
                if paths.is_empty() {
                    value.clone()
                } else {
                    exclude(&value, &path_refs).unwrap_or(Value::Null)
                }
            }
        };

        let rendered = serde_json::to_string_pretty(&projected)
            .map_err(|err| format!("serialize projected content: {err}"))?;
        let mut metadata = Map::new();
        metadata.insert(
            "mode".to_string(),
            Value::String(
                match mode {
                    Mode::Include => "include",
                    Mode::Exclude => "exclude",
                }
                .to_string(),
            ),
        );
        metadata.insert("fields".to_string(), Value::from(paths.len()));
        Ok(StageOutput::applied(rendered, metadata))
    }
}

fn advance_key<'a>(paths: &[&'a [Segment]], key: &str) -> Vec<&'a [Segment]> {
    let mut advanced = Vec::new();
    for path in paths {
        match path.first() {
            Some(Segment::Key(k)) if k == key => advanced.push(&path[1..]),
            Some(Segment::AnyKey) => advanced.push(&path[1..]),
            _ => {}
        }
    }
    advanced
}

/// Advance paths across an array boundary: an explicit `[]` segment is
/// consumed, anything else descends implicitly.
fn advance_elements<'a>(paths: &[&'a [Segment]]) -> Vec<&'a [Segment]> {
    paths
        .iter()
        .map(|path| match path.first() {
            Some(Segment::Elements) => &path[1..],
            _ => *path,
        })
        .collect()
}

/// Keep a node iff some descendant leaf path matches; containers reached by a
/// pattern prefix are preserved even when pruned empty.
fn include(value: &Value, paths: &[&[Segment]]) -> Option<Value> {
    if paths.iter().any(|p| p.is_empty()) {
        return Some(value.clone());
    }

    match value {
        Value::Object(map) => {
            if paths.iter().any(|p| p.first() == Some(&Segment::Keys)) {
                let keys: Vec<Value> = map.keys().cloned().map(Value::String).collect();
                return Some(Value::Array(keys));
            }
            let mut result = Map::new();
            for (key, child) in map {
                let advanced = advance_key(paths, key);
                if advanced.is_empty() {
                    continue;
                }
                if let Some(projected) = include(child, &advanced) {
                    result.insert(key.clone(), projected);
                }
            }
            Some(Value::Object(result))
        }
        Value::Array(items) => {
            let advanced = advance_elements(paths);
            let mut result = Vec::new();
            for item in items {
                if let Some(projected) = include(item, &advanced) {
                    result.push(projected);
                }
            }
            Some(Value::Array(result))
        }
        // Scalars only survive when a path was fully consumed above.
        _ => None,
    }
}

/// Remove nodes whose path matches; keep everything else. `None` means the
/// node itself is excluded.
fn exclude(value: &Value, paths: &[&[Segment]]) -> Option<Value> {
    if paths.iter().any(|p| p.is_empty()) {
        return None;
    }

    match value {
        Value::Object(map) => {
            let mut result = Map::new();
            for (key, child) in map {
                let advanced = advance_key(paths, key);
                if advanced.is_empty() {
                    result.insert(key.clone(), child.clone());
                    continue;
                }
                if let Some(kept) = exclude(child, &advanced) {
                    result.insert(key.clone(), kept);
                }
            }
            Some(Value::Object(result))
        }
        Value::Array(items) => {
            let advanced = advance_elements(paths);
            let mut result = Vec::new();
            for item in items {
                if let Some(kept) = exclude(item, &advanced) {
                    result.push(kept);
                }
            }
            Some(Value::Array(result))
        }
        _ => Some(value.clone()),
    }
}
