//! The three proxy tools: `proxy_filter`, `proxy_search`, `proxy_explore`.
//!
//! Each tool works in one of two modes: cached (`cache_id` set) drills into a
//! previously cached response; fresh (`tool` + `arguments` set) calls the
//! underlying tool through the dispatcher, caches the full response, and
//! processes it, returning the new handle for follow-ups.

use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::error::ProxyError;
use crate::frontend::Dispatcher;
use crate::mcp::{render_text, CallToolResult, Tool};
use crate::processors::Pipeline;

pub const PROXY_TOOL_PREFIX: &str = "proxy_";

pub const PROXY_FILTER: &str = "proxy_filter";
pub const PROXY_SEARCH: &str = "proxy_search";
pub const PROXY_EXPLORE: &str = "proxy_explore";

fn fresh_cache_trailer(handle: &str) -> String {
    format!("\n\n[Full response cached. cache_id=\"{handle}\"]")
}

/// Tool descriptors for the synthetic `proxy` upstream.
pub fn proxy_tool_descriptors() -> Vec<Tool> {
    let source_properties = json!({
        "cache_id": {
            "type": "string",
            "description": "Handle of a cached response to operate on (from a truncation trailer or an earlier fresh-mode call). Mutually exclusive with `tool`."
        },
        "tool": {
            "type": "string",
            "description": "Qualified tool name to call fresh (e.g. fs_read_file). The full response is cached and the new cache_id is returned. Mutually exclusive with `cache_id`."
        },
        "arguments": {
            "type": "object",
            "description": "Arguments for the fresh tool call. Only valid together with `tool`."
        }
    });

    let mut filter_properties = source_properties.clone();
    merge_properties(
        &mut filter_properties,
        json!({
            "fields": {
                "type": "array",
                "items": { "type": "string" },
                "description": "Field paths to project. Supports dotted paths (users.name), array markers (orders[]), wildcards (*), and the terminal _keys."
            },
            "mode": {
                "type": "string",
                "enum": ["include", "exclude"],
                "default": "include",
                "description": "include keeps only matching fields; exclude removes them."
            }
        }),
    );

    let mut search_properties = source_properties.clone();
    merge_properties(
        &mut search_properties,
        json!({
            "pattern": {
                "type": "string",
                "description": "Search pattern. A regex for regex/context modes, a query for bm25/fuzzy."
            },
            "mode": {
                "type": "string",
                "enum": ["regex", "bm25", "fuzzy", "context"],
                "default": "regex",
                "description": "Search strategy."
            },
            "case_insensitive": { "type": "boolean", "default": false },
            "multiline": {
                "type": "boolean",
                "default": false,
                "description": "Match the pattern against the whole text instead of line by line (regex mode)."
            },
            "max_results": { "type": "integer", "minimum": 1, "default": 100 },
            "context_lines": {
                "type": "integer",
                "minimum": 0,
                "description": "Lines of context around each match (regex and context modes)."
            },
            "top_k": {
                "type": "integer",
                "minimum": 1,
                "default": 5,
                "description": "Number of top-ranked chunks to return (bm25 mode)."
            },
            "fuzzy_threshold": {
                "type": "number",
                "minimum": 0,
                "maximum": 1,
                "default": 0.7,
                "description": "Minimum similarity for a chunk to match (fuzzy mode)."
            }
        }),
    );

    let mut explore_properties = source_properties;
    merge_properties(
        &mut explore_properties,
        json!({
            "max_depth": { "type": "integer", "minimum": 1, "default": 3 },
            "sample_size": { "type": "integer", "minimum": 1, "default": 3 }
        }),
    );

    vec![
        Tool {
            name: PROXY_FILTER.to_string(),
            description: Some(
                "Project specific fields out of a cached or fresh tool response. Use after a truncated response to pull just the fields you need.".to_string(),
            ),
            input_schema: object_schema(filter_properties, &["fields"]),
            title: None,
            annotations: None,
            output_schema: None,
        },
        Tool {
            name: PROXY_SEARCH.to_string(),
            description: Some(
                "Search inside a cached or fresh tool response using regex, bm25 ranking, fuzzy matching, or paragraph context extraction.".to_string(),
            ),
            input_schema: object_schema(search_properties, &["pattern"]),
            title: None,
            annotations: None,
            output_schema: None,
        },
        Tool {
            name: PROXY_EXPLORE.to_string(),
            description: Some(
                "Summarize the structure of a cached or fresh tool response (keys, types, sizes, samples) without streaming the payload.".to_string(),
            ),
            input_schema: object_schema(explore_properties, &[]),
            title: None,
            annotations: None,
            output_schema: None,
        },
    ]
}

fn object_schema(properties: Value, required: &[&str]) -> Value {
    let mut schema = json!({
        "type": "object",
        "properties": properties,
        "additionalProperties": false,
    });
    if !required.is_empty() {
        schema["required"] = json!(required);
    }
    schema
}

fn merge_properties(target: &mut Value, extra: Value) {
    let (Value::Object(target), Value::Object(extra)) = (target, extra) else {
        return;
    };
    for (key, value) in extra {
        target.insert(key, value);
    }
}

#[derive(Debug, Deserialize)]
struct SourceParams {
    #[serde(default)]
    cache_id: Option<String>,
    #[serde(default)]
    tool: Option<String>,
    #[serde(default)]
    arguments: Option<Value>,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

enum Source {
    Cached(String),
    Fresh {
        tool: String,
        arguments: Option<Value>,
    },
}

impl SourceParams {
    fn source(&self) -> Result<Source, ProxyError> {
        match (&self.cache_id, &self.tool) {
            (Some(_), Some(_)) => Err(ProxyError::bad_arguments(
                "cache_id and tool are mutually exclusive",
            )),
            (None, None) => Err(ProxyError::bad_arguments(
                "one of cache_id or tool is required",
            )),
            (Some(cache_id), None) => {
                if self.arguments.is_some() {
                    return Err(ProxyError::bad_arguments(
                        "arguments is only valid together with tool",
                    ));
                }
                Ok(Source::Cached(cache_id.clone()))
            }
            (None, Some(tool)) => {
                if let Some(arguments) = &self.arguments {
                    if !arguments.is_object() {
                        return Err(ProxyError::bad_arguments("arguments must be an object"));
                    }
                }
                Ok(Source::Fresh {
                    tool: tool.clone(),
                    arguments: self.arguments.clone(),
                })
            }
        }
    }
}

/// Run one of the three proxy tools.
pub async fn run_proxy_tool(
    dispatcher: &Dispatcher,
    agent_id: &str,
    name: &str,
    arguments: Option<Value>,
) -> Result<CallToolResult, ProxyError> {
    dispatcher.stats().record_proxy_tool_call();
    let arguments = arguments.unwrap_or_else(|| Value::Object(Map::new()));
    let source: SourceParams = serde_json::from_value(arguments)
        .map_err(|err| ProxyError::bad_arguments(err.to_string()))?;

    let pipeline_params = match name {
        PROXY_FILTER => filter_params(&source.rest)?,
        PROXY_SEARCH => search_params(&source.rest)?,
        PROXY_EXPLORE => explore_params(&source.rest)?,
        other => return Err(ProxyError::UnknownTool(other.to_string())),
    };

    let (content, fresh_handle) = match source.source()? {
        Source::Cached(cache_id) => {
            let entry = dispatcher.cache().get(&cache_id).into_result(&cache_id)?;
            (entry.content.as_ref().clone(), None)
        }
        Source::Fresh { tool, arguments } => {
            let result = dispatcher.call_upstream_raw(&tool, arguments.clone()).await?;
            let handle = dispatcher.cache().put(
                agent_id,
                result.content.clone(),
                &tool,
                arguments.unwrap_or(Value::Null),
            )?;
            (result.content, Some(handle))
        }
    };

    let text = render_text(&content);
    let result = Pipeline::standard().run(&text, &pipeline_params);

    if let Some(error) = &result.error {
        if !result.applied {
            return Err(ProxyError::ProcessorError(error.clone()));
        }
    }

    let mut output = result.content;
    if let Some(handle) = fresh_handle {
        output.push_str(&fresh_cache_trailer(&handle.to_string()));
    }
    Ok(CallToolResult::text(output))
}

fn positive_usize(rest: &Map<String, Value>, key: &str) -> Result<Option<u64>, ProxyError> {
    match rest.get(key) {
        None => Ok(None),
        Some(value) => match value.as_u64() {
            Some(v) if v > 0 => Ok(Some(v)),
            _ => Err(ProxyError::bad_arguments(format!(
                "{key} must be a positive integer, got {value}"
            ))),
        },
    }
}

fn non_negative_usize(rest: &Map<String, Value>, key: &str) -> Result<Option<u64>, ProxyError> {
    match rest.get(key) {
        None => Ok(None),
        Some(value) => match value.as_u64() {
            Some(v) => Ok(Some(v)),
            None => Err(ProxyError::bad_arguments(format!(
                "{key} must be a non-negative integer, got {value}"
            ))),
        },
    }
}

fn bool_param(rest: &Map<String, Value>, key: &str) -> Result<Option<bool>, ProxyError> {
    match rest.get(key) {
        None => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(other) => Err(ProxyError::bad_arguments(format!(
            "{key} must be a boolean, got {other}"
        ))),
    }
}

fn reject_unknown(rest: &Map<String, Value>, allowed: &[&str]) -> Result<(), ProxyError> {
    for key in rest.keys() {
        if !allowed.contains(&key.as_str()) {
            return Err(ProxyError::bad_arguments(format!("unknown parameter: {key}")));
        }
    }
    Ok(())
}

fn filter_params(rest: &Map<String, Value>) -> Result<Map<String, Value>, ProxyError> {
    reject_unknown(rest, &["fields", "mode"])?;

    let Some(fields) = rest.get("fields") else {
        return Err(ProxyError::bad_arguments("fields is required"));
    };
    let valid = fields
        .as_array()
        .map(|items| items.iter().all(Value::is_string))
        .unwrap_or(false);
    if !valid {
        return Err(ProxyError::bad_arguments(
            "fields must be an array of strings",
        ));
    }

    let mode = match rest.get("mode") {
        None => "include",
        Some(Value::String(mode)) if mode == "include" || mode == "exclude" => mode,
        Some(other) => {
            return Err(ProxyError::bad_arguments(format!(
                "mode must be \"include\" or \"exclude\", got {other}"
            )));
        }
    };

    let mut params = Map::new();
    params.insert("fields".to_string(), fields.clone());
    params.insert("mode".to_string(), Value::String(mode.to_string()));
    Ok(params)
}

const SEARCH_MODES: [&str; 4] = ["regex", "bm25", "fuzzy", "context"];

fn search_params(rest: &Map<String, Value>) -> Result<Map<String, Value>, ProxyError> {
    reject_unknown(
        rest,
        &[
            "pattern",
            "mode",
            "case_insensitive",
            "multiline",
            "max_results",
            "context_lines",
            "top_k",
            "fuzzy_threshold",
        ],
    )?;

    let pattern = match rest.get("pattern") {
        Some(Value::String(pattern)) if !pattern.is_empty() => pattern.clone(),
        Some(_) | None => {
            return Err(ProxyError::bad_arguments(
                "pattern is required and must be a non-empty string",
            ));
        }
    };

    let mode = match rest.get("mode") {
        None => "regex".to_string(),
        Some(Value::String(mode)) if SEARCH_MODES.contains(&mode.as_str()) => mode.clone(),
        Some(other) => {
            return Err(ProxyError::bad_arguments(format!(
                "mode must be one of regex, bm25, fuzzy, context; got {other}"
            )));
        }
    };

    let case_insensitive = bool_param(rest, "case_insensitive")?;
    let multiline = bool_param(rest, "multiline")?;
    let max_results = positive_usize(rest, "max_results")?;
    let context_lines = non_negative_usize(rest, "context_lines")?;
    let top_k = positive_usize(rest, "top_k")?;

    let fuzzy_threshold = match rest.get("fuzzy_threshold") {
        None => None,
        Some(value) => match value.as_f64() {
            Some(t) if (0.0..=1.0).contains(&t) => Some(t),
            _ => {
                return Err(ProxyError::bad_arguments(format!(
                    "fuzzy_threshold must be a number in [0, 1], got {value}"
                )));
            }
        },
    };

    let mut params = Map::new();
    params.insert("pattern".to_string(), Value::String(pattern));
    params.insert("mode".to_string(), Value::String(mode));
    if let Some(v) = case_insensitive {
        params.insert("case_insensitive".to_string(), Value::Bool(v));
    }
    if let Some(v) = multiline {
        params.insert("multiline".to_string(), Value::Bool(v));
    }
    if let Some(v) = max_results {
        params.insert("max_results".to_string(), Value::from(v));
    }
    if let Some(v) = context_lines {
        params.insert("context_lines".to_string(), Value::from(v));
    }
    if let Some(v) = top_k {
        params.insert("top_k".to_string(), Value::from(v));
    }
    if let Some(v) = fuzzy_threshold {
        params.insert("fuzzy_threshold".to_string(), Value::from(v));
    }
    Ok(params)
}

fn explore_params(rest: &Map<String, Value>) -> Result<Map<String, Value>, ProxyError> {
    reject_unknown(rest, &["max_depth", "sample_size"])?;

    let max_depth = positive_usize(rest, "max_depth")?;
    let sample_size = positive_usize(rest, "sample_size")?;

    let mut params = Map::new();
    params.insert("explore".to_string(), Value::Bool(true));
    if let Some(v) = max_depth {
        params.insert("max_depth".to_string(), Value::from(v));
    }
    if let Some(v) = sample_size {
        params.insert("sample_size".to_string(), Value::from(v));
    }
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxySettings;
    use crate::frontend::DEFAULT_AGENT_ID;
    use crate::mcp::text_content;
    use std::collections::BTreeMap;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(&BTreeMap::new(), ProxySettings::default())
    }

    async fn run(
        dispatcher: &Dispatcher,
        name: &str,
        arguments: Value,
    ) -> Result<CallToolResult, ProxyError> {
        run_proxy_tool(dispatcher, DEFAULT_AGENT_ID, name, Some(arguments)).await
    }

    #[tokio::test]
    async fn rejects_both_cache_id_and_tool() {
        let err = run(
            &dispatcher(),
            PROXY_SEARCH,
            json!({ "cache_id": "a:b", "tool": "fs_read", "pattern": "x" }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProxyError::BadArguments(_)), "{err}");
    }

    #[tokio::test]
    async fn rejects_neither_cache_id_nor_tool() {
        let err = run(&dispatcher(), PROXY_SEARCH, json!({ "pattern": "x" }))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::BadArguments(_)), "{err}");
    }

    #[tokio::test]
    async fn rejects_arguments_without_tool() {
        let err = run(
            &dispatcher(),
            PROXY_EXPLORE,
            json!({ "cache_id": "a:b", "arguments": {} }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProxyError::BadArguments(_)), "{err}");
    }

    #[tokio::test]
    async fn rejects_invalid_search_mode_and_numbers() {
        let d = dispatcher();
        for arguments in [
            json!({ "cache_id": "a:b", "pattern": "x", "mode": "sideways" }),
            json!({ "cache_id": "a:b", "pattern": "x", "max_results": 0 }),
            json!({ "cache_id": "a:b", "pattern": "x", "max_results": -3 }),
            json!({ "cache_id": "a:b", "pattern": "x", "fuzzy_threshold": 2.0 }),
            json!({ "cache_id": "a:b", "pattern": "" }),
        ] {
            let err = run(&d, PROXY_SEARCH, arguments.clone()).await.unwrap_err();
            assert!(
                matches!(err, ProxyError::BadArguments(_)),
                "args={arguments} err={err}"
            );
        }
    }

    #[tokio::test]
    async fn rejects_invalid_filter_mode() {
        let err = run(
            &dispatcher(),
            PROXY_FILTER,
            json!({ "cache_id": "a:b", "fields": ["x"], "mode": "view" }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProxyError::BadArguments(_)), "{err}");
    }

    #[tokio::test]
    async fn unknown_cache_id_is_a_miss() {
        let err = run(
            &dispatcher(),
            PROXY_SEARCH,
            json!({ "cache_id": "agent_1:zzzzzzzzzzzz", "pattern": "x" }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProxyError::CacheMiss(_)), "{err}");
    }

    #[tokio::test]
    async fn filter_runs_over_cached_content() {
        let d = dispatcher();
        let content = vec![text_content(
            json!({ "users": [{ "name": "A", "secret": "s" }] }).to_string(),
        )];
        let handle = d
            .cache()
            .put(DEFAULT_AGENT_ID, content, "fs_list", Value::Null)
            .unwrap();

        let result = run(
            &d,
            PROXY_FILTER,
            json!({ "cache_id": handle.to_string(), "fields": ["users.name"] }),
        )
        .await
        .unwrap();

        let text = render_text(&result.content);
        assert!(text.contains("\"name\""));
        assert!(!text.contains("secret"));
    }

    #[tokio::test]
    async fn search_runs_over_cached_content() {
        let d = dispatcher();
        let content = vec![text_content("clean line\nhas ERROR here\nlast line")];
        let handle = d
            .cache()
            .put(DEFAULT_AGENT_ID, content, "t", Value::Null)
            .unwrap();

        let result = run(
            &d,
            PROXY_SEARCH,
            json!({ "cache_id": handle.to_string(), "pattern": "ERROR" }),
        )
        .await
        .unwrap();
        assert_eq!(render_text(&result.content), "has ERROR here");
    }

    #[tokio::test]
    async fn explore_runs_over_cached_content() {
        let d = dispatcher();
        let content = vec![text_content(json!({ "a": 1, "b": [1, 2, 3] }).to_string())];
        let handle = d
            .cache()
            .put(DEFAULT_AGENT_ID, content, "t", Value::Null)
            .unwrap();

        let result = run(
            &d,
            PROXY_EXPLORE,
            json!({ "cache_id": handle.to_string(), "max_depth": 2 }),
        )
        .await
        .unwrap();

        let summary: Value = serde_json::from_str(&render_text(&result.content)).unwrap();
        assert_eq!(summary["type"], "object");
        assert_eq!(summary["keys"]["b"]["length"], 3);
    }

    #[tokio::test]
    async fn invalid_regex_surfaces_as_processor_error() {
        let d = dispatcher();
        let handle = d
            .cache()
            .put(DEFAULT_AGENT_ID, vec![text_content("text")], "t", Value::Null)
            .unwrap();

        let err = run(
            &d,
            PROXY_SEARCH,
            json!({ "cache_id": handle.to_string(), "pattern": "(unclosed" }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProxyError::ProcessorError(_)), "{err}");
    }

    #[tokio::test]
    async fn fresh_mode_with_unknown_tool_fails() {
        let err = run(
            &dispatcher(),
            PROXY_SEARCH,
            json!({ "tool": "fs_read_file", "arguments": { "path": "/x" }, "pattern": "x" }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProxyError::UnknownTool(_)), "{err}");
    }

    #[test]
    fn descriptors_cover_the_three_tools() {
        let tools = proxy_tool_descriptors();
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, [PROXY_FILTER, PROXY_SEARCH, PROXY_EXPLORE]);
        for tool in &tools {
            assert_eq!(tool.input_schema["type"], "object");
            assert!(tool.input_schema["properties"]["cache_id"].is_object());
        }
    }
}
