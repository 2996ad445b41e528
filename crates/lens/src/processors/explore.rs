//! Structure exploration: a bounded summary of JSON content that never
//! streams the full payload.

use serde_json::{Map, Value};

use super::{param_usize, Processor, StageOutput};

const DEFAULT_MAX_DEPTH: usize = 3;
const DEFAULT_SAMPLE_SIZE: usize = 3;
const STRING_PREVIEW_CHARS: usize = 120;

pub struct ExploreProcessor;

impl Processor for ExploreProcessor {
    fn name(&self) -> &'static str {
        "explore"
    }

    fn run(
        &self,
        content: &str,
        params: &Map<String, Value>,
    ) -> Option<Result<StageOutput, String>> {
        // Both tool parameters are optional, so presence is signalled with an
        // explicit marker key.
        if !params
            .get("explore")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
        {
            return None;
        }
        let max_depth = param_usize(params, "max_depth", DEFAULT_MAX_DEPTH).max(1);
        let sample_size = param_usize(params, "sample_size", DEFAULT_SAMPLE_SIZE).max(1);
        Some(apply(content, max_depth, sample_size))
    }
}

fn apply(content: &str, max_depth: usize, sample_size: usize) -> Result<StageOutput, String> {
    // Non-JSON content is summarized as one string value.
    let value: Value = serde_json::from_str(content)
        .unwrap_or_else(|_| Value::String(content.to_string()));

    let summary = summarize(&value, max_depth, sample_size);
    let rendered = serde_json::to_string_pretty(&summary)
        .map_err(|err| format!("serialize structure summary: {err}"))?;

    let mut metadata = Map::new();
    metadata.insert("maxDepth".to_string(), Value::from(max_depth));
    metadata.insert("sampleSize".to_string(), Value::from(sample_size));
    Ok(StageOutput::applied(rendered, metadata))
}

fn summarize(value: &Value, depth: usize, sample_size: usize) -> Value {
    match value {
        Value::Object(map) => {
            let mut summary = Map::new();
            summary.insert("type".to_string(), Value::from("object"));
            summary.insert("keyCount".to_string(), Value::from(map.len()));
            if depth == 0 {
                summary.insert("keys".to_string(), Value::from("..."));
            } else {
                let mut keys = Map::new();
                for (key, child) in map {
                    keys.insert(key.clone(), summarize(child, depth - 1, sample_size));
                }
                summary.insert("keys".to_string(), Value::Object(keys));
            }
            Value::Object(summary)
        }
        Value::Array(items) => {
            let mut summary = Map::new();
            summary.insert("type".to_string(), Value::from("array"));
            summary.insert("length".to_string(), Value::from(items.len()));

            let mut histogram = Map::new();
            for item in items {
                let ty = type_name(item);
                let count = histogram.get(ty).and_then(Value::as_u64).unwrap_or(0);
                histogram.insert(ty.to_string(), Value::from(count + 1));
            }
            summary.insert("elementTypes".to_string(), Value::Object(histogram));

            if depth == 0 {
                summary.insert("sample".to_string(), Value::from("..."));
            } else {
                let sample: Vec<Value> = items
                    .iter()
                    .take(sample_size)
                    .map(|item| summarize(item, depth - 1, sample_size))
                    .collect();
                summary.insert("sample".to_string(), Value::Array(sample));
            }
            Value::Object(summary)
        }
        Value::String(s) => {
            let mut summary = Map::new();
            summary.insert("type".to_string(), Value::from("string"));
            summary.insert("length".to_string(), Value::from(s.chars().count()));
            let preview: String = s.chars().take(STRING_PREVIEW_CHARS).collect();
            summary.insert("preview".to_string(), Value::String(preview));
            Value::Object(summary)
        }
        Value::Number(n) => {
            let mut summary = Map::new();
            summary.insert("type".to_string(), Value::from("number"));
            summary.insert("value".to_string(), Value::Number(n.clone()));
            Value::Object(summary)
        }
        Value::Bool(b) => {
            let mut summary = Map::new();
            summary.insert("type".to_string(), Value::from("boolean"));
            summary.insert("value".to_string(), Value::Bool(*b));
            Value::Object(summary)
        }
        Value::Null => {
            let mut summary = Map::new();
            summary.insert("type".to_string(), Value::from("null"));
            Value::Object(summary)
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Object(_) => "object",
        Value::Array(_) => "array",
        Value::String(_) => "string",
        Value::Number(_) => "number",
        Value::Bool(_) => "boolean",
        Value::Null => "null",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn explore(content: &str, pairs: &[(&str, Value)]) -> Value {
        let mut params = Map::new();
        params.insert("explore".to_string(), Value::Bool(true));
        for (k, v) in pairs {
            params.insert(k.to_string(), v.clone());
        }
        let stage = ExploreProcessor
            .run(content, &params)
            .expect("applies")
            .expect("ok");
        assert!(stage.applied);
        serde_json::from_str(&stage.content).expect("summary is JSON")
    }

    #[test]
    fn summarizes_object_keys_and_types() {
        let data = serde_json::json!({ "a": 1, "b": [1, 2, 3], "c": { "d": "x" } });
        let summary = explore(&data.to_string(), &[("max_depth", Value::from(2))]);

        assert_eq!(summary["type"], "object");
        assert_eq!(summary["keyCount"], 3);
        let keys = summary["keys"].as_object().unwrap();
        assert_eq!(keys["a"]["type"], "number");
        assert_eq!(keys["a"]["value"], 1);
        assert_eq!(keys["b"]["type"], "array");
        assert_eq!(keys["b"]["length"], 3);
        assert_eq!(keys["c"]["type"], "object");
        assert_eq!(keys["c"]["keys"]["d"]["type"], "string");
        assert_eq!(keys["c"]["keys"]["d"]["preview"], "x");
    }

    #[test]
    fn array_histogram_and_sample_are_bounded() {
        let data = serde_json::json!([1, "two", 3, 4, 5, 6]);
        let summary = explore(&data.to_string(), &[("sample_size", Value::from(2))]);

        assert_eq!(summary["type"], "array");
        assert_eq!(summary["length"], 6);
        assert_eq!(summary["elementTypes"]["number"], 5);
        assert_eq!(summary["elementTypes"]["string"], 1);
        assert_eq!(summary["sample"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn long_strings_are_previewed_not_streamed() {
        let long = "x".repeat(5000);
        let data = serde_json::json!({ "blob": long });
        let summary = explore(&data.to_string(), &[]);

        let blob = &summary["keys"]["blob"];
        assert_eq!(blob["length"], 5000);
        assert_eq!(
            blob["preview"].as_str().unwrap().chars().count(),
            STRING_PREVIEW_CHARS
        );
    }

    #[test]
    fn depth_limit_stops_recursion() {
        let data = serde_json::json!({ "a": { "b": { "c": { "d": 1 } } } });
        let summary = explore(&data.to_string(), &[("max_depth", Value::from(2))]);
        let b = &summary["keys"]["a"]["keys"]["b"];
        assert_eq!(b["type"], "object");
        assert_eq!(b["keys"], "...");
    }

    #[test]
    fn non_json_content_summarized_as_string() {
        let summary = explore("plain text log line", &[]);
        assert_eq!(summary["type"], "string");
        assert_eq!(summary["length"], 19);
    }

    #[test]
    fn summary_is_smaller_than_large_payloads() {
        let items: Vec<Value> = (0..500)
            .map(|i| serde_json::json!({ "id": i, "body": "y".repeat(200) }))
            .collect();
        let data = Value::Array(items);
        let text = data.to_string();
        let summary = explore(&text, &[]);
        assert!(summary.to_string().len() < text.len() / 10);
    }

    #[test]
    fn skipped_without_marker() {
        assert!(ExploreProcessor.run("{}", &Map::new()).is_none());
    }
}
