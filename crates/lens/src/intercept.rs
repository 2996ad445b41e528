//! Response interception: oversized tool responses are cached whole and
//! replaced by a truncated reply carrying the cache handle.

use serde_json::Value;

use crate::cache::ResponseCache;
use crate::config::ProxySettings;
use crate::mcp::{render_text, text_content, CallToolResult};
use crate::stats::ProxyStats;

pub const TRUNCATION_TRAILER_PREFIX: &str = "\n\n[Response truncated. Full content cached. Use cache_id=\"";

fn truncation_trailer(handle: &str) -> String {
    format!(
        "\n\n[Response truncated. Full content cached. Use cache_id=\"{handle}\" with proxy_filter, proxy_search, or proxy_explore to access.]"
    )
}

/// Apply the auto-truncation policy to an upstream response.
///
/// When the rendered content exceeds `maxResponseSize` characters and
/// truncation is enabled, the full content is cached under `agent_id` and the
/// reply becomes the first `maxResponseSize` characters plus the trailer.
/// Otherwise the response passes through unchanged.
pub fn intercept_response(
    result: CallToolResult,
    settings: &ProxySettings,
    cache: &ResponseCache,
    stats: &ProxyStats,
    agent_id: &str,
    source_tool: &str,
    source_args: &Value,
) -> CallToolResult {
    if !settings.enable_auto_truncation {
        return result;
    }

    let rendered = render_text(&result.content);
    let char_count = rendered.chars().count();
    if char_count <= settings.max_response_size {
        return result;
    }

    let handle = match cache.put(
        agent_id,
        result.content.clone(),
        source_tool,
        source_args.clone(),
    ) {
        Ok(handle) => handle,
        Err(err) => {
            // Without a cache entry the trailer would point nowhere; return
            // the full response instead.
            tracing::warn!(
                tool = source_tool,
                error = %err,
                "could not cache oversized response; returning it untruncated"
            );
            return result;
        }
    };

    stats.record_truncation();
    tracing::debug!(
        tool = source_tool,
        chars = char_count,
        limit = settings.max_response_size,
        cache_id = %handle,
        "truncated oversized response"
    );

    let prefix: String = rendered.chars().take(settings.max_response_size).collect();
    let reply = format!("{prefix}{}", truncation_trailer(&handle.to_string()));

    CallToolResult {
        content: vec![text_content(reply)],
        is_error: result.is_error,
        structured_content: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheLookup;
    use std::time::Duration;

    fn settings(max: usize) -> ProxySettings {
        ProxySettings {
            max_response_size: max,
            ..Default::default()
        }
    }

    fn cache() -> ResponseCache {
        ResponseCache::new(10, 1 << 20, Duration::from_secs(300), 4, ProxyStats::new())
    }

    fn text_result(text: &str) -> CallToolResult {
        CallToolResult::text(text)
    }

    #[test]
    fn small_responses_pass_through() {
        let cache = cache();
        let stats = ProxyStats::new();
        let result = intercept_response(
            text_result("short"),
            &settings(100),
            &cache,
            &stats,
            "agent_1",
            "fs_read_file",
            &Value::Null,
        );
        assert_eq!(render_text(&result.content), "short");
        assert_eq!(cache.stats().entries, 0);
        assert_eq!(stats.snapshot().responses_truncated, 0);
    }

    #[test]
    fn disabled_truncation_passes_through() {
        let cache = cache();
        let mut settings = settings(10);
        settings.enable_auto_truncation = false;
        let long = "x".repeat(100);
        let result = intercept_response(
            text_result(&long),
            &settings,
            &cache,
            &ProxyStats::new(),
            "agent_1",
            "t",
            &Value::Null,
        );
        assert_eq!(render_text(&result.content), long);
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn oversized_response_is_truncated_and_cached() {
        let cache = cache();
        let stats = ProxyStats::new();
        let long = "abcdefghij".repeat(20); // 200 chars
        let original = text_result(&long);
        let result = intercept_response(
            original.clone(),
            &settings(50),
            &cache,
            &stats,
            "agent_1",
            "fs_read_file",
            &serde_json::json!({ "path": "/x" }),
        );

        let reply = render_text(&result.content);
        assert!(reply.starts_with(&long[..50]));
        assert!(reply.contains(TRUNCATION_TRAILER_PREFIX.trim_start()));
        assert!(reply.ends_with(
            "with proxy_filter, proxy_search, or proxy_explore to access.]"
        ));
        assert_eq!(stats.snapshot().responses_truncated, 1);

        // The advertised handle resolves to the full original content.
        let handle_start = reply.find("cache_id=\"").unwrap() + "cache_id=\"".len();
        let handle_end = reply[handle_start..].find('"').unwrap() + handle_start;
        let handle = &reply[handle_start..handle_end];
        let entry = match cache.get(handle) {
            CacheLookup::Hit(entry) => entry,
            other => panic!("expected hit, got {other:?}"),
        };
        assert_eq!(*entry.content, original.content);
        assert_eq!(entry.source_tool, "fs_read_file");
    }

    #[test]
    fn trailer_has_exact_literal_form() {
        let cache = cache();
        let result = intercept_response(
            text_result(&"y".repeat(100)),
            &settings(10),
            &cache,
            &ProxyStats::new(),
            "agent_1",
            "t",
            &Value::Null,
        );
        let reply = render_text(&result.content);
        let trailer_start = reply.find("\n\n[Response truncated.").unwrap();
        let trailer = &reply[trailer_start..];
        let handle_start = trailer.find('"').unwrap() + 1;
        let handle_end = trailer[handle_start..].find('"').unwrap() + handle_start;
        let handle = &trailer[handle_start..handle_end];
        assert_eq!(trailer, truncation_trailer(handle));
        assert_eq!(&reply[..10], "yyyyyyyyyy");
    }

    #[test]
    fn truncation_respects_multibyte_boundaries() {
        let cache = cache();
        let long = "é".repeat(100); // 2 bytes per char
        let result = intercept_response(
            text_result(&long),
            &settings(25),
            &cache,
            &ProxyStats::new(),
            "agent_1",
            "t",
            &Value::Null,
        );
        let reply = render_text(&result.content);
        let prefix: String = reply.chars().take_while(|c| *c == 'é').collect();
        assert_eq!(prefix.chars().count(), 25);
    }

    #[test]
    fn error_flag_is_preserved() {
        let cache = cache();
        let mut original = text_result(&"z".repeat(100));
        original.is_error = Some(true);
        let result = intercept_response(
            original,
            &settings(10),
            &cache,
            &ProxyStats::new(),
            "agent_1",
            "t",
            &Value::Null,
        );
        assert_eq!(result.is_error, Some(true));
    }
}
