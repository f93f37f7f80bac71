//! Ingress sanitization for user-controlled webhook fields.
//!
//! Every string coming off the wire passes through an allow-list HTML
//! sanitizer (inline-formatting tags only, `a` limited to
//! `href`/`title`/`target`) and is then capped in length so payload size
//! stays bounded. Applied recursively through metadata maps, lists, and
//! history entries.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

/// Upper bound on any single sanitized string.
pub const MAX_STRING_LEN: usize = 10_000;

fn cleaner() -> &'static ammonia::Builder<'static> {
    static CLEANER: OnceLock<ammonia::Builder<'static>> = OnceLock::new();
    CLEANER.get_or_init(|| {
        let tags: HashSet<&str> = [
            "b", "i", "u", "em", "strong", "a", "p", "br", "ul", "ol", "li", "code", "pre",
        ]
        .into_iter()
        .collect();
        let mut tag_attributes: HashMap<&str, HashSet<&str>> = HashMap::new();
        tag_attributes.insert("a", ["href", "title", "target"].into_iter().collect());

        let mut builder = ammonia::Builder::default();
        builder
            .tags(tags)
            .tag_attributes(tag_attributes)
            .generic_attributes(HashSet::new())
            .link_rel(None);
        builder
    })
}

/// Sanitizes one string: allow-list HTML cleaning, then the length cap.
pub fn sanitize_str(input: &str) -> String {
    let cleaned = cleaner().clean(input).to_string();
    if cleaned.len() <= MAX_STRING_LEN {
        return cleaned;
    }
    let mut end = MAX_STRING_LEN;
    while end > 0 && !cleaned.is_char_boundary(end) {
        end -= 1;
    }
    cleaned[..end].to_string()
}

/// Recursively sanitizes every string in a JSON value.
pub fn sanitize_value(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) => serde_json::Value::String(sanitize_str(&s)),
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.into_iter().map(sanitize_value).collect())
        }
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.into_iter().map(|(k, v)| (k, sanitize_value(v))).collect(),
        ),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_tags_are_stripped() {
        let out = sanitize_str("hello <script>alert('xss')</script> world");
        assert!(!out.contains("<script"));
        assert!(out.contains("hello"));
        assert!(out.contains("world"));
    }

    #[test]
    fn allowed_inline_tags_survive() {
        assert_eq!(sanitize_str("<b>bold</b> and <em>em</em>"), "<b>bold</b> and <em>em</em>");
        assert_eq!(sanitize_str("<code>x = 1</code>"), "<code>x = 1</code>");
    }

    #[test]
    fn anchors_keep_only_allowed_attributes() {
        let out = sanitize_str(r#"<a href="https://x.dev" onclick="evil()" title="t">link</a>"#);
        assert!(out.contains(r#"href="https://x.dev""#));
        assert!(out.contains(r#"title="t""#));
        assert!(!out.contains("onclick"));
    }

    #[test]
    fn disallowed_block_tags_are_unwrapped() {
        let out = sanitize_str("<div><iframe src='x'></iframe>text</div>");
        assert!(!out.contains("<div"));
        assert!(!out.contains("<iframe"));
        assert!(out.contains("text"));
    }

    #[test]
    fn long_strings_are_capped() {
        let out = sanitize_str(&"a".repeat(MAX_STRING_LEN * 2));
        assert_eq!(out.len(), MAX_STRING_LEN);
    }

    #[test]
    fn values_are_sanitized_recursively() {
        let input = serde_json::json!({
            "text": "<script>x</script>ok",
            "nested": {"k": "<iframe>y</iframe>keep"},
            "list": ["<b>fine</b>", 7, null],
        });
        let out = sanitize_value(input);
        assert_eq!(out["text"], "ok");
        assert_eq!(out["nested"]["k"], "keep");
        assert_eq!(out["list"][0], "<b>fine</b>");
        assert_eq!(out["list"][1], 7);
    }
}
