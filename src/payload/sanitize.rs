//! Recursive sanitization of inbound JSON.
//!
//! Strings are trimmed, clamped to [`MAX_STRING_CHARS`] and have
//! HTML-significant characters replaced by entities. Arrays are clamped to
//! [`MAX_ARRAY_LEN`]. Non-finite numbers become 0. Object keys are kept.

use serde_json::{Number, Value};

pub const MAX_STRING_CHARS: usize = 1000;
pub const MAX_ARRAY_LEN: usize = 100;

pub fn sanitize(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(sanitize_str(&s)),
        Value::Number(n) => sanitize_number(n),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .take(MAX_ARRAY_LEN)
                .map(sanitize)
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| (key, sanitize(value)))
                .collect(),
        ),
        other => other,
    }
}

/// Trim, truncate, then escape. Truncation happens before escaping, so an
/// escaped string may be longer than the clamp.
pub fn sanitize_str(input: &str) -> String {
    let clamped: String = input.trim().chars().take(MAX_STRING_CHARS).collect();
    escape_html(&clamped)
}

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            '/' => out.push_str("&#x2F;"),
            c => out.push(c),
        }
    }
    out
}

fn sanitize_number(n: Number) -> Value {
    match n.as_f64() {
        Some(f) if !f.is_finite() => Value::from(0),
        _ => Value::Number(n),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn escapes_markup_and_trims() {
        let out = sanitize(json!("  <script>alert('x')</script>  "));
        assert_eq!(
            out,
            json!("&lt;script&gt;alert(&#x27;x&#x27;)&lt;&#x2F;script&gt;")
        );
    }

    #[test]
    fn clamps_strings_and_arrays() {
        let long = "a".repeat(MAX_STRING_CHARS + 50);
        let items: Vec<Value> = (0..150).map(Value::from).collect();
        let out = sanitize(json!({ "text": long, "items": items }));

        assert_eq!(out["text"].as_str().unwrap().chars().count(), MAX_STRING_CHARS);
        assert_eq!(out["items"].as_array().unwrap().len(), MAX_ARRAY_LEN);
    }

    #[test]
    fn recurses_into_nested_values() {
        let out = sanitize(json!({
            "payload": { "type": "alert", "tags": [" a ", { "note": "x>y" }] },
            "flag": true,
            "none": null,
            "n": 1.5
        }));

        assert_eq!(out["payload"]["tags"][0], json!("a"));
        assert_eq!(out["payload"]["tags"][1]["note"], json!("x&gt;y"));
        assert_eq!(out["flag"], json!(true));
        assert_eq!(out["none"], Value::Null);
        assert_eq!(out["n"], json!(1.5));
    }

    #[test]
    fn multibyte_strings_clamp_on_chars() {
        let long = "é".repeat(MAX_STRING_CHARS + 1);
        let out = sanitize_str(&long);
        assert_eq!(out.chars().count(), MAX_STRING_CHARS);
    }
}
