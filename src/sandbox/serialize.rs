//! Result serialization with a hard character budget.

use serde_json::Value;

/// Pretty-print `value` as JSON, truncating to at most `max_chars`
/// characters. When truncation happens the output ends with a literal
/// marker so the model knows it is looking at a prefix.
pub fn serialize_with_limit(value: &Value, max_chars: usize) -> String {
    let text = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
    if text.chars().count() <= max_chars {
        return text;
    }

    let suffix = format!("\n... [truncated to {max_chars} chars]");
    let suffix_len = suffix.chars().count();
    let keep = max_chars.saturating_sub(suffix_len);
    let mut out: String = text.chars().take(keep).collect();
    out.push_str(&suffix);
    out
}
