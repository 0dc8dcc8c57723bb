//! Execute-output normalization.
//!
//! Upstream tool results keep their envelope shape (a `content` array of
//! typed items) but every payload is bounded before it reaches the model:
//! long strings, big arrays, wide objects, deep nesting, and base64 blobs
//! all collapse to previews with explicit truncation markers.

use serde_json::{Map, Value, json};

const MAX_STRING_CHARS: usize = 4_000;
const MAX_ARRAY_ITEMS: usize = 40;
const MAX_OBJECT_KEYS: usize = 60;
const MAX_DEPTH: usize = 7;
const MAX_CONTENT_ITEMS: usize = 40;
const DATA_PREVIEW_CHARS: usize = 96;

/// Normalize a value returned by `execute` before serialization.
pub fn normalize_execute_result(value: &Value) -> Value {
    if let Value::Object(map) = value {
        if let Some(Value::Array(content)) = map.get("content") {
            return normalize_envelope(map, content);
        }
    }
    normalize_value(value, 0)
}

fn normalize_envelope(map: &Map<String, Value>, content: &[Value]) -> Value {
    let mut out = Map::new();

    let truncated = content.len() > MAX_CONTENT_ITEMS;
    let items: Vec<Value> = content
        .iter()
        .take(MAX_CONTENT_ITEMS)
        .map(normalize_content_item)
        .collect();
    out.insert("content".to_string(), Value::Array(items));
    if truncated {
        out.insert("contentTruncated".to_string(), json!(true));
        out.insert("contentOriginalLength".to_string(), json!(content.len()));
    }

    for (key, value) in map {
        if key == "content" {
            continue;
        }
        out.insert(key.clone(), normalize_value(value, 1));
    }

    Value::Object(out)
}

fn normalize_content_item(item: &Value) -> Value {
    let Some(obj) = item.as_object() else {
        return normalize_value(item, 1);
    };

    match obj.get("type").and_then(Value::as_str) {
        Some("text") => {
            let text = obj.get("text").and_then(Value::as_str).unwrap_or_default();
            json!({ "type": "text", "text": truncate_string(text, MAX_STRING_CHARS) })
        }
        Some(kind @ ("image" | "audio")) => {
            let data = obj.get("data").and_then(Value::as_str).unwrap_or_default();
            json!({
                "type": kind,
                "mimeType": obj.get("mimeType").cloned().unwrap_or(Value::Null),
                "dataPreview": truncate_string(data, DATA_PREVIEW_CHARS),
                "estimatedBytes": base64_size(data),
                "dataTruncated": data.chars().count() > DATA_PREVIEW_CHARS,
            })
        }
        Some("resource") => {
            let resource = obj
                .get("resource")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            json!({ "type": "resource", "resource": normalize_resource(&resource) })
        }
        Some("resource_link") => {
            let description = obj
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or_default();
            json!({
                "type": "resource_link",
                "uri": obj.get("uri").cloned().unwrap_or(Value::Null),
                "name": obj.get("name").cloned().unwrap_or(Value::Null),
                "mimeType": obj.get("mimeType").cloned().unwrap_or(Value::Null),
                "description": truncate_string(description, MAX_STRING_CHARS),
            })
        }
        _ => normalize_value(item, 1),
    }
}

fn normalize_resource(resource: &Map<String, Value>) -> Value {
    let mut out = Map::new();
    out.insert(
        "uri".to_string(),
        resource.get("uri").cloned().unwrap_or(Value::Null),
    );
    if let Some(mime) = resource.get("mimeType") {
        out.insert("mimeType".to_string(), mime.clone());
    }

    if let Some(text) = resource.get("text").and_then(Value::as_str) {
        let chars = text.chars().count();
        out.insert(
            "textPreview".to_string(),
            json!(truncate_string(text, MAX_STRING_CHARS)),
        );
        out.insert("textLength".to_string(), json!(chars));
        out.insert("textTruncated".to_string(), json!(chars > MAX_STRING_CHARS));
    }

    if let Some(blob) = resource.get("blob").and_then(Value::as_str) {
        out.insert(
            "blobPreview".to_string(),
            json!(truncate_string(blob, DATA_PREVIEW_CHARS)),
        );
        out.insert("estimatedBytes".to_string(), json!(base64_size(blob)));
        out.insert(
            "blobTruncated".to_string(),
            json!(blob.chars().count() > DATA_PREVIEW_CHARS),
        );
    }

    Value::Object(out)
}

/// Generic bounding: strings to 4000 chars, arrays to 40 items, objects
/// to 60 keys, nesting to depth 7.
fn normalize_value(value: &Value, depth: usize) -> Value {
    if depth > MAX_DEPTH {
        return json!("[max_depth_reached]");
    }
    match value {
        Value::String(s) => json!(truncate_string(s, MAX_STRING_CHARS)),
        Value::Array(items) => {
            let mut out: Vec<Value> = items
                .iter()
                .take(MAX_ARRAY_ITEMS)
                .map(|item| normalize_value(item, depth + 1))
                .collect();
            if items.len() > MAX_ARRAY_ITEMS {
                out.push(json!(format!(
                    "[{} items truncated]",
                    items.len() - MAX_ARRAY_ITEMS
                )));
            }
            Value::Array(out)
        }
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, child) in map.iter().take(MAX_OBJECT_KEYS) {
                out.insert(key.clone(), normalize_value(child, depth + 1));
            }
            if map.len() > MAX_OBJECT_KEYS {
                out.insert(
                    "__truncatedKeys".to_string(),
                    json!(map.len() - MAX_OBJECT_KEYS),
                );
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

fn truncate_string(s: &str, max: usize) -> String {
    let chars = s.chars().count();
    if chars <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max).collect();
    out.push_str(&format!("[truncated:{chars}]"));
    out
}

/// Estimated decoded size of a base64 string: `floor(len·3/4)` minus the
/// padding bytes.
pub fn base64_size(data: &str) -> u64 {
    let len = data.len() as u64;
    let padding = if data.ends_with("==") {
        2
    } else if data.ends_with('=') {
        1
    } else {
        0
    };
    (len * 3 / 4).saturating_sub(padding)
}
