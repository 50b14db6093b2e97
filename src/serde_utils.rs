use std::collections::HashMap;

use serde_json::{json, Value};

const SECRET_MARKERS: &[&str] = &["authorization", "api-key", "apikey", "secret", "token", "cookie"];

/// Provider bodies are usually JSON; anything else is kept as a string so it can still be
/// surfaced in an error.
pub fn parse_body_to_value(text: &str) -> Value {
    if text.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

pub fn truncate_for_log(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        None => text.to_string(),
        Some((cut, _)) => format!("{}…", &text[..cut]),
    }
}

pub fn is_secret_header(name: &str) -> bool {
    let lowered = name.to_ascii_lowercase();
    SECRET_MARKERS.iter().any(|marker| lowered.contains(marker))
}

/// Header pairs safe to log, sorted by name.
pub fn redacted_headers(headers: &HashMap<String, String>) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = headers
        .iter()
        .map(|(name, value)| {
            let shown = if is_secret_header(name) {
                "***".to_string()
            } else {
                truncate_for_log(value, 64)
            };
            (name.clone(), shown)
        })
        .collect();
    out.sort();
    out
}

/// Compact view of a completion body: every field except `messages`, which is reduced to
/// role and a clipped preview so prompts do not flood the log.
pub fn summarize_request_body(body: &Value) -> String {
    let Some(fields) = body.as_object() else {
        return truncate_for_log(&body.to_string(), 512);
    };
    let mut summary = serde_json::Map::new();
    for (key, value) in fields {
        if key == "messages" {
            let previews: Vec<Value> = value
                .as_array()
                .map(|messages| {
                    messages
                        .iter()
                        .map(|m| {
                            let content = match m.get("content") {
                                Some(Value::String(s)) => s.clone(),
                                Some(other) => other.to_string(),
                                None => String::new(),
                            };
                            json!({
                                "role": m.get("role").cloned().unwrap_or(Value::Null),
                                "content": truncate_for_log(&content, 80),
                            })
                        })
                        .collect()
                })
                .unwrap_or_default();
            summary.insert(key.clone(), Value::Array(previews));
        } else {
            summary.insert(key.clone(), value.clone());
        }
    }
    truncate_for_log(&Value::Object(summary).to_string(), 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_credentials() {
        let mut headers = HashMap::new();
        headers.insert("Authorization".to_string(), "Bearer sk-1".to_string());
        headers.insert("x-api-key".to_string(), "k".to_string());
        headers.insert("Accept".to_string(), "text/event-stream".to_string());
        assert_eq!(
            redacted_headers(&headers),
            vec![
                ("Accept".to_string(), "text/event-stream".to_string()),
                ("Authorization".to_string(), "***".to_string()),
                ("x-api-key".to_string(), "***".to_string()),
            ]
        );
    }

    #[test]
    fn truncates_on_char_boundaries() {
        assert_eq!(truncate_for_log("héllo", 2), "hé…");
        assert_eq!(truncate_for_log("abc", 3), "abc");
    }

    #[test]
    fn body_summary_clips_messages() {
        let long = "x".repeat(200);
        let summary = summarize_request_body(&json!({
            "model": "m",
            "messages": [{"role": "user", "content": long}]
        }));
        let parsed: Value = serde_json::from_str(&summary).unwrap();
        assert_eq!(parsed["model"], "m");
        assert_eq!(parsed["messages"][0]["role"], "user");
        assert_eq!(parsed["messages"][0]["content"].as_str().unwrap().chars().count(), 81);
    }

    #[test]
    fn bodies_parse_or_stay_text() {
        assert_eq!(parse_body_to_value(" "), Value::Null);
        assert_eq!(parse_body_to_value("{\"x\":1}"), json!({"x": 1}));
        assert_eq!(parse_body_to_value("Bad Gateway"), json!("Bad Gateway"));
    }
}
