use std::collections::HashMap;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::config::EngineConfig;

use super::tooling::openai_tools;
use super::types::{CompletionOptions, Message};

pub const DEFAULT_TEMPERATURE: f64 = 1.0;
pub const DEFAULT_TOP_P: f64 = 0.92;
pub const DEFAULT_MAX_TOKENS: u32 = 4096;
pub const DEFAULT_PENALTY: f64 = 0.0;

/// Body fields owned by the builder; an `extra` option with one of these names is dropped.
const RESERVED_FIELDS: &[&str] = &[
    "model",
    "messages",
    "temperature",
    "top_p",
    "top_k",
    "max_tokens",
    "frequency_penalty",
    "presence_penalty",
    "stream",
    "tools",
    "stop",
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestBody {
    pub model: String,
    pub messages: Vec<Message>,
    pub temperature: f64,
    pub top_p: f64,
    pub max_tokens: u32,
    pub frequency_penalty: f64,
    pub presence_penalty: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Assembles the provider payload. Values are defaulted, never validated; the provider
/// rejects anything malformed and that rejection travels the normal error path.
pub fn build(
    messages: Vec<Message>,
    model: &str,
    options: &CompletionOptions,
    tools: &[Value],
    stopping_strings: &[String],
    stream: bool,
) -> RequestBody {
    let stop: Vec<String> = stopping_strings
        .iter()
        .filter(|s| !s.is_empty())
        .cloned()
        .collect();

    let extra = options
        .extra
        .iter()
        .filter(|(k, _)| !RESERVED_FIELDS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    RequestBody {
        model: model.to_string(),
        messages,
        temperature: options.temperature.unwrap_or(DEFAULT_TEMPERATURE),
        top_p: options.top_p.unwrap_or(DEFAULT_TOP_P),
        max_tokens: options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        frequency_penalty: options.frequency_penalty.unwrap_or(DEFAULT_PENALTY),
        presence_penalty: options.presence_penalty.unwrap_or(DEFAULT_PENALTY),
        top_k: options.top_k,
        stream,
        tools: openai_tools(tools),
        stop: if stop.is_empty() { None } else { Some(stop) },
        extra,
    }
}

pub fn normalize_headers(
    provider_id: &str,
    api_key: &str,
    extra: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut out: HashMap<String, String> = HashMap::new();
    out.insert("Authorization".into(), format!("Bearer {}", api_key));
    out.insert("Content-Type".into(), "application/json".into());
    out.insert("Accept".into(), "text/event-stream".into());
    out.insert(
        "User-Agent".into(),
        format!("loomchat/{}", env!("CARGO_PKG_VERSION")),
    );
    if provider_id.eq_ignore_ascii_case("openrouter") {
        out.insert("HTTP-Referer".into(), "https://github.com/loomchat/loomchat".into());
        out.insert("X-Title".into(), "loomchat".into());
    }
    for (k, v) in extra {
        out.insert(k.clone(), v.clone());
    }
    out
}

pub struct BuiltRequest {
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: RequestBody,
    pub stream: bool,
    pub request_id: String,
    /// Whole-request deadline, applied to non-stream calls only.
    pub timeout_ms: Option<u64>,
}

/// Binds a body to the configured provider endpoint and credentials.
pub fn build_chat_request(
    config: &EngineConfig,
    api_key: &str,
    body: RequestBody,
    request_id: String,
) -> BuiltRequest {
    let url = config.endpoint_url();
    let headers = normalize_headers(&config.provider_id, api_key, &config.headers);
    BuiltRequest {
        url,
        headers,
        stream: body.stream,
        body,
        request_id,
        timeout_ms: config.timeout_ms,
    }
}
