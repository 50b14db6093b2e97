use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use super::tooling::ToolCall;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    /// Role name with its first letter capitalized, used by the single-user flattening.
    pub fn label(&self) -> &'static str {
        match self {
            Role::System => "System",
            Role::User => "User",
            Role::Assistant => "Assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    /// Opaque to every text-processing stage; forwarded as received.
    ImageUrl { image_url: Value },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, ContentPart::Text { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Text(String::new())
    }
}

impl From<&str> for MessageContent {
    fn from(value: &str) -> Self {
        MessageContent::Text(value.to_string())
    }
}

impl From<String> for MessageContent {
    fn from(value: String) -> Self {
        MessageContent::Text(value)
    }
}

impl MessageContent {
    /// Plain-text view of the content. Text parts are joined with newlines, other parts skipped.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// Applies `f` to every piece of text, leaving non-text parts untouched.
    pub fn map_text<F>(&self, mut f: F) -> MessageContent
    where
        F: FnMut(&str) -> String,
    {
        match self {
            MessageContent::Text(s) => MessageContent::Text(f(s)),
            MessageContent::Parts(parts) => MessageContent::Parts(
                parts
                    .iter()
                    .map(|part| match part {
                        ContentPart::Text { text } => ContentPart::Text { text: f(text) },
                        other => other.clone(),
                    })
                    .collect(),
            ),
        }
    }

    pub fn image_parts(&self) -> Vec<ContentPart> {
        match self {
            MessageContent::Text(_) => Vec::new(),
            MessageContent::Parts(parts) => {
                parts.iter().filter(|p| !p.is_text()).cloned().collect()
            }
        }
    }

    pub fn into_parts(self) -> Vec<ContentPart> {
        match self {
            MessageContent::Text(s) => vec![ContentPart::text(s)],
            MessageContent::Parts(parts) => parts,
        }
    }

    /// Concatenates two contents. Two plain strings stay a string joined by `separator`;
    /// anything involving parts becomes a part list preserving every part in order.
    pub fn concat(self, other: MessageContent, separator: &str) -> MessageContent {
        match (self, other) {
            (MessageContent::Text(a), MessageContent::Text(b)) => {
                if a.is_empty() {
                    MessageContent::Text(b)
                } else if b.is_empty() {
                    MessageContent::Text(a)
                } else {
                    MessageContent::Text(format!("{}{}{}", a, separator, b))
                }
            }
            (a, b) => {
                let mut parts = a.into_parts();
                parts.extend(b.into_parts());
                MessageContent::Parts(parts)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: MessageContent,
}

impl Message {
    pub fn new(role: Role, content: impl Into<MessageContent>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<MessageContent>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<MessageContent>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<MessageContent>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn text(&self) -> String {
        self.content.text()
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LorebookEntry {
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub constant: bool,
    #[serde(default)]
    pub always_on: bool,
    #[serde(default, alias = "key")]
    pub keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default)]
    pub priority: f64,
}

impl LorebookEntry {
    pub fn is_constant(&self) -> bool {
        self.constant || self.always_on
    }

    /// Text injected into the prompt: `content`, or `text` when content is empty.
    pub fn injected_content(&self) -> &str {
        if self.content.is_empty() {
            self.text.as_deref().unwrap_or("")
        } else {
            &self.content
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lorebook {
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "entries_from_array_or_map")]
    pub entries: Vec<LorebookEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_depth: Option<usize>,
}

/// Lorebook exports store entries either as an array or as an object keyed by uid.
fn entries_from_array_or_map<'de, D>(deserializer: D) -> Result<Vec<LorebookEntry>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Entries {
        List(Vec<LorebookEntry>),
        Keyed(BTreeMap<String, LorebookEntry>),
    }

    Ok(match Entries::deserialize(deserializer)? {
        Entries::List(list) => list,
        Entries::Keyed(map) => {
            let mut keyed: Vec<(String, LorebookEntry)> = map.into_iter().collect();
            keyed.sort_by(|(a, _), (b, _)| match (a.parse::<u64>(), b.parse::<u64>()) {
                (Ok(x), Ok(y)) => x.cmp(&y),
                _ => a.cmp(b),
            });
            keyed.into_iter().map(|(_, entry)| entry).collect()
        }
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Constant,
    Keyword,
    Regex,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchedEntry {
    #[serde(flatten)]
    pub entry: LorebookEntry,
    pub matched_keys: Vec<String>,
    pub match_type: MatchType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", from = "String")]
pub enum ProcessingMode {
    None,
    #[default]
    MergeSystem,
    Strict,
    SemiStrict,
    SingleUser,
    AnthropicPrefill,
}

impl ProcessingMode {
    /// Unknown names fall back to `MergeSystem` with a warning.
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "none" => ProcessingMode::None,
            "merge_system" => ProcessingMode::MergeSystem,
            "strict" => ProcessingMode::Strict,
            "semi_strict" => ProcessingMode::SemiStrict,
            "single_user" => ProcessingMode::SingleUser,
            "anthropic_prefill" => ProcessingMode::AnthropicPrefill,
            other => {
                tracing::warn!(mode = other, "unknown prompt processing mode, using merge_system");
                ProcessingMode::MergeSystem
            }
        }
    }
}

impl From<String> for ProcessingMode {
    fn from(value: String) -> Self {
        ProcessingMode::parse(&value)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MacroContext {
    #[serde(default)]
    pub char_name: Option<String>,
    #[serde(default)]
    pub char_nickname: Option<String>,
    #[serde(default)]
    pub user_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CompletionOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    /// Assistant prefill used by the `anthropic_prefill` processing mode; never sent upstream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefill: Option<String>,
    /// Provider-specific sampling fields forwarded verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_stream() -> bool {
    true
}

/// Inbound request handed to the pipeline by the route layer.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    #[serde(default)]
    pub messages: Vec<Message>,
    pub model: String,
    #[serde(default)]
    pub options: CompletionOptions,
    #[serde(default)]
    pub context: MacroContext,
    #[serde(default)]
    pub prompt_processing: ProcessingMode,
    #[serde(default)]
    pub lorebook_filenames: Vec<String>,
    #[serde(default)]
    pub tools: Vec<Value>,
    #[serde(default)]
    pub stopping_strings: Vec<String>,
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_stream")]
    pub stream: bool,
    #[serde(default = "default_true")]
    pub remove_comments: bool,
    #[serde(default)]
    pub scan_depth: Option<usize>,
    #[serde(default)]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSummary {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
}

/// Result of the non-streaming variant of the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CompletionResult {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_content_accepts_string_and_parts() {
        let plain: Message = serde_json::from_value(json!({"role": "user", "content": "Hi"})).unwrap();
        assert_eq!(plain.content, MessageContent::Text("Hi".into()));

        let parts: Message = serde_json::from_value(json!({
            "role": "user",
            "content": [
                {"type": "text", "text": "look"},
                {"type": "image_url", "image_url": {"url": "data:image/png;base64,AAA", "detail": "low"}}
            ]
        }))
        .unwrap();
        assert_eq!(parts.text(), "look");
        assert_eq!(parts.content.image_parts().len(), 1);

        let back = serde_json::to_value(&parts).unwrap();
        assert_eq!(back["content"][1]["image_url"]["detail"], "low");
    }

    #[test]
    fn unknown_processing_mode_falls_back_to_merge_system() {
        let mode: ProcessingMode = serde_json::from_value(json!("banana")).unwrap();
        assert_eq!(mode, ProcessingMode::MergeSystem);
        let mode: ProcessingMode = serde_json::from_value(json!("semi_strict")).unwrap();
        assert_eq!(mode, ProcessingMode::SemiStrict);
    }

    #[test]
    fn lorebook_entries_from_keyed_object() {
        let book: Lorebook = serde_json::from_value(json!({
            "name": "world",
            "entries": {
                "10": {"name": "late", "key": ["b"], "content": "B"},
                "2": {"name": "early", "keys": ["a"], "content": "A"}
            }
        }))
        .unwrap();
        let names: Vec<&str> = book.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["early", "late"]);
        assert!(book.entries[0].enabled);
        assert_eq!(book.entries[1].keys, vec!["b".to_string()]);
    }

    #[test]
    fn injected_content_falls_back_to_text() {
        let entry: LorebookEntry =
            serde_json::from_value(json!({"text": "from text", "constant": true})).unwrap();
        assert_eq!(entry.injected_content(), "from text");
        assert!(entry.is_constant());
    }

    #[test]
    fn completion_options_keep_extra_fields() {
        let opts: CompletionOptions =
            serde_json::from_value(json!({"temperature": 0.7, "min_p": 0.05})).unwrap();
        assert_eq!(opts.temperature, Some(0.7));
        assert_eq!(opts.extra.get("min_p"), Some(&json!(0.05)));
    }
}
