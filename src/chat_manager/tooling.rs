use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Bare tool definition (`{name, description, parameters}`), wrapped into OpenAI form on send.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Value,
}

impl ToolDefinition {
    pub fn to_openai(&self) -> Value {
        let mut function = json!({
            "name": self.name,
            "parameters": self.parameters,
        });
        if let Some(desc) = &self.description {
            if let Some(obj) = function.as_object_mut() {
                obj.insert("description".to_string(), Value::String(desc.clone()));
            }
        }
        json!({
            "type": "function",
            "function": function,
        })
    }
}

/// Accepts tool schemas in OpenAI form or as bare definitions and returns the OpenAI form.
/// Anything unrecognised is forwarded untouched for the provider to judge.
pub fn openai_tools(tools: &[Value]) -> Option<Vec<Value>> {
    let out: Vec<Value> = tools
        .iter()
        .map(|tool| {
            if tool.get("type").is_some() {
                return tool.clone();
            }
            match serde_json::from_value::<ToolDefinition>(tool.clone()) {
                Ok(def) => def.to_openai(),
                Err(_) => tool.clone(),
            }
        })
        .collect();

    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCall {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default = "function_type")]
    pub kind: String,
    pub function: FunctionCall,
}

fn function_type() -> String {
    "function".to_string()
}

impl ToolCall {
    pub fn name(&self) -> &str {
        &self.function.name
    }

    /// Parsed arguments; falls back to the raw string when it is not valid JSON.
    pub fn arguments_value(&self) -> Value {
        let raw = self.function.arguments.trim();
        if raw.is_empty() {
            return Value::Object(Default::default());
        }
        serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
    }
}

/// One in-flight tool call assembled from streamed deltas. Arguments only need to be
/// well-formed JSON once the final fragment has arrived.
#[derive(Debug, Default)]
pub struct ToolCallBuffer {
    call: Option<ToolCall>,
    start_announced: bool,
}

impl ToolCallBuffer {
    pub fn is_empty(&self) -> bool {
        self.call.is_none()
    }

    /// Folds one `tool_calls[i]` delta in. Returns the tool name the first time the buffered
    /// call has a non-empty name.
    pub fn apply_delta(&mut self, delta: &Value) -> Option<String> {
        let id = delta.get("id").and_then(|v| v.as_str());
        let kind = delta.get("type").and_then(|v| v.as_str());
        let function = delta.get("function");
        let name = function
            .and_then(|f| f.get("name"))
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let arguments = function
            .and_then(|f| f.get("arguments"))
            .map(|v| match v {
                Value::String(s) => s.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            })
            .unwrap_or_default();

        match self.call.as_mut() {
            None => {
                self.call = Some(ToolCall {
                    id: id.unwrap_or_default().to_string(),
                    kind: kind.unwrap_or("function").to_string(),
                    function: FunctionCall {
                        name: name.to_string(),
                        arguments,
                    },
                });
            }
            Some(call) => {
                if call.id.is_empty() {
                    if let Some(id) = id {
                        call.id = id.to_string();
                    }
                }
                call.function.name.push_str(name);
                call.function.arguments.push_str(&arguments);
            }
        }

        match &self.call {
            Some(call) if !self.start_announced && !call.function.name.is_empty() => {
                self.start_announced = true;
                Some(call.function.name.clone())
            }
            _ => None,
        }
    }

    /// Hands the assembled call out and resets the buffer for a possible next call.
    pub fn take(&mut self) -> Option<ToolCall> {
        self.start_announced = false;
        self.call.take()
    }
}

/// Tool calls from a complete (non-streamed) `choices[0].message`.
pub fn parse_message_tool_calls(payload: &Value) -> Vec<ToolCall> {
    let message = payload
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"));
    message
        .and_then(|m| m.get("tool_calls"))
        .and_then(|v| v.as_array())
        .map(|calls| {
            calls
                .iter()
                .filter_map(|raw| {
                    let mut buffer = ToolCallBuffer::default();
                    buffer.apply_delta(raw);
                    buffer.take()
                })
                .filter(|call| !call.function.name.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Executes tool calls on behalf of the stream. Implemented by the caller; failures are
/// reported on the `tool_error` channel and never abort generation.
#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    async fn dispatch(&self, call: &ToolCall) -> Result<Value, String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_bare_definitions() {
        let tools = openai_tools(&[
            json!({"name": "roll_dice", "description": "Roll", "parameters": {"type": "object"}}),
            json!({"type": "function", "function": {"name": "keep"}}),
        ])
        .unwrap();
        assert_eq!(tools[0]["type"], "function");
        assert_eq!(tools[0]["function"]["name"], "roll_dice");
        assert_eq!(tools[0]["function"]["description"], "Roll");
        assert_eq!(tools[1]["function"]["name"], "keep");
        assert!(openai_tools(&[]).is_none());
    }

    #[test]
    fn buffer_assembles_fragments_and_announces_once() {
        let mut buffer = ToolCallBuffer::default();
        assert!(buffer.is_empty());
        let first = buffer.apply_delta(&json!({
            "index": 0, "id": "call_1", "type": "function",
            "function": {"name": "", "arguments": ""}
        }));
        assert_eq!(first, None);
        let named = buffer.apply_delta(&json!({"index": 0, "function": {"name": "get_weather"}}));
        assert_eq!(named.as_deref(), Some("get_weather"));
        assert_eq!(buffer.apply_delta(&json!({"function": {"arguments": "{\"ci"}})), None);
        buffer.apply_delta(&json!({"function": {"arguments": "ty\": \"Paris\"}"}}));

        let call = buffer.take().unwrap();
        assert!(buffer.is_empty());
        assert_eq!(call.id, "call_1");
        assert_eq!(call.kind, "function");
        assert_eq!(call.name(), "get_weather");
        assert_eq!(call.arguments_value(), json!({"city": "Paris"}));
    }

    #[test]
    fn serializes_in_openai_shape() {
        let call = ToolCall {
            id: "c".into(),
            kind: "function".into(),
            function: FunctionCall {
                name: "f".into(),
                arguments: "{}".into(),
            },
        };
        assert_eq!(
            serde_json::to_value(&call).unwrap(),
            json!({"id": "c", "type": "function", "function": {"name": "f", "arguments": "{}"}})
        );
    }

    #[test]
    fn parses_complete_message_calls() {
        let payload = json!({"choices": [{"message": {"content": null, "tool_calls": [
            {"id": "a", "type": "function", "function": {"name": "x", "arguments": "{\"n\":1}"}}
        ]}}]});
        let calls = parse_message_tool_calls(&payload);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].arguments_value(), json!({"n": 1}));
    }
}
