use serde_json::{json, Map, Value};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::chat_manager::request_builder::BuiltRequest;
use crate::chat_manager::stream::StreamEvent;
use crate::error::AppError;

pub const DONE_LINE: &str = "data: [DONE]\n\n";

/// The client only bounds connecting. A whole-request deadline would also cut off the body
/// of a long stream, so [`send_request`] applies one per request to non-stream calls.
pub fn build_client(timeout_ms: Option<u64>) -> Result<reqwest::Client, AppError> {
    let mut builder = reqwest::Client::builder();
    if let Some(ms) = timeout_ms {
        builder = builder.connect_timeout(Duration::from_millis(ms));
    }
    builder.build().map_err(AppError::from)
}

pub async fn send_request(
    client: &reqwest::Client,
    request: &BuiltRequest,
) -> Result<reqwest::Response, AppError> {
    let mut builder = client.post(&request.url).json(&request.body);
    for (k, v) in &request.headers {
        builder = builder.header(k.as_str(), v.as_str());
    }
    if let (false, Some(ms)) = (request.stream, request.timeout_ms) {
        builder = builder.timeout(Duration::from_millis(ms));
    }
    builder.send().await.map_err(AppError::from)
}

/// JSON payload for one outbound event. `Complete` has none: the stream simply ends
/// with the `[DONE]` sentinel.
pub fn event_payload(event: &StreamEvent) -> Option<Value> {
    let payload = match event {
        StreamEvent::Debug(snapshot) => {
            let mut obj = Map::new();
            obj.insert("type".into(), json!("debug"));
            if let Some(fields) = snapshot.as_object() {
                for (k, v) in fields {
                    obj.insert(k.clone(), v.clone());
                }
            }
            Value::Object(obj)
        }
        StreamEvent::Content(text) => json!({ "content": text }),
        StreamEvent::ToolCallStart { tool_name } => json!({
            "type": "tool_call_start",
            "toolName": tool_name,
        }),
        StreamEvent::ToolCall(call) => json!({
            "type": "tool_call",
            "toolCall": call,
        }),
        StreamEvent::ToolResult {
            tool_call_id,
            result,
        } => json!({
            "type": "tool_result",
            "toolCallId": tool_call_id,
            "result": result,
        }),
        StreamEvent::ToolError { error } => json!({
            "type": "tool_error",
            "error": error,
        }),
        StreamEvent::Images(images) => json!({
            "type": "images",
            "images": images,
        }),
        StreamEvent::Usage(usage) => json!({
            "type": "usage",
            "usage": usage,
        }),
        StreamEvent::Stopped { reason } => json!({
            "type": "stopped",
            "reason": reason,
        }),
        StreamEvent::Complete { .. } => return None,
        StreamEvent::Error(failure) => {
            let mut obj = json!({
                "type": "error",
                "error": failure.message,
            });
            if let (Some(status), Some(map)) = (failure.status, obj.as_object_mut()) {
                map.insert("status".into(), json!(status));
            }
            obj
        }
    };
    Some(payload)
}

/// One SSE line (`data: <json>\n\n`) for the event, if it has a wire form.
pub fn encode_event(event: &StreamEvent) -> Option<String> {
    event_payload(event).map(|payload| format!("data: {}\n\n", payload))
}

/// Writes every event to `writer` as SSE lines, then the `[DONE]` sentinel once the channel
/// closes.
pub async fn pipe_events<W>(
    events: &mut mpsc::Receiver<StreamEvent>,
    writer: &mut W,
) -> Result<(), AppError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(event) = events.recv().await {
        if let Some(line) = encode_event(&event) {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await?;
        }
    }
    writer.write_all(DONE_LINE.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat_manager::stream::StreamFailure;
    use crate::chat_manager::tooling::{FunctionCall, ToolCall};

    #[test]
    fn content_is_bare_and_others_are_typed() {
        assert_eq!(
            encode_event(&StreamEvent::Content("Hi".into())).unwrap(),
            "data: {\"content\":\"Hi\"}\n\n"
        );
        let start = event_payload(&StreamEvent::ToolCallStart {
            tool_name: "roll".into(),
        })
        .unwrap();
        assert_eq!(start, json!({"type": "tool_call_start", "toolName": "roll"}));

        let call = ToolCall {
            id: "c1".into(),
            kind: "function".into(),
            function: FunctionCall {
                name: "roll".into(),
                arguments: "{}".into(),
            },
        };
        let payload = event_payload(&StreamEvent::ToolCall(call)).unwrap();
        assert_eq!(payload["toolCall"]["function"]["name"], "roll");

        let stopped = event_payload(&StreamEvent::Stopped {
            reason: "stopping_string".into(),
        })
        .unwrap();
        assert_eq!(stopped, json!({"type": "stopped", "reason": "stopping_string"}));
        assert!(encode_event(&StreamEvent::Complete {
            content: "x".into()
        })
        .is_none());
    }

    #[test]
    fn errors_and_debug() {
        let err = event_payload(&StreamEvent::Error(StreamFailure::new(Some(401), "bad key"))).unwrap();
        assert_eq!(err, json!({"type": "error", "error": "bad key", "status": 401}));
        let err = event_payload(&StreamEvent::Error(StreamFailure::new(None, "reset"))).unwrap();
        assert!(err.get("status").is_none());

        let debug = event_payload(&StreamEvent::Debug(json!({
            "messages": [],
            "lorebookMatches": {"w": ["a"]}
        })))
        .unwrap();
        assert_eq!(debug["type"], "debug");
        assert_eq!(debug["lorebookMatches"]["w"][0], "a");
    }

    #[tokio::test]
    async fn pipe_ends_with_done() {
        let (tx, mut rx) = mpsc::channel(4);
        tx.send(StreamEvent::Content("a".into())).await.unwrap();
        tx.send(StreamEvent::Complete {
            content: "a".into(),
        })
        .await
        .unwrap();
        drop(tx);
        let mut out: Vec<u8> = Vec::new();
        pipe_events(&mut rx, &mut out).await.unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "data: {\"content\":\"a\"}\n\ndata: [DONE]\n\n"
        );
    }
}
