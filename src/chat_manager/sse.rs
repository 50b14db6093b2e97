use serde_json::Value;

use super::types::UsageSummary;

/// One logical SSE record.
#[derive(Debug, Clone, PartialEq)]
pub enum SseRecord {
    Done,
    Payload(Value),
}

/// Buffered SSE line splitter. Bytes are held until a full line arrives, so records and
/// multibyte characters split across network chunks are reassembled before decoding.
#[derive(Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Feed a raw chunk, returning the records of every line it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseRecord> {
        self.buffer.extend_from_slice(chunk);
        let mut records = Vec::new();

        let mut last_newline = 0usize;
        while let Some(offset) = self.buffer[last_newline..].iter().position(|b| *b == b'\n') {
            let end = last_newline + offset;
            if let Some(record) = parse_line(&self.buffer[last_newline..end]) {
                records.push(record);
            }
            last_newline = end + 1;
        }
        if last_newline > 0 {
            self.buffer.drain(..last_newline);
        }
        records
    }

    /// Treats whatever is left in the buffer as a final line (streams may omit the last `\n`).
    pub fn flush(&mut self) -> Option<SseRecord> {
        let rest = std::mem::take(&mut self.buffer);
        parse_line(&rest)
    }
}

fn parse_line(raw: &[u8]) -> Option<SseRecord> {
    let line = String::from_utf8_lossy(raw);
    let l = line.trim();
    let payload = l.strip_prefix("data:")?.trim();
    if payload.is_empty() {
        return None;
    }
    if payload == "[DONE]" {
        return Some(SseRecord::Done);
    }
    match serde_json::from_str::<Value>(payload) {
        Ok(v) => Some(SseRecord::Payload(v)),
        Err(err) => {
            tracing::trace!(error = %err, "ignoring unparseable sse payload");
            None
        }
    }
}

fn first_choice(v: &Value) -> Option<&Value> {
    v.get("choices").and_then(|c| c.get(0))
}

pub fn extract_text_from_value(v: &Value) -> Option<String> {
    if let Some(s) = first_choice(v)
        .and_then(|c| c.get("delta"))
        .and_then(|d| d.get("content"))
        .and_then(|t| t.as_str())
    {
        return Some(s.to_string());
    }
    if let Some(s) = first_choice(v)
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|t| t.as_str())
    {
        return Some(s.to_string());
    }
    if let Some(s) = first_choice(v)
        .and_then(|c| c.get("text"))
        .and_then(|t| t.as_str())
    {
        return Some(s.to_string());
    }
    // Anthropic Messages API streaming: content_block_delta -> delta -> text
    if v.get("type").and_then(|t| t.as_str()) == Some("content_block_delta") {
        if let Some(s) = v
            .get("delta")
            .and_then(|d| d.get("text"))
            .and_then(|t| t.as_str())
        {
            return Some(s.to_string());
        }
    }
    None
}

/// Image URLs attached to `choices[].delta.images` or `choices[].message.images`.
pub fn extract_images_from_value(v: &Value) -> Vec<String> {
    let mut out = Vec::new();
    if let Some(choices) = v.get("choices").and_then(|c| c.as_array()) {
        for choice in choices {
            let images = choice
                .get("delta")
                .and_then(|d| d.get("images"))
                .and_then(|i| i.as_array())
                .or_else(|| {
                    choice
                        .get("message")
                        .and_then(|m| m.get("images"))
                        .and_then(|i| i.as_array())
                });
            for img in images.into_iter().flatten() {
                let url = img
                    .get("image_url")
                    .and_then(|iu| iu.get("url").or(Some(iu)))
                    .and_then(|u| u.as_str())
                    .or_else(|| img.as_str());
                if let Some(url) = url {
                    out.push(url.to_string());
                }
            }
        }
    }
    out
}

pub fn extract_tool_call_deltas(v: &Value) -> Vec<Value> {
    first_choice(v)
        .and_then(|c| c.get("delta").or_else(|| c.get("message")))
        .and_then(|d| d.get("tool_calls"))
        .and_then(|t| t.as_array())
        .cloned()
        .unwrap_or_default()
}

pub fn finish_reason(v: &Value) -> Option<&str> {
    first_choice(v)
        .and_then(|c| c.get("finish_reason"))
        .and_then(|r| r.as_str())
}

/// In-band error object some providers send inside an otherwise successful stream.
pub fn extract_error_message(v: &Value) -> Option<String> {
    let err = v.get("error")?;
    if let Some(msg) = err.get("message").and_then(|m| m.as_str()) {
        return Some(msg.to_string());
    }
    if let Some(msg) = err.as_str() {
        return Some(msg.to_string());
    }
    Some(err.to_string())
}

pub fn usage_from_value(v: &Value) -> Option<UsageSummary> {
    let u = v.get("usage").filter(|u| u.is_object())?;

    let prompt_tokens = take_first(u, &["prompt_tokens", "input_tokens", "promptTokens"]);
    let completion_tokens = take_first(
        u,
        &["completion_tokens", "output_tokens", "completionTokens"],
    );
    let total_tokens = take_first(u, &["total_tokens", "totalTokens"]).or_else(|| {
        match (prompt_tokens, completion_tokens) {
            (Some(p), Some(c)) => Some(p + c),
            _ => None,
        }
    });

    if prompt_tokens.is_none() && completion_tokens.is_none() && total_tokens.is_none() {
        None
    } else {
        Some(UsageSummary {
            prompt_tokens,
            completion_tokens,
            total_tokens,
        })
    }
}

fn take_first(map: &Value, keys: &[&str]) -> Option<u64> {
    for k in keys {
        if let Some(val) = map.get(*k) {
            if let Some(n) = val.as_u64() {
                return Some(n);
            }
            if let Some(s) = val.as_str() {
                if let Ok(n) = s.trim().parse::<u64>() {
                    return Some(n);
                }
            }
        }
    }
    None
}

/// Concatenated text of a whole SSE body, for providers that stream even when asked not to.
pub fn accumulate_text_from_sse(raw: &str) -> Option<String> {
    let mut decoder = SseDecoder::new();
    let mut records = decoder.feed(raw.as_bytes());
    records.extend(decoder.flush());

    let mut out = String::new();
    for record in records {
        if let SseRecord::Payload(v) = record {
            if let Some(piece) = extract_text_from_value(&v) {
                out.push_str(&piece);
            }
        }
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}
