//! Per-stream state machine turning raw SSE bytes into ordered output signals.
//!
//! The demuxer never performs I/O. The async driver in `stream.rs` feeds it chunks, acts on
//! the signals it returns (including awaiting tool dispatch) and owns terminal delivery.

use serde_json::Value;

use super::sse::{
    extract_error_message, extract_images_from_value, extract_text_from_value,
    extract_tool_call_deltas, finish_reason, usage_from_value, SseDecoder, SseRecord,
};
use super::stopping::StoppingStringMatcher;
use super::tooling::{ToolCall, ToolCallBuffer};
use super::types::UsageSummary;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemuxState {
    Running,
    ToolCallPending,
    StoppedByString,
    Completed,
    Errored,
}

impl DemuxState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DemuxState::StoppedByString | DemuxState::Completed | DemuxState::Errored
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DemuxSignal {
    Content(String),
    Images(Vec<String>),
    Usage(UsageSummary),
    ToolCallStart { tool_name: String },
    /// Fully assembled call, ready for dispatch.
    ToolCall(ToolCall),
    /// A stopping string matched. Terminal.
    Stopped,
    /// `[DONE]` or natural end of input. Terminal.
    Completed,
    /// In-band provider error. Terminal.
    Failed(String),
}

impl DemuxSignal {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DemuxSignal::Stopped | DemuxSignal::Completed | DemuxSignal::Failed(_)
        )
    }
}

pub struct StreamDemuxer {
    state: DemuxState,
    decoder: SseDecoder,
    stopper: StoppingStringMatcher,
    tool_call: ToolCallBuffer,
    tool_index: Option<u64>,
}

impl StreamDemuxer {
    pub fn new(stopping_strings: &[String]) -> Self {
        Self {
            state: DemuxState::Running,
            decoder: SseDecoder::new(),
            stopper: StoppingStringMatcher::new(stopping_strings.iter().cloned()),
            tool_call: ToolCallBuffer::default(),
            tool_index: None,
        }
    }

    pub fn state(&self) -> DemuxState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Full generated text seen so far, including anything past a stopping string.
    pub fn generated_text(&self) -> &str {
        self.stopper.accumulated_text()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<DemuxSignal> {
        let mut out = Vec::new();
        if self.is_terminal() {
            return out;
        }
        for record in self.decoder.feed(chunk) {
            self.process_record(record, &mut out);
            if self.is_terminal() {
                break;
            }
        }
        out
    }

    /// Natural end of input: the unterminated tail line is processed, then the stream completes.
    pub fn finish_input(&mut self) -> Vec<DemuxSignal> {
        let mut out = Vec::new();
        if self.is_terminal() {
            return out;
        }
        if let Some(record) = self.decoder.flush() {
            self.process_record(record, &mut out);
        }
        if !self.is_terminal() {
            self.complete(&mut out);
        }
        out
    }

    /// Transport-level failure. Returns false if the stream had already terminated.
    pub fn fail(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.state = DemuxState::Errored;
        true
    }

    fn process_record(&mut self, record: SseRecord, out: &mut Vec<DemuxSignal>) {
        let payload = match record {
            SseRecord::Done => {
                self.complete(out);
                return;
            }
            SseRecord::Payload(v) => v,
        };

        if payload.get("choices").is_none() {
            if let Some(message) = extract_error_message(&payload) {
                tracing::warn!(error = message.as_str(), "provider reported an error mid-stream");
                self.state = DemuxState::Errored;
                out.push(DemuxSignal::Failed(message));
                return;
            }
        }

        if let Some(delta) = extract_text_from_value(&payload).filter(|t| !t.is_empty()) {
            let decision = self.stopper.push(&delta);
            if !decision.text_to_emit.is_empty() {
                out.push(DemuxSignal::Content(decision.text_to_emit));
            }
            if decision.should_stop {
                tracing::debug!("stopping string matched");
                self.state = DemuxState::StoppedByString;
                out.push(DemuxSignal::Stopped);
                return;
            }
        }

        let images = extract_images_from_value(&payload);
        if !images.is_empty() {
            out.push(DemuxSignal::Images(images));
        }

        for delta in extract_tool_call_deltas(&payload) {
            self.apply_tool_delta(&delta, out);
        }

        if finish_reason(&payload) == Some("tool_calls") {
            self.dispatch_tool_call(out);
        }

        if let Some(usage) = usage_from_value(&payload) {
            out.push(DemuxSignal::Usage(usage));
        }
    }

    fn apply_tool_delta(&mut self, delta: &Value, out: &mut Vec<DemuxSignal>) {
        let index = delta.get("index").and_then(|i| i.as_u64());
        // A new index means the previous call is complete.
        if let (Some(current), Some(next)) = (self.tool_index, index) {
            if current != next {
                self.dispatch_tool_call(out);
            }
        }
        if index.is_some() {
            self.tool_index = index;
        }
        self.state = DemuxState::ToolCallPending;
        if let Some(tool_name) = self.tool_call.apply_delta(delta) {
            out.push(DemuxSignal::ToolCallStart { tool_name });
        }
    }

    fn dispatch_tool_call(&mut self, out: &mut Vec<DemuxSignal>) {
        if let Some(call) = self.tool_call.take() {
            out.push(DemuxSignal::ToolCall(call));
        }
        self.tool_index = None;
        if self.state == DemuxState::ToolCallPending {
            self.state = DemuxState::Running;
        }
    }

    fn complete(&mut self, out: &mut Vec<DemuxSignal>) {
        let held = self.stopper.finish();
        if !held.is_empty() {
            out.push(DemuxSignal::Content(held));
        }
        self.dispatch_tool_call(out);
        self.state = DemuxState::Completed;
        out.push(DemuxSignal::Completed);
    }
}
