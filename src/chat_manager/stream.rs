//! Async driver for one streaming completion and the typed event channel it feeds.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::abort_manager::AbortRegistry;
use crate::serde_utils::{redacted_headers, summarize_request_body, truncate_for_log};
use crate::transport::send_request;

use super::demux::{DemuxSignal, StreamDemuxer};
use super::request_builder::BuiltRequest;
use super::tooling::{ToolCall, ToolDispatcher};
use super::types::UsageSummary;

pub const STOP_REASON_STOPPING_STRING: &str = "stopping_string";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamFailure {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub message: String,
}

impl StreamFailure {
    pub fn new(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Debug(Value),
    Content(String),
    ToolCallStart { tool_name: String },
    ToolCall(ToolCall),
    ToolResult { tool_call_id: String, result: Value },
    ToolError { error: String },
    Images(Vec<String>),
    Usage(UsageSummary),
    Stopped { reason: String },
    Complete { content: String },
    Error(StreamFailure),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Complete { .. } | StreamEvent::Error(_))
    }
}

#[derive(Debug, Default)]
struct ControlState {
    finished: bool,
    /// Content actually handed to the consumer.
    partial: String,
}

/// Shared between the consumer and the driver. Whichever of completion, failure or
/// cancellation marks the stream finished first owns the outcome.
#[derive(Debug, Default)]
pub struct StreamControl {
    state: Mutex<ControlState>,
    cancelled: CancellationToken,
}

impl StreamControl {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().map(|s| s.finished).unwrap_or(true)
    }

    /// Content delivered to the consumer so far.
    pub fn partial_content(&self) -> String {
        self.state
            .lock()
            .map(|s| s.partial.clone())
            .unwrap_or_default()
    }

    /// Stops the stream: no further events are delivered, the upstream request is dropped
    /// and the content delivered so far is returned. Calling it after the stream ended only
    /// returns the content.
    pub fn cancel(&self) -> String {
        let (first, partial) = match self.state.lock() {
            Ok(mut state) => {
                let first = !state.finished;
                state.finished = true;
                (first, state.partial.clone())
            }
            Err(_) => (true, String::new()),
        };
        if first {
            self.cancelled.cancel();
        }
        partial
    }

    fn mark_finished(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.finished = true;
        }
    }

    /// Sends through a reserved slot unless the stream already finished. The check, the
    /// content bookkeeping and the send happen under one lock, so an event is either counted
    /// in the partial content and delivered, or dropped.
    fn deliver(&self, permit: mpsc::Permit<'_, StreamEvent>, event: StreamEvent) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        if state.finished {
            return false;
        }
        match &event {
            StreamEvent::Content(delta) => state.partial.push_str(delta),
            e if e.is_terminal() => state.finished = true,
            _ => {}
        }
        permit.send(event);
        true
    }
}

/// Consumer side of one stream.
pub struct StreamHandle {
    pub request_id: String,
    pub events: mpsc::Receiver<StreamEvent>,
    pub control: Arc<StreamControl>,
}

impl StreamHandle {
    pub fn cancel(&self) -> String {
        self.control.cancel()
    }

    /// Drains the channel until it closes.
    pub async fn collect(mut self) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        while let Some(event) = self.events.recv().await {
            out.push(event);
        }
        out
    }

    /// A handle whose only event is the given failure. Nothing is sent upstream.
    pub fn failed(request_id: String, failure: StreamFailure) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let control = Arc::new(StreamControl::new());
        control.mark_finished();
        let _ = tx.try_send(StreamEvent::Error(failure));
        Self {
            request_id,
            events: rx,
            control,
        }
    }
}

/// Delivery end of the channel. Waiting for channel capacity is raced against cancellation,
/// so a full channel never keeps a cancelled driver alive.
struct EventSink {
    tx: mpsc::Sender<StreamEvent>,
    control: Arc<StreamControl>,
}

impl EventSink {
    /// Returns false when the consumer is gone or the stream has finished.
    async fn emit(&self, event: StreamEvent) -> bool {
        if self.control.is_finished() {
            return false;
        }
        let permit = tokio::select! {
            biased;
            _ = self.control.cancelled.cancelled() => return false,
            permit = self.tx.reserve() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    self.control.mark_finished();
                    return false;
                }
            },
        };
        self.control.deliver(permit, event)
    }

    /// Delivers the terminal event at most once.
    async fn finish(&self, event: StreamEvent) {
        self.emit(event).await;
        self.control.mark_finished();
    }

    async fn complete(&self) {
        let content = self.control.partial_content();
        self.finish(StreamEvent::Complete { content }).await;
    }

    async fn cancelled(&self) {
        self.control.cancelled.cancelled().await
    }
}

pub struct StreamJob {
    pub client: reqwest::Client,
    pub request: BuiltRequest,
    pub stopping_strings: Vec<String>,
    pub dispatcher: Option<Arc<dyn ToolDispatcher>>,
    /// Events delivered before the upstream request is opened (the debug snapshot).
    pub preamble: Vec<StreamEvent>,
}

/// Starts the driver task and returns the consumer handle. The control is registered under
/// the request id until the stream ends.
pub fn spawn_stream(job: StreamJob, capacity: usize, registry: AbortRegistry) -> StreamHandle {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let control = Arc::new(StreamControl::new());
    let request_id = job.request.request_id.clone();

    registry.register(request_id.clone(), control.clone());

    let sink = EventSink {
        tx,
        control: control.clone(),
    };
    let span = tracing::info_span!("stream", request_id = request_id.as_str());
    let task_request_id = request_id.clone();
    let task_control = control.clone();
    tokio::spawn(
        async move {
            drive(job, sink).await;
            registry.unregister(&task_request_id, &task_control);
        }
        .instrument(span),
    );

    StreamHandle {
        request_id,
        events: rx,
        control,
    }
}

enum Flow {
    Continue,
    /// Cancelled, consumer gone, or the terminal event was already delivered.
    Halt,
    Complete,
}

async fn drive(job: StreamJob, sink: EventSink) {
    let StreamJob {
        client,
        request,
        stopping_strings,
        dispatcher,
        preamble,
    } = job;

    for event in preamble {
        if !sink.emit(event).await {
            return;
        }
    }

    tracing::info!(
        url = request.url.as_str(),
        model = request.body.model.as_str(),
        messages = request.body.messages.len(),
        "opening completion stream"
    );
    tracing::debug!(headers = ?redacted_headers(&request.headers), "request headers");
    if let Ok(body) = serde_json::to_value(&request.body) {
        tracing::debug!(body = %summarize_request_body(&body), "request body");
    }

    let response = tokio::select! {
        _ = sink.cancelled() => {
            tracing::info!("stream cancelled before response");
            return;
        }
        result = send_request(&client, &request) => result,
    };
    let response = match response {
        Ok(r) => r,
        Err(err) => {
            tracing::error!(error = %err, "completion request failed");
            let status = err.status();
            sink.finish(StreamEvent::Error(StreamFailure::new(status, err.to_string())))
                .await;
            return;
        }
    };

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        tracing::warn!(
            status = status.as_u16(),
            body = %truncate_for_log(&body, 512),
            "provider rejected completion request"
        );
        let message = if body.trim().is_empty() {
            format!("HTTP {}", status.as_u16())
        } else {
            body
        };
        sink.finish(StreamEvent::Error(StreamFailure::new(
            Some(status.as_u16()),
            message,
        )))
        .await;
        return;
    }

    let mut demuxer = StreamDemuxer::new(&stopping_strings);
    let mut body_stream = response.bytes_stream();
    let mut total_bytes = 0usize;

    loop {
        let signals = tokio::select! {
            _ = sink.cancelled() => {
                tracing::info!(bytes = total_bytes, "stream cancelled");
                return;
            }
            chunk_result = body_stream.next() => match chunk_result {
                Some(Ok(chunk)) => {
                    total_bytes += chunk.len();
                    tracing::trace!(bytes = chunk.len(), "stream chunk");
                    demuxer.feed(&chunk)
                }
                Some(Err(err)) => {
                    tracing::error!(error = %err, "stream error");
                    if demuxer.fail() {
                        sink.finish(StreamEvent::Error(StreamFailure::new(None, err.to_string())))
                            .await;
                    }
                    return;
                }
                None => demuxer.finish_input(),
            },
        };

        for signal in signals {
            match deliver(signal, &sink, dispatcher.as_deref()).await {
                Flow::Continue => {}
                Flow::Halt => return,
                Flow::Complete => {
                    tracing::info!(
                        bytes = total_bytes,
                        state = ?demuxer.state(),
                        generated_chars = demuxer.generated_text().len(),
                        "stream finished"
                    );
                    // Returning drops the body stream, which closes the upstream connection.
                    sink.complete().await;
                    return;
                }
            }
        }
    }
}

async fn deliver(
    signal: DemuxSignal,
    sink: &EventSink,
    dispatcher: Option<&dyn ToolDispatcher>,
) -> Flow {
    let event = match signal {
        DemuxSignal::Content(text) => StreamEvent::Content(text),
        DemuxSignal::Images(images) => StreamEvent::Images(images),
        DemuxSignal::Usage(usage) => StreamEvent::Usage(usage),
        DemuxSignal::ToolCallStart { tool_name } => StreamEvent::ToolCallStart { tool_name },
        DemuxSignal::ToolCall(call) => {
            if !sink.emit(StreamEvent::ToolCall(call.clone())).await {
                return Flow::Halt;
            }
            return dispatch_tool(call, sink, dispatcher).await;
        }
        DemuxSignal::Stopped => StreamEvent::Stopped {
            reason: STOP_REASON_STOPPING_STRING.to_string(),
        },
        DemuxSignal::Completed => return Flow::Complete,
        DemuxSignal::Failed(message) => {
            sink.finish(StreamEvent::Error(StreamFailure::new(None, message)))
                .await;
            return Flow::Halt;
        }
    };
    let stop = matches!(event, StreamEvent::Stopped { .. });
    if !sink.emit(event).await {
        return Flow::Halt;
    }
    if stop {
        Flow::Complete
    } else {
        Flow::Continue
    }
}

async fn dispatch_tool(
    call: ToolCall,
    sink: &EventSink,
    dispatcher: Option<&dyn ToolDispatcher>,
) -> Flow {
    let Some(dispatcher) = dispatcher else {
        tracing::debug!(tool = call.name(), "no tool dispatcher configured");
        return Flow::Continue;
    };

    tracing::info!(tool = call.name(), id = call.id.as_str(), "dispatching tool call");
    let outcome = tokio::select! {
        _ = sink.cancelled() => {
            tracing::info!("stream cancelled during tool dispatch");
            return Flow::Halt;
        }
        outcome = dispatcher.dispatch(&call) => outcome,
    };

    let event = match outcome {
        Ok(result) => StreamEvent::ToolResult {
            tool_call_id: call.id.clone(),
            result,
        },
        Err(error) => {
            tracing::warn!(tool = call.name(), error = error.as_str(), "tool dispatch failed");
            StreamEvent::ToolError { error }
        }
    };
    if sink.emit(event).await {
        Flow::Continue
    } else {
        Flow::Halt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink_pair(capacity: usize) -> (EventSink, mpsc::Receiver<StreamEvent>, Arc<StreamControl>) {
        let (tx, rx) = mpsc::channel(capacity);
        let control = Arc::new(StreamControl::new());
        (
            EventSink {
                tx,
                control: control.clone(),
            },
            rx,
            control,
        )
    }

    #[tokio::test]
    async fn terminal_event_delivered_once() {
        let (sink, mut rx, control) = sink_pair(8);
        assert!(sink.emit(StreamEvent::Content("Hi".into())).await);
        sink.complete().await;
        assert!(control.is_finished());
        drop(sink);
        assert_eq!(rx.recv().await, Some(StreamEvent::Content("Hi".into())));
        assert_eq!(
            rx.recv().await,
            Some(StreamEvent::Complete {
                content: "Hi".into()
            })
        );
        assert_eq!(rx.recv().await, None);
        // Late cancel only reports content.
        assert_eq!(control.cancel(), "Hi");
    }

    #[tokio::test]
    async fn cancel_suppresses_everything_after_it() {
        let (sink, mut rx, control) = sink_pair(8);
        sink.emit(StreamEvent::Content("par".into())).await;
        assert_eq!(control.cancel(), "par");
        assert!(!sink.emit(StreamEvent::Content("tial".into())).await);
        sink.finish(StreamEvent::Error(StreamFailure::new(None, "late"))).await;
        drop(sink);
        assert_eq!(rx.recv().await, Some(StreamEvent::Content("par".into())));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn cancel_wakes_the_driver() {
        let control = StreamControl::new();
        control.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), control.cancelled.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cancel_unblocks_a_full_channel() {
        let (sink, mut rx, control) = sink_pair(1);
        assert!(sink.emit(StreamEvent::Content("a".into())).await);
        let canceller = control.clone();
        let blocked = tokio::spawn(async move {
            let delivered = sink.emit(StreamEvent::Content("b".into())).await;
            (delivered, sink)
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(canceller.cancel(), "a");

        let (delivered, sink) = tokio::time::timeout(std::time::Duration::from_secs(1), blocked)
            .await
            .unwrap()
            .unwrap();
        assert!(!delivered);
        drop(sink);
        assert_eq!(rx.recv().await, Some(StreamEvent::Content("a".into())));
        assert_eq!(rx.recv().await, None);
        assert_eq!(control.partial_content(), "a");
    }

    #[tokio::test]
    async fn failed_handle_has_single_error() {
        let handle = StreamHandle::failed("r".into(), StreamFailure::new(None, "Missing API key"));
        assert!(handle.control.is_finished());
        let events = handle.collect().await;
        assert_eq!(
            events,
            vec![StreamEvent::Error(StreamFailure::new(None, "Missing API key"))]
        );
    }
}
