use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};
use uuid::Uuid;

use crate::abort_manager::AbortRegistry;
use crate::config::EngineConfig;
use crate::error::{AppError, AppResult};
use crate::serde_utils::{parse_body_to_value, truncate_for_log};
use crate::transport;

use super::context_injector::{inject, leading_system_count};
use super::lorebook_matcher::{merge_matches, process_lorebook};
use super::lorebook_source::{JsonDirLorebookSource, LorebookSource};
use super::macros::{MacroExpander, PickCache};
use super::prompt_normalizer::{normalize, NormalizeOptions};
use super::request_builder::{build, build_chat_request, BuiltRequest};
use super::sse::{
    accumulate_text_from_sse, extract_error_message, extract_text_from_value, usage_from_value,
};
use super::stopping::truncate_at_stop;
use super::stream::{spawn_stream, StreamEvent, StreamFailure, StreamHandle, StreamJob};
use super::tooling::{parse_message_tool_calls, ToolDispatcher};
use super::types::{ChatRequest, CompletionResult, MatchedEntry, Message};

/// Message list after macro expansion, lorebook injection and normalization.
#[derive(Debug, Clone, Default)]
pub struct PreparedPrompt {
    pub messages: Vec<Message>,
    /// Lorebook name to the names of its entries that matched.
    pub lorebook_matches: BTreeMap<String, Vec<String>>,
}

impl PreparedPrompt {
    pub fn debug_snapshot(&self) -> Value {
        json!({
            "messages": self.messages,
            "lorebookMatches": self.lorebook_matches,
        })
    }
}

pub struct ChatPipeline {
    client: reqwest::Client,
    config: EngineConfig,
    picks: PickCache,
    lorebooks: Option<Arc<dyn LorebookSource>>,
    dispatcher: Option<Arc<dyn ToolDispatcher>>,
    aborts: AbortRegistry,
}

impl ChatPipeline {
    pub fn new(config: EngineConfig) -> AppResult<Self> {
        let client = transport::build_client(config.timeout_ms)?;
        let lorebooks = config.lorebook_dir.as_ref().map(|dir| {
            Arc::new(JsonDirLorebookSource::new(dir.clone())) as Arc<dyn LorebookSource>
        });
        Ok(Self {
            client,
            config,
            picks: PickCache::new(),
            lorebooks,
            dispatcher: None,
            aborts: AbortRegistry::new(),
        })
    }

    pub fn with_lorebooks(mut self, source: Arc<dyn LorebookSource>) -> Self {
        self.lorebooks = Some(source);
        self
    }

    pub fn with_tool_dispatcher(mut self, dispatcher: Arc<dyn ToolDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Shares a pick cache with other pipelines serving the same conversation.
    pub fn with_pick_cache(mut self, picks: PickCache) -> Self {
        self.picks = picks;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pick_cache(&self) -> &PickCache {
        &self.picks
    }

    /// Forgets every memoized `{{pick}}`; call when a conversation is reset.
    pub fn clear_picks(&self) {
        self.picks.clear();
    }

    pub fn abort_registry(&self) -> &AbortRegistry {
        &self.aborts
    }

    /// Cancels a live stream by id and returns the content it had delivered.
    pub fn abort(&self, request_id: &str) -> AppResult<String> {
        self.aborts.abort(request_id)
    }

    fn api_key(&self) -> Option<&str> {
        self.config
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
    }

    fn scan_lorebooks(
        &self,
        request: &ChatRequest,
        messages: &[Message],
    ) -> (Vec<MatchedEntry>, BTreeMap<String, Vec<String>>) {
        let mut groups = Vec::new();
        let mut summary = BTreeMap::new();
        if request.lorebook_filenames.is_empty() {
            return (Vec::new(), summary);
        }
        let Some(source) = &self.lorebooks else {
            tracing::warn!(
                count = request.lorebook_filenames.len(),
                "lorebooks requested but no lorebook source configured"
            );
            return (Vec::new(), summary);
        };

        for name in &request.lorebook_filenames {
            let book = match source.load(name) {
                Ok(book) => book,
                Err(err) => {
                    tracing::warn!(lorebook = name.as_str(), error = %err, "skipping lorebook");
                    continue;
                }
            };
            let depth = request
                .scan_depth
                .or(book.scan_depth)
                .unwrap_or(self.config.default_scan_depth);
            let matched = process_lorebook(&book, messages, depth);
            summary.insert(
                name.clone(),
                matched.iter().map(|m| m.entry.name.clone()).collect(),
            );
            groups.push(matched);
        }
        (merge_matches(groups), summary)
    }

    /// Runs the prompt assembly stages in order: macros, lorebook scan, injection, normalization.
    pub fn prepare(&self, request: &ChatRequest) -> PreparedPrompt {
        let expander = MacroExpander::new(self.picks.clone());
        let expanded =
            expander.expand_messages(&request.messages, &request.context, request.remove_comments);

        let (mut matched, lorebook_matches) = self.scan_lorebooks(request, &expanded);
        for m in matched.iter_mut() {
            m.entry.content =
                expander.expand(m.entry.injected_content(), &request.context, request.remove_comments);
        }

        let anchor = leading_system_count(&expanded);
        let injected = inject(&expanded, &matched, anchor);

        let options = NormalizeOptions {
            prefill: request
                .options
                .prefill
                .as_deref()
                .map(|p| expander.expand(p, &request.context, request.remove_comments)),
        };
        let messages = normalize(&injected, request.prompt_processing, &options);
        tracing::debug!(
            input = request.messages.len(),
            injected = matched.len(),
            output = messages.len(),
            mode = ?request.prompt_processing,
            "prompt prepared"
        );

        PreparedPrompt {
            messages,
            lorebook_matches,
        }
    }

    fn build_request(
        &self,
        request: &ChatRequest,
        messages: Vec<Message>,
        api_key: &str,
        stream: bool,
        request_id: String,
    ) -> BuiltRequest {
        let body = build(
            messages,
            &request.model,
            &request.options,
            &request.tools,
            &request.stopping_strings,
            stream,
        );
        build_chat_request(&self.config, api_key, body, request_id)
    }

    /// Starts a streaming completion. Must be called within a tokio runtime.
    pub fn stream_completion(&self, request: ChatRequest) -> StreamHandle {
        let request_id = request
            .request_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let Some(api_key) = self.api_key() else {
            tracing::warn!(request_id = request_id.as_str(), "no API key configured");
            return StreamHandle::failed(
                request_id,
                StreamFailure::new(None, AppError::MissingApiKey.to_string()),
            );
        };

        let prepared = self.prepare(&request);
        let preamble = if request.debug {
            vec![StreamEvent::Debug(prepared.debug_snapshot())]
        } else {
            Vec::new()
        };
        let built = self.build_request(&request, prepared.messages, api_key, true, request_id);

        spawn_stream(
            StreamJob {
                client: self.client.clone(),
                request: built,
                stopping_strings: request.stopping_strings,
                dispatcher: self.dispatcher.clone(),
                preamble,
            },
            self.config.channel_capacity,
            self.aborts.clone(),
        )
    }

    /// Non-streaming variant: one request, one result. Tool calls are returned, not run.
    pub async fn complete(&self, request: ChatRequest) -> AppResult<CompletionResult> {
        let api_key = self.api_key().ok_or(AppError::MissingApiKey)?;
        let request_id = request
            .request_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let prepared = self.prepare(&request);
        let built = self.build_request(&request, prepared.messages, api_key, false, request_id);
        tracing::info!(
            request_id = built.request_id.as_str(),
            url = built.url.as_str(),
            model = request.model.as_str(),
            "sending completion request"
        );

        let response = transport::send_request(&self.client, &built).await?;
        let status = response.status();
        let text = response.text().await?;
        tracing::debug!(
            status = status.as_u16(),
            body = %truncate_for_log(&text, 512),
            "completion response"
        );
        if !status.is_success() {
            return Err(AppError::Upstream {
                status: status.as_u16(),
                body: text,
            });
        }

        let value = parse_body_to_value(&text);
        if value.get("choices").is_none() {
            if let Some(message) = extract_error_message(&value) {
                return Err(AppError::Upstream {
                    status: status.as_u16(),
                    body: message,
                });
            }
        }

        let raw = match &value {
            Value::String(s) => accumulate_text_from_sse(s),
            other => extract_text_from_value(other),
        }
        .unwrap_or_default();
        let (content, stopped) = truncate_at_stop(&raw, &request.stopping_strings);
        if stopped {
            tracing::debug!("completion truncated at stopping string");
        }

        let tool_calls = parse_message_tool_calls(&value);
        Ok(CompletionResult {
            content,
            tool_calls: if tool_calls.is_empty() {
                None
            } else {
                Some(tool_calls)
            },
            usage: usage_from_value(&value),
        })
    }
}
