//! Stream Reconstructor
//!
//! Folds one [`RequestGroup`] into a [`ReconstructedRecord`]. Lifecycle fields are
//! resolved first-wins (completion last-wins); received fragments are merged into a
//! single chat-completion through a [`ResponseAccumulator`] owned by the fold.

use crate::constants::{
    CHAT_COMPLETION_OBJECT, DEFAULT_METHOD, DEFAULT_ROLE, DEFAULT_STATUS_CODE, DEFAULT_URL,
    UNKNOWN_SENTINEL,
};
use crate::correlator::RequestGroup;
use crate::decoder::{EventKind, Fragment, FragmentDirection};
use crate::specs::openai::*;
use crate::types::is_truthy;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FinalRequest {
    pub url: Option<String>,
    pub headers: Map<String, Value>,
    pub body: Value,
}

/// Token usage under the field names older tooling reads
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LegacyUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub cache_read_input_tokens: u64,
}

impl From<&CompletionUsage> for LegacyUsage {
    fn from(usage: &CompletionUsage) -> Self {
        Self {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
            cache_read_input_tokens: usage
                .prompt_tokens_details
                .as_ref()
                .map(|d| d.cached_tokens)
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReconstructedRecord {
    pub req_id: String,
    pub method: String,
    pub url: String,
    pub model: String,
    pub status_code: u16,
    pub response_time: f64,
    pub timestamp: i64,
    pub request_headers: Map<String, Value>,
    pub request_body: Value,
    pub final_request: Option<FinalRequest>,
    pub merged_response: Option<ChatCompletion>,

    // Legacy views, derived from `merged_response`
    pub response_content: String,
    pub response_chunks: Vec<Value>,
    pub usage: Option<LegacyUsage>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconstructStats {
    pub skipped_fragments: usize,
    pub duplicate_events: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ResponseAccumulator {
    id: Option<String>,
    created: Option<i64>,
    model: Option<String>,
    role: Option<String>,
    text_buffer: String,
    tool_calls: BTreeMap<u32, CompletionToolCall>,
    finish_reason: Option<String>,
    usage: Option<CompletionUsage>,
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.filter(|s| !s.is_empty())
}

impl ResponseAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: ChatCompletionChunk) {
        let ChatCompletionChunk {
            id,
            created,
            model,
            choices,
            usage,
        } = chunk;

        if self.id.is_none() {
            self.id = non_empty(id);
        }
        if self.created.is_none() {
            self.created = created.filter(|c| *c != 0);
        }
        if self.model.is_none() {
            self.model = non_empty(model);
        }

        // Streaming responses carry a single choice
        if let Some(choice) = choices.and_then(|c| c.into_iter().next()) {
            if let Some(delta) = choice.delta {
                if let Some(role) = non_empty(delta.role) {
                    self.role = Some(role);
                }
                if let Some(content) = delta.content {
                    self.text_buffer.push_str(&content);
                }
                for call in delta.tool_calls.unwrap_or_default() {
                    self.push_tool_call(call);
                }
            }
            if let Some(reason) = non_empty(choice.finish_reason) {
                self.finish_reason = Some(reason);
            }
        }

        if let Some(usage) = usage {
            self.usage = Some(usage.into());
        }
    }

    fn push_tool_call(&mut self, delta: ToolCallDelta) {
        let index = delta.index.unwrap_or(0);
        let entry = self.tool_calls.entry(index).or_default();

        if let Some(id) = non_empty(delta.id) {
            entry.id = Some(id);
        }
        if let Some(kind) = non_empty(delta.r#type) {
            entry.r#type = Some(kind);
        }
        if let Some(function) = delta.function {
            if let Some(name) = non_empty(function.name) {
                entry.function.name = Some(name);
            }
            if let Some(arguments) = function.arguments {
                entry.function.arguments.push_str(&arguments);
            }
        }
    }

    /// `None` when the stream never produced an id, text, or a tool call.
    ///
    /// `fallback_created` is used when no chunk carried `created`. Callers pass the
    /// request's own log time rather than the current time, so rebuilding the same
    /// group always yields the same response.
    pub fn finalize(self, fallback_created: i64) -> Option<ChatCompletion> {
        if self.id.is_none() && self.text_buffer.is_empty() && self.tool_calls.is_empty() {
            return None;
        }

        // BTreeMap iteration is already ordered by stream index
        let tool_calls: Vec<CompletionToolCall> = self.tool_calls.into_values().collect();
        let content = if self.text_buffer.is_empty() {
            None
        } else {
            Some(self.text_buffer)
        };

        Some(ChatCompletion {
            id: self.id.unwrap_or_else(|| UNKNOWN_SENTINEL.to_string()),
            object: CHAT_COMPLETION_OBJECT.to_string(),
            created: self.created.unwrap_or(fallback_created),
            model: self.model.unwrap_or_else(|| UNKNOWN_SENTINEL.to_string()),
            choices: vec![CompletionChoice {
                index: 0,
                message: CompletionMessage {
                    role: self.role.unwrap_or_else(|| DEFAULT_ROLE.to_string()),
                    content,
                    tool_calls: if tool_calls.is_empty() {
                        None
                    } else {
                        Some(tool_calls)
                    },
                },
                finish_reason: self.finish_reason,
            }],
            usage: self.usage,
        })
    }
}

/// Resolve the chunk a fragment carries: `data` (string or object) first, then `response`.
fn fragment_chunk(fragment: &Fragment) -> Option<serde_json::Result<ChatCompletionChunk>> {
    let payload = match (&fragment.data, &fragment.response) {
        (Some(data), _) if is_truthy(data) => data,
        (_, Some(response)) if is_truthy(response) => response,
        _ => return None,
    };
    Some(match payload {
        Value::String(s) => serde_json::from_str(s),
        other => ChatCompletionChunk::deserialize(other),
    })
}

pub fn reconstruct_group(group: &RequestGroup, stats: &mut ReconstructStats) -> ReconstructedRecord {
    let mut inbound: Option<(String, String)> = None;
    let mut request_body: Option<Value> = None;
    let mut final_request: Option<FinalRequest> = None;
    let mut status_code = DEFAULT_STATUS_CODE;
    let mut response_time = 0.0;
    let mut timestamp = 0;
    let mut response_chunks = Vec::new();
    let mut accumulator = ResponseAccumulator::new();

    for event in &group.events {
        if timestamp == 0 && event.time != 0 {
            timestamp = event.time;
        }

        match &event.kind {
            EventKind::Inbound(req) => {
                if inbound.is_some() {
                    stats.duplicate_events += 1;
                    tracing::debug!(req_id = %group.req_id, "Ignoring repeated incoming request event");
                    continue;
                }
                inbound = Some((
                    req.method.clone().unwrap_or_else(|| DEFAULT_METHOD.to_string()),
                    req.url.clone().unwrap_or_else(|| DEFAULT_URL.to_string()),
                ));
            }
            EventKind::RequestBody(data) => {
                if request_body.is_some() {
                    stats.duplicate_events += 1;
                    tracing::debug!(req_id = %group.req_id, "Ignoring repeated request body event");
                    continue;
                }
                request_body = Some(data.clone());
            }
            EventKind::Forwarded(fwd) => {
                if final_request.is_some() {
                    stats.duplicate_events += 1;
                    tracing::debug!(req_id = %group.req_id, "Ignoring repeated final request event");
                    continue;
                }
                final_request = Some(FinalRequest {
                    url: fwd.url.clone(),
                    headers: fwd.headers.clone().unwrap_or_default(),
                    body: fwd.body.clone().unwrap_or(Value::Null),
                });
            }
            EventKind::Fragment(fragment) if fragment.direction == FragmentDirection::Received => {
                response_chunks.push(event.raw.clone());
                match fragment_chunk(fragment) {
                    Some(Ok(chunk)) => accumulator.push(chunk),
                    Some(Err(e)) => {
                        stats.skipped_fragments += 1;
                        tracing::debug!(
                            req_id = %group.req_id,
                            line = event.line_number,
                            "Skipping unparsable fragment: {}",
                            e
                        );
                    }
                    None => {
                        stats.skipped_fragments += 1;
                        tracing::debug!(
                            req_id = %group.req_id,
                            line = event.line_number,
                            "Skipping fragment without payload"
                        );
                    }
                }
            }
            EventKind::Completion {
                status_code: status,
                response_time: elapsed,
            } => {
                status_code = status.filter(|s| *s != 0).unwrap_or(DEFAULT_STATUS_CODE);
                response_time = elapsed.unwrap_or(0.0);
            }
            EventKind::Fragment(_) | EventKind::Unrecognized => {}
        }
    }

    // Creation time falls back to the request's own log time so that rebuilding
    // the same group is deterministic; wall-clock only when the group had none.
    let fallback_created = if timestamp != 0 {
        timestamp / 1000
    } else {
        chrono::Utc::now().timestamp()
    };
    let merged_response = accumulator.finalize(fallback_created);

    let response_content = merged_response
        .as_ref()
        .and_then(|r| r.first_message())
        .and_then(|m| m.content.clone())
        .unwrap_or_default();
    let usage = merged_response
        .as_ref()
        .and_then(|r| r.usage.as_ref())
        .map(LegacyUsage::from);

    let model = request_body
        .as_ref()
        .and_then(|b| b.get("model"))
        .and_then(|m| m.as_str())
        .filter(|m| !m.is_empty())
        .unwrap_or(UNKNOWN_SENTINEL)
        .to_string();

    let (method, url) = match inbound {
        Some(pair) => pair,
        None => (DEFAULT_METHOD.to_string(), DEFAULT_URL.to_string()),
    };

    tracing::debug!(
        req_id = %group.req_id,
        events = group.events.len(),
        fragments = response_chunks.len(),
        has_response = merged_response.is_some(),
        "Reconstructed request"
    );

    ReconstructedRecord {
        req_id: group.req_id.clone(),
        method,
        url,
        model,
        status_code,
        response_time,
        timestamp,
        request_headers: final_request
            .as_ref()
            .map(|f| f.headers.clone())
            .unwrap_or_default(),
        request_body: request_body.unwrap_or(Value::Null),
        final_request,
        merged_response,
        response_content,
        response_chunks,
        usage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::decode_line;
    use serde_json::json;

    fn group(req_id: &str, lines: &[Value]) -> RequestGroup {
        let events = lines
            .iter()
            .enumerate()
            .map(|(i, v)| match decode_line(i + 1, &v.to_string()) {
                Ok(e) => e,
                Err(e) => panic!("bad fixture: {}", e),
            })
            .collect();
        RequestGroup {
            req_id: req_id.to_string(),
            events,
        }
    }

    fn received(time: i64, chunk: Value) -> Value {
        json!({"time": time, "reqId": "r1", "type": "recieved data", "data": chunk.to_string()})
    }

    fn text_chunk(text: &str) -> Value {
        json!({"id": "chatcmpl-1", "model": "m1", "choices": [{"delta": {"content": text}}]})
    }

    fn rebuild(g: &RequestGroup) -> ReconstructedRecord {
        reconstruct_group(g, &mut ReconstructStats::default())
    }

    #[test]
    fn test_content_is_concatenated_in_arrival_order() {
        for n in 0..6 {
            let deltas: Vec<String> = (0..n).map(|i| format!("d{} ", i)).collect();
            let lines: Vec<Value> = deltas
                .iter()
                .enumerate()
                .map(|(i, d)| received(i as i64 + 1, text_chunk(d)))
                .collect();
            let record = rebuild(&group("r1", &lines));
            let expected = deltas.concat();
            if n == 0 {
                assert!(record.merged_response.is_none());
                assert_eq!(record.response_content, "");
            } else {
                let message = record.merged_response.as_ref().and_then(|r| r.first_message());
                assert_eq!(message.and_then(|m| m.content.clone()), Some(expected.clone()));
                assert_eq!(record.response_content, expected);
            }
        }
    }

    #[test]
    fn test_mistyped_chunk_fields_keep_the_rest_of_the_fragment() {
        let lines = vec![
            received(1, text_chunk("Hi")),
            received(
                2,
                json!({"id": "chatcmpl-1", "created": 1700000000.5, "choices": [{"delta": {"content": " there"}}]}),
            ),
            received(
                3,
                json!({
                    "id": "chatcmpl-1",
                    "choices": [null, {"delta": {"content": "!"}, "finish_reason": "stop"}],
                    "usage": {"prompt_tokens": 10, "completion_tokens": 2.0, "total_tokens": 12}
                }),
            ),
        ];
        let mut stats = ReconstructStats::default();
        let record = reconstruct_group(&group("r1", &lines), &mut stats);

        assert_eq!(stats.skipped_fragments, 0);
        assert_eq!(record.response_content, "Hi there!");
        let merged = record.merged_response.as_ref().unwrap();
        assert_eq!(merged.created, 1700000000);
        assert_eq!(merged.choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(merged.usage.as_ref().map(|u| u.completion_tokens), Some(2));
        assert_eq!(record.usage.as_ref().map(|u| u.total_tokens), Some(12));
    }

    #[test]
    fn test_tool_call_arguments_merge_by_index_across_interleaving() {
        let lines = vec![
            received(1, json!({"id": "c", "choices": [{"delta": {"role": "assistant", "tool_calls": [
                {"index": 1, "id": "call_b", "type": "function", "function": {"name": "grep", "arguments": "{\"q\":"}}
            ]}}]})),
            received(2, json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "id": "call_a", "type": "function", "function": {"name": "read_file", "arguments": "{\"path\""}}
            ]}}]})),
            received(3, json!({"choices": [{"delta": {"tool_calls": [
                {"index": 1, "function": {"arguments": "\"foo\"}"}},
                {"index": 0, "function": {"arguments": ":\"/tmp\"}"}}
            ]}}]})),
            received(4, json!({"choices": [{"delta": {}, "finish_reason": "tool_calls"}]})),
        ];

        let record = rebuild(&group("r1", &lines));
        let response = record.merged_response.expect("response");
        let message = &response.choices[0].message;
        assert!(message.content.is_none());
        assert_eq!(response.choices[0].finish_reason.as_deref(), Some("tool_calls"));

        let calls = message.tool_calls.as_ref().expect("tool calls");
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id.as_deref(), Some("call_a"));
        assert_eq!(calls[0].function.name.as_deref(), Some("read_file"));
        assert_eq!(calls[0].function.arguments, "{\"path\":\"/tmp\"}");
        assert_eq!(calls[1].id.as_deref(), Some("call_b"));
        assert_eq!(calls[1].function.arguments, "{\"q\":\"foo\"}");
        assert_eq!(record.response_content, "");
    }

    #[test]
    fn test_non_contiguous_indices_are_kept_and_sorted() {
        let lines = vec![
            received(1, json!({"choices": [{"delta": {"tool_calls": [{"index": 7, "function": {"name": "late", "arguments": "{}"}}]}}]})),
            received(2, json!({"choices": [{"delta": {"tool_calls": [{"function": {"name": "defaulted", "arguments": "{}"}}]}}]})),
            received(3, json!({"choices": [{"delta": {"tool_calls": [{"index": 3, "function": {"name": "middle", "arguments": "{}"}}]}}]})),
        ];
        let record = rebuild(&group("r1", &lines));
        let response = record.merged_response.expect("response");
        let names: Vec<_> = response.choices[0]
            .message
            .tool_calls
            .as_ref()
            .expect("tool calls")
            .iter()
            .filter_map(|c| c.function.name.clone())
            .collect();
        assert_eq!(names, vec!["defaulted", "middle", "late"]);
        assert_eq!(response.id, UNKNOWN_SENTINEL);
        assert_eq!(response.model, UNKNOWN_SENTINEL);
    }

    #[test]
    fn test_response_is_null_without_id_text_or_tools() {
        // no fragments at all
        let record = rebuild(&group("r1", &[json!({"time": 1, "reqId": "r1", "msg": "incoming request", "req": {"method": "GET", "url": "/x"}})]));
        assert!(record.merged_response.is_none());
        assert!(record.usage.is_none());
        assert!(record.response_chunks.is_empty());

        // fragments that only carry usage / empty deltas
        let record = rebuild(&group(
            "r1",
            &[
                received(1, json!({"choices": [{"delta": {"role": "assistant", "content": ""}}]})),
                received(2, json!({"choices": [], "usage": {"prompt_tokens": 1, "completion_tokens": 0, "total_tokens": 1}})),
            ],
        ));
        assert!(record.merged_response.is_none());
        assert!(record.usage.is_none());
        assert_eq!(record.response_chunks.len(), 2);
    }

    #[test]
    fn test_id_alone_keeps_response_with_null_content() {
        let record = rebuild(&group("r1", &[received(5_000, json!({"id": "chatcmpl-9", "choices": []}))]));
        let response = record.merged_response.expect("response");
        assert_eq!(response.id, "chatcmpl-9");
        assert_eq!(response.created, 5);
        assert!(response.choices[0].message.content.is_none());
        assert_eq!(response.choices[0].message.role, "assistant");
    }

    #[test]
    fn test_first_wins_metadata_and_last_wins_role_finish_usage() {
        let lines = vec![
            received(10, json!({"id": "first", "created": 111, "model": "m-a", "choices": [{"delta": {"role": "system", "content": "a"}}]})),
            received(11, json!({"id": "second", "created": 222, "model": "m-b", "choices": [{"delta": {"role": "assistant", "content": "b"}, "finish_reason": "length"}],
                "usage": {"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2}})),
            received(12, json!({"choices": [{"delta": {}, "finish_reason": "stop"}],
                "usage": {"prompt_tokens": 10, "completion_tokens": 2, "total_tokens": 12, "prompt_tokens_details": {"cached_tokens": 4}}})),
        ];
        let record = rebuild(&group("r1", &lines));
        let response = record.merged_response.clone().expect("response");
        assert_eq!(response.id, "first");
        assert_eq!(response.created, 111);
        assert_eq!(response.model, "m-a");
        assert_eq!(response.choices[0].message.role, "assistant");
        assert_eq!(response.choices[0].finish_reason.as_deref(), Some("stop"));

        let usage = response.usage.expect("usage");
        assert_eq!(usage.total_tokens, 12);
        assert_eq!(usage.prompt_tokens_details.map(|d| d.cached_tokens), Some(4));
        assert_eq!(
            record.usage,
            Some(LegacyUsage {
                input_tokens: 10,
                output_tokens: 2,
                total_tokens: 12,
                cache_read_input_tokens: 4,
            })
        );
    }

    #[test]
    fn test_bad_and_empty_fragments_are_skipped_and_counted() {
        let lines = vec![
            json!({"time": 1, "reqId": "r1", "type": "recieved data", "data": "data: {not json"}),
            json!({"time": 2, "reqId": "r1", "type": "recieved data"}),
            received(3, text_chunk("ok")),
            json!({"time": 4, "reqId": "r1", "type": "recieved data", "data": "", "response": text_chunk("!")}),
            json!({"time": 5, "reqId": "r1", "type": "send data", "data": text_chunk("ignored").to_string()}),
        ];
        let mut stats = ReconstructStats::default();
        let record = reconstruct_group(&group("r1", &lines), &mut stats);
        assert_eq!(record.response_content, "ok!");
        assert_eq!(stats.skipped_fragments, 2);
        assert_eq!(record.response_chunks.len(), 4);
    }

    #[test]
    fn test_lifecycle_fields_resolution() {
        let lines = vec![
            json!({"time": 0, "reqId": "r1", "msg": "noise"}),
            json!({"time": 1700000000123i64, "reqId": "r1", "msg": "incoming request", "req": {"method": "POST", "url": "/v1/chat/completions"}}),
            json!({"time": 1700000000124i64, "reqId": "r1", "msg": "incoming request", "req": {"method": "GET", "url": "/other"}}),
            json!({"time": 1700000000125i64, "reqId": "r1", "type": "request body", "data": {"model": "m1", "messages": []}}),
            json!({"time": 1700000000126i64, "reqId": "r1", "type": "request body", "data": {"model": "m2"}}),
            json!({"time": 1700000000127i64, "reqId": "r1", "msg": "final request", "requestUrl": "https://upstream/v1/chat/completions",
                "headers": {"authorization": "Bearer x"}, "request": {"body": "{\"model\":\"m1\"}"}}),
            json!({"time": 1700000000128i64, "reqId": "r1", "msg": "final request", "requestUrl": "https://other"}),
            json!({"time": 1700000000129i64, "reqId": "r1", "msg": "request completed", "res": {"statusCode": 500}, "responseTime": 1.0}),
            json!({"time": 1700000000130i64, "reqId": "r1", "msg": "request completed", "res": {"statusCode": 201}, "responseTime": 42.5}),
        ];
        let mut stats = ReconstructStats::default();
        let record = reconstruct_group(&group("r1", &lines), &mut stats);

        assert_eq!(record.method, "POST");
        assert_eq!(record.url, "/v1/chat/completions");
        assert_eq!(record.model, "m1");
        assert_eq!(record.request_body["model"], "m1");
        assert_eq!(record.timestamp, 1700000000123);
        assert_eq!(record.status_code, 201);
        assert_eq!(record.response_time, 42.5);
        let final_request = record.final_request.as_ref().expect("final request");
        assert_eq!(final_request.url.as_deref(), Some("https://upstream/v1/chat/completions"));
        assert_eq!(final_request.body, json!("{\"model\":\"m1\"}"));
        assert_eq!(record.request_headers["authorization"], "Bearer x");
        assert_eq!(stats.duplicate_events, 3);
    }

    #[test]
    fn test_defaults_when_group_has_no_lifecycle_events() {
        let record = rebuild(&group("r1", &[json!({"reqId": "r1", "msg": "final request"})]));
        assert_eq!(record.method, DEFAULT_METHOD);
        assert_eq!(record.url, DEFAULT_URL);
        assert_eq!(record.model, UNKNOWN_SENTINEL);
        assert_eq!(record.status_code, DEFAULT_STATUS_CODE);
        assert_eq!(record.response_time, 0.0);
        assert_eq!(record.timestamp, 0);
        assert!(record.request_body.is_null());
        let final_request = record.final_request.expect("final request");
        assert!(final_request.headers.is_empty());
        assert!(final_request.body.is_null());
    }

    #[test]
    fn test_reconstruction_is_idempotent() {
        let lines = vec![
            json!({"time": 1000, "reqId": "r1", "type": "request body", "data": {"model": "m1"}}),
            received(1001, json!({"choices": [{"delta": {"content": "no id here"}}]})),
        ];
        let g = group("r1", &lines);
        let a = serde_json::to_string(&rebuild(&g)).unwrap();
        let b = serde_json::to_string(&rebuild(&g)).unwrap();
        assert_eq!(a, b);
    }
}
