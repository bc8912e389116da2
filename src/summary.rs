use crate::constants::{SUMMARIZATION_MARKERS, UNKNOWN_SENTINEL};
use crate::reconstruct::ReconstructedRecord;
use crate::types::is_truthy;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Read-only view over a [`ReconstructedRecord`], recomputed on every request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RequestSummary {
    pub req_id: String,
    pub method: String,
    pub url: String,
    pub model: String,
    pub request_model: String,
    pub response_model: Option<String>,
    pub status_code: u16,
    pub response_time: f64,
    pub timestamp: i64,
    pub system_count: usize,
    pub message_count: usize,
    pub tool_count: usize,
    /// `None` means the log never reported usage; `Some(0)` means it reported zero.
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub is_summarization_request: bool,
    pub has_thinking: bool,
}

fn array_len(body: &Value, key: &str) -> usize {
    body.get(key).and_then(|v| v.as_array()).map(|a| a.len()).unwrap_or(0)
}

fn system_count(body: &Value) -> usize {
    match body.get("system") {
        Some(Value::Array(items)) => items.len(),
        Some(v) if is_truthy(v) => 1,
        _ => 0,
    }
}

fn contains_marker(text: &str) -> bool {
    SUMMARIZATION_MARKERS.iter().any(|m| text.contains(m))
}

/// Housekeeping calls (conversation summaries, topic-change checks) declare no
/// tools and carry one of the marker phrases in their system prompt.
pub fn is_summarization_request(body: &Value) -> bool {
    if array_len(body, "tools") > 0 {
        return false;
    }

    match body.get("system") {
        Some(Value::String(s)) => contains_marker(s),
        Some(Value::Array(items)) => items.iter().any(|item| match item {
            Value::String(s) => contains_marker(s),
            other => other
                .get("text")
                .and_then(|t| t.as_str())
                .map(contains_marker)
                .unwrap_or(false),
        }),
        _ => false,
    }
}

pub fn has_thinking(body: &Value) -> bool {
    ["thinking", "reasoning"]
        .iter()
        .any(|key| body.get(*key).map(is_truthy).unwrap_or(false))
}

pub fn summarize(record: &ReconstructedRecord) -> RequestSummary {
    let body = &record.request_body;
    let response_model = record.merged_response.as_ref().map(|r| r.model.clone());
    let request_model = if record.model.is_empty() {
        UNKNOWN_SENTINEL.to_string()
    } else {
        record.model.clone()
    };

    let response_usage = record.merged_response.as_ref().and_then(|r| r.usage.as_ref());
    let (input_tokens, output_tokens) = match (&record.usage, response_usage) {
        (Some(legacy), _) => (Some(legacy.input_tokens), Some(legacy.output_tokens)),
        (None, Some(usage)) => (Some(usage.prompt_tokens), Some(usage.completion_tokens)),
        (None, None) => (None, None),
    };

    RequestSummary {
        req_id: record.req_id.clone(),
        method: record.method.clone(),
        url: record.url.clone(),
        model: response_model.clone().unwrap_or_else(|| request_model.clone()),
        request_model,
        response_model,
        status_code: record.status_code,
        response_time: record.response_time,
        timestamp: record.timestamp,
        system_count: system_count(body),
        message_count: array_len(body, "messages"),
        tool_count: array_len(body, "tools"),
        input_tokens,
        output_tokens,
        is_summarization_request: is_summarization_request(body),
        has_thinking: has_thinking(body),
    }
}

/// Summaries ordered by timestamp; equal timestamps keep the input order.
pub fn summarize_all<'a, I>(records: I) -> Vec<RequestSummary>
where
    I: IntoIterator<Item = &'a ReconstructedRecord>,
{
    let mut summaries: Vec<RequestSummary> = records.into_iter().map(summarize).collect();
    summaries.sort_by_key(|s| s.timestamp);
    summaries
}
