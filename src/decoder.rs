//! Line Decoder
//!
//! Turns newline-delimited pino output from the proxy into typed [`EventRecord`]s.
//! The kind of each line is decided here, once, from its `msg`/`type` tags so the
//! reconstruction code never has to probe for field presence again.

use crate::constants::{
    DIAGNOSTIC_SAMPLE_CHARS, MAX_DIAGNOSTIC_SAMPLES, MAX_LINE_BYTES, MSG_FINAL_REQUEST,
    MSG_INCOMING_REQUEST, MSG_REQUEST_COMPLETED, TYPE_RECEIVED_DATA, TYPE_REQUEST_BODY,
    TYPE_SENT_DATA,
};
use bytes::BytesMut;
use futures_util::StreamExt;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio_util::codec::{Decoder, FramedRead, LinesCodec, LinesCodecError};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("line is not a JSON object")]
    NotAnObject,
    #[error("line too long (max_line_bytes={0})")]
    LineTooLong(usize),
    #[error("invalid UTF-8")]
    InvalidUtf8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FragmentDirection {
    Received,
    Sent,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct InboundRequest {
    pub method: Option<String>,
    pub url: Option<String>,
    pub host: Option<String>,
    pub remote_address: Option<String>,
    pub remote_port: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ForwardedRequest {
    pub url: Option<String>,
    pub headers: Option<Map<String, Value>>,
    pub body: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub direction: FragmentDirection,
    /// `data` as logged: usually a JSON string, sometimes an already-parsed object
    pub data: Option<Value>,
    /// Older producers logged the chunk under `response` instead
    pub response: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    Inbound(InboundRequest),
    RequestBody(Value),
    Forwarded(ForwardedRequest),
    Fragment(Fragment),
    Completion {
        status_code: Option<u16>,
        response_time: Option<f64>,
    },
    Unrecognized,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub line_number: usize,
    /// Epoch milliseconds; 0 when the line carried no usable `time`
    pub time: i64,
    pub level: Option<u64>,
    pub req_id: Option<String>,
    pub hostname: Option<String>,
    pub pid: Option<u64>,
    pub msg: Option<String>,
    pub kind: EventKind,
    pub raw: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecodeDiagnostics {
    pub total_lines: usize,
    pub blank_lines: usize,
    pub skipped_lines: usize,
    pub samples: Vec<String>,
}

impl DecodeDiagnostics {
    fn record_failure(&mut self, line_number: usize, line: &str, err: &DecodeError) {
        self.skipped_lines += 1;
        let snippet = crate::str_utils::prefix_chars(line, DIAGNOSTIC_SAMPLE_CHARS);
        tracing::warn!(line = line_number, "Failed to parse log line ({}): {}", err, snippet);
        if self.samples.len() < MAX_DIAGNOSTIC_SAMPLES {
            self.samples.push(format!("line {}: {}", line_number, snippet));
        }
    }
}

fn str_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(|v| v.as_str()).map(|s| s.to_string())
}

fn present(obj: &Map<String, Value>, key: &str) -> Option<Value> {
    match obj.get(key) {
        None | Some(Value::Null) => None,
        Some(v) => Some(v.clone()),
    }
}

fn classify(obj: &Map<String, Value>) -> EventKind {
    let msg = obj.get("msg").and_then(|v| v.as_str());
    let data_type = obj.get("type").and_then(|v| v.as_str());

    if msg == Some(MSG_INCOMING_REQUEST) {
        if let Some(req) = obj.get("req").and_then(|r| r.as_object()) {
            return EventKind::Inbound(InboundRequest {
                method: str_field(req, "method"),
                url: str_field(req, "url"),
                host: str_field(req, "host"),
                remote_address: str_field(req, "remoteAddress"),
                remote_port: req.get("remotePort").and_then(|p| p.as_u64()),
            });
        }
    }

    if data_type == Some(TYPE_REQUEST_BODY) {
        if let Some(data) = present(obj, "data") {
            return EventKind::RequestBody(data);
        }
    }

    if msg == Some(MSG_FINAL_REQUEST) {
        return EventKind::Forwarded(ForwardedRequest {
            url: str_field(obj, "requestUrl"),
            headers: obj.get("headers").and_then(|h| h.as_object()).cloned(),
            body: obj
                .get("request")
                .and_then(|r| r.get("body"))
                .filter(|b| !b.is_null())
                .cloned(),
        });
    }

    if let Some(t) = data_type {
        let direction = if TYPE_RECEIVED_DATA.contains(&t) {
            Some(FragmentDirection::Received)
        } else if TYPE_SENT_DATA.contains(&t) {
            Some(FragmentDirection::Sent)
        } else {
            None
        };
        if let Some(direction) = direction {
            return EventKind::Fragment(Fragment {
                direction,
                data: present(obj, "data"),
                response: present(obj, "response"),
            });
        }
    }

    if msg == Some(MSG_REQUEST_COMPLETED) {
        return EventKind::Completion {
            status_code: obj
                .get("res")
                .and_then(|r| r.get("statusCode"))
                .and_then(|s| s.as_u64())
                .and_then(|s| u16::try_from(s).ok()),
            response_time: obj.get("responseTime").and_then(|t| t.as_f64()),
        };
    }

    EventKind::Unrecognized
}

/// Decode a single non-blank line. Fields that are absent stay absent.
pub fn decode_line(line_number: usize, line: &str) -> Result<EventRecord, DecodeError> {
    let raw: Value = serde_json::from_str(line)?;
    let obj = raw.as_object().ok_or(DecodeError::NotAnObject)?;

    let time = match obj.get("time") {
        Some(t) => t.as_i64().or_else(|| t.as_f64().map(|f| f as i64)).unwrap_or(0),
        None => 0,
    };

    let level = obj.get("level").and_then(|l| l.as_u64());
    let req_id = str_field(obj, "reqId");
    let hostname = str_field(obj, "hostname");
    let pid = obj.get("pid").and_then(|p| p.as_u64());
    let msg = str_field(obj, "msg");
    let kind = classify(obj);

    Ok(EventRecord {
        line_number,
        time,
        level,
        req_id,
        hostname,
        pid,
        msg,
        kind,
        raw,
    })
}

/// Lazy decoder over an in-memory log. Consumed once; diagnostics are read
/// after iteration finishes.
pub struct LineDecoder<'a> {
    lines: std::iter::Enumerate<std::str::Lines<'a>>,
    diagnostics: DecodeDiagnostics,
}

impl<'a> LineDecoder<'a> {
    pub fn new(content: &'a str) -> Self {
        Self {
            lines: content.lines().enumerate(),
            diagnostics: DecodeDiagnostics::default(),
        }
    }

    pub fn diagnostics(&self) -> &DecodeDiagnostics {
        &self.diagnostics
    }

    pub fn into_diagnostics(self) -> DecodeDiagnostics {
        self.diagnostics
    }
}

impl<'a> Iterator for LineDecoder<'a> {
    type Item = EventRecord;

    fn next(&mut self) -> Option<EventRecord> {
        for (idx, line) in self.lines.by_ref() {
            let line_number = idx + 1;
            self.diagnostics.total_lines += 1;
            if line.trim().is_empty() {
                self.diagnostics.blank_lines += 1;
                continue;
            }
            match decode_line(line_number, line) {
                Ok(record) => return Some(record),
                Err(e) => self.diagnostics.record_failure(line_number, line, &e),
            }
        }
        None
    }
}

/// One framed line from an async source.
#[derive(Debug)]
pub enum RawLine {
    Text(String),
    Oversized,
    InvalidUtf8,
}

/// `LinesCodec` stops the stream on its first error. This wrapper turns the
/// per-line failures (too long, bad UTF-8) into items so decoding carries on.
pub struct LogLineCodec {
    inner: LinesCodec,
}

impl LogLineCodec {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(max_line_bytes),
        }
    }

    fn map(
        result: Result<Option<String>, LinesCodecError>,
    ) -> Result<Option<RawLine>, LinesCodecError> {
        match result {
            Ok(Some(line)) => Ok(Some(RawLine::Text(line))),
            Ok(None) => Ok(None),
            Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(RawLine::Oversized)),
            Err(LinesCodecError::Io(e)) if e.kind() == std::io::ErrorKind::InvalidData => {
                Ok(Some(RawLine::InvalidUtf8))
            }
            Err(e) => Err(e),
        }
    }
}

impl Decoder for LogLineCodec {
    type Item = RawLine;
    type Error = LinesCodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<RawLine>, LinesCodecError> {
        Self::map(self.inner.decode(buf))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<RawLine>, LinesCodecError> {
        Self::map(self.inner.decode_eof(buf))
    }
}

/// Decode from any async reader (a log file, a request body stream).
/// An I/O error ends decoding early; everything read before it is kept.
pub async fn decode_reader<R>(reader: R) -> (Vec<EventRecord>, DecodeDiagnostics)
where
    R: AsyncRead + Unpin,
{
    let mut lines = FramedRead::new(reader, LogLineCodec::new(MAX_LINE_BYTES));
    let mut records = Vec::new();
    let mut diagnostics = DecodeDiagnostics::default();
    let mut line_number = 0;

    while let Some(item) = lines.next().await {
        line_number += 1;
        diagnostics.total_lines += 1;
        let line = match item {
            Ok(RawLine::Text(line)) => line,
            Ok(RawLine::Oversized) => {
                diagnostics.record_failure(line_number, "", &DecodeError::LineTooLong(MAX_LINE_BYTES));
                continue;
            }
            Ok(RawLine::InvalidUtf8) => {
                diagnostics.record_failure(line_number, "", &DecodeError::InvalidUtf8);
                continue;
            }
            Err(e) => {
                tracing::error!("Log read aborted at line {}: {}", line_number, e);
                break;
            }
        };
        if line.trim().is_empty() {
            diagnostics.blank_lines += 1;
            continue;
        }
        match decode_line(line_number, &line) {
            Ok(record) => records.push(record),
            Err(e) => diagnostics.record_failure(line_number, &line, &e),
        }
    }

    (records, diagnostics)
}
