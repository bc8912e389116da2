/// `msg` values the proxy logger emits for lifecycle events
pub const MSG_INCOMING_REQUEST: &str = "incoming request";
pub const MSG_FINAL_REQUEST: &str = "final request";
pub const MSG_REQUEST_COMPLETED: &str = "request completed";

/// `type` values tagging payload-carrying events.
/// The producer spells the received tag "recieved"; both spellings are accepted.
pub const TYPE_REQUEST_BODY: &str = "request body";
pub const TYPE_RECEIVED_DATA: &[&str] = &["recieved data", "received data"];
pub const TYPE_SENT_DATA: &[&str] = &["send data", "sent data"];

/// Fallbacks used when a request group never carried the field
pub const DEFAULT_METHOD: &str = "POST";
pub const DEFAULT_URL: &str = "/v1/messages";
pub const DEFAULT_STATUS_CODE: u16 = 200;
pub const UNKNOWN_SENTINEL: &str = "unknown";
pub const DEFAULT_ROLE: &str = "assistant";
pub const CHAT_COMPLETION_OBJECT: &str = "chat.completion";

/// System-prompt phrases used by internal summarization / topic-detection calls
pub const SUMMARIZATION_MARKERS: &[&str] = &[
    "Summarize this coding conversation",
    "Analyze if this message indicates a new conversation topic",
];

/// Decoder limits
pub const MAX_LINE_BYTES: usize = 1024 * 1024;
pub const MAX_DIAGNOSTIC_SAMPLES: usize = 5;
pub const DIAGNOSTIC_SAMPLE_CHARS: usize = 100;

/// Session store defaults
pub const DEFAULT_SESSION_TTL_SECS: u64 = 60 * 60;
pub const DEFAULT_MAX_SESSIONS: usize = 64;
