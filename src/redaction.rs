use serde_json::{Map, Value};

const REDACTED: &str = "[REDACTED]";

fn is_secret_header(name: &str) -> bool {
    let lower = name.to_lowercase();
    lower == "authorization"
        || lower == "proxy-authorization"
        || lower == "cookie"
        || lower == "set-cookie"
        || lower.contains("api-key")
        || lower.contains("api_key")
        || lower.contains("secret")
        || lower.contains("token")
}

pub fn redact_headers(headers: &mut Map<String, Value>) {
    for (name, value) in headers.iter_mut() {
        if is_secret_header(name) {
            *value = Value::String(REDACTED.to_string());
        }
    }
}

/// Mask credentials in a serialized record before it leaves the process.
/// Only header maps are touched; bodies and usage fields are left as logged.
pub fn redact_record(record: &mut Value) {
    if let Some(headers) = record.get_mut("requestHeaders").and_then(|h| h.as_object_mut()) {
        redact_headers(headers);
    }
    if let Some(headers) = record
        .get_mut("finalRequest")
        .and_then(|f| f.get_mut("headers"))
        .and_then(|h| h.as_object_mut())
    {
        redact_headers(headers);
    }
}
