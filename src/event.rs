//! Raw event model and tolerant JSON decoding.
//!
//! SDK payloads are heterogeneous and sparsely populated, so every field is
//! optional and unknown top-level keys are kept in a catch-all bucket. Decoding
//! never fails: empty or unparseable input yields an empty event (level
//! `error`) so one broken payload can't take down a whole envelope.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::error;

fn default_level() -> String {
    "error".to_string()
}

/// Timestamp as transmitted: seconds, milliseconds, or an ISO-8601 string.
/// Normalization happens during transformation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawTimestamp {
    Number(f64),
    Text(String),
}

/// User context attached to an event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// HTTP request context attached to an event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_string: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Map<String, Value>>,
}

/// `logentry` payload: a message with optional positional parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Vec<Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A single frame of a stacktrace.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Frame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lineno: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_line: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Stacktrace {
    #[serde(default)]
    pub frames: Vec<Frame>,
}

/// One exception record out of `exception.values`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExceptionRecord {
    #[serde(rename = "type", default = "default_exception_type")]
    pub kind: String,
    #[serde(default)]
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stacktrace: Option<Stacktrace>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mechanism: Option<Value>,
}

fn default_exception_type() -> String {
    "Error".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExceptionList {
    #[serde(default)]
    pub values: Vec<ExceptionRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SdkInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The decoded JSON body of an event or transaction item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    // Identifiers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<RawTimestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logger: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dist: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,

    // Message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logentry: Option<LogEntry>,

    // Exception
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<ExceptionList>,

    // Context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<RequestContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contexts: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<Vec<String>>,

    // Breadcrumbs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breadcrumbs: Option<Value>,

    // SDK info
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdk: Option<SdkInfo>,

    // Modules/packages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modules: Option<Value>,

    /// Everything the schema doesn't know about, kept for debugging.
    #[serde(flatten)]
    pub unknown: Map<String, Value>,
}

impl Default for RawEvent {
    fn default() -> Self {
        Self {
            event_id: None,
            timestamp: None,
            platform: None,
            level: default_level(),
            logger: None,
            transaction: None,
            server_name: None,
            release: None,
            dist: None,
            environment: None,
            message: None,
            logentry: None,
            exception: None,
            user: None,
            request: None,
            contexts: None,
            tags: None,
            extra: None,
            fingerprint: None,
            breadcrumbs: None,
            sdk: None,
            modules: None,
            unknown: Map::new(),
        }
    }
}

impl RawEvent {
    /// The first exception record, if any.
    pub fn first_exception(&self) -> Option<&ExceptionRecord> {
        self.exception.as_ref().and_then(|e| e.values.first())
    }

    /// Case-insensitive lookup of the User-Agent request header.
    pub fn user_agent(&self) -> Option<&str> {
        let headers = self.request.as_ref()?.headers.as_ref()?;
        headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("user-agent"))
            .and_then(|(_, v)| v.as_str())
    }

    /// Client IP from the user context, falling back to `request.env.REMOTE_ADDR`.
    pub fn client_ip(&self) -> Option<&str> {
        if let Some(ip) = self.user.as_ref().and_then(|u| u.ip_address.as_deref()) {
            if !ip.is_empty() {
                return Some(ip);
            }
        }
        self.request
            .as_ref()
            .and_then(|r| r.env.as_ref())
            .and_then(|env| env.get("REMOTE_ADDR"))
            .and_then(Value::as_str)
    }
}

/// Decode an event payload. Never fails: malformed input yields an empty event.
pub fn decode(payload: &[u8]) -> RawEvent {
    if payload.iter().all(|b| b.is_ascii_whitespace()) {
        return RawEvent::default();
    }

    match serde_json::from_slice::<RawEvent>(payload) {
        Ok(event) => event,
        Err(e) => {
            error!(error = %e, "failed to parse event payload");
            RawEvent::default()
        }
    }
}
