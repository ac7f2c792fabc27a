//! Normalization of raw SDK events into indexable documents.
//!
//! The transformer is a pure mapping: no I/O, and deterministic apart from
//! `received_at` and the id generated when the source did not send one.
//! Missing or ill-typed optional fields degrade to omission, never to an
//! error.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::event::{RawEvent, RawTimestamp};

/// RFC 3339 with a numeric offset (`+00:00`), fractional seconds only when
/// present.
pub(crate) mod rfc3339 {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&dt.to_rfc3339_opts(SecondsFormat::AutoSi, false))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let s = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocUser {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

impl DocUser {
    fn is_empty(&self) -> bool {
        self.id.is_none() && self.email_hash.is_none() && self.username.is_none() && self.ip.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoPoint>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NameVersion {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl NameVersion {
    fn is_empty(&self) -> bool {
        self.name.is_none() && self.version.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brand: Option<String>,
}

impl DeviceInfo {
    fn is_empty(&self) -> bool {
        self.family.is_none() && self.model.is_none() && self.brand.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

impl DocRequest {
    fn is_empty(&self) -> bool {
        self.url.is_none() && self.method.is_none()
    }
}

/// The canonical document written to the search index. Empty optional fields
/// disappear from the serialized JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedDocument {
    #[serde(rename = "@timestamp", with = "rfc3339")]
    pub timestamp: DateTime<Utc>,
    #[serde(with = "rfc3339")]
    pub received_at: DateTime<Utc>,
    pub event_id: String,
    pub project_id: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logger: Option<String>,

    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stacktrace: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<DocUser>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo: Option<GeoInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser: Option<NameVersion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<NameVersion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<NameVersion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<DocRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdk: Option<NameVersion>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fingerprint: Vec<String>,
}

/// Maps a [`RawEvent`] to an [`IndexedDocument`].
#[derive(Debug, Clone, Default)]
pub struct Transformer;

impl Transformer {
    pub fn new() -> Self {
        Self
    }

    pub fn transform(&self, event: &RawEvent, project_id: u64) -> IndexedDocument {
        let timestamp = normalize_timestamp(event.timestamp.as_ref());
        let event_id = event
            .event_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());

        IndexedDocument {
            timestamp,
            received_at: Utc::now(),
            event_id,
            project_id,
            level: non_empty(Some(event.level.clone())).or_else(|| Some("error".to_string())),
            platform: non_empty(event.platform.clone()),
            environment: non_empty(event.environment.clone()).or_else(|| Some("production".to_string())),
            release: non_empty(event.release.clone()),
            transaction: non_empty(event.transaction.clone()),
            server_name: non_empty(event.server_name.clone()),
            logger: non_empty(event.logger.clone()),
            message: extract_message(event),
            exception_type: event.first_exception().map(|e| e.kind.clone()),
            exception_value: event
                .first_exception()
                .map(|e| e.value.clone())
                .and_then(|v| non_empty(Some(v))),
            stacktrace: extract_stacktrace(event),
            user: transform_user(event),
            geo: None,
            browser: context_name_version(event, "browser"),
            os: context_name_version(event, "os"),
            device: context_device(event),
            runtime: context_name_version(event, "runtime"),
            request: transform_request(event),
            sdk: transform_sdk(event),
            tags: transform_tags(event),
            fingerprint: compute_fingerprint(event),
        }
    }
}

/// Timestamp coercion: numbers above 10^12 are milliseconds, otherwise
/// seconds; strings are ISO-8601 (`Z` accepted as `+00:00`); anything else
/// falls back to now.
fn normalize_timestamp(ts: Option<&RawTimestamp>) -> DateTime<Utc> {
    match ts {
        None => Utc::now(),
        Some(RawTimestamp::Number(n)) => {
            if !n.is_finite() {
                return Utc::now();
            }
            let secs = if *n > 1e12 { *n / 1000.0 } else { *n };
            from_secs_f64(secs).unwrap_or_else(Utc::now)
        }
        Some(RawTimestamp::Text(s)) => parse_iso(s).unwrap_or_else(Utc::now),
    }
}

fn from_secs_f64(secs: f64) -> Option<DateTime<Utc>> {
    if secs < 0.0 {
        return DateTime::from_timestamp(secs as i64, 0);
    }
    let whole = secs.trunc() as i64;
    let nanos = ((secs - secs.trunc()) * 1e9).round().min(999_999_999.0) as u32;
    DateTime::from_timestamp(whole, nanos)
}

fn parse_iso(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    // Naive timestamps without an offset are taken as UTC.
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Message priority: exception > message > logentry, with a fixed fallback.
fn extract_message(event: &RawEvent) -> String {
    if let Some(exc) = event.first_exception() {
        if exc.value.is_empty() {
            return exc.kind.clone();
        }
        return format!("{}: {}", exc.kind, exc.value);
    }

    if let Some(message) = non_empty(event.message.clone()) {
        return message;
    }

    if let Some(logentry) = &event.logentry {
        let message = logentry.message.clone().unwrap_or_default();
        if let Some(params) = &logentry.params {
            if !params.is_empty() && message.contains("%s") {
                if let Some(formatted) = substitute_params(&message, params) {
                    return formatted;
                }
            }
        }
        if !message.is_empty() {
            return message;
        }
    }

    "No message".to_string()
}

/// Positional `%s` substitution. Fails (returns None) when the placeholder and
/// parameter counts do not line up, in which case the raw message is kept.
fn substitute_params(message: &str, params: &[Value]) -> Option<String> {
    let parts: Vec<&str> = message.split("%s").collect();
    if parts.len() - 1 != params.len() {
        return None;
    }

    let mut out = String::with_capacity(message.len());
    for (i, part) in parts.iter().enumerate() {
        out.push_str(part);
        if i < params.len() {
            match &params[i] {
                Value::String(s) => out.push_str(s),
                other => out.push_str(&other.to_string()),
            }
        }
    }
    Some(out)
}

/// Render the first exception's frames, innermost last. Each frame becomes
/// `  File "{filename}", line {lineno}, in {module.function}` plus an indented
/// context line when one is present.
fn extract_stacktrace(event: &RawEvent) -> Option<String> {
    let exc = event.first_exception()?;
    let frames = &exc.stacktrace.as_ref()?.frames;
    if frames.is_empty() {
        return None;
    }

    let mut lines = Vec::new();
    for frame in frames.iter().rev() {
        let filename = frame.filename.as_deref().unwrap_or("?");
        let lineno = frame
            .lineno
            .map(|n| n.to_string())
            .unwrap_or_else(|| "?".to_string());
        let function = frame.function.as_deref().unwrap_or("?");

        match frame.module.as_deref().filter(|m| !m.is_empty()) {
            Some(module) => lines.push(format!(
                "  File \"{filename}\", line {lineno}, in {module}.{function}"
            )),
            None => lines.push(format!("  File \"{filename}\", line {lineno}, in {function}")),
        }

        if let Some(context) = frame.context_line.as_deref() {
            lines.push(format!("    {}", context.trim()));
        }
    }

    Some(lines.join("\n"))
}

fn transform_user(event: &RawEvent) -> Option<DocUser> {
    let user = event.user.as_ref()?;
    let doc_user = DocUser {
        id: non_empty(user.id.clone()),
        email_hash: user
            .email
            .as_deref()
            .filter(|e| !e.is_empty())
            .map(hash_email),
        username: non_empty(user.username.clone()),
        ip: non_empty(user.ip_address.clone()),
    };
    (!doc_user.is_empty()).then_some(doc_user)
}

/// First 16 hex characters of SHA-256 over the lowercased email. The raw
/// address never reaches the document.
pub fn hash_email(email: &str) -> String {
    let digest = Sha256::digest(email.to_lowercase().as_bytes());
    hex::encode(digest)[..16].to_string()
}

fn context_str(event: &RawEvent, context: &str, field: &str) -> Option<String> {
    event
        .contexts
        .as_ref()?
        .get(context)?
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn context_name_version(event: &RawEvent, context: &str) -> Option<NameVersion> {
    let nv = NameVersion {
        name: context_str(event, context, "name"),
        version: context_str(event, context, "version"),
    };
    (!nv.is_empty()).then_some(nv)
}

fn context_device(event: &RawEvent) -> Option<DeviceInfo> {
    let device = DeviceInfo {
        family: context_str(event, "device", "family"),
        model: context_str(event, "device", "model"),
        brand: context_str(event, "device", "brand"),
    };
    (!device.is_empty()).then_some(device)
}

fn transform_request(event: &RawEvent) -> Option<DocRequest> {
    let request = event.request.as_ref()?;
    let doc = DocRequest {
        url: non_empty(request.url.clone()),
        method: non_empty(request.method.clone()),
    };
    (!doc.is_empty()).then_some(doc)
}

fn transform_sdk(event: &RawEvent) -> Option<NameVersion> {
    let sdk = event.sdk.as_ref()?;
    let nv = NameVersion {
        name: non_empty(sdk.name.clone()),
        version: non_empty(sdk.version.clone()),
    };
    (!nv.is_empty()).then_some(nv)
}

/// Tags pass through verbatim; non-string values are coerced to strings.
fn transform_tags(event: &RawEvent) -> BTreeMap<String, String> {
    let mut tags = BTreeMap::new();
    if let Some(source) = &event.tags {
        for (key, value) in source {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            tags.insert(key.clone(), rendered);
        }
    }
    tags
}

/// Grouping fingerprint: the source fingerprint when present, else
/// `[exception_type?, transaction || logger?, platform?]`, else the default
/// group marker.
fn compute_fingerprint(event: &RawEvent) -> Vec<String> {
    if let Some(fingerprint) = &event.fingerprint {
        if !fingerprint.is_empty() {
            return fingerprint.clone();
        }
    }

    let mut components = Vec::new();
    if let Some(exc) = event.first_exception() {
        if !exc.kind.is_empty() {
            components.push(exc.kind.clone());
        }
    }
    if let Some(transaction) = non_empty(event.transaction.clone()) {
        components.push(transaction);
    } else if let Some(logger) = non_empty(event.logger.clone()) {
        components.push(logger);
    }
    if let Some(platform) = non_empty(event.platform.clone()) {
        components.push(platform);
    }

    if components.is_empty() {
        vec!["{{ default }}".to_string()]
    } else {
        components
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}
