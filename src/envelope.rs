//! Sentry envelope framing.
//!
//! An envelope is a newline-delimited container:
//!
//! ```text
//! {"event_id":"...","dsn":"...","sent_at":"..."}\n
//! {"type":"event","length":1234}\n
//! <payload bytes>\n
//! {"type":"attachment","length":5678}\n
//! <attachment bytes>
//! ```
//!
//! Item payloads are opaque. When the item header carries a `length` field the
//! payload is exactly that many bytes (and may contain newlines); otherwise the
//! payload runs to the next newline. Decoding is best-effort and never fails:
//! malformed lines are skipped and whatever could be recovered is returned.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Metadata from the first envelope line. All fields are optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvelopeHeader {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dsn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdk: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<Value>,
}

/// One item in an envelope: a header and its raw payload bytes.
#[derive(Debug, Clone)]
pub struct EnvelopeItem {
    pub item_type: String,
    pub headers: Value,
    pub payload: Vec<u8>,
}

/// A decoded envelope.
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    pub header: EnvelopeHeader,
    pub items: Vec<EnvelopeItem>,
    /// True when the first line was present but not valid JSON.
    pub malformed_header: bool,
}

impl Envelope {
    /// Payloads of `event` and `transaction` items, in wire order.
    pub fn events(&self) -> Vec<&[u8]> {
        self.items
            .iter()
            .filter(|i| i.item_type == "event" || i.item_type == "transaction")
            .map(|i| i.payload.as_slice())
            .collect()
    }

    /// Payloads of `session` items.
    pub fn sessions(&self) -> Vec<&[u8]> {
        self.items
            .iter()
            .filter(|i| i.item_type == "session")
            .map(|i| i.payload.as_slice())
            .collect()
    }
}

/// Decode an envelope from raw request bytes.
///
/// Works on the byte buffer with an explicit cursor so that `length`-framed
/// payloads containing newlines stay intact.
pub fn decode(body: &[u8]) -> Envelope {
    let mut envelope = Envelope::default();
    if body.is_empty() {
        return envelope;
    }

    let mut cursor = 0usize;

    // Envelope header: everything up to the first newline.
    let header_line = take_line(body, &mut cursor);
    if !trim_bytes(header_line).is_empty() {
        match serde_json::from_slice::<EnvelopeHeader>(header_line) {
            Ok(header) => envelope.header = header,
            Err(e) => {
                warn!(error = %e, "failed to parse envelope header");
                envelope.malformed_header = true;
            }
        }
    }

    // Items: header line, then payload.
    while cursor < body.len() {
        let line = take_line(body, &mut cursor);
        if trim_bytes(line).is_empty() {
            continue;
        }

        let item_header: Value = match serde_json::from_slice(line) {
            Ok(v) => v,
            Err(_) => {
                // Not an item header; skip this line and resync.
                continue;
            }
        };

        let payload = match item_header.get("length").and_then(Value::as_u64) {
            Some(length) => {
                // Exactly `length` bytes, clamped to the remaining input.
                let length = length as usize;
                let end = cursor.saturating_add(length).min(body.len());
                let payload = body[cursor..end].to_vec();
                cursor = end;
                // Consume the newline terminating the payload, if present.
                if body.get(cursor) == Some(&b'\n') {
                    cursor += 1;
                }
                payload
            }
            None => take_line(body, &mut cursor).to_vec(),
        };

        let item_type = item_header
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();

        envelope.items.push(EnvelopeItem {
            item_type,
            headers: item_header,
            payload,
        });
    }

    envelope
}

/// Serialize a header and items back into the wire framing. Items are written
/// with an explicit `length` so binary payloads survive round-trips.
pub fn encode(header: &EnvelopeHeader, items: &[(Value, &[u8])]) -> Vec<u8> {
    let mut out = serde_json::to_vec(header).unwrap_or_else(|_| b"{}".to_vec());
    out.push(b'\n');
    for (item_header, payload) in items {
        let mut item_header = item_header.clone();
        if let Some(obj) = item_header.as_object_mut() {
            obj.insert("length".to_string(), Value::from(payload.len()));
        }
        out.extend_from_slice(&serde_json::to_vec(&item_header).unwrap_or_else(|_| b"{}".to_vec()));
        out.push(b'\n');
        out.extend_from_slice(payload);
        out.push(b'\n');
    }
    out
}

/// Advance the cursor past the next newline, returning the line without it.
fn take_line<'a>(body: &'a [u8], cursor: &mut usize) -> &'a [u8] {
    let start = *cursor;
    match body[start..].iter().position(|&b| b == b'\n') {
        Some(offset) => {
            *cursor = start + offset + 1;
            &body[start..start + offset]
        }
        None => {
            *cursor = body.len();
            &body[start..]
        }
    }
}

fn trim_bytes(line: &[u8]) -> &[u8] {
    let start = line.iter().position(|b| !b.is_ascii_whitespace());
    let end = line.iter().rposition(|b| !b.is_ascii_whitespace());
    match (start, end) {
        (Some(s), Some(e)) => &line[s..=e],
        _ => &[],
    }
}
