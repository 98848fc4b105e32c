//! Neutral request variants for the supported protocols.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Convert a header name to title case (e.g., "content-type" -> "Content-Type").
///
/// Recorded requests expose title-cased header names regardless of how the
/// client spelled them; predicate key lookup stays case-insensitive.
pub fn header_to_title_case(name: &str) -> String {
    let mut title_case = String::with_capacity(name.len());
    for part in name.split_inclusive('-') {
        let mut chars = part.chars();
        if let Some(first_char) = chars.next() {
            title_case.push(first_char.to_ascii_uppercase());
        }
        title_case.push_str(chars.as_str());
    }
    title_case
}

/// Parse a query string into a multi-value map, URL-decoding keys and values.
/// A key that appears more than once maps to an array.
pub fn parse_query_string(query: &str) -> HashMap<String, Value> {
    let mut map: HashMap<String, Value> = HashMap::new();
    for pair in query.split('&').filter(|s| !s.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let key = urlencoding::decode(key).unwrap_or_default().into_owned();
        let value = urlencoding::decode(value).unwrap_or_default().into_owned();
        match map.get_mut(&key) {
            Some(Value::Array(values)) => values.push(Value::String(value)),
            Some(existing) => {
                let first = existing.clone();
                *existing = Value::Array(vec![first, Value::String(value)]);
            }
            None => {
                map.insert(key, Value::String(value));
            }
        }
    }
    map
}

/// HTTP(S) request in neutral form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequest {
    pub request_from: String,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub query: HashMap<String, Value>,
    #[serde(default)]
    pub headers: HashMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default)]
    pub timestamp: String,
}

/// TCP request in neutral form. `data` holds raw text in text mode and the
/// base64 encoding of the received bytes in binary mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TcpRequest {
    pub request_from: String,
    pub data: String,
    #[serde(default)]
    pub timestamp: String,
}

/// SMTP request in neutral form. The collection fields always serialize,
/// so an absent list appears as `[]` rather than null.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmtpRequest {
    pub request_from: String,
    pub envelope_from: String,
    #[serde(default)]
    pub envelope_to: Vec<String>,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub references: Vec<String>,
    #[serde(default)]
    pub in_reply_to: Vec<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub html: String,
    #[serde(default)]
    pub attachments: Vec<Value>,
    #[serde(default)]
    pub timestamp: String,
}

/// A request in the form the matching engine operates on.
///
/// Untagged: the variants are distinguished by their required fields
/// (`method` for HTTP, `envelopeFrom` for SMTP, `data` for TCP).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NeutralRequest {
    Http(HttpRequest),
    Smtp(SmtpRequest),
    Tcp(TcpRequest),
}

impl NeutralRequest {
    /// The request as a JSON object, the view predicates and scripts see.
    pub fn fields(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn request_from(&self) -> &str {
        match self {
            NeutralRequest::Http(r) => &r.request_from,
            NeutralRequest::Tcp(r) => &r.request_from,
            NeutralRequest::Smtp(r) => &r.request_from,
        }
    }

    /// The client IP without the port suffix.
    pub fn ip(&self) -> &str {
        let from = self.request_from();
        from.rsplit_once(':').map(|(ip, _)| ip).unwrap_or(from)
    }
}
