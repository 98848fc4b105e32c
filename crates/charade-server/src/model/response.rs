//! Response templates and the resolved response produced by the engine.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Body handling mode for a response.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResponseMode {
    /// Body is UTF-8 text (default)
    #[default]
    Text,
    /// Body/data is base64-encoded binary
    Binary,
}

/// A status code as configured: a number, or a string that may carry a
/// substitution token resolved by the copy/lookup behaviors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum StatusField {
    Code(u16),
    Text(String),
}

impl StatusField {
    pub fn as_code(&self) -> u16 {
        match self {
            StatusField::Code(code) => *code,
            StatusField::Text(text) => text.trim().parse().unwrap_or(200),
        }
    }
}

impl Default for StatusField {
    fn default() -> Self {
        StatusField::Code(200)
    }
}

/// Literal response template (the `is` variant of a stub response).
/// Every field is optional so that [`IsResponse::merge_with_default`] can
/// tell configured fields from absent ones.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IsResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<StatusField>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    /// Raw payload for TCP imposters (base64 in binary mode).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(rename = "_mode", skip_serializing_if = "Option::is_none")]
    pub mode: Option<ResponseMode>,
}

impl IsResponse {
    /// Copy fields from `default` that this response leaves unset.
    pub fn merge_with_default(&mut self, default: &IsResponse) {
        if self.status_code.is_none() {
            self.status_code = default.status_code.clone();
        }
        if self.headers.is_empty() {
            self.headers = default.headers.clone();
        }
        if self.body.is_none() {
            self.body = default.body.clone();
        }
        if self.data.is_none() {
            self.data = default.data.clone();
        }
        if self.mode.is_none() {
            self.mode = default.mode;
        }
    }
}

/// The concrete response the engine hands back to a protocol server after
/// selection and behavior processing.
#[derive(Debug, Clone, Default)]
pub struct ResolvedResponse {
    pub status: StatusField,
    pub headers: HashMap<String, Value>,
    pub body: Option<Value>,
    pub data: Option<String>,
    pub mode: ResponseMode,
}

impl ResolvedResponse {
    pub fn status_code(&self) -> u16 {
        self.status.as_code()
    }

    /// The body rendered as text: strings verbatim, anything else as JSON.
    pub fn body_text(&self) -> String {
        match &self.body {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        }
    }
}

impl From<IsResponse> for ResolvedResponse {
    fn from(is: IsResponse) -> Self {
        ResolvedResponse {
            status: is.status_code.unwrap_or_default(),
            headers: is.headers,
            body: is.body,
            data: is.data,
            mode: is.mode.unwrap_or_default(),
        }
    }
}
