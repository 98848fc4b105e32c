//! Extraction methods for copy/lookup behaviors: regex, JSONPath, XPath.

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Method for extracting values from a request field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum ExtractionMethod {
    /// Regular expression; group 1 if present, else the whole match.
    Regex { selector: String },
    /// JSONPath expression (RFC 9535).
    #[serde(rename = "jsonpath")]
    JsonPath { selector: String },
    /// XPath expression for XML bodies.
    #[serde(rename = "xpath")]
    XPath { selector: String },
}

impl ExtractionMethod {
    /// All matches in document order. Copy behaviors iterate through these
    /// on successive requests; lookup uses the first.
    pub fn extract_all(&self, value: &str) -> Vec<String> {
        match self {
            ExtractionMethod::Regex { selector } => {
                let Ok(re) = Regex::new(selector) else {
                    return Vec::new();
                };
                re.captures_iter(value)
                    .filter_map(|caps| {
                        caps.get(1)
                            .or_else(|| caps.get(0))
                            .map(|m| m.as_str().to_string())
                    })
                    .collect()
            }
            ExtractionMethod::JsonPath { selector } => extract_jsonpath_all(value, selector),
            ExtractionMethod::XPath { selector } => extract_xpath_all(value, selector),
        }
    }

    pub fn extract_first(&self, value: &str) -> Option<String> {
        self.extract_all(value).into_iter().next()
    }
}

fn json_leaf_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Evaluate a JSONPath selector against a JSON document, returning every
/// matched node rendered as text.
pub fn extract_jsonpath_all(json_str: &str, selector: &str) -> Vec<String> {
    let Ok(json) = serde_json::from_str::<serde_json::Value>(json_str) else {
        return Vec::new();
    };
    let Ok(path) = serde_json_path::JsonPath::parse(selector) else {
        return Vec::new();
    };
    path.query(&json)
        .all()
        .into_iter()
        .map(json_leaf_to_string)
        .collect()
}

/// Evaluate an XPath selector against an XML document.
pub fn extract_xpath_all(xml_str: &str, selector: &str) -> Vec<String> {
    use sxd_document::parser;
    use sxd_xpath::{evaluate_xpath, Value};

    let Ok(package) = parser::parse(xml_str) else {
        return Vec::new();
    };
    let document = package.as_document();

    match evaluate_xpath(&document, selector) {
        Ok(Value::String(s)) => vec![s],
        Ok(Value::Number(n)) => vec![n.to_string()],
        Ok(Value::Boolean(b)) => vec![b.to_string()],
        Ok(Value::Nodeset(nodes)) => nodes.document_order().iter().map(|n| n.string_value()).collect(),
        Err(_) => Vec::new(),
    }
}
