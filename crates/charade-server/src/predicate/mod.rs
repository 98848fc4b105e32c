//! Predicate expression trees and their evaluation against a request.

mod eval;

pub use eval::{predicate_matches, predicates_match, InjectFn};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A predicate: one operator plus the comparison options that scope it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Predicate {
    #[serde(flatten)]
    pub operator: PredicateOperator,
    /// String comparisons fold case unless set. Applies to values and to
    /// map-key lookup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case_sensitive: Option<bool>,
    /// Regex stripped from the actual value before comparison.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub except: Option<String>,
    /// Pre-extract the body through a JSONPath selector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonpath: Option<SelectorSpec>,
    /// Pre-extract the body through an XPath selector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xpath: Option<SelectorSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorSpec {
    pub selector: String,
}

/// The operator variants. Leaf operators hold a `field -> expected` map; a
/// predicate is true iff every field pair matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PredicateOperator {
    Equals(Map<String, Value>),
    DeepEquals(Map<String, Value>),
    Contains(Map<String, Value>),
    StartsWith(Map<String, Value>),
    EndsWith(Map<String, Value>),
    Matches(Map<String, Value>),
    Exists(Map<String, Value>),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
    /// Script predicate: truthy return decides the match.
    Inject(String),
}

impl Predicate {
    /// Convenience constructor for generated predicates (proxy recording).
    pub fn equals(fields: Map<String, Value>, case_sensitive: bool) -> Self {
        Predicate {
            operator: PredicateOperator::Equals(fields),
            case_sensitive: Some(case_sensitive),
            except: None,
            jsonpath: None,
            xpath: None,
        }
    }
}
