//! Field query expressions
//!
//! Expressions are `&&`-separated `field=value` terms. A value may list
//! alternatives separated by commas and may contain `*` wildcards, e.g.
//! `cmssw_release=CMSSW_14_0_*&&status=new,approved`. Dotted fields address
//! nested values; a term matches an array when any element matches.

use crate::error::{RelvalError, Result};
use regex::Regex;
use serde_json::Value;
use std::cmp::Ordering;

#[derive(Debug, Clone)]
pub struct QueryExpression {
    terms: Vec<QueryTerm>,
}

#[derive(Debug, Clone)]
struct QueryTerm {
    path: Vec<String>,
    alternatives: Vec<Matcher>,
}

#[derive(Debug, Clone)]
enum Matcher {
    Exact(String),
    Glob(Regex),
}

impl Matcher {
    fn parse(value: &str) -> Result<Self> {
        if !value.contains('*') {
            return Ok(Matcher::Exact(value.to_string()));
        }
        Ok(Matcher::Glob(glob_to_regex(value)?))
    }

    fn matches(&self, candidate: &str) -> bool {
        match self {
            Matcher::Exact(expected) => expected == candidate,
            Matcher::Glob(regex) => regex.is_match(candidate),
        }
    }
}

/// Anchored regex for a `*` glob, every other character literal
pub fn glob_to_regex(glob: &str) -> Result<Regex> {
    let escaped: Vec<String> = glob.split('*').map(regex::escape).collect();
    Regex::new(&format!("^{}$", escaped.join(".*")))
        .map_err(|e| RelvalError::Validation(format!("Invalid pattern {glob}: {e}")))
}

impl QueryExpression {
    pub fn parse(expression: &str) -> Result<Self> {
        let mut terms = Vec::new();
        for raw_term in expression.split("&&").map(str::trim).filter(|t| !t.is_empty()) {
            let (field, values) = raw_term.split_once('=').ok_or_else(|| {
                RelvalError::Validation(format!("Invalid query term '{raw_term}', expected field=value"))
            })?;
            let field = field.trim();
            if field.is_empty() {
                return Err(RelvalError::Validation(format!(
                    "Invalid query term '{raw_term}', field name is empty"
                )));
            }
            let alternatives = values
                .split(',')
                .map(|v| Matcher::parse(v.trim()))
                .collect::<Result<Vec<_>>>()?;
            terms.push(QueryTerm {
                path: field.split('.').map(str::to_string).collect(),
                alternatives,
            });
        }
        Ok(Self { terms })
    }

    /// Whether every term matches the serialized document
    pub fn matches(&self, document: &Value) -> bool {
        self.terms.iter().all(|term| term.matches(document))
    }
}

impl QueryTerm {
    fn matches(&self, document: &Value) -> bool {
        self.matches_path(document, &self.path)
    }

    fn matches_path(&self, current: &Value, path: &[String]) -> bool {
        let Some((segment, rest)) = path.split_first() else {
            return self.matches_value(current);
        };
        match current {
            Value::Array(items) => items.iter().any(|item| self.matches_path(item, path)),
            other => other
                .get(segment)
                .is_some_and(|next| self.matches_path(next, rest)),
        }
    }

    fn matches_value(&self, value: &Value) -> bool {
        match value {
            Value::Array(items) => items.iter().any(|item| self.matches_value(item)),
            other => {
                let text = value_as_text(other);
                self.alternatives.iter().any(|m| m.matches(&text))
            }
        }
    }
}

fn value_as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Sort order for query results
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortOrder {
    pub field: String,
    pub ascending: bool,
}

impl SortOrder {
    pub fn ascending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            ascending: true,
        }
    }

    pub fn descending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            ascending: false,
        }
    }

    pub fn compare(&self, left: &Value, right: &Value) -> Ordering {
        let left = left.get(&self.field).unwrap_or(&Value::Null);
        let right = right.get(&self.field).unwrap_or(&Value::Null);
        let ordering = compare_values(left, right);
        if self.ascending {
            ordering
        } else {
            ordering.reverse()
        }
    }
}

fn compare_values(left: &Value, right: &Value) -> Ordering {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .unwrap_or_default()
            .partial_cmp(&b.as_f64().unwrap_or_default())
            .unwrap_or(Ordering::Equal),
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        (a, b) => value_as_text(a).cmp(&value_as_text(b)),
    }
}

/// Trailing `-NNNNN` serial of an identity
pub fn serial_of(prepid: &str) -> Option<u32> {
    let (_, serial) = prepid.rsplit_once('-')?;
    if serial.is_empty() || !serial.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    serial.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_exact_and_alternative_terms() {
        let doc = json!({"status": "approved", "batch_name": "fullsim"});
        assert!(QueryExpression::parse("status=new,approved").unwrap().matches(&doc));
        assert!(!QueryExpression::parse("status=new&&batch_name=fullsim")
            .unwrap()
            .matches(&doc));
    }

    #[test]
    fn test_glob_terms_are_anchored() {
        let doc = json!({"prepid": "CMSSW_14_0_0__fullsim-ZMM-00003"});
        assert!(QueryExpression::parse("prepid=CMSSW_14_0_0__fullsim-ZMM-*")
            .unwrap()
            .matches(&doc));
        assert!(!QueryExpression::parse("prepid=fullsim-*").unwrap().matches(&doc));
    }

    #[test]
    fn test_arrays_match_any_element() {
        let doc = json!({"created_relvals": ["A-00001", "B-00002"], "workflows": [{"name": "wf_1"}]});
        assert!(QueryExpression::parse("created_relvals=B-00002").unwrap().matches(&doc));
        assert!(QueryExpression::parse("workflows.name=wf_1").unwrap().matches(&doc));
    }

    #[test]
    fn test_numbers_compare_as_text() {
        let doc = json!({"campaign_timestamp": 1700000000});
        assert!(QueryExpression::parse("campaign_timestamp=1700000000")
            .unwrap()
            .matches(&doc));
    }

    #[test]
    fn test_invalid_term_rejected() {
        assert!(QueryExpression::parse("status").is_err());
        assert!(QueryExpression::parse("=new").is_err());
    }

    #[test]
    fn test_serial_parsing() {
        assert_eq!(serial_of("CMSSW_14_0_0__fullsim-ZMM-00042"), Some(42));
        assert_eq!(serial_of("CMSSW_14_0_0__fullsim-ZMM"), None);
    }

    #[test]
    fn test_sort_order_numeric() {
        let a = json!({"campaign_timestamp": 5});
        let b = json!({"campaign_timestamp": 40});
        assert_eq!(SortOrder::ascending("campaign_timestamp").compare(&a, &b), Ordering::Less);
        assert_eq!(SortOrder::descending("campaign_timestamp").compare(&a, &b), Ordering::Greater);
    }
}
