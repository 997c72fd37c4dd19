//! Pod and container selection for PodSettings.

use std::collections::{BTreeMap, HashSet};

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use regex::Regex;
use serde_json::Value;
use serde_json_path::JsonPath;
use thiserror::Error;
use tracing::debug;

use crate::crd::ContainerSelector;

/// Whether one `matchExpressions` entry holds for `labels`.
/// Unknown operators never match.
pub fn expression_matches(expr: &LabelSelectorRequirement, labels: &BTreeMap<String, String>) -> bool {
    let value = labels.get(&expr.key);
    let values = expr.values.as_deref().unwrap_or_default();
    match expr.operator.as_str() {
        "Exists" => value.is_some(),
        "NotExists" | "DoesNotExist" => value.is_none(),
        "In" => value.is_some_and(|v| values.contains(v)),
        "NotIn" => value.is_none_or(|v| !values.contains(v)),
        other => {
            debug!(key = %expr.key, operator = %other, "Unsupported selector operator");
            false
        }
    }
}

/// Whether `selector` selects a pod with `labels`.
///
/// A pod without labels, or a selector with neither `matchLabels` nor
/// `matchExpressions`, never matches. Otherwise every label must be present
/// and equal and every expression must hold.
pub fn selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    let match_labels = selector.match_labels.as_ref().filter(|m| !m.is_empty());
    let expressions = selector.match_expressions.as_ref().filter(|e| !e.is_empty());

    if labels.is_empty() || (match_labels.is_none() && expressions.is_none()) {
        return false;
    }
    let labels_ok = match_labels
        .into_iter()
        .flatten()
        .all(|(k, v)| labels.get(k) == Some(v));
    labels_ok
        && expressions
            .into_iter()
            .flatten()
            .all(|e| expression_matches(e, labels))
}

#[derive(Debug, Error)]
pub enum SelectorError {
    #[error("invalid regex: {0}")]
    Regex(#[from] regex::Error),

    #[error("invalid jsonpath: {0}")]
    JsonPath(#[from] serde_json_path::ParseError),

    #[error("cannot serialize pod: {0}")]
    Pod(#[from] serde_json::Error),
}

/// Compiled container name filter.
#[derive(Clone, Debug)]
pub enum ContainerMatcher {
    Nothing,
    Pattern(Regex),
    /// Names produced by a JSONPath query over the pod.
    Names(HashSet<String>),
}

impl ContainerMatcher {
    /// `*` selects everything; other patterns match at the start of the
    /// name. A `jsonpath` is only consulted without a `regex`, and selects
    /// the containers named by its string results. Neither selects nothing.
    pub fn new(selector: &ContainerSelector, pod: &Pod) -> Result<Self, SelectorError> {
        if let Some(pattern) = selector.regex.as_deref() {
            let regex = match pattern {
                "*" => Regex::new("^.*")?,
                pattern => Regex::new(&format!("^(?:{pattern})"))?,
            };
            return Ok(Self::Pattern(regex));
        }
        let Some(path) = selector.jsonpath.as_deref() else {
            return Ok(Self::Nothing);
        };
        let path = JsonPath::parse(path)?;
        let pod = serde_json::to_value(pod)?;
        let names = path
            .query(&pod)
            .all()
            .into_iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();
        Ok(Self::Names(names))
    }

    pub fn matches(&self, name: &str) -> bool {
        match self {
            Self::Nothing => false,
            Self::Pattern(regex) => regex.is_match(name),
            Self::Names(names) => names.contains(name),
        }
    }
}
