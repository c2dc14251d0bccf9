//! Label selectors for filtering manifest documents.
//!
//! Supports the standard label-expression forms: `k=v`, `k==v`, `k!=v`,
//! `k in (a,b)`, `k notin (a,b)`, `k` (exists), `!k` (not exists), joined by
//! top-level commas. A selector is evaluated against a document's
//! `metadata.labels` mapping.

use std::collections::BTreeMap;

use serde_yaml::Value;
use thiserror::Error;

/// Errors produced while parsing a selector expression.
#[derive(Debug, Error, PartialEq)]
pub enum SelectorError {
  #[error("empty requirement in selector")]
  EmptyRequirement,

  #[error("invalid requirement {0:?}")]
  InvalidRequirement(String),

  #[error("unterminated value set in {0:?}")]
  UnterminatedSet(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Requirement {
  Eq(String, String),
  NotEq(String, String),
  In(String, Vec<String>),
  NotIn(String, Vec<String>),
  Exists(String),
  NotExists(String),
}

impl Requirement {
  fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
    match self {
      Requirement::Eq(key, value) => labels.get(key) == Some(value),
      // Absent keys satisfy inequality and notin, per the standard semantics.
      Requirement::NotEq(key, value) => labels.get(key) != Some(value),
      Requirement::In(key, values) => labels.get(key).is_some_and(|v| values.contains(v)),
      Requirement::NotIn(key, values) => !labels.get(key).is_some_and(|v| values.contains(v)),
      Requirement::Exists(key) => labels.contains_key(key),
      Requirement::NotExists(key) => !labels.contains_key(key),
    }
  }
}

/// A parsed label selector.
#[derive(Debug, Clone, PartialEq)]
pub struct Selector {
  requirements: Vec<Requirement>,
}

impl Selector {
  /// Parse a comma-joined label expression.
  ///
  /// An empty input parses to a selector that matches everything.
  pub fn parse(input: &str) -> Result<Self, SelectorError> {
    let mut requirements = Vec::new();
    if !input.trim().is_empty() {
      for part in split_requirements(input)? {
        requirements.push(parse_requirement(part.trim())?);
      }
    }
    Ok(Self { requirements })
  }

  /// Does every requirement hold against `labels`?
  pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
    self.requirements.iter().all(|req| req.matches(labels))
  }

  /// Evaluate the selector against a document's top-level `metadata.labels`.
  pub fn matches_document(&self, doc: &Value) -> bool {
    self.matches(&document_labels(doc))
  }
}

/// Extract the string-valued entries of a document's `metadata.labels`.
pub fn document_labels(doc: &Value) -> BTreeMap<String, String> {
  let mut labels = BTreeMap::new();
  if let Some(map) = doc
    .get("metadata")
    .and_then(|metadata| metadata.get("labels"))
    .and_then(Value::as_mapping)
  {
    for (key, value) in map {
      if let (Some(key), Some(value)) = (key.as_str(), value.as_str()) {
        labels.insert(key.to_string(), value.to_string());
      }
    }
  }
  labels
}

/// Split on top-level commas; commas inside a value set do not separate
/// requirements.
fn split_requirements(input: &str) -> Result<Vec<&str>, SelectorError> {
  let mut parts = Vec::new();
  let mut depth = 0usize;
  let mut start = 0usize;

  for (offset, ch) in input.char_indices() {
    match ch {
      '(' => depth += 1,
      ')' => depth = depth.checked_sub(1).ok_or_else(|| SelectorError::UnterminatedSet(input.to_string()))?,
      ',' if depth == 0 => {
        parts.push(&input[start..offset]);
        start = offset + 1;
      }
      _ => {}
    }
  }
  if depth != 0 {
    return Err(SelectorError::UnterminatedSet(input.to_string()));
  }
  parts.push(&input[start..]);
  Ok(parts)
}

fn parse_requirement(part: &str) -> Result<Requirement, SelectorError> {
  if part.is_empty() {
    return Err(SelectorError::EmptyRequirement);
  }

  if let Some(key) = part.strip_prefix('!') {
    let key = valid_key(key.trim(), part)?;
    return Ok(Requirement::NotExists(key));
  }

  if let Some(offset) = part.find("!=") {
    let key = valid_key(part[..offset].trim(), part)?;
    return Ok(Requirement::NotEq(key, part[offset + 2..].trim().to_string()));
  }

  if let Some(offset) = part.find('=') {
    let key = valid_key(part[..offset].trim(), part)?;
    let value = part[offset..].trim_start_matches('=').trim();
    return Ok(Requirement::Eq(key, value.to_string()));
  }

  if let Some((key, values)) = parse_set_requirement(part, "notin")? {
    return Ok(Requirement::NotIn(key, values));
  }
  if let Some((key, values)) = parse_set_requirement(part, "in")? {
    return Ok(Requirement::In(key, values));
  }

  let key = valid_key(part, part)?;
  Ok(Requirement::Exists(key))
}

/// Parse `key <op> (v1, v2, …)` for the given set operator, if present.
fn parse_set_requirement(part: &str, op: &str) -> Result<Option<(String, Vec<String>)>, SelectorError> {
  let Some(key_end) = part.find(char::is_whitespace) else {
    return Ok(None);
  };
  let rest = part[key_end..].trim_start();
  let Some(rest) = rest.strip_prefix(op) else {
    return Ok(None);
  };
  if !rest.starts_with(char::is_whitespace) && !rest.starts_with('(') {
    return Ok(None);
  }

  let key = valid_key(part[..key_end].trim(), part)?;
  let set = rest.trim_start();
  let inner = set
    .strip_prefix('(')
    .and_then(|s| s.strip_suffix(')'))
    .ok_or_else(|| SelectorError::UnterminatedSet(part.to_string()))?;

  let values: Vec<String> = inner
    .split(',')
    .map(|value| value.trim().to_string())
    .filter(|value| !value.is_empty())
    .collect();
  if values.is_empty() {
    return Err(SelectorError::InvalidRequirement(part.to_string()));
  }
  Ok(Some((key, values)))
}

fn valid_key(key: &str, part: &str) -> Result<String, SelectorError> {
  if key.is_empty() || key.contains(|ch: char| ch.is_whitespace() || "()!=,".contains(ch)) {
    return Err(SelectorError::InvalidRequirement(part.to_string()));
  }
  Ok(key.to_string())
}
