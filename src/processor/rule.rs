//! Rule definitions.

use crate::error::{EngineError, EngineResult, StoreError};
use crate::planner::Rule;
use crate::store::{FileKvStore, KeyValueStore};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Creates, lists, describes and drops rule definitions.
///
/// The submitted JSON is stored as given, keyed by rule id; the id inside the JSON is
/// ignored in favour of the id the rule was created under.
pub struct RuleProcessor {
  store: Arc<dyn KeyValueStore>,
}

impl RuleProcessor {
  /// Uses `store` for definitions.
  pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
    Self { store }
  }

  /// Opens the `rule` store under `data_dir`.
  pub fn open(data_dir: impl AsRef<Path>) -> EngineResult<Self> {
    let store = FileKvStore::open_at(data_dir, "rule")?;
    Ok(Self::new(Arc::new(store)))
  }

  /// Validates and stores a rule.
  ///
  /// # Errors
  ///
  /// `Missing rule id.`, `Missing rule SQL.` or `Missing rule actions.` for incomplete
  /// rules, a parse error for malformed JSON, or a store error if the id is taken.
  pub fn create_rule(&self, id: &str, json: &str) -> EngineResult<Rule> {
    let rule = parse_rule(id, json)?;
    let raw: serde_json::Value = serde_json::from_str(json).map_err(StoreError::from)?;
    self.store.set(id, raw)?;
    info!(rule = %id, "rule created");
    Ok(rule)
  }

  /// Loads a rule.
  pub fn get_rule(&self, id: &str) -> EngineResult<Rule> {
    let raw = self.store.get(id)?.ok_or_else(|| not_found(id))?;
    parse_rule(id, &raw.to_string())
  }

  /// The stored JSON, pretty printed.
  pub fn describe_rule(&self, id: &str) -> EngineResult<String> {
    let raw = self.store.get(id)?.ok_or_else(|| not_found(id))?;
    let pretty = serde_json::to_string_pretty(&raw).map_err(StoreError::from)?;
    Ok(format!("{}\n", pretty))
  }

  /// Ids of all rules, or a single notice line when there are none.
  pub fn show_rules(&self) -> EngineResult<Vec<String>> {
    let keys = self.store.keys()?;
    if keys.is_empty() {
      return Ok(vec!["No rule definitions are found.".to_string()]);
    }
    Ok(keys)
  }

  /// Removes a rule definition. Does not stop a running rule.
  pub fn drop_rule(&self, id: &str) -> EngineResult<String> {
    self.store.delete(id).map_err(|e| match e {
      StoreError::NotFound(_) => not_found(id),
      other => other.into(),
    })?;
    info!(rule = %id, "rule dropped");
    Ok(format!("Rule {} is dropped.", id))
  }
}

fn not_found(id: &str) -> EngineError {
  EngineError::NotFound {
    kind: "Rule",
    name: id.to_string(),
  }
}

/// Parses and validates rule JSON.
pub fn parse_rule(id: &str, json: &str) -> EngineResult<Rule> {
  let mut rule: Rule = serde_json::from_str(json).map_err(|e| {
    EngineError::validation(format!("Parse rule {} error : {}.", json, e))
  })?;
  rule.id = id.to_string();
  if id.trim().is_empty() {
    return Err(EngineError::validation("Missing rule id."));
  }
  if rule.sql.trim().is_empty() {
    return Err(EngineError::validation("Missing rule SQL."));
  }
  if rule.actions.is_empty() {
    return Err(EngineError::validation("Missing rule actions."));
  }
  Ok(rule)
}
