//! Rule library: inferred-edge keys mapped to lookup query templates
//!
//! A rule file is a JSON object whose keys are canonical JSON strings of
//! `{predicate, qualifier_constraints?, mcq?}` and whose values are ordered
//! lists of `{..metadata, template}`. Keys written by other tools may use
//! different whitespace, so they are re-canonicalized on load.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::message::QualifierConstraint;

/// One expansion of an inferred edge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Message body with `$source`, `$target`, `$source_id` and `$target_id`
    /// placeholders
    pub template: Value,
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Default)]
pub struct RuleLibrary {
    rules: HashMap<String, Vec<Rule>>,
}

impl RuleLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a rule file body
    pub fn from_json_str(contents: &str) -> Result<Self> {
        let raw: HashMap<String, Vec<Rule>> = serde_json::from_str(contents)
            .map_err(|e| Error::RuleLibrary(format!("Failed to parse rule file: {}", e)))?;

        let mut library = Self::new();
        for (key, rules) in raw {
            library.insert(&key, rules)?;
        }
        Ok(library)
    }

    /// Load and merge several rule files, later files appending to earlier keys
    pub fn load_files<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut library = Self::new();
        for path in paths {
            let path = path.as_ref();
            let contents = std::fs::read_to_string(path).map_err(|e| {
                Error::RuleLibrary(format!("Failed to read {}: {}", path.display(), e))
            })?;
            let loaded = Self::from_json_str(&contents)?;
            debug!(path = %path.display(), keys = loaded.rules.len(), "Loaded rule file");
            library.merge(loaded);
        }
        info!(keys = library.rules.len(), rules = library.rule_count(), "Rule library ready");
        Ok(library)
    }

    /// Add rules under a key, canonicalizing the key first
    pub fn insert(&mut self, key: &str, rules: Vec<Rule>) -> Result<()> {
        let parsed: Value = serde_json::from_str(key)
            .map_err(|e| Error::RuleLibrary(format!("Rule key is not JSON ({}): {}", e, key)))?;
        let canonical = canonical_json(&parsed)?;
        self.rules.entry(canonical).or_default().extend(rules);
        Ok(())
    }

    pub fn merge(&mut self, other: RuleLibrary) {
        for (key, rules) in other.rules {
            self.rules.entry(key).or_default().extend(rules);
        }
    }

    /// Templates for a canonical key, in file order
    pub fn rules_for(&self, key: &str) -> &[Rule] {
        self.rules.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn rule_count(&self) -> usize {
        self.rules.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Canonical key of an inferred edge
pub fn rule_key(predicate: &str, qualifiers: &[QualifierConstraint], mcq: bool) -> Result<String> {
    let mut key = Map::new();
    key.insert("predicate".to_string(), json!(predicate));
    if !qualifiers.is_empty() {
        key.insert("qualifier_constraints".to_string(), serde_json::to_value(qualifiers)?);
    }
    if mcq {
        key.insert("mcq".to_string(), json!(true));
    }
    canonical_json(&Value::Object(key))
}

/// Compact JSON with object keys sorted at every level
pub fn canonical_json(value: &Value) -> Result<String> {
    Ok(serde_json::to_string(&sorted(value))?)
}

fn sorted(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for key in keys {
                out.insert(key.clone(), sorted(&map[key]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
        other => other.clone(),
    }
}

/// Replace `$name` and `${name}` placeholders in every string and object key.
///
/// `$$` is a literal dollar sign. An unknown placeholder is an error.
pub fn substitute(template: &Value, vars: &HashMap<&str, &str>) -> Result<Value> {
    Ok(match template {
        Value::String(s) => Value::String(substitute_str(s, vars)?),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| substitute(item, vars))
                .collect::<Result<_>>()?,
        ),
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, value) in map {
                out.insert(substitute_str(key, vars)?, substitute(value, vars)?);
            }
            Value::Object(out)
        }
        other => other.clone(),
    })
}

fn substitute_str(s: &str, vars: &HashMap<&str, &str>) -> Result<String> {
    if !s.contains('$') {
        return Ok(s.to_string());
    }

    let mut out = String::with_capacity(s.len());
    let mut chars = s.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let name = match chars.peek() {
            Some((_, '$')) => {
                chars.next();
                out.push('$');
                continue;
            }
            Some((_, '{')) => {
                chars.next();
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some((_, '}')) => break,
                        Some((_, ch)) => name.push(ch),
                        None => {
                            return Err(Error::RuleLibrary(format!(
                                "Unterminated placeholder in {}",
                                s
                            )));
                        }
                    }
                }
                name
            }
            Some((_, ch)) if ch.is_ascii_alphabetic() || *ch == '_' => {
                let mut name = String::new();
                while let Some((_, ch)) = chars.peek() {
                    if ch.is_ascii_alphanumeric() || *ch == '_' {
                        name.push(*ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                name
            }
            _ => {
                return Err(Error::RuleLibrary(format!("Invalid placeholder in {}", s)));
            }
        };
        let value = vars
            .get(name.as_str())
            .ok_or_else(|| Error::RuleLibrary(format!("Unknown placeholder ${}", name)))?;
        out.push_str(value);
    }
    Ok(out)
}
