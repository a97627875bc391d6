//! Query classification and rule-based expansion

pub mod classifier;
pub mod expander;
pub mod rules;

pub use classifier::{CreativeQuery, QueryShape, classify};
pub use expander::{InferredEdge, expand};
pub use rules::{Rule, RuleLibrary, canonical_json, rule_key};
