use crate::types::{is_truthy, DataBag};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Declarative predicate over data bag keys
///
/// Used for static branch guards, pause predicates and signal payload
/// matching. Being plain data, a condition survives serialization of a paused
/// flow instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    /// Always true
    Always,
    /// Always false
    Never,
    /// The key resolves to a value
    Exists {
        /// Key or dotted path
        key: String,
    },
    /// The key does not resolve to a value
    Missing {
        /// Key or dotted path
        key: String,
    },
    /// The key resolves to a truthy value
    Truthy {
        /// Key or dotted path
        key: String,
    },
    /// The key resolves to exactly `value`
    Equals {
        /// Key or dotted path
        key: String,
        /// Expected value
        value: Value,
    },
    /// The key resolves to one of `values`
    OneOf {
        /// Key or dotted path
        key: String,
        /// Accepted values
        values: Vec<Value>,
    },
    /// The key resolves to a number strictly greater than `value`
    GreaterThan {
        /// Key or dotted path
        key: String,
        /// Threshold
        value: f64,
    },
    /// The key resolves to a number strictly less than `value`
    LessThan {
        /// Key or dotted path
        key: String,
        /// Threshold
        value: f64,
    },
    /// Every nested condition holds
    All {
        /// Nested conditions
        conditions: Vec<Condition>,
    },
    /// At least one nested condition holds
    Any {
        /// Nested conditions
        conditions: Vec<Condition>,
    },
    /// The nested condition does not hold
    Not {
        /// Nested condition
        condition: Box<Condition>,
    },
}

impl Condition {
    /// `key` resolves to a value
    pub fn exists(key: impl Into<String>) -> Self {
        Condition::Exists { key: key.into() }
    }

    /// `key` is absent
    pub fn missing(key: impl Into<String>) -> Self {
        Condition::Missing { key: key.into() }
    }

    /// `key` is truthy
    pub fn truthy(key: impl Into<String>) -> Self {
        Condition::Truthy { key: key.into() }
    }

    /// `key` equals `value`
    pub fn equals(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Condition::Equals {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Conjunction
    pub fn all(conditions: Vec<Condition>) -> Self {
        Condition::All { conditions }
    }

    /// Disjunction
    pub fn any(conditions: Vec<Condition>) -> Self {
        Condition::Any { conditions }
    }

    /// Negation
    pub fn not(condition: Condition) -> Self {
        Condition::Not {
            condition: Box::new(condition),
        }
    }

    /// Evaluate against a data bag
    pub fn evaluate(&self, data: &DataBag) -> bool {
        match self {
            Condition::Always => true,
            Condition::Never => false,
            Condition::Exists { key } => data.contains(key),
            Condition::Missing { key } => !data.contains(key),
            Condition::Truthy { key } => data.lookup(key).map(is_truthy).unwrap_or(false),
            Condition::Equals { key, value } => data.lookup(key) == Some(value),
            Condition::OneOf { key, values } => data
                .lookup(key)
                .map(|actual| values.contains(actual))
                .unwrap_or(false),
            Condition::GreaterThan { key, value } => data
                .lookup(key)
                .and_then(Value::as_f64)
                .map(|actual| actual > *value)
                .unwrap_or(false),
            Condition::LessThan { key, value } => data
                .lookup(key)
                .and_then(Value::as_f64)
                .map(|actual| actual < *value)
                .unwrap_or(false),
            Condition::All { conditions } => conditions.iter().all(|c| c.evaluate(data)),
            Condition::Any { conditions } => conditions.iter().any(|c| c.evaluate(data)),
            Condition::Not { condition } => !condition.evaluate(data),
        }
    }

    /// Data bag keys this condition reads
    pub fn keys(&self) -> Vec<&str> {
        match self {
            Condition::Always | Condition::Never => Vec::new(),
            Condition::Exists { key }
            | Condition::Missing { key }
            | Condition::Truthy { key }
            | Condition::Equals { key, .. }
            | Condition::OneOf { key, .. }
            | Condition::GreaterThan { key, .. }
            | Condition::LessThan { key, .. } => vec![key.as_str()],
            Condition::All { conditions } | Condition::Any { conditions } => {
                conditions.iter().flat_map(Condition::keys).collect()
            }
            Condition::Not { condition } => condition.keys(),
        }
    }
}
