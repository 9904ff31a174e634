//! Declarative if-part conditions.
//!
//! An if-part is evaluated against the variable scope of the node that owns
//! the sentry. Lookups resolve through the scope hierarchy, so the closure
//! passed to [`Condition::evaluate`] is expected to walk ancestors.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Boolean condition over case variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    Literal { value: bool },
    Exists { variable: String },
    Equals { variable: String, value: Value },
    GreaterThan { variable: String, value: f64 },
    LessThan { variable: String, value: f64 },
    Not { condition: Box<Condition> },
    All { conditions: Vec<Condition> },
    Any { conditions: Vec<Condition> },
}

impl Condition {
    /// Evaluate against a variable lookup. Missing variables make
    /// comparisons false rather than erroring.
    pub fn evaluate<F>(&self, lookup: &F) -> bool
    where
        F: Fn(&str) -> Option<Value>,
    {
        match self {
            Condition::Literal { value } => *value,
            Condition::Exists { variable } => lookup(variable).is_some(),
            Condition::Equals { variable, value } => {
                lookup(variable).as_ref() == Some(value)
            }
            Condition::GreaterThan { variable, value } => lookup(variable)
                .and_then(|v| v.as_f64())
                .is_some_and(|v| v > *value),
            Condition::LessThan { variable, value } => lookup(variable)
                .and_then(|v| v.as_f64())
                .is_some_and(|v| v < *value),
            Condition::Not { condition } => !condition.evaluate(lookup),
            Condition::All { conditions } => conditions.iter().all(|c| c.evaluate(lookup)),
            Condition::Any { conditions } => conditions.iter().any(|c| c.evaluate(lookup)),
        }
    }

    /// Names of every variable this condition reads.
    pub fn variables(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_variables(&mut out);
        out
    }

    fn collect_variables<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Condition::Literal { .. } => {}
            Condition::Exists { variable }
            | Condition::Equals { variable, .. }
            | Condition::GreaterThan { variable, .. }
            | Condition::LessThan { variable, .. } => out.push(variable.as_str()),
            Condition::Not { condition } => condition.collect_variables(out),
            Condition::All { conditions } | Condition::Any { conditions } => {
                for c in conditions {
                    c.collect_variables(out);
                }
            }
        }
    }
}
