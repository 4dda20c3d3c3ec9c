//! Tagged scalar values and branch condition evaluation.
//!
//! Task results are arbitrary JSON. Branch nodes only ever look at a single
//! field of a result, so the field is lowered into a [`Scalar`] with explicit
//! coercion rules: equality compares the canonical string forms, ordering
//! requires both sides to parse as numbers.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors raised while evaluating a branch condition.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConditionError {
    /// The source result has no such field. Missing fields are an error,
    /// not a false comparison.
    #[error("field not found: {0}")]
    FieldNotFound(String),

    #[error("operator {0} requires numbers")]
    NotNumeric(Operator),

    #[error("source task result is not an object")]
    NotAnObject,
}

/// A single value pulled out of a task result.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    /// Arrays and objects, kept in compact JSON form.
    Composite(String),
}

impl Scalar {
    /// Lower a JSON value into a scalar.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Scalar::Null,
            Value::Bool(b) => Scalar::Bool(*b),
            Value::Number(n) => Scalar::Number(n.as_f64().unwrap_or(f64::NAN)),
            Value::String(s) => Scalar::String(s.clone()),
            other => Scalar::Composite(other.to_string()),
        }
    }

    /// Canonical string form used for equality comparisons.
    pub fn to_compare_string(&self) -> String {
        match self {
            Scalar::Null => "null".to_string(),
            Scalar::Bool(b) => b.to_string(),
            Scalar::Number(n) => format_number(*n),
            Scalar::String(s) => s.clone(),
            Scalar::Composite(s) => s.clone(),
        }
    }

    /// Numeric view of the value, parsing strings when needed.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Scalar::Number(n) if n.is_finite() => Some(*n),
            Scalar::String(s) => parse_number(s),
            _ => None,
        }
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

/// Strict parse: surrounding whitespace makes a string non-numeric.
fn parse_number(s: &str) -> Option<f64> {
    s.parse::<f64>().ok().filter(|n| n.is_finite())
}

/// Comparison operator of a branch condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
}

impl std::fmt::Display for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Operator::Eq => "==",
            Operator::Ne => "!=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::Lt => "<",
            Operator::Le => "<=",
        };
        write!(f, "{}", s)
    }
}

/// Condition attached to a branch node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchCondition {
    /// Node id whose task result is inspected.
    pub source_task: String,
    /// Field of the result; dotted paths reach into nested objects.
    pub field: String,
    pub operator: Operator,
    /// Right-hand side, always given as a string.
    pub value: String,
}

impl BranchCondition {
    pub fn new(source_task: &str, field: &str, operator: Operator, value: &str) -> Self {
        Self {
            source_task: source_task.to_string(),
            field: field.to_string(),
            operator,
            value: value.to_string(),
        }
    }

    /// Evaluate the condition against a task result.
    pub fn evaluate(&self, result: &Value) -> Result<bool, ConditionError> {
        let left = Scalar::from_json(lookup_field(result, &self.field)?);
        compare(&left, self.operator, &self.value)
    }
}

fn lookup_field<'a>(result: &'a Value, field: &str) -> Result<&'a Value, ConditionError> {
    let object = result.as_object().ok_or(ConditionError::NotAnObject)?;
    if let Some(v) = object.get(field) {
        return Ok(v);
    }
    let mut current = result;
    for part in field.split('.') {
        current = current
            .as_object()
            .and_then(|o| o.get(part))
            .ok_or_else(|| ConditionError::FieldNotFound(field.to_string()))?;
    }
    Ok(current)
}

/// Compare a scalar with a string right-hand side.
pub fn compare(left: &Scalar, op: Operator, right: &str) -> Result<bool, ConditionError> {
    match op {
        Operator::Eq => Ok(left.to_compare_string() == right),
        Operator::Ne => Ok(left.to_compare_string() != right),
        Operator::Gt | Operator::Ge | Operator::Lt | Operator::Le => {
            let (l, r) = match (left.as_number(), parse_number(right)) {
                (Some(l), Some(r)) => (l, r),
                _ => return Err(ConditionError::NotNumeric(op)),
            };
            Ok(match op {
                Operator::Gt => l > r,
                Operator::Ge => l >= r,
                Operator::Lt => l < r,
                _ => l <= r,
            })
        }
    }
}
